use std::io;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;
use walkdir::WalkDir;

use crate::config::{Config, HttpConfig};
use crate::error::AppError;
use crate::reference::LogicalPrefix;
use crate::slugify;

static INVALID_PATH_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[:|<>*?"]"#).unwrap());

/// Shared state of the serving layer.
pub struct MediaState {
    pub root: PathBuf,
    pub prefix: LogicalPrefix,
    pub http: HttpConfig,
}

impl MediaState {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.upload_root.clone(),
            prefix: config.prefix.clone(),
            http: config.http.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub mod_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub count: usize,
    pub total_pages: usize,
    pub current_page: usize,
    pub has_next_page: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    page: Option<usize>,
    size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    path: Option<String>,
}

pub fn app(state: Arc<MediaState>) -> Router {
    let upload_limit = state.http.max_upload_bytes;
    let stream_route = format!("/stream{}/{{*name}}", state.prefix);
    let static_files = ServeDir::new(&state.root);
    let static_route = state.prefix.as_str().to_string();

    Router::new()
        .route("/list", get(list_root))
        .route("/list/{*dir}", get(list_dir))
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/delete", delete(delete_file))
        .route(&stream_route, get(stream_file))
        .nest_service(&static_route, static_files)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Turn a client supplied sub-path into a relative path below the root.
fn safe_relative(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim_matches(|c| c == ' ' || c == '/' || c == '\\');
    if INVALID_PATH_REGEX.is_match(trimmed) {
        return None;
    }
    let mut path = PathBuf::new();
    for segment in trimmed.split(['/', '\\']) {
        match segment {
            "" => {}
            "." | ".." => return None,
            s => path.push(s),
        }
    }
    Some(path)
}

async fn list_root(
    State(state): State<Arc<MediaState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<PaginatedResponse<FileEntry>>, AppError> {
    list_in(&state, "", &query).await
}

async fn list_dir(
    State(state): State<Arc<MediaState>>,
    Path(dir): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<PaginatedResponse<FileEntry>>, AppError> {
    list_in(&state, &dir, &query).await
}

async fn list_in(
    state: &MediaState,
    dir: &str,
    query: &ListQuery,
) -> Result<Json<PaginatedResponse<FileEntry>>, AppError> {
    const OP: &str = "list_files";

    let relative = safe_relative(dir).ok_or_else(|| AppError::bad_request(OP, "invalid path"))?;
    let root = state.root.clone();
    let base = root.join(relative);
    let prefix = state.prefix.clone();

    let entries = tokio::task::spawn_blocking(move || collect_entries(&root, &base, &prefix))
        .await
        .map_err(|err| AppError::internal(OP, err))?
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => AppError::not_found(OP, "directory not found"),
            _ => AppError::storage(OP, err),
        })?;

    let page = query.page.filter(|p| *p > 0).unwrap_or(state.http.default_page);
    let size = query
        .size
        .filter(|s| *s > 0)
        .unwrap_or(state.http.default_page_size);
    Ok(Json(paginate(entries, page, size)))
}

fn collect_entries(
    root: &FsPath,
    base: &FsPath,
    prefix: &LogicalPrefix,
) -> io::Result<Vec<FileEntry>> {
    if !base.is_dir() {
        return Err(io::ErrorKind::NotFound.into());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(base).follow_links(false).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(reference) = entry
            .path()
            .strip_prefix(root)
            .ok()
            .and_then(|rel| prefix.reference_for(rel))
        else {
            continue;
        };
        let mod_time = entry
            .metadata()?
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp())
            .unwrap_or(0);
        entries.push(FileEntry {
            path: reference.to_string(),
            mod_time,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn paginate<T>(items: Vec<T>, page: usize, size: usize) -> PaginatedResponse<T> {
    let count = items.len();
    let start = page.saturating_sub(1).saturating_mul(size).min(count);
    let end = start.saturating_add(size).min(count);
    let total_pages = count.div_ceil(size);

    PaginatedResponse {
        data: items.into_iter().skip(start).take(end - start).collect(),
        count,
        total_pages,
        current_page: page,
        has_next_page: page < total_pages,
    }
}

fn multipart_error(operation: &'static str, err: &MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::payload_too_large(operation)
    } else {
        AppError::bad_request(operation, "error parsing form")
    }
}

async fn upload_file(
    State(state): State<Arc<MediaState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    const OP: &str = "upload_file";

    let mut sub_path: Option<String> = None;
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(OP, &err))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("path") => {
                sub_path = Some(field.text().await.map_err(|err| multipart_error(OP, &err))?);
            }
            Some("file") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(|err| multipart_error(OP, &err))?;
                upload = Some((name, bytes));
            }
            _ => {}
        }
    }

    let (original_name, bytes) =
        upload.ok_or_else(|| AppError::bad_request(OP, "error retrieving file"))?;
    let relative_dir = safe_relative(sub_path.as_deref().unwrap_or_default())
        .ok_or_else(|| AppError::bad_request(OP, "invalid path"))?;

    let name = slugify::filename(&original_name);
    if name.is_empty() || name.starts_with('.') {
        return Err(AppError::bad_request(OP, "invalid filename"));
    }

    let dir = state.root.join(&relative_dir);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| AppError::storage(OP, err))?;

    let relative = relative_dir.join(&name);
    let reference = state
        .prefix
        .reference_for(&relative)
        .ok_or_else(|| AppError::bad_request(OP, "invalid filename"))?;

    let destination = dir.join(&name);
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&destination)
        .await
        .map_err(|err| match err.kind() {
            io::ErrorKind::AlreadyExists => AppError::conflict(OP, "file already exists"),
            _ => AppError::storage(OP, err),
        })?;
    file.write_all(&bytes)
        .await
        .map_err(|err| AppError::storage(OP, err).with_context("path", reference.as_str()))?;
    file.flush()
        .await
        .map_err(|err| AppError::storage(OP, err))?;

    info!(reference = %reference, size = bytes.len(), "File saved");
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            msg: reference.to_string(),
        }),
    ))
}

async fn delete_file(
    State(state): State<Arc<MediaState>>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, AppError> {
    const OP: &str = "delete_file";

    let raw = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::bad_request(OP, "path not provided"))?;
    let relative = state
        .prefix
        .admit(&raw)
        .and_then(|reference| state.prefix.relative_path(&reference))
        .ok_or_else(|| AppError::bad_request(OP, "invalid path"))?;

    match tokio::fs::remove_file(state.root.join(&relative)).await {
        Ok(()) => {
            info!(reference = %raw, "File deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(AppError::not_found(OP, "file not found"))
        }
        Err(err) => Err(AppError::storage(OP, err)),
    }
}

fn stream_content_type(name: &str) -> Option<&'static str> {
    let ext = FsPath::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        _ => None,
    }
}

async fn stream_file(
    State(state): State<Arc<MediaState>>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    const OP: &str = "stream_file";

    let relative = safe_relative(&name)
        .filter(|p| p.components().next().is_some())
        .ok_or_else(|| AppError::not_found(OP, "error retrieving file"))?;
    let path = state.root.join(&relative);

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| AppError::not_found(OP, "error retrieving file"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| AppError::storage(OP, err))?;
    if !metadata.is_file() {
        return Err(AppError::not_found(OP, "error retrieving file"));
    }
    let content_type =
        stream_content_type(&name).ok_or_else(|| AppError::unsupported_media_type(OP))?;

    info!(name = %name, "Streaming mediafile");
    let body = Body::from_stream(tokio_util::io::ReaderStream::with_capacity(
        file,
        state.http.stream_buffer_bytes,
    ));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .map_err(|err| AppError::internal(OP, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use std::fs;
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "XBOUNDARYX";

    fn state(root: &FsPath, max_upload_bytes: usize) -> Arc<MediaState> {
        Arc::new(MediaState {
            root: root.to_path_buf(),
            prefix: LogicalPrefix::new("/uploads").unwrap(),
            http: HttpConfig {
                addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                max_upload_bytes,
                stream_buffer_bytes: 4,
                default_page: 1,
                default_page_size: 10,
            },
        })
    }

    fn multipart_body(path: Option<&str>, filename: &str, content: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(path) = path {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"path\"\r\n\r\n{path}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn safe_relative_rejects_traversal_and_reserved_chars() {
        assert_eq!(safe_relative(" /avatars/2024/ "), Some(PathBuf::from("avatars/2024")));
        assert_eq!(safe_relative(""), Some(PathBuf::new()));
        assert!(safe_relative("../etc").is_none());
        assert!(safe_relative("a/./b").is_none());
        for bad in ["invalid:path", "invalid|path", "invalid<path", "invalid*path", "a?b", "a\"b"] {
            assert!(safe_relative(bad).is_none(), "{bad} should be rejected");
        }
    }

    #[test]
    fn pagination_math() {
        let page = paginate((0..5).collect(), 2, 2);
        assert_eq!(page.data, vec![2, 3]);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_next_page);

        let past_end = paginate((0..5).collect::<Vec<i32>>(), 9, 2);
        assert!(past_end.data.is_empty());
        assert!(!past_end.has_next_page);
    }

    #[tokio::test]
    async fn list_is_recursive_and_paginated() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("dir1")).unwrap();
        fs::write(dir.path().join("file1.txt"), "1").unwrap();
        fs::write(dir.path().join("dir1").join("file2.txt"), "2").unwrap();
        fs::write(dir.path().join("dir1").join("file3.txt"), "3").unwrap();

        let app = app(state(dir.path(), 1024));
        let response = app.clone().oneshot(get("/list?page=1&size=2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page: PaginatedResponse<FileEntry> =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(page.count, 3);
        assert_eq!(page.total_pages, 2);
        assert!(page.has_next_page);
        assert_eq!(page.data[0].path, "/uploads/dir1/file2.txt");

        let response = app.oneshot(get("/list/dir1")).await.unwrap();
        let page: PaginatedResponse<FileEntry> =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(page.count, 2);
    }

    #[tokio::test]
    async fn list_unknown_directory_is_not_found() {
        let dir = TempDir::new().unwrap();
        let response = app(state(dir.path(), 1024))
            .oneshot(get("/list/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_slugifies_and_refuses_duplicates() {
        let dir = TempDir::new().unwrap();
        let app = app(state(dir.path(), 1024 * 1024));

        let body = multipart_body(Some("avatars"), "My Photo (1).PNG", b"png-bytes");
        let response = app.clone().oneshot(upload_request(body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let message: MessageResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(message.msg, "/uploads/avatars/my-photo-1.PNG");
        assert_eq!(
            fs::read(dir.path().join("avatars").join("my-photo-1.PNG")).unwrap(),
            b"png-bytes"
        );

        let response = app.oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn upload_rejects_bad_paths_and_missing_files() {
        let dir = TempDir::new().unwrap();
        let app = app(state(dir.path(), 1024 * 1024));

        let response = app
            .clone()
            .oneshot(upload_request(multipart_body(Some("a:b"), "x.png", b"x")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let only_path = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"path\"\r\n\r\nimg\r\n--{BOUNDARY}--\r\n"
        );
        let response = app
            .oneshot(upload_request(only_path.into_bytes()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_over_limit_is_rejected() {
        let dir = TempDir::new().unwrap();
        let app = app(state(dir.path(), 64));

        let response = app
            .oneshot(upload_request(multipart_body(None, "big.png", &[7_u8; 4096])))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
        assert!(!dir.path().join("big.png").exists());
    }

    #[tokio::test]
    async fn delete_by_reference() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.png"), "a").unwrap();
        let app = app(state(dir.path(), 1024));

        let delete = |uri: &str| {
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(delete("/delete?path=/uploads/a.png")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!dir.path().join("a.png").exists());

        let response = app.clone().oneshot(delete("/delete?path=/uploads/a.png")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.clone().oneshot(delete("/delete")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(delete("/delete?path=/uploads/../a.png")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_serves_known_media_types() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("clips")).unwrap();
        fs::write(dir.path().join("clips").join("intro.webm"), b"0123456789").unwrap();
        fs::write(dir.path().join("notes.txt"), b"text").unwrap();
        let app = app(state(dir.path(), 1024));

        let response = app.clone().oneshot(get("/stream/uploads/clips/intro.webm")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/webm");
        assert_eq!(body_bytes(response).await, b"0123456789");

        let response = app.clone().oneshot(get("/stream/uploads/notes.txt")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = app.oneshot(get("/stream/uploads/missing.png")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_files_are_served_under_the_prefix() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.png"), b"img").unwrap();

        let response = app(state(dir.path(), 1024))
            .oneshot(get("/uploads/a.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"img");
    }
}

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::backend::BackendKind;
use crate::error::CleanerError;
use crate::reference::LogicalPrefix;

// Plain or schema-qualified SQL identifiers; anything else is refused before
// it can be interpolated into a projection query.
static SQL_IDENT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap()
});

// Ten years.
const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub field: String,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    pub collections: Vec<String>,
}

/// Descriptor of the one backend this process scans.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Postgres(PostgresConfig),
    Mongo(MongoConfig),
}

#[derive(Debug, Clone)]
pub struct CleanerConfig {
    pub interval: Duration,
    pub op_timeout: Duration,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub addr: SocketAddr,
    pub max_upload_bytes: usize,
    pub stream_buffer_bytes: usize,
    pub default_page: usize,
    pub default_page_size: usize,
}

/// Process configuration, loaded once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub upload_root: PathBuf,
    pub prefix: LogicalPrefix,
    pub backend: BackendConfig,
    pub cleaner: CleanerConfig,
    pub http: HttpConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, CleanerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CleanerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let kind: BackendKind = vars.required("MEDIA_DB")?.parse()?;
        let backend = match kind {
            BackendKind::Postgres => {
                let field = vars.or("MEDIA_PG_FIELD", "src");
                check_identifier("MEDIA_PG_FIELD", &field)?;
                let tables = vars.list("MEDIA_PG_TABLES")?;
                for table in &tables {
                    check_identifier("MEDIA_PG_TABLES", table)?;
                }
                BackendConfig::Postgres(PostgresConfig {
                    url: vars.required("DATABASE_URL")?,
                    field,
                    tables,
                })
            }
            BackendKind::Mongo => BackendConfig::Mongo(MongoConfig {
                uri: vars.required("MONGO_URI")?,
                database: vars.required("MONGO_DATABASE")?,
                collections: vars.list("MONGO_COLLECTIONS")?,
            }),
        };

        Ok(Self {
            upload_root: PathBuf::from(vars.or("MEDIA_UPLOAD_ROOT", "uploads")),
            prefix: LogicalPrefix::new(&vars.or("MEDIA_LOGICAL_PREFIX", "/uploads"))?,
            backend,
            cleaner: CleanerConfig {
                interval: vars.seconds("MEDIA_CLEAN_INTERVAL_SECS", 86_400)?,
                op_timeout: vars.seconds("MEDIA_CLEAN_TIMEOUT_SECS", 600)?,
                dry_run: vars.parsed("MEDIA_CLEAN_DRY_RUN", false)?,
            },
            http: HttpConfig {
                addr: vars.parsed("MEDIA_HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
                max_upload_bytes: vars.parsed("MEDIA_MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
                stream_buffer_bytes: vars.parsed("MEDIA_STREAM_BUFFER_BYTES", 1024)?.max(1),
                default_page: vars.parsed("MEDIA_DEFAULT_PAGE", 1)?.max(1),
                default_page_size: vars.parsed("MEDIA_DEFAULT_PAGE_SIZE", 40)?.max(1),
            },
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, CleanerError> {
        self.get(key)
            .ok_or_else(|| CleanerError::config(format!("{key} must be set")))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T, CleanerError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| CleanerError::config(format!("{key} has an invalid value: {raw:?}"))),
        }
    }

    /// A positive number of seconds, capped so deadlines cannot overflow.
    fn seconds(&self, key: &str, default: u64) -> Result<Duration, CleanerError> {
        let secs = self.parsed(key, default)?;
        if !(1..=MAX_DURATION_SECS).contains(&secs) {
            return Err(CleanerError::config(format!(
                "{key} must be between 1 and {MAX_DURATION_SECS} seconds, got {secs}"
            )));
        }
        Ok(Duration::from_secs(secs))
    }

    fn list(&self, key: &str) -> Result<Vec<String>, CleanerError> {
        let items: Vec<String> = self
            .required(key)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if items.is_empty() {
            return Err(CleanerError::config(format!("{key} must list at least one entry")));
        }
        Ok(items)
    }
}

fn check_identifier(key: &str, value: &str) -> Result<(), CleanerError> {
    if SQL_IDENT_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(CleanerError::config(format!(
            "{key} contains an invalid SQL identifier: {value:?}"
        )))
    }
}

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::reference::{LogicalPrefix, Reference, ReferenceSet};

/// Why a single unreferenced file could not be removed.
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("reference does not map to a path inside the upload root")]
    OutsideRoot,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("delete timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug)]
pub struct DeleteFailure {
    pub reference: Reference,
    pub path: Option<PathBuf>,
    pub cause: DeleteError,
}

/// Outcome of one reconciliation pass. Lives only as long as the pass.
#[derive(Debug, Default)]
pub struct Report {
    pub dry_run: bool,
    pub deleted: Vec<Reference>,
    /// Already gone when we got to it; counts as success.
    pub already_absent: Vec<Reference>,
    pub failed: Vec<DeleteFailure>,
}

impl Report {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// References present on disk but held by no backend, in stable order.
#[must_use]
pub fn unreferenced<'a>(
    on_disk: &'a ReferenceSet,
    referenced: &'a ReferenceSet,
) -> Vec<&'a Reference> {
    let mut orphans: Vec<&Reference> = on_disk.difference(referenced).collect();
    orphans.sort();
    orphans
}

pub struct Reconciler {
    root: PathBuf,
    prefix: LogicalPrefix,
    op_timeout: Duration,
    dry_run: bool,
}

impl Reconciler {
    #[must_use]
    pub const fn new(
        root: PathBuf,
        prefix: LogicalPrefix,
        op_timeout: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            root,
            prefix,
            op_timeout,
            dry_run,
        }
    }

    /// Delete every file in `on_disk` that is not in `referenced`.
    ///
    /// Each deletion stands alone: a failure is recorded and the next file is
    /// still attempted.
    pub async fn reconcile(&self, on_disk: &ReferenceSet, referenced: &ReferenceSet) -> Report {
        let mut report = Report {
            dry_run: self.dry_run,
            ..Report::default()
        };

        for reference in unreferenced(on_disk, referenced) {
            let Some(relative) = self.prefix.relative_path(reference) else {
                warn!(reference = %reference, "Refusing to delete reference outside upload root");
                report.failed.push(DeleteFailure {
                    reference: reference.clone(),
                    path: None,
                    cause: DeleteError::OutsideRoot,
                });
                continue;
            };
            let path = self.root.join(relative);

            if self.dry_run {
                info!(path = %path.display(), "Would delete unreferenced file");
                report.deleted.push(reference.clone());
                continue;
            }

            match tokio::time::timeout(self.op_timeout, tokio::fs::remove_file(&path)).await {
                Ok(Ok(())) => {
                    info!(path = %path.display(), "Deleted unreferenced file");
                    report.deleted.push(reference.clone());
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "Unreferenced file already gone");
                    report.already_absent.push(reference.clone());
                }
                Ok(Err(err)) => {
                    warn!(path = %path.display(), error = %err, "Failed to delete unreferenced file");
                    capture_delete_failure(reference, &err);
                    report.failed.push(DeleteFailure {
                        reference: reference.clone(),
                        path: Some(path),
                        cause: DeleteError::Io(err),
                    });
                }
                Err(_) => {
                    warn!(path = %path.display(), "Timed out deleting unreferenced file");
                    report.failed.push(DeleteFailure {
                        reference: reference.clone(),
                        path: Some(path),
                        cause: DeleteError::TimedOut(self.op_timeout),
                    });
                }
            }
        }

        report
    }
}

fn capture_delete_failure(reference: &Reference, err: &io::Error) {
    sentry::with_scope(
        |scope| {
            scope.set_fingerprint(Some(&["reclamation_delete", "io"]));
            scope.set_extra("reference", reference.as_str().into());
            scope.set_tag("operation", "reclamation_delete");
        },
        || {
            sentry::capture_message(
                &format!("Failed to delete unreferenced file {reference}: {err}"),
                sentry::Level::Warning,
            );
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn prefix() -> LogicalPrefix {
        LogicalPrefix::new("/uploads").unwrap()
    }

    fn set(items: &[&str]) -> ReferenceSet {
        items.iter().map(|s| prefix().admit(s).unwrap()).collect()
    }

    fn reconciler(root: &Path) -> Reconciler {
        Reconciler::new(root.to_path_buf(), prefix(), Duration::from_secs(5), false)
    }

    #[test]
    fn difference_is_exactly_disk_minus_referenced() {
        let disk = set(&["/uploads/a", "/uploads/b", "/uploads/c"]);
        let referenced = set(&["/uploads/b", "/uploads/z"]);
        let orphans: Vec<_> = unreferenced(&disk, &referenced)
            .into_iter()
            .map(Reference::as_str)
            .collect();
        assert_eq!(orphans, vec!["/uploads/a", "/uploads/c"]);
    }

    #[tokio::test]
    async fn deletes_only_unreferenced_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("keep.png"), "k").unwrap();
        fs::write(dir.path().join("img").join("drop.png"), "d").unwrap();

        let disk = set(&["/uploads/keep.png", "/uploads/img/drop.png"]);
        let referenced = set(&["/uploads/keep.png"]);
        let report = reconciler(dir.path()).reconcile(&disk, &referenced).await;

        assert_eq!(report.deleted, vec![prefix().admit("/uploads/img/drop.png").unwrap()]);
        assert!(report.is_clean());
        assert!(dir.path().join("keep.png").exists());
        assert!(!dir.path().join("img").join("drop.png").exists());
    }

    #[tokio::test]
    async fn vanished_file_counts_as_success() {
        let dir = TempDir::new().unwrap();
        let disk = set(&["/uploads/raced.png"]);
        let report = reconciler(dir.path())
            .reconcile(&disk, &ReferenceSet::new())
            .await;

        assert!(report.is_clean());
        assert!(report.deleted.is_empty());
        assert_eq!(report.already_absent.len(), 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_rest() {
        let dir = TempDir::new().unwrap();
        // A directory where a file is expected makes remove_file fail.
        fs::create_dir(dir.path().join("a_dir")).unwrap();
        fs::write(dir.path().join("b.png"), "b").unwrap();

        let disk = set(&["/uploads/a_dir", "/uploads/b.png"]);
        let report = reconciler(dir.path())
            .reconcile(&disk, &ReferenceSet::new())
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].reference.as_str(), "/uploads/a_dir");
        assert!(matches!(report.failed[0].cause, DeleteError::Io(_)));
        assert_eq!(report.deleted.len(), 1);
        assert!(!dir.path().join("b.png").exists());
    }

    #[tokio::test]
    async fn traversal_references_are_refused() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("uploads");
        fs::create_dir(&root).unwrap();
        fs::write(outer.path().join("secret"), "s").unwrap();

        let disk = set(&["/uploads/../secret"]);
        let report = reconciler(&root).reconcile(&disk, &ReferenceSet::new()).await;

        assert!(matches!(report.failed[0].cause, DeleteError::OutsideRoot));
        assert!(outer.path().join("secret").exists());
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("orphan.png"), "o").unwrap();

        let disk = set(&["/uploads/orphan.png"]);
        let report = Reconciler::new(dir.path().to_path_buf(), prefix(), Duration::from_secs(5), true)
            .reconcile(&disk, &ReferenceSet::new())
            .await;

        assert!(report.dry_run);
        assert_eq!(report.deleted.len(), 1);
        assert!(dir.path().join("orphan.png").exists());
    }
}

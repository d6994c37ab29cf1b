use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::Config;
use crate::enumerator;
use crate::error::CleanerError;
use crate::reconciler::{Reconciler, Report};
use crate::reference::LogicalPrefix;
use crate::scanner::ReferenceScanner;

/// Runs reconciliation passes: scan the backend, walk the upload root, delete
/// the difference.
pub struct Cleaner {
    scanner: Arc<dyn ReferenceScanner>,
    root: PathBuf,
    prefix: LogicalPrefix,
    op_timeout: Duration,
    reconciler: Reconciler,
}

impl Cleaner {
    pub fn new(scanner: Arc<dyn ReferenceScanner>, config: &Config) -> Self {
        Self::with_parts(
            scanner,
            config.upload_root.clone(),
            config.prefix.clone(),
            config.cleaner.op_timeout,
            config.cleaner.dry_run,
        )
    }

    pub fn with_parts(
        scanner: Arc<dyn ReferenceScanner>,
        root: PathBuf,
        prefix: LogicalPrefix,
        op_timeout: Duration,
        dry_run: bool,
    ) -> Self {
        let reconciler = Reconciler::new(root.clone(), prefix.clone(), op_timeout, dry_run);
        Self {
            scanner,
            root,
            prefix,
            op_timeout,
            reconciler,
        }
    }

    /// One full pass. A failed scan or walk aborts before anything is deleted.
    pub async fn run_pass(&self) -> Result<Report, CleanerError> {
        let started = Instant::now();
        info!(backend = self.scanner.backend(), root = %self.root.display(), "Starting reclamation pass");

        let scan = bounded("scan", self.op_timeout, self.scanner.scan());

        let root = self.root.clone();
        let prefix = self.prefix.clone();
        let walk = bounded("enumerate", self.op_timeout, async move {
            let display = root.display().to_string();
            tokio::task::spawn_blocking(move || enumerator::enumerate(&root, &prefix))
                .await
                .map_err(|err| CleanerError::io(display, io::Error::other(err)))?
        });

        let (referenced, on_disk) = tokio::try_join!(scan, walk)?;
        info!(
            referenced = referenced.len(),
            on_disk = on_disk.len(),
            "Collected references"
        );

        let report = self.reconciler.reconcile(&on_disk, &referenced).await;

        let elapsed_ms = started.elapsed().as_millis();
        if report.is_clean() {
            info!(
                deleted = report.deleted.len(),
                already_absent = report.already_absent.len(),
                dry_run = report.dry_run,
                elapsed_ms,
                "Reclamation pass finished"
            );
        } else {
            warn!(
                deleted = report.deleted.len(),
                already_absent = report.already_absent.len(),
                failed = report.failed.len(),
                dry_run = report.dry_run,
                elapsed_ms,
                "Reclamation pass finished with failures"
            );
        }
        Ok(report)
    }
}

async fn bounded<T>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T, CleanerError>>,
) -> Result<T, CleanerError> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| CleanerError::Timeout { operation, after })?
}

use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::CleanerError;
use crate::reference::{LogicalPrefix, ReferenceSet};

/// Walk `root` and return a reference for every regular file below it.
///
/// Symlinks are never followed and never emitted, so the walk cannot leave the
/// root or loop. Any I/O error aborts the walk: deletion is never decided from
/// a partial view of the disk. Blocking; run it off the async workers.
pub fn enumerate(root: &Path, prefix: &LogicalPrefix) -> Result<ReferenceSet, CleanerError> {
    let mut files = ReferenceSet::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|err| {
            let path = err
                .path()
                .unwrap_or(root)
                .display()
                .to_string();
            CleanerError::io(path, err.into())
        })?;

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            debug!(path = %entry.path().display(), "Skipping symlink");
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        match prefix.reference_for(relative) {
            Some(reference) => {
                files.insert(reference);
            }
            // Non UTF-8 names and names with a literal backslash can never be
            // matched by a backend value; they are left alone rather than deleted.
            None => warn!(path = %entry.path().display(), "Skipping file with unrepresentable name"),
        }
    }

    Ok(files)
}

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::CleanerError;

/// Set of references built fresh for a single reconciliation pass.
pub type ReferenceSet = HashSet<Reference>;

/// Normalized string identifying a stored file, e.g. `/uploads/avatars/a.png`.
///
/// Equality is plain case-sensitive string equality after separator
/// normalization, so references from any scanner and from the filesystem
/// can be compared directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference(String);

impl Reference {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The namespace that marks a string as a stored-file reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPrefix(String);

impl LogicalPrefix {
    /// `raw` must start with `/`; trailing separators are dropped.
    pub fn new(raw: &str) -> Result<Self, CleanerError> {
        let normalized = normalize_separators(raw.trim());
        let trimmed = normalized.trim_end_matches('/');
        if !trimmed.starts_with('/') || trimmed.len() < 2 {
            return Err(CleanerError::config(format!(
                "logical prefix must be an absolute path like /uploads, got {raw:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Admit a value found in a backend: non-empty and carrying the prefix.
    #[must_use]
    pub fn admit(&self, value: &str) -> Option<Reference> {
        if value.is_empty() {
            return None;
        }
        let normalized = normalize_separators(value);
        normalized
            .starts_with(self.0.as_str())
            .then(|| Reference(normalized))
    }

    /// Reference for a file at `relative` below the upload root.
    ///
    /// Returns `None` for paths that are empty, not plain relative paths, or
    /// have a segment that is not UTF-8 or holds a literal `\`. Backend values
    /// treat `\` as a separator, so such a name could not be told apart from
    /// a nested path.
    #[must_use]
    pub fn reference_for(&self, relative: &Path) -> Option<Reference> {
        let mut out = self.0.clone();
        let mut any = false;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str()?;
                    if part.contains('\\') {
                        return None;
                    }
                    out.push('/');
                    out.push_str(part);
                    any = true;
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        any.then(|| Reference(out))
    }

    /// Map a reference back to a path relative to the upload root.
    ///
    /// Only plain relative segments are accepted, so the result can never
    /// escape the root.
    #[must_use]
    pub fn relative_path(&self, reference: &Reference) -> Option<PathBuf> {
        let rest = reference.as_str().strip_prefix(self.0.as_str())?;
        let rest = rest.strip_prefix('/')?;
        let mut path = PathBuf::new();
        for segment in rest.split('/') {
            match segment {
                "" | "." | ".." => return None,
                s => path.push(s),
            }
        }
        Some(path)
    }
}

impl fmt::Display for LogicalPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_separators(value: &str) -> String {
    value.replace('\\', "/")
}

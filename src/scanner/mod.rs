//! Reference scanners: produce the set of file references held by a backend.
//!
//! A scan is all-or-nothing. If any configured table or collection cannot be
//! read, the whole scan fails and no deletion decision is made from it.

pub mod document;
pub mod relational;

use async_trait::async_trait;

use crate::error::CleanerError;
use crate::reference::ReferenceSet;

pub use document::{DocumentScanner, DocumentStore, MongoStore, Node};
pub use relational::{PgStore, RelationalScanner, RelationalStore};

#[async_trait]
pub trait ReferenceScanner: Send + Sync {
    /// Backend label for logs.
    fn backend(&self) -> &'static str;

    async fn scan(&self) -> Result<ReferenceSet, CleanerError>;
}

use std::str::FromStr;
use std::sync::Arc;

use crate::config::{BackendConfig, Config};
use crate::error::CleanerError;
use crate::scanner::{
    DocumentScanner, MongoStore, PgStore, ReferenceScanner, RelationalScanner,
};

/// Discriminator read from `MEDIA_DB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Mongo,
}

impl FromStr for BackendKind {
    type Err = CleanerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pg" | "postgres" | "postgresql" => Ok(Self::Postgres),
            "mongo" | "mongodb" => Ok(Self::Mongo),
            other => Err(CleanerError::config(format!(
                "unknown database type {other:?}, expected pg or mongo"
            ))),
        }
    }
}

/// Build the single scanner this process uses for its whole lifetime.
pub async fn select_scanner(config: &Config) -> Result<Arc<dyn ReferenceScanner>, CleanerError> {
    let timeout = config.cleaner.op_timeout;
    let scanner: Arc<dyn ReferenceScanner> = match &config.backend {
        BackendConfig::Postgres(pg) => Arc::new(RelationalScanner::new(
            PgStore::connect_lazy(pg, timeout)?,
            pg.field.clone(),
            pg.tables.clone(),
            config.prefix.clone(),
        )),
        BackendConfig::Mongo(mongo) => Arc::new(DocumentScanner::new(
            MongoStore::connect_lazy(mongo, timeout).await?,
            mongo.collections.clone(),
            config.prefix.clone(),
        )),
    };
    Ok(scanner)
}

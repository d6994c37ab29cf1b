use async_trait::async_trait;
use bb8_postgres::bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::debug;

use super::ReferenceScanner;
use crate::config::PostgresConfig;
use crate::error::CleanerError;
use crate::reference::{LogicalPrefix, ReferenceSet};

// Rows pulled per round trip from the server-side portal.
const FETCH_SIZE: i32 = 1_000;

/// Read access to single-column projections of a relational store.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Feed every value of `field` in `table` to `sink`, in cursor order.
    /// NULLs arrive as `None`.
    async fn visit_column(
        &self,
        table: &str,
        field: &str,
        sink: &mut (dyn FnMut(Option<String>) + Send),
    ) -> Result<(), CleanerError>;
}

pub struct RelationalScanner<S> {
    store: S,
    field: String,
    tables: Vec<String>,
    prefix: LogicalPrefix,
}

impl<S: RelationalStore> RelationalScanner<S> {
    pub fn new(store: S, field: String, tables: Vec<String>, prefix: LogicalPrefix) -> Self {
        Self {
            store,
            field,
            tables,
            prefix,
        }
    }
}

#[async_trait]
impl<S: RelationalStore> ReferenceScanner for RelationalScanner<S> {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn scan(&self) -> Result<ReferenceSet, CleanerError> {
        let mut references = ReferenceSet::new();
        for table in &self.tables {
            let before = references.len();
            let prefix = &self.prefix;
            self.store
                .visit_column(table, &self.field, &mut |value| {
                    if let Some(reference) = value.as_deref().and_then(|v| prefix.admit(v)) {
                        references.insert(reference);
                    }
                })
                .await?;
            debug!(table = %table, found = references.len() - before, "Scanned table");
        }
        Ok(references)
    }
}

/// Postgres store backed by a bb8 pool. Connections are opened lazily, so an
/// unreachable server surfaces as a connection error on the pass, not at startup.
pub struct PgStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PgStore {
    pub fn connect_lazy(config: &PostgresConfig, timeout: Duration) -> Result<Self, CleanerError> {
        let manager = PostgresConnectionManager::new_from_stringlike(config.url.as_str(), NoTls)
            .map_err(|err| CleanerError::config(format!("invalid DATABASE_URL: {err}")))?;

        let pool = Pool::builder()
            .min_idle(Some(0))
            .max_size(2)
            .connection_timeout(timeout)
            .build_unchecked(manager);
        Ok(Self { pool })
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn visit_column(
        &self,
        table: &str,
        field: &str,
        sink: &mut (dyn FnMut(Option<String>) + Send),
    ) -> Result<(), CleanerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| CleanerError::connection("postgres", err))?;

        // Identifiers were validated when the configuration was loaded.
        let query = format!("SELECT {field} FROM {table}");

        let tx = conn
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(|err| CleanerError::connection("postgres", err))?;
        let portal = tx
            .bind(query.as_str(), &[])
            .await
            .map_err(|err| CleanerError::query(table, err))?;

        loop {
            let rows = tx
                .query_portal(&portal, FETCH_SIZE)
                .await
                .map_err(|err| CleanerError::query(table, err))?;
            for row in &rows {
                let value: Option<String> = row
                    .try_get(0)
                    .map_err(|err| CleanerError::query(table, err))?;
                sink(value);
            }
            if rows.len() < FETCH_SIZE as usize {
                break;
            }
        }

        tx.commit()
            .await
            .map_err(|err| CleanerError::query(table, err))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory tables; listed names in `failing` return a query error.
    #[derive(Default)]
    pub(crate) struct FakeTables {
        pub tables: HashMap<String, Vec<Option<String>>>,
        pub failing: Vec<String>,
    }

    impl FakeTables {
        pub(crate) fn with(mut self, table: &str, values: &[Option<&str>]) -> Self {
            self.tables.insert(
                table.to_string(),
                values.iter().map(|v| v.map(str::to_string)).collect(),
            );
            self
        }
    }

    #[async_trait]
    impl RelationalStore for FakeTables {
        async fn visit_column(
            &self,
            table: &str,
            _field: &str,
            sink: &mut (dyn FnMut(Option<String>) + Send),
        ) -> Result<(), CleanerError> {
            if self.failing.iter().any(|t| t == table) {
                return Err(CleanerError::query(table, "relation does not exist"));
            }
            let rows = self
                .tables
                .get(table)
                .ok_or_else(|| CleanerError::query(table, "relation does not exist"))?;
            for value in rows {
                sink(value.clone());
            }
            Ok(())
        }
    }

    fn scanner(store: FakeTables, tables: &[&str]) -> RelationalScanner<FakeTables> {
        RelationalScanner::new(
            store,
            "src".to_string(),
            tables.iter().map(|t| (*t).to_string()).collect(),
            LogicalPrefix::new("/uploads").unwrap(),
        )
    }

    #[tokio::test]
    async fn ignores_null_empty_and_foreign_values() {
        let store = FakeTables::default().with(
            "posts",
            &[
                Some("/uploads/a.png"),
                None,
                Some(""),
                Some("https://example.com/b.png"),
                Some("/static/c.png"),
                Some("/uploads/nested/d.png"),
            ],
        );

        let refs = scanner(store, &["posts"]).scan().await.unwrap();
        let mut found: Vec<_> = refs.iter().map(|r| r.as_str().to_string()).collect();
        found.sort();
        assert_eq!(found, vec!["/uploads/a.png", "/uploads/nested/d.png"]);
    }

    #[tokio::test]
    async fn merges_all_tables() {
        let store = FakeTables::default()
            .with("posts", &[Some("/uploads/a.png")])
            .with("users", &[Some("/uploads/avatar.png"), Some("/uploads/a.png")]);

        let refs = scanner(store, &["posts", "users"]).scan().await.unwrap();
        assert_eq!(refs.len(), 2);
    }

    #[tokio::test]
    async fn one_failing_table_fails_the_scan() {
        let mut store = FakeTables::default()
            .with("posts", &[Some("/uploads/a.png")])
            .with("users", &[Some("/uploads/b.png")]);
        store.failing.push("users".to_string());

        let err = scanner(store, &["posts", "users"]).scan().await.unwrap_err();
        assert!(matches!(err, CleanerError::Query { ref source_name, .. } if source_name == "users"));
    }
}

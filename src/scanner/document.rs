use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::Client;
use std::time::Duration;
use tracing::debug;

use super::ReferenceScanner;
use crate::config::MongoConfig;
use crate::error::CleanerError;
use crate::reference::{LogicalPrefix, ReferenceSet};

/// Decoded document tree, independent of the driver's own value type.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Mapping(Vec<(String, Node)>),
    Sequence(Vec<Node>),
    StringLeaf(String),
    OtherLeaf,
}

impl From<Bson> for Node {
    fn from(value: Bson) -> Self {
        match value {
            Bson::Document(doc) => Self::from(doc),
            Bson::Array(items) => Self::Sequence(items.into_iter().map(Self::from).collect()),
            Bson::String(s) => Self::StringLeaf(s),
            _ => Self::OtherLeaf,
        }
    }
}

impl From<Document> for Node {
    fn from(doc: Document) -> Self {
        Self::Mapping(doc.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
    }
}

/// Add every string leaf of `root` that carries `prefix` to `out`.
///
/// Uses an explicit work list, so nesting depth is bounded by heap, not stack.
pub fn collect_references(root: &Node, prefix: &LogicalPrefix, out: &mut ReferenceSet) {
    let mut pending = vec![root];
    while let Some(node) = pending.pop() {
        match node {
            Node::Mapping(entries) => pending.extend(entries.iter().map(|(_, v)| v)),
            Node::Sequence(items) => pending.extend(items),
            Node::StringLeaf(s) => {
                if let Some(reference) = prefix.admit(s) {
                    out.insert(reference);
                }
            }
            Node::OtherLeaf => {}
        }
    }
}

/// Read access to whole collections of a document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Feed every document of `collection` to `sink`, streamed from a cursor.
    async fn visit_documents(
        &self,
        collection: &str,
        sink: &mut (dyn FnMut(Node) + Send),
    ) -> Result<(), CleanerError>;
}

pub struct DocumentScanner<S> {
    store: S,
    collections: Vec<String>,
    prefix: LogicalPrefix,
}

impl<S: DocumentStore> DocumentScanner<S> {
    pub fn new(store: S, collections: Vec<String>, prefix: LogicalPrefix) -> Self {
        Self {
            store,
            collections,
            prefix,
        }
    }
}

#[async_trait]
impl<S: DocumentStore> ReferenceScanner for DocumentScanner<S> {
    fn backend(&self) -> &'static str {
        "mongo"
    }

    async fn scan(&self) -> Result<ReferenceSet, CleanerError> {
        let mut references = ReferenceSet::new();
        for collection in &self.collections {
            let before = references.len();
            let mut documents = 0_usize;
            let prefix = &self.prefix;
            self.store
                .visit_documents(collection, &mut |node| {
                    documents += 1;
                    collect_references(&node, prefix, &mut references);
                })
                .await?;
            debug!(
                collection = %collection,
                documents,
                found = references.len() - before,
                "Scanned collection"
            );
        }
        Ok(references)
    }
}

pub struct MongoStore {
    client: Client,
    database: String,
}

impl MongoStore {
    /// Parses the URI and builds a client; no server round trip happens until
    /// the first scan.
    pub async fn connect_lazy(config: &MongoConfig, timeout: Duration) -> Result<Self, CleanerError> {
        let mut options = ClientOptions::parse(config.uri.as_str())
            .await
            .map_err(|err| CleanerError::config(format!("invalid MONGO_URI: {err}")))?;
        options.server_selection_timeout = Some(timeout);
        options.connect_timeout = Some(timeout);

        let client = Client::with_options(options)
            .map_err(|err| CleanerError::config(format!("invalid mongo options: {err}")))?;
        Ok(Self {
            client,
            database: config.database.clone(),
        })
    }
}

fn classify(collection: &str, err: &mongodb::error::Error) -> CleanerError {
    match *err.kind {
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::DnsResolve { .. } => {
            CleanerError::connection("mongo", err)
        }
        _ => CleanerError::query(collection, err),
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn visit_documents(
        &self,
        collection: &str,
        sink: &mut (dyn FnMut(Node) + Send),
    ) -> Result<(), CleanerError> {
        let coll = self
            .client
            .database(&self.database)
            .collection::<Document>(collection);

        let mut cursor = coll
            .find(doc! {})
            .await
            .map_err(|err| classify(collection, &err))?;

        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|err| classify(collection, &err))?
        {
            sink(Node::from(document));
        }
        Ok(())
    }
}

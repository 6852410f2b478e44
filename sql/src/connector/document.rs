use crate::Result;
use async_trait::async_trait;
use serde_json::Value as Document;

/// The boundary for document stores (the `mongodb` URL family).
///
/// A document adapter emulates the SQL adapter surface through these eight
/// operation categories. The query language behind them is the adapter's
/// own; nothing in this crate translates to it.
#[async_trait]
pub trait DocumentAdapter: Send + Sync {
    async fn insert_one(&self, collection: &str, document: Document) -> Result<Document>;

    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>>;

    async fn update(&self, collection: &str, filter: Document, update: Document) -> Result<u64>;

    async fn delete(&self, collection: &str, filter: Document) -> Result<u64>;

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<Vec<Document>>;

    async fn bulk_insert(&self, collection: &str, documents: Vec<Document>) -> Result<u64>;

    async fn create_index(&self, collection: &str, keys: Document, unique: bool) -> Result<String>;

    async fn count(&self, collection: &str, filter: Document) -> Result<u64>;
}

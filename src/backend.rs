//! Database backend abstraction.
//! Operations call the backend through dyn dispatch so tests can swap in a fake.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::registry::Record;

/// Options accepted when creating a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateCollectionOptions {
    /// Create a fixed-size collection. The server requires `size_bytes` alongside it.
    pub capped: bool,
    pub size_bytes: Option<u64>,
}

/// Index metadata in a driver-independent shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub name: String,
    /// Key specification as JSON text, field order preserved: `{"status": 1, "createdAt": -1}`
    pub key: String,
    pub unique: bool,
    pub sparse: bool,
    pub hidden: bool,
    pub expire_after_seconds: Option<u64>,
}

impl IndexRecord {
    pub fn into_record(self) -> Record {
        let mut record = Record::new();
        record.insert("name".to_string(), Value::String(self.name));
        record.insert("key".to_string(), Value::String(self.key));
        record.insert("unique".to_string(), Value::Bool(self.unique));
        record.insert("sparse".to_string(), Value::Bool(self.sparse));
        record.insert("hidden".to_string(), Value::Bool(self.hidden));
        record.insert(
            "expire_after_seconds".to_string(),
            self.expire_after_seconds.map_or(Value::Null, Value::from),
        );
        record
    }
}

/// Administrative capabilities the operations are built on.
#[async_trait]
pub trait AdminBackend: Send + Sync {
    /// Database names in the order the server enumerates them
    async fn list_database_names(&self) -> Result<Vec<String>>;

    /// Collection names in the order the server enumerates them
    async fn list_collection_names(&self, database: &str) -> Result<Vec<String>>;

    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexRecord>>;

    /// Fails if the collection already exists
    async fn create_collection(
        &self,
        database: &str,
        collection: &str,
        options: &CreateCollectionOptions,
    ) -> Result<()>;
}

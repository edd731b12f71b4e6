//! MongoDB backend implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    Client, IndexModel,
    bson::{Bson, Document},
    options::{ClientOptions, CreateCollectionOptions as DriverCreateOptions},
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::backend::{AdminBackend, CreateCollectionOptions, IndexRecord};
use crate::config::Config;

fn key_value_json(value: &Bson) -> Value {
    value.clone().into_relaxed_extjson()
}

/// Render an index key document as JSON text, keeping field order
fn render_key(keys: &Document) -> String {
    let fields: Vec<String> = keys
        .iter()
        .map(|(field, value)| {
            let field = serde_json::to_string(field).unwrap_or_else(|_| format!("\"{field}\""));
            format!("{field}: {}", key_value_json(value))
        })
        .collect();
    format!("{{{}}}", fields.join(", "))
}

/// Server-style default index name, e.g. `status_1_createdAt_-1`.
/// The server always names the `_id` index `_id_`.
fn default_index_name(keys: &Document) -> String {
    if keys.len() == 1 && keys.contains_key("_id") {
        return "_id_".to_string();
    }

    keys.iter()
        .map(|(field, value)| match key_value_json(value) {
            Value::String(s) => format!("{field}_{s}"),
            other => format!("{field}_{other}"),
        })
        .collect::<Vec<_>>()
        .join("_")
}

pub fn index_record_from_model(model: IndexModel) -> IndexRecord {
    let options = model.options.unwrap_or_default();
    IndexRecord {
        name: options
            .name
            .unwrap_or_else(|| default_index_name(&model.keys)),
        key: render_key(&model.keys),
        unique: options.unique.unwrap_or(false),
        sparse: options.sparse.unwrap_or(false),
        hidden: options.hidden.unwrap_or(false),
        expire_after_seconds: options.expire_after.map(|d| d.as_secs()),
    }
}

/// MongoDB backend reached through a connection string.
/// The driver client (and its connection pool) is created on first use.
pub struct MongoBackend {
    config: Config,
    client: OnceCell<Client>,
}

impl MongoBackend {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    /// Lazily initialize the MongoDB client on first use
    async fn get_client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                tracing::info!(
                    "Initializing MongoDB client for {}",
                    self.config.redacted_uri()
                );

                let mut client_options = ClientOptions::parse(&self.config.mongodb_uri)
                    .await
                    .context("Failed to parse MongoDB connection URI")?;

                client_options.connect_timeout =
                    Some(Duration::from_secs(self.config.connect_timeout_secs));
                client_options.server_selection_timeout = Some(Duration::from_secs(
                    self.config.server_selection_timeout_secs,
                ));
                if let Some(app_name) = &self.config.app_name {
                    client_options.app_name = Some(app_name.clone());
                }

                Client::with_options(client_options).context("Failed to create MongoDB client")
            })
            .await
    }
}

#[async_trait]
impl AdminBackend for MongoBackend {
    async fn list_database_names(&self) -> Result<Vec<String>> {
        let client = self.get_client().await?;
        tracing::debug!("Listing databases");

        client
            .list_database_names()
            .await
            .context("Failed to list databases")
    }

    async fn list_collection_names(&self, database: &str) -> Result<Vec<String>> {
        let client = self.get_client().await?;
        tracing::debug!("Listing collections in {}", database);

        client
            .database(database)
            .list_collection_names()
            .await
            .with_context(|| format!("Failed to list collections in database '{database}'"))
    }

    async fn list_indexes(&self, database: &str, collection: &str) -> Result<Vec<IndexRecord>> {
        let client = self.get_client().await?;
        tracing::debug!("Listing indexes on {}.{}", database, collection);

        let coll = client.database(database).collection::<Document>(collection);
        let cursor = coll
            .list_indexes()
            .await
            .with_context(|| format!("Failed to list indexes on {database}.{collection}"))?;
        let models: Vec<IndexModel> = cursor
            .try_collect()
            .await
            .with_context(|| format!("Failed to collect indexes on {database}.{collection}"))?;

        Ok(models.into_iter().map(index_record_from_model).collect())
    }

    async fn create_collection(
        &self,
        database: &str,
        collection: &str,
        options: &CreateCollectionOptions,
    ) -> Result<()> {
        let client = self.get_client().await?;
        tracing::debug!("Creating collection {}.{}", database, collection);

        let mut create_options = DriverCreateOptions::default();
        if options.capped {
            create_options.capped = Some(true);
        }
        create_options.size = options.size_bytes;

        client
            .database(database)
            .create_collection(collection)
            .with_options(create_options)
            .await
            .with_context(|| {
                format!("Failed to create collection '{collection}' in database '{database}'")
            })
    }
}

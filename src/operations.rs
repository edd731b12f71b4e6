//! MongoDB administrative operations registered with the dispatcher.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;

use crate::backend::{AdminBackend, CreateCollectionOptions, IndexRecord};
use crate::registry::{Arguments, DispatchError, Handler, Operation, Param, Payload, Registry};

const DB_PARAM: &str = "db";
const COLLECTION_PARAM: &str = "collection";

/// Bind an operation function to a shared backend
fn bind<F, Fut>(backend: &Arc<dyn AdminBackend>, f: F) -> impl Handler + 'static
where
    F: Fn(Arc<dyn AdminBackend>, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    let backend = backend.clone();
    move |args: Arguments| f(backend.clone(), args)
}

async fn list_databases(backend: Arc<dyn AdminBackend>, _args: Arguments) -> Result<Payload> {
    let names = backend.list_database_names().await?;
    tracing::debug!("Databases found: {}", names.len());
    Ok(Payload::List(names))
}

async fn list_collections(backend: Arc<dyn AdminBackend>, args: Arguments) -> Result<Payload> {
    let db = args.required_str(DB_PARAM)?;
    let names = backend.list_collection_names(db).await?;
    tracing::debug!("Collections found in {}: {}", db, names.len());
    Ok(Payload::List(names))
}

async fn list_indexes(backend: Arc<dyn AdminBackend>, args: Arguments) -> Result<Payload> {
    let db = args.required_str(DB_PARAM)?;
    let collection = args.required_str(COLLECTION_PARAM)?;
    let indexes = backend.list_indexes(db, collection).await?;
    Ok(Payload::Records(
        indexes.into_iter().map(IndexRecord::into_record).collect(),
    ))
}

async fn create_collection(backend: Arc<dyn AdminBackend>, args: Arguments) -> Result<Payload> {
    let db = args.required_str(DB_PARAM)?;
    let collection = args.required_str(COLLECTION_PARAM)?;
    let options = CreateCollectionOptions {
        capped: args.bool("capped").unwrap_or(false),
        size_bytes: args.int("sizeBytes").and_then(|n| u64::try_from(n).ok()),
    };
    match (options.capped, options.size_bytes) {
        (true, None) => {
            return Err(
                DispatchError::invalid_argument("sizeBytes", "required when capped is true").into(),
            );
        }
        (false, Some(_)) => {
            return Err(DispatchError::invalid_argument(
                "capped",
                "must be true when sizeBytes is given",
            )
            .into());
        }
        _ => {}
    }

    backend.create_collection(db, collection, &options).await?;

    Ok(Payload::Text(format!(
        "Collection '{collection}' created successfully in database '{db}'."
    )))
}

/// Register listDatabases, listCollections, listIndexes and createCollection.
pub fn register_admin_operations(
    registry: &mut Registry,
    backend: Arc<dyn AdminBackend>,
) -> std::result::Result<(), DispatchError> {
    registry.register(Operation::new(
        "listDatabases",
        "Lists the names of all databases on the MongoDB server. \
         Order follows the server's enumeration and is not guaranteed to be alphabetical.",
        bind(&backend, list_databases),
    ))?;

    registry.register(
        Operation::new(
            "listCollections",
            "Lists the names of all collections in the specified database. \
             Collection names are case-sensitive.",
            bind(&backend, list_collections),
        )
        .param(Param::string(DB_PARAM, "The database name. Case-sensitive.")),
    )?;

    registry.register(
        Operation::new(
            "listIndexes",
            "Lists the indexes of a collection. Each record has name, key \
             (JSON key specification, field order preserved), unique, sparse, hidden \
             and expire_after_seconds.",
            bind(&backend, list_indexes),
        )
        .param(Param::string(DB_PARAM, "The database name. Case-sensitive."))
        .param(Param::string(
            COLLECTION_PARAM,
            "The collection name from listCollections. Case-sensitive.",
        )),
    )?;

    registry.register(
        Operation::new(
            "createCollection",
            "Creates a new collection in the specified database. \
             Fails if the collection already exists.",
            bind(&backend, create_collection),
        )
        .param(Param::string(DB_PARAM, "The database name. Created if it does not exist."))
        .param(Param::string(COLLECTION_PARAM, "The name of the new collection."))
        .param(
            Param::boolean(
                "capped",
                "Create a fixed-size collection. Requires sizeBytes; sizeBytes requires capped.",
            )
            .optional(),
        )
        .param(
            Param::integer("sizeBytes", "Maximum size in bytes of a capped collection.")
                .minimum(1)
                .optional(),
        ),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ErrorKind, JsonObject};
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory stand-in for a MongoDB server.
    #[derive(Default)]
    struct FakeBackend {
        databases: Mutex<Vec<(String, Vec<String>)>>,
        last_create_options: Mutex<Option<CreateCollectionOptions>>,
        unreachable: bool,
    }

    impl FakeBackend {
        fn with_databases(databases: &[(&str, &[&str])]) -> Self {
            let databases = databases
                .iter()
                .map(|(db, colls)| {
                    (db.to_string(), colls.iter().map(|c| c.to_string()).collect())
                })
                .collect();
            Self {
                databases: Mutex::new(databases),
                ..Self::default()
            }
        }

        fn check_reachable(&self) -> Result<()> {
            if self.unreachable {
                bail!("Server selection timeout: No available servers");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl AdminBackend for FakeBackend {
        async fn list_database_names(&self) -> Result<Vec<String>> {
            self.check_reachable()?;
            let databases = self.databases.lock().unwrap();
            Ok(databases.iter().map(|(name, _)| name.clone()).collect())
        }

        async fn list_collection_names(&self, database: &str) -> Result<Vec<String>> {
            self.check_reachable()?;
            let databases = self.databases.lock().unwrap();
            Ok(databases
                .iter()
                .find(|(name, _)| name == database)
                .map(|(_, colls)| colls.clone())
                .unwrap_or_default())
        }

        async fn list_indexes(
            &self,
            database: &str,
            collection: &str,
        ) -> Result<Vec<IndexRecord>> {
            let collections = self.list_collection_names(database).await?;
            if !collections.iter().any(|c| c == collection) {
                bail!("ns does not exist: {database}.{collection}");
            }
            Ok(vec![IndexRecord {
                name: "_id_".to_string(),
                key: r#"{"_id": 1}"#.to_string(),
                unique: false,
                sparse: false,
                hidden: false,
                expire_after_seconds: None,
            }])
        }

        async fn create_collection(
            &self,
            database: &str,
            collection: &str,
            options: &CreateCollectionOptions,
        ) -> Result<()> {
            self.check_reachable()?;
            *self.last_create_options.lock().unwrap() = Some(options.clone());

            let mut databases = self.databases.lock().unwrap();
            match databases.iter_mut().find(|(name, _)| name == database) {
                Some((_, colls)) if colls.iter().any(|c| c == collection) => {
                    bail!("Collection already exists. NS: {database}.{collection}")
                }
                Some((_, colls)) => colls.push(collection.to_string()),
                None => databases.push((database.to_string(), vec![collection.to_string()])),
            }
            Ok(())
        }
    }

    fn args(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected a JSON object"),
        }
    }

    fn registry_with(backend: Arc<FakeBackend>) -> Registry {
        let mut registry = Registry::new();
        register_admin_operations(&mut registry, backend).unwrap();
        registry
    }

    #[test]
    fn test_registers_all_operations() {
        let registry = registry_with(Arc::new(FakeBackend::default()));
        assert_eq!(
            registry.names(),
            vec!["listDatabases", "listCollections", "listIndexes", "createCollection"]
        );
    }

    #[test]
    fn test_registering_twice_fails() {
        let backend: Arc<dyn AdminBackend> = Arc::new(FakeBackend::default());
        let mut registry = Registry::new();
        register_admin_operations(&mut registry, backend.clone()).unwrap();

        let err = register_admin_operations(&mut registry, backend).unwrap_err();
        assert_eq!(err, DispatchError::DuplicateOperation("listDatabases".to_string()));
    }

    #[tokio::test]
    async fn test_create_collection_then_already_exists() {
        let backend = Arc::new(FakeBackend::default());
        let registry = registry_with(backend);
        let request = args(json!({"db": "shop", "collection": "orders"}));

        let result = registry.invoke("createCollection", &request).await;
        assert_eq!(
            result,
            Ok(Payload::Text(
                "Collection 'orders' created successfully in database 'shop'.".to_string()
            ))
        );

        let err = registry
            .invoke("createCollection", &request)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(err.to_string(), "Collection already exists. NS: shop.orders");
    }

    #[tokio::test]
    async fn test_create_collection_empty_db() {
        let registry = registry_with(Arc::new(FakeBackend::default()));

        let err = registry
            .invoke("createCollection", &args(json!({"db": "", "collection": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.parameter(), Some("db"));
    }

    #[tokio::test]
    async fn test_create_capped_collection_passes_options() {
        let backend = Arc::new(FakeBackend::default());
        let registry = registry_with(backend.clone());

        registry
            .invoke(
                "createCollection",
                &args(json!({"db": "logs", "collection": "events", "capped": true, "sizeBytes": 4096})),
            )
            .await
            .unwrap();

        assert_eq!(
            *backend.last_create_options.lock().unwrap(),
            Some(CreateCollectionOptions {
                capped: true,
                size_bytes: Some(4096),
            })
        );

        let err = registry
            .invoke(
                "createCollection",
                &args(json!({"db": "logs", "collection": "more", "capped": true, "sizeBytes": -1})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.parameter(), Some("sizeBytes"));
    }

    #[tokio::test]
    async fn test_create_collection_rejects_inconsistent_capped_options() {
        let backend = Arc::new(FakeBackend::default());
        let registry = registry_with(backend.clone());

        let err = registry
            .invoke(
                "createCollection",
                &args(json!({"db": "logs", "collection": "events", "capped": true})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.parameter(), Some("sizeBytes"));

        let err = registry
            .invoke(
                "createCollection",
                &args(json!({"db": "logs", "collection": "events", "sizeBytes": 4096})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.parameter(), Some("capped"));

        // Neither call reached the backend
        assert_eq!(*backend.last_create_options.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_databases_is_stable_as_a_set() {
        let backend = Arc::new(FakeBackend::with_databases(&[
            ("shop", &["orders"]),
            ("admin", &[]),
            ("local", &["startup_log"]),
        ]));
        let registry = registry_with(backend);

        let as_set = |payload: Payload| -> HashSet<String> {
            match payload {
                Payload::List(names) => names.into_iter().collect(),
                other => panic!("expected a list, got {other:?}"),
            }
        };

        let first = registry.invoke("listDatabases", &JsonObject::new()).await.unwrap();
        let second = registry.invoke("listDatabases", &JsonObject::new()).await.unwrap();

        let expected: HashSet<String> =
            ["shop", "admin", "local"].iter().map(|s| s.to_string()).collect();
        assert_eq!(as_set(first), expected);
        assert_eq!(as_set(second), expected);
    }

    #[tokio::test]
    async fn test_list_collections_keeps_backend_order() {
        let backend = Arc::new(FakeBackend::with_databases(&[(
            "shop",
            &["zeta", "Orders", "alpha"],
        )]));
        let registry = registry_with(backend);

        let result = registry
            .invoke("listCollections", &args(json!({"db": "shop"})))
            .await
            .unwrap();
        assert_eq!(
            result,
            Payload::List(vec!["zeta".into(), "Orders".into(), "alpha".into()])
        );
    }

    #[tokio::test]
    async fn test_list_indexes_returns_flat_records() {
        let backend = Arc::new(FakeBackend::with_databases(&[("shop", &["orders"])]));
        let registry = registry_with(backend);

        let result = registry
            .invoke("listIndexes", &args(json!({"db": "shop", "collection": "orders"})))
            .await
            .unwrap();

        let Payload::Records(records) = result else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], "_id_");
        assert_eq!(records[0]["key"], r#"{"_id": 1}"#);
        assert!(records[0].values().all(|v| !v.is_object() && !v.is_array()));

        let err = registry
            .invoke("listIndexes", &args(json!({"db": "shop", "collection": "missing"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.to_string().contains("ns does not exist"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_maps_to_backend_error() {
        let backend = Arc::new(FakeBackend {
            unreachable: true,
            ..FakeBackend::default()
        });
        let registry = registry_with(backend);

        for (name, request) in [
            ("listDatabases", json!({})),
            ("listCollections", json!({"db": "shop"})),
            ("listIndexes", json!({"db": "shop", "collection": "orders"})),
            ("createCollection", json!({"db": "shop", "collection": "orders"})),
        ] {
            let err = registry.invoke(name, &args(request)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Backend, "operation {name}");
            assert!(err.to_string().contains("No available servers"));
        }
    }

    #[tokio::test]
    async fn test_payload_shapes_match_operations() {
        let backend = Arc::new(FakeBackend::with_databases(&[("shop", &["orders"])]));
        let registry = registry_with(backend);

        let list = registry.invoke("listDatabases", &JsonObject::new()).await;
        assert!(matches!(list, Ok(Payload::List(_))));

        let list = registry
            .invoke("listCollections", &args(json!({"db": "shop"})))
            .await;
        assert!(matches!(list, Ok(Payload::List(_))));

        let records = registry
            .invoke("listIndexes", &args(json!({"db": "shop", "collection": "orders"})))
            .await;
        assert!(matches!(records, Ok(Payload::Records(_))));

        let text = registry
            .invoke("createCollection", &args(json!({"db": "shop", "collection": "carts"})))
            .await;
        assert!(matches!(text, Ok(Payload::Text(_))));
    }
}

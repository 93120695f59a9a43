//! Thin read/write facade over the document store.

use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{AggregateOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use std::time::Duration;

#[derive(Clone)]
pub struct CatalogGateway {
    db: Database,
}

impl CatalogGateway {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let client = Client::with_uri_str(config.uri())
            .await
            .context("failed to build store client")?;
        let db = client.database(&config.db);
        // fail fast when the store is unreachable
        db.run_command(doc! { "ping": 1 })
            .await
            .context("store is unreachable")?;
        Ok(Self { db })
    }

    pub fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection(name)
    }

    pub async fn exists(&self, collection: &str, filter: Document) -> Result<bool> {
        let found = self
            .collection(collection)
            .find_one(filter)
            .projection(doc! { "_id": 1 })
            .await?;
        Ok(found.is_some())
    }

    /// Insert one document. Returns false when the key already exists.
    pub async fn insert(&self, collection: &str, document: Document) -> Result<bool> {
        match self.collection(collection).insert_one(document).await {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Unordered bulk insert: every document is attempted, per-document
    /// duplicates are logged and skipped.
    pub async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        match self
            .collection(collection)
            .insert_many(documents)
            .ordered(false)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, collection, "bulk insert reported write errors");
                Ok(())
            }
        }
    }

    /// Append items to a set-valued field, creating the document if needed.
    /// The store's add-to-set semantics suppress duplicates by value.
    pub async fn upsert_append(
        &self,
        collection: &str,
        key: Bson,
        field: &str,
        items: Vec<Document>,
    ) -> Result<()> {
        self.collection(collection)
            .update_one(
                doc! { "_id": key },
                doc! { "$addToSet": { field: { "$each": items } } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    pub async fn find(
        &self,
        collection: &str,
        filter: Document,
        projection: Document,
    ) -> Result<Vec<Document>> {
        let mut cursor = self
            .collection(collection)
            .find(filter)
            .projection(projection)
            .await?;
        let mut out = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            out.push(document);
        }
        Ok(out)
    }

    pub async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        projection: Document,
    ) -> Result<Option<Document>> {
        let found = self
            .collection(collection)
            .find_one(filter)
            .projection(projection)
            .await?;
        Ok(found)
    }

    /// Run an aggregation with a hard server-side time budget and no disk
    /// spill, the sandbox constraints user filters execute under.
    pub async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        time_budget: Duration,
    ) -> Result<Vec<Document>> {
        let options = AggregateOptions::builder()
            .allow_disk_use(false)
            .max_time(time_budget)
            .build();
        let mut cursor = self
            .collection(collection)
            .aggregate(pipeline)
            .with_options(options)
            .await?;
        let mut out = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            out.push(document);
        }
        Ok(out)
    }

    pub async fn create_index(
        &self,
        collection: &str,
        name: &str,
        keys: &[(String, i32)],
    ) -> Result<()> {
        let mut key_doc = Document::new();
        for (field, direction) in keys {
            key_doc.insert(field.clone(), *direction);
        }
        let model = IndexModel::builder()
            .keys(key_doc)
            .options(
                IndexOptions::builder()
                    .name(name.to_string())
                    .background(true)
                    .build(),
            )
            .build();
        self.collection(collection)
            .create_index(model)
            .await
            .with_context(|| format!("failed to create index {name} on {collection}"))?;
        Ok(())
    }
}

/// E11000 duplicate key, the one write error ingestion treats as success.
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    if let mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(write_error)) =
        &*err.kind
    {
        return write_error.code == 11000;
    }
    false
}

//! Vector store gateway.
//!
//! The [`VectorStore`] trait covers the three operations the pipeline
//! needs: make sure a collection exists with the right dimensionality,
//! upsert a batch of points, and delete points by payload filter.
//!
//! | Implementation | Backend |
//! |----------------|---------|
//! | [`QdrantStore`] | Qdrant REST API |
//! | [`InMemoryVectorStore`] | `HashMap` behind a `RwLock`, for tests and dry runs |

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::config::VectorStoreConfig;
use crate::error::{transport_message, VectorStoreError};
use crate::models::VectorPoint;

/// Exact-match condition on a payload field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    pub key: String,
    pub value: String,
}

/// Conjunction of `must` matches and negated `must_not` matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorFilter {
    pub must: Vec<FieldMatch>,
    pub must_not: Vec<FieldMatch>,
}

impl VectorFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must(mut self, key: &str, value: &str) -> Self {
        self.must.push(FieldMatch {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn must_not(mut self, key: &str, value: &str) -> Self {
        self.must_not.push(FieldMatch {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn matches(&self, payload: &serde_json::Map<String, Value>) -> bool {
        let field_eq = |m: &FieldMatch| payload.get(&m.key).and_then(Value::as_str) == Some(m.value.as_str());
        self.must.iter().all(field_eq) && !self.must_not.iter().any(field_eq)
    }

    /// Qdrant filter JSON.
    pub fn to_qdrant(&self) -> Value {
        let conditions = |matches: &[FieldMatch]| -> Vec<Value> {
            matches
                .iter()
                .map(|m| json!({ "key": m.key, "match": { "value": m.value } }))
                .collect()
        };
        json!({
            "must": conditions(&self.must),
            "must_not": conditions(&self.must_not),
        })
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create `name` with `vector_size` dimensions if absent. Succeeds
    /// without changes when it exists with the same size.
    async fn ensure_collection(&self, name: &str, vector_size: usize)
        -> Result<(), VectorStoreError>;

    /// Write all points or none.
    async fn upsert(&self, collection: &str, points: &[VectorPoint])
        -> Result<(), VectorStoreError>;

    /// Delete every point matching `filter`. Returns how many were deleted.
    async fn delete_by_filter(
        &self,
        collection: &str,
        filter: &VectorFilter,
    ) -> Result<u64, VectorStoreError>;

    /// Count points matching `filter`. A missing collection counts zero.
    async fn count(&self, collection: &str, filter: &VectorFilter)
        -> Result<u64, VectorStoreError>;
}

// ============ Qdrant ============

/// Gateway to a Qdrant server over its REST API.
pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl QdrantStore {
    pub fn new(config: &VectorStoreConfig) -> Self {
        let api_key = config
            .api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());

        Self {
            client: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(u16, Value), VectorStoreError> {
        let resp = req.send().await.map_err(map_transport)?;
        let status = resp.status().as_u16();
        if status == 404 {
            return Ok((status, Value::Null));
        }
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VectorStoreError::Api { status, body });
        }
        let body = resp
            .json::<Value>()
            .await
            .map_err(|e| VectorStoreError::InvalidResponse(e.to_string()))?;
        Ok((status, body))
    }

    /// Vector size of an existing collection, or `None` if it doesn't exist.
    async fn collection_size(&self, name: &str) -> Result<Option<usize>, VectorStoreError> {
        let (status, body) = self
            .send(self.request(reqwest::Method::GET, &format!("/collections/{}", name)))
            .await?;
        if status == 404 {
            return Ok(None);
        }
        body.pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .map(|s| Some(s as usize))
            .ok_or_else(|| VectorStoreError::InvalidResponse("collection without vector size".into()))
    }

    fn check_size(name: &str, expected: usize, actual: usize) -> Result<(), VectorStoreError> {
        if expected == actual {
            Ok(())
        } else {
            Err(VectorStoreError::DimensionMismatch {
                collection: name.to_string(),
                expected,
                actual,
            })
        }
    }
}

fn map_transport(err: reqwest::Error) -> VectorStoreError {
    match transport_message(&err) {
        Some(msg) => VectorStoreError::Transport(msg),
        None => VectorStoreError::InvalidResponse(err.to_string()),
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(
        &self,
        name: &str,
        vector_size: usize,
    ) -> Result<(), VectorStoreError> {
        if let Some(size) = self.collection_size(name).await? {
            return Self::check_size(name, vector_size, size);
        }

        let body = json!({ "vectors": { "size": vector_size, "distance": "Cosine" } });
        let created = self
            .send(
                self.request(reqwest::Method::PUT, &format!("/collections/{}", name))
                    .json(&body),
            )
            .await;

        match created {
            Ok(_) => {
                tracing::info!(collection = name, vector_size, "created vector collection");
                Ok(())
            }
            // Another worker created it first
            Err(VectorStoreError::Api { status: 409, .. }) => match self.collection_size(name).await? {
                Some(size) => Self::check_size(name, vector_size, size),
                None => Err(VectorStoreError::InvalidResponse(format!(
                    "collection {} reported as existing but not found",
                    name
                ))),
            },
            Err(e) => Err(e),
        }
    }

    async fn upsert(
        &self,
        collection: &str,
        points: &[VectorPoint],
    ) -> Result<(), VectorStoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let (status, _) = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    &format!("/collections/{}/points?wait=true", collection),
                )
                .json(&json!({ "points": points })),
            )
            .await?;
        if status == 404 {
            return Err(VectorStoreError::Api {
                status,
                body: format!("collection {} not found", collection),
            });
        }
        Ok(())
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        filter: &VectorFilter,
    ) -> Result<u64, VectorStoreError> {
        let matching = self.count(collection, filter).await?;
        if matching == 0 {
            return Ok(0);
        }
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/delete?wait=true", collection),
            )
            .json(&json!({ "filter": filter.to_qdrant() })),
        )
        .await?;
        Ok(matching)
    }

    async fn count(
        &self,
        collection: &str,
        filter: &VectorFilter,
    ) -> Result<u64, VectorStoreError> {
        let (status, body) = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{}/points/count", collection),
                )
                .json(&json!({ "filter": filter.to_qdrant(), "exact": true })),
            )
            .await?;
        if status == 404 {
            return Ok(0);
        }
        body.pointer("/result/count")
            .and_then(Value::as_u64)
            .ok_or_else(|| VectorStoreError::InvalidResponse("missing result.count".into()))
    }
}

// ============ In-memory ============

struct Collection {
    vector_size: usize,
    points: HashMap<String, VectorPoint>,
}

/// In-memory vector store for tests.
///
/// `fail_upserts` / `fail_deletes` make the next calls fail with an API
/// error so failure paths of the pipeline can be exercised.
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
    fail_upserts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            fail_upserts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of all points in `collection` matching `filter`.
    pub fn points(&self, collection: &str, filter: &VectorFilter) -> Vec<VectorPoint> {
        let collections = self.collections.read().unwrap_or_else(|p| p.into_inner());
        collections
            .get(collection)
            .map(|c| {
                c.points
                    .values()
                    .filter(|p| filter.matches(&p.payload))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn vector_size(&self, collection: &str) -> Option<usize> {
        let collections = self.collections.read().unwrap_or_else(|p| p.into_inner());
        collections.get(collection).map(|c| c.vector_size)
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(
        &self,
        name: &str,
        vector_size: usize,
    ) -> Result<(), VectorStoreError> {
        let mut collections = self.collections.write().unwrap_or_else(|p| p.into_inner());
        let collection = collections
            .entry(name.to_string())
            .or_insert_with(|| Collection {
                vector_size,
                points: HashMap::new(),
            });
        QdrantStore::check_size(name, vector_size, collection.vector_size)
    }

    async fn upsert(
        &self,
        collection: &str,
        points: &[VectorPoint],
    ) -> Result<(), VectorStoreError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(VectorStoreError::Api {
                status: 500,
                body: "injected upsert failure".into(),
            });
        }
        let mut collections = self.collections.write().unwrap_or_else(|p| p.into_inner());
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| VectorStoreError::Api {
                status: 404,
                body: format!("collection {} not found", collection),
            })?;
        if let Some(bad) = points.iter().find(|p| p.vector.len() != target.vector_size) {
            return Err(VectorStoreError::DimensionMismatch {
                collection: collection.to_string(),
                expected: target.vector_size,
                actual: bad.vector.len(),
            });
        }
        for point in points {
            target.points.insert(point.id.clone(), point.clone());
        }
        Ok(())
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        filter: &VectorFilter,
    ) -> Result<u64, VectorStoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(VectorStoreError::Transport("injected delete failure".into()));
        }
        let mut collections = self.collections.write().unwrap_or_else(|p| p.into_inner());
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = target.points.len();
        target.points.retain(|_, p| !filter.matches(&p.payload));
        Ok((before - target.points.len()) as u64)
    }

    async fn count(
        &self,
        collection: &str,
        filter: &VectorFilter,
    ) -> Result<u64, VectorStoreError> {
        Ok(self.points(collection, filter).len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, doc: &str, rev: &str) -> VectorPoint {
        let mut payload = serde_json::Map::new();
        payload.insert("document_id".into(), json!(doc));
        payload.insert("revision_id".into(), json!(rev));
        VectorPoint {
            id: id.to_string(),
            vector: vec![0.1, 0.2],
            payload,
        }
    }

    #[test]
    fn filter_must_and_must_not() {
        let filter = VectorFilter::new()
            .must("document_id", "d1")
            .must_not("revision_id", "r2");
        assert!(filter.matches(&point("1", "d1", "r1").payload));
        assert!(!filter.matches(&point("2", "d1", "r2").payload));
        assert!(!filter.matches(&point("3", "d2", "r1").payload));
    }

    #[test]
    fn filter_serializes_to_qdrant_shape() {
        let filter = VectorFilter::new().must("document_id", "d1");
        assert_eq!(
            filter.to_qdrant(),
            json!({
                "must": [{ "key": "document_id", "match": { "value": "d1" } }],
                "must_not": []
            })
        );
    }

    #[tokio::test]
    async fn memory_store_rejects_dimension_change() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store.ensure_collection("c", 2).await.unwrap();
        let err = store.ensure_collection("c", 3).await.unwrap_err();
        assert!(matches!(err, VectorStoreError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn memory_store_delete_by_filter() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert("c", &[point("1", "d1", "r1"), point("2", "d1", "r2"), point("3", "d2", "r1")])
            .await
            .unwrap();
        let filter = VectorFilter::new()
            .must("document_id", "d1")
            .must_not("revision_id", "r2");
        assert_eq!(store.delete_by_filter("c", &filter).await.unwrap(), 1);
        assert_eq!(store.count("c", &VectorFilter::new()).await.unwrap(), 2);
        assert_eq!(store.delete_by_filter("missing", &filter).await.unwrap(), 0);
    }
}

//! Qdrant-backed [`VectorStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance, FieldType, Filter, GetPointsBuilder, PointId, PointStruct,
    RetrievedPoint, ScalarQuantizationBuilder, ScoredPoint, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder, point_id::PointIdOptions, value::Kind,
    vectors_output::VectorsOptions,
};

use crate::vector_store::{
    BoxFuture, CHUNK_ID_KEY, FILE_PATH_KEY, ScoredVectorPoint, VectorPoint, VectorStore,
    VectorStoreError,
};

type QdrantResult<T> = Result<T, Box<qdrant_client::QdrantError>>;

/// Payload fields indexed as keywords on collection creation.
const KEYWORD_INDEXES: &[&str] = &[FILE_PATH_KEY, "language", "kind"];

/// Thin wrapper over [`Qdrant`] implementing the chunk vector store.
#[derive(Clone)]
pub struct QdrantOps {
    client: Qdrant,
    writes: Arc<AtomicU64>,
}

impl std::fmt::Debug for QdrantOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantOps").finish_non_exhaustive()
    }
}

impl QdrantOps {
    /// Create a new `QdrantOps` connected to the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the Qdrant client cannot be created.
    pub fn new(url: &str) -> QdrantResult<Self> {
        let client = Qdrant::from_url(url).build().map_err(Box::new)?;
        Ok(Self {
            client,
            writes: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Create the collection with cosine distance and keyword payload indexes.
    ///
    /// No-op if the collection already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if Qdrant cannot be reached or collection creation fails.
    pub async fn create_if_missing(&self, collection: &str, vector_size: u64) -> QdrantResult<()> {
        if self
            .client
            .collection_exists(collection)
            .await
            .map_err(Box::new)?
        {
            return Ok(());
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(vector_size, Distance::Cosine))
                    .quantization_config(ScalarQuantizationBuilder::default()),
            )
            .await
            .map_err(Box::new)?;
        for field in KEYWORD_INDEXES {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    collection,
                    *field,
                    FieldType::Keyword,
                ))
                .await
                .map_err(Box::new)?;
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> QdrantResult<()> {
        self.client
            .delete_collection(collection)
            .await
            .map_err(Box::new)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert_points(&self, collection: &str, points: Vec<PointStruct>) -> QdrantResult<()> {
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await
            .map_err(Box::new)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_file_points(&self, collection: &str, path: &str) -> QdrantResult<()> {
        let filter = Filter::must([Condition::matches(FILE_PATH_KEY, path.to_owned())]);
        self.client
            .delete_points(DeletePointsBuilder::new(collection).points(filter).wait(true))
            .await
            .map_err(Box::new)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search_points(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
    ) -> QdrantResult<Vec<ScoredPoint>> {
        let builder = SearchPointsBuilder::new(collection, vector, limit).with_payload(true);
        let results = self.client.search_points(builder).await.map_err(Box::new)?;
        Ok(results.result)
    }

    async fn get_points(&self, collection: &str, ids: Vec<String>) -> QdrantResult<Vec<RetrievedPoint>> {
        let ids: Vec<PointId> = ids.into_iter().map(PointId::from).collect();
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(collection, ids)
                    .with_vectors(true)
                    .with_payload(true),
            )
            .await
            .map_err(Box::new)?;
        Ok(response.result)
    }

    async fn count_points(&self, collection: &str) -> QdrantResult<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(collection).exact(true))
            .await
            .map_err(Box::new)?;
        Ok(response.result.map_or(0, |r| r.count))
    }
}

impl VectorStore for QdrantOps {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.create_if_missing(&collection, vector_size)
                .await
                .map_err(|e| VectorStoreError::Collection(e.to_string()))
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.client
                .collection_exists(&collection)
                .await
                .map_err(|e| VectorStoreError::Connection(e.to_string()))
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.drop_collection(&collection)
                .await
                .map_err(|e| VectorStoreError::Collection(e.to_string()))
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            if points.is_empty() {
                return Ok(());
            }
            let mut qdrant_points = Vec::with_capacity(points.len());
            for p in points {
                let payload: HashMap<String, qdrant_client::qdrant::Value> =
                    serde_json::from_value(serde_json::Value::Object(
                        p.payload.into_iter().collect(),
                    ))
                    .map_err(|e| VectorStoreError::Serialization(e.to_string()))?;
                qdrant_points.push(PointStruct::new(p.id, p.vector, payload));
            }
            self.upsert_points(&collection, qdrant_points)
                .await
                .map_err(|e| VectorStoreError::Upsert(e.to_string()))
        })
    }

    fn delete_by_file(
        &self,
        collection: &str,
        path: &str,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        let path = path.to_owned();
        Box::pin(async move {
            self.delete_file_points(&collection, &path)
                .await
                .map_err(|e| VectorStoreError::Delete(e.to_string()))
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let results = self
                .search_points(&collection, vector, limit)
                .await
                .map_err(|e| VectorStoreError::Search(e.to_string()))?;
            Ok(results.into_iter().map(scored_point_to_vector).collect())
        })
    }

    fn fetch_vectors(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<HashMap<String, Vec<f32>>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(HashMap::new());
            }
            let points = self
                .get_points(&collection, ids)
                .await
                .map_err(|e| VectorStoreError::Fetch(e.to_string()))?;
            Ok(points.into_iter().filter_map(retrieved_vector).collect())
        })
    }

    fn count(&self, collection: &str) -> BoxFuture<'_, Result<u64, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.count_points(&collection)
                .await
                .map_err(|e| VectorStoreError::Collection(e.to_string()))
        })
    }

    fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

fn point_id_string(id: Option<PointId>) -> String {
    match id.and_then(|pid| pid.point_id_options) {
        Some(PointIdOptions::Uuid(u)) => u,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

fn payload_to_json(
    payload: HashMap<String, qdrant_client::qdrant::Value>,
) -> HashMap<String, serde_json::Value> {
    payload
        .into_iter()
        .filter_map(|(k, v)| {
            let json_val = match v.kind? {
                Kind::StringValue(s) => serde_json::Value::String(s),
                Kind::IntegerValue(i) => serde_json::Value::Number(i.into()),
                Kind::DoubleValue(d) => {
                    serde_json::Number::from_f64(d).map(serde_json::Value::Number)?
                }
                Kind::BoolValue(b) => serde_json::Value::Bool(b),
                _ => return None,
            };
            Some((k, json_val))
        })
        .collect()
}

fn scored_point_to_vector(point: ScoredPoint) -> ScoredVectorPoint {
    let payload = payload_to_json(point.payload);
    let id = payload
        .get(CHUNK_ID_KEY)
        .and_then(|v| v.as_str())
        .map_or_else(|| point_id_string(point.id), str::to_owned);
    ScoredVectorPoint {
        id,
        score: point.score,
        payload,
    }
}

fn retrieved_vector(point: RetrievedPoint) -> Option<(String, Vec<f32>)> {
    let id = point
        .payload
        .get(CHUNK_ID_KEY)
        .and_then(qdrant_client::qdrant::Value::as_str)
        .cloned()
        .unwrap_or_else(|| point_id_string(point.id));
    match point.vectors?.vectors_options? {
        VectorsOptions::Vector(v) => {
            #[allow(deprecated)]
            let data = v.data;
            Some((id, data))
        }
        VectorsOptions::Vectors(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_valid_url() {
        let ops = QdrantOps::new("http://localhost:6334");
        assert!(ops.is_ok());
    }

    #[test]
    fn new_invalid_url() {
        let ops = QdrantOps::new("not a valid url");
        assert!(ops.is_err());
    }

    #[test]
    fn debug_format() {
        let ops = QdrantOps::new("http://localhost:6334").unwrap();
        let dbg = format!("{ops:?}");
        assert!(dbg.contains("QdrantOps"));
    }

    #[test]
    fn fresh_handle_has_no_writes() {
        let ops = QdrantOps::new("http://localhost:6334").unwrap();
        assert_eq!(ops.write_count(), 0);
    }

    #[test]
    fn point_id_uuid_and_num() {
        let uuid = "8c3f4a7e-0000-5000-8000-000000000001";
        assert_eq!(point_id_string(Some(PointId::from(uuid.to_owned()))), uuid);
        assert_eq!(point_id_string(Some(PointId::from(7u64))), "7");
        assert_eq!(point_id_string(None), "");
    }

    #[test]
    fn scored_point_prefers_payload_chunk_id() {
        let payload: HashMap<String, qdrant_client::qdrant::Value> =
            serde_json::from_value(serde_json::json!({
                "chunk_id": "abc",
                "file_path": "a.py",
                "start_line": 3,
            }))
            .unwrap();
        let point = ScoredPoint {
            id: Some(PointId::from(1u64)),
            payload,
            score: 0.5,
            ..ScoredPoint::default()
        };
        let converted = scored_point_to_vector(point);
        assert_eq!(converted.id, "abc");
        assert_eq!(converted.payload["file_path"], serde_json::json!("a.py"));
        assert_eq!(converted.payload["start_line"], serde_json::json!(3));
    }
}

//! Self-hosted face recognition on top of an InsightFace embedding service.
//!
//! The service only detects faces and computes embeddings. Collections,
//! users and face associations are kept by [`LocalFaceProvider`] itself and
//! identification is a cosine-similarity search over the associated
//! embeddings. A detection token carries its own embedding, so nothing is
//! held between a detect call and the identify call that uses it.

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::http;
use super::model::{Candidate, NormalizedBox};
use super::provider::{DetectedFace, FaceProvider, IdentifyResult};
use crate::config::FacesConfig;
use crate::error::ProviderError;
use crate::photo::image_dimensions;

/// A face found by the embedding service.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedFace {
    pub score: Option<f32>,
    /// `[x1, y1, x2, y2]` in pixels of the submitted image.
    pub bbox: Option<[f32; 4]>,
    pub age: Option<f32>,
    pub gender: Option<String>,
    pub embedding: Vec<f32>,
}

/// Detection and embedding backend.
#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn detect(&self, image: &[u8], cancel: &CancellationToken) -> Result<Vec<EmbeddedFace>, ProviderError>;

    /// Embedding of a pre-cropped face.
    async fn embed(&self, image: &[u8], cancel: &CancellationToken) -> Result<Vec<f32>, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<DetectResponseFace>,
}

#[derive(Debug, Deserialize)]
struct DetectResponseFace {
    score: Option<f32>,
    bbox: Option<Vec<f32>>,
    age: Option<f32>,
    gender: Option<String>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// HTTP client for the InsightFace service (`/detect`, `/embed`).
pub struct InsightFaceClient {
    endpoint: String,
    timeout: Duration,
    agent: ureq::Agent,
}

impl InsightFaceClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
            agent,
        }
    }

    async fn post_image<T>(
        &self,
        path: &'static str,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        let url = format!("{}{}", self.endpoint, path);
        let agent = self.agent.clone();
        let (content_type, body) = http::multipart_file("file", "face.jpg", image);

        http::call(self.timeout, cancel, move || {
            let response = agent
                .post(&url)
                .set("Content-Type", &content_type)
                .send_bytes(&body)
                .map_err(http::classify)?;
            http::read_json(response)
        })
        .await
    }
}

#[async_trait]
impl FaceEmbedder for InsightFaceClient {
    async fn detect(&self, image: &[u8], cancel: &CancellationToken) -> Result<Vec<EmbeddedFace>, ProviderError> {
        let response: DetectResponse = self
            .post_image("/detect?include_embeddings=true", image, cancel)
            .await?;

        Ok(response
            .faces
            .into_iter()
            .filter_map(|f| {
                let embedding = f.embedding.filter(|e| !e.is_empty())?;
                let bbox = f
                    .bbox
                    .filter(|b| b.len() == 4)
                    .map(|b| [b[0], b[1], b[2], b[3]]);
                Some(EmbeddedFace {
                    score: f.score,
                    bbox,
                    age: f.age,
                    gender: f.gender,
                    embedding,
                })
            })
            .collect())
    }

    async fn embed(&self, image: &[u8], cancel: &CancellationToken) -> Result<Vec<f32>, ProviderError> {
        let response: EmbedResponse = self.post_image("/embed", image, cancel).await?;
        Ok(response.embedding)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedFace {
    user_key: Option<String>,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Collection {
    users: BTreeMap<String, Vec<String>>,
    faces: BTreeMap<String, IndexedFace>,
}

/// Collection state as written to disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    collection: Option<Collection>,
}

pub struct LocalFaceProvider {
    embedder: Arc<dyn FaceEmbedder>,
    collection: RwLock<Option<Collection>>,
    match_threshold: f64,
    max_candidates: usize,
    snapshot_path: Option<PathBuf>,
}

impl LocalFaceProvider {
    pub fn new(embedder: Arc<dyn FaceEmbedder>, config: &FacesConfig) -> Self {
        Self {
            embedder,
            collection: RwLock::new(None),
            match_threshold: config.match_threshold,
            max_candidates: config.max_candidates.max(1),
            snapshot_path: None,
        }
    }

    /// Keep the collection in `path`, loading what is already there.
    pub fn with_snapshot(mut self, path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading face collection {}", path.display()))?;
            let snapshot: Snapshot = serde_json::from_str(&content)
                .with_context(|| format!("parsing face collection {}", path.display()))?;
            if let Some(collection) = &snapshot.collection {
                info!(
                    path = %path.display(),
                    users = collection.users.len(),
                    faces = collection.faces.len(),
                    "Loaded local face collection"
                );
            }
            self.collection = RwLock::new(snapshot.collection);
        }
        self.snapshot_path = Some(path.to_path_buf());
        Ok(self)
    }

    async fn persist(&self) -> Result<(), ProviderError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let content = {
            let guard = self.collection.read().await;
            let snapshot = Snapshot {
                collection: guard.clone(),
            };
            serde_json::to_vec(&snapshot)
                .map_err(|e| ProviderError::Permanent(format!("serializing collection: {e}")))?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::Transient(format!("writing {}: {e}", path.display())))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ProviderError::Transient(format!("writing {}: {e}", path.display())))
    }

    fn missing_collection() -> ProviderError {
        ProviderError::Permanent("collection does not exist".to_string())
    }

    fn rank_candidates(&self, collection: &Collection, query: &[f32]) -> Vec<Candidate> {
        let mut best: BTreeMap<&str, f32> = BTreeMap::new();
        for face in collection.faces.values() {
            let Some(user_key) = face.user_key.as_deref() else {
                continue;
            };
            let similarity = cosine_similarity(query, &face.embedding);
            let entry = best.entry(user_key).or_insert(f32::MIN);
            if similarity > *entry {
                *entry = similarity;
            }
        }

        let mut ranked: Vec<Candidate> = best
            .into_iter()
            .filter(|(_, score)| f64::from(*score) >= self.match_threshold)
            .map(|(user_key, score)| Candidate::new(user_key, f64::from(score)))
            .collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        ranked.truncate(self.max_candidates);
        ranked
    }
}

#[async_trait]
impl FaceProvider for LocalFaceProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn detect_faces(
        &self,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        let found = self.embedder.detect(image, cancel).await?;
        let dimensions = image_dimensions(image);

        let faces = found
            .into_iter()
            .map(|face| DetectedFace {
                token: encode_token(&normalize(&face.embedding)),
                confidence: face.score,
                bbox: face.bbox.zip(dimensions).map(|(b, (w, h))| pixel_box(b, w, h)),
                age: face.age,
                gender: face.gender,
            })
            .collect::<Vec<_>>();
        debug!(faces = faces.len(), "Local detection finished");
        Ok(faces)
    }

    async fn identify(
        &self,
        tokens: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<IdentifyResult>, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let queries = tokens
            .iter()
            .map(|token| decode_token(token).map(|embedding| (token.clone(), embedding)))
            .collect::<Result<Vec<_>, _>>()?;

        // Nothing has been enrolled yet, so no face can match.
        let guard = self.collection.read().await;
        let Some(collection) = guard.as_ref() else {
            debug!(faces = queries.len(), "No local collection yet, nothing to match against");
            return Ok(queries
                .into_iter()
                .map(|(token, _)| IdentifyResult {
                    token,
                    candidates: Vec::new(),
                })
                .collect());
        };
        Ok(queries
            .into_iter()
            .map(|(token, query)| IdentifyResult {
                candidates: self.rank_candidates(collection, &query),
                token,
            })
            .collect())
    }

    async fn collection_exists(&self, _cancel: &CancellationToken) -> Result<bool, ProviderError> {
        Ok(self.collection.read().await.is_some())
    }

    async fn create_collection(&self, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        {
            let mut guard = self.collection.write().await;
            if guard.is_none() {
                *guard = Some(Collection::default());
            }
        }
        self.persist().await
    }

    async fn delete_collection(&self, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        *self.collection.write().await = None;
        self.persist().await
    }

    async fn list_users(&self, _cancel: &CancellationToken) -> Result<Vec<String>, ProviderError> {
        let guard = self.collection.read().await;
        let collection = guard.as_ref().ok_or_else(Self::missing_collection)?;
        Ok(collection.users.keys().cloned().collect())
    }

    async fn create_user(&self, user_key: &str, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        {
            let mut guard = self.collection.write().await;
            let collection = guard.as_mut().ok_or_else(Self::missing_collection)?;
            collection.users.entry(user_key.to_string()).or_default();
        }
        self.persist().await
    }

    async fn delete_user(&self, user_key: &str, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        {
            let mut guard = self.collection.write().await;
            let collection = guard.as_mut().ok_or_else(Self::missing_collection)?;
            let Some(face_ids) = collection.users.remove(user_key) else {
                return Err(ProviderError::Permanent(format!("user {user_key} does not exist")));
            };
            for face_id in face_ids {
                collection.faces.remove(&face_id);
            }
        }
        self.persist().await
    }

    async fn list_faces(
        &self,
        user_key: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProviderError> {
        let guard = self.collection.read().await;
        let collection = guard.as_ref().ok_or_else(Self::missing_collection)?;
        collection
            .users
            .get(user_key)
            .cloned()
            .ok_or_else(|| ProviderError::Permanent(format!("user {user_key} does not exist")))
    }

    async fn index_face(
        &self,
        user_key: &str,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        if !self.collection_exists(cancel).await? {
            return Err(Self::missing_collection());
        }
        let embedding = self.embedder.embed(image, cancel).await?;
        if embedding.is_empty() {
            warn!(user_key, "Embedding service returned an empty vector");
            return Ok(None);
        }

        let face_id = format!("local:{}", Uuid::new_v4());
        {
            let mut guard = self.collection.write().await;
            let collection = guard.as_mut().ok_or_else(Self::missing_collection)?;
            collection.faces.insert(
                face_id.clone(),
                IndexedFace {
                    user_key: None,
                    embedding: normalize(&embedding),
                },
            );
        }
        Ok(Some(face_id))
    }

    async fn associate_faces(
        &self,
        user_key: &str,
        face_ids: &[String],
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        {
            let mut guard = self.collection.write().await;
            let collection = guard.as_mut().ok_or_else(Self::missing_collection)?;
            if !collection.users.contains_key(user_key) {
                return Err(ProviderError::Permanent(format!("user {user_key} does not exist")));
            }
            for face_id in face_ids {
                let face = collection
                    .faces
                    .get_mut(face_id)
                    .ok_or_else(|| ProviderError::Permanent(format!("face {face_id} was never indexed")))?;
                if let Some(previous) = face.user_key.replace(user_key.to_string()) {
                    if let Some(ids) = collection.users.get_mut(&previous) {
                        ids.retain(|id| id != face_id);
                    }
                }
                if let Some(ids) = collection.users.get_mut(user_key) {
                    if !ids.contains(face_id) {
                        ids.push(face_id.clone());
                    }
                }
            }
        }
        self.persist().await
    }
}

fn pixel_box(b: [f32; 4], width: u32, height: u32) -> NormalizedBox {
    let w = width.max(1) as f32;
    let h = height.max(1) as f32;
    NormalizedBox {
        left: b[0] / w,
        top: b[1] / h,
        width: (b[2] - b[0]) / w,
        height: (b[3] - b[1]) / h,
    }
}

/// Detection token for an embedding: its little-endian f32 bytes in base64.
fn encode_token(embedding: &[f32]) -> String {
    let bytes: Vec<u8> = embedding.iter().flat_map(|x| x.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

fn decode_token(token: &str) -> Result<Vec<f32>, ProviderError> {
    let malformed = || ProviderError::Permanent(format!("malformed face token {token}"));
    let bytes = STANDARD.decode(token).map_err(|_| malformed())?;
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(malformed());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    v.iter().map(|x| x / norm).collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Embedder that reads the vector straight out of the "image" bytes:
    /// each byte is one dimension.
    pub(crate) struct ByteEmbedder;

    #[async_trait]
    impl FaceEmbedder for ByteEmbedder {
        async fn detect(&self, image: &[u8], _cancel: &CancellationToken) -> Result<Vec<EmbeddedFace>, ProviderError> {
            if image.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![EmbeddedFace {
                score: Some(0.99),
                bbox: None,
                age: None,
                gender: None,
                embedding: image.iter().map(|b| f32::from(*b)).collect(),
            }])
        }

        async fn embed(&self, image: &[u8], _cancel: &CancellationToken) -> Result<Vec<f32>, ProviderError> {
            Ok(image.iter().map(|b| f32::from(*b)).collect())
        }
    }

    fn provider() -> LocalFaceProvider {
        LocalFaceProvider::new(Arc::new(ByteEmbedder), &FacesConfig::default())
    }

    async fn enrol(p: &LocalFaceProvider, user: &str, sample: &[u8]) -> String {
        let cancel = CancellationToken::new();
        p.create_user(user, &cancel).await.unwrap();
        let id = p.index_face(user, sample, &cancel).await.unwrap().unwrap();
        p.associate_faces(user, &[id.clone()], &cancel).await.unwrap();
        id
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_operations_need_a_collection() {
        let p = provider();
        let cancel = CancellationToken::new();
        assert!(!p.collection_exists(&cancel).await.unwrap());
        assert!(matches!(p.list_users(&cancel).await, Err(ProviderError::Permanent(_))));

        p.create_collection(&cancel).await.unwrap();
        p.create_collection(&cancel).await.unwrap();
        assert!(p.list_users(&cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identify_ranks_users_above_threshold() {
        let p = provider();
        let cancel = CancellationToken::new();
        p.create_collection(&cancel).await.unwrap();
        enrol(&p, "1", &[10, 0, 0]).await;
        enrol(&p, "2", &[7, 7, 0]).await;
        enrol(&p, "3", &[0, 0, 10]).await;

        let detected = p.detect_faces(&[10, 1, 0], &cancel).await.unwrap();
        assert_eq!(detected.len(), 1);

        let results = p.identify(&[detected[0].token.clone()], &cancel).await.unwrap();
        let keys: Vec<_> = results[0].candidates.iter().map(|c| c.user_key.as_str()).collect();
        assert_eq!(keys, vec!["1", "2"]);
        assert!(results[0].candidates[0].confidence > 0.99);
    }

    #[tokio::test]
    async fn test_token_needs_no_provider_state() {
        let cancel = CancellationToken::new();
        let detector = provider();
        let detected = detector.detect_faces(&[10, 1, 0], &cancel).await.unwrap();
        drop(detector);

        let p = provider();
        p.create_collection(&cancel).await.unwrap();
        enrol(&p, "1", &[10, 0, 0]).await;

        let tokens = vec![detected[0].token.clone()];
        for _ in 0..2 {
            let results = p.identify(&tokens, &cancel).await.unwrap();
            assert_eq!(results[0].token, tokens[0]);
            assert_eq!(results[0].candidates[0].user_key, "1");
        }
    }

    #[tokio::test]
    async fn test_malformed_token_is_rejected() {
        let p = provider();
        let cancel = CancellationToken::new();
        p.create_collection(&cancel).await.unwrap();

        for token in ["not base64!", "", "AAA="] {
            let result = p.identify(&[token.to_string()], &cancel).await;
            assert!(matches!(result, Err(ProviderError::Permanent(_))), "{token:?}");
        }
    }

    #[tokio::test]
    async fn test_identify_without_collection_finds_nobody() {
        let p = provider();
        let cancel = CancellationToken::new();
        let detected = p.detect_faces(&[1, 2, 3], &cancel).await.unwrap();

        let results = p.identify(&[detected[0].token.clone()], &cancel).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].candidates.is_empty());
        assert!(!p.collection_exists(&cancel).await.unwrap());
    }

    #[test]
    fn test_token_round_trips_embedding() {
        let embedding = vec![0.6, -0.8, 0.0];
        assert_eq!(decode_token(&encode_token(&embedding)).unwrap(), embedding);
    }

    #[tokio::test]
    async fn test_unassociated_faces_do_not_match() {
        let p = provider();
        let cancel = CancellationToken::new();
        p.create_collection(&cancel).await.unwrap();
        p.create_user("1", &cancel).await.unwrap();
        p.index_face("1", &[5, 5], &cancel).await.unwrap();

        let detected = p.detect_faces(&[5, 5], &cancel).await.unwrap();
        let results = p.identify(&[detected[0].token.clone()], &cancel).await.unwrap();
        assert!(results[0].candidates.is_empty());
        assert!(p.list_faces("1", &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_user_drops_faces() {
        let p = provider();
        let cancel = CancellationToken::new();
        p.create_collection(&cancel).await.unwrap();
        enrol(&p, "1", &[3, 4]).await;

        p.delete_user("1", &cancel).await.unwrap();
        assert!(p.list_users(&cancel).await.unwrap().is_empty());
        assert!(p.collection.read().await.as_ref().unwrap().faces.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("faces").join("collection.json");
        let cancel = CancellationToken::new();

        let p = provider().with_snapshot(&path).unwrap();
        p.create_collection(&cancel).await.unwrap();
        let face_id = enrol(&p, "8", &[1, 1]).await;
        drop(p);

        let p = provider().with_snapshot(&path).unwrap();
        assert_eq!(p.list_users(&cancel).await.unwrap(), vec!["8".to_string()]);
        assert_eq!(p.list_faces("8", &cancel).await.unwrap(), vec![face_id]);
    }

    #[test]
    fn test_pixel_box_normalizes() {
        let b = pixel_box([10.0, 20.0, 60.0, 120.0], 100, 200);
        assert_eq!(b.left, 0.1);
        assert_eq!(b.top, 0.1);
        assert_eq!(b.width, 0.5);
        assert_eq!(b.height, 0.5);
    }
}

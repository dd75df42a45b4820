//! Azure Face person-group provider.
//!
//! Local persons become Azure persons whose `userData` holds the user key.
//! Indexing adds a persisted face straight to the person, so
//! `associate_faces` only has to confirm the user exists.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http;
use super::model::{Candidate, NormalizedBox};
use super::provider::{DetectedFace, FaceProvider, IdentifyResult};
use crate::config::FacesConfig;
use crate::error::ProviderError;
use crate::photo::image_dimensions;

/// Azure accepts at most this many face ids per identify call.
const IDENTIFY_CHUNK: usize = 10;
const PERSONS_PAGE: usize = 1000;

enum Body {
    Empty,
    Json(Value),
    Image(Vec<u8>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzurePerson {
    person_id: String,
    #[serde(default)]
    user_data: Option<String>,
    #[serde(default)]
    persisted_face_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureRectangle {
    top: f32,
    left: f32,
    width: f32,
    height: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureAttributes {
    age: Option<f32>,
    gender: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureDetectedFace {
    face_id: Option<String>,
    face_rectangle: Option<AzureRectangle>,
    face_attributes: Option<AzureAttributes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureCandidate {
    person_id: String,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureIdentifyResult {
    face_id: String,
    #[serde(default)]
    candidates: Vec<AzureCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrainingStatus {
    status: String,
    message: Option<String>,
}

pub struct AzureFaceProvider {
    base_url: String,
    api_key: String,
    group_id: String,
    recognition_model: String,
    detection_model: String,
    match_threshold: f64,
    max_candidates: usize,
    timeout: Duration,
    train_timeout: Duration,
    agent: ureq::Agent,
    /// user key -> Azure personId
    persons: RwLock<HashMap<String, String>>,
}

impl AzureFaceProvider {
    pub fn new(config: &FacesConfig, api_key: &str) -> Self {
        let timeout = config.request_timeout();
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: format!("{}/face/v1.0", config.azure.endpoint.trim_end_matches('/')),
            api_key: api_key.to_string(),
            group_id: config.collection_id.clone(),
            recognition_model: config.azure.recognition_model.clone(),
            detection_model: config.azure.detection_model.clone(),
            match_threshold: config.match_threshold,
            max_candidates: config.max_candidates.clamp(1, 100),
            timeout,
            train_timeout: Duration::from_secs(config.azure.train_timeout_secs),
            agent,
            persons: RwLock::new(HashMap::new()),
        }
    }

    fn group_path(&self) -> String {
        format!("/persongroups/{}", self.group_id)
    }

    /// Issue one request. `Ok(None)` means the resource does not exist (404).
    async fn send(
        &self,
        method: &'static str,
        path: String,
        body: Body,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let agent = self.agent.clone();
        let api_key = self.api_key.clone();

        http::call(self.timeout, cancel, move || {
            let request = agent
                .request(method, &url)
                .set("Ocp-Apim-Subscription-Key", &api_key);
            let result = match body {
                Body::Empty => request.call(),
                Body::Json(value) => request.send_json(value),
                Body::Image(bytes) => request
                    .set("Content-Type", "application/octet-stream")
                    .send_bytes(&bytes),
            };
            match result {
                Ok(response) => {
                    let text = response
                        .into_string()
                        .map_err(|e| ProviderError::Transient(format!("reading response: {e}")))?;
                    if text.trim().is_empty() {
                        return Ok(Some(Value::Null));
                    }
                    serde_json::from_str(&text)
                        .map(Some)
                        .map_err(|e| ProviderError::Permanent(format!("invalid response body: {e}")))
                }
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(http::classify(e)),
            }
        })
        .await
    }

    async fn send_found(
        &self,
        method: &'static str,
        path: String,
        body: Body,
        cancel: &CancellationToken,
    ) -> Result<Value, ProviderError> {
        let what = path.clone();
        self.send(method, path, body, cancel)
            .await?
            .ok_or_else(|| ProviderError::Permanent(format!("{what} not found")))
    }

    /// Reload the user key -> personId map from the person group.
    async fn refresh_persons(&self, cancel: &CancellationToken) -> Result<HashMap<String, String>, ProviderError> {
        let mut map = HashMap::new();
        let mut start: Option<String> = None;
        loop {
            let mut path = format!("{}/persons?top={PERSONS_PAGE}", self.group_path());
            if let Some(after) = &start {
                path.push_str(&format!("&start={after}"));
            }
            let page: Vec<AzurePerson> = decode(self.send_found("GET", path, Body::Empty, cancel).await?)?;
            let last = page.last().map(|p| p.person_id.clone());
            let full = page.len() == PERSONS_PAGE;
            map.extend(user_map(page));
            match last {
                Some(last) if full => start = Some(last),
                _ => break,
            }
        }
        *self.persons.write().await = map.clone();
        Ok(map)
    }

    async fn person_id(&self, user_key: &str, cancel: &CancellationToken) -> Result<String, ProviderError> {
        if let Some(id) = self.persons.read().await.get(user_key) {
            return Ok(id.clone());
        }
        self.refresh_persons(cancel)
            .await?
            .remove(user_key)
            .ok_or_else(|| ProviderError::Permanent(format!("user {user_key} does not exist")))
    }

    async fn user_key_for(&self, person_id: &str, cancel: &CancellationToken) -> Result<Option<String>, ProviderError> {
        let lookup = |map: &HashMap<String, String>| {
            map.iter()
                .find(|(_, id)| id.as_str() == person_id)
                .map(|(key, _)| key.clone())
        };
        if let Some(key) = lookup(&*self.persons.read().await) {
            return Ok(Some(key));
        }
        Ok(lookup(&self.refresh_persons(cancel).await?))
    }
}

#[async_trait]
impl FaceProvider for AzureFaceProvider {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn detect_faces(
        &self,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        let mut path = format!(
            "/detect?returnFaceId=true&returnFaceLandmarks=false&recognitionModel={}&detectionModel={}",
            self.recognition_model, self.detection_model
        );
        // Newer detection models reject attribute requests.
        if self.detection_model == "detection_01" {
            path.push_str("&returnFaceAttributes=age,gender");
        }

        let value = self.send_found("POST", path, Body::Image(image.to_vec()), cancel).await?;
        let faces: Vec<AzureDetectedFace> = decode(value)?;
        let dimensions = image_dimensions(image);

        Ok(faces
            .into_iter()
            .filter_map(|f| {
                let token = f.face_id?;
                let (age, gender) = f
                    .face_attributes
                    .map(|a| (a.age, a.gender))
                    .unwrap_or_default();
                Some(DetectedFace {
                    token,
                    confidence: None,
                    bbox: f
                        .face_rectangle
                        .zip(dimensions)
                        .map(|(r, (w, h))| normalize_rectangle(&r, w, h)),
                    age,
                    gender,
                })
            })
            .collect())
    }

    async fn identify(
        &self,
        tokens: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<IdentifyResult>, ProviderError> {
        let mut results = Vec::with_capacity(tokens.len());
        for chunk in tokens.chunks(IDENTIFY_CHUNK) {
            let body = json!({
                "faceIds": chunk,
                "personGroupId": self.group_id,
                "maxNumOfCandidatesReturned": self.max_candidates,
                "confidenceThreshold": self.match_threshold,
            });
            let value = self
                .send_found("POST", "/identify".to_string(), Body::Json(body), cancel)
                .await?;
            let identified: Vec<AzureIdentifyResult> = decode(value)?;

            for result in identified {
                let mut candidates = Vec::with_capacity(result.candidates.len());
                for c in result.candidates {
                    match self.user_key_for(&c.person_id, cancel).await? {
                        Some(key) => candidates.push(Candidate::new(key, c.confidence)),
                        None => warn!(person_id = %c.person_id, "Azure person without user key in candidates"),
                    }
                }
                results.push(IdentifyResult {
                    token: result.face_id,
                    candidates,
                });
            }
        }
        Ok(results)
    }

    async fn collection_exists(&self, cancel: &CancellationToken) -> Result<bool, ProviderError> {
        Ok(self
            .send("GET", self.group_path(), Body::Empty, cancel)
            .await?
            .is_some())
    }

    async fn create_collection(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let body = json!({
            "name": self.group_id,
            "recognitionModel": self.recognition_model,
        });
        self.send_found("PUT", self.group_path(), Body::Json(body), cancel).await?;
        info!(group = %self.group_id, "Created Azure person group");
        Ok(())
    }

    async fn delete_collection(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        self.send("DELETE", self.group_path(), Body::Empty, cancel).await?;
        self.persons.write().await.clear();
        Ok(())
    }

    async fn list_users(&self, cancel: &CancellationToken) -> Result<Vec<String>, ProviderError> {
        let mut keys: Vec<String> = self.refresh_persons(cancel).await?.into_keys().collect();
        keys.sort();
        Ok(keys)
    }

    async fn create_user(&self, user_key: &str, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let body = json!({ "name": user_key, "userData": user_key });
        let path = format!("{}/persons", self.group_path());
        let value = self.send_found("POST", path, Body::Json(body), cancel).await?;
        let person_id = value
            .get("personId")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Permanent("create person returned no personId".to_string()))?;
        debug!(user_key, person_id, "Created Azure person");
        self.persons
            .write()
            .await
            .insert(user_key.to_string(), person_id.to_string());
        Ok(())
    }

    async fn delete_user(&self, user_key: &str, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let person_id = self.person_id(user_key, cancel).await?;
        let path = format!("{}/persons/{person_id}", self.group_path());
        self.send("DELETE", path, Body::Empty, cancel).await?;
        self.persons.write().await.remove(user_key);
        Ok(())
    }

    async fn list_faces(
        &self,
        user_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProviderError> {
        let person_id = self.person_id(user_key, cancel).await?;
        let path = format!("{}/persons/{person_id}", self.group_path());
        let person: AzurePerson = decode(self.send_found("GET", path, Body::Empty, cancel).await?)?;
        Ok(person.persisted_face_ids)
    }

    async fn index_face(
        &self,
        user_key: &str,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        let person_id = self.person_id(user_key, cancel).await?;
        let path = format!(
            "{}/persons/{person_id}/persistedFaces?detectionModel={}",
            self.group_path(),
            self.detection_model
        );
        match self.send_found("POST", path, Body::Image(image.to_vec()), cancel).await {
            Ok(value) => Ok(value
                .get("persistedFaceId")
                .and_then(Value::as_str)
                .map(str::to_string)),
            Err(ProviderError::Permanent(message)) if message.contains("No face detected") => {
                debug!(user_key, "Azure found no face in the sample");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn associate_faces(
        &self,
        user_key: &str,
        face_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        // Persisted faces are bound to their person when added.
        self.person_id(user_key, cancel).await?;
        debug!(user_key, faces = face_ids.len(), "Azure faces already associated");
        Ok(())
    }

    async fn train(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let path = format!("{}/train", self.group_path());
        self.send_found("POST", path, Body::Empty, cancel).await?;

        let started = Instant::now();
        loop {
            let path = format!("{}/training", self.group_path());
            let status: TrainingStatus = decode(self.send_found("GET", path, Body::Empty, cancel).await?)?;
            match status.status.as_str() {
                "succeeded" => {
                    info!(group = %self.group_id, ms = started.elapsed().as_millis() as u64, "Azure training finished");
                    return Ok(());
                }
                "failed" => {
                    return Err(ProviderError::Permanent(format!(
                        "training failed: {}",
                        status.message.unwrap_or_default()
                    )))
                }
                _ => {}
            }
            if started.elapsed() > self.train_timeout {
                warn!(group = %self.group_id, "Azure training did not finish in time");
                return Err(ProviderError::Timeout);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|e| ProviderError::Permanent(format!("unexpected response: {e}")))
}

/// Persons that carry a user key, keyed by it.
fn user_map(persons: Vec<AzurePerson>) -> impl Iterator<Item = (String, String)> {
    persons.into_iter().filter_map(|p| {
        p.user_data
            .filter(|key| !key.is_empty())
            .map(|key| (key, p.person_id))
    })
}

fn normalize_rectangle(r: &AzureRectangle, width: u32, height: u32) -> NormalizedBox {
    let w = width.max(1) as f32;
    let h = height.max(1) as f32;
    NormalizedBox {
        left: r.left / w,
        top: r.top / h,
        width: r.width / w,
        height: r.height / h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_map_ignores_foreign_persons() {
        let persons: Vec<AzurePerson> = serde_json::from_value(json!([
            {"personId": "a-1", "name": "1", "userData": "1", "persistedFaceIds": ["f"]},
            {"personId": "a-2", "name": "manual"},
            {"personId": "a-3", "name": "x", "userData": ""},
            {"personId": "a-4", "name": "4", "userData": "4"}
        ]))
        .unwrap();

        let map: HashMap<_, _> = user_map(persons).collect();
        assert_eq!(map.len(), 2);
        assert_eq!(map["1"], "a-1");
        assert_eq!(map["4"], "a-4");
    }

    #[test]
    fn test_detect_response_decoding() {
        let faces: Vec<AzureDetectedFace> = decode(json!([
            {"faceId": "c5c24a82-6845-4031-9d5d-978df9175426",
             "faceRectangle": {"top": 50, "left": 100, "width": 200, "height": 100}},
            {"faceRectangle": {"top": 0, "left": 0, "width": 1, "height": 1}}
        ]))
        .unwrap();
        assert_eq!(faces.len(), 2);
        assert!(faces[1].face_id.is_none());

        let rect = faces[0].face_rectangle.as_ref().unwrap();
        let b = normalize_rectangle(rect, 400, 200);
        assert_eq!(b.left, 0.25);
        assert_eq!(b.top, 0.25);
        assert_eq!(b.width, 0.5);
        assert_eq!(b.height, 0.5);
    }

    #[test]
    fn test_new_builds_group_urls() {
        let mut config = FacesConfig::default();
        config.collection_id = "family".to_string();
        config.azure.endpoint = "https://example.cognitiveservices.azure.com/".to_string();
        config.max_candidates = 500;

        let provider = AzureFaceProvider::new(&config, "key");
        assert_eq!(provider.base_url, "https://example.cognitiveservices.azure.com/face/v1.0");
        assert_eq!(provider.group_path(), "/persongroups/family");
        assert_eq!(provider.max_candidates, 100);
    }
}

//! Scriptable in-memory provider for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::model::Candidate;
use super::provider::{DetectedFace, FaceProvider, IdentifyResult};
use crate::error::ProviderError;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Calls {
    pub detect: usize,
    pub identify: usize,
    pub create_collection: usize,
    pub create_user: usize,
    pub delete_user: usize,
    pub index: usize,
    pub associate: usize,
    pub train: usize,
}

#[derive(Default)]
struct State {
    collection: bool,
    users: BTreeMap<String, Vec<String>>,
    detect_script: VecDeque<Result<Vec<DetectedFace>, ProviderError>>,
    candidates: Vec<Candidate>,
    failing_images: HashSet<Vec<u8>>,
    failing_users: HashSet<String>,
    next_face: usize,
    calls: Calls,
}

pub struct FakeProvider {
    name: &'static str,
    state: Mutex<State>,
}

pub fn face(token: &str) -> DetectedFace {
    DetectedFace {
        token: token.to_string(),
        confidence: Some(0.9),
        bbox: None,
        age: None,
        gender: None,
    }
}

impl FakeProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_collection(self, users: &[&str]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.collection = true;
            for user in users {
                state.users.insert(user.to_string(), Vec::new());
            }
        }
        self
    }

    /// Next detect calls return these results in order; afterwards a single
    /// face is returned.
    pub fn script_detect(&self, results: Vec<Result<Vec<DetectedFace>, ProviderError>>) {
        self.state.lock().unwrap().detect_script = results.into();
    }

    pub fn set_candidates(&self, candidates: Vec<Candidate>) {
        self.state.lock().unwrap().candidates = candidates;
    }

    pub fn fail_index_for(&self, image: &[u8]) {
        self.state.lock().unwrap().failing_images.insert(image.to_vec());
    }

    pub fn fail_user(&self, user_key: &str) {
        self.state.lock().unwrap().failing_users.insert(user_key.to_string());
    }

    /// Attach a face id the local side knows nothing about.
    pub fn add_remote_face(&self, user_key: &str, face_id: &str) {
        self.state
            .lock()
            .unwrap()
            .users
            .entry(user_key.to_string())
            .or_default()
            .push(face_id.to_string());
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls = Calls::default();
    }

    pub fn users(&self) -> Vec<String> {
        self.state.lock().unwrap().users.keys().cloned().collect()
    }

    pub fn faces_of(&self, user_key: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(user_key)
            .cloned()
            .unwrap_or_default()
    }
}

fn gone() -> ProviderError {
    ProviderError::Permanent("collection does not exist".to_string())
}

#[async_trait]
impl FaceProvider for FakeProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn detect_faces(&self, _image: &[u8], cancel: &CancellationToken) -> Result<Vec<DetectedFace>, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let mut state = self.state.lock().unwrap();
        state.calls.detect += 1;
        state
            .detect_script
            .pop_front()
            .unwrap_or_else(|| Ok(vec![face("t-default")]))
    }

    async fn identify(&self, tokens: &[String], _cancel: &CancellationToken) -> Result<Vec<IdentifyResult>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.identify += 1;
        Ok(tokens
            .iter()
            .map(|token| IdentifyResult {
                token: token.clone(),
                candidates: state.candidates.clone(),
            })
            .collect())
    }

    async fn collection_exists(&self, _cancel: &CancellationToken) -> Result<bool, ProviderError> {
        Ok(self.state.lock().unwrap().collection)
    }

    async fn create_collection(&self, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.create_collection += 1;
        state.collection = true;
        Ok(())
    }

    async fn delete_collection(&self, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.collection = false;
        state.users.clear();
        Ok(())
    }

    async fn list_users(&self, _cancel: &CancellationToken) -> Result<Vec<String>, ProviderError> {
        let state = self.state.lock().unwrap();
        if !state.collection {
            return Err(gone());
        }
        Ok(state.users.keys().cloned().collect())
    }

    async fn create_user(&self, user_key: &str, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.create_user += 1;
        if state.failing_users.contains(user_key) {
            return Err(ProviderError::Permanent(format!("rejected {user_key}")));
        }
        state.users.entry(user_key.to_string()).or_default();
        Ok(())
    }

    async fn delete_user(&self, user_key: &str, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.delete_user += 1;
        state.users.remove(user_key);
        Ok(())
    }

    async fn list_faces(&self, user_key: &str, _cancel: &CancellationToken) -> Result<Vec<String>, ProviderError> {
        let state = self.state.lock().unwrap();
        state
            .users
            .get(user_key)
            .cloned()
            .ok_or_else(|| ProviderError::Permanent(format!("no user {user_key}")))
    }

    async fn index_face(
        &self,
        _user_key: &str,
        image: &[u8],
        _cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.index += 1;
        if state.failing_images.contains(image) {
            return Err(ProviderError::Transient("index failed".to_string()));
        }
        if image.is_empty() {
            return Ok(None);
        }
        state.next_face += 1;
        Ok(Some(format!("{}-face-{}", self.name, state.next_face)))
    }

    async fn associate_faces(
        &self,
        user_key: &str,
        face_ids: &[String],
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.associate += 1;
        let faces = state
            .users
            .get_mut(user_key)
            .ok_or_else(|| ProviderError::Permanent(format!("no user {user_key}")))?;
        faces.extend(face_ids.iter().cloned());
        Ok(())
    }

    async fn train(&self, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        self.state.lock().unwrap().calls.train += 1;
        Ok(())
    }
}

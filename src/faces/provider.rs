use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::aws::{AwsCredentials, AwsFaceProvider};
use super::azure::AzureFaceProvider;
use super::local::{InsightFaceClient, LocalFaceProvider};
use super::model::{Candidate, NormalizedBox};
use crate::config::{FaceProviderKind, FacesConfig};
use crate::error::ProviderError;

/// A face found by a detect call. The token is only meaningful to the
/// provider that issued it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub token: String,
    pub confidence: Option<f32>,
    pub bbox: Option<NormalizedBox>,
    pub age: Option<f32>,
    pub gender: Option<String>,
}

/// Candidates for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyResult {
    pub token: String,
    pub candidates: Vec<Candidate>,
}

/// Capability set every face-recognition vendor offers.
///
/// Users are addressed by the local person's user key, faces by the id the
/// provider handed out when indexing. Implementations must be safe to share
/// between concurrent pipeline runs.
#[async_trait]
pub trait FaceProvider: Send + Sync {
    /// Name stored in a face's external reference.
    fn name(&self) -> &'static str;

    async fn detect_faces(
        &self,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectedFace>, ProviderError>;

    async fn identify(
        &self,
        tokens: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<IdentifyResult>, ProviderError>;

    async fn collection_exists(&self, cancel: &CancellationToken) -> Result<bool, ProviderError>;

    async fn create_collection(&self, cancel: &CancellationToken) -> Result<(), ProviderError>;

    async fn delete_collection(&self, cancel: &CancellationToken) -> Result<(), ProviderError>;

    async fn list_users(&self, cancel: &CancellationToken) -> Result<Vec<String>, ProviderError>;

    async fn create_user(&self, user_key: &str, cancel: &CancellationToken) -> Result<(), ProviderError>;

    async fn delete_user(&self, user_key: &str, cancel: &CancellationToken) -> Result<(), ProviderError>;

    /// Ids of faces already associated with `user_key`.
    async fn list_faces(
        &self,
        user_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProviderError>;

    /// Index the single face in `image` on behalf of `user_key`. `None` when
    /// the provider found nothing it could index.
    async fn index_face(
        &self,
        user_key: &str,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError>;

    async fn associate_faces(
        &self,
        user_key: &str,
        face_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Make recent user and face changes visible to identify.
    async fn train(&self, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Build the provider selected in the configuration.
pub fn create_provider(config: &FacesConfig) -> Result<Arc<dyn FaceProvider>> {
    match config.provider {
        FaceProviderKind::Azure => {
            let Some(api_key) = config.azure.api_key.as_deref() else {
                bail!("faces.azure.api_key is required for the azure provider");
            };
            Ok(Arc::new(AzureFaceProvider::new(config, api_key)))
        }
        FaceProviderKind::Aws => {
            let Some(credentials) = AwsCredentials::from_config_or_env(&config.aws) else {
                bail!("faces.aws access_key_id and secret_access_key (or AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY) are required for the aws provider");
            };
            Ok(Arc::new(AwsFaceProvider::new(config, credentials)))
        }
        FaceProviderKind::Local => {
            let client = InsightFaceClient::new(&config.local.endpoint, config.request_timeout());
            let provider = LocalFaceProvider::new(Arc::new(client), config);
            match &config.local.collection_path {
                Some(path) => Ok(Arc::new(provider.with_snapshot(path)?)),
                None => Ok(Arc::new(provider)),
            }
        }
    }
}

//! Amazon Rekognition collection/user provider.
//!
//! Local persons become Rekognition users named by their user key. Samples
//! are indexed into the collection and then associated with the user.
//! Rekognition detection hands out no face ids, so a detection token is the
//! base64 face image itself and identify runs `SearchUsersByImage` on it.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http;
use super::model::{Candidate, NormalizedBox};
use super::provider::{DetectedFace, FaceProvider, IdentifyResult};
use crate::config::{AwsConfig, FacesConfig};
use crate::error::ProviderError;

const SERVICE: &str = "rekognition";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const USERS_PAGE: usize = 500;
const FACES_PAGE: usize = 4096;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Keys from the config, or from `AWS_ACCESS_KEY_ID`,
    /// `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`.
    pub fn from_config_or_env(config: &AwsConfig) -> Option<Self> {
        Self::resolve(config, |name| std::env::var(name).ok())
    }

    fn resolve(config: &AwsConfig, env: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let pick = |value: &Option<String>, var: &str| {
            value
                .clone()
                .or_else(|| env(var))
                .filter(|v| !v.is_empty())
        };
        Some(Self {
            access_key_id: pick(&config.access_key_id, "AWS_ACCESS_KEY_ID")?,
            secret_access_key: pick(&config.secret_access_key, "AWS_SECRET_ACCESS_KEY")?,
            session_token: pick(&config.session_token, "AWS_SESSION_TOKEN"),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct AwsErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsBoundingBox {
    width: f32,
    height: f32,
    left: f32,
    top: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgeRange {
    low: Option<f32>,
    high: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Gender {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FaceDetail {
    bounding_box: Option<AwsBoundingBox>,
    age_range: Option<AgeRange>,
    gender: Option<Gender>,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DetectFacesResponse {
    #[serde(default)]
    face_details: Vec<FaceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct User {
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListUsersResponse {
    #[serde(default)]
    users: Vec<User>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IndexedFace {
    face_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListFacesResponse {
    #[serde(default)]
    faces: Vec<IndexedFace>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FaceRecord {
    face: Option<IndexedFace>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IndexFacesResponse {
    #[serde(default)]
    face_records: Vec<FaceRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UnsuccessfulAssociation {
    face_id: Option<String>,
    #[serde(default)]
    reasons: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssociateFacesResponse {
    #[serde(default)]
    unsuccessful_face_associations: Vec<UnsuccessfulAssociation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserMatch {
    similarity: Option<f64>,
    user: Option<User>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SearchUsersResponse {
    #[serde(default)]
    user_matches: Vec<UserMatch>,
}

pub struct AwsFaceProvider {
    endpoint: String,
    host: String,
    region: String,
    credentials: AwsCredentials,
    collection_id: String,
    quality_filter: String,
    match_threshold: f64,
    max_candidates: usize,
    timeout: Duration,
    agent: ureq::Agent,
}

impl AwsFaceProvider {
    pub fn new(config: &FacesConfig, credentials: AwsCredentials) -> Self {
        let timeout = config.request_timeout();
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let endpoint = config
            .aws
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://rekognition.{}.amazonaws.com", config.aws.region));
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let host = endpoint
            .split_once("://")
            .map_or(endpoint.as_str(), |(_, rest)| rest)
            .to_string();
        Self {
            endpoint,
            host,
            region: config.aws.region.clone(),
            credentials,
            collection_id: config.collection_id.clone(),
            quality_filter: config.aws.quality_filter.clone(),
            match_threshold: config.match_threshold,
            max_candidates: config.max_candidates.clamp(1, 500),
            timeout,
            agent,
        }
    }

    /// Call one Rekognition action. `Ok(None)` means the collection or user
    /// named in the request does not exist.
    async fn send(
        &self,
        action: &'static str,
        body: Value,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, ProviderError> {
        let payload =
            serde_json::to_vec(&body).map_err(|e| ProviderError::Permanent(format!("encoding {action}: {e}")))?;
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let target = format!("RekognitionService.{action}");

        let mut headers = vec![
            ("content-type", CONTENT_TYPE),
            ("host", self.host.as_str()),
            ("x-amz-date", amz_date.as_str()),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token", token.as_str()));
        }
        headers.push(("x-amz-target", target.as_str()));

        let authorization = authorization(
            &self.credentials,
            &self.region,
            SERVICE,
            &amz_date,
            &SignedRequest {
                method: "POST",
                path: "/",
                headers: &headers,
                body: &payload,
            },
        )?;
        let request = headers
            .iter()
            .filter(|(name, _)| *name != "host")
            .fold(self.agent.post(&self.endpoint), |request, (name, value)| request.set(name, value))
            .set("Authorization", &authorization);

        http::call(self.timeout, cancel, move || match request.send_bytes(&payload) {
            Ok(response) => http::read_json(response).map(Some),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                status_error(code, &body).map_or(Ok(None), Err)
            }
            Err(e) => Err(http::classify(e)),
        })
        .await
    }

    async fn send_found(
        &self,
        action: &'static str,
        body: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ProviderError> {
        self.send(action, body, cancel)
            .await?
            .ok_or_else(|| ProviderError::Permanent(format!("{action}: collection {} not found", self.collection_id)))
    }

    async fn search_users(&self, token: &str, cancel: &CancellationToken) -> Result<Vec<Candidate>, ProviderError> {
        let body = json!({
            "CollectionId": self.collection_id,
            "Image": { "Bytes": token },
            "MaxUsers": self.max_candidates,
            "UserMatchThreshold": self.match_threshold * 100.0,
            "QualityFilter": self.quality_filter,
        });
        match self.send_found("SearchUsersByImage", body, cancel).await {
            Ok(value) => Ok(candidates(decode(value)?)),
            Err(ProviderError::Permanent(message)) if message.starts_with("InvalidParameterException") => {
                debug!(%message, "Rekognition found no searchable face");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl FaceProvider for AwsFaceProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn detect_faces(
        &self,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        let body = json!({
            "Image": { "Bytes": STANDARD.encode(image) },
            "Attributes": ["ALL"],
        });
        let response: DetectFacesResponse = decode(self.send_found("DetectFaces", body, cancel).await?)?;

        let boxes: Vec<Option<NormalizedBox>> = response
            .face_details
            .iter()
            .map(|d| d.bounding_box.as_ref().map(normalized_box))
            .collect();
        let image = image.to_vec();
        let tokens = tokio::task::spawn_blocking(move || face_tokens(&image, &boxes))
            .await
            .map_err(|e| ProviderError::Transient(format!("cropping faces: {e}")))??;

        Ok(response
            .face_details
            .into_iter()
            .zip(tokens)
            .map(|(detail, token)| DetectedFace {
                token,
                confidence: detail.confidence.map(|c| c / 100.0),
                bbox: detail.bounding_box.as_ref().map(normalized_box),
                age: detail.age_range.as_ref().and_then(mid_age),
                gender: detail.gender.and_then(|g| g.value),
            })
            .collect())
    }

    async fn identify(
        &self,
        tokens: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<IdentifyResult>, ProviderError> {
        let mut results = Vec::with_capacity(tokens.len());
        for token in tokens {
            results.push(IdentifyResult {
                candidates: self.search_users(token, cancel).await?,
                token: token.clone(),
            });
        }
        Ok(results)
    }

    async fn collection_exists(&self, cancel: &CancellationToken) -> Result<bool, ProviderError> {
        let body = json!({ "CollectionId": self.collection_id });
        Ok(self.send("DescribeCollection", body, cancel).await?.is_some())
    }

    async fn create_collection(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let body = json!({ "CollectionId": self.collection_id });
        match self.send_found("CreateCollection", body, cancel).await {
            Ok(_) => {
                info!(collection = %self.collection_id, region = %self.region, "Created Rekognition collection");
                Ok(())
            }
            Err(ProviderError::Permanent(message)) if message.starts_with("ResourceAlreadyExistsException") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_collection(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let body = json!({ "CollectionId": self.collection_id });
        self.send("DeleteCollection", body, cancel).await?;
        Ok(())
    }

    async fn list_users(&self, cancel: &CancellationToken) -> Result<Vec<String>, ProviderError> {
        let mut users = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut body = json!({ "CollectionId": self.collection_id, "MaxResults": USERS_PAGE });
            if let Some(token) = &next {
                body["NextToken"] = json!(token);
            }
            let page: ListUsersResponse = decode(self.send_found("ListUsers", body, cancel).await?)?;
            users.extend(page.users.into_iter().map(|u| u.user_id));
            match page.next_token.filter(|t| !t.is_empty()) {
                Some(token) => next = Some(token),
                None => break,
            }
        }
        users.sort();
        Ok(users)
    }

    async fn create_user(&self, user_key: &str, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let body = json!({ "CollectionId": self.collection_id, "UserId": user_key });
        self.send_found("CreateUser", body, cancel).await?;
        debug!(user_key, "Created Rekognition user");
        Ok(())
    }

    async fn delete_user(&self, user_key: &str, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let body = json!({ "CollectionId": self.collection_id, "UserId": user_key });
        if self.send("DeleteUser", body, cancel).await?.is_none() {
            debug!(user_key, "Rekognition user already gone");
        }
        Ok(())
    }

    async fn list_faces(
        &self,
        user_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ProviderError> {
        let mut faces = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut body = json!({
                "CollectionId": self.collection_id,
                "UserId": user_key,
                "MaxResults": FACES_PAGE,
            });
            if let Some(token) = &next {
                body["NextToken"] = json!(token);
            }
            let page: ListFacesResponse = decode(self.send_found("ListFaces", body, cancel).await?)?;
            faces.extend(page.faces.into_iter().map(|f| f.face_id));
            match page.next_token.filter(|t| !t.is_empty()) {
                Some(token) => next = Some(token),
                None => break,
            }
        }
        Ok(faces)
    }

    async fn index_face(
        &self,
        user_key: &str,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        let body = json!({
            "CollectionId": self.collection_id,
            "Image": { "Bytes": STANDARD.encode(image) },
            "ExternalImageId": user_key,
            "MaxFaces": 1,
            "QualityFilter": self.quality_filter,
            "DetectionAttributes": ["DEFAULT"],
        });
        let response: IndexFacesResponse = decode(self.send_found("IndexFaces", body, cancel).await?)?;
        let face_id = response
            .face_records
            .into_iter()
            .find_map(|r| r.face)
            .map(|f| f.face_id);
        if face_id.is_none() {
            debug!(user_key, "Rekognition indexed no face from the sample");
        }
        Ok(face_id)
    }

    async fn associate_faces(
        &self,
        user_key: &str,
        face_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let body = json!({
            "CollectionId": self.collection_id,
            "UserId": user_key,
            "FaceIds": face_ids,
        });
        let response: AssociateFacesResponse = decode(self.send_found("AssociateFaces", body, cancel).await?)?;
        if let Some(failed) = response.unsuccessful_face_associations.first() {
            warn!(user_key, failed = response.unsuccessful_face_associations.len(), "Rekognition rejected associations");
            return Err(ProviderError::Permanent(format!(
                "face {} not associated with {user_key}: {}",
                failed.face_id.as_deref().unwrap_or("?"),
                failed.reasons.join(", ")
            )));
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|e| ProviderError::Permanent(format!("unexpected response: {e}")))
}

/// Error for a non-2xx Rekognition reply, `None` when the named resource
/// does not exist. Messages start with the exception name.
fn status_error(code: u16, body: &str) -> Option<ProviderError> {
    let parsed: AwsErrorBody = serde_json::from_str(body).unwrap_or_default();
    let kind = parsed.kind.rsplit('#').next().unwrap_or_default();
    let message = format!("{kind}: {}", parsed.message.trim());
    match kind {
        "ResourceNotFoundException" => None,
        "ThrottlingException" | "ProvisionedThroughputExceededException" | "InternalServerError" => {
            Some(ProviderError::Transient(message))
        }
        _ if code == 429 || code >= 500 => Some(ProviderError::Transient(format!("HTTP {code}: {message}"))),
        _ => Some(ProviderError::Permanent(message)),
    }
}

fn candidates(response: SearchUsersResponse) -> Vec<Candidate> {
    response
        .user_matches
        .into_iter()
        .filter_map(|m| {
            let user = m.user?;
            Some(Candidate::new(user.user_id, m.similarity.unwrap_or(0.0) / 100.0))
        })
        .collect()
}

fn normalized_box(b: &AwsBoundingBox) -> NormalizedBox {
    NormalizedBox {
        left: b.left,
        top: b.top,
        width: b.width,
        height: b.height,
    }
}

fn mid_age(range: &AgeRange) -> Option<f32> {
    match (range.low, range.high) {
        (Some(low), Some(high)) => Some((low + high) / 2.0),
        (low, high) => low.or(high),
    }
}

/// One search token per detected face. A single face searches the image as
/// it is; several faces are cropped apart first.
fn face_tokens(image: &[u8], boxes: &[Option<NormalizedBox>]) -> Result<Vec<String>, ProviderError> {
    if boxes.len() <= 1 {
        return Ok(boxes.iter().map(|_| STANDARD.encode(image)).collect());
    }

    let img = image::load_from_memory(image).map_err(|e| ProviderError::Permanent(format!("decoding image: {e}")))?;
    boxes
        .iter()
        .map(|bbox| {
            let rect = bbox
                .as_ref()
                .map(|b| b.to_pixels(img.width(), img.height()))
                .filter(|r| r.width > 0 && r.height > 0);
            let Some(r) = rect else {
                return Ok(STANDARD.encode(image));
            };
            let crop = DynamicImage::ImageRgb8(
                img.crop_imm(r.x as u32, r.y as u32, r.width as u32, r.height as u32)
                    .to_rgb8(),
            );
            let mut bytes = Vec::new();
            crop.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
                .map_err(|e| ProviderError::Permanent(format!("encoding face crop: {e}")))?;
            Ok(STANDARD.encode(bytes))
        })
        .collect()
}

struct SignedRequest<'a> {
    method: &'a str,
    path: &'a str,
    /// Lowercase names with trimmed values, sorted by name.
    headers: &'a [(&'a str, &'a str)],
    body: &'a [u8],
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, ProviderError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ProviderError::Permanent(format!("signing key: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, ProviderError> {
    let key = hmac_sha256(format!("AWS4{secret}").as_bytes(), date)?;
    let key = hmac_sha256(&key, region)?;
    let key = hmac_sha256(&key, service)?;
    hmac_sha256(&key, "aws4_request")
}

/// Signature Version 4 `Authorization` header for a request without a
/// query string.
fn authorization(
    credentials: &AwsCredentials,
    region: &str,
    service: &str,
    amz_date: &str,
    request: &SignedRequest<'_>,
) -> Result<String, ProviderError> {
    let date = amz_date
        .get(..8)
        .ok_or_else(|| ProviderError::Permanent(format!("bad request date {amz_date}")))?;
    let canonical_headers: String = request
        .headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = request
        .headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");
    let canonical_request = format!(
        "{}\n{}\n\n{canonical_headers}\n{signed_headers}\n{}",
        request.method,
        request.path,
        hex(&Sha256::digest(request.body))
    );

    let scope = format!("{date}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex(&Sha256::digest(canonical_request.as_bytes()))
    );
    let key = signing_key(&credentials.secret_access_key, date, region, service)?;
    let signature = hex(&hmac_sha256(&key, &string_to_sign)?);

    Ok(format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichers::tests::sample_png;

    const EXAMPLE_SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    fn credentials() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: EXAMPLE_SECRET.to_string(),
            session_token: None,
        }
    }

    #[test]
    fn test_signing_key_derivation() {
        let key = signing_key(EXAMPLE_SECRET, "20120215", "us-east-1", "iam").unwrap();
        assert_eq!(hex(&key), "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d");
    }

    #[test]
    fn test_authorization_header_for_plain_get() {
        let headers = [("host", "example.amazonaws.com"), ("x-amz-date", "20150830T123600Z")];
        let request = SignedRequest {
            method: "GET",
            path: "/",
            headers: &headers,
            body: b"",
        };

        let header = authorization(&credentials(), "us-east-1", "service", "20150830T123600Z", &request).unwrap();
        assert_eq!(
            header,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
    }

    #[test]
    fn test_status_errors_are_classified() {
        let not_found = r#"{"__type":"ResourceNotFoundException","Message":"The collection id: x does not exist"}"#;
        assert_eq!(status_error(400, not_found), None);

        let throttled = r#"{"__type":"com.amazonaws.rekognition#ThrottlingException","message":"slow down"}"#;
        assert_eq!(
            status_error(400, throttled),
            Some(ProviderError::Transient("ThrottlingException: slow down".to_string()))
        );

        let invalid = r#"{"__type":"InvalidParameterException","Message":"There are no faces in the image."}"#;
        assert!(matches!(
            status_error(400, invalid),
            Some(ProviderError::Permanent(m)) if m.starts_with("InvalidParameterException")
        ));

        assert!(matches!(status_error(503, "<html>"), Some(ProviderError::Transient(_))));
        assert!(matches!(status_error(403, ""), Some(ProviderError::Permanent(_))));
    }

    #[test]
    fn test_detect_response_decoding() {
        let response: DetectFacesResponse = decode(json!({
            "FaceDetails": [
                {"BoundingBox": {"Width": 0.25, "Height": 0.5, "Left": 0.1, "Top": 0.2},
                 "AgeRange": {"Low": 30, "High": 40},
                 "Gender": {"Value": "Female", "Confidence": 99.1},
                 "Confidence": 99.5},
                {"Confidence": 80.0}
            ]
        }))
        .unwrap();

        assert_eq!(response.face_details.len(), 2);
        let first = &response.face_details[0];
        let b = normalized_box(first.bounding_box.as_ref().unwrap());
        assert_eq!((b.left, b.top, b.width, b.height), (0.1, 0.2, 0.25, 0.5));
        assert_eq!(mid_age(first.age_range.as_ref().unwrap()), Some(35.0));
        assert!(response.face_details[1].bounding_box.is_none());
    }

    #[test]
    fn test_user_matches_become_candidates() {
        let response: SearchUsersResponse = decode(json!({
            "UserMatches": [
                {"Similarity": 92.5, "User": {"UserId": "7", "UserStatus": "ACTIVE"}},
                {"Similarity": 80.0},
                {"Similarity": 71.0, "User": {"UserId": "3"}}
            ],
            "FaceModelVersion": "7.0"
        }))
        .unwrap();

        let found = candidates(response);
        assert_eq!(found, vec![Candidate::new("7", 0.925), Candidate::new("3", 0.71)]);
    }

    #[test]
    fn test_pages_decode() {
        let users: ListUsersResponse = decode(json!({
            "Users": [{"UserId": "1", "UserStatus": "ACTIVE"}, {"UserId": "2"}],
            "NextToken": "abc"
        }))
        .unwrap();
        assert_eq!(users.users.len(), 2);
        assert_eq!(users.next_token.as_deref(), Some("abc"));

        let indexed: IndexFacesResponse = decode(json!({
            "FaceRecords": [{"Face": {"FaceId": "0b1c", "Confidence": 99.9}}],
            "UnindexedFaces": []
        }))
        .unwrap();
        assert_eq!(indexed.face_records[0].face.as_ref().unwrap().face_id, "0b1c");
    }

    #[test]
    fn test_single_face_searches_whole_image() {
        let image = sample_png(40, 20);
        let tokens = face_tokens(&image, &[None]).unwrap();
        assert_eq!(tokens, vec![STANDARD.encode(&image)]);
        assert!(face_tokens(&image, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_several_faces_are_cropped_apart() {
        let image = sample_png(40, 20);
        let left = NormalizedBox {
            left: 0.0,
            top: 0.0,
            width: 0.5,
            height: 1.0,
        };
        let tokens = face_tokens(&image, &[Some(left), None]).unwrap();

        let crop = image::load_from_memory(&STANDARD.decode(&tokens[0]).unwrap()).unwrap();
        assert_eq!((crop.width(), crop.height()), (20, 20));
        assert_eq!(tokens[1], STANDARD.encode(&image));
    }

    #[test]
    fn test_credentials_fall_back_to_environment() {
        let config = AwsConfig::default();
        assert_eq!(AwsCredentials::resolve(&config, |_| None), None);

        let env = |name: &str| match name {
            "AWS_ACCESS_KEY_ID" => Some("AKID".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("secret".to_string()),
            _ => None,
        };
        let resolved = AwsCredentials::resolve(&config, env).unwrap();
        assert_eq!(resolved.access_key_id, "AKID");
        assert!(resolved.session_token.is_none());

        let mut config = AwsConfig::default();
        config.access_key_id = Some("FROMFILE".to_string());
        assert_eq!(AwsCredentials::resolve(&config, env).unwrap().access_key_id, "FROMFILE");
    }

    #[test]
    fn test_new_targets_regional_endpoint() {
        let mut config = FacesConfig::default();
        config.aws.region = "eu-central-1".to_string();
        let provider = AwsFaceProvider::new(&config, credentials());
        assert_eq!(provider.endpoint, "https://rekognition.eu-central-1.amazonaws.com");
        assert_eq!(provider.host, "rekognition.eu-central-1.amazonaws.com");

        config.aws.endpoint = Some("http://localhost:4566/".to_string());
        let provider = AwsFaceProvider::new(&config, credentials());
        assert_eq!(provider.endpoint, "http://localhost:4566");
        assert_eq!(provider.host, "localhost:4566");
    }
}

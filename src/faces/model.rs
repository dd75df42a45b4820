use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::photo::Rect;

/// Where a face stands in the identification workflow.
///
/// Identification consumes only `ForReprocessing` and produces only
/// `NotIdentified` or `Identified`. `Excluded` belongs to manual curation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityStatus {
    #[default]
    ForReprocessing,
    NotIdentified,
    Identified,
    Excluded,
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentityStatus::ForReprocessing => "for_reprocessing",
            IdentityStatus::NotIdentified => "not_identified",
            IdentityStatus::Identified => "identified",
            IdentityStatus::Excluded => "excluded",
        };
        f.write_str(name)
    }
}

/// Bounding box as fractions (0.0-1.0) of the analysed image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl NormalizedBox {
    /// Pixel rectangle inside an image of `width` x `height`, clamped to its
    /// bounds.
    pub fn to_pixels(&self, width: u32, height: u32) -> Rect {
        let w = width as f32;
        let h = height as f32;
        let x = (self.left.clamp(0.0, 1.0) * w).round() as i32;
        let y = (self.top.clamp(0.0, 1.0) * h).round() as i32;
        let right = ((self.left + self.width).clamp(0.0, 1.0) * w).round() as i32;
        let bottom = ((self.top + self.height).clamp(0.0, 1.0) * h).round() as i32;
        Rect {
            x,
            y,
            width: (right - x).max(0),
            height: (bottom - y).max(0),
        }
    }
}

/// A provider's handle on an indexed face sample. Provider and id travel
/// together, so a face is either known to a provider or it is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRef {
    pub provider: String,
    pub external_id: String,
    pub external_guid: Option<Uuid>,
}

impl ExternalRef {
    /// The guid is read from the id itself or, for ids like `local:<uuid>`,
    /// from what follows the provider prefix.
    pub fn new(provider: impl Into<String>, external_id: impl Into<String>) -> Self {
        let external_id = external_id.into();
        let external_guid = Uuid::parse_str(&external_id).ok().or_else(|| {
            external_id
                .split_once(':')
                .and_then(|(_, rest)| Uuid::parse_str(rest).ok())
        });
        Self {
            provider: provider.into(),
            external_id,
            external_guid,
        }
    }

    pub fn is_for(&self, provider: &str) -> bool {
        self.provider.eq_ignore_ascii_case(provider)
    }
}

/// A detected face in a photo
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub id: i64,
    pub photo_id: i64,
    pub rect: Option<Rect>,
    pub person_id: Option<i64>,
    pub identity_status: IdentityStatus,
    pub identified_with_confidence: f64,
    pub age: Option<f32>,
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub external: Option<ExternalRef>,
}

/// A named identity, independent of any provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub name: String,
    /// Provider this person is pinned to, if any. Unpinned persons are synced
    /// to whichever provider is configured.
    pub provider: Option<String>,
}

impl Person {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            provider: None,
        }
    }

    /// Key under which the person is registered as a provider user.
    pub fn user_key(&self) -> String {
        self.id.to_string()
    }

    pub fn syncs_to(&self, provider: &str) -> bool {
        self.provider
            .as_deref()
            .map_or(true, |p| p.eq_ignore_ascii_case(provider))
    }
}

/// One ranked match returned by an identify call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub user_key: String,
    pub confidence: f64,
}

impl Candidate {
    pub fn new(user_key: impl Into<String>, confidence: f64) -> Self {
        Self {
            user_key: user_key.into(),
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_ref_parses_guid_when_possible() {
        let guid = Uuid::new_v4();
        let r = ExternalRef::new("azure", guid.to_string());
        assert_eq!(r.external_guid, Some(guid));

        let r = ExternalRef::new("local", "local:17");
        assert_eq!(r.external_guid, None);
        assert!(r.is_for("LOCAL"));
    }

    #[test]
    fn test_external_ref_guid_after_provider_prefix() {
        let guid = Uuid::new_v4();
        let r = ExternalRef::new("local", format!("local:{guid}"));
        assert_eq!(r.external_guid, Some(guid));
        assert_eq!(r.external_id, format!("local:{guid}"));
    }

    #[test]
    fn test_normalized_box_clamps_to_image() {
        let b = NormalizedBox {
            left: 0.9,
            top: -0.1,
            width: 0.3,
            height: 0.5,
        };
        let rect = b.to_pixels(100, 200);
        assert_eq!(rect.x, 90);
        assert_eq!(rect.y, 0);
        assert_eq!(rect.width, 10);
        assert_eq!(rect.height, 80);
    }

    #[test]
    fn test_person_pinning() {
        let mut p = Person::new(3, "Ada");
        assert!(p.syncs_to("azure"));
        p.provider = Some("Local".to_string());
        assert!(!p.syncs_to("azure"));
        assert!(p.syncs_to("local"));
        assert_eq!(p.user_key(), "3");
    }
}

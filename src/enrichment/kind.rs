use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of enrichment steps a photo can go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnricherKind {
    Preview,
    Metadata,
    Thumbnail,
    Analyze,
    Caption,
    Tag,
    Category,
    Color,
    ObjectProperty,
    Adult,
    Face,
}

impl EnricherKind {
    pub const ALL: [EnricherKind; 11] = [
        EnricherKind::Preview,
        EnricherKind::Metadata,
        EnricherKind::Thumbnail,
        EnricherKind::Analyze,
        EnricherKind::Caption,
        EnricherKind::Tag,
        EnricherKind::Category,
        EnricherKind::Color,
        EnricherKind::ObjectProperty,
        EnricherKind::Adult,
        EnricherKind::Face,
    ];

    /// Kinds that must have completed before this one may start.
    pub fn prerequisites(&self) -> &'static [EnricherKind] {
        use EnricherKind::*;
        match self {
            Preview => &[],
            Metadata | Thumbnail | Analyze => &[Preview],
            Caption | Tag | Category | Color | ObjectProperty | Adult | Face => &[Analyze],
        }
    }

    /// Kinds whose output lives only in the per-run source data and so must
    /// run again whenever a dependent needs them.
    pub fn is_data_provider(&self) -> bool {
        matches!(self, EnricherKind::Preview | EnricherKind::Analyze)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EnricherKind::Preview => "preview",
            EnricherKind::Metadata => "metadata",
            EnricherKind::Thumbnail => "thumbnail",
            EnricherKind::Analyze => "analyze",
            EnricherKind::Caption => "caption",
            EnricherKind::Tag => "tag",
            EnricherKind::Category => "category",
            EnricherKind::Color => "color",
            EnricherKind::ObjectProperty => "object_property",
            EnricherKind::Adult => "adult",
            EnricherKind::Face => "face",
        }
    }
}

impl fmt::Display for EnricherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EnricherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        EnricherKind::ALL
            .iter()
            .copied()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| format!("unknown enricher kind: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prerequisites_stay_inside_enumeration() {
        for kind in EnricherKind::ALL {
            for prereq in kind.prerequisites() {
                assert!(EnricherKind::ALL.contains(prereq));
                assert_ne!(*prereq, kind);
            }
        }
    }

    #[test]
    fn test_parse_round_trips_names() {
        for kind in EnricherKind::ALL {
            assert_eq!(kind.name().parse::<EnricherKind>().unwrap(), kind);
        }
        assert_eq!("Object-Property".parse::<EnricherKind>().unwrap(), EnricherKind::ObjectProperty);
        assert!("sharpness".parse::<EnricherKind>().is_err());
    }
}

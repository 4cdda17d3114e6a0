use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One detected face occurrence in a photo or video frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub id: String,

    /// Owning photo. Opaque to this crate; must not contain ':'.
    pub photo_id: String,

    /// Location in the source image as `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],

    /// Detector confidence.
    pub confidence: f32,

    #[serde(default)]
    pub embedding: Option<Vec<f32>>,

    /// Position in seconds when the face comes from a video frame.
    #[serde(default)]
    pub timestamp: Option<f64>,

    /// The person this face belongs to, if resolved.
    #[serde(default)]
    pub person_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// A face record as delivered by the upstream detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceInput {
    pub photo_id: String,
    pub bbox: [f32; 4],
    pub confidence: f32,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// A named or placeholder identity.
///
/// Faces, photo associations and dismissed merge pairs live in their own
/// keys; see `keys.rs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_photo_id: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub starred: bool,
    /// DBSCAN label the person was discovered from. Informational only.
    #[serde(default)]
    pub cluster_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Bumped by every committed write that touches this person.
    #[serde(default)]
    pub revision: u64,
}

/// A proposed duplicate pairing, `person_a < person_b`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeSuggestion {
    pub person_a: String,
    pub person_b: String,
    pub distance: f32,
    /// `round((1 - distance) * 100, 1)`.
    pub confidence: f64,
    pub name_a: String,
    pub name_b: String,
    pub placeholder_a: bool,
    pub placeholder_b: bool,
    pub faces_a: usize,
    pub faces_b: usize,
}

impl MergeSuggestion {
    pub fn has_placeholder(&self) -> bool {
        self.placeholder_a || self.placeholder_b
    }
}

/// Another person close to a given one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarPerson {
    pub person_id: String,
    pub name: String,
    pub distance: f32,
    pub confidence: f64,
}

/// Result of a successful merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub source: String,
    pub target: String,
    pub faces_moved: usize,
    pub photos_added: usize,
}

/// A person with the counts used for listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonSummary {
    pub person: Person,
    pub placeholder: bool,
    pub face_count: usize,
    pub photo_count: usize,
}

/// Consistency report for one person.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnosis {
    pub person_id: String,
    pub face_count: usize,
    pub photo_count: usize,
    /// Photos holding one of the person's faces but not associated with it.
    pub missing_associations: Vec<String>,
    /// Associated photos that hold none of the person's faces.
    pub associations_without_faces: Vec<String>,
    /// False when the avatar photo holds none of the person's faces.
    pub avatar_valid: bool,
}

impl Diagnosis {
    pub fn is_consistent(&self) -> bool {
        self.missing_associations.is_empty() && self.avatar_valid
    }
}

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PeopleError;
use crate::retry::RetryPolicy;

/// Controls engine behavior. Every field has a default, so a YAML file only
/// needs to list what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Embedding dimension delivered by the detector.
    pub dim: usize,

    /// Maximum cosine distance for assigning a face to an existing person.
    pub match_threshold: f32,

    /// Upper bound on representative centers per person.
    pub max_centroids: usize,

    /// DBSCAN neighborhood radius (cosine distance).
    pub cluster_eps: f32,

    /// DBSCAN core-point neighborhood size.
    pub cluster_min_samples: usize,

    /// Maximum aggregate distance for a merge suggestion.
    pub suggest_threshold: f32,

    /// Batch auto-merge above this confidence (percent).
    pub auto_merge_confidence: f64,

    /// Batch auto-merge above this confidence when either side still has a
    /// placeholder name.
    pub placeholder_auto_merge_confidence: f64,

    /// Placeholder names are this prefix followed by a positive integer.
    pub placeholder_prefix: String,

    /// Retry policy for transient storage failures.
    pub retry: RetryPolicy,

    /// Re-read attempts when a single-face write loses an optimistic race.
    pub conflict_retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dim: 512,
            match_threshold: 0.2,
            max_centroids: 5,
            cluster_eps: 0.2,
            cluster_min_samples: 2,
            suggest_threshold: 0.2,
            auto_merge_confidence: 95.0,
            placeholder_auto_merge_confidence: 85.0,
            placeholder_prefix: "Person_".to_string(),
            retry: RetryPolicy::default(),
            conflict_retries: 5,
        }
    }
}

fn check_distance(name: &str, v: f32) -> Result<(), PeopleError> {
    if !v.is_finite() || v <= 0.0 || v > 2.0 {
        return Err(PeopleError::Config(format!("{name} must be in (0, 2], got {v}")));
    }
    Ok(())
}

impl EngineConfig {
    /// Parse a YAML document.
    pub fn from_yaml(s: &str) -> Result<Self, PeopleError> {
        let cfg: Self = serde_yaml::from_str(s).map_err(|e| PeopleError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PeopleError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| PeopleError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&data)
    }

    pub fn validate(&self) -> Result<(), PeopleError> {
        if self.dim == 0 {
            return Err(PeopleError::Config("dim must be positive".into()));
        }
        check_distance("match_threshold", self.match_threshold)?;
        check_distance("cluster_eps", self.cluster_eps)?;
        check_distance("suggest_threshold", self.suggest_threshold)?;
        if self.max_centroids == 0 {
            return Err(PeopleError::Config("max_centroids must be positive".into()));
        }
        if self.cluster_min_samples == 0 {
            return Err(PeopleError::Config("cluster_min_samples must be positive".into()));
        }
        if self.placeholder_prefix.is_empty() || self.placeholder_prefix.contains(':') {
            return Err(PeopleError::Config(
                "placeholder_prefix must be non-empty and free of ':'".into(),
            ));
        }
        Ok(())
    }

    /// The placeholder name with suffix `n`, e.g. `Person_7`.
    pub fn placeholder_name(&self, n: u64) -> String {
        format!("{}{n}", self.placeholder_prefix)
    }

    /// The integer suffix of a placeholder name, or `None` for a real name.
    pub fn placeholder_suffix(&self, name: &str) -> Option<u64> {
        let digits = name.strip_prefix(&self.placeholder_prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Leading zeros would let "Person_07" shadow "Person_7".
        if digits.len() > 1 && digits.starts_with('0') {
            return None;
        }
        digits.parse().ok().filter(|&n| n > 0)
    }

    pub fn is_placeholder(&self, name: &str) -> bool {
        self.placeholder_suffix(name).is_some()
    }
}

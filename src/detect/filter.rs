//! Which detected categories are worth keeping in history.

use serde::{Deserialize, Serialize};

use crate::detect::result::Detections;

pub const WILDCARD: &str = "*";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryFilter {
    types: Vec<String>,
}

impl CategoryFilter {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types
                .into_iter()
                .map(|s| s.into().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Matches any non-empty detection set.
    pub fn all() -> Self {
        Self::new([WILDCARD])
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub fn accepts_all(&self) -> bool {
        self.types.iter().any(|t| t == WILDCARD)
    }

    pub fn matches(&self, detections: &Detections) -> bool {
        if detections.is_empty() {
            return false;
        }
        self.accepts_all()
            || detections
                .categories()
                .any(|c| self.types.iter().any(|t| t == c))
    }

    /// Categories to store for a matching frame: every detected category,
    /// not only the configured ones. Empty when the filter does not match.
    pub fn select(&self, detections: &Detections) -> Vec<String> {
        if !self.matches(detections) {
            return Vec::new();
        }
        detections.categories().map(str::to_string).collect()
    }
}

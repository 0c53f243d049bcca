//! The company record being screened.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A company submitted for screening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier, unique within a batch.
    pub id: String,
    pub name: String,
    /// General description used as context for description-sourced criteria.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub website: Option<String>,
    /// Free-form columns carried through from the input.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            website: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }
}

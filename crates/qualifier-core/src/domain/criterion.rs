//! Criterion hierarchy: general, qualification, mandatory and nice-to-have.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use qualifier_store::ContentDigest;
use serde::{Deserialize, Serialize};

use super::error::{CriteriaError, CriteriaResult};

/// Evaluation stage a criterion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    General,
    Qualification,
    Mandatory,
    NiceToHave,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::General => "general",
            Stage::Qualification => "qualification",
            Stage::Mandatory => "mandatory",
            Stage::NiceToHave => "nice_to_have",
        };
        f.write_str(s)
    }
}

/// Where the context text for a criterion comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSelector {
    /// The entity's own general description.
    #[default]
    Description,
    /// Content of the entity's website.
    Website,
    /// Web search results for the criterion's query.
    WebSearch,
    /// Search followed by scraping of the top results.
    DeepScrape,
}

/// A single business criterion. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub stage: Stage,
    /// Target audience; `None` only for general criteria.
    #[serde(default)]
    pub audience: Option<String>,
    pub text: String,
    #[serde(default)]
    pub source: SourceSelector,
    /// Optional search query handed to the information source.
    #[serde(default)]
    pub search_query: Option<String>,
}

impl Criterion {
    pub fn new(id: impl Into<String>, stage: Stage, audience: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage,
            audience: audience.map(str::to_string),
            text: text.into(),
            source: SourceSelector::Description,
            search_query: None,
        }
    }

    pub fn with_source(mut self, source: SourceSelector) -> Self {
        self.source = source;
        self
    }
}

#[derive(Debug, Deserialize)]
struct CriteriaFile {
    version: String,
    criteria: Vec<Criterion>,
}

#[derive(Serialize)]
struct CanonicalCriteria<'a> {
    version: &'a str,
    criteria: &'a [Criterion],
}

/// Validated, versioned criterion set with a content digest identity.
#[derive(Debug, Clone)]
pub struct CriteriaSet {
    version: String,
    criteria: Vec<Criterion>,
    audiences: Vec<String>,
    digest: ContentDigest,
}

impl CriteriaSet {
    /// Validate `criteria` and compute the set's identity.
    pub fn new(version: impl Into<String>, criteria: Vec<Criterion>) -> CriteriaResult<Self> {
        let version = version.into();
        let audiences = validate(&criteria)?;
        let canonical = serde_json::to_vec(&CanonicalCriteria {
            version: &version,
            criteria: &criteria,
        })?;
        Ok(Self {
            digest: ContentDigest::from_bytes(&canonical),
            version,
            criteria,
            audiences,
        })
    }

    /// Parse a `{ "version": ..., "criteria": [...] }` JSON document.
    pub fn from_json_str(json: &str) -> CriteriaResult<Self> {
        let file: CriteriaFile = serde_json::from_str(json)?;
        Self::new(file.version, file.criteria)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> CriteriaResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.id == id)
    }

    /// Audiences in the order their qualification questions were declared.
    pub fn audiences(&self) -> &[String] {
        &self.audiences
    }

    pub fn general(&self) -> Vec<&Criterion> {
        self.by_stage(Stage::General, None)
    }

    /// One question per audience, in audience order.
    pub fn qualification(&self) -> Vec<&Criterion> {
        self.by_stage(Stage::Qualification, None)
    }

    pub fn mandatory(&self, audience: &str) -> Vec<&Criterion> {
        self.by_stage(Stage::Mandatory, Some(audience))
    }

    pub fn nice_to_have(&self, audience: &str) -> Vec<&Criterion> {
        self.by_stage(Stage::NiceToHave, Some(audience))
    }

    /// Criterion counts per audience: `(mandatory, nice_to_have)`.
    pub fn audience_summary(&self) -> BTreeMap<String, (usize, usize)> {
        self.audiences
            .iter()
            .map(|a| (a.clone(), (self.mandatory(a).len(), self.nice_to_have(a).len())))
            .collect()
    }

    fn by_stage(&self, stage: Stage, audience: Option<&str>) -> Vec<&Criterion> {
        self.criteria
            .iter()
            .filter(|c| c.stage == stage)
            .filter(|c| audience.is_none() || c.audience.as_deref() == audience)
            .collect()
    }
}

fn validate(criteria: &[Criterion]) -> CriteriaResult<Vec<String>> {
    let mut ids = HashSet::new();
    let mut audiences: Vec<String> = Vec::new();

    for c in criteria {
        if !ids.insert(c.id.as_str()) {
            return Err(CriteriaError::DuplicateId { id: c.id.clone() });
        }
        if c.text.trim().is_empty() {
            return Err(CriteriaError::EmptyText { id: c.id.clone() });
        }
        match (c.stage, &c.audience) {
            (Stage::General, Some(_)) => {
                return Err(CriteriaError::UnexpectedAudience { id: c.id.clone() })
            }
            (Stage::General, None) => {}
            (_, None) => return Err(CriteriaError::MissingAudience { id: c.id.clone() }),
            (Stage::Qualification, Some(audience)) => {
                if audiences.contains(audience) {
                    return Err(CriteriaError::DuplicateQualification {
                        audience: audience.clone(),
                    });
                }
                audiences.push(audience.clone());
            }
            (_, Some(_)) => {}
        }
    }

    for c in criteria {
        if let (Stage::Mandatory | Stage::NiceToHave, Some(audience)) = (c.stage, &c.audience) {
            if !audiences.contains(audience) {
                return Err(CriteriaError::UnknownAudience {
                    id: c.id.clone(),
                    audience: audience.clone(),
                });
            }
        }
    }

    Ok(audiences)
}

//! Fact patches: the structured output of the extraction collaborator.
//!
//! A patch describes one chapter's worth of new or changed entities,
//! relationships, and explicit invalidations. Parsing is deliberately
//! lenient about the cosmetic damage language models inflict on JSON
//! (markdown fences, line comments) but strict about the structure itself.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::extract::ExtractError;

/// An entity mentioned or introduced in the chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntity {
    /// Entity name; resolution key against existing open entities.
    pub name: String,

    /// Type tag; defaults to `unknown` when the extractor omits it.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,

    /// Attribute map. Values keep their JSON form until reconciliation
    /// flattens them to stable strings.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

fn default_kind() -> String {
    "unknown".to_string()
}

/// A relationship asserted between two named entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRelationship {
    /// Subject entity name.
    pub subject: String,

    /// Object entity name.
    pub object: String,

    /// Relation label.
    pub relation: String,
}

/// An explicit statement that a previously valid fact no longer holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Invalidation {
    /// Ends the open relationship matching all three fields.
    Relationship {
        /// Subject entity name.
        subject: String,
        /// Object entity name.
        object: String,
        /// Relation label that is being revoked.
        relation: String,
    },

    /// Ends the open property for (entity, key).
    Property {
        /// Owning entity name.
        entity: String,
        /// Property key being revoked.
        key: String,
    },
}

/// One chapter's worth of extracted facts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactPatch {
    /// New or re-mentioned entities with their current attributes.
    #[serde(default)]
    pub entities: Vec<NewEntity>,

    /// Asserted relationships.
    #[serde(default)]
    pub relationships: Vec<NewRelationship>,

    /// Explicit invalidations.
    #[serde(default)]
    pub invalidated: Vec<Invalidation>,
}

/// Wire shape produced by the extraction prompt.
#[derive(Debug, Default, Deserialize)]
struct WirePatch {
    #[serde(default)]
    new_settings: WireSettings,
    #[serde(default)]
    invalidated_settings: Vec<Invalidation>,
}

#[derive(Debug, Default, Deserialize)]
struct WireSettings {
    #[serde(default)]
    entities: Vec<NewEntity>,
    #[serde(default)]
    relationships: Vec<NewRelationship>,
}

impl FactPatch {
    /// Returns true if the patch would not touch anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.invalidated.is_empty()
    }

    /// Parses raw model output into a patch.
    ///
    /// Strips markdown code fences and `//` line comments before parsing;
    /// models emit both despite instructions not to.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::MalformedPatch`] if the cleaned text is not
    /// the expected JSON structure.
    pub fn from_model_output(raw: &str) -> Result<Self, ExtractError> {
        let cleaned = clean_model_json(raw);
        let wire: WirePatch =
            serde_json::from_str(&cleaned).map_err(|e| ExtractError::MalformedPatch {
                reason: e.to_string(),
            })?;
        Ok(Self {
            entities: wire.new_settings.entities,
            relationships: wire.new_settings.relationships,
            invalidated: wire.invalidated_settings,
        })
    }
}

/// A single contradiction between new chapter text and prior settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFinding {
    /// Offending passage quoted from the chapter.
    #[serde(default)]
    pub original_text: String,

    /// The established setting being contradicted.
    #[serde(default)]
    pub conflicting_setting: String,

    /// Chapter where that setting first appeared, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_chapter: Option<u32>,

    /// Short explanation of the contradiction.
    #[serde(default)]
    pub description: String,
}

/// Result of a conflict analysis run for one chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Detected contradictions; empty when the chapter is consistent.
    #[serde(default)]
    pub conflicts: Vec<ConflictFinding>,
}

impl ConflictReport {
    /// Parses raw model output into a report.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::MalformedPatch`] on structural failure.
    pub fn from_model_output(raw: &str) -> Result<Self, ExtractError> {
        let cleaned = clean_model_json(raw);
        serde_json::from_str(&cleaned).map_err(|e| ExtractError::MalformedPatch {
            reason: e.to_string(),
        })
    }
}

/// Flattens a JSON value to the stable string form used for version
/// comparison. Scalars print bare; objects and arrays keep their compact
/// JSON encoding so structurally equal values compare equal.
#[must_use]
pub fn stable_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn line_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Mirrors the prompt-side cleanup: strip whitespace-led // comments.
    RE.get_or_init(|| Regex::new(r"\s//[^\n]*").expect("static regex"))
}

fn clean_model_json(raw: &str) -> String {
    let no_fences = raw.replace("```json", "").replace("```", "");
    line_comment_re()
        .replace_all(no_fences.trim(), "")
        .into_owned()
}

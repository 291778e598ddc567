//! Versioned fact rows: entities, properties, and relationships.
//!
//! Each row carries a [`ChapterSpan`] validity interval. Rows are never
//! edited in place after creation; reconciliation only opens new rows and
//! closes superseded ones. Row ids are monotonic store-allocated sequences
//! so "most recently opened" is well defined when the single-open invariant
//! has been violated by bad input.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::span::ChapterSpan;
use crate::world::WorldId;

macro_rules! fact_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw row id.
            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw row id.
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

fact_id! {
    /// Monotonic identifier of an entity fact row.
    EntityId
}

fact_id! {
    /// Monotonic identifier of a property fact row.
    PropertyId
}

fact_id! {
    /// Monotonic identifier of a relationship fact row.
    RelationshipId
}

/// An entity of the fictional world (character, faction, location, ...).
///
/// Name and kind are fixed at creation; only the validity span changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFact {
    /// Row id, monotonic per store.
    pub id: EntityId,

    /// Owning world.
    pub world_id: WorldId,

    /// Display name; the reconciliation key. Not guaranteed unique.
    pub name: String,

    /// Free-form type tag (e.g. `人物`, `组织`, `地点`).
    pub kind: String,

    /// Validity interval in chapter numbers.
    pub span: ChapterSpan,
}

/// One version of a key/value attribute of an entity.
///
/// Multiple rows may share a key over time; at most one is valid at any
/// chapter for a given (entity, key) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyFact {
    /// Row id, monotonic per store.
    pub id: PropertyId,

    /// Owning entity row.
    pub entity_id: EntityId,

    /// Attribute key.
    pub key: String,

    /// Attribute value in its stable string form.
    pub value: String,

    /// Validity interval in chapter numbers.
    pub span: ChapterSpan,
}

/// One version of a directed relationship between two entities.
///
/// Endpoints are canonical entity ids; the names are denormalized display
/// copies captured at reconciliation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipFact {
    /// Row id, monotonic per store.
    pub id: RelationshipId,

    /// Owning world.
    pub world_id: WorldId,

    /// Canonical subject entity.
    pub subject_id: EntityId,

    /// Canonical object entity.
    pub object_id: EntityId,

    /// Subject display name at reconciliation time.
    pub subject: String,

    /// Object display name at reconciliation time.
    pub object: String,

    /// Relation label (e.g. `师徒`); may change across versions.
    pub relation: String,

    /// Validity interval in chapter numbers.
    pub span: ChapterSpan,
}

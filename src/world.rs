//! Worlds: the top-level container scoping all chapters and facts.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique, stable world identifier.
///
/// # Examples
///
/// ```
/// use loregraph::WorldId;
///
/// let id = WorldId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorldId(Uuid);

impl WorldId {
    /// Creates a new random world ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a world ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Creates a nil world ID (for testing or sentinel values).
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for WorldId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for WorldId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<WorldId> for Uuid {
    fn from(id: WorldId) -> Self {
        id.0
    }
}

/// A fictional world (one novel) and its metadata.
///
/// All chapters, entities, properties, and relationships belong to exactly
/// one world; the world ID scopes every query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    /// Globally unique identifier.
    pub id: WorldId,

    /// Display title (also drives manuscript file resolution).
    pub title: String,

    /// Author name, free-form.
    pub author: String,

    /// When the world record was created.
    pub created_at: DateTime<Utc>,
}

impl World {
    /// Creates a new world with a fresh ID.
    #[must_use]
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: WorldId::new(),
            title: title.into(),
            author: author.into(),
            created_at: Utc::now(),
        }
    }
}

impl PartialEq for World {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for World {}

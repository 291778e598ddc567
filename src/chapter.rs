//! Chapters: the ordered log of narrative text per world.
//!
//! A chapter's number is the dense user-assigned sequence that doubles as
//! the versioning time axis. Numbers stay unique per world and never change
//! once assigned; deletions leave gaps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::patch::ConflictReport;
use crate::world::WorldId;

/// Store-allocated chapter row identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChapterId(u64);

impl ChapterId {
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

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One chapter of a world's manuscript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    /// Store-allocated row id.
    pub id: ChapterId,

    /// Owning world.
    pub world_id: WorldId,

    /// Position in the reading order; unique per world, immutable.
    pub number: u32,

    /// Chapter heading as found in the manuscript.
    pub title: String,

    /// Raw chapter text.
    pub content: String,

    /// When the chapter row was created.
    pub created_at: DateTime<Utc>,

    /// Cached result of the latest conflict analysis, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_cache: Option<ConflictReport>,
}

impl Chapter {
    /// Returns true if a conflict analysis result is cached.
    #[must_use]
    pub fn has_conflict_cache(&self) -> bool {
        self.conflict_cache.is_some()
    }
}

impl PartialEq for Chapter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Chapter {}

/// A chapter listing entry annotated with its extraction status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterStatus {
    /// Chapter position.
    pub number: u32,

    /// Chapter heading.
    pub title: String,

    /// True if the extraction watermark has passed this chapter.
    pub extracted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(number: u32) -> Chapter {
        Chapter {
            id: ChapterId::from_raw(u64::from(number)),
            world_id: WorldId::new(),
            number,
            title: format!("第{number}章"),
            content: String::new(),
            created_at: Utc::now(),
            conflict_cache: None,
        }
    }

    #[test]
    fn test_chapter_id_roundtrip() {
        let id = ChapterId::from_raw(42);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(format!("{id}"), "42");
    }

    #[test]
    fn test_chapter_equality_is_by_id() {
        let a = sample(1);
        let mut b = a.clone();
        b.number = 2;
        assert_eq!(a, b);
    }

    #[test]
    fn test_conflict_cache_flag() {
        let mut chapter = sample(3);
        assert!(!chapter.has_conflict_cache());
        chapter.conflict_cache = Some(ConflictReport::default());
        assert!(chapter.has_conflict_cache());
    }
}

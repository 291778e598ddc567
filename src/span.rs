//! Chapter-indexed validity intervals.
//!
//! Chapters are the time axis of the store. Every fact carries a half-open
//! span `[start, end)` of chapter numbers; an unset end means the fact is
//! still valid as of the latest processed chapter.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A half-open interval of chapter numbers: `[start, end)`.
///
/// # Examples
///
/// ```
/// use loregraph::ChapterSpan;
///
/// let span = ChapterSpan::open(3);
/// assert!(span.is_open());
/// assert!(span.contains(3));
/// assert!(span.contains(100));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChapterSpan {
    /// First chapter at which the fact holds (inclusive).
    pub start: u32,

    /// First chapter at which the fact no longer holds (exclusive).
    /// `None` means the fact is still valid.
    pub end: Option<u32>,
}

impl ChapterSpan {
    /// Creates a closed span.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidSpan`] unless `end > start`.
    pub fn new(start: u32, end: u32) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::InvalidSpan { start, end });
        }
        Ok(Self {
            start,
            end: Some(end),
        })
    }

    /// Creates an open-ended span anchored at `start`.
    #[must_use]
    pub const fn open(start: u32) -> Self {
        Self { start, end: None }
    }

    /// Returns true if the span has no end chapter yet.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Check whether a chapter falls within `[start, end)`.
    #[must_use]
    pub fn contains(&self, chapter: u32) -> bool {
        chapter >= self.start && self.end.map_or(true, |end| chapter < end)
    }

    /// Returns true if the fact has not ended as seen from `chapter`.
    ///
    /// This is the "currently open" lookup rule used during reconciliation:
    /// a fact whose end lies after the processing chapter is still the row
    /// to supersede, even though its start may also lie after it.
    #[must_use]
    pub fn live_at(&self, chapter: u32) -> bool {
        self.end.map_or(true, |end| end > chapter)
    }

    /// Closes the span at `end`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidSpan`] unless `end > start`.
    pub fn close(&mut self, end: u32) -> Result<(), ValidationError> {
        if end <= self.start {
            return Err(ValidationError::InvalidSpan {
                start: self.start,
                end,
            });
        }
        self.end = Some(end);
        Ok(())
    }

    /// Clears the end chapter, making the span open-ended again.
    pub fn reopen(&mut self) {
        self.end = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_degenerate_span() {
        assert!(ChapterSpan::new(3, 3).is_err());
        assert!(ChapterSpan::new(5, 2).is_err());
        assert!(ChapterSpan::new(3, 4).is_ok());
    }

    #[test]
    fn test_contains_half_open() {
        let span = ChapterSpan::new(3, 7).unwrap();
        assert!(!span.contains(2));
        assert!(span.contains(3));
        assert!(span.contains(6));
        assert!(!span.contains(7));
    }

    #[test]
    fn test_open_span_contains_everything_after_start() {
        let span = ChapterSpan::open(2);
        assert!(!span.contains(1));
        assert!(span.contains(2));
        assert!(span.contains(u32::MAX));
    }

    #[test]
    fn test_live_at_ignores_start() {
        // A fact anchored at a later chapter is still "the open row" as
        // seen from an earlier processing chapter.
        let span = ChapterSpan::open(9);
        assert!(span.live_at(2));

        let closed = ChapterSpan::new(1, 5).unwrap();
        assert!(closed.live_at(4));
        assert!(!closed.live_at(5));
        assert!(!closed.live_at(6));
    }

    #[test]
    fn test_close_and_reopen() {
        let mut span = ChapterSpan::open(3);
        assert!(span.close(3).is_err());
        span.close(7).unwrap();
        assert_eq!(span.end, Some(7));
        span.reopen();
        assert!(span.is_open());
    }

    #[test]
    fn test_span_serde_roundtrip() {
        let span = ChapterSpan::new(1, 4).unwrap();
        let json = serde_json::to_string(&span).unwrap();
        let back: ChapterSpan = serde_json::from_str(&json).unwrap();
        assert_eq!(span, back);
    }
}

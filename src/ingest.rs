//! Manuscript ingestion: locating novel files and splitting them into
//! chapters.
//!
//! Chapter headings follow the common Chinese web-novel convention:
//! a line starting (after optional indentation, full-width spaces
//! included) with `第`, a chapter index in digits or Chinese numerals,
//! and one of the unit characters `章`, `节`, or `回`. Everything between
//! two headings is the chapter body; text before the first heading is
//! dropped.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One chapter split out of a manuscript, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChapter {
    /// One-based position in the manuscript.
    pub number: u32,

    /// Heading line, trimmed.
    pub title: String,

    /// Body text between this heading and the next.
    pub content: String,
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[ \t\u{3000}]*(第[0-9零一二三四五六七八九十百千]+[章节回][^\n]*)")
            .expect("static regex")
    })
}

/// Splits a manuscript into chapters at heading lines.
///
/// Returns an empty vector when the text holds no recognizable heading;
/// the caller decides whether that is an error.
#[must_use]
pub fn split_chapters(text: &str) -> Vec<RawChapter> {
    let headings: Vec<_> = heading_re().find_iter(text).collect();
    let mut chapters = Vec::with_capacity(headings.len());
    for (i, heading) in headings.iter().enumerate() {
        let body_start = heading.end();
        let body_end = headings
            .get(i + 1)
            .map_or(text.len(), |next| next.start());
        chapters.push(RawChapter {
            number: u32::try_from(i + 1).unwrap_or(u32::MAX),
            title: heading.as_str().trim().to_string(),
            content: text[body_start..body_end].trim().to_string(),
        });
    }
    debug!(chapters = chapters.len(), "split manuscript");
    chapters
}

/// The filenames a manuscript for `title` may be stored under, in probe
/// order. The title is tried bare, with guillemets stripped or added, and
/// with the usual release-name suffixes.
#[must_use]
pub fn candidate_filenames(title: &str) -> Vec<String> {
    let clean = title.trim_matches(|c| c == '《' || c == '》').trim();
    let candidates = [
        format!("{clean}.txt"),
        format!("《{clean}》.txt"),
        format!("{clean}小说.txt"),
        format!("{clean}全本.txt"),
        format!("{clean}完整版.txt"),
        format!("{clean}全集.txt"),
        format!("{title}.txt"),
        format!("{clean}（全本）.txt"),
        format!("{clean}(全本).txt"),
        format!("{clean}.TXT"),
    ];
    // The raw-title variant collides with the first entry for clean
    // titles; keep probe order, drop repeats.
    let mut names: Vec<String> = Vec::with_capacity(candidates.len());
    for name in candidates {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Finds the manuscript file for a world title under `root`, probing the
/// candidate filenames in order.
#[must_use]
pub fn find_novel_file(title: &str, root: &Path) -> Option<PathBuf> {
    for name in candidate_filenames(title) {
        let path = root.join(&name);
        if path.is_file() {
            debug!(path = %path.display(), "resolved manuscript file");
            return Some(path);
        }
    }
    None
}

//! # loregraph - A Versioned Knowledge Graph for Fictional Worlds
//!
//! loregraph keeps the settings of a novel (characters, factions,
//! locations, their attributes and relationships) as chapter-indexed,
//! versioned facts. Every fact carries a half-open validity interval of
//! chapter numbers, so the store can answer "what was true as of chapter
//! N" for any N, diff adjacent chapters, and roll extraction back without
//! touching the manuscript.
//!
//! ## Core Concepts
//!
//! - **World**: one novel; the scope of all chapters and facts
//! - **Chapter**: the time axis; numbers are dense, unique, immutable
//! - **Fact**: an entity, property, or relationship row with a
//!   `[start_chapter, end_chapter)` validity span
//! - **Patch**: one chapter's extracted changes, reconciled against the
//!   prior snapshot into an atomic write batch
//! - **Snapshot**: the complete settings picture as of one chapter
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use loregraph::{InMemoryLoreStore, LoreEngine};
//!
//! let engine = LoreEngine::new(Arc::new(InMemoryLoreStore::new()), extractor);
//! let world = engine.create_world("凡人修仙传", "忘语")?;
//! engine.import_chapters(world.id, loregraph::split_chapters(&manuscript))?;
//! engine.batch_extract_to(world.id, 10)?;
//!
//! let snapshot = engine.materialize(world.id, 7)?;
//! let graph = engine.knowledge_graph(world.id, 7, 2)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod chapter;
pub mod error;
pub mod fact;
pub mod patch;
pub mod snapshot;
pub mod span;
pub mod world;

// Storage, extraction, and the engine
pub mod engine;
pub mod extract;
pub mod graph;
pub mod ingest;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use chapter::{Chapter, ChapterId, ChapterStatus};
pub use engine::{
    BatchOutcome, ChapterFailure, LoreEngine, ReconcileOutcome, SkippedRelationship,
};
pub use error::{LoreError, LoreResult, ValidationError};
pub use extract::{CredentialPool, ExtractError, ExtractionConfig, SettingExtractor};
pub use fact::{EntityFact, EntityId, PropertyFact, PropertyId, RelationshipFact, RelationshipId};
pub use graph::{GraphEdge, GraphNode, KnowledgeGraph, NodeRef, PathResult, SkippedEdge};
pub use ingest::{candidate_filenames, find_novel_file, split_chapters, RawChapter};
pub use patch::{ConflictFinding, ConflictReport, FactPatch, Invalidation, NewEntity, NewRelationship};
pub use snapshot::{
    ChapterChanges, HistoryChange, HistoryEvent, PropertyChange, SnapshotEntity,
    SnapshotRelationship, WorldSnapshot,
};
pub use span::ChapterSpan;
pub use storage::{InMemoryLoreStore, LoreStore, StorageError, WriteBatch, WriteOp};
pub use world::{World, WorldId};

//! Abstract storage contract for loregraph.
//!
//! One trait covers worlds, chapters, and the three fact tables because
//! the reconciliation and range operations need cross-table atomicity:
//! a chapter's writes land as one [`WriteBatch`] or not at all, and a
//! cascading delete commits its fact surgery together with the chapter
//! deletion. Splitting the contract per table would push the transaction
//! boundary into the engine, where it cannot be honored.

use thiserror::Error;

use crate::chapter::Chapter;
use crate::fact::{
    EntityFact, EntityId, PropertyFact, PropertyId, RelationshipFact, RelationshipId,
};
use crate::patch::ConflictReport;
use crate::world::{World, WorldId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// World not found.
    #[error("world not found: {0}")]
    WorldNotFound(WorldId),

    /// Chapter not found in the given world.
    #[error("chapter {number} not found in world {world}")]
    ChapterNotFound {
        /// Owning world.
        world: WorldId,
        /// Missing chapter number.
        number: u32,
    },

    /// A chapter with this number already exists in the world.
    #[error("chapter {number} already exists in world {world}")]
    DuplicateChapter {
        /// Owning world.
        world: WorldId,
        /// Duplicated chapter number.
        number: u32,
    },

    /// Entity fact row not found.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    /// A fact anchored to a chapter number that does not exist.
    #[error("fact anchored to missing chapter {number} in world {world}")]
    DanglingAnchor {
        /// Owning world.
        world: WorldId,
        /// Missing anchor chapter.
        number: u32,
    },

    /// Backend error.
    #[error("storage backend error: {0}")]
    BackendError(String),
}

/// A single mutation inside an atomic [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert a new entity row.
    InsertEntity(EntityFact),

    /// Insert a new property row.
    InsertProperty(PropertyFact),

    /// Insert a new relationship row.
    InsertRelationship(RelationshipFact),

    /// Close a property version at the given chapter.
    CloseProperty {
        /// Row to close.
        id: PropertyId,
        /// End chapter (exclusive).
        end: u32,
    },

    /// Close a relationship version at the given chapter.
    CloseRelationship {
        /// Row to close.
        id: RelationshipId,
        /// End chapter (exclusive).
        end: u32,
    },

    /// Delete a single property row (same-chapter supersede).
    DeleteProperty {
        /// Row to delete.
        id: PropertyId,
    },

    /// Delete a single relationship row (same-chapter supersede).
    DeleteRelationship {
        /// Row to delete.
        id: RelationshipId,
    },

    /// Reopen every fact (all three tables) whose end chapter lies in the
    /// set. Runs during rollback and cascading delete, before the
    /// corresponding start-anchored deletions.
    ReopenFactsEndedIn {
        /// Chapter numbers whose closures are being undone.
        numbers: Vec<u32>,
    },

    /// Delete every fact (all three tables) whose start chapter lies in
    /// the set, including properties orphaned by a deleted entity.
    DeleteFactsStartedIn {
        /// Chapter numbers whose facts are being removed.
        numbers: Vec<u32>,
    },

    /// Delete the chapter rows themselves.
    DeleteChapters {
        /// Chapter numbers to remove.
        numbers: Vec<u32>,
    },
}

/// An ordered list of mutations applied atomically for one world.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation.
    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    /// Number of operations in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The operations in application order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

/// Storage contract for worlds, chapters, and versioned facts.
///
/// Reads return committed state only; [`LoreStore::apply`] commits a batch
/// atomically or not at all. Implementations must be safe for concurrent
/// readers; writer serialization per world is the engine's responsibility.
pub trait LoreStore: Send + Sync {
    // Worlds ---------------------------------------------------------------

    /// Inserts a new world. Fails on duplicate id.
    fn insert_world(&self, world: World) -> Result<(), StorageError>;

    /// Fetches a world by id.
    fn world(&self, id: WorldId) -> Result<Option<World>, StorageError>;

    /// Lists all worlds.
    fn worlds(&self) -> Result<Vec<World>, StorageError>;

    /// Deletes a world and everything in it (chapters and facts).
    fn delete_world(&self, id: WorldId) -> Result<(), StorageError>;

    // Chapters -------------------------------------------------------------

    /// Inserts a chapter with a store-allocated id.
    ///
    /// # Errors
    ///
    /// `WorldNotFound` if the world is absent, `DuplicateChapter` if the
    /// number is taken.
    fn insert_chapter(
        &self,
        world: WorldId,
        number: u32,
        title: String,
        content: String,
    ) -> Result<Chapter, StorageError>;

    /// Fetches a chapter by (world, number).
    fn chapter(&self, world: WorldId, number: u32) -> Result<Option<Chapter>, StorageError>;

    /// All chapters of a world, ordered by number.
    fn chapters(&self, world: WorldId) -> Result<Vec<Chapter>, StorageError>;

    /// The highest-numbered chapter of a world.
    fn latest_chapter(&self, world: WorldId) -> Result<Option<Chapter>, StorageError>;

    /// Chapter numbers within `[start, end]`, or `[start, ..)` when `end`
    /// is `None`; ascending.
    fn chapter_numbers_in_range(
        &self,
        world: WorldId,
        start: u32,
        end: Option<u32>,
    ) -> Result<Vec<u32>, StorageError>;

    /// Caches a conflict analysis result on a chapter row.
    fn set_conflict_cache(
        &self,
        world: WorldId,
        number: u32,
        report: ConflictReport,
    ) -> Result<(), StorageError>;

    // Fact id allocation ---------------------------------------------------

    /// Allocates the next entity row id.
    fn allocate_entity_id(&self) -> EntityId;

    /// Allocates the next property row id.
    fn allocate_property_id(&self) -> PropertyId;

    /// Allocates the next relationship row id.
    fn allocate_relationship_id(&self) -> RelationshipId;

    // Fact reads -----------------------------------------------------------

    /// Fetches an entity row by id.
    fn entity(&self, id: EntityId) -> Result<Option<EntityFact>, StorageError>;

    /// Entities of a world whose span contains the chapter.
    fn entities_valid_at(
        &self,
        world: WorldId,
        chapter: u32,
    ) -> Result<Vec<EntityFact>, StorageError>;

    /// Properties of an entity whose span contains the chapter.
    fn properties_valid_at(
        &self,
        entity: EntityId,
        chapter: u32,
    ) -> Result<Vec<PropertyFact>, StorageError>;

    /// Relationships of a world whose span contains the chapter.
    fn relationships_valid_at(
        &self,
        world: WorldId,
        chapter: u32,
    ) -> Result<Vec<RelationshipFact>, StorageError>;

    /// Entities with the given name that are live as seen from the
    /// chapter (open, or ending after it), in row id order.
    fn live_entities_by_name(
        &self,
        world: WorldId,
        name: &str,
        chapter: u32,
    ) -> Result<Vec<EntityFact>, StorageError>;

    /// All entity rows with the given name, any validity, in row id order.
    fn entities_by_name(&self, world: WorldId, name: &str)
        -> Result<Vec<EntityFact>, StorageError>;

    /// Live property rows for (entity, key) as seen from the chapter.
    fn live_properties(
        &self,
        entity: EntityId,
        key: &str,
        chapter: u32,
    ) -> Result<Vec<PropertyFact>, StorageError>;

    /// Live relationship rows for (subject, object) as seen from the
    /// chapter.
    fn live_relationships(
        &self,
        world: WorldId,
        subject: EntityId,
        object: EntityId,
        chapter: u32,
    ) -> Result<Vec<RelationshipFact>, StorageError>;

    /// All property rows of an entity, any validity.
    fn properties_of(&self, entity: EntityId) -> Result<Vec<PropertyFact>, StorageError>;

    /// Entities whose span starts at one of the given chapters.
    fn entities_started_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<EntityFact>, StorageError>;

    /// Properties whose span starts at one of the given chapters.
    fn properties_started_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<PropertyFact>, StorageError>;

    /// Relationships whose span starts at one of the given chapters.
    fn relationships_started_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<RelationshipFact>, StorageError>;

    /// Entities whose span ends at one of the given chapters.
    fn entities_ended_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<EntityFact>, StorageError>;

    /// Properties whose span ends at one of the given chapters.
    fn properties_ended_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<PropertyFact>, StorageError>;

    /// Relationships whose span ends at one of the given chapters.
    fn relationships_ended_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<RelationshipFact>, StorageError>;

    /// Distinct entity names in a world.
    fn entity_names(&self, world: WorldId) -> Result<Vec<String>, StorageError>;

    /// The highest chapter number with any anchored fact; 0 when none.
    fn watermark(&self, world: WorldId) -> Result<u32, StorageError>;

    // Writes ---------------------------------------------------------------

    /// Applies a batch atomically for one world.
    ///
    /// Inserted fact spans must anchor to existing chapters of the world;
    /// otherwise the whole batch fails with `DanglingAnchor` and nothing
    /// is committed.
    fn apply(&self, world: WorldId, batch: WriteBatch) -> Result<(), StorageError>;
}

//! The loregraph engine: the single entry point tying storage, extraction,
//! and the read models together.
//!
//! All writes to one world are serialized through a per-world lock, so a
//! reconcile-plan-apply sequence never interleaves with another writer and
//! the single-open invariant holds without storage-level locking. Reads
//! take no lock; they see the last committed state.

mod reconcile;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chapter::{Chapter, ChapterStatus};
use crate::error::{LoreError, LoreResult, ValidationError};
use crate::extract::{ExtractionConfig, SettingExtractor};
use crate::graph::KnowledgeGraph;
use crate::ingest::RawChapter;
use crate::patch::ConflictReport;
use crate::snapshot::{
    ChapterChanges, HistoryChange, HistoryEvent, PropertyChange, SnapshotEntity,
    SnapshotRelationship, WorldSnapshot,
};
use crate::storage::{LoreStore, StorageError, WriteBatch, WriteOp};
use crate::world::{World, WorldId};

pub use reconcile::{ReconcileOutcome, SkippedRelationship};

/// Maximum number of hits an entity search returns.
const SEARCH_LIMIT: usize = 20;

/// Why a batch extraction run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterFailure {
    /// Chapter whose extraction failed.
    pub chapter: u32,

    /// Rendered error.
    pub error: String,
}

/// Result of a batch extraction run.
///
/// The run is fail-fast: chapters before the failure are committed and
/// stay committed, chapters after it are untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// First chapter the run attempted.
    pub start_chapter: u32,

    /// Last chapter the run was asked to reach.
    pub target_chapter: u32,

    /// Chapters whose batches committed, in processing order.
    pub successful_chapters: Vec<u32>,

    /// The failure that stopped the run, if any.
    pub failure: Option<ChapterFailure>,
}

impl BatchOutcome {
    /// Returns true if every requested chapter committed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// The versioned settings engine for fictional worlds.
pub struct LoreEngine {
    store: Arc<dyn LoreStore>,
    extractor: Arc<dyn SettingExtractor>,
    extraction: ExtractionConfig,
    world_locks: Mutex<HashMap<WorldId, Arc<Mutex<()>>>>,
}

impl LoreEngine {
    /// Creates an engine over the given store and extraction collaborator,
    /// with the default extraction policy (anonymous credential, one retry
    /// on rate limit).
    #[must_use]
    pub fn new(store: Arc<dyn LoreStore>, extractor: Arc<dyn SettingExtractor>) -> Self {
        Self {
            store,
            extractor,
            extraction: ExtractionConfig::default(),
            world_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the extraction policy (credential pool, retry bound).
    #[must_use]
    pub fn with_extraction_config(mut self, extraction: ExtractionConfig) -> Self {
        self.extraction = extraction;
        self
    }

    fn world_lock(&self, world: WorldId) -> LoreResult<Arc<Mutex<()>>> {
        let mut locks = self
            .world_locks
            .lock()
            .map_err(|_| LoreError::internal("poisoned world lock registry"))?;
        Ok(Arc::clone(locks.entry(world).or_default()))
    }

    fn guard(lock: &Mutex<()>) -> LoreResult<MutexGuard<'_, ()>> {
        lock.lock()
            .map_err(|_| LoreError::internal("poisoned world lock"))
    }

    // ----- worlds and chapters ------------------------------------------

    /// Creates a new world.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn create_world(&self, title: &str, author: &str) -> LoreResult<World> {
        let world = World::new(title, author);
        self.store.insert_world(world.clone())?;
        info!(world = %world.id, title, "created world");
        Ok(world)
    }

    /// Deletes a world and everything in it: chapters, entities,
    /// properties, relationships.
    ///
    /// # Errors
    ///
    /// [`StorageError::WorldNotFound`] if the world does not exist.
    pub fn delete_world(&self, world: WorldId) -> LoreResult<()> {
        let lock = self.world_lock(world)?;
        let _guard = Self::guard(&lock)?;
        self.store.delete_world(world)?;
        info!(world = %world, "deleted world");
        Ok(())
    }

    /// Lists all worlds, oldest first.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn worlds(&self) -> LoreResult<Vec<World>> {
        Ok(self.store.worlds()?)
    }

    /// Looks up one world.
    ///
    /// # Errors
    ///
    /// [`StorageError::WorldNotFound`] if the world does not exist.
    pub fn world(&self, world: WorldId) -> LoreResult<World> {
        Ok(self
            .store
            .world(world)?
            .ok_or(StorageError::WorldNotFound(world))?)
    }

    /// Adds one chapter to a world.
    ///
    /// # Errors
    ///
    /// [`StorageError::DuplicateChapter`] when the number is taken.
    pub fn add_chapter(
        &self,
        world: WorldId,
        number: u32,
        title: &str,
        content: &str,
    ) -> LoreResult<Chapter> {
        let chapter =
            self.store
                .insert_chapter(world, number, title.to_string(), content.to_string())?;
        Ok(chapter)
    }

    /// Imports split chapters in order. Chapters whose number already
    /// exists are skipped, not replaced.
    ///
    /// Returns the number of chapters actually inserted.
    ///
    /// # Errors
    ///
    /// Storage errors other than duplicates.
    pub fn import_chapters(&self, world: WorldId, chapters: Vec<RawChapter>) -> LoreResult<usize> {
        let mut inserted = 0;
        for raw in chapters {
            match self
                .store
                .insert_chapter(world, raw.number, raw.title, raw.content)
            {
                Ok(_) => inserted += 1,
                Err(StorageError::DuplicateChapter { number, .. }) => {
                    warn!(world = %world, number, "skipping already imported chapter");
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(world = %world, inserted, "imported chapters");
        Ok(inserted)
    }

    /// Lists a world's chapters with their extraction status.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn chapters(&self, world: WorldId) -> LoreResult<Vec<ChapterStatus>> {
        let watermark = self.store.watermark(world)?;
        Ok(self
            .store
            .chapters(world)?
            .into_iter()
            .map(|c| ChapterStatus {
                number: c.number,
                title: c.title,
                extracted: watermark > 0 && c.number <= watermark,
            })
            .collect())
    }

    /// The highest chapter number any fact is anchored to; 0 when the
    /// world has no facts yet.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn watermark(&self, world: WorldId) -> LoreResult<u32> {
        Ok(self.store.watermark(world)?)
    }

    // ----- read models --------------------------------------------------

    /// The complete settings picture as of the end of `chapter`.
    ///
    /// Chapter 0, a chapter the world does not hold, or a chapter with no
    /// facts yet all yield an empty snapshot rather than an error:
    /// "nothing is known yet" is an ordinary state of a world being read
    /// in order.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn materialize(&self, world: WorldId, chapter: u32) -> LoreResult<WorldSnapshot> {
        if chapter == 0 || self.store.chapter(world, chapter)?.is_none() {
            return Ok(WorldSnapshot::empty(chapter));
        }
        let mut snapshot = WorldSnapshot::empty(chapter);
        for entity in self.store.entities_valid_at(world, chapter)? {
            let mut properties = BTreeMap::new();
            let mut property_start_chapters = BTreeMap::new();
            // Rows arrive in id order, so on (invariant-violating) key
            // collisions the most recently opened version wins.
            for prop in self.store.properties_valid_at(entity.id, chapter)? {
                properties.insert(prop.key.clone(), prop.value);
                property_start_chapters.insert(prop.key, prop.span.start);
            }
            snapshot.entities.push(SnapshotEntity {
                id: entity.id,
                name: entity.name,
                kind: entity.kind,
                properties,
                start_chapter: entity.span.start,
                property_start_chapters,
            });
        }
        for rel in self.store.relationships_valid_at(world, chapter)? {
            snapshot.relationships.push(SnapshotRelationship {
                id: rel.id,
                subject_id: rel.subject_id,
                object_id: rel.object_id,
                subject: rel.subject,
                object: rel.object,
                relation: rel.relation,
                start_chapter: rel.span.start,
            });
        }
        Ok(snapshot)
    }

    /// Everything that changed at exactly `chapter`: fact versions opened
    /// there and fact versions closed there.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn diff(&self, world: WorldId, chapter: u32) -> LoreResult<ChapterChanges> {
        let numbers = [chapter];
        let mut changes = ChapterChanges {
            new_entities: self.store.entities_started_in(world, &numbers)?,
            new_relationships: self.store.relationships_started_in(world, &numbers)?,
            invalidated_entities: self.store.entities_ended_in(world, &numbers)?,
            invalidated_relationships: self.store.relationships_ended_in(world, &numbers)?,
            ..ChapterChanges::default()
        };
        for fact in self.store.properties_started_in(world, &numbers)? {
            changes.new_properties.push(PropertyChange {
                entity_name: self.entity_name(fact.entity_id)?,
                fact,
            });
        }
        for fact in self.store.properties_ended_in(world, &numbers)? {
            changes.invalidated_properties.push(PropertyChange {
                entity_name: self.entity_name(fact.entity_id)?,
                fact,
            });
        }
        Ok(changes)
    }

    fn entity_name(&self, id: crate::fact::EntityId) -> LoreResult<String> {
        Ok(self
            .store
            .entity(id)?
            .ok_or(StorageError::EntityNotFound(id))?
            .name)
    }

    /// Names of entities touched by any fact version opened in the window
    /// of `window` chapters ending at `chapter` (inclusive).
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn recent_changes(
        &self,
        world: WorldId,
        chapter: u32,
        window: u32,
    ) -> LoreResult<BTreeSet<String>> {
        if window == 0 || chapter == 0 {
            return Ok(BTreeSet::new());
        }
        let start = chapter.saturating_sub(window - 1).max(1);
        let numbers: Vec<u32> = (start..=chapter).collect();

        let mut names = BTreeSet::new();
        for entity in self.store.entities_started_in(world, &numbers)? {
            names.insert(entity.name);
        }
        for prop in self.store.properties_started_in(world, &numbers)? {
            names.insert(self.entity_name(prop.entity_id)?);
        }
        for rel in self.store.relationships_started_in(world, &numbers)? {
            names.insert(rel.subject);
            names.insert(rel.object);
        }
        Ok(names)
    }

    /// Change history of one named entity within `[start, end]`: its first
    /// appearance plus every property version, in chapter order.
    ///
    /// # Errors
    ///
    /// [`LoreError::EntityNotFound`] when no entity row carries the name.
    /// [`ValidationError::InvalidRange`] when `start > end`.
    pub fn history(
        &self,
        world: WorldId,
        name: &str,
        start: u32,
        end: u32,
    ) -> LoreResult<Vec<HistoryEvent>> {
        if start > end {
            return Err(ValidationError::InvalidRange { start, end }.into());
        }
        let rows = self.store.entities_by_name(world, name)?;
        if rows.is_empty() {
            return Err(LoreError::EntityNotFound {
                name: name.to_string(),
            });
        }
        let mut events = Vec::new();
        for entity in rows {
            if (start..=end).contains(&entity.span.start) {
                events.push(HistoryEvent {
                    chapter: entity.span.start,
                    change: HistoryChange::NewEntity {
                        kind: entity.kind.clone(),
                    },
                });
            }
            for prop in self.store.properties_of(entity.id)? {
                if (start..=end).contains(&prop.span.start) {
                    events.push(HistoryEvent {
                        chapter: prop.span.start,
                        change: HistoryChange::PropertyChange {
                            key: prop.key,
                            value: prop.value,
                        },
                    });
                }
            }
        }
        // Stable sort keeps creation-before-property on equal chapters.
        events.sort_by_key(|e| e.chapter);
        Ok(events)
    }

    /// Case-insensitive substring search over a world's entity names.
    /// Shortest names first, capped at twenty hits.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn search_entities(&self, world: WorldId, query: &str) -> LoreResult<Vec<String>> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<String> = self
            .store
            .entity_names(world)?
            .into_iter()
            .filter(|name| name.to_lowercase().contains(&needle))
            .collect();
        hits.sort_by(|a, b| a.chars().count().cmp(&b.chars().count()).then(a.cmp(b)));
        hits.truncate(SEARCH_LIMIT);
        Ok(hits)
    }

    /// Builds the knowledge graph as of `chapter`, marking entities with
    /// changes in the trailing `window` chapters as new.
    ///
    /// # Errors
    ///
    /// Storage errors only.
    pub fn knowledge_graph(
        &self,
        world: WorldId,
        chapter: u32,
        window: u32,
    ) -> LoreResult<KnowledgeGraph> {
        let snapshot = self.materialize(world, chapter)?;
        let recent = self.recent_changes(world, chapter, window)?;
        Ok(KnowledgeGraph::build(&snapshot, &recent))
    }

    // ----- reconciliation and extraction --------------------------------

    /// Extracts and reconciles one chapter: snapshot the world as of the
    /// previous chapter, hand text and snapshot to the extraction
    /// collaborator, and commit the resulting batch atomically.
    ///
    /// # Errors
    ///
    /// Storage, extraction, or validation errors. On any error nothing is
    /// committed for the chapter.
    pub fn reconcile_chapter(&self, world: WorldId, number: u32) -> LoreResult<ReconcileOutcome> {
        let lock = self.world_lock(world)?;
        let _guard = Self::guard(&lock)?;
        self.reconcile_locked(world, number)
    }

    fn reconcile_locked(&self, world: WorldId, number: u32) -> LoreResult<ReconcileOutcome> {
        let chapter = self
            .store
            .chapter(world, number)?
            .ok_or(StorageError::ChapterNotFound { world, number })?;
        let prior = self.materialize(world, number.saturating_sub(1))?;
        let patch = self
            .extraction
            .call_extract(self.extractor.as_ref(), &chapter.content, &prior)?;
        let (batch, outcome) =
            reconcile::plan_reconcile(self.store.as_ref(), world, number, &patch)?;
        self.store.apply(world, batch)?;
        info!(
            world = %world,
            chapter = number,
            new_entities = outcome.new_entities,
            new_properties = outcome.new_properties,
            new_relationships = outcome.new_relationships,
            invalidated = outcome.invalidated,
            skipped = outcome.skipped_relationships.len(),
            "reconciled chapter"
        );
        Ok(outcome)
    }

    /// Extracts every unprocessed chapter up to and including `target`,
    /// in chapter order, stopping at the first failure. A chapter number
    /// the world does not hold fails that chapter and stops the batch.
    ///
    /// # Errors
    ///
    /// [`ValidationError::RangeCovered`] when `target` does not lie beyond
    /// the watermark. Per-chapter failures are reported in the outcome,
    /// not as an error: earlier chapters stay committed.
    pub fn batch_extract_to(&self, world: WorldId, target: u32) -> LoreResult<BatchOutcome> {
        let lock = self.world_lock(world)?;
        let _guard = Self::guard(&lock)?;

        let watermark = self.store.watermark(world)?;
        if target <= watermark {
            return Err(ValidationError::RangeCovered { target, watermark }.into());
        }
        let start = watermark + 1;

        let mut outcome = BatchOutcome {
            start_chapter: start,
            target_chapter: target,
            successful_chapters: Vec::new(),
            failure: None,
        };
        for number in start..=target {
            match self.reconcile_locked(world, number) {
                Ok(_) => outcome.successful_chapters.push(number),
                Err(e) => {
                    warn!(world = %world, chapter = number, error = %e, "batch extraction stopped");
                    outcome.failure = Some(ChapterFailure {
                        chapter: number,
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }
        Ok(outcome)
    }

    /// Checks one chapter's text for contradictions against the settings
    /// valid before it. Results are cached on the chapter; `force` skips
    /// the cache and re-runs the analysis.
    ///
    /// # Errors
    ///
    /// [`StorageError::ChapterNotFound`], storage, or extraction errors.
    pub fn check_conflicts(
        &self,
        world: WorldId,
        number: u32,
        force: bool,
    ) -> LoreResult<ConflictReport> {
        let chapter = self
            .store
            .chapter(world, number)?
            .ok_or(StorageError::ChapterNotFound { world, number })?;
        if !force {
            if let Some(cached) = chapter.conflict_cache {
                return Ok(cached);
            }
        }
        let prior = self.materialize(world, number.saturating_sub(1))?;
        let report = if prior.is_empty() {
            // Nothing established yet means nothing to contradict.
            ConflictReport::default()
        } else {
            self.extraction
                .call_detect_conflicts(self.extractor.as_ref(), &prior, &chapter.content)?
        };
        self.store.set_conflict_cache(world, number, report.clone())?;
        Ok(report)
    }

    // ----- rollback and deletion ----------------------------------------

    /// Reverts the extraction of one chapter: facts opened there are
    /// deleted, facts closed there are reopened. The chapter text stays.
    ///
    /// # Errors
    ///
    /// [`StorageError::ChapterNotFound`] when the chapter does not exist.
    pub fn rollback(&self, world: WorldId, number: u32) -> LoreResult<()> {
        self.rollback_range(world, number, number)
    }

    /// Reverts the extraction of every chapter in `[start, end]`.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidRange`] when `start > end`,
    /// [`StorageError::ChapterNotFound`] when the range holds no chapter.
    pub fn rollback_range(&self, world: WorldId, start: u32, end: u32) -> LoreResult<()> {
        if start > end {
            return Err(ValidationError::InvalidRange { start, end }.into());
        }
        let lock = self.world_lock(world)?;
        let _guard = Self::guard(&lock)?;
        self.rollback_range_locked(world, start, end)
    }

    /// Rollback surgery proper. Callers hold the world lock.
    fn rollback_range_locked(&self, world: WorldId, start: u32, end: u32) -> LoreResult<()> {
        let numbers = self
            .store
            .chapter_numbers_in_range(world, start, Some(end))?;
        if numbers.is_empty() {
            return Err(StorageError::ChapterNotFound {
                world,
                number: start,
            }
            .into());
        }
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::ReopenFactsEndedIn {
            numbers: numbers.clone(),
        });
        batch.push(WriteOp::DeleteFactsStartedIn {
            numbers: numbers.clone(),
        });
        self.store.apply(world, batch)?;
        info!(world = %world, start, end, chapters = numbers.len(), "rolled back extraction");
        Ok(())
    }

    /// Deletes the chapters in `[start, end]` (or all from `start` when
    /// `end` is `None`) together with every fact anchored to them, as one
    /// atomic cascade. Returns the number of chapters removed.
    ///
    /// # Errors
    ///
    /// Storage errors; zero matching chapters is not an error.
    pub fn delete_chapters(
        &self,
        world: WorldId,
        start: u32,
        end: Option<u32>,
    ) -> LoreResult<usize> {
        let lock = self.world_lock(world)?;
        let _guard = Self::guard(&lock)?;

        let numbers = self.store.chapter_numbers_in_range(world, start, end)?;
        if numbers.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::ReopenFactsEndedIn {
            numbers: numbers.clone(),
        });
        batch.push(WriteOp::DeleteFactsStartedIn {
            numbers: numbers.clone(),
        });
        batch.push(WriteOp::DeleteChapters {
            numbers: numbers.clone(),
        });
        self.store.apply(world, batch)?;
        info!(world = %world, start, ?end, deleted = numbers.len(), "deleted chapters");
        Ok(numbers.len())
    }

    /// Reverts all extraction from `start` through the watermark, leaving
    /// chapter texts in place. Returns the number of chapters reverted.
    ///
    /// # Errors
    ///
    /// [`ValidationError::StartBeyondWatermark`] when `start` lies past
    /// the last extracted chapter.
    pub fn delete_settings_from(&self, world: WorldId, start: u32) -> LoreResult<usize> {
        let lock = self.world_lock(world)?;
        let _guard = Self::guard(&lock)?;

        // The watermark must be read under the lock: a concurrent batch
        // extraction could otherwise advance it between the check and the
        // rollback, leaving the later chapters' facts in place.
        let watermark = self.store.watermark(world)?;
        if start > watermark {
            return Err(ValidationError::StartBeyondWatermark { start, watermark }.into());
        }
        let numbers = self
            .store
            .chapter_numbers_in_range(world, start, Some(watermark))?;
        self.rollback_range_locked(world, start, watermark)?;
        Ok(numbers.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;
    use crate::extract::ExtractError;
    use crate::patch::{FactPatch, NewEntity};
    use crate::storage::InMemoryLoreStore;

    /// Serves scripted patches keyed by chapter text.
    struct FixedExtractor {
        patches: StdMutex<BTreeMap<String, FactPatch>>,
    }

    impl FixedExtractor {
        fn new(patches: Vec<(&str, FactPatch)>) -> Self {
            Self {
                patches: StdMutex::new(
                    patches
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                ),
            }
        }
    }

    impl SettingExtractor for FixedExtractor {
        fn extract(
            &self,
            _credential: &str,
            chapter_text: &str,
            _prior: &WorldSnapshot,
        ) -> Result<FactPatch, ExtractError> {
            Ok(self
                .patches
                .lock()
                .unwrap()
                .get(chapter_text)
                .cloned()
                .unwrap_or_default())
        }

        fn detect_conflicts(
            &self,
            _credential: &str,
            _prior: &WorldSnapshot,
            _chapter_text: &str,
        ) -> Result<ConflictReport, ExtractError> {
            Ok(ConflictReport::default())
        }
    }

    fn entity_patch(name: &str, props: &[(&str, serde_json::Value)]) -> FactPatch {
        FactPatch {
            entities: vec![NewEntity {
                name: name.to_string(),
                kind: "人物".to_string(),
                properties: props
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), v.clone()))
                    .collect(),
            }],
            ..FactPatch::default()
        }
    }

    fn engine_with(patches: Vec<(&str, FactPatch)>) -> (LoreEngine, WorldId) {
        let store = Arc::new(InMemoryLoreStore::new());
        let extractor = Arc::new(FixedExtractor::new(patches));
        let engine = LoreEngine::new(store, extractor);
        let world = engine.create_world("Test", "tester").unwrap().id;
        (engine, world)
    }

    #[test]
    fn test_materialize_unknown_chapter_is_empty() {
        let (engine, world) = engine_with(vec![("c1", entity_patch("Aria", &[("等级", json!(1))]))]);
        engine.add_chapter(world, 1, "第一章", "c1").unwrap();
        engine.reconcile_chapter(world, 1).unwrap();

        assert!(!engine.materialize(world, 1).unwrap().is_empty());
        // Chapters the world does not hold never leak open facts.
        assert!(engine.materialize(world, 0).unwrap().is_empty());
        assert!(engine.materialize(world, 42).unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_missing_chapter_fails() {
        let (engine, world) = engine_with(Vec::new());
        let err = engine.reconcile_chapter(world, 1).unwrap_err();
        assert!(matches!(
            err,
            LoreError::Storage(StorageError::ChapterNotFound { number: 1, .. })
        ));
    }

    #[test]
    fn test_reconcile_then_materialize() {
        let (engine, world) =
            engine_with(vec![("c1", entity_patch("Aria", &[("等级", json!(1))]))]);
        engine.add_chapter(world, 1, "第一章", "c1").unwrap();

        let outcome = engine.reconcile_chapter(world, 1).unwrap();
        assert_eq!(outcome.new_entities, 1);

        let snap = engine.materialize(world, 1).unwrap();
        let aria = snap.entity_by_name("Aria").unwrap();
        assert_eq!(aria.properties["等级"], "1");
        assert_eq!(aria.start_chapter, 1);
    }

    #[test]
    fn test_chapter_status_tracks_watermark() {
        let (engine, world) = engine_with(vec![("c1", entity_patch("Aria", &[]))]);
        engine.add_chapter(world, 1, "第一章", "c1").unwrap();
        engine.add_chapter(world, 2, "第二章", "c2").unwrap();

        engine.reconcile_chapter(world, 1).unwrap();
        let status = engine.chapters(world).unwrap();
        assert!(status[0].extracted);
        assert!(!status[1].extracted);
    }

    #[test]
    fn test_batch_rejects_covered_target() {
        let (engine, world) = engine_with(vec![("c1", entity_patch("Aria", &[]))]);
        engine.add_chapter(world, 1, "第一章", "c1").unwrap();
        engine.reconcile_chapter(world, 1).unwrap();

        let err = engine.batch_extract_to(world, 1).unwrap_err();
        assert!(matches!(
            err,
            LoreError::Validation(ValidationError::RangeCovered {
                target: 1,
                watermark: 1
            })
        ));
    }

    #[test]
    fn test_delete_settings_from_beyond_watermark() {
        let (engine, world) = engine_with(Vec::new());
        let err = engine.delete_settings_from(world, 5).unwrap_err();
        assert!(matches!(
            err,
            LoreError::Validation(ValidationError::StartBeyondWatermark { start: 5, .. })
        ));
    }

    #[test]
    fn test_history_unknown_name() {
        let (engine, world) = engine_with(Vec::new());
        let err = engine.history(world, "Nobody", 1, 10).unwrap_err();
        assert!(matches!(err, LoreError::EntityNotFound { .. }));
    }

    #[test]
    fn test_history_orders_events() {
        let (engine, world) = engine_with(vec![
            ("c1", entity_patch("Aria", &[("等级", json!(1))])),
            ("c2", entity_patch("Aria", &[("等级", json!(2))])),
        ]);
        engine.add_chapter(world, 1, "第一章", "c1").unwrap();
        engine.add_chapter(world, 2, "第二章", "c2").unwrap();
        engine.reconcile_chapter(world, 1).unwrap();
        engine.reconcile_chapter(world, 2).unwrap();

        let events = engine.history(world, "Aria", 1, 2).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].chapter, 1);
        assert!(matches!(events[0].change, HistoryChange::NewEntity { .. }));
        assert!(matches!(
            events[2].change,
            HistoryChange::PropertyChange { ref value, .. } if value == "2"
        ));

        let late = engine.history(world, "Aria", 2, 2).unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].chapter, 2);
    }

    #[test]
    fn test_search_entities_shortest_first() {
        let (engine, world) = engine_with(vec![(
            "c1",
            FactPatch {
                entities: ["张三丰", "张三", "小张三们"]
                    .iter()
                    .map(|name| NewEntity {
                        name: (*name).to_string(),
                        kind: "人物".to_string(),
                        properties: BTreeMap::new(),
                    })
                    .collect(),
                ..FactPatch::default()
            },
        )]);
        engine.add_chapter(world, 1, "第一章", "c1").unwrap();
        engine.reconcile_chapter(world, 1).unwrap();

        let hits = engine.search_entities(world, "张三").unwrap();
        assert_eq!(hits, ["张三", "张三丰", "小张三们"]);
        assert!(engine.search_entities(world, "").unwrap().is_empty());
    }

    #[test]
    fn test_conflict_cache_roundtrip() {
        let (engine, world) = engine_with(vec![("c1", entity_patch("Aria", &[]))]);
        engine.add_chapter(world, 1, "第一章", "c1").unwrap();
        engine.add_chapter(world, 2, "第二章", "c2").unwrap();
        engine.reconcile_chapter(world, 1).unwrap();

        // First call computes and caches; second returns the cache.
        let first = engine.check_conflicts(world, 2, false).unwrap();
        assert!(first.conflicts.is_empty());
        let cached = engine.check_conflicts(world, 2, false).unwrap();
        assert_eq!(first, cached);
    }

    #[test]
    fn test_delete_chapters_counts() {
        let (engine, world) = engine_with(Vec::new());
        for n in 1..=5 {
            engine
                .add_chapter(world, n, &format!("第{n}章"), &format!("c{n}"))
                .unwrap();
        }
        assert_eq!(engine.delete_chapters(world, 4, None).unwrap(), 2);
        assert_eq!(engine.delete_chapters(world, 9, None).unwrap(), 0);
        assert_eq!(engine.chapters(world).unwrap().len(), 3);
    }
}

//! In-memory storage backend.
//!
//! Thread-safe reference implementation of [`LoreStore`], intended for
//! embedded usage and tests. All state lives behind one `RwLock`, which is
//! what makes [`LoreStore::apply`] trivially atomic: batches mutate a
//! staged copy and commit by swap, so a failed batch leaves nothing behind.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::Utc;

use crate::chapter::{Chapter, ChapterId};
use crate::fact::{
    EntityFact, EntityId, PropertyFact, PropertyId, RelationshipFact, RelationshipId,
};
use crate::patch::ConflictReport;
use crate::storage::traits::{LoreStore, StorageError, WriteBatch, WriteOp};
use crate::world::{World, WorldId};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default, Clone)]
struct State {
    worlds: HashMap<WorldId, World>,
    chapters: HashMap<WorldId, BTreeMap<u32, Chapter>>,
    entities: BTreeMap<EntityId, EntityFact>,
    properties: BTreeMap<PropertyId, PropertyFact>,
    relationships: BTreeMap<RelationshipId, RelationshipFact>,
}

impl State {
    fn chapter_exists(&self, world: WorldId, number: u32) -> bool {
        self.chapters
            .get(&world)
            .map_or(false, |by_number| by_number.contains_key(&number))
    }

    fn check_anchor(&self, world: WorldId, number: u32) -> Result<(), StorageError> {
        if self.chapter_exists(world, number) {
            Ok(())
        } else {
            Err(StorageError::DanglingAnchor { world, number })
        }
    }

    fn entity_world(&self, entity: EntityId) -> Option<WorldId> {
        self.entities.get(&entity).map(|e| e.world_id)
    }

    fn world_entity_ids(&self, world: WorldId) -> BTreeSet<EntityId> {
        self.entities
            .values()
            .filter(|e| e.world_id == world)
            .map(|e| e.id)
            .collect()
    }
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryLoreStore {
    state: RwLock<State>,
    chapter_seq: AtomicU64,
    entity_seq: AtomicU64,
    property_seq: AtomicU64,
    relationship_seq: AtomicU64,
}

impl InMemoryLoreStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next(seq: &AtomicU64) -> u64 {
        seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn apply_op(state: &mut State, world: WorldId, op: &WriteOp) -> Result<(), StorageError> {
    match op {
        WriteOp::InsertEntity(fact) => {
            if fact.world_id != world {
                return Err(StorageError::BackendError(format!(
                    "entity {} belongs to a different world",
                    fact.id
                )));
            }
            state.check_anchor(world, fact.span.start)?;
            if let Some(end) = fact.span.end {
                state.check_anchor(world, end)?;
            }
            if state.entities.contains_key(&fact.id) {
                return Err(StorageError::BackendError(format!(
                    "duplicate entity id: {}",
                    fact.id
                )));
            }
            state.entities.insert(fact.id, fact.clone());
            Ok(())
        }

        WriteOp::InsertProperty(fact) => {
            let owner = state
                .entities
                .get(&fact.entity_id)
                .ok_or(StorageError::EntityNotFound(fact.entity_id))?;
            let owner_world = owner.world_id;
            state.check_anchor(owner_world, fact.span.start)?;
            if let Some(end) = fact.span.end {
                state.check_anchor(owner_world, end)?;
            }
            if state.properties.contains_key(&fact.id) {
                return Err(StorageError::BackendError(format!(
                    "duplicate property id: {}",
                    fact.id
                )));
            }
            state.properties.insert(fact.id, fact.clone());
            Ok(())
        }

        WriteOp::InsertRelationship(fact) => {
            if fact.world_id != world {
                return Err(StorageError::BackendError(format!(
                    "relationship {} belongs to a different world",
                    fact.id
                )));
            }
            for endpoint in [fact.subject_id, fact.object_id] {
                if !state.entities.contains_key(&endpoint) {
                    return Err(StorageError::EntityNotFound(endpoint));
                }
            }
            state.check_anchor(world, fact.span.start)?;
            if let Some(end) = fact.span.end {
                state.check_anchor(world, end)?;
            }
            if state.relationships.contains_key(&fact.id) {
                return Err(StorageError::BackendError(format!(
                    "duplicate relationship id: {}",
                    fact.id
                )));
            }
            state.relationships.insert(fact.id, fact.clone());
            Ok(())
        }

        WriteOp::CloseProperty { id, end } => {
            state.check_anchor(world, *end)?;
            let row = state.properties.get_mut(id).ok_or_else(|| {
                StorageError::BackendError(format!("close of unknown property id: {id}"))
            })?;
            row.span
                .close(*end)
                .map_err(|e| StorageError::BackendError(e.to_string()))
        }

        WriteOp::CloseRelationship { id, end } => {
            state.check_anchor(world, *end)?;
            let row = state.relationships.get_mut(id).ok_or_else(|| {
                StorageError::BackendError(format!("close of unknown relationship id: {id}"))
            })?;
            row.span
                .close(*end)
                .map_err(|e| StorageError::BackendError(e.to_string()))
        }

        WriteOp::DeleteProperty { id } => {
            state.properties.remove(id).ok_or_else(|| {
                StorageError::BackendError(format!("delete of unknown property id: {id}"))
            })?;
            Ok(())
        }

        WriteOp::DeleteRelationship { id } => {
            state.relationships.remove(id).ok_or_else(|| {
                StorageError::BackendError(format!("delete of unknown relationship id: {id}"))
            })?;
            Ok(())
        }

        WriteOp::ReopenFactsEndedIn { numbers } => {
            let set: BTreeSet<u32> = numbers.iter().copied().collect();
            let world_entities = state.world_entity_ids(world);
            for entity in state.entities.values_mut().filter(|e| e.world_id == world) {
                if entity.span.end.map_or(false, |end| set.contains(&end)) {
                    entity.span.reopen();
                }
            }
            for property in state
                .properties
                .values_mut()
                .filter(|p| world_entities.contains(&p.entity_id))
            {
                if property.span.end.map_or(false, |end| set.contains(&end)) {
                    property.span.reopen();
                }
            }
            for relationship in state
                .relationships
                .values_mut()
                .filter(|r| r.world_id == world)
            {
                if relationship.span.end.map_or(false, |end| set.contains(&end)) {
                    relationship.span.reopen();
                }
            }
            Ok(())
        }

        WriteOp::DeleteFactsStartedIn { numbers } => {
            let set: BTreeSet<u32> = numbers.iter().copied().collect();
            let world_entities = state.world_entity_ids(world);

            let doomed_entities: BTreeSet<EntityId> = state
                .entities
                .values()
                .filter(|e| e.world_id == world && set.contains(&e.span.start))
                .map(|e| e.id)
                .collect();

            state.entities.retain(|id, _| !doomed_entities.contains(id));

            // Properties fall either with their own start anchor or with
            // their owning entity (application-level cascade).
            state.properties.retain(|_, p| {
                if doomed_entities.contains(&p.entity_id) {
                    return false;
                }
                if world_entities.contains(&p.entity_id) && set.contains(&p.span.start) {
                    return false;
                }
                true
            });

            state.relationships.retain(|_, r| {
                if r.world_id != world {
                    return true;
                }
                if set.contains(&r.span.start) {
                    return false;
                }
                !(doomed_entities.contains(&r.subject_id)
                    || doomed_entities.contains(&r.object_id))
            });
            Ok(())
        }

        WriteOp::DeleteChapters { numbers } => {
            let set: BTreeSet<u32> = numbers.iter().copied().collect();
            if let Some(by_number) = state.chapters.get_mut(&world) {
                by_number.retain(|number, _| !set.contains(number));
            }

            // The batch must have cleaned up anchored facts already;
            // refuse to commit dangling references.
            let world_entities = state.world_entity_ids(world);
            for entity in state.entities.values().filter(|e| e.world_id == world) {
                for anchor in
                    std::iter::once(entity.span.start).chain(entity.span.end.into_iter())
                {
                    if set.contains(&anchor) {
                        return Err(StorageError::DanglingAnchor {
                            world,
                            number: anchor,
                        });
                    }
                }
            }
            for property in state
                .properties
                .values()
                .filter(|p| world_entities.contains(&p.entity_id))
            {
                for anchor in
                    std::iter::once(property.span.start).chain(property.span.end.into_iter())
                {
                    if set.contains(&anchor) {
                        return Err(StorageError::DanglingAnchor {
                            world,
                            number: anchor,
                        });
                    }
                }
            }
            for relationship in state
                .relationships
                .values()
                .filter(|r| r.world_id == world)
            {
                for anchor in std::iter::once(relationship.span.start)
                    .chain(relationship.span.end.into_iter())
                {
                    if set.contains(&anchor) {
                        return Err(StorageError::DanglingAnchor {
                            world,
                            number: anchor,
                        });
                    }
                }
            }
            Ok(())
        }
    }
}

impl LoreStore for InMemoryLoreStore {
    fn insert_world(&self, world: World) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("world.insert"))?;
        if state.worlds.contains_key(&world.id) {
            return Err(StorageError::BackendError(format!(
                "duplicate world id: {}",
                world.id
            )));
        }
        state.chapters.entry(world.id).or_default();
        state.worlds.insert(world.id, world);
        Ok(())
    }

    fn world(&self, id: WorldId) -> Result<Option<World>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("world.get"))?;
        Ok(state.worlds.get(&id).cloned())
    }

    fn worlds(&self) -> Result<Vec<World>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("world.list"))?;
        let mut all: Vec<World> = state.worlds.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    fn delete_world(&self, id: WorldId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("world.delete"))?;
        if state.worlds.remove(&id).is_none() {
            return Err(StorageError::WorldNotFound(id));
        }
        state.chapters.remove(&id);
        let doomed: BTreeSet<EntityId> = state.world_entity_ids(id);
        state.entities.retain(|_, e| e.world_id != id);
        state.properties.retain(|_, p| !doomed.contains(&p.entity_id));
        state.relationships.retain(|_, r| r.world_id != id);
        Ok(())
    }

    fn insert_chapter(
        &self,
        world: WorldId,
        number: u32,
        title: String,
        content: String,
    ) -> Result<Chapter, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("chapter.insert"))?;
        if !state.worlds.contains_key(&world) {
            return Err(StorageError::WorldNotFound(world));
        }
        let by_number = state.chapters.entry(world).or_default();
        if by_number.contains_key(&number) {
            return Err(StorageError::DuplicateChapter { world, number });
        }
        let chapter = Chapter {
            id: ChapterId::from_raw(Self::next(&self.chapter_seq)),
            world_id: world,
            number,
            title,
            content,
            created_at: Utc::now(),
            conflict_cache: None,
        };
        by_number.insert(number, chapter.clone());
        Ok(chapter)
    }

    fn chapter(&self, world: WorldId, number: u32) -> Result<Option<Chapter>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("chapter.get"))?;
        Ok(state
            .chapters
            .get(&world)
            .and_then(|by_number| by_number.get(&number))
            .cloned())
    }

    fn chapters(&self, world: WorldId) -> Result<Vec<Chapter>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("chapter.list"))?;
        Ok(state
            .chapters
            .get(&world)
            .map(|by_number| by_number.values().cloned().collect())
            .unwrap_or_default())
    }

    fn latest_chapter(&self, world: WorldId) -> Result<Option<Chapter>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("chapter.latest"))?;
        Ok(state
            .chapters
            .get(&world)
            .and_then(|by_number| by_number.values().next_back())
            .cloned())
    }

    fn chapter_numbers_in_range(
        &self,
        world: WorldId,
        start: u32,
        end: Option<u32>,
    ) -> Result<Vec<u32>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("chapter.range"))?;
        let Some(by_number) = state.chapters.get(&world) else {
            return Ok(Vec::new());
        };
        let numbers = match end {
            Some(end) => by_number.range(start..=end).map(|(n, _)| *n).collect(),
            None => by_number.range(start..).map(|(n, _)| *n).collect(),
        };
        Ok(numbers)
    }

    fn set_conflict_cache(
        &self,
        world: WorldId,
        number: u32,
        report: ConflictReport,
    ) -> Result<(), StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("chapter.conflict_cache"))?;
        let chapter = state
            .chapters
            .get_mut(&world)
            .and_then(|by_number| by_number.get_mut(&number))
            .ok_or(StorageError::ChapterNotFound { world, number })?;
        chapter.conflict_cache = Some(report);
        Ok(())
    }

    fn allocate_entity_id(&self) -> EntityId {
        EntityId::from_raw(Self::next(&self.entity_seq))
    }

    fn allocate_property_id(&self) -> PropertyId {
        PropertyId::from_raw(Self::next(&self.property_seq))
    }

    fn allocate_relationship_id(&self) -> RelationshipId {
        RelationshipId::from_raw(Self::next(&self.relationship_seq))
    }

    fn entity(&self, id: EntityId) -> Result<Option<EntityFact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.get"))?;
        Ok(state.entities.get(&id).cloned())
    }

    fn entities_valid_at(
        &self,
        world: WorldId,
        chapter: u32,
    ) -> Result<Vec<EntityFact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.valid_at"))?;
        Ok(state
            .entities
            .values()
            .filter(|e| e.world_id == world && e.span.contains(chapter))
            .cloned()
            .collect())
    }

    fn properties_valid_at(
        &self,
        entity: EntityId,
        chapter: u32,
    ) -> Result<Vec<PropertyFact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("property.valid_at"))?;
        Ok(state
            .properties
            .values()
            .filter(|p| p.entity_id == entity && p.span.contains(chapter))
            .cloned()
            .collect())
    }

    fn relationships_valid_at(
        &self,
        world: WorldId,
        chapter: u32,
    ) -> Result<Vec<RelationshipFact>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("relationship.valid_at"))?;
        Ok(state
            .relationships
            .values()
            .filter(|r| r.world_id == world && r.span.contains(chapter))
            .cloned()
            .collect())
    }

    fn live_entities_by_name(
        &self,
        world: WorldId,
        name: &str,
        chapter: u32,
    ) -> Result<Vec<EntityFact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.live"))?;
        Ok(state
            .entities
            .values()
            .filter(|e| e.world_id == world && e.name == name && e.span.live_at(chapter))
            .cloned()
            .collect())
    }

    fn entities_by_name(
        &self,
        world: WorldId,
        name: &str,
    ) -> Result<Vec<EntityFact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.by_name"))?;
        Ok(state
            .entities
            .values()
            .filter(|e| e.world_id == world && e.name == name)
            .cloned()
            .collect())
    }

    fn live_properties(
        &self,
        entity: EntityId,
        key: &str,
        chapter: u32,
    ) -> Result<Vec<PropertyFact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("property.live"))?;
        Ok(state
            .properties
            .values()
            .filter(|p| p.entity_id == entity && p.key == key && p.span.live_at(chapter))
            .cloned()
            .collect())
    }

    fn live_relationships(
        &self,
        world: WorldId,
        subject: EntityId,
        object: EntityId,
        chapter: u32,
    ) -> Result<Vec<RelationshipFact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("relationship.live"))?;
        Ok(state
            .relationships
            .values()
            .filter(|r| {
                r.world_id == world
                    && r.subject_id == subject
                    && r.object_id == object
                    && r.span.live_at(chapter)
            })
            .cloned()
            .collect())
    }

    fn properties_of(&self, entity: EntityId) -> Result<Vec<PropertyFact>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("property.of"))?;
        Ok(state
            .properties
            .values()
            .filter(|p| p.entity_id == entity)
            .cloned()
            .collect())
    }

    fn entities_started_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<EntityFact>, StorageError> {
        let set: BTreeSet<u32> = numbers.iter().copied().collect();
        let state = self.state.read().map_err(|_| lock_err("entity.started_in"))?;
        Ok(state
            .entities
            .values()
            .filter(|e| e.world_id == world && set.contains(&e.span.start))
            .cloned()
            .collect())
    }

    fn properties_started_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<PropertyFact>, StorageError> {
        let set: BTreeSet<u32> = numbers.iter().copied().collect();
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("property.started_in"))?;
        let world_entities = state.world_entity_ids(world);
        Ok(state
            .properties
            .values()
            .filter(|p| world_entities.contains(&p.entity_id) && set.contains(&p.span.start))
            .cloned()
            .collect())
    }

    fn relationships_started_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<RelationshipFact>, StorageError> {
        let set: BTreeSet<u32> = numbers.iter().copied().collect();
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("relationship.started_in"))?;
        Ok(state
            .relationships
            .values()
            .filter(|r| r.world_id == world && set.contains(&r.span.start))
            .cloned()
            .collect())
    }

    fn entities_ended_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<EntityFact>, StorageError> {
        let set: BTreeSet<u32> = numbers.iter().copied().collect();
        let state = self.state.read().map_err(|_| lock_err("entity.ended_in"))?;
        Ok(state
            .entities
            .values()
            .filter(|e| {
                e.world_id == world && e.span.end.map_or(false, |end| set.contains(&end))
            })
            .cloned()
            .collect())
    }

    fn properties_ended_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<PropertyFact>, StorageError> {
        let set: BTreeSet<u32> = numbers.iter().copied().collect();
        let state = self.state.read().map_err(|_| lock_err("property.ended_in"))?;
        let world_entities = state.world_entity_ids(world);
        Ok(state
            .properties
            .values()
            .filter(|p| {
                world_entities.contains(&p.entity_id)
                    && p.span.end.map_or(false, |end| set.contains(&end))
            })
            .cloned()
            .collect())
    }

    fn relationships_ended_in(
        &self,
        world: WorldId,
        numbers: &[u32],
    ) -> Result<Vec<RelationshipFact>, StorageError> {
        let set: BTreeSet<u32> = numbers.iter().copied().collect();
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("relationship.ended_in"))?;
        Ok(state
            .relationships
            .values()
            .filter(|r| {
                r.world_id == world && r.span.end.map_or(false, |end| set.contains(&end))
            })
            .cloned()
            .collect())
    }

    fn entity_names(&self, world: WorldId) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.names"))?;
        let names: BTreeSet<String> = state
            .entities
            .values()
            .filter(|e| e.world_id == world)
            .map(|e| e.name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn watermark(&self, world: WorldId) -> Result<u32, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("watermark"))?;
        let world_entities = state.world_entity_ids(world);
        let entity_max = state
            .entities
            .values()
            .filter(|e| e.world_id == world)
            .map(|e| e.span.start)
            .max();
        let property_max = state
            .properties
            .values()
            .filter(|p| world_entities.contains(&p.entity_id))
            .map(|p| p.span.start)
            .max();
        let relationship_max = state
            .relationships
            .values()
            .filter(|r| r.world_id == world)
            .map(|r| r.span.start)
            .max();
        Ok([entity_max, property_max, relationship_max]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0))
    }

    fn apply(&self, world: WorldId, batch: WriteBatch) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("apply"))?;
        if !state.worlds.contains_key(&world) {
            return Err(StorageError::WorldNotFound(world));
        }

        // Stage on a copy; commit by swap so a failed op leaves nothing.
        let mut staged = state.clone();
        for op in batch.ops() {
            apply_op(&mut staged, world, op)?;
        }
        *state = staged;
        Ok(())
    }
}

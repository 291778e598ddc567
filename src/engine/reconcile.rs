//! Reconciliation: turning one chapter's fact patch into an atomic batch.
//!
//! The planner reads committed state, never writes it. It emits a
//! [`WriteBatch`] that the caller applies in one shot, plus a
//! [`ReconcileOutcome`] describing what the batch does. Supersede rules:
//! an unchanged value is a no-op, a changed value closes the open version
//! at the processing chapter and opens a new one, and a supersede whose
//! open version started at or after the processing chapter deletes that
//! version outright so no degenerate span is ever written.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LoreResult, ValidationError};
use crate::fact::{EntityFact, EntityId, PropertyFact, RelationshipFact};
use crate::patch::{stable_value_string, FactPatch, Invalidation};
use crate::span::ChapterSpan;
use crate::storage::{LoreStore, WriteBatch, WriteOp};
use crate::world::WorldId;

/// A relationship assertion the planner could not ground in entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRelationship {
    /// Subject name as asserted.
    pub subject: String,

    /// Object name as asserted.
    pub object: String,

    /// Relation label as asserted.
    pub relation: String,

    /// Why it was skipped.
    pub reason: String,
}

/// Summary of what one chapter's reconciliation did (or will do).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    /// The chapter that was reconciled.
    pub chapter: u32,

    /// Entities opened at this chapter.
    pub new_entities: usize,

    /// Property versions opened at this chapter.
    pub new_properties: usize,

    /// Property versions closed or replaced at this chapter.
    pub closed_properties: usize,

    /// Relationship versions opened at this chapter.
    pub new_relationships: usize,

    /// Relationship versions closed or replaced at this chapter.
    pub closed_relationships: usize,

    /// Fact versions ended by explicit invalidations.
    pub invalidated: usize,

    /// Relationship assertions dropped for want of a resolvable endpoint.
    pub skipped_relationships: Vec<SkippedRelationship>,

    /// Times the planner found several open versions where the store
    /// invariant promises at most one, and tie-broke by recency.
    pub consistency_warnings: usize,
}

/// Picks the version to supersede when several rows are open at once.
///
/// The single-open invariant makes this a one-element slice in healthy
/// stores; on violated input the most recently opened row wins (highest
/// start, then highest id).
fn pick_open<T, K: Ord>(mut rows: Vec<T>, sort_key: impl Fn(&T) -> K) -> (Option<T>, bool) {
    let ambiguous = rows.len() > 1;
    rows.sort_by_key(&sort_key);
    (rows.pop(), ambiguous)
}

struct Planner<'a> {
    store: &'a dyn LoreStore,
    world: WorldId,
    chapter: u32,
    ops: Vec<WriteOp>,
    outcome: ReconcileOutcome,
    /// Entities opened by this very batch, by name.
    local_entities: BTreeMap<String, EntityId>,
    /// Positions in `ops` of property versions opened by this batch.
    local_properties: BTreeMap<(EntityId, String), usize>,
    /// Positions in `ops` of relationship versions opened by this batch.
    local_relationships: BTreeMap<(EntityId, EntityId), usize>,
}

impl<'a> Planner<'a> {
    fn new(store: &'a dyn LoreStore, world: WorldId, chapter: u32) -> Self {
        Self {
            store,
            world,
            chapter,
            ops: Vec::new(),
            outcome: ReconcileOutcome {
                chapter,
                ..ReconcileOutcome::default()
            },
            local_entities: BTreeMap::new(),
            local_properties: BTreeMap::new(),
            local_relationships: BTreeMap::new(),
        }
    }

    /// Resolves a name to the entity the chapter is talking about, if any.
    /// Batch-local entities win over committed ones.
    fn resolve_entity(&mut self, name: &str) -> LoreResult<Option<EntityId>> {
        if let Some(id) = self.local_entities.get(name) {
            return Ok(Some(*id));
        }
        let live = self
            .store
            .live_entities_by_name(self.world, name, self.chapter)?;
        let (picked, ambiguous) = pick_open(live, |e| (e.span.start, e.id));
        if ambiguous {
            warn!(
                world = %self.world,
                chapter = self.chapter,
                entity = name,
                "multiple open entity versions, superseding the most recent"
            );
            self.outcome.consistency_warnings += 1;
        }
        Ok(picked.map(|e| e.id))
    }

    /// Like [`Self::resolve_entity`], but for invalidations: a name whose
    /// open version is gone still resolves to its most recent version so
    /// late invalidations can land.
    fn resolve_entity_any(&mut self, name: &str) -> LoreResult<Option<EntityId>> {
        if let Some(id) = self.resolve_entity(name)? {
            return Ok(Some(id));
        }
        let all = self.store.entities_by_name(self.world, name)?;
        let (picked, _) = pick_open(all, |e| (e.span.start, e.id));
        Ok(picked.map(|e| e.id))
    }

    fn ensure_entity(&mut self, name: &str, kind: &str) -> LoreResult<(EntityId, bool)> {
        if name.is_empty() {
            return Err(ValidationError::EmptyEntityName.into());
        }
        if let Some(id) = self.resolve_entity(name)? {
            return Ok((id, false));
        }
        let id = self.store.allocate_entity_id();
        self.ops.push(WriteOp::InsertEntity(EntityFact {
            id,
            world_id: self.world,
            name: name.to_string(),
            kind: kind.to_string(),
            span: ChapterSpan::open(self.chapter),
        }));
        self.local_entities.insert(name.to_string(), id);
        self.outcome.new_entities += 1;
        Ok((id, true))
    }

    fn reconcile_property(
        &mut self,
        entity: EntityId,
        entity_is_new: bool,
        key: &str,
        value: &serde_json::Value,
    ) -> LoreResult<()> {
        let stable = stable_value_string(value);

        // A key this batch already opened gets its value updated in place
        // rather than a second open version.
        if let Some(&pos) = self.local_properties.get(&(entity, key.to_string())) {
            if let WriteOp::InsertProperty(fact) = &mut self.ops[pos] {
                fact.value = stable;
            }
            return Ok(());
        }

        let current = if entity_is_new {
            None
        } else {
            let live = self.store.live_properties(entity, key, self.chapter)?;
            let (picked, ambiguous) = pick_open(live, |p| (p.span.start, p.id));
            if ambiguous {
                warn!(
                    world = %self.world,
                    chapter = self.chapter,
                    entity = %entity,
                    key,
                    "multiple open property versions, superseding the most recent"
                );
                self.outcome.consistency_warnings += 1;
            }
            picked
        };

        if let Some(current) = current {
            if current.value == stable {
                return Ok(());
            }
            // A version that opened at or after this chapter cannot be
            // closed here without a degenerate span; it is replaced.
            if current.span.start >= self.chapter {
                self.ops.push(WriteOp::DeleteProperty { id: current.id });
            } else {
                self.ops.push(WriteOp::CloseProperty {
                    id: current.id,
                    end: self.chapter,
                });
            }
            self.outcome.closed_properties += 1;
        }

        let id = self.store.allocate_property_id();
        self.local_properties
            .insert((entity, key.to_string()), self.ops.len());
        self.ops.push(WriteOp::InsertProperty(PropertyFact {
            id,
            entity_id: entity,
            key: key.to_string(),
            value: stable,
            span: ChapterSpan::open(self.chapter),
        }));
        self.outcome.new_properties += 1;
        Ok(())
    }

    fn reconcile_relationship(
        &mut self,
        subject: &str,
        object: &str,
        relation: &str,
    ) -> LoreResult<()> {
        if relation.is_empty() {
            return Err(ValidationError::EmptyRelation.into());
        }
        let Some(subject_id) = self.resolve_entity(subject)? else {
            self.skip_relationship(subject, object, relation, "unknown subject entity");
            return Ok(());
        };
        let Some(object_id) = self.resolve_entity(object)? else {
            self.skip_relationship(subject, object, relation, "unknown object entity");
            return Ok(());
        };

        // A pair this batch already opened gets its label updated in place.
        if let Some(&pos) = self.local_relationships.get(&(subject_id, object_id)) {
            if let WriteOp::InsertRelationship(fact) = &mut self.ops[pos] {
                fact.relation = relation.to_string();
            }
            return Ok(());
        }

        let live =
            self.store
                .live_relationships(self.world, subject_id, object_id, self.chapter)?;
        let (current, ambiguous) = pick_open(live, |r| (r.span.start, r.id));
        if ambiguous {
            warn!(
                world = %self.world,
                chapter = self.chapter,
                subject,
                object,
                "multiple open relationship versions, superseding the most recent"
            );
            self.outcome.consistency_warnings += 1;
        }

        if let Some(current) = current {
            if current.relation == relation {
                return Ok(());
            }
            if current.span.start >= self.chapter {
                self.ops.push(WriteOp::DeleteRelationship { id: current.id });
            } else {
                self.ops.push(WriteOp::CloseRelationship {
                    id: current.id,
                    end: self.chapter,
                });
            }
            self.outcome.closed_relationships += 1;
        }

        let id = self.store.allocate_relationship_id();
        self.local_relationships
            .insert((subject_id, object_id), self.ops.len());
        self.ops.push(WriteOp::InsertRelationship(RelationshipFact {
            id,
            world_id: self.world,
            subject_id,
            object_id,
            subject: subject.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
            span: ChapterSpan::open(self.chapter),
        }));
        self.outcome.new_relationships += 1;
        Ok(())
    }

    fn skip_relationship(&mut self, subject: &str, object: &str, relation: &str, reason: &str) {
        warn!(
            world = %self.world,
            chapter = self.chapter,
            subject,
            object,
            relation,
            reason,
            "skipping ungrounded relationship"
        );
        self.outcome.skipped_relationships.push(SkippedRelationship {
            subject: subject.to_string(),
            object: object.to_string(),
            relation: relation.to_string(),
            reason: reason.to_string(),
        });
    }

    fn invalidate(&mut self, invalidation: &Invalidation) -> LoreResult<()> {
        match invalidation {
            Invalidation::Property { entity, key } => {
                let Some(entity_id) = self.resolve_entity_any(entity)? else {
                    return Ok(());
                };
                let live = self.store.live_properties(entity_id, key, self.chapter)?;
                for row in live {
                    if row.span.start >= self.chapter {
                        self.ops.push(WriteOp::DeleteProperty { id: row.id });
                    } else {
                        self.ops.push(WriteOp::CloseProperty {
                            id: row.id,
                            end: self.chapter,
                        });
                    }
                    self.outcome.invalidated += 1;
                }
            }
            Invalidation::Relationship {
                subject,
                object,
                relation,
            } => {
                let (Some(subject_id), Some(object_id)) = (
                    self.resolve_entity_any(subject)?,
                    self.resolve_entity_any(object)?,
                ) else {
                    return Ok(());
                };
                let live = self
                    .store
                    .live_relationships(self.world, subject_id, object_id, self.chapter)?;
                for row in live.into_iter().filter(|r| r.relation == *relation) {
                    if row.span.start >= self.chapter {
                        self.ops.push(WriteOp::DeleteRelationship { id: row.id });
                    } else {
                        self.ops.push(WriteOp::CloseRelationship {
                            id: row.id,
                            end: self.chapter,
                        });
                    }
                    self.outcome.invalidated += 1;
                }
            }
        }
        Ok(())
    }
}

/// Plans the atomic batch for one chapter's patch against committed state.
///
/// Pure planning: nothing is written until the caller applies the batch.
///
/// # Errors
///
/// Validation errors for structurally invalid patch content, storage
/// errors from the read side.
pub fn plan_reconcile(
    store: &dyn LoreStore,
    world: WorldId,
    chapter: u32,
    patch: &FactPatch,
) -> LoreResult<(WriteBatch, ReconcileOutcome)> {
    let mut planner = Planner::new(store, world, chapter);

    for entity in &patch.entities {
        let (id, is_new) = planner.ensure_entity(&entity.name, &entity.kind)?;
        for (key, value) in &entity.properties {
            planner.reconcile_property(id, is_new, key, value)?;
        }
    }

    for relationship in &patch.relationships {
        planner.reconcile_relationship(
            &relationship.subject,
            &relationship.object,
            &relationship.relation,
        )?;
    }

    for invalidation in &patch.invalidated {
        planner.invalidate(invalidation)?;
    }

    let mut batch = WriteBatch::new();
    for op in planner.ops {
        batch.push(op);
    }
    Ok((batch, planner.outcome))
}

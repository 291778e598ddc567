//! Read models over committed fact state.
//!
//! A [`WorldSnapshot`] is the complete settings picture "as of chapter N":
//! every entity valid at N with its valid properties, plus every valid
//! relationship. [`ChapterChanges`] and [`HistoryEvent`] are the diff and
//! history read models. All of these are plain data; producing them has no
//! side effects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fact::{EntityFact, EntityId, PropertyFact, RelationshipFact, RelationshipId};

/// An entity as it stands at a snapshot chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntity {
    /// Canonical entity row id.
    pub id: EntityId,

    /// Display name.
    pub name: String,

    /// Type tag.
    pub kind: String,

    /// Valid properties, key to stable string value.
    pub properties: BTreeMap<String, String>,

    /// Chapter the entity first appeared in.
    pub start_chapter: u32,

    /// For each valid property, the chapter its current version opened at.
    pub property_start_chapters: BTreeMap<String, u32>,
}

/// A relationship as it stands at a snapshot chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRelationship {
    /// Relationship row id.
    pub id: RelationshipId,

    /// Canonical subject entity.
    pub subject_id: EntityId,

    /// Canonical object entity.
    pub object_id: EntityId,

    /// Subject display name.
    pub subject: String,

    /// Object display name.
    pub object: String,

    /// Relation label.
    pub relation: String,

    /// Chapter the current version of the relationship opened at.
    pub start_chapter: u32,
}

/// Complete settings state as of the end of one chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    /// The snapshot chapter; 0 means "before any chapter".
    pub chapter: u32,

    /// Entities valid at the snapshot chapter.
    pub entities: Vec<SnapshotEntity>,

    /// Relationships valid at the snapshot chapter.
    pub relationships: Vec<SnapshotRelationship>,
}

impl WorldSnapshot {
    /// An empty snapshot for the given chapter.
    #[must_use]
    pub fn empty(chapter: u32) -> Self {
        Self {
            chapter,
            entities: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Returns true if the snapshot holds no facts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Looks up an entity by exact name.
    #[must_use]
    pub fn entity_by_name(&self, name: &str) -> Option<&SnapshotEntity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Looks up an entity by id.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&SnapshotEntity> {
        self.entities.iter().find(|e| e.id == id)
    }
}

/// A property fact joined with its owning entity's name, for diff output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Owning entity's display name.
    pub entity_name: String,

    /// The property row.
    pub fact: PropertyFact,
}

/// Everything that changed at exactly one chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterChanges {
    /// Entities first appearing at this chapter.
    pub new_entities: Vec<EntityFact>,

    /// Property versions opened at this chapter.
    pub new_properties: Vec<PropertyChange>,

    /// Relationship versions opened at this chapter.
    pub new_relationships: Vec<RelationshipFact>,

    /// Entities whose validity ended at this chapter.
    pub invalidated_entities: Vec<EntityFact>,

    /// Property versions closed at this chapter.
    pub invalidated_properties: Vec<PropertyChange>,

    /// Relationship versions closed at this chapter.
    pub invalidated_relationships: Vec<RelationshipFact>,
}

impl ChapterChanges {
    /// Returns true if nothing changed at the chapter.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_entities.is_empty()
            && self.new_properties.is_empty()
            && self.new_relationships.is_empty()
            && self.invalidated_entities.is_empty()
            && self.invalidated_properties.is_empty()
            && self.invalidated_relationships.is_empty()
    }
}

/// One event in an entity's change history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Chapter the event happened at.
    pub chapter: u32,

    /// What happened.
    #[serde(flatten)]
    pub change: HistoryChange,
}

/// The kinds of history events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change_type", rename_all = "snake_case")]
pub enum HistoryChange {
    /// The entity was first introduced.
    NewEntity {
        /// The entity's type tag.
        kind: String,
    },

    /// A property version opened (new key or new value).
    PropertyChange {
        /// Property key.
        key: String,
        /// New stable string value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::ChapterSpan;
    use crate::world::WorldId;

    #[test]
    fn test_empty_snapshot() {
        let snap = WorldSnapshot::empty(0);
        assert!(snap.is_empty());
        assert!(snap.entity_by_name("Aria").is_none());
    }

    #[test]
    fn test_entity_lookup_by_name_and_id() {
        let mut snap = WorldSnapshot::empty(2);
        snap.entities.push(SnapshotEntity {
            id: EntityId::from_raw(1),
            name: "Aria".to_string(),
            kind: "人物".to_string(),
            properties: BTreeMap::from([("等级".to_string(), "2".to_string())]),
            start_chapter: 1,
            property_start_chapters: BTreeMap::from([("等级".to_string(), 2)]),
        });
        assert_eq!(
            snap.entity_by_name("Aria").unwrap().properties["等级"],
            "2"
        );
        assert!(snap.entity(EntityId::from_raw(1)).is_some());
        assert!(snap.entity(EntityId::from_raw(9)).is_none());
    }

    #[test]
    fn test_chapter_changes_empty_flag() {
        let mut changes = ChapterChanges::default();
        assert!(changes.is_empty());
        changes.new_entities.push(EntityFact {
            id: EntityId::from_raw(1),
            world_id: WorldId::new(),
            name: "X".to_string(),
            kind: "人物".to_string(),
            span: ChapterSpan::open(1),
        });
        assert!(!changes.is_empty());
    }

    #[test]
    fn test_history_event_serde_shape() {
        let event = HistoryEvent {
            chapter: 2,
            change: HistoryChange::PropertyChange {
                key: "等级".to_string(),
                value: "2".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["chapter"], 2);
        assert_eq!(json["change_type"], "property_change");
        assert_eq!(json["key"], "等级");
    }
}

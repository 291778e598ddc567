//! Knowledge graph projection and path queries.
//!
//! A [`KnowledgeGraph`] is a projection of one [`WorldSnapshot`]: every
//! snapshot entity becomes a node, every relationship whose endpoints both
//! project becomes an edge. Relationships that reference an entity missing
//! from the snapshot are not silently dropped; they are reported on the
//! graph so callers can surface the inconsistency.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LoreError, LoreResult};
use crate::fact::EntityId;
use crate::snapshot::WorldSnapshot;

/// One graph node: an entity as of the snapshot chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Canonical entity id.
    pub id: EntityId,

    /// Display name.
    pub name: String,

    /// Entity type tag.
    pub category: String,

    /// Valid properties at the snapshot chapter.
    pub properties: BTreeMap<String, String>,

    /// True if the entity had changes in the recency window the graph was
    /// built with.
    pub is_new: bool,

    /// Chapter the entity first appeared in.
    pub start_chapter: u32,
}

/// One directed graph edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Subject entity.
    pub source: EntityId,

    /// Object entity.
    pub target: EntityId,

    /// Relation label.
    pub relation: String,
}

/// A relationship that could not be projected into the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEdge {
    /// Subject display name.
    pub subject: String,

    /// Object display name.
    pub object: String,

    /// Relation label.
    pub relation: String,

    /// Why the edge was dropped.
    pub reason: String,
}

/// A reference to a graph node, by id or by display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    /// By canonical entity id.
    Id(EntityId),

    /// By exact display name.
    Name(String),
}

impl From<EntityId> for NodeRef {
    fn from(id: EntityId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for NodeRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// A shortest path between two nodes.
///
/// Edges keep their stored direction: a hop traversed against an edge's
/// direction still reports the edge as recorded, so callers can render
/// "A is B's master" even when walking from B to A.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResult {
    /// Node ids along the path, endpoints included. Empty when the two
    /// nodes are not connected.
    pub path_nodes: Vec<EntityId>,

    /// The edge used for each hop; one shorter than `path_nodes`.
    pub path_edges: Vec<GraphEdge>,
}

impl PathResult {
    /// Returns true if no path exists.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        self.path_nodes.is_empty()
    }
}

/// The relationship graph as of one chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    /// Snapshot chapter the graph was built from.
    pub chapter: u32,

    /// Nodes, in entity id order.
    pub nodes: Vec<GraphNode>,

    /// Edges whose endpoints both resolved.
    pub edges: Vec<GraphEdge>,

    /// Relationships dropped because an endpoint was missing from the
    /// snapshot.
    pub skipped: Vec<SkippedEdge>,
}

impl KnowledgeGraph {
    /// Projects a snapshot into a graph, marking entities named in
    /// `recent` as new.
    #[must_use]
    pub fn build(snapshot: &WorldSnapshot, recent: &BTreeSet<String>) -> Self {
        let mut graph = Self {
            chapter: snapshot.chapter,
            ..Self::default()
        };
        let mut present: BTreeSet<EntityId> = BTreeSet::new();
        for entity in &snapshot.entities {
            present.insert(entity.id);
            graph.nodes.push(GraphNode {
                id: entity.id,
                name: entity.name.clone(),
                category: entity.kind.clone(),
                properties: entity.properties.clone(),
                is_new: recent.contains(&entity.name),
                start_chapter: entity.start_chapter,
            });
        }
        graph.nodes.sort_by_key(|n| n.id);

        for rel in &snapshot.relationships {
            let missing = if !present.contains(&rel.subject_id) {
                Some("subject not in snapshot")
            } else if !present.contains(&rel.object_id) {
                Some("object not in snapshot")
            } else {
                None
            };
            if let Some(reason) = missing {
                warn!(
                    chapter = snapshot.chapter,
                    subject = %rel.subject,
                    object = %rel.object,
                    relation = %rel.relation,
                    reason,
                    "dropping unprojectable edge"
                );
                graph.skipped.push(SkippedEdge {
                    subject: rel.subject.clone(),
                    object: rel.object.clone(),
                    relation: rel.relation.clone(),
                    reason: reason.to_string(),
                });
                continue;
            }
            graph.edges.push(GraphEdge {
                source: rel.subject_id,
                target: rel.object_id,
                relation: rel.relation.clone(),
            });
        }
        graph
    }

    /// Looks up a node by reference.
    #[must_use]
    pub fn node(&self, node: &NodeRef) -> Option<&GraphNode> {
        match node {
            NodeRef::Id(id) => self.nodes.iter().find(|n| n.id == *id),
            NodeRef::Name(name) => self.nodes.iter().find(|n| n.name == *name),
        }
    }

    fn resolve(&self, node: &NodeRef) -> LoreResult<EntityId> {
        self.node(node).map(|n| n.id).ok_or_else(|| {
            let name = match node {
                NodeRef::Id(id) => id.to_string(),
                NodeRef::Name(name) => name.clone(),
            };
            LoreError::EntityNotFound { name }
        })
    }

    /// Finds the shortest path between two nodes, treating edges as
    /// undirected for traversal. Hop count breaks ties; among equal-length
    /// paths the one through lower-id nodes wins, so results are stable.
    ///
    /// # Errors
    ///
    /// [`LoreError::EntityNotFound`] when either endpoint does not resolve
    /// to a node.
    pub fn shortest_path(&self, from: &NodeRef, to: &NodeRef) -> LoreResult<PathResult> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        if from == to {
            return Ok(PathResult {
                path_nodes: vec![from],
                path_edges: Vec::new(),
            });
        }

        // Undirected adjacency; neighbors in id order for determinism.
        let mut adjacency: BTreeMap<EntityId, Vec<(EntityId, usize)>> = BTreeMap::new();
        for (idx, edge) in self.edges.iter().enumerate() {
            adjacency.entry(edge.source).or_default().push((edge.target, idx));
            adjacency.entry(edge.target).or_default().push((edge.source, idx));
        }
        for neighbors in adjacency.values_mut() {
            neighbors.sort();
        }

        let mut predecessor: HashMap<EntityId, (EntityId, usize)> = HashMap::new();
        let mut visited: BTreeSet<EntityId> = BTreeSet::from([from]);
        let mut queue: VecDeque<EntityId> = VecDeque::from([from]);
        'search: while let Some(current) = queue.pop_front() {
            for &(next, edge_idx) in adjacency.get(&current).into_iter().flatten() {
                if !visited.insert(next) {
                    continue;
                }
                predecessor.insert(next, (current, edge_idx));
                if next == to {
                    break 'search;
                }
                queue.push_back(next);
            }
        }

        if !predecessor.contains_key(&to) {
            return Ok(PathResult::default());
        }

        let mut path_nodes = vec![to];
        let mut path_edges = Vec::new();
        let mut cursor = to;
        while cursor != from {
            let (prev, edge_idx) = predecessor[&cursor];
            path_edges.push(self.edges[edge_idx].clone());
            path_nodes.push(prev);
            cursor = prev;
        }
        path_nodes.reverse();
        path_edges.reverse();
        Ok(PathResult {
            path_nodes,
            path_edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::RelationshipId;
    use crate::snapshot::{SnapshotEntity, SnapshotRelationship};

    fn entity(id: u64, name: &str) -> SnapshotEntity {
        SnapshotEntity {
            id: EntityId::from_raw(id),
            name: name.to_string(),
            kind: "人物".to_string(),
            properties: BTreeMap::new(),
            start_chapter: 1,
            property_start_chapters: BTreeMap::new(),
        }
    }

    fn relationship(id: u64, subject: u64, object: u64, relation: &str) -> SnapshotRelationship {
        SnapshotRelationship {
            id: RelationshipId::from_raw(id),
            subject_id: EntityId::from_raw(subject),
            object_id: EntityId::from_raw(object),
            subject: format!("e{subject}"),
            object: format!("e{object}"),
            relation: relation.to_string(),
            start_chapter: 1,
        }
    }

    fn chain_snapshot() -> WorldSnapshot {
        // A -师徒-> B -同门-> C, plus isolated D.
        WorldSnapshot {
            chapter: 3,
            entities: vec![
                entity(1, "A"),
                entity(2, "B"),
                entity(3, "C"),
                entity(4, "D"),
            ],
            relationships: vec![
                relationship(1, 1, 2, "师徒"),
                relationship(2, 2, 3, "同门"),
            ],
        }
    }

    #[test]
    fn test_build_projects_nodes_and_edges() {
        let graph = KnowledgeGraph::build(&chain_snapshot(), &BTreeSet::new());
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.edges.len(), 2);
        assert!(graph.skipped.is_empty());
        assert_eq!(graph.chapter, 3);
    }

    #[test]
    fn test_recent_names_flag_nodes_as_new() {
        let recent = BTreeSet::from(["C".to_string()]);
        let graph = KnowledgeGraph::build(&chain_snapshot(), &recent);
        assert!(!graph.node(&"A".into()).unwrap().is_new);
        assert!(graph.node(&"C".into()).unwrap().is_new);
    }

    #[test]
    fn test_dangling_edge_is_reported_not_dropped_silently() {
        let mut snapshot = chain_snapshot();
        snapshot.relationships.push(relationship(3, 2, 99, "仇敌"));
        let graph = KnowledgeGraph::build(&snapshot, &BTreeSet::new());
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.skipped.len(), 1);
        assert_eq!(graph.skipped[0].reason, "object not in snapshot");
    }

    #[test]
    fn test_shortest_path_follows_chain() {
        let graph = KnowledgeGraph::build(&chain_snapshot(), &BTreeSet::new());
        let path = graph.shortest_path(&"A".into(), &"C".into()).unwrap();
        let ids: Vec<u64> = path.path_nodes.iter().map(EntityId::as_u64).collect();
        assert_eq!(ids, [1, 2, 3]);
        assert_eq!(path.path_edges.len(), 2);
        assert_eq!(path.path_edges[0].relation, "师徒");
    }

    #[test]
    fn test_reverse_query_keeps_recorded_direction() {
        let graph = KnowledgeGraph::build(&chain_snapshot(), &BTreeSet::new());
        let path = graph.shortest_path(&"C".into(), &"A".into()).unwrap();
        let ids: Vec<u64> = path.path_nodes.iter().map(EntityId::as_u64).collect();
        assert_eq!(ids, [3, 2, 1]);
        // Edges report their stored orientation even when walked backwards.
        assert_eq!(path.path_edges[0].source, EntityId::from_raw(2));
        assert_eq!(path.path_edges[0].target, EntityId::from_raw(3));
    }

    #[test]
    fn test_unreachable_pair_yields_empty_path() {
        let graph = KnowledgeGraph::build(&chain_snapshot(), &BTreeSet::new());
        let path = graph.shortest_path(&"A".into(), &"D".into()).unwrap();
        assert!(path.is_unreachable());
        assert!(path.path_edges.is_empty());
    }

    #[test]
    fn test_path_to_self_is_single_node() {
        let graph = KnowledgeGraph::build(&chain_snapshot(), &BTreeSet::new());
        let path = graph.shortest_path(&"B".into(), &"B".into()).unwrap();
        assert_eq!(path.path_nodes.len(), 1);
        assert!(path.path_edges.is_empty());
    }

    #[test]
    fn test_unknown_endpoint_is_an_error() {
        let graph = KnowledgeGraph::build(&chain_snapshot(), &BTreeSet::new());
        let err = graph.shortest_path(&"A".into(), &"Nobody".into()).unwrap_err();
        assert!(matches!(err, LoreError::EntityNotFound { .. }));
    }

    #[test]
    fn test_shortest_wins_over_longer_route() {
        // A-B-C-D chain plus a direct A-D edge.
        let mut snapshot = chain_snapshot();
        snapshot.relationships.push(relationship(3, 3, 4, "同门"));
        snapshot.relationships.push(relationship(4, 1, 4, "旧识"));
        let graph = KnowledgeGraph::build(&snapshot, &BTreeSet::new());

        let path = graph.shortest_path(&"A".into(), &"D".into()).unwrap();
        assert_eq!(path.path_nodes.len(), 2);
        assert_eq!(path.path_edges[0].relation, "旧识");
    }
}

//! Knowledge graph construction and path queries over extracted worlds.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use loregraph::{
    ChapterSpan, ConflictReport, EntityFact, ExtractError, FactPatch, InMemoryLoreStore,
    LoreEngine, LoreStore, NewEntity, NewRelationship, RelationshipFact, SettingExtractor,
    WorldId, WorldSnapshot, WriteBatch, WriteOp,
};

struct ScriptedExtractor {
    patches: Mutex<BTreeMap<String, FactPatch>>,
}

impl ScriptedExtractor {
    fn new(patches: Vec<(&str, FactPatch)>) -> Self {
        Self {
            patches: Mutex::new(
                patches
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ),
        }
    }
}

impl SettingExtractor for ScriptedExtractor {
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

fn entity(name: &str) -> NewEntity {
    NewEntity {
        name: name.to_string(),
        kind: "人物".to_string(),
        properties: BTreeMap::new(),
    }
}

fn relationship(subject: &str, object: &str, relation: &str) -> NewRelationship {
    NewRelationship {
        subject: subject.to_string(),
        object: object.to_string(),
        relation: relation.to_string(),
    }
}

/// Chapter 1 introduces A-B-C as a chain; chapter 2 adds D tied to C.
fn chain_engine() -> (LoreEngine, WorldId) {
    let patches = vec![
        (
            "c1",
            FactPatch {
                entities: vec![entity("A"), entity("B"), entity("C")],
                relationships: vec![
                    relationship("A", "B", "师徒"),
                    relationship("B", "C", "同门"),
                ],
                invalidated: Vec::new(),
            },
        ),
        (
            "c2",
            FactPatch {
                entities: vec![entity("D")],
                relationships: vec![relationship("C", "D", "仇敌")],
                invalidated: Vec::new(),
            },
        ),
    ];
    let engine = LoreEngine::new(
        Arc::new(InMemoryLoreStore::new()),
        Arc::new(ScriptedExtractor::new(patches)),
    );
    let world = engine.create_world("测试", "tester").unwrap().id;
    engine.add_chapter(world, 1, "第一章", "c1").unwrap();
    engine.add_chapter(world, 2, "第二章", "c2").unwrap();
    engine.reconcile_chapter(world, 1).unwrap();
    engine.reconcile_chapter(world, 2).unwrap();
    (engine, world)
}

#[test]
fn test_graph_reflects_snapshot_chapter() {
    let (engine, world) = chain_engine();

    let at_1 = engine.knowledge_graph(world, 1, 0).unwrap();
    assert_eq!(at_1.nodes.len(), 3);
    assert_eq!(at_1.edges.len(), 2);

    let at_2 = engine.knowledge_graph(world, 2, 0).unwrap();
    assert_eq!(at_2.nodes.len(), 4);
    assert_eq!(at_2.edges.len(), 3);
}

#[test]
fn test_recency_window_marks_new_nodes() {
    let (engine, world) = chain_engine();

    let graph = engine.knowledge_graph(world, 2, 1).unwrap();
    assert!(graph.node(&"D".into()).unwrap().is_new);
    // C is an endpoint of the chapter-2 relationship, so it counts too.
    assert!(graph.node(&"C".into()).unwrap().is_new);
    assert!(!graph.node(&"A".into()).unwrap().is_new);

    let wide = engine.knowledge_graph(world, 2, 2).unwrap();
    assert!(wide.node(&"A".into()).unwrap().is_new);
}

#[test]
fn test_shortest_path_across_chapters() {
    let (engine, world) = chain_engine();
    let graph = engine.knowledge_graph(world, 2, 0).unwrap();

    let path = graph.shortest_path(&"A".into(), &"D".into()).unwrap();
    assert_eq!(path.path_nodes.len(), 4);
    assert_eq!(path.path_edges.len(), 3);
    let labels: Vec<&str> = path.path_edges.iter().map(|e| e.relation.as_str()).collect();
    assert_eq!(labels, ["师徒", "同门", "仇敌"]);
}

#[test]
fn test_reverse_path_keeps_edge_direction() {
    let (engine, world) = chain_engine();
    let graph = engine.knowledge_graph(world, 2, 0).unwrap();

    let forward = graph.shortest_path(&"A".into(), &"C".into()).unwrap();
    let backward = graph.shortest_path(&"C".into(), &"A".into()).unwrap();
    assert_eq!(forward.path_edges.len(), backward.path_edges.len());
    // Same edges, traversed in opposite node order.
    assert_eq!(forward.path_edges[0], backward.path_edges[1]);
    assert_eq!(
        forward.path_nodes.first(),
        backward.path_nodes.last()
    );
}

#[test]
fn test_unreachable_after_graph_splits() {
    let patches = vec![(
        "c1",
        FactPatch {
            entities: vec![entity("A"), entity("B"), entity("孤岛")],
            relationships: vec![relationship("A", "B", "师徒")],
            invalidated: Vec::new(),
        },
    )];
    let engine = LoreEngine::new(
        Arc::new(InMemoryLoreStore::new()),
        Arc::new(ScriptedExtractor::new(patches)),
    );
    let world = engine.create_world("测试", "tester").unwrap().id;
    engine.add_chapter(world, 1, "第一章", "c1").unwrap();
    engine.reconcile_chapter(world, 1).unwrap();

    let graph = engine.knowledge_graph(world, 1, 0).unwrap();
    let path = graph.shortest_path(&"A".into(), &"孤岛".into()).unwrap();
    assert!(path.is_unreachable());
}

#[test]
fn test_relationship_invalidation_removes_edge() {
    let patches = vec![
        (
            "c1",
            FactPatch {
                entities: vec![entity("A"), entity("B")],
                relationships: vec![relationship("A", "B", "盟友")],
                invalidated: Vec::new(),
            },
        ),
        (
            "c2",
            FactPatch {
                invalidated: vec![loregraph::Invalidation::Relationship {
                    subject: "A".to_string(),
                    object: "B".to_string(),
                    relation: "盟友".to_string(),
                }],
                ..FactPatch::default()
            },
        ),
    ];
    let engine = LoreEngine::new(
        Arc::new(InMemoryLoreStore::new()),
        Arc::new(ScriptedExtractor::new(patches)),
    );
    let world = engine.create_world("测试", "tester").unwrap().id;
    engine.add_chapter(world, 1, "第一章", "c1").unwrap();
    engine.add_chapter(world, 2, "第二章", "c2").unwrap();
    engine.reconcile_chapter(world, 1).unwrap();
    engine.reconcile_chapter(world, 2).unwrap();

    assert_eq!(engine.knowledge_graph(world, 1, 0).unwrap().edges.len(), 1);
    assert!(engine.knowledge_graph(world, 2, 0).unwrap().edges.is_empty());
}

#[test]
fn test_edge_with_endpoint_outside_snapshot_is_reported() {
    // Hand-build a store where a relationship is valid at chapter 1 but
    // its subject entity only appears at chapter 3 (out-of-order
    // extraction leaves exactly this shape).
    let store = Arc::new(InMemoryLoreStore::new());
    let engine = LoreEngine::new(
        store.clone(),
        Arc::new(ScriptedExtractor::new(Vec::new())),
    );
    let world = engine.create_world("测试", "tester").unwrap().id;
    for n in 1..=3 {
        engine
            .add_chapter(world, n, &format!("第{n}章"), "")
            .unwrap();
    }

    let late = EntityFact {
        id: store.allocate_entity_id(),
        world_id: world,
        name: "迟到者".to_string(),
        kind: "人物".to_string(),
        span: ChapterSpan::open(3),
    };
    let early = EntityFact {
        id: store.allocate_entity_id(),
        world_id: world,
        name: "先行者".to_string(),
        kind: "人物".to_string(),
        span: ChapterSpan::open(1),
    };
    let rel = RelationshipFact {
        id: store.allocate_relationship_id(),
        world_id: world,
        subject_id: late.id,
        object_id: early.id,
        subject: "迟到者".to_string(),
        object: "先行者".to_string(),
        relation: "旧识".to_string(),
        span: ChapterSpan::open(1),
    };
    let mut batch = WriteBatch::new();
    batch.push(WriteOp::InsertEntity(late));
    batch.push(WriteOp::InsertEntity(early));
    batch.push(WriteOp::InsertRelationship(rel));
    store.apply(world, batch).unwrap();

    let graph = engine.knowledge_graph(world, 1, 0).unwrap();
    assert_eq!(graph.nodes.len(), 1);
    assert!(graph.edges.is_empty());
    assert_eq!(graph.skipped.len(), 1);
    assert_eq!(graph.skipped[0].subject, "迟到者");
    assert_eq!(graph.skipped[0].reason, "subject not in snapshot");

    // At chapter 3 both endpoints project and the edge comes back.
    let at_3 = engine.knowledge_graph(world, 3, 0).unwrap();
    assert_eq!(at_3.edges.len(), 1);
    assert!(at_3.skipped.is_empty());
}

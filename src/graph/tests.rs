use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::{find_cycles, quarantine_cycles, DependencyGraph, GraphError, TreeDirection};
use crate::cancel::CancelToken;
use crate::db;
use crate::domain::{Dependency, DependencyType, Issue};
use crate::store::{IssueQuery, IssueStore, NewIssue, StoreOptions};

fn open_store(dir: &tempfile::TempDir) -> IssueStore {
    IssueStore::open(
        &dir.path().join("cache").join("beads.sqlite"),
        &dir.path().join("locks").join("write.lock"),
        StoreOptions::default(),
    )
    .expect("store should open")
}

fn create(store: &IssueStore, title: &str) -> Issue {
    store
        .create(NewIssue {
            title: title.to_string(),
            ..NewIssue::default()
        })
        .expect("create should succeed")
}

fn ready_ids(graph: &DependencyGraph<'_>) -> BTreeSet<String> {
    graph
        .ready(&IssueQuery::default(), &CancelToken::new())
        .expect("ready should succeed")
        .into_iter()
        .map(|issue| issue.id)
        .collect()
}

/// Small xorshift generator so randomized graphs are reproducible.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

#[test]
fn closing_the_blocker_makes_the_dependent_ready() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let graph = DependencyGraph::new(&store);
    let a = create(&store, "A");
    let b = create(&store, "B");

    graph
        .add_dependency(&b.id, &a.id, DependencyType::Blocks)
        .expect("B blocked by A");
    assert_eq!(ready_ids(&graph), BTreeSet::from([a.id.clone()]));

    let blocked = graph
        .blocked(&IssueQuery::default(), &CancelToken::new())
        .expect("blocked should succeed");
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].issue.id, b.id);
    assert_eq!(blocked[0].blockers[0].id, a.id);

    store.close(&a.id, "done").expect("close A");
    assert_eq!(ready_ids(&graph), BTreeSet::from([b.id.clone()]));
}

#[test]
fn closing_edge_is_rejected_and_graph_unchanged() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let graph = DependencyGraph::new(&store);
    let a = create(&store, "A");
    let b = create(&store, "B");

    graph
        .add_dependency(&a.id, &b.id, DependencyType::Blocks)
        .expect("first edge should be accepted");
    let before_pending = store.pending_count().expect("count");
    let err = graph
        .add_dependency(&b.id, &a.id, DependencyType::Blocks)
        .expect_err("second edge closes a cycle");
    match err {
        GraphError::CycleDetected { path, .. } => {
            assert_eq!(path, vec![b.id.clone(), a.id.clone(), b.id.clone()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(store.pending_count().expect("count"), before_pending);
    assert!(store.get(&b.id).expect("get").dependencies.is_empty());
    assert!(graph
        .cycles(&CancelToken::new())
        .expect("cycles should succeed")
        .is_empty());
}

#[test]
fn self_edges_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let graph = DependencyGraph::new(&store);
    let a = create(&store, "A");
    assert!(matches!(
        graph.add_dependency(&a.id, &a.id, DependencyType::Blocks),
        Err(GraphError::CycleDetected { .. })
    ));
    assert!(matches!(
        graph.add_dependency(&a.id, &a.id, DependencyType::Related),
        Err(GraphError::Store(_))
    ));
}

#[test]
fn non_blocking_edges_never_cycle_or_block() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let graph = DependencyGraph::new(&store);
    let a = create(&store, "A");
    let b = create(&store, "B");
    graph
        .add_dependency(&a.id, &b.id, DependencyType::Related)
        .expect("related a -> b");
    graph
        .add_dependency(&b.id, &a.id, DependencyType::Related)
        .expect("related b -> a is not a cycle");
    assert_eq!(ready_ids(&graph).len(), 2);

    let once = graph
        .add_dependency(&a.id, &b.id, DependencyType::Related)
        .expect("duplicate edge is idempotent");
    assert_eq!(once.revision, 2);
}

#[test]
fn remove_dependency_unblocks() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let graph = DependencyGraph::new(&store);
    let a = create(&store, "A");
    let b = create(&store, "B");
    graph
        .add_dependency(&b.id, &a.id, DependencyType::Blocks)
        .expect("add");
    graph
        .remove_dependency(&b.id, &a.id, None)
        .expect("remove");
    assert_eq!(ready_ids(&graph).len(), 2);
    assert!(graph.remove_dependency(&b.id, &a.id, None).is_err());
}

#[test]
fn deleted_blockers_do_not_block() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let graph = DependencyGraph::new(&store);
    let a = create(&store, "A");
    let b = create(&store, "B");
    graph
        .add_dependency(&b.id, &a.id, DependencyType::Blocks)
        .expect("add");
    store.delete(&a.id).expect("delete A");
    assert_eq!(ready_ids(&graph), BTreeSet::from([b.id.clone()]));
}

#[test]
fn random_dags_match_brute_force_readiness() {
    let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
    for _round in 0..4 {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let store = open_store(&dir);
        let graph = DependencyGraph::new(&store);
        let issues = (0..18)
            .map(|n| create(&store, &format!("node {n}")))
            .collect::<Vec<_>>();

        // Edges only point from higher to lower index, so the graph is a DAG.
        let mut edges: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for _ in 0..30 {
            let from = 1 + rng.below(issues.len() - 1);
            let to = rng.below(from);
            graph
                .add_dependency(&issues[from].id, &issues[to].id, DependencyType::Blocks)
                .expect("forward edge cannot cycle");
            edges.entry(from).or_default().insert(to);
        }

        let mut closed = HashSet::new();
        for index in 0..issues.len() {
            if rng.below(3) == 0 {
                store.close(&issues[index].id, "random").expect("close");
                closed.insert(index);
            }
        }

        let expected = (0..issues.len())
            .filter(|index| !closed.contains(index))
            .filter(|index| {
                edges
                    .get(index)
                    .map_or(true, |blockers| blockers.iter().all(|b| closed.contains(b)))
            })
            .map(|index| issues[index].id.clone())
            .collect::<BTreeSet<_>>();
        assert_eq!(ready_ids(&graph), expected);
        assert!(graph
            .cycles(&CancelToken::new())
            .expect("cycles")
            .is_empty());
    }
}

#[test]
fn random_edge_attempts_keep_the_graph_acyclic() {
    let mut rng = Rng(0xDEAD_BEEF_CAFE_F00D);
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let graph = DependencyGraph::new(&store);
    let issues = (0..12)
        .map(|n| create(&store, &format!("node {n}")))
        .collect::<Vec<_>>();
    let mut adjacency: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();

    let reaches = |adjacency: &BTreeMap<usize, BTreeSet<usize>>, start: usize, goal: usize| {
        let mut stack = vec![start];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == goal {
                return true;
            }
            if seen.insert(node) {
                stack.extend(adjacency.get(&node).into_iter().flatten().copied());
            }
        }
        false
    };

    for _ in 0..60 {
        let from = rng.below(issues.len());
        let to = rng.below(issues.len());
        let would_cycle = from == to || reaches(&adjacency, to, from);
        let result = graph.add_dependency(&issues[from].id, &issues[to].id, DependencyType::Blocks);
        if would_cycle {
            assert!(matches!(result, Err(GraphError::CycleDetected { .. })));
        } else {
            result.expect("acyclic edge should be accepted");
            adjacency.entry(from).or_default().insert(to);
        }
    }

    assert!(graph
        .cycles(&CancelToken::new())
        .expect("cycles")
        .is_empty());
}

#[test]
fn merged_cycle_is_quarantined_and_released() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let graph = DependencyGraph::new(&store);
    let mut a = create(&store, "A");
    let mut b = create(&store, "B");

    // Two branches each added one half of the cycle.
    a.dependencies.push(Dependency {
        to: b.id.clone(),
        dep_type: DependencyType::Blocks,
        created_at: "2026-02-01T00:00:00Z".to_string(),
    });
    b.dependencies.push(Dependency {
        to: a.id.clone(),
        dep_type: DependencyType::Blocks,
        created_at: "2026-02-02T00:00:00Z".to_string(),
    });
    db::upsert_issue(store.conn(), &a).expect("merge a");
    db::upsert_issue(store.conn(), &b).expect("merge b");
    assert_eq!(graph.cycles(&CancelToken::new()).expect("cycles").len(), 1);

    let quarantined = quarantine_cycles(store.conn()).expect("quarantine");
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].from, b.id);
    assert!(graph.cycles(&CancelToken::new()).expect("cycles").is_empty());
    assert_eq!(ready_ids(&graph), BTreeSet::from([b.id.clone()]));

    a.dependencies.clear();
    db::upsert_issue(store.conn(), &a).expect("resolve a");
    assert!(quarantine_cycles(store.conn()).expect("recompute").is_empty());
    assert!(graph.quarantined().expect("quarantined").is_empty());
}

#[test]
fn tree_walks_blockers_and_dependents() {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let store = open_store(&dir);
    let graph = DependencyGraph::new(&store);
    let a = create(&store, "A");
    let b = create(&store, "B");
    let c = create(&store, "C");
    graph
        .add_dependency(&c.id, &b.id, DependencyType::Blocks)
        .expect("c waits on b");
    graph
        .add_dependency(&b.id, &a.id, DependencyType::Blocks)
        .expect("b waits on a");

    let tree = graph
        .tree(&c.id, 10, TreeDirection::Blockers)
        .expect("tree");
    assert_eq!(tree.children.len(), 1);
    assert_eq!(tree.children[0].id, b.id);
    assert_eq!(tree.children[0].children[0].id, a.id);

    let shallow = graph.tree(&c.id, 1, TreeDirection::Blockers).expect("tree");
    assert!(shallow.children[0].truncated);

    let reverse = graph
        .tree(&a.id, 10, TreeDirection::Dependents)
        .expect("tree");
    assert_eq!(reverse.children[0].id, b.id);
    assert_eq!(reverse.children[0].children[0].id, c.id);
}

#[test]
fn tarjan_reports_components_and_self_loops() {
    let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut edge = |from: &str, to: &str| {
        adjacency
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    };
    edge("a", "b");
    edge("b", "c");
    edge("c", "a");
    edge("c", "d");
    edge("e", "e");
    edge("f", "g");

    let cycles = find_cycles(&adjacency, &CancelToken::new()).expect("scan");
    assert_eq!(
        cycles,
        vec![
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            vec!["e".to_string()],
        ]
    );
}

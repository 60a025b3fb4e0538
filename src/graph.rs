use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::cancel::{CancelToken, Cancelled};
use crate::codec::RecordOp;
use crate::db::{self, EdgeRecord, IssueState};
use crate::domain::timestamp::{compare, now_utc_rfc3339};
use crate::domain::{Dependency, DependencyType, Issue, Status};
use crate::store::{IssueQuery, IssueStore, StoreError};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cycle detected: {from} -> {to} would close {}", .path.join(" -> "))]
    CycleDetected {
        from: String,
        to: String,
        path: Vec<String>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for GraphError {
    fn from(value: rusqlite::Error) -> Self {
        GraphError::Store(StoreError::Db(value))
    }
}

impl From<Cancelled> for GraphError {
    fn from(value: Cancelled) -> Self {
        GraphError::Store(StoreError::Cancelled(value))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedIssue {
    pub issue: Issue,
    pub blockers: Vec<Issue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub id: String,
    pub title: String,
    pub status: Status,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub quarantined: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub missing: bool,
    /// Node already appears on the path from the root.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cycle: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeDirection {
    /// What the root waits on.
    Blockers,
    /// What waits on the root.
    Dependents,
}

/// Typed edges between issues; `blocks` edges stay acyclic.
pub struct DependencyGraph<'a> {
    store: &'a IssueStore,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(store: &'a IssueStore) -> Self {
        Self { store }
    }

    /// Records that `from` depends on `to`. For `blocks` the reachability
    /// check and the write share one locked transaction.
    pub fn add_dependency(
        &self,
        from: &str,
        to: &str,
        dep_type: DependencyType,
    ) -> Result<Issue, GraphError> {
        self.store.write(|writer| {
            let mut source = writer.load_live(from)?;
            let target = writer.load_live(to)?;

            if source.id == target.id {
                if dep_type.is_blocking() {
                    return Err(GraphError::CycleDetected {
                        from: from.to_string(),
                        to: to.to_string(),
                        path: vec![source.id.clone(), source.id.clone()],
                    });
                }
                return Err(StoreError::Validation(format!(
                    "an issue cannot depend on itself ({dep_type})"
                ))
                .into());
            }
            if source.has_dependency(&target.id, dep_type) {
                return Ok(source);
            }

            if dep_type.is_blocking() {
                let adjacency = blocking_adjacency(&db::list_edges(writer.conn())?, true);
                if let Some(path) = find_path(&adjacency, &target.id, &source.id) {
                    let mut cycle = Vec::with_capacity(path.len() + 1);
                    cycle.push(source.id.clone());
                    cycle.extend(path);
                    return Err(GraphError::CycleDetected {
                        from: from.to_string(),
                        to: to.to_string(),
                        path: cycle,
                    });
                }
            }

            source.dependencies.push(Dependency {
                to: target.id,
                dep_type,
                created_at: now_utc_rfc3339(),
            });
            Ok(writer.commit(RecordOp::Dependency, source)?)
        })
    }

    /// Removes `from -> to` edges, all types unless `dep_type` narrows it.
    pub fn remove_dependency(
        &self,
        from: &str,
        to: &str,
        dep_type: Option<DependencyType>,
    ) -> Result<Issue, GraphError> {
        self.store.write(|writer| {
            let mut source = writer.load_live(from)?;
            let before = source.dependencies.len();
            source.dependencies.retain(|dep| {
                !(dep.to == to && dep_type.map_or(true, |kind| dep.dep_type == kind))
            });
            if source.dependencies.len() == before {
                return Err(StoreError::NotFound(format!("dependency {from} -> {to}")).into());
            }
            Ok(writer.commit(RecordOp::Dependency, source)?)
        })
    }

    /// Non-closed, non-deleted issues whose active `blocks` predecessors are
    /// all resolved, filtered and ordered by `query`.
    pub fn ready(
        &self,
        query: &IssueQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<Issue>, GraphError> {
        let candidates = self.open_candidates(query, cancel)?;
        let states = db::list_issue_states(self.store.conn())?;
        let blockers = active_blockers(&db::list_edges(self.store.conn())?);
        cancel.check()?;

        let mut ready = candidates
            .into_iter()
            .filter(|issue| open_blockers(&issue.id, &blockers, &states).is_empty())
            .collect::<Vec<_>>();
        if let Some(limit) = query.limit {
            ready.truncate(limit);
        }
        Ok(ready)
    }

    pub fn blocked(
        &self,
        query: &IssueQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<BlockedIssue>, GraphError> {
        let candidates = self.open_candidates(query, cancel)?;
        let states = db::list_issue_states(self.store.conn())?;
        let blockers = active_blockers(&db::list_edges(self.store.conn())?);

        let mut blocked = Vec::new();
        for issue in candidates {
            cancel.check()?;
            let open = open_blockers(&issue.id, &blockers, &states);
            if open.is_empty() {
                continue;
            }
            let blocker_issues = open
                .iter()
                .map(|id| self.store.get(id))
                .collect::<Result<Vec<_>, _>>()?;
            blocked.push(BlockedIssue {
                issue,
                blockers: blocker_issues,
            });
            if query.limit.is_some_and(|limit| blocked.len() >= limit) {
                break;
            }
        }
        Ok(blocked)
    }

    /// Strongly connected components (and self-loops) of the active
    /// `blocks` subgraph. Empty in normal operation.
    pub fn cycles(&self, cancel: &CancelToken) -> Result<Vec<Vec<String>>, GraphError> {
        let edges = db::list_edges(self.store.conn())?;
        cancel.check()?;
        Ok(find_cycles(&blocking_adjacency(&edges, false), cancel)?)
    }

    pub fn quarantined(&self) -> Result<Vec<EdgeRecord>, GraphError> {
        Ok(db::list_edges(self.store.conn())?
            .into_iter()
            .filter(|edge| edge.quarantined)
            .collect())
    }

    pub fn tree(
        &self,
        root: &str,
        max_depth: usize,
        direction: TreeDirection,
    ) -> Result<TreeNode, GraphError> {
        let root = self.store.get(root)?;
        let mut path = HashSet::new();
        self.tree_node(&root.id, None, max_depth, direction, &mut path)
    }

    fn tree_node(
        &self,
        id: &str,
        via: Option<&EdgeRecord>,
        remaining: usize,
        direction: TreeDirection,
        path: &mut HashSet<String>,
    ) -> Result<TreeNode, GraphError> {
        let quarantined = via.is_some_and(|edge| edge.quarantined);
        let Some(issue) = self.store.find(id)? else {
            return Ok(TreeNode {
                id: id.to_string(),
                title: String::new(),
                status: Status::Open,
                quarantined,
                missing: true,
                cycle: false,
                truncated: false,
                children: Vec::new(),
            });
        };

        let mut node = TreeNode {
            id: issue.id.clone(),
            title: issue.title.clone(),
            status: issue.status,
            quarantined,
            missing: false,
            cycle: path.contains(&issue.id),
            truncated: false,
            children: Vec::new(),
        };
        if node.cycle {
            return Ok(node);
        }

        let edges = match direction {
            TreeDirection::Blockers => db::edges_from(self.store.conn(), &issue.id)?,
            TreeDirection::Dependents => db::edges_to(self.store.conn(), &issue.id)?,
        };
        let edges = edges
            .into_iter()
            .filter(|edge| edge.dep_type.is_blocking())
            .collect::<Vec<_>>();
        if edges.is_empty() {
            return Ok(node);
        }
        if remaining == 0 {
            node.truncated = true;
            return Ok(node);
        }

        path.insert(issue.id.clone());
        for edge in &edges {
            let next = match direction {
                TreeDirection::Blockers => edge.to.as_str(),
                TreeDirection::Dependents => edge.from.as_str(),
            };
            node.children
                .push(self.tree_node(next, Some(edge), remaining - 1, direction, path)?);
        }
        path.remove(&issue.id);
        Ok(node)
    }

    fn open_candidates(
        &self,
        query: &IssueQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<Issue>, GraphError> {
        let mut unbounded = query.without_limit();
        unbounded.include_deleted = false;
        if unbounded.statuses.is_empty() {
            unbounded.include_closed = false;
        }
        let issues = self.store.query(&unbounded, cancel)?;
        Ok(issues.into_iter().filter(Issue::is_open).collect())
    }
}

/// Re-derives quarantine flags from scratch: clears all of them, then marks
/// the newest edge inside each remaining cycle until the active `blocks`
/// subgraph is acyclic. Returns the newly quarantined edges.
pub fn quarantine_cycles(conn: &Connection) -> Result<Vec<EdgeRecord>, GraphError> {
    db::clear_quarantine(conn)?;
    let mut quarantined = Vec::new();
    let never = CancelToken::new();
    loop {
        let edges = db::list_edges(conn)?;
        let adjacency = blocking_adjacency(&edges, false);
        let components = find_cycles(&adjacency, &never)?;
        if components.is_empty() {
            break;
        }

        for component in components {
            let members = component.iter().map(String::as_str).collect::<HashSet<_>>();
            let newest = edges
                .iter()
                .filter(|edge| {
                    edge.dep_type.is_blocking()
                        && !edge.quarantined
                        && members.contains(edge.from.as_str())
                        && members.contains(edge.to.as_str())
                })
                .max_by(|a, b| {
                    compare(&a.created_at, &b.created_at)
                        .then_with(|| (&a.from, &a.to).cmp(&(&b.from, &b.to)))
                });
            if let Some(edge) = newest {
                warn!(from = %edge.from, to = %edge.to, "quarantining edge that closes a cycle");
                db::set_edge_quarantined(conn, &edge.from, &edge.to, edge.dep_type, true)?;
                quarantined.push(EdgeRecord {
                    quarantined: true,
                    ..edge.clone()
                });
            }
        }
    }
    Ok(quarantined)
}

/// `from -> [to]` over `blocks` edges, optionally including quarantined ones.
pub fn blocking_adjacency(
    edges: &[EdgeRecord],
    include_quarantined: bool,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for edge in edges {
        if !edge.dep_type.is_blocking() || (edge.quarantined && !include_quarantined) {
            continue;
        }
        adjacency
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.to.clone());
    }
    adjacency
}

fn active_blockers(edges: &[EdgeRecord]) -> HashMap<String, Vec<String>> {
    let mut blockers: HashMap<String, Vec<String>> = HashMap::new();
    for (from, targets) in blocking_adjacency(edges, false) {
        blockers.insert(from, targets.into_iter().collect());
    }
    blockers
}

/// Blockers of `id` that still exist and are neither closed nor deleted.
fn open_blockers(
    id: &str,
    blockers: &HashMap<String, Vec<String>>,
    states: &HashMap<String, IssueState>,
) -> Vec<String> {
    blockers
        .get(id)
        .map(|targets| {
            targets
                .iter()
                .filter(|target| states.get(*target).is_some_and(|state| !state.is_resolved()))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Depth-first search for a path `start -> ... -> goal`.
pub fn find_path(
    adjacency: &BTreeMap<String, BTreeSet<String>>,
    start: &str,
    goal: &str,
) -> Option<Vec<String>> {
    let mut stack = vec![(start.to_string(), 0usize)];
    let mut path: Vec<String> = Vec::new();
    let mut visited = HashSet::new();

    while let Some((node, depth)) = stack.pop() {
        path.truncate(depth);
        if !visited.insert(node.clone()) {
            continue;
        }
        path.push(node.clone());
        if node == goal {
            return Some(path);
        }
        if let Some(next) = adjacency.get(&node) {
            for neighbour in next.iter().rev() {
                if !visited.contains(neighbour) {
                    stack.push((neighbour.clone(), depth + 1));
                }
            }
        }
    }
    None
}

/// Tarjan's SCC, iterative. Returns components with more than one member
/// plus self-loops, each sorted, in sorted order.
pub fn find_cycles(
    adjacency: &BTreeMap<String, BTreeSet<String>>,
    cancel: &CancelToken,
) -> Result<Vec<Vec<String>>, Cancelled> {
    struct Frame<'a> {
        node: &'a str,
        neighbours: Vec<&'a str>,
        next: usize,
    }

    fn neighbours_of<'a>(
        adjacency: &'a BTreeMap<String, BTreeSet<String>>,
        node: &str,
    ) -> Vec<&'a str> {
        adjacency
            .get(node)
            .map(|targets| targets.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    let mut nodes: BTreeSet<&str> = BTreeSet::new();
    for (from, targets) in adjacency {
        nodes.insert(from.as_str());
        nodes.extend(targets.iter().map(String::as_str));
    }

    let mut index_of: HashMap<&str, usize> = HashMap::new();
    let mut lowlink: HashMap<&str, usize> = HashMap::new();
    let mut on_stack: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut next_index = 0usize;
    let mut components = Vec::new();

    for &root in &nodes {
        if index_of.contains_key(root) {
            continue;
        }
        cancel.check()?;

        let mut frames = vec![Frame {
            node: root,
            neighbours: neighbours_of(adjacency, root),
            next: 0,
        }];
        index_of.insert(root, next_index);
        lowlink.insert(root, next_index);
        next_index += 1;
        stack.push(root);
        on_stack.insert(root);

        while let Some(frame) = frames.last_mut() {
            if frame.next < frame.neighbours.len() {
                let neighbour = frame.neighbours[frame.next];
                frame.next += 1;
                let node = frame.node;
                if !index_of.contains_key(neighbour) {
                    index_of.insert(neighbour, next_index);
                    lowlink.insert(neighbour, next_index);
                    next_index += 1;
                    stack.push(neighbour);
                    on_stack.insert(neighbour);
                    frames.push(Frame {
                        node: neighbour,
                        neighbours: neighbours_of(adjacency, neighbour),
                        next: 0,
                    });
                } else if on_stack.contains(neighbour) {
                    let low = lowlink[node].min(index_of[neighbour]);
                    lowlink.insert(node, low);
                }
                continue;
            }

            let node = frame.node;
            frames.pop();
            if let Some(parent) = frames.last() {
                let low = lowlink[parent.node].min(lowlink[node]);
                lowlink.insert(parent.node, low);
            }
            if lowlink[node] != index_of[node] {
                continue;
            }

            let mut component = Vec::new();
            while let Some(member) = stack.pop() {
                on_stack.remove(member);
                component.push(member.to_string());
                if member == node {
                    break;
                }
            }
            let self_loop = adjacency
                .get(node)
                .is_some_and(|targets| targets.contains(node));
            if component.len() > 1 || self_loop {
                component.sort();
                components.push(component);
            }
        }
    }

    components.sort();
    Ok(components)
}

#[cfg(test)]
mod tests;

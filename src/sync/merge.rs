use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;

use crate::domain::timestamp::compare;
use crate::domain::{Dependency, DependencyType, Issue, Status};

/// One side of a same-revision conflict, with the agent that wrote it.
#[derive(Debug, Clone, Copy)]
pub struct MergeSide<'a> {
    pub issue: &'a Issue,
    pub agent: Option<&'a str>,
}

impl<'a> MergeSide<'a> {
    pub fn new(issue: &'a Issue, agent: Option<&'a str>) -> Self {
        Self { issue, agent }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub issue: Issue,
    /// Fields edited on both sides, settled by last-writer-wins.
    pub lww_fields: Vec<&'static str>,
    /// Fields edited on one side only, or set-merged.
    pub union_fields: Vec<&'static str>,
    pub winner_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("{id}: status diverged to {local} and {remote}; one side closed the issue")]
    TerminalStatus {
        id: String,
        local: Status,
        remote: Status,
    },
}

/// Total order used for last-writer-wins: `updated_at`, then agent, then the
/// snapshot bytes so both clones always pick the same winner.
pub fn writer_order(left: &MergeSide<'_>, right: &MergeSide<'_>) -> Ordering {
    compare(&left.issue.updated_at, &right.issue.updated_at)
        .then_with(|| left.agent.cmp(&right.agent))
        .then_with(|| canonical(left.issue).cmp(&canonical(right.issue)))
}

fn canonical(issue: &Issue) -> String {
    serde_json::to_string(issue).unwrap_or_default()
}

/// The side that wins outright, used as the provisional value of a flagged
/// conflict.
pub fn last_writer<'a>(left: MergeSide<'a>, right: MergeSide<'a>) -> MergeSide<'a> {
    if writer_order(&left, &right) == Ordering::Less {
        right
    } else {
        left
    }
}

struct FieldMerge<'a> {
    remote_wins: bool,
    base: Option<&'a Issue>,
    lww_fields: Vec<&'static str>,
    union_fields: Vec<&'static str>,
}

impl<'a> FieldMerge<'a> {
    fn scalar<T, F>(
        &mut self,
        name: &'static str,
        local: &'a Issue,
        remote: &'a Issue,
        get: F,
    ) -> T
    where
        T: Clone + PartialEq + 'a,
        F: Fn(&'a Issue) -> &'a T,
    {
        let (l, r) = (get(local), get(remote));
        if l == r {
            return l.clone();
        }
        match self.base.map(&get) {
            Some(b) if b == l => {
                self.union_fields.push(name);
                r.clone()
            }
            Some(b) if b == r => {
                self.union_fields.push(name);
                l.clone()
            }
            _ => {
                self.lww_fields.push(name);
                if self.remote_wins {
                    r.clone()
                } else {
                    l.clone()
                }
            }
        }
    }

    fn status_changed_on_both(&self, local: &Issue, remote: &Issue) -> bool {
        match self.base {
            Some(base) => base.status != local.status && base.status != remote.status,
            None => true,
        }
    }
}

/// Three-way set merge: keeps elements both sides kept, plus anything either
/// side added. Without a base it degrades to union.
fn merge_set<T: Ord + Clone>(
    local: &BTreeSet<T>,
    remote: &BTreeSet<T>,
    base: Option<&BTreeSet<T>>,
) -> BTreeSet<T> {
    match base {
        None => local.union(remote).cloned().collect(),
        Some(base) => local
            .union(remote)
            .filter(|item| {
                let in_local = local.contains(*item);
                let in_remote = remote.contains(*item);
                (in_local && in_remote) || !base.contains(*item)
            })
            .cloned()
            .collect(),
    }
}

fn dependency_map(issue: &Issue) -> BTreeMap<(String, DependencyType), String> {
    issue
        .dependencies
        .iter()
        .map(|dep| ((dep.to.clone(), dep.dep_type), dep.created_at.clone()))
        .collect()
}

fn merge_dependencies(local: &Issue, remote: &Issue, base: Option<&Issue>) -> Vec<Dependency> {
    let local_map = dependency_map(local);
    let remote_map = dependency_map(remote);
    let base_keys = base.map(|issue| dependency_map(issue).into_keys().collect::<BTreeSet<_>>());
    let keys = merge_set(
        &local_map.keys().cloned().collect(),
        &remote_map.keys().cloned().collect(),
        base_keys.as_ref(),
    );

    keys.into_iter()
        .map(|key| {
            let created_at = match (local_map.get(&key), remote_map.get(&key)) {
                (Some(l), Some(r)) => {
                    if compare(l, r) == Ordering::Greater {
                        r.clone()
                    } else {
                        l.clone()
                    }
                }
                (Some(value), None) | (None, Some(value)) => value.clone(),
                (None, None) => String::new(),
            };
            Dependency {
                to: key.0,
                dep_type: key.1,
                created_at,
            }
        })
        .collect()
}

fn earliest(left: Option<&String>, right: Option<&String>) -> Option<String> {
    match (left, right) {
        (Some(l), Some(r)) => Some(if compare(l, r) == Ordering::Greater {
            r.clone()
        } else {
            l.clone()
        }),
        (Some(value), None) | (None, Some(value)) => Some(value.clone()),
        (None, None) => None,
    }
}

/// Field-level merge of two snapshots of the same issue. Orthogonal edits are
/// combined; fields edited on both sides fall back to last-writer-wins. A
/// status race where exactly one side closed the issue is not resolved.
///
/// The result is symmetric in `local`/`remote` and keeps the higher of the
/// two revisions; callers stamp the merge revision themselves.
pub fn resolve_conflict(
    local: MergeSide<'_>,
    remote: MergeSide<'_>,
    base: Option<&Issue>,
) -> Result<MergeOutcome, ConflictError> {
    let (l, r) = (local.issue, remote.issue);
    let remote_wins = writer_order(&local, &remote) == Ordering::Less;
    let mut fields = FieldMerge {
        remote_wins,
        base,
        lww_fields: Vec::new(),
        union_fields: Vec::new(),
    };

    if l.status != r.status
        && l.status.is_terminal() != r.status.is_terminal()
        && fields.status_changed_on_both(l, r)
    {
        return Err(ConflictError::TerminalStatus {
            id: l.id.clone(),
            local: l.status,
            remote: r.status,
        });
    }

    let status = fields.scalar("status", l, r, |i| &i.status);
    let mut issue = Issue {
        id: l.id.clone(),
        title: fields.scalar("title", l, r, |i| &i.title),
        description: fields.scalar("description", l, r, |i| &i.description),
        status,
        priority: fields.scalar("priority", l, r, |i| &i.priority),
        issue_type: fields.scalar("type", l, r, |i| &i.issue_type),
        labels: merge_set(&l.labels, &r.labels, base.map(|b| &b.labels)),
        assignee: fields.scalar("assignee", l, r, |i| &i.assignee),
        parent: fields.scalar("parent", l, r, |i| &i.parent),
        created_at: earliest(Some(&l.created_at), Some(&r.created_at)).unwrap_or_default(),
        updated_at: if compare(&l.updated_at, &r.updated_at) == Ordering::Less {
            r.updated_at.clone()
        } else {
            l.updated_at.clone()
        },
        close_reason: fields.scalar("close_reason", l, r, |i| &i.close_reason),
        closed_at: fields.scalar("closed_at", l, r, |i| &i.closed_at),
        deleted_at: earliest(l.deleted_at.as_ref(), r.deleted_at.as_ref()),
        revision: l.revision.max(r.revision),
        dependencies: merge_dependencies(l, r, base),
        history_digest: fields.scalar("history_digest", l, r, |i| &i.history_digest),
        compacted_at: fields.scalar("compacted_at", l, r, |i| &i.compacted_at),
    };

    if l.labels != r.labels {
        fields.union_fields.push("labels");
    }
    if l.dependencies != r.dependencies {
        fields.union_fields.push("dependencies");
    }

    if issue.status.is_terminal() {
        let closed_side = if r.status.is_terminal() && (remote_wins || !l.status.is_terminal()) {
            r
        } else {
            l
        };
        if issue.close_reason.is_none() {
            issue.close_reason = closed_side.close_reason.clone();
        }
        if issue.closed_at.is_none() {
            issue.closed_at = closed_side.closed_at.clone();
        }
    } else {
        issue.close_reason = None;
        issue.closed_at = None;
    }
    issue.normalize();

    let winner = if remote_wins { remote } else { local };
    Ok(MergeOutcome {
        issue,
        lww_fields: fields.lww_fields,
        union_fields: fields.union_fields,
        winner_agent: winner.agent.map(str::to_string),
    })
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::codec::{CodecError, LogContents, LogFile, LogRecord, RecordOp};
use crate::db::{self, ConflictRecord, META_LAST_FLUSH_AT, META_LAST_IMPORT_AT, META_LOG_DIGEST};
use crate::domain::timestamp::now_utc_rfc3339;
use crate::domain::Issue;
use crate::graph::{blocking_adjacency, find_cycles, quarantine_cycles, GraphError};
use crate::id::split_child_id;
use crate::store::{IssueStore, StoreError, StoreWriter};

mod debounce;
mod git;
mod merge;

pub use debounce::Debouncer;
pub use git::{GitCli, GitError, GitOutcome, GitPlumbing};
pub use merge::{last_writer, resolve_conflict, ConflictError, MergeOutcome, MergeSide};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("git {step} failed: {detail}")]
    GitStepFailed { step: GitStep, detail: String },
    #[error("{} issue(s) need manual conflict resolution: {}", .ids.len(), .ids.join(", "))]
    Conflicts { ids: Vec<String> },
}

impl From<rusqlite::Error> for SyncError {
    fn from(value: rusqlite::Error) -> Self {
        SyncError::Store(StoreError::Db(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GitStep {
    Commit,
    Pull,
    Push,
}

impl fmt::Display for GitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GitStep::Commit => "commit",
            GitStep::Pull => "pull",
            GitStep::Push => "push",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub records: usize,
    pub issues: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flushed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub id: String,
    pub revision: u64,
    pub lww_fields: Vec<&'static str>,
    pub union_fields: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantinedEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub records_read: usize,
    pub corrupt_lines: usize,
    pub imported: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub resolutions: Vec<Resolution>,
    pub conflicts: Vec<ConflictReport>,
    pub cycles: Vec<Vec<String>>,
    pub quarantined: Vec<QuarantinedEdge>,
}

impl ReconcileSummary {
    pub fn conflict_ids(&self) -> Vec<String> {
        self.conflicts.iter().map(|c| c.id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub pending_records: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_pending_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_import_at: Option<String>,
    pub log_changed: bool,
    pub conflicts: Vec<String>,
}

/// Which stages of a full sync to run.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub flush: bool,
    pub commit: bool,
    pub pull: bool,
    pub import: bool,
    pub push: bool,
    pub message: String,
}

impl Default for SyncPlan {
    fn default() -> Self {
        Self {
            flush: true,
            commit: true,
            pull: true,
            import: true,
            push: true,
            message: "bd sync: update issues".to_string(),
        }
    }
}

impl SyncPlan {
    pub fn flush_only() -> Self {
        Self {
            commit: false,
            pull: false,
            import: false,
            push: false,
            ..Self::default()
        }
    }

    pub fn import_only() -> Self {
        Self {
            flush: false,
            commit: false,
            pull: false,
            push: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush: Option<FlushSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<GitOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull: Option<GitOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<GitOutcome>,
}

/// Moves records between the cache and `issues.log`.
pub struct SyncEngine<'a> {
    store: &'a IssueStore,
    log: LogFile,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a IssueStore, log: LogFile) -> Self {
        Self { store, log }
    }

    pub fn log(&self) -> &LogFile {
        &self.log
    }

    /// Appends every queued record to the log, then drops them from the
    /// queue. Runs under the store lock so no record is appended twice by
    /// concurrent flushers.
    pub fn flush(&self) -> Result<FlushSummary, SyncError> {
        self.store.write(|writer: &mut StoreWriter<'_>| {
            let conn = writer.conn();
            let pending = db::list_pending(conn, 0)?;
            let Some(last_seq) = pending.last().map(|record| record.seq) else {
                return Ok(FlushSummary::default());
            };

            let in_sync = db::get_meta(conn, META_LOG_DIGEST)? == self.log.digest()?;
            let lines = pending
                .iter()
                .map(|record| record.line.clone())
                .collect::<Vec<_>>();
            self.log.append(&lines)?;
            db::delete_pending_through(conn, last_seq)?;

            let now = now_utc_rfc3339();
            db::set_meta(conn, META_LAST_FLUSH_AT, &now)?;
            // Only advance the digest when nothing foreign landed in the log
            // since the last import; otherwise auto-import must still run.
            if in_sync {
                if let Some(digest) = self.log.digest()? {
                    db::set_meta(conn, META_LOG_DIGEST, &digest)?;
                }
            }

            let issues = pending
                .iter()
                .map(|record| record.issue_id.as_str())
                .collect::<BTreeSet<_>>()
                .len();
            info!(records = lines.len(), issues, "flushed pending records to issue log");
            Ok(FlushSummary {
                records: lines.len(),
                issues,
                flushed_at: Some(now),
            })
        })
    }

    /// True when the log on disk differs from what was last imported.
    pub fn needs_import(&self) -> Result<bool, SyncError> {
        let Some(digest) = self.log.digest()? else {
            return Ok(false);
        };
        let stored = db::get_meta(self.store.conn(), META_LOG_DIGEST)?;
        Ok(stored.as_deref() != Some(digest.as_str()))
    }

    /// Brings the cache in line with the log. Orthogonal concurrent edits
    /// merge field by field; unresolvable ones are flagged and everything
    /// else still imports.
    pub fn reconcile(&self) -> Result<ReconcileSummary, SyncError> {
        self.store.write(|writer: &mut StoreWriter<'_>| {
            let digest = self.log.digest()?;
            let contents = self.log.read()?;
            let summary = reconcile_into(writer, contents, digest.is_some())?;

            let conn = writer.conn();
            if let Some(digest) = digest {
                db::set_meta(conn, META_LOG_DIGEST, &digest)?;
            }
            db::set_meta(conn, META_LAST_IMPORT_AT, &now_utc_rfc3339())?;
            info!(
                records = summary.records_read,
                imported = summary.imported,
                updated = summary.updated,
                removed = summary.removed,
                resolutions = summary.resolutions.len(),
                conflicts = summary.conflicts.len(),
                "reconciled cache with issue log"
            );
            Ok(summary)
        })
    }

    /// Reconciles only when the log moved since the last import.
    pub fn auto_import(&self) -> Result<Option<ReconcileSummary>, SyncError> {
        if self.needs_import()? {
            self.reconcile().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        let conn = self.store.conn();
        Ok(SyncStatus {
            pending_records: db::pending_count(conn)?,
            oldest_pending_at: db::oldest_pending_at(conn)?,
            last_flush_at: db::get_meta(conn, META_LAST_FLUSH_AT)?,
            last_import_at: db::get_meta(conn, META_LAST_IMPORT_AT)?,
            log_changed: self.needs_import()?,
            conflicts: db::list_conflicts(conn)?
                .into_iter()
                .map(|record| record.issue_id)
                .collect(),
        })
    }

    /// flush, commit, pull, reconcile, push. A failed git step stops the
    /// pipeline; stages already completed stay done.
    pub fn run(&self, plan: &SyncPlan, git: &dyn GitPlumbing) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        if plan.flush {
            report.flush = Some(self.flush()?);
        }

        let paths = [self.log.path()];
        if plan.commit {
            let outcome = git.commit(&paths, &plan.message)?;
            let failed = !outcome.success;
            report.commit = Some(outcome.clone());
            if failed {
                return Err(step_failed(GitStep::Commit, outcome));
            }
        }
        if plan.pull {
            let outcome = git.pull()?;
            report.pull = Some(outcome.clone());
            if !outcome.success {
                if outcome.is_missing_remote() {
                    warn!(detail = %outcome.detail, "no remote to pull from; continuing locally");
                } else {
                    return Err(step_failed(GitStep::Pull, outcome));
                }
            }
        }
        if plan.import {
            report.reconcile = Some(self.reconcile()?);
        }
        if plan.push {
            // A merge written during reconcile must reach the log before push.
            if plan.flush {
                let merged = self.flush()?;
                if merged.records > 0 {
                    let outcome = git.commit(&paths, &plan.message)?;
                    if !outcome.success {
                        return Err(step_failed(GitStep::Commit, outcome));
                    }
                }
            }
            let outcome = git.push()?;
            report.push = Some(outcome.clone());
            if !outcome.success {
                if outcome.is_missing_remote() {
                    warn!(detail = %outcome.detail, "no remote to push to; skipping");
                } else {
                    return Err(step_failed(GitStep::Push, outcome));
                }
            }
        }
        Ok(report)
    }
}

fn step_failed(step: GitStep, outcome: GitOutcome) -> SyncError {
    SyncError::GitStepFailed {
        step,
        detail: outcome.detail,
    }
}

/// The log's settled view of one issue: its highest revision, with
/// same-revision forks merged when they can be.
struct LogView {
    max_rev: u64,
    issue: Issue,
    agent: Option<String>,
    merged: Option<Resolution>,
    conflict: Option<ConflictRecord>,
    records: Vec<LogRecord>,
}

fn canonical(issue: &Issue) -> String {
    serde_json::to_string(issue).unwrap_or_default()
}

/// Highest snapshot strictly below `rev`, when the log agrees on it.
fn base_below(records: &[LogRecord], rev: u64) -> Option<&Issue> {
    let below = records
        .iter()
        .filter(|record| record.rev < rev)
        .map(|record| record.rev)
        .max()?;
    let mut candidates = records
        .iter()
        .filter(|record| record.rev == below)
        .map(|record| &record.issue);
    let first = candidates.next()?;
    candidates.all(|other| other == first).then_some(first)
}

fn conflict_record(
    id: &str,
    revision: u64,
    local: &Issue,
    remote: &Issue,
    reason: String,
) -> ConflictRecord {
    ConflictRecord {
        issue_id: id.to_string(),
        revision,
        local_json: canonical(local),
        remote_json: canonical(remote),
        detected_at: now_utc_rfc3339(),
        reason,
    }
}

fn settle(id: &str, records: Vec<LogRecord>) -> Option<LogView> {
    let max_rev = records.iter().map(|record| record.rev).max()?;
    let mut tops = records
        .iter()
        .filter(|record| record.rev == max_rev)
        .collect::<Vec<_>>();
    tops.sort_by_cached_key(|record| canonical(&record.issue));
    tops.dedup_by(|a, b| a.issue == b.issue);

    let first = tops.first()?;
    let mut issue = first.issue.clone();
    let mut agent = first.agent.clone();
    let mut merged = None;
    let mut conflict = None;

    if tops.len() > 1 {
        let base = base_below(&records, max_rev);
        let mut lww_fields = Vec::new();
        let mut union_fields = Vec::new();
        for next in &tops[1..] {
            let left = MergeSide::new(&issue, agent.as_deref());
            let right = MergeSide::new(&next.issue, next.agent.as_deref());
            match resolve_conflict(left, right, base) {
                Ok(outcome) => {
                    issue = outcome.issue;
                    agent = outcome.winner_agent;
                    lww_fields.extend(outcome.lww_fields);
                    union_fields.extend(outcome.union_fields);
                }
                Err(err) => {
                    let provisional = tops
                        .iter()
                        .map(|record| MergeSide::new(&record.issue, record.agent.as_deref()))
                        .reduce(last_writer)
                        .map(|side| (side.issue.clone(), side.agent.map(str::to_string)));
                    conflict = Some(conflict_record(
                        id,
                        max_rev,
                        &issue,
                        &next.issue,
                        err.to_string(),
                    ));
                    if let Some((winner, winner_agent)) = provisional {
                        issue = winner;
                        agent = winner_agent;
                    }
                    break;
                }
            }
        }
        if conflict.is_none() {
            lww_fields.sort_unstable();
            lww_fields.dedup();
            union_fields.sort_unstable();
            union_fields.dedup();
            issue.revision = max_rev + 1;
            merged = Some(Resolution {
                id: id.to_string(),
                revision: issue.revision,
                lww_fields,
                union_fields,
                winner_agent: agent.clone(),
            });
        }
    }
    issue.normalize();

    Some(LogView {
        max_rev,
        issue,
        agent,
        merged,
        conflict,
        records,
    })
}

fn reconcile_into(
    writer: &mut StoreWriter<'_>,
    contents: LogContents,
    log_exists: bool,
) -> Result<ReconcileSummary, SyncError> {
    let mut summary = ReconcileSummary {
        records_read: contents.records.len(),
        corrupt_lines: contents.corrupt.len(),
        ..ReconcileSummary::default()
    };

    let mut by_id: BTreeMap<String, Vec<LogRecord>> = BTreeMap::new();
    for record in contents.records {
        by_id.entry(record.id.clone()).or_default().push(record);
    }
    let pending_first = db::first_pending_revisions(writer.conn())?;

    for (id, records) in by_id.iter() {
        let Some(view) = settle(id, records.clone()) else {
            continue;
        };
        let local = db::get_issue(writer.conn(), id)?;
        let first_pending = local.as_ref().and(pending_first.get(id).copied());

        match (local, first_pending) {
            // The log already holds revisions this clone also wrote locally.
            (Some(local), Some(first)) if view.max_rev >= first => {
                let base = base_below(&view.records, first);
                let actor = writer.actor().map(str::to_string);
                let local_side = MergeSide::new(&local, actor.as_deref());
                let remote_side = MergeSide::new(&view.issue, view.agent.as_deref());
                match resolve_conflict(local_side, remote_side, base) {
                    // Already merged locally; the merge record is still queued.
                    Ok(outcome) if outcome.issue == local => summary.unchanged += 1,
                    Ok(outcome) => {
                        let mut merged = outcome.issue;
                        merged.revision = local.revision.max(view.max_rev) + 1;
                        let revision = merged.revision;
                        writer.record(RecordOp::Merge, merged)?;
                        summary.resolutions.push(Resolution {
                            id: id.clone(),
                            revision,
                            lww_fields: outcome.lww_fields,
                            union_fields: outcome.union_fields,
                            winner_agent: outcome.winner_agent,
                        });
                    }
                    Err(err) => {
                        let provisional = last_writer(local_side, remote_side).issue.clone();
                        let record = conflict_record(
                            id,
                            view.max_rev,
                            &local,
                            &view.issue,
                            err.to_string(),
                        );
                        flag_conflict(writer, &mut summary, Some(&local), provisional, record)?;
                    }
                }
            }
            // Local revisions are ahead of the log and simply not flushed yet.
            (Some(_), Some(_)) => summary.unchanged += 1,
            (local, _) => {
                if let Some(record) = view.conflict {
                    flag_conflict(writer, &mut summary, local.as_ref(), view.issue, record)?;
                } else if let Some(resolution) = view.merged {
                    if local.as_ref() == Some(&view.issue) {
                        summary.unchanged += 1;
                    } else {
                        writer.record(RecordOp::Merge, view.issue)?;
                        summary.resolutions.push(resolution);
                    }
                } else if local.as_ref() == Some(&view.issue) {
                    db::clear_conflict(writer.conn(), id)?;
                    summary.unchanged += 1;
                } else {
                    db::upsert_issue(writer.conn(), &view.issue)?;
                    db::clear_conflict(writer.conn(), id)?;
                    if local.is_some() {
                        summary.updated += 1;
                    } else {
                        summary.imported += 1;
                    }
                }
            }
        }
    }

    let cached = db::list_issue_states(writer.conn())?;
    if log_exists {
        let mut stale = cached
            .keys()
            .filter(|id| !by_id.contains_key(*id) && !pending_first.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        stale.sort();
        for id in stale {
            warn!(id = %id, "removing cached issue absent from the log");
            db::delete_issue(writer.conn(), &id)?;
            db::clear_conflict(writer.conn(), &id)?;
            summary.removed += 1;
        }
    } else if !cached.is_empty() {
        warn!("issue log missing; keeping cached issues");
    }

    for id in by_id.keys().chain(cached.keys()) {
        if let Some((parent, number)) = split_child_id(id) {
            db::raise_child_counter(writer.conn(), parent, number)?;
        }
    }

    let edges = db::list_edges(writer.conn())?;
    summary.cycles = find_cycles(&blocking_adjacency(&edges, true), &CancelToken::new())
        .map_err(GraphError::from)?;
    summary.quarantined = quarantine_cycles(writer.conn())?
        .into_iter()
        .map(|edge| QuarantinedEdge {
            from: edge.from,
            to: edge.to,
        })
        .collect();
    Ok(summary)
}

fn flag_conflict(
    writer: &mut StoreWriter<'_>,
    summary: &mut ReconcileSummary,
    local: Option<&Issue>,
    provisional: Issue,
    record: ConflictRecord,
) -> Result<(), SyncError> {
    warn!(id = %record.issue_id, reason = %record.reason, "sync conflict needs manual resolution");
    if local != Some(&provisional) {
        db::upsert_issue(writer.conn(), &provisional)?;
    }
    db::upsert_conflict(writer.conn(), &record)?;
    summary.conflicts.push(ConflictReport {
        id: record.issue_id.clone(),
        reason: record.reason,
    });
    Ok(())
}

#[cfg(test)]
mod tests;

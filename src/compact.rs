use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::codec::{self, CodecError, LogFile, LogRecord, RecordOp};
use crate::db::{self, IssueState, META_LOG_DIGEST};
use crate::domain::timestamp::{format_rfc3339, now_utc_rfc3339, parse_rfc3339};
use crate::domain::{Issue, Status};
use crate::store::{IssueStore, StoreError, StoreWriter};
use crate::sync::{SyncEngine, SyncError};

#[derive(Debug, Error)]
pub enum CompactError {
    #[error("compaction threshold must not be negative (got {0} days)")]
    InvalidThreshold(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<rusqlite::Error> for CompactError {
    fn from(value: rusqlite::Error) -> Self {
        CompactError::Store(StoreError::Db(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactCandidate {
    pub id: String,
    pub title: String,
    pub updated_at: String,
    pub log_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedIssue {
    pub id: String,
    pub open_dependents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    pub older_than_days: i64,
    pub cutoff: String,
    pub log_records: usize,
    pub candidates: Vec<CompactCandidate>,
    /// Old closed issues kept because an open issue still waits on them.
    pub skipped: Vec<SkippedIssue>,
    pub reclaimable_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactSummary {
    pub compacted: Vec<String>,
    pub records_before: usize,
    pub records_after: usize,
}

/// Folds the history of old closed issues into one summarized record each.
pub struct Compactor<'a> {
    store: &'a IssueStore,
    log: LogFile,
}

impl<'a> Compactor<'a> {
    pub fn new(store: &'a IssueStore, log: LogFile) -> Self {
        Self { store, log }
    }

    pub fn analyze(&self, older_than_days: i64) -> Result<CompactReport, CompactError> {
        let cutoff = cutoff(older_than_days)?;
        let records = self.log.read()?.records;
        build_report(self.store.conn(), &records, older_than_days, cutoff)
    }

    /// Brings the log up to date, then rewrites it with each candidate's
    /// records replaced by a single `compact` record.
    pub fn compact(&self, older_than_days: i64) -> Result<CompactSummary, CompactError> {
        let cutoff = cutoff(older_than_days)?;
        let sync = SyncEngine::new(self.store, self.log.clone());
        sync.auto_import()?;
        sync.flush()?;

        self.store.write(|writer: &mut StoreWriter<'_>| {
            let contents = self.log.read()?;
            let report = build_report(writer.conn(), &contents.records, older_than_days, cutoff)?;
            let records_before = self.log.raw_lines()?.len();
            if report.candidates.is_empty() {
                return Ok(CompactSummary {
                    compacted: Vec::new(),
                    records_before,
                    records_after: records_before,
                });
            }

            let mut history: BTreeMap<&str, Vec<&LogRecord>> = BTreeMap::new();
            for record in &contents.records {
                history.entry(record.id.as_str()).or_default().push(record);
            }
            let now = now_utc_rfc3339();
            let mut summaries = Vec::new();
            for candidate in &report.candidates {
                let Some(mut issue) = db::get_issue(writer.conn(), &candidate.id)? else {
                    continue;
                };
                let records = history.get(candidate.id.as_str()).cloned().unwrap_or_default();
                let max_rev = records.iter().map(|r| r.rev).max().unwrap_or(0);
                issue.history_digest = Some(history_digest(&issue, &records));
                issue.compacted_at = Some(now.clone());
                issue.revision = issue.revision.max(max_rev) + 1;
                db::upsert_issue(writer.conn(), &issue)?;
                summaries.push(codec::encode(&LogRecord::new(
                    RecordOp::Compact,
                    issue,
                    writer.actor().map(str::to_string),
                ))?);
            }

            let compacted = report
                .candidates
                .iter()
                .map(|candidate| candidate.id.clone())
                .collect::<BTreeSet<_>>();
            let mut lines = self
                .log
                .raw_lines()?
                .into_iter()
                .filter(|line| match codec::decode(line) {
                    Ok(record) => !compacted.contains(&record.id),
                    Err(_) => true,
                })
                .collect::<Vec<_>>();
            lines.extend(summaries);
            self.log.rewrite(&lines)?;
            if let Some(digest) = self.log.digest()? {
                db::set_meta(writer.conn(), META_LOG_DIGEST, &digest)?;
            }

            info!(
                compacted = compacted.len(),
                records_before,
                records_after = lines.len(),
                "compacted issue log"
            );
            Ok(CompactSummary {
                compacted: compacted.into_iter().collect(),
                records_before,
                records_after: lines.len(),
            })
        })
    }
}

fn cutoff(older_than_days: i64) -> Result<OffsetDateTime, CompactError> {
    if older_than_days < 0 {
        return Err(CompactError::InvalidThreshold(older_than_days));
    }
    Ok(OffsetDateTime::now_utc() - Duration::days(older_than_days))
}

fn build_report(
    conn: &rusqlite::Connection,
    records: &[LogRecord],
    older_than_days: i64,
    cutoff: OffsetDateTime,
) -> Result<CompactReport, CompactError> {
    let mut per_issue: HashMap<&str, usize> = HashMap::new();
    for record in records {
        *per_issue.entry(record.id.as_str()).or_default() += 1;
    }
    let states = db::list_issue_states(conn)?;
    let issues = db::list_issues(
        conn,
        &db::IssueRowFilter {
            statuses: vec![Status::Closed],
            include_deleted: true,
            ..db::IssueRowFilter::default()
        },
    )?;

    let mut candidates = Vec::new();
    let mut skipped = Vec::new();
    for issue in issues {
        let old_enough = parse_rfc3339(&issue.updated_at).is_some_and(|at| at < cutoff);
        let log_records = per_issue.get(issue.id.as_str()).copied().unwrap_or(0);
        // A lone compact record has nothing left to fold.
        let already_folded = issue.compacted_at.is_some() && log_records <= 1;
        if !old_enough || already_folded || log_records == 0 {
            continue;
        }

        let open_dependents = open_dependents(conn, &states, &issue.id)?;
        if !open_dependents.is_empty() {
            skipped.push(SkippedIssue {
                id: issue.id,
                open_dependents,
            });
            continue;
        }
        candidates.push(CompactCandidate {
            id: issue.id,
            title: issue.title,
            updated_at: issue.updated_at,
            log_records,
        });
    }

    let reclaimable_records = candidates
        .iter()
        .map(|candidate| candidate.log_records.saturating_sub(1))
        .sum();
    Ok(CompactReport {
        older_than_days,
        cutoff: format_rfc3339(cutoff),
        log_records: records.len(),
        candidates,
        skipped,
        reclaimable_records,
    })
}

fn open_dependents(
    conn: &rusqlite::Connection,
    states: &HashMap<String, IssueState>,
    id: &str,
) -> Result<Vec<String>, CompactError> {
    let mut dependents = db::edges_to(conn, id)?
        .into_iter()
        .filter(|edge| edge.dep_type.is_blocking())
        .filter(|edge| {
            states
                .get(&edge.from)
                .is_some_and(|state| !state.is_resolved())
        })
        .map(|edge| edge.from)
        .collect::<Vec<_>>();
    dependents.sort();
    dependents.dedup();
    Ok(dependents)
}

/// One line: revision count, time span and the status path.
fn history_digest(issue: &Issue, records: &[&LogRecord]) -> String {
    let mut ordered = records.to_vec();
    ordered.sort_by_key(|record| record.rev);

    let mut path: Vec<Status> = Vec::new();
    for record in &ordered {
        if path.last() != Some(&record.issue.status) {
            path.push(record.issue.status);
        }
    }
    if path.last() != Some(&issue.status) {
        path.push(issue.status);
    }
    let path = path
        .iter()
        .map(|status| status.to_string())
        .collect::<Vec<_>>()
        .join(" -> ");

    let previous = issue
        .history_digest
        .as_deref()
        .map(|digest| format!(" [earlier: {digest}]"))
        .unwrap_or_default();
    let reason = issue
        .close_reason
        .as_deref()
        .map(|reason| format!(" ({reason})"))
        .unwrap_or_default();
    format!(
        "{} revisions {}..{}: {}{}{}",
        ordered.len().max(1),
        issue.created_at,
        issue.updated_at,
        path,
        reason,
        previous
    )
}

#[cfg(test)]
mod tests {
    use super::{CompactError, Compactor};
    use crate::codec::{self, LogFile, LogRecord, RecordOp};
    use crate::db;
    use crate::domain::{Dependency, DependencyType, Issue, Status};
    use crate::store::{IssueStore, StoreOptions};
    use crate::sync::SyncEngine;

    fn open_store(dir: &tempfile::TempDir) -> IssueStore {
        IssueStore::open(
            &dir.path().join("cache").join("beads.sqlite"),
            &dir.path().join("locks").join("write.lock"),
            StoreOptions::default(),
        )
        .expect("store should open")
    }

    fn snapshot(id: &str, rev: u64, status: Status, updated_at: &str) -> Issue {
        Issue {
            id: id.to_string(),
            title: format!("Issue {id}"),
            description: None,
            status,
            priority: 2,
            issue_type: "task".to_string(),
            labels: Default::default(),
            assignee: None,
            parent: None,
            created_at: "2025-01-01T00:00:00Z".to_string(),
            updated_at: updated_at.to_string(),
            close_reason: (status == Status::Closed).then(|| "done".to_string()),
            closed_at: (status == Status::Closed).then(|| updated_at.to_string()),
            deleted_at: None,
            revision: rev,
            dependencies: Vec::new(),
            history_digest: None,
            compacted_at: None,
        }
    }

    fn seed(dir: &tempfile::TempDir, issues: &[Issue]) -> (IssueStore, LogFile) {
        let log = LogFile::in_dir(dir.path());
        let lines = issues
            .iter()
            .map(|issue| {
                codec::encode(&LogRecord::new(RecordOp::Update, issue.clone(), None))
                    .expect("encode")
            })
            .collect::<Vec<_>>();
        log.append(&lines).expect("seed log");
        let store = open_store(dir);
        SyncEngine::new(&store, log.clone())
            .reconcile()
            .expect("seed reconcile");
        (store, log)
    }

    #[test]
    fn old_closed_history_folds_into_one_record() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let (store, log) = seed(
            &dir,
            &[
                snapshot("bd-old", 1, Status::Open, "2025-01-01T00:00:00Z"),
                snapshot("bd-old", 2, Status::InProgress, "2025-01-02T00:00:00Z"),
                snapshot("bd-old", 3, Status::Closed, "2025-01-03T00:00:00Z"),
                snapshot("bd-live", 1, Status::Open, "2025-01-01T00:00:00Z"),
            ],
        );
        let compactor = Compactor::new(&store, log.clone());

        let report = compactor.analyze(30).expect("analyze");
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.reclaimable_records, 2);

        let summary = compactor.compact(30).expect("compact");
        assert_eq!(summary.compacted, vec!["bd-old".to_string()]);
        assert_eq!(summary.records_before, 4);
        assert_eq!(summary.records_after, 2);

        let records = log.read().expect("log").records;
        let folded = records
            .iter()
            .find(|record| record.id == "bd-old")
            .expect("compact record");
        assert_eq!(folded.op, RecordOp::Compact);
        assert_eq!(folded.rev, 4);
        let digest = folded.issue.history_digest.as_deref().expect("digest");
        assert!(digest.contains("open -> in_progress -> closed"));
        assert!(digest.contains("(done)"));

        let cached = store.get("bd-old").expect("cached");
        assert_eq!(cached.status, Status::Closed);
        assert!(cached.compacted_at.is_some());
        assert!(!SyncEngine::new(&store, log).needs_import().expect("digest"));

        let again = compactor.analyze(30).expect("analyze");
        assert!(again.candidates.is_empty());
    }

    #[test]
    fn closed_blocker_of_open_issue_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let mut waiting = snapshot("bd-wait", 1, Status::Open, "2025-01-01T00:00:00Z");
        waiting.dependencies.push(Dependency {
            to: "bd-blocker".to_string(),
            dep_type: DependencyType::Blocks,
            created_at: "2025-01-01T00:00:00Z".to_string(),
        });
        let (store, log) = seed(
            &dir,
            &[
                snapshot("bd-blocker", 1, Status::Open, "2025-01-01T00:00:00Z"),
                snapshot("bd-blocker", 2, Status::Closed, "2025-01-02T00:00:00Z"),
                waiting,
            ],
        );

        let report = Compactor::new(&store, log).analyze(30).expect("analyze");
        assert!(report.candidates.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].open_dependents, vec!["bd-wait".to_string()]);
        assert_eq!(db::count_issues(store.conn()).expect("count"), 2);
    }

    #[test]
    fn recent_closures_and_negative_thresholds() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let now = crate::domain::timestamp::now_utc_rfc3339();
        let (store, log) = seed(&dir, &[snapshot("bd-new", 1, Status::Closed, &now)]);
        let compactor = Compactor::new(&store, log);
        assert!(compactor.analyze(30).expect("analyze").candidates.is_empty());
        assert!(matches!(
            compactor.analyze(-1),
            Err(CompactError::InvalidThreshold(-1))
        ));
    }
}

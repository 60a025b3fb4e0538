use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cancel::{CancelToken, Cancelled};
use crate::codec::{self, CodecError, LogRecord, RecordOp};
use crate::config::{Config, IdSettings, QuerySettings};
use crate::db;
use crate::domain::issue::{
    non_empty, normalize_label, DEFAULT_ISSUE_TYPE, DEFAULT_PRIORITY, MAX_PRIORITY,
};
use crate::domain::timestamp::{not_before, now_utc_rfc3339};
use crate::domain::{Dependency, DependencyType, InvalidStatusTransition, Issue, Status};
use crate::id::{child_id, IdError, IdGenerator};
use crate::locks::{FileLock, LockError};

pub mod query;

pub use query::{IssueQuery, SortMode};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),
    #[error("issue not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] InvalidStatusTransition),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Broadcast side effect of a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    #[serde(default)]
    pub seq: u64,
    pub issue_id: String,
    pub revision: u64,
    pub op: RecordOp,
    pub title: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub at: String,
}

impl MutationEvent {
    pub fn from_issue(op: RecordOp, issue: &Issue, actor: Option<&str>) -> Self {
        Self {
            seq: 0,
            issue_id: issue.id.clone(),
            revision: issue.revision,
            op,
            title: issue.title.clone(),
            status: issue.status,
            actor: actor.map(str::to_string),
            at: issue.updated_at.clone(),
        }
    }
}

/// Receives events after their transaction commits. Implementations swallow
/// their own failures; the store never waits on a subscriber.
pub trait MutationSink: Send {
    fn publish(&self, event: &MutationEvent);
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub id: IdSettings,
    pub query: QuerySettings,
    pub actor: Option<String>,
    pub lock_timeout: Duration,
    pub lock_stale_after: Duration,
}

impl StoreOptions {
    pub fn from_config(config: &Config, actor: Option<String>) -> Self {
        Self {
            id: config.id.clone(),
            query: config.query.clone(),
            actor,
            lock_timeout: config.lock.timeout(),
            lock_stale_after: config.lock.stale_after(),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&Config::default(), None)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub issue_type: Option<String>,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub parent: Option<String>,
    pub blocked_by: Vec<String>,
    pub discovered_from: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub issue_type: Option<String>,
    pub status: Option<Status>,
    pub assignee: Option<String>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl IssuePatch {
    pub fn has_changes(&self) -> bool {
        self.title.is_some()
            || self.description.is_some()
            || self.priority.is_some()
            || self.issue_type.is_some()
            || self.status.is_some()
            || self.assignee.is_some()
            || !self.add_labels.is_empty()
            || !self.remove_labels.is_empty()
    }

    fn apply(&self, current: &Issue) -> Result<Issue, StoreError> {
        let mut next = current.clone();
        if let Some(raw) = self.title.as_deref() {
            next.title = validated_title(raw)?;
        }
        if let Some(raw) = self.description.as_deref() {
            next.description = non_empty(raw);
        }
        if let Some(priority) = self.priority {
            next.priority = validated_priority(priority)?;
        }
        if let Some(raw) = self.issue_type.as_deref() {
            next.issue_type = non_empty(raw)
                .ok_or_else(|| StoreError::Validation("type cannot be empty".to_string()))?;
        }
        if let Some(raw) = self.assignee.as_deref() {
            next.assignee = non_empty(raw);
        }
        if let Some(status) = self.status {
            if status == Status::Closed {
                return Err(StoreError::Validation(
                    "use close with a reason to close an issue".to_string(),
                ));
            }
            if status != current.status {
                current.status.validate_transition(status)?;
                next.status = status;
            }
        }
        for label in self.add_labels.iter().map(|raw| normalize_label(raw)) {
            if !label.is_empty() {
                next.labels.insert(label);
            }
        }
        for label in self.remove_labels.iter().map(|raw| normalize_label(raw)) {
            next.labels.remove(&label);
        }
        Ok(next)
    }
}

/// Local query cache plus the single-writer mutation path.
pub struct IssueStore {
    conn: Connection,
    ids: IdGenerator,
    options: StoreOptions,
    lock_path: PathBuf,
    sink: Option<Box<dyn MutationSink>>,
}

impl IssueStore {
    pub fn open(
        db_path: &Path,
        lock_path: &Path,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = db::open_connection(&db_path.display().to_string())?;
        Ok(Self {
            conn,
            ids: IdGenerator::new(&options.id),
            options,
            lock_path: lock_path.to_path_buf(),
            sink: None,
        })
    }

    pub fn set_sink(&mut self, sink: Box<dyn MutationSink>) {
        self.sink = Some(sink);
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn actor(&self) -> Option<&str> {
        self.options.actor.as_deref()
    }

    pub fn query_settings(&self) -> &QuerySettings {
        &self.options.query
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Runs `f` under the working-copy lock inside one immediate transaction.
    /// Any error rolls the whole mutation back; events are published only
    /// after commit.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut StoreWriter<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _guard = FileLock::acquire(
            &self.lock_path,
            self.options.lock_timeout,
            self.options.lock_stale_after,
        )
        .map_err(StoreError::from)?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let mut writer = StoreWriter {
            conn: &tx,
            actor: self.options.actor.as_deref(),
            events: Vec::new(),
        };
        let value = f(&mut writer)?;
        let events = std::mem::take(&mut writer.events);
        drop(writer);
        tx.commit().map_err(StoreError::from)?;

        if let Some(sink) = &self.sink {
            for event in &events {
                sink.publish(event);
            }
        }
        Ok(value)
    }

    pub fn create(&self, input: NewIssue) -> Result<Issue, StoreError> {
        let title = validated_title(&input.title)?;
        let priority = validated_priority(input.priority.unwrap_or(DEFAULT_PRIORITY))?;
        let issue_type = input
            .issue_type
            .as_deref()
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_ISSUE_TYPE.to_string());
        let labels = input
            .labels
            .iter()
            .map(|raw| normalize_label(raw))
            .filter(|label| !label.is_empty())
            .collect::<BTreeSet<_>>();

        self.write(|writer| {
            let now = now_utc_rfc3339();
            let mut dependencies = Vec::new();
            let edge = |to: &str, dep_type| Dependency {
                to: to.to_string(),
                dep_type,
                created_at: now.clone(),
            };

            let parent = match input.parent.as_deref() {
                Some(parent_id) => Some(writer.load_live(parent_id)?.id),
                None => None,
            };
            let id = match parent.as_deref() {
                Some(parent_id) => {
                    dependencies.push(edge(parent_id, DependencyType::ParentChild));
                    writer.allocate_child_id(parent_id)?
                }
                None => {
                    let population = db::count_issues(writer.conn)?;
                    let content = format!("{}|{}|{}", self.ids.prefix(), title, now);
                    self.ids.next_id(population, &content, |candidate| {
                        db::issue_exists(writer.conn, candidate).map_err(StoreError::from)
                    })?
                }
            };

            for blocker in &input.blocked_by {
                let blocker = writer.load_live(blocker)?;
                dependencies.push(edge(&blocker.id, DependencyType::Blocks));
            }
            if let Some(source) = input.discovered_from.as_deref() {
                let source = writer.load(source)?;
                dependencies.push(edge(&source.id, DependencyType::DiscoveredFrom));
            }

            let issue = Issue {
                id,
                title,
                description: input.description.as_deref().and_then(non_empty),
                status: Status::Open,
                priority,
                issue_type,
                labels,
                assignee: input.assignee.as_deref().and_then(non_empty),
                parent,
                created_at: now.clone(),
                updated_at: now.clone(),
                close_reason: None,
                closed_at: None,
                deleted_at: None,
                revision: 0,
                dependencies,
                history_digest: None,
                compacted_at: None,
            };
            writer.commit(RecordOp::Create, issue)
        })
    }

    /// Applies a partial update. A patch that changes nothing leaves the
    /// revision untouched and queues no record.
    pub fn update(&self, id: &str, patch: &IssuePatch) -> Result<Issue, StoreError> {
        if !patch.has_changes() {
            return Err(StoreError::Validation(
                "update requires at least one field change".to_string(),
            ));
        }

        self.write(|writer| {
            let current = writer.load_live(id)?;
            let next = patch.apply(&current)?;
            if next == current {
                debug!(id, "update produced no effective change");
                return Ok(current);
            }
            writer.commit(RecordOp::Update, next)
        })
    }

    pub fn close(&self, id: &str, reason: &str) -> Result<Issue, StoreError> {
        let reason = non_empty(reason)
            .ok_or_else(|| StoreError::Validation("close requires a reason".to_string()))?;

        self.write(|writer| {
            let mut issue = writer.load_live(id)?;
            if issue.is_closed() {
                return Err(StoreError::Validation(format!("issue {id} is already closed")));
            }
            issue.status.validate_transition(Status::Closed)?;
            let now = now_utc_rfc3339();
            issue.status = Status::Closed;
            issue.close_reason = Some(reason);
            issue.closed_at = Some(not_before(&issue.updated_at, now));
            writer.commit(RecordOp::Close, issue)
        })
    }

    /// Tombstones `id` and every `parent-child` descendant. Returns the
    /// issues that were newly tombstoned, root first.
    pub fn delete(&self, id: &str) -> Result<Vec<Issue>, StoreError> {
        self.write(|writer| {
            let root = writer.load(id)?;
            if root.is_deleted() {
                return Err(StoreError::Validation(format!("issue {id} is already deleted")));
            }

            let mut deleted = Vec::new();
            let mut seen = HashSet::from([root.id.clone()]);
            let mut queue = VecDeque::from([root.id.clone()]);
            while let Some(current_id) = queue.pop_front() {
                let mut issue = writer.load(&current_id)?;
                for child in db::child_ids(writer.conn, &current_id)? {
                    if seen.insert(child.clone()) {
                        queue.push_back(child);
                    }
                }
                if issue.is_deleted() {
                    continue;
                }
                issue.deleted_at = Some(not_before(&issue.updated_at, now_utc_rfc3339()));
                deleted.push(writer.commit(RecordOp::Delete, issue)?);
            }
            Ok(deleted)
        })
    }

    pub fn get(&self, id: &str) -> Result<Issue, StoreError> {
        db::get_issue(&self.conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn find(&self, id: &str) -> Result<Option<Issue>, StoreError> {
        Ok(db::get_issue(&self.conn, id)?)
    }

    pub fn query(
        &self,
        query: &IssueQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<Issue>, StoreError> {
        if let Some(priority) = query.priority {
            validated_priority(priority)?;
        }
        cancel.check()?;
        let rows = db::list_issues(&self.conn, &query.row_filter())?;
        Ok(query::apply(rows, query, &self.options.query, cancel)?)
    }

    pub fn all_issues(&self, include_deleted: bool) -> Result<Vec<Issue>, StoreError> {
        let filter = db::IssueRowFilter {
            include_deleted,
            ..db::IssueRowFilter::default()
        };
        Ok(db::list_issues(&self.conn, &filter)?)
    }

    pub fn pending(&self, after_seq: i64) -> Result<Vec<db::PendingRecord>, StoreError> {
        Ok(db::list_pending(&self.conn, after_seq)?)
    }

    pub fn pending_count(&self) -> Result<u64, StoreError> {
        Ok(db::pending_count(&self.conn)?)
    }

    pub fn conflicts(&self) -> Result<Vec<db::ConflictRecord>, StoreError> {
        Ok(db::list_conflicts(&self.conn)?)
    }
}

/// Mutation handle valid for the duration of one write transaction.
pub struct StoreWriter<'a> {
    conn: &'a Connection,
    actor: Option<&'a str>,
    events: Vec<MutationEvent>,
}

impl StoreWriter<'_> {
    pub fn conn(&self) -> &Connection {
        self.conn
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor
    }

    pub fn load(&self, id: &str) -> Result<Issue, StoreError> {
        db::get_issue(self.conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Like `load`, but tombstoned issues are rejected.
    pub fn load_live(&self, id: &str) -> Result<Issue, StoreError> {
        let issue = self.load(id)?;
        if issue.is_deleted() {
            return Err(StoreError::Validation(format!("issue {id} is deleted")));
        }
        Ok(issue)
    }

    fn allocate_child_id(&self, parent_id: &str) -> Result<String, StoreError> {
        loop {
            let number = db::next_child_number(self.conn, parent_id)?;
            let candidate = child_id(parent_id, number);
            if !db::issue_exists(self.conn, &candidate)? {
                return Ok(candidate);
            }
            debug!(candidate = %candidate, "child id already taken, advancing counter");
        }
    }

    /// Stamps a new revision and `updated_at`, then records the snapshot.
    pub fn commit(&mut self, op: RecordOp, mut issue: Issue) -> Result<Issue, StoreError> {
        issue.revision += 1;
        issue.updated_at = not_before(&issue.updated_at, now_utc_rfc3339());
        if issue.revision == 1 {
            issue.created_at = issue.updated_at.clone();
        }
        if let Some(closed_at) = issue.closed_at.as_deref() {
            issue.updated_at = not_before(closed_at, issue.updated_at);
        }
        if let Some(deleted_at) = issue.deleted_at.as_deref() {
            issue.updated_at = not_before(deleted_at, issue.updated_at);
        }
        issue.normalize();
        self.record(op, issue)
    }

    /// Persists `issue` at its current revision and queues its log line.
    pub fn record(&mut self, op: RecordOp, issue: Issue) -> Result<Issue, StoreError> {
        db::upsert_issue(self.conn, &issue)?;
        let line = codec::encode(&LogRecord::new(
            op,
            issue.clone(),
            self.actor.map(str::to_string),
        ))?;
        db::enqueue_pending(self.conn, &issue.id, issue.revision, &line)?;
        db::clear_conflict(self.conn, &issue.id)?;
        self.events
            .push(MutationEvent::from_issue(op, &issue, self.actor));
        Ok(issue)
    }
}

fn validated_title(raw: &str) -> Result<String, StoreError> {
    non_empty(raw).ok_or_else(|| StoreError::Validation("title cannot be empty".to_string()))
}

fn validated_priority(priority: u8) -> Result<u8, StoreError> {
    if priority > MAX_PRIORITY {
        return Err(StoreError::Validation(format!(
            "priority must be between 0 and {MAX_PRIORITY}"
        )));
    }
    Ok(priority)
}

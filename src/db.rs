use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, DatabaseName, OptionalExtension, Result, Row};

use crate::domain::timestamp::now_utc_rfc3339;
use crate::domain::{Dependency, DependencyType, Issue, Status};

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

pub const META_LAST_FLUSH_AT: &str = "last_flush_at";
pub const META_LAST_IMPORT_AT: &str = "last_import_at";
pub const META_LOG_DIGEST: &str = "log_digest";

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: [Migration; 1] = [Migration {
    version: 1,
    name: "baseline_issue_cache_v1",
    sql: r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS issues (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    issue_type TEXT NOT NULL,
    assignee TEXT,
    parent TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    close_reason TEXT,
    closed_at TEXT,
    deleted_at TEXT,
    revision INTEGER NOT NULL,
    history_digest TEXT,
    compacted_at TEXT
);

CREATE TABLE IF NOT EXISTS labels (
    issue_id TEXT NOT NULL,
    label TEXT NOT NULL,
    PRIMARY KEY (issue_id, label)
);

CREATE TABLE IF NOT EXISTS dependencies (
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    dep_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    quarantined INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (from_id, to_id, dep_type)
);

CREATE TABLE IF NOT EXISTS child_counters (
    parent_id TEXT PRIMARY KEY,
    next_child INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_flush (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_id TEXT NOT NULL,
    revision INTEGER NOT NULL,
    line TEXT NOT NULL,
    queued_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_conflicts (
    issue_id TEXT PRIMARY KEY,
    revision INTEGER NOT NULL,
    local_json TEXT NOT NULL,
    remote_json TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    reason TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
CREATE INDEX IF NOT EXISTS idx_issues_parent ON issues(parent);
CREATE INDEX IF NOT EXISTS idx_labels_label ON labels(label);
CREATE INDEX IF NOT EXISTS idx_dependencies_to_type ON dependencies(to_id, dep_type);
CREATE INDEX IF NOT EXISTS idx_pending_flush_issue ON pending_flush(issue_id);
"#,
}];

pub fn open_connection(path: &str) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    configure_for_speed(&conn)?;
    apply_migrations(&mut conn)?;
    Ok(conn)
}

fn configure_for_speed(conn: &Connection) -> Result<()> {
    conn.pragma_update(None::<DatabaseName>, "journal_mode", "WAL")?;
    conn.pragma_update(None::<DatabaseName>, "synchronous", "NORMAL")?;
    conn.pragma_update(None::<DatabaseName>, "temp_store", "MEMORY")?;
    conn.pragma_update(None::<DatabaseName>, "busy_timeout", 5000i64)?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    Ok(())
}

fn apply_migrations(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
"#,
    )?;

    for migration in MIGRATIONS {
        let already_applied: Option<i64> = tx
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                params![migration.version],
                |row| row.get(0),
            )
            .optional()?;

        if already_applied.is_some() {
            continue;
        }

        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, now_utc_rfc3339()],
        )?;
    }

    tx.execute(
        r#"
INSERT INTO meta (key, value)
VALUES ('schema_version', ?1)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#,
        params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;

    tx.commit()
}

const ISSUE_COLUMNS: &str = "id, title, description, status, priority, issue_type, assignee, \
parent, created_at, updated_at, close_reason, closed_at, deleted_at, revision, history_digest, \
compacted_at";

fn conversion_error<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn issue_from_row(row: &Row<'_>) -> Result<Issue> {
    let status: String = row.get(3)?;
    let priority: i64 = row.get(4)?;
    let revision: i64 = row.get(13)?;
    Ok(Issue {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: Status::from_str(&status).map_err(|err| conversion_error(3, err))?,
        priority: u8::try_from(priority).map_err(|err| conversion_error(4, err))?,
        issue_type: row.get(5)?,
        labels: BTreeSet::new(),
        assignee: row.get(6)?,
        parent: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        close_reason: row.get(10)?,
        closed_at: row.get(11)?,
        deleted_at: row.get(12)?,
        revision: u64::try_from(revision).map_err(|err| conversion_error(13, err))?,
        dependencies: Vec::new(),
        history_digest: row.get(14)?,
        compacted_at: row.get(15)?,
    })
}

/// Writes the full snapshot: the issue row, its label set and its outgoing
/// edges. Quarantine flags survive for edges still present in the snapshot.
pub fn upsert_issue(conn: &Connection, issue: &Issue) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO issues (
    id, title, description, status, priority, issue_type, assignee, parent,
    created_at, updated_at, close_reason, closed_at, deleted_at, revision,
    history_digest, compacted_at
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
ON CONFLICT(id) DO UPDATE SET
    title = excluded.title,
    description = excluded.description,
    status = excluded.status,
    priority = excluded.priority,
    issue_type = excluded.issue_type,
    assignee = excluded.assignee,
    parent = excluded.parent,
    created_at = excluded.created_at,
    updated_at = excluded.updated_at,
    close_reason = excluded.close_reason,
    closed_at = excluded.closed_at,
    deleted_at = excluded.deleted_at,
    revision = excluded.revision,
    history_digest = excluded.history_digest,
    compacted_at = excluded.compacted_at
"#,
        params![
            issue.id,
            issue.title,
            issue.description,
            issue.status.as_str(),
            i64::from(issue.priority),
            issue.issue_type,
            issue.assignee,
            issue.parent,
            issue.created_at,
            issue.updated_at,
            issue.close_reason,
            issue.closed_at,
            issue.deleted_at,
            issue.revision as i64,
            issue.history_digest,
            issue.compacted_at,
        ],
    )?;

    conn.execute("DELETE FROM labels WHERE issue_id = ?1", params![issue.id])?;
    let mut insert_label =
        conn.prepare_cached("INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)")?;
    for label in &issue.labels {
        insert_label.execute(params![issue.id, label])?;
    }

    let quarantined = quarantined_edges_from(conn, &issue.id)?;
    conn.execute(
        "DELETE FROM dependencies WHERE from_id = ?1",
        params![issue.id],
    )?;
    let mut insert_edge = conn.prepare_cached(
        r#"
INSERT OR IGNORE INTO dependencies (from_id, to_id, dep_type, created_at, quarantined)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
    )?;
    for dep in &issue.dependencies {
        let flag = quarantined.contains(&(dep.to.clone(), dep.dep_type.as_str().to_string()));
        insert_edge.execute(params![
            issue.id,
            dep.to,
            dep.dep_type.as_str(),
            dep.created_at,
            i64::from(flag)
        ])?;
    }
    Ok(())
}

fn quarantined_edges_from(conn: &Connection, from_id: &str) -> Result<HashSet<(String, String)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT to_id, dep_type FROM dependencies WHERE from_id = ?1 AND quarantined = 1",
    )?;
    let rows = stmt.query_map(params![from_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    rows.collect()
}

pub fn get_issue(conn: &Connection, id: &str) -> Result<Option<Issue>> {
    let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1");
    let Some(mut issue) = conn
        .query_row(&sql, params![id], issue_from_row)
        .optional()?
    else {
        return Ok(None);
    };

    let mut labels = conn.prepare_cached("SELECT label FROM labels WHERE issue_id = ?1")?;
    issue.labels = labels
        .query_map(params![id], |row| row.get(0))?
        .collect::<Result<BTreeSet<String>>>()?;
    issue.dependencies = edges_from(conn, id)?
        .into_iter()
        .map(EdgeRecord::into_dependency)
        .collect();
    issue.normalize();
    Ok(Some(issue))
}

pub fn issue_exists(conn: &Connection, id: &str) -> Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM issues WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

/// Every row ever seen, tombstones included, so id length never shrinks.
pub fn count_issues(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// Direct children by `parent` field or by `parent-child` edge.
pub fn child_ids(conn: &Connection, parent_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        r#"
SELECT id FROM issues WHERE parent = ?1
UNION
SELECT from_id FROM dependencies WHERE to_id = ?1 AND dep_type = 'parent-child'
ORDER BY 1
"#,
    )?;
    let rows = stmt.query_map(params![parent_id], |row| row.get::<_, String>(0))?;
    rows.collect()
}

pub fn delete_issue(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM labels WHERE issue_id = ?1", params![id])?;
    conn.execute("DELETE FROM dependencies WHERE from_id = ?1", params![id])?;
    conn.execute("DELETE FROM issues WHERE id = ?1", params![id])?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueState {
    pub status: Status,
    pub deleted: bool,
}

impl IssueState {
    /// A closed or tombstoned issue no longer blocks anything.
    pub fn is_resolved(self) -> bool {
        self.deleted || self.status.is_terminal()
    }
}

pub fn list_issue_states(conn: &Connection) -> Result<HashMap<String, IssueState>> {
    let mut stmt = conn.prepare("SELECT id, status, deleted_at IS NOT NULL FROM issues")?;
    let rows = stmt.query_map([], |row| {
        let status: String = row.get(1)?;
        Ok((
            row.get::<_, String>(0)?,
            IssueState {
                status: Status::from_str(&status).map_err(|err| conversion_error(1, err))?,
                deleted: row.get(2)?,
            },
        ))
    })?;
    rows.collect()
}

/// Coarse SQL-side filter; date ranges and ordering are applied by the caller.
#[derive(Debug, Clone, Default)]
pub struct IssueRowFilter {
    pub statuses: Vec<Status>,
    pub priority: Option<u8>,
    pub issue_type: Option<String>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
    pub include_deleted: bool,
}

pub fn list_issues(conn: &Connection, filter: &IssueRowFilter) -> Result<Vec<Issue>> {
    let mut clauses = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if !filter.include_deleted {
        clauses.push("deleted_at IS NULL".to_string());
    }
    if !filter.statuses.is_empty() {
        let placeholders = vec!["?"; filter.statuses.len()].join(", ");
        clauses.push(format!("status IN ({placeholders})"));
        values.extend(
            filter
                .statuses
                .iter()
                .map(|status| Value::Text(status.as_str().to_string())),
        );
    }
    if let Some(priority) = filter.priority {
        clauses.push("priority = ?".to_string());
        values.push(Value::Integer(i64::from(priority)));
    }
    if let Some(issue_type) = &filter.issue_type {
        clauses.push("issue_type = ?".to_string());
        values.push(Value::Text(issue_type.clone()));
    }
    if let Some(assignee) = &filter.assignee {
        clauses.push("assignee = ?".to_string());
        values.push(Value::Text(assignee.clone()));
    }
    for label in &filter.labels {
        clauses.push(
            "EXISTS (SELECT 1 FROM labels l WHERE l.issue_id = issues.id AND l.label = ?)"
                .to_string(),
        );
        values.push(Value::Text(label.clone()));
    }

    let mut sql = format!("SELECT {ISSUE_COLUMNS} FROM issues");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let mut issues = stmt
        .query_map(params_from_iter(values.iter()), issue_from_row)?
        .collect::<Result<Vec<_>>>()?;
    attach_relations(conn, &mut issues)?;
    Ok(issues)
}

fn attach_relations(conn: &Connection, issues: &mut [Issue]) -> Result<()> {
    if issues.is_empty() {
        return Ok(());
    }

    let mut labels: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut stmt = conn.prepare("SELECT issue_id, label FROM labels")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        labels
            .entry(row.get::<_, String>(0)?)
            .or_default()
            .insert(row.get::<_, String>(1)?);
    }

    let mut edges: HashMap<String, Vec<Dependency>> = HashMap::new();
    for edge in list_edges(conn)? {
        edges
            .entry(edge.from.clone())
            .or_default()
            .push(edge.into_dependency());
    }

    for issue in issues.iter_mut() {
        issue.labels = labels.remove(&issue.id).unwrap_or_default();
        issue.dependencies = edges.remove(&issue.id).unwrap_or_default();
        issue.normalize();
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRecord {
    pub from: String,
    pub to: String,
    pub dep_type: DependencyType,
    pub created_at: String,
    pub quarantined: bool,
}

impl EdgeRecord {
    pub fn into_dependency(self) -> Dependency {
        Dependency {
            to: self.to,
            dep_type: self.dep_type,
            created_at: self.created_at,
        }
    }
}

fn edge_from_row(row: &Row<'_>) -> Result<EdgeRecord> {
    let dep_type: String = row.get(2)?;
    let quarantined: i64 = row.get(4)?;
    Ok(EdgeRecord {
        from: row.get(0)?,
        to: row.get(1)?,
        dep_type: DependencyType::from_str(&dep_type).map_err(|err| conversion_error(2, err))?,
        created_at: row.get(3)?,
        quarantined: quarantined != 0,
    })
}

const EDGE_COLUMNS: &str = "from_id, to_id, dep_type, created_at, quarantined";

pub fn list_edges(conn: &Connection) -> Result<Vec<EdgeRecord>> {
    let sql = format!("SELECT {EDGE_COLUMNS} FROM dependencies ORDER BY from_id, to_id, dep_type");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], edge_from_row)?;
    rows.collect()
}

pub fn edges_from(conn: &Connection, from_id: &str) -> Result<Vec<EdgeRecord>> {
    let sql = format!(
        "SELECT {EDGE_COLUMNS} FROM dependencies WHERE from_id = ?1 ORDER BY to_id, dep_type"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![from_id], edge_from_row)?;
    rows.collect()
}

pub fn edges_to(conn: &Connection, to_id: &str) -> Result<Vec<EdgeRecord>> {
    let sql = format!(
        "SELECT {EDGE_COLUMNS} FROM dependencies WHERE to_id = ?1 ORDER BY from_id, dep_type"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![to_id], edge_from_row)?;
    rows.collect()
}

pub fn set_edge_quarantined(
    conn: &Connection,
    from_id: &str,
    to_id: &str,
    dep_type: DependencyType,
    quarantined: bool,
) -> Result<()> {
    conn.execute(
        "UPDATE dependencies SET quarantined = ?4 \
         WHERE from_id = ?1 AND to_id = ?2 AND dep_type = ?3",
        params![from_id, to_id, dep_type.as_str(), i64::from(quarantined)],
    )?;
    Ok(())
}

pub fn clear_quarantine(conn: &Connection) -> Result<()> {
    conn.execute("UPDATE dependencies SET quarantined = 0 WHERE quarantined = 1", [])?;
    Ok(())
}

/// Allocates the next dotted suffix for `parent_id`, starting at 1.
pub fn next_child_number(conn: &Connection, parent_id: &str) -> Result<u64> {
    conn.execute(
        r#"
INSERT INTO child_counters (parent_id, next_child)
VALUES (?1, 2)
ON CONFLICT(parent_id) DO UPDATE SET next_child = next_child + 1
"#,
        params![parent_id],
    )?;
    let next: i64 = conn.query_row(
        "SELECT next_child FROM child_counters WHERE parent_id = ?1",
        params![parent_id],
        |row| row.get(0),
    )?;
    Ok((next - 1).max(1) as u64)
}

/// Raises the counter so the next allocation is strictly above `highest_seen`.
pub fn raise_child_counter(conn: &Connection, parent_id: &str, highest_seen: u64) -> Result<()> {
    let next = highest_seen as i64 + 1;
    conn.execute(
        r#"
INSERT INTO child_counters (parent_id, next_child)
VALUES (?1, ?2)
ON CONFLICT(parent_id) DO UPDATE SET next_child = MAX(next_child, excluded.next_child)
"#,
        params![parent_id, next],
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub seq: i64,
    pub issue_id: String,
    pub revision: u64,
    pub line: String,
    pub queued_at: String,
}

pub fn enqueue_pending(
    conn: &Connection,
    issue_id: &str,
    revision: u64,
    line: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO pending_flush (issue_id, revision, line, queued_at) VALUES (?1, ?2, ?3, ?4)",
        params![issue_id, revision as i64, line, now_utc_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_pending(conn: &Connection, after_seq: i64) -> Result<Vec<PendingRecord>> {
    let mut stmt = conn.prepare(
        r#"
SELECT seq, issue_id, revision, line, queued_at
FROM pending_flush
WHERE seq > ?1
ORDER BY seq ASC
"#,
    )?;
    let rows = stmt.query_map(params![after_seq], |row| {
        let revision: i64 = row.get(2)?;
        Ok(PendingRecord {
            seq: row.get(0)?,
            issue_id: row.get(1)?,
            revision: revision.max(0) as u64,
            line: row.get(3)?,
            queued_at: row.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn delete_pending_through(conn: &Connection, seq: i64) -> Result<usize> {
    conn.execute("DELETE FROM pending_flush WHERE seq <= ?1", params![seq])
}

pub fn pending_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_flush", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

pub fn oldest_pending_at(conn: &Connection) -> Result<Option<String>> {
    conn.query_row(
        "SELECT queued_at FROM pending_flush ORDER BY seq ASC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .optional()
}

/// Lowest unflushed revision per issue; the log holds everything below it.
pub fn first_pending_revisions(conn: &Connection) -> Result<HashMap<String, u64>> {
    let mut stmt =
        conn.prepare("SELECT issue_id, MIN(revision) FROM pending_flush GROUP BY issue_id")?;
    let rows = stmt.query_map([], |row| {
        let revision: i64 = row.get(1)?;
        Ok((row.get::<_, String>(0)?, revision.max(0) as u64))
    })?;
    rows.collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub issue_id: String,
    pub revision: u64,
    pub local_json: String,
    pub remote_json: String,
    pub detected_at: String,
    pub reason: String,
}

pub fn upsert_conflict(conn: &Connection, record: &ConflictRecord) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO sync_conflicts (issue_id, revision, local_json, remote_json, detected_at, reason)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(issue_id) DO UPDATE SET
    revision = excluded.revision,
    local_json = excluded.local_json,
    remote_json = excluded.remote_json,
    detected_at = excluded.detected_at,
    reason = excluded.reason
"#,
        params![
            record.issue_id,
            record.revision as i64,
            record.local_json,
            record.remote_json,
            record.detected_at,
            record.reason
        ],
    )?;
    Ok(())
}

pub fn clear_conflict(conn: &Connection, issue_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM sync_conflicts WHERE issue_id = ?1",
        params![issue_id],
    )?;
    Ok(())
}

pub fn list_conflicts(conn: &Connection) -> Result<Vec<ConflictRecord>> {
    let mut stmt = conn.prepare(
        r#"
SELECT issue_id, revision, local_json, remote_json, detected_at, reason
FROM sync_conflicts
ORDER BY issue_id ASC
"#,
    )?;
    let rows = stmt.query_map([], |row| {
        let revision: i64 = row.get(1)?;
        Ok(ConflictRecord {
            issue_id: row.get(0)?,
            revision: revision.max(0) as u64,
            local_json: row.get(2)?,
            remote_json: row.get(3)?,
            detected_at: row.get(4)?,
            reason: row.get(5)?,
        })
    })?;
    rows.collect()
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM meta WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO meta (key, value)
VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#,
        params![key, value],
    )?;
    Ok(())
}

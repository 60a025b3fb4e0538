use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::cancel::CancelToken;
use crate::codec::{CodecError, LogFile};
use crate::db;
use crate::graph::{blocking_adjacency, find_cycles};
use crate::init::{self, ATTRIBUTE_RULES, GITATTRIBUTES_FILE, GITIGNORE_FILE, IGNORE_RULES};
use crate::locks::{self, LockError};
use crate::presence::{check_health, DaemonHealth};
use crate::store::{IssueStore, StoreError};
use crate::sync::{SyncEngine, SyncError};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoctorStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DoctorCheck {
    pub name: String,
    pub status: DoctorStatus,
    pub detail: String,
}

impl DoctorCheck {
    fn new(name: &str, status: DoctorStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fixes: Vec<String>,
}

impl DoctorReport {
    pub fn failure_count(&self) -> usize {
        self.count(DoctorStatus::Fail)
    }

    pub fn warning_count(&self) -> usize {
        self.count(DoctorStatus::Warn)
    }

    pub fn check(&self, name: &str) -> Option<&DoctorCheck> {
        self.checks.iter().find(|check| check.name == name)
    }

    fn count(&self, status: DoctorStatus) -> usize {
        self.checks
            .iter()
            .filter(|check| check.status == status)
            .count()
    }
}

#[derive(Debug, Error)]
pub enum DoctorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl From<rusqlite::Error> for DoctorError {
    fn from(value: rusqlite::Error) -> Self {
        DoctorError::Store(StoreError::Db(value))
    }
}

/// Everything the checks look at.
pub struct DoctorContext<'a> {
    pub beads_dir: &'a Path,
    pub store: &'a IssueStore,
    pub log: LogFile,
    pub lock_stale_after: Duration,
    pub daemon_timeout: Duration,
}

/// Runs every check in order. With `fix`, repairable problems are repaired
/// first and the check reports the state afterwards.
pub fn run_doctor(ctx: &DoctorContext<'_>, fix: bool) -> Result<DoctorReport, DoctorError> {
    let mut fixes = Vec::new();
    let checks = vec![
        check_lock(ctx, fix, &mut fixes)?,
        check_log_integrity(ctx)?,
        check_cache_freshness(ctx, fix, &mut fixes)?,
        check_cycles(ctx)?,
        check_dangling(ctx)?,
        check_conflicts(ctx)?,
        check_pending(ctx, fix, &mut fixes)?,
        check_daemon(ctx, &mut fixes),
        check_git_files(ctx, fix, &mut fixes)?,
    ];
    if !fixes.is_empty() {
        info!(fixes = fixes.len(), "doctor applied fixes");
    }
    Ok(DoctorReport { checks, fixes })
}

fn check_lock(
    ctx: &DoctorContext<'_>,
    fix: bool,
    fixes: &mut Vec<String>,
) -> Result<DoctorCheck, DoctorError> {
    let path = ctx.store.lock_path();
    let Some(age) = locks::lock_age(path) else {
        return Ok(DoctorCheck::new(
            "lock_health",
            DoctorStatus::Pass,
            "write lock is free",
        ));
    };
    let holder = locks::holder_pid(path)
        .map(|pid| format!("pid {pid}"))
        .unwrap_or_else(|| "unknown holder".to_string());

    if age < ctx.lock_stale_after {
        return Ok(DoctorCheck::new(
            "lock_health",
            DoctorStatus::Warn,
            format!("write lock held by {holder} for {}ms", age.as_millis()),
        ));
    }
    if fix {
        locks::remove_lock(path)?;
        fixes.push(format!("removed stale write lock held by {holder}"));
        return Ok(DoctorCheck::new(
            "lock_health",
            DoctorStatus::Pass,
            "stale write lock removed",
        ));
    }
    Ok(DoctorCheck::new(
        "lock_health",
        DoctorStatus::Fail,
        format!(
            "stale write lock held by {holder} for {}s; run `bd doctor --fix`",
            age.as_secs()
        ),
    ))
}

fn check_log_integrity(ctx: &DoctorContext<'_>) -> Result<DoctorCheck, DoctorError> {
    if !ctx.log.exists() {
        return Ok(DoctorCheck::new(
            "log_integrity",
            DoctorStatus::Warn,
            format!("{} does not exist; run `bd init`", ctx.log.path().display()),
        ));
    }
    let contents = ctx.log.read()?;
    if contents.corrupt.is_empty() {
        return Ok(DoctorCheck::new(
            "log_integrity",
            DoctorStatus::Pass,
            format!("{} records parse cleanly", contents.records.len()),
        ));
    }
    let lines = contents
        .corrupt
        .iter()
        .map(|line| format!("line {}: {}", line.line_number, line.reason))
        .collect::<Vec<_>>()
        .join("; ");
    Ok(DoctorCheck::new(
        "log_integrity",
        DoctorStatus::Warn,
        format!("{} corrupt line(s) skipped: {lines}", contents.corrupt.len()),
    ))
}

fn check_cache_freshness(
    ctx: &DoctorContext<'_>,
    fix: bool,
    fixes: &mut Vec<String>,
) -> Result<DoctorCheck, DoctorError> {
    let engine = SyncEngine::new(ctx.store, ctx.log.clone());
    if !engine.needs_import()? {
        return Ok(DoctorCheck::new(
            "cache_freshness",
            DoctorStatus::Pass,
            "cache matches issues.log",
        ));
    }
    if fix {
        let summary = engine.reconcile()?;
        fixes.push(format!(
            "reconciled issues.log ({} imported, {} updated)",
            summary.imported, summary.updated
        ));
        return Ok(DoctorCheck::new(
            "cache_freshness",
            DoctorStatus::Pass,
            "cache reconciled with issues.log",
        ));
    }
    Ok(DoctorCheck::new(
        "cache_freshness",
        DoctorStatus::Warn,
        "issues.log changed since the last import; run `bd sync --import-only`",
    ))
}

fn check_cycles(ctx: &DoctorContext<'_>) -> Result<DoctorCheck, DoctorError> {
    let edges = db::list_edges(ctx.store.conn())?;
    let never = CancelToken::new();
    let active = find_cycles(&blocking_adjacency(&edges, false), &never)
        .map_err(StoreError::from)?;
    if !active.is_empty() {
        let cycles = active
            .iter()
            .map(|cycle| cycle.join(" -> "))
            .collect::<Vec<_>>()
            .join("; ");
        return Ok(DoctorCheck::new(
            "cycles",
            DoctorStatus::Fail,
            format!("active blocks cycle(s): {cycles}; run `bd sync --import-only`"),
        ));
    }

    let quarantined = edges
        .iter()
        .filter(|edge| edge.quarantined)
        .map(|edge| format!("{} -> {}", edge.from, edge.to))
        .collect::<Vec<_>>();
    if quarantined.is_empty() {
        return Ok(DoctorCheck::new(
            "cycles",
            DoctorStatus::Pass,
            "blocks graph is acyclic",
        ));
    }
    Ok(DoctorCheck::new(
        "cycles",
        DoctorStatus::Warn,
        format!(
            "{} quarantined edge(s) close a merged cycle: {}; remove one with `bd dep remove`",
            quarantined.len(),
            quarantined.join(", ")
        ),
    ))
}

fn check_dangling(ctx: &DoctorContext<'_>) -> Result<DoctorCheck, DoctorError> {
    let states = db::list_issue_states(ctx.store.conn())?;
    let mut dangling: HashMap<String, Vec<String>> = HashMap::new();
    for edge in db::list_edges(ctx.store.conn())? {
        if !states.contains_key(&edge.to) {
            dangling.entry(edge.from).or_default().push(edge.to);
        }
    }
    if dangling.is_empty() {
        return Ok(DoctorCheck::new(
            "dangling_dependencies",
            DoctorStatus::Pass,
            "every dependency points at a known issue",
        ));
    }
    let mut entries = dangling
        .into_iter()
        .map(|(from, targets)| format!("{from} -> {}", targets.join(", ")))
        .collect::<Vec<_>>();
    entries.sort();
    Ok(DoctorCheck::new(
        "dangling_dependencies",
        DoctorStatus::Warn,
        format!("dependencies on unknown issues: {}", entries.join("; ")),
    ))
}

fn check_conflicts(ctx: &DoctorContext<'_>) -> Result<DoctorCheck, DoctorError> {
    let conflicts = ctx.store.conflicts()?;
    if conflicts.is_empty() {
        return Ok(DoctorCheck::new(
            "sync_conflicts",
            DoctorStatus::Pass,
            "no unresolved sync conflicts",
        ));
    }
    let detail = conflicts
        .iter()
        .map(|conflict| format!("{} ({})", conflict.issue_id, conflict.reason))
        .collect::<Vec<_>>()
        .join("; ");
    Ok(DoctorCheck::new(
        "sync_conflicts",
        DoctorStatus::Fail,
        format!(
            "{} issue(s) need a manual update to settle: {detail}",
            conflicts.len()
        ),
    ))
}

fn check_pending(
    ctx: &DoctorContext<'_>,
    fix: bool,
    fixes: &mut Vec<String>,
) -> Result<DoctorCheck, DoctorError> {
    let count = ctx.store.pending_count()?;
    if count == 0 {
        return Ok(DoctorCheck::new(
            "pending_flush",
            DoctorStatus::Pass,
            "no unflushed mutations",
        ));
    }
    if fix {
        let summary = SyncEngine::new(ctx.store, ctx.log.clone()).flush()?;
        fixes.push(format!(
            "flushed {} pending record(s) to issues.log",
            summary.records
        ));
        return Ok(DoctorCheck::new(
            "pending_flush",
            DoctorStatus::Pass,
            "pending records flushed",
        ));
    }
    let oldest = db::oldest_pending_at(ctx.store.conn())?.unwrap_or_else(|| "unknown".to_string());
    Ok(DoctorCheck::new(
        "pending_flush",
        DoctorStatus::Warn,
        format!("{count} unflushed record(s), oldest from {oldest}; run `bd sync --flush-only`"),
    ))
}

fn check_daemon(ctx: &DoctorContext<'_>, fixes: &mut Vec<String>) -> DoctorCheck {
    match check_health(ctx.beads_dir, ctx.daemon_timeout) {
        DaemonHealth::Running { report } => DoctorCheck::new(
            "daemon",
            DoctorStatus::Pass,
            format!(
                "presence daemon pid {} at {} (up {}s)",
                report.pid, report.address, report.uptime_secs
            ),
        ),
        DaemonHealth::NotRunning => DoctorCheck::new(
            "daemon",
            DoctorStatus::Pass,
            "presence daemon not running; clients read the store directly",
        ),
        DaemonHealth::Stale { reason } => {
            fixes.push(format!("cleared stale daemon state: {reason}"));
            DoctorCheck::new(
                "daemon",
                DoctorStatus::Warn,
                format!("stale daemon state cleared: {reason}"),
            )
        }
    }
}

fn check_git_files(
    ctx: &DoctorContext<'_>,
    fix: bool,
    fixes: &mut Vec<String>,
) -> Result<DoctorCheck, DoctorError> {
    let mut missing = init::missing_rules(&ctx.beads_dir.join(GITIGNORE_FILE), &IGNORE_RULES)?;
    missing.extend(init::missing_rules(
        &ctx.beads_dir.join(GITATTRIBUTES_FILE),
        &ATTRIBUTE_RULES,
    )?);
    if missing.is_empty() {
        return Ok(DoctorCheck::new(
            "git_files",
            DoctorStatus::Pass,
            "local state is ignored and issues.log merges by union",
        ));
    }
    if fix {
        let added = init::ensure_git_files(ctx.beads_dir)?;
        fixes.push(format!("added git rules: {}", added.join(", ")));
        return Ok(DoctorCheck::new(
            "git_files",
            DoctorStatus::Pass,
            "git ignore and attribute rules written",
        ));
    }
    Ok(DoctorCheck::new(
        "git_files",
        DoctorStatus::Warn,
        format!("missing rules under .beads/: {}", missing.join(", ")),
    ))
}

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::codec::{self, CodecError, LogFile, LOG_FILE};
use crate::compact::{CompactError, CompactReport, CompactSummary, Compactor};
use crate::config::{Config, ConfigError};
use crate::db::{self, EdgeRecord};
use crate::doctor::{run_doctor, DoctorContext, DoctorError, DoctorReport};
use crate::domain::{DependencyType, Issue, Status};
use crate::graph::{BlockedIssue, DependencyGraph, GraphError, TreeDirection, TreeNode};
use crate::init::{self, InitError, InitReport, BEADS_DIR};
use crate::presence::{
    self, DaemonHealth, HealthReport, PresenceClient, PresenceError, PresenceServer, PresenceSink,
    ServerOptions, DAEMON_LOG_FILE,
};
use crate::store::{
    IssuePatch, IssueQuery, IssueStore, MutationEvent, NewIssue, StoreError, StoreOptions,
};
use crate::sync::{GitCli, SyncEngine, SyncError, SyncPlan, SyncReport, SyncStatus};

const CACHE_DB: &str = "cache/beads.sqlite";
const WRITE_LOCK: &str = "locks/write.lock";
const DAEMON_START_WAIT: Duration = Duration::from_secs(3);

/// Where everything for one working copy lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeadsPaths {
    pub repo_root: PathBuf,
    pub beads_dir: PathBuf,
    pub log: PathBuf,
    pub db: PathBuf,
    pub lock: PathBuf,
}

impl BeadsPaths {
    /// `db` overrides the cache location; relative paths resolve against
    /// `repo_root`.
    pub fn new(repo_root: impl Into<PathBuf>, db: Option<&Path>) -> Self {
        let repo_root = repo_root.into();
        let beads_dir = repo_root.join(BEADS_DIR);
        let db = match db {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => repo_root.join(path),
            None => beads_dir.join(CACHE_DB),
        };
        Self {
            log: beads_dir.join(LOG_FILE),
            lock: beads_dir.join(WRITE_LOCK),
            repo_root,
            beads_dir,
            db,
        }
    }

    /// Walks up from `start` to the nearest directory holding `.beads/`,
    /// falling back to `start` itself.
    pub fn discover(start: &Path, db: Option<&Path>) -> Self {
        let root = start
            .ancestors()
            .find(|dir| dir.join(BEADS_DIR).is_dir())
            .unwrap_or(start);
        Self::new(root, db)
    }

    pub fn is_initialized(&self) -> bool {
        self.beads_dir.is_dir()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonMode {
    /// Never talk to the daemon.
    Off,
    /// Use a daemon that is already running.
    Connect,
    /// Start one when none answers, if the config allows it.
    AutoStart,
}

#[derive(Debug, Clone)]
pub struct AppOptions {
    pub actor: Option<String>,
    pub daemon: DaemonMode,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            actor: None,
            daemon: DaemonMode::Off,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssueDetail {
    #[serde(flatten)]
    pub issue: Issue,
    pub dependents: Vec<String>,
    pub open_blockers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EdgeView {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
    pub quarantined: bool,
}

impl From<EdgeRecord> for EdgeView {
    fn from(value: EdgeRecord) -> Self {
        Self {
            from: value.from,
            to: value.to,
            dep_type: value.dep_type,
            quarantined: value.quarantined,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycles: Vec<Vec<String>>,
    pub quarantined: Vec<EdgeView>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Daemon,
    PendingQueue,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventsView {
    pub source: EventSource,
    pub events: Vec<MutationEvent>,
    pub next_seq: u64,
    pub truncated: bool,
}

pub struct App {
    paths: BeadsPaths,
    config: Config,
    store: IssueStore,
    daemon: Option<PresenceClient>,
}

impl App {
    pub fn init(paths: &BeadsPaths, prefix: Option<&str>) -> Result<InitReport, AppError> {
        Ok(init::init_beads_dir(&paths.beads_dir, prefix)?)
    }

    /// Opens the cache, re-importing `issues.log` when it moved since the
    /// last import, and wires the presence daemon per `options`.
    pub fn open(paths: BeadsPaths, options: AppOptions) -> Result<Self, AppError> {
        if !paths.is_initialized() {
            return Err(AppError::Validation(format!(
                "no {} directory under {}; run `bd init` first",
                BEADS_DIR,
                paths.repo_root.display()
            )));
        }
        let config = Config::load(&paths.beads_dir)?;
        let mut store = IssueStore::open(
            &paths.db,
            &paths.lock,
            StoreOptions::from_config(&config, options.actor.clone()),
        )?;

        if config.sync.auto_import {
            let engine = SyncEngine::new(&store, LogFile::new(&paths.log));
            if let Some(summary) = engine.auto_import()? {
                if !summary.conflicts.is_empty() {
                    warn!(
                        ids = ?summary.conflict_ids(),
                        "issues.log holds conflicting edits; see `bd doctor`"
                    );
                }
            }
        }

        let daemon = connect_daemon(&paths, &config, options.daemon);
        if let Some(client) = &daemon {
            store.set_sink(Box::new(PresenceSink::new(client.clone())));
        }
        Ok(Self {
            paths,
            config,
            store,
            daemon,
        })
    }

    pub fn paths(&self) -> &BeadsPaths {
        &self.paths
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &IssueStore {
        &self.store
    }

    pub fn has_daemon(&self) -> bool {
        self.daemon.is_some()
    }

    fn log(&self) -> LogFile {
        LogFile::new(&self.paths.log)
    }

    fn engine(&self) -> SyncEngine<'_> {
        SyncEngine::new(&self.store, self.log())
    }

    fn graph(&self) -> DependencyGraph<'_> {
        DependencyGraph::new(&self.store)
    }

    /// Without a daemon nothing debounces for us, so mutations reach the log
    /// before the command exits.
    fn after_mutation(&self) -> Result<(), AppError> {
        if self.daemon.is_none() {
            self.engine().flush()?;
        }
        Ok(())
    }

    pub fn create(&self, input: NewIssue) -> Result<Issue, AppError> {
        let issue = self.store.create(input)?;
        self.after_mutation()?;
        Ok(issue)
    }

    pub fn update(&self, id: &str, patch: &IssuePatch) -> Result<Issue, AppError> {
        if patch.status == Some(Status::Closed) {
            return Err(AppError::Validation(
                "closing needs a reason; use `bd close <id> --reason ...`".to_string(),
            ));
        }
        let issue = self.store.update(id, patch)?;
        self.after_mutation()?;
        Ok(issue)
    }

    pub fn close(&self, id: &str, reason: &str) -> Result<Issue, AppError> {
        let issue = self.store.close(id, reason)?;
        self.after_mutation()?;
        Ok(issue)
    }

    pub fn delete(&self, id: &str) -> Result<Vec<Issue>, AppError> {
        let deleted = self.store.delete(id)?;
        self.after_mutation()?;
        Ok(deleted)
    }

    pub fn show(&self, id: &str) -> Result<IssueDetail, AppError> {
        let issue = self.store.get(id)?;
        let conn = self.store.conn();
        let states = db::list_issue_states(conn)?;
        let dependents = db::edges_to(conn, &issue.id)?
            .into_iter()
            .map(|edge| edge.from)
            .collect();
        let open_blockers = db::edges_from(conn, &issue.id)?
            .into_iter()
            .filter(|edge| edge.dep_type.is_blocking() && !edge.quarantined)
            .filter(|edge| states.get(&edge.to).is_some_and(|state| !state.is_resolved()))
            .map(|edge| edge.to)
            .collect();
        let conflict = self
            .store
            .conflicts()?
            .into_iter()
            .find(|conflict| conflict.issue_id == issue.id)
            .map(|conflict| conflict.reason);
        Ok(IssueDetail {
            issue,
            dependents,
            open_blockers,
            conflict,
        })
    }

    pub fn list(&self, query: &IssueQuery, cancel: &CancelToken) -> Result<Vec<Issue>, AppError> {
        Ok(self.store.query(query, cancel)?)
    }

    pub fn ready(&self, query: &IssueQuery, cancel: &CancelToken) -> Result<Vec<Issue>, AppError> {
        Ok(self.graph().ready(query, cancel)?)
    }

    pub fn blocked(
        &self,
        query: &IssueQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<BlockedIssue>, AppError> {
        Ok(self.graph().blocked(query, cancel)?)
    }

    pub fn add_dependency(
        &self,
        from: &str,
        to: &str,
        dep_type: DependencyType,
    ) -> Result<Issue, AppError> {
        let issue = self.graph().add_dependency(from, to, dep_type)?;
        self.after_mutation()?;
        Ok(issue)
    }

    pub fn remove_dependency(
        &self,
        from: &str,
        to: &str,
        dep_type: Option<DependencyType>,
    ) -> Result<Issue, AppError> {
        let issue = self.graph().remove_dependency(from, to, dep_type)?;
        self.after_mutation()?;
        Ok(issue)
    }

    pub fn dependency_tree(
        &self,
        id: &str,
        max_depth: usize,
        direction: TreeDirection,
    ) -> Result<TreeNode, AppError> {
        Ok(self.graph().tree(id, max_depth, direction)?)
    }

    pub fn cycles(&self, cancel: &CancelToken) -> Result<CycleReport, AppError> {
        let graph = self.graph();
        Ok(CycleReport {
            cycles: graph.cycles(cancel)?,
            quarantined: graph
                .quarantined()?
                .into_iter()
                .map(EdgeView::from)
                .collect(),
        })
    }

    /// Runs `plan`. When the working copy is not inside git and no git step
    /// was asked for explicitly, the git stages are skipped.
    pub fn sync(&self, mut plan: SyncPlan, explicit_git: bool) -> Result<SyncReport, AppError> {
        let wants_git = plan.commit || plan.pull || plan.push;
        let git = match GitCli::discover(&self.paths.repo_root) {
            Some(git) => git,
            None if wants_git && explicit_git => {
                return Err(AppError::Validation(format!(
                    "{} is not inside a git work tree",
                    self.paths.repo_root.display()
                )));
            }
            None => {
                if wants_git {
                    warn!("not inside a git work tree; syncing the local log only");
                }
                plan.commit = false;
                plan.pull = false;
                plan.push = false;
                GitCli::new(&self.paths.repo_root)
            }
        };
        Ok(self.engine().run(&plan, &git)?)
    }

    pub fn sync_status(&self) -> Result<SyncStatus, AppError> {
        Ok(self.engine().status()?)
    }

    pub fn compact_analyze(&self, older_than_days: Option<i64>) -> Result<CompactReport, AppError> {
        let days = older_than_days.unwrap_or(self.config.compaction.older_than_days);
        Ok(Compactor::new(&self.store, self.log()).analyze(days)?)
    }

    pub fn compact(&self, older_than_days: Option<i64>) -> Result<CompactSummary, AppError> {
        let days = older_than_days.unwrap_or(self.config.compaction.older_than_days);
        Ok(Compactor::new(&self.store, self.log()).compact(days)?)
    }

    pub fn doctor(&self, fix: bool) -> Result<DoctorReport, AppError> {
        let ctx = DoctorContext {
            beads_dir: &self.paths.beads_dir,
            store: &self.store,
            log: self.log(),
            lock_stale_after: self.config.lock.stale_after(),
            daemon_timeout: self.config.daemon.timeout(),
        };
        Ok(run_doctor(&ctx, fix)?)
    }

    /// Mutation events after `since`. Falls back to the unflushed queue,
    /// numbered by queue position, when no daemon answers.
    pub fn events(&self, since: u64, limit: usize) -> Result<EventsView, AppError> {
        if let Some(client) = &self.daemon {
            match client.poll(since, limit) {
                Ok(batch) => {
                    return Ok(EventsView {
                        source: EventSource::Daemon,
                        events: batch.events,
                        next_seq: batch.next_seq,
                        truncated: batch.truncated,
                    })
                }
                Err(err) => debug!(error = %err, "daemon poll failed; reading pending queue"),
            }
        }

        let after = i64::try_from(since).unwrap_or(i64::MAX);
        let mut events = Vec::new();
        let mut next_seq = since;
        for pending in self.store.pending(after)? {
            let seq = u64::try_from(pending.seq).unwrap_or_default();
            next_seq = next_seq.max(seq);
            if events.len() >= limit.max(1) {
                continue;
            }
            match codec::decode(&pending.line) {
                Ok(record) => {
                    let mut event = MutationEvent::from_issue(
                        record.op,
                        &record.issue,
                        record.agent.as_deref(),
                    );
                    event.seq = seq;
                    events.push(event);
                }
                Err(err) => warn!(seq, error = %err, "skipping undecodable pending record"),
            }
        }
        Ok(EventsView {
            source: EventSource::PendingQueue,
            events,
            next_seq,
            truncated: false,
        })
    }
}

fn connect_daemon(paths: &BeadsPaths, config: &Config, mode: DaemonMode) -> Option<PresenceClient> {
    if mode == DaemonMode::Off || !config.daemon.enabled {
        return None;
    }
    let timeout = config.daemon.timeout();
    if mode == DaemonMode::AutoStart && config.daemon.auto_start {
        let started = daemon_command(paths)
            .map_err(PresenceError::from)
            .and_then(|command| {
                presence::ensure_running(&paths.beads_dir, command, timeout, DAEMON_START_WAIT)
            });
        return match started {
            Ok(report) => match report.address.parse() {
                Ok(address) => Some(PresenceClient::new(address, timeout)),
                Err(err) => {
                    debug!(error = %err, "daemon reported an unusable address");
                    None
                }
            },
            Err(err) => {
                debug!(error = %err, "presence daemon unavailable; using the store directly");
                None
            }
        };
    }
    if !presence::check_health(&paths.beads_dir, timeout).is_running() {
        return None;
    }
    match PresenceClient::discover(&paths.beads_dir, timeout) {
        Ok(client) => Some(client),
        Err(err) => {
            debug!(error = %err, "presence daemon unavailable; using the store directly");
            None
        }
    }
}

/// `bd -C <root> [--db <path>] daemon run`, using this executable.
fn daemon_command(paths: &BeadsPaths) -> std::io::Result<Command> {
    let mut command = Command::new(std::env::current_exe()?);
    command.arg("-C").arg(&paths.repo_root);
    if paths.db != BeadsPaths::new(&paths.repo_root, None).db {
        command.arg("--db").arg(&paths.db);
    }
    command.args(["--no-daemon", "daemon", "run"]);
    Ok(command)
}

/// Serves the presence channel in the foreground until stopped or idle.
/// Debounced flushes go through a store connection owned by the server.
pub fn run_daemon(paths: &BeadsPaths, actor: Option<String>) -> Result<(), AppError> {
    let config = Config::load(&paths.beads_dir)?;
    let store = IssueStore::open(
        &paths.db,
        &paths.lock,
        StoreOptions::from_config(&config, actor),
    )?;
    let log = LogFile::new(&paths.log);
    let server = PresenceServer::bind(&paths.beads_dir, ServerOptions::from_config(&config))?
        .with_flusher(Box::new(move || {
            SyncEngine::new(&store, log.clone())
                .flush()
                .map(|summary| summary.records)
                .map_err(|err| err.to_string())
        }));
    info!(address = %server.local_addr(), "starting presence daemon");
    server.run()?;
    Ok(())
}

pub fn start_daemon(paths: &BeadsPaths) -> Result<HealthReport, AppError> {
    let config = Config::load(&paths.beads_dir)?;
    let command = daemon_command(paths)?;
    presence::ensure_running(
        &paths.beads_dir,
        command,
        config.daemon.timeout(),
        DAEMON_START_WAIT,
    )
    .map_err(|err| AppError::DaemonUnavailable(err.to_string()))
}

pub fn daemon_status(paths: &BeadsPaths) -> Result<HealthReport, AppError> {
    let config = Config::load(&paths.beads_dir)?;
    match presence::check_health(&paths.beads_dir, config.daemon.timeout()) {
        DaemonHealth::Running { report } => Ok(report),
        DaemonHealth::NotRunning => Err(AppError::DaemonUnavailable(
            "presence daemon is not running".to_string(),
        )),
        DaemonHealth::Stale { reason } => Err(AppError::DaemonUnavailable(format!(
            "stale daemon state cleared: {reason}"
        ))),
    }
}

pub fn stop_daemon(paths: &BeadsPaths) -> Result<HealthReport, AppError> {
    let report = daemon_status(paths)?;
    let config = Config::load(&paths.beads_dir)?;
    PresenceClient::discover(&paths.beads_dir, config.daemon.timeout())
        .and_then(|client| client.shutdown())
        .map_err(|err| AppError::DaemonUnavailable(err.to_string()))?;
    Ok(report)
}

pub fn daemon_log_path(paths: &BeadsPaths) -> PathBuf {
    paths.beads_dir.join(DAEMON_LOG_FILE)
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Compact(#[from] CompactError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Doctor(#[from] DoctorError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl AppError {
    /// 1 general/validation, 2 not found, 3 cycle, 4 sync conflict,
    /// 5 daemon unavailable.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Store(err) => store_exit_code(err),
            AppError::Graph(err) => graph_exit_code(err),
            AppError::Sync(err) => sync_exit_code(err),
            AppError::Compact(CompactError::Store(err)) => store_exit_code(err),
            AppError::Compact(CompactError::Sync(err)) => sync_exit_code(err),
            AppError::Doctor(DoctorError::Store(err)) => store_exit_code(err),
            AppError::Presence(PresenceError::AlreadyRunning(_)) => 1,
            AppError::DaemonUnavailable(_) | AppError::Presence(_) => 5,
            _ => 1,
        }
    }
}

fn store_exit_code(err: &StoreError) -> i32 {
    match err {
        StoreError::NotFound(_) => 2,
        _ => 1,
    }
}

fn graph_exit_code(err: &GraphError) -> i32 {
    match err {
        GraphError::CycleDetected { .. } => 3,
        GraphError::Store(err) => store_exit_code(err),
    }
}

fn sync_exit_code(err: &SyncError) -> i32 {
    match err {
        SyncError::Conflicts { .. } => 4,
        SyncError::Store(err) => store_exit_code(err),
        SyncError::Graph(err) => graph_exit_code(err),
        _ => 1,
    }
}

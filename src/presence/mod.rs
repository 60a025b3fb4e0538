//! Advisory side channel between `bd` processes sharing a working copy.
//! Nothing here is authoritative: every caller must work the same way when
//! the daemon is gone.

use std::fs::OpenOptions;
use std::io::BufReader;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{MutationEvent, MutationSink};

pub mod pid_file;
pub mod protocol;
mod server;

pub use pid_file::{DaemonInfo, DaemonPidFile, PID_FILE};
pub use protocol::{HealthReport, Request, Response, PROTOCOL_VERSION};
pub use server::{Flusher, PresenceServer, ServerOptions, ShutdownHandle};

pub const DAEMON_LOG_FILE: &str = "daemon.log";

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence daemon unavailable: {0}")]
    Unavailable(String),
    #[error("presence daemon already running at {0}")]
    AlreadyRunning(String),
    #[error("presence I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed presence message: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("presence daemon error: {0}")]
    Remote(String),
    #[error("unexpected presence response: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventBatch {
    pub events: Vec<MutationEvent>,
    pub next_seq: u64,
    pub truncated: bool,
}

/// Short-lived connection per request; every call is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct PresenceClient {
    address: SocketAddr,
    timeout: Duration,
}

impl PresenceClient {
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self { address, timeout }
    }

    /// Locates the daemon through `.beads/daemon.pid`.
    pub fn discover(beads_dir: &Path, timeout: Duration) -> Result<Self, PresenceError> {
        let info = DaemonPidFile::new(beads_dir)
            .read()?
            .ok_or_else(|| PresenceError::Unavailable("no daemon.pid".to_string()))?;
        if info.version != PROTOCOL_VERSION {
            return Err(PresenceError::Unavailable(format!(
                "daemon speaks protocol v{}, expected v{}",
                info.version, PROTOCOL_VERSION
            )));
        }
        Ok(Self::new(info.address()?, timeout))
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn request(&self, request: &Request) -> Result<Response, PresenceError> {
        let stream = TcpStream::connect_timeout(&self.address, self.timeout)
            .map_err(|err| PresenceError::Unavailable(err.to_string()))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        protocol::write_message(&mut &stream, request)?;
        let mut reader = BufReader::new(&stream);
        match protocol::read_message::<_, Response>(&mut reader)? {
            Some(Response::Error { message }) => Err(PresenceError::Remote(message)),
            Some(response) => Ok(response),
            None => Err(PresenceError::Unavailable(
                "daemon closed the connection".to_string(),
            )),
        }
    }

    pub fn ping(&self) -> Result<u32, PresenceError> {
        match self.request(&Request::Ping)? {
            Response::Pong { version, .. } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub fn publish(&self, event: &MutationEvent) -> Result<u64, PresenceError> {
        match self.request(&Request::Publish {
            event: event.clone(),
        })? {
            Response::Published { seq } => Ok(seq),
            other => Err(unexpected(other)),
        }
    }

    pub fn poll(&self, since: u64, limit: usize) -> Result<EventBatch, PresenceError> {
        match self.request(&Request::Poll { since, limit })? {
            Response::Events {
                events,
                next_seq,
                truncated,
            } => Ok(EventBatch {
                events,
                next_seq,
                truncated,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub fn health(&self) -> Result<HealthReport, PresenceError> {
        match self.request(&Request::Health)? {
            Response::Health(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub fn shutdown(&self) -> Result<(), PresenceError> {
        match self.request(&Request::Shutdown)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> PresenceError {
    PresenceError::Unexpected(serde_json::to_string(&response).unwrap_or_default())
}

/// Store sink that forwards committed mutations to the daemon. Failures are
/// logged at debug level and otherwise ignored.
pub struct PresenceSink {
    client: PresenceClient,
}

impl PresenceSink {
    pub fn new(client: PresenceClient) -> Self {
        Self { client }
    }
}

impl MutationSink for PresenceSink {
    fn publish(&self, event: &MutationEvent) {
        if let Err(err) = self.client.publish(event) {
            debug!(
                error = %err,
                issue = %event.issue_id,
                "presence daemon unavailable; event not broadcast"
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DaemonHealth {
    Running { report: HealthReport },
    NotRunning,
    Stale { reason: String },
}

impl DaemonHealth {
    pub fn is_running(&self) -> bool {
        matches!(self, DaemonHealth::Running { .. })
    }
}

fn clear_stale(pid_file: &DaemonPidFile, reason: &str) {
    warn!(path = %pid_file.path().display(), reason, "removing stale daemon state");
    if let Err(err) = pid_file.delete() {
        debug!(error = %err, "could not remove daemon pid file");
    }
}

/// Probes the daemon named by the pid file. Dead or mismatched daemons are
/// asked to stop and their pid file is removed so the next client can start
/// a fresh one.
pub fn check_health(beads_dir: &Path, timeout: Duration) -> DaemonHealth {
    let pid_file = DaemonPidFile::new(beads_dir);
    let info = match pid_file.read() {
        Ok(Some(info)) => info,
        Ok(None) => return DaemonHealth::NotRunning,
        Err(err) => {
            let reason = format!("unreadable pid file: {err}");
            clear_stale(&pid_file, &reason);
            return DaemonHealth::Stale { reason };
        }
    };
    let address = match info.address() {
        Ok(address) => address,
        Err(err) => {
            let reason = format!("invalid daemon address: {err}");
            clear_stale(&pid_file, &reason);
            return DaemonHealth::Stale { reason };
        }
    };

    let client = PresenceClient::new(address, timeout);
    match client.health() {
        Ok(report) if report.version == PROTOCOL_VERSION && info.version == PROTOCOL_VERSION => {
            DaemonHealth::Running { report }
        }
        Ok(report) => {
            let _ = client.shutdown();
            let reason = format!(
                "daemon pid {} speaks protocol v{}, expected v{}",
                report.pid, report.version, PROTOCOL_VERSION
            );
            clear_stale(&pid_file, &reason);
            DaemonHealth::Stale { reason }
        }
        Err(err) => {
            let reason = format!("daemon pid {} not answering: {err}", info.pid);
            clear_stale(&pid_file, &reason);
            DaemonHealth::Stale { reason }
        }
    }
}

/// Starts `command` detached with output appended to `log_path`.
pub fn spawn_detached(mut command: Command, log_path: &Path) -> Result<u32, PresenceError> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(log_path)?;
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .spawn()?;
    Ok(child.id())
}

/// Returns the running daemon's health, starting it with `command` first
/// when needed and waiting up to `wait` for it to answer.
pub fn ensure_running(
    beads_dir: &Path,
    command: Command,
    timeout: Duration,
    wait: Duration,
) -> Result<HealthReport, PresenceError> {
    if let DaemonHealth::Running { report } = check_health(beads_dir, timeout) {
        return Ok(report);
    }

    let pid = spawn_detached(command, &beads_dir.join(DAEMON_LOG_FILE))?;
    debug!(pid, "spawned presence daemon");
    let deadline = Instant::now() + wait;
    loop {
        if let DaemonHealth::Running { report } = check_health(beads_dir, timeout) {
            return Ok(report);
        }
        if Instant::now() >= deadline {
            return Err(PresenceError::Unavailable(format!(
                "daemon pid {pid} did not come up within {}ms",
                wait.as_millis()
            )));
        }
        thread::sleep(Duration::from_millis(25));
    }
}

use std::collections::VecDeque;
use std::io::{BufReader, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::pid_file::{DaemonInfo, DaemonPidFile};
use super::protocol::{
    read_message, write_message, HealthReport, Request, Response, PROTOCOL_VERSION,
};
use super::PresenceError;
use crate::config::Config;
use crate::store::MutationEvent;
use crate::sync::Debouncer;

const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Flushes pending records to the log and returns how many were written.
pub type Flusher = Box<dyn FnMut() -> Result<usize, String> + Send>;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub idle_shutdown: Duration,
    pub event_buffer: usize,
    pub debounce: Duration,
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl ServerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_shutdown: config.daemon.idle_shutdown(),
            event_buffer: config.daemon.event_buffer,
            debounce: config.sync.debounce(),
            max_wait: config.sync.max_wait(),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// Bounded, sequence-numbered event history.
#[derive(Debug)]
struct EventRing {
    events: VecDeque<MutationEvent>,
    capacity: usize,
    last_seq: u64,
}

impl EventRing {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(4_096)),
            capacity: capacity.max(1),
            last_seq: 0,
        }
    }

    fn push(&mut self, mut event: MutationEvent) -> u64 {
        self.last_seq += 1;
        event.seq = self.last_seq;
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.last_seq
    }

    fn since(&self, since: u64, limit: usize) -> (Vec<MutationEvent>, bool) {
        let truncated = self
            .events
            .front()
            .is_some_and(|oldest| oldest.seq > since + 1);
        let events = self
            .events
            .iter()
            .filter(|event| event.seq > since)
            .take(limit.max(1))
            .cloned()
            .collect();
        (events, truncated)
    }
}

#[derive(Debug)]
struct State {
    ring: EventRing,
    debouncer: Debouncer,
    last_activity: Instant,
    shutdown: bool,
    flushes: u64,
    last_flush_error: Option<String>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    started: Instant,
    address: SocketAddr,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lets tests and signal handlers stop a running server.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.shared.lock().shutdown = true;
    }
}

pub struct PresenceServer {
    listener: TcpListener,
    pid_file: DaemonPidFile,
    shared: Arc<Shared>,
    options: ServerOptions,
    flusher: Option<Flusher>,
}

impl PresenceServer {
    /// Binds an ephemeral loopback port. Fails when a live daemon already
    /// owns this working copy.
    pub fn bind(beads_dir: &Path, options: ServerOptions) -> Result<Self, PresenceError> {
        let pid_file = DaemonPidFile::new(beads_dir);
        if let super::DaemonHealth::Running { report } =
            super::check_health(beads_dir, Duration::from_millis(250))
        {
            return Err(PresenceError::AlreadyRunning(report.address));
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;
        let now = Instant::now();
        let state = State {
            ring: EventRing::new(options.event_buffer),
            debouncer: Debouncer::new(options.debounce, options.max_wait),
            last_activity: now,
            shutdown: false,
            flushes: 0,
            last_flush_error: None,
        };
        Ok(Self {
            listener,
            pid_file,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                started: now,
                address,
            }),
            options,
            flusher: None,
        })
    }

    pub fn with_flusher(mut self, flusher: Flusher) -> Self {
        self.flusher = Some(flusher);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.address
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Serves until shutdown is requested or the daemon sits idle for
    /// `idle_shutdown`. Pending debounced flushes run before exit.
    pub fn run(mut self) -> Result<(), PresenceError> {
        let info = DaemonInfo {
            pid: std::process::id(),
            port: self.shared.address.port(),
            host: self.shared.address.ip().to_string(),
            version: PROTOCOL_VERSION,
        };
        self.pid_file.write(&info)?;
        info!(address = %self.shared.address, pid = info.pid, "presence daemon listening");

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&self.shared);
                    thread::spawn(move || {
                        if let Err(err) = serve_connection(stream, &shared) {
                            debug!(
                                peer = %peer,
                                error = %err,
                                "presence connection ended with error"
                            );
                        }
                    });
                    continue;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => warn!(error = %err, "presence accept failed"),
            }

            let now = Instant::now();
            let (stop, flush_due) = {
                let mut state = self.shared.lock();
                let idle_for = now.saturating_duration_since(state.last_activity);
                let idle = !self.options.idle_shutdown.is_zero()
                    && idle_for >= self.options.idle_shutdown;
                if idle {
                    info!("presence daemon idle; shutting down");
                }
                let due = state.debouncer.due(now);
                if due {
                    state.debouncer.reset();
                }
                (state.shutdown || idle, due)
            };
            if flush_due {
                self.flush();
            }
            if stop {
                break;
            }
            thread::sleep(self.options.poll_interval);
        }

        let pending = !self.shared.lock().debouncer.is_idle();
        if pending {
            self.flush();
        }
        if self.pid_file.read().ok().flatten().as_ref() == Some(&info) {
            self.pid_file.delete()?;
        }
        info!("presence daemon stopped");
        Ok(())
    }

    fn flush(&mut self) {
        let Some(flusher) = self.flusher.as_mut() else {
            return;
        };
        let result = flusher();
        let mut state = self.shared.lock();
        match result {
            Ok(records) => {
                state.flushes += 1;
                state.last_flush_error = None;
                debug!(records, "debounced flush complete");
            }
            Err(message) => {
                warn!(error = %message, "debounced flush failed");
                state.last_flush_error = Some(message);
            }
        }
    }
}

fn serve_connection(stream: TcpStream, shared: &Shared) -> Result<(), PresenceError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    while let Some(request) = read_message::<_, Request>(&mut reader)? {
        let stop = request == Request::Shutdown;
        let response = dispatch(shared, request);
        write_message(&mut writer, &response)?;
        if stop {
            break;
        }
    }
    Ok(())
}

fn dispatch(shared: &Shared, request: Request) -> Response {
    let now = Instant::now();
    let mut state = shared.lock();
    state.last_activity = now;
    match request {
        Request::Ping => Response::Pong {
            version: PROTOCOL_VERSION,
            pid: std::process::id(),
        },
        Request::Publish { event } => {
            let seq = state.ring.push(event);
            state.debouncer.note(now);
            Response::Published { seq }
        }
        Request::Poll { since, limit } => {
            let (events, truncated) = state.ring.since(since, limit);
            Response::Events {
                events,
                next_seq: state.ring.last_seq,
                truncated,
            }
        }
        Request::Health => Response::Health(HealthReport {
            version: PROTOCOL_VERSION,
            pid: std::process::id(),
            address: shared.address.to_string(),
            uptime_secs: shared.started.elapsed().as_secs(),
            buffered_events: state.ring.events.len(),
            last_seq: state.ring.last_seq,
            flushes: state.flushes,
            last_flush_error: state.last_flush_error.clone(),
        }),
        Request::Shutdown => {
            state.shutdown = true;
            Response::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EventRing;
    use crate::codec::RecordOp;
    use crate::domain::Status;
    use crate::store::MutationEvent;

    fn event(id: &str) -> MutationEvent {
        MutationEvent {
            seq: 0,
            issue_id: id.to_string(),
            revision: 1,
            op: RecordOp::Create,
            title: "t".to_string(),
            status: Status::Open,
            actor: None,
            at: "2026-03-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn ring_assigns_sequence_numbers_and_evicts_oldest() {
        let mut ring = EventRing::new(2);
        assert_eq!(ring.push(event("bd-1")), 1);
        assert_eq!(ring.push(event("bd-2")), 2);
        assert_eq!(ring.push(event("bd-3")), 3);

        let (events, truncated) = ring.since(0, 10);
        assert!(truncated);
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let (recent, truncated) = ring.since(2, 10);
        assert!(!truncated);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].issue_id, "bd-3");
    }
}

//! The interception state machine — the heart of the daemon. Owns the
//! in-flight table exclusively; every other component only ever calls into
//! this module to report an event or a decision.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::InspectError;
use crate::frame::ExecEvent;
use crate::inspector::ProcessInspector;
use crate::policy::ProtectionPolicy;
use crate::signaler::{SignalError, Signaler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Suspended,
    Arbitrating,
    Resumed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct InterceptionRecord {
    pub pid: i32,
    pub original_path: PathBuf,
    pub original_hash: [u8; 32],
    pub state: State,
    pub enqueued_at: Instant,
}

/// `remainingAttempts(path) -> integer`, the out-of-scope credential
/// subsystem's attempt-accounting function.
pub trait AttemptGate: Send + Sync {
    fn remaining_attempts(&self, path: &Path) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedAttempts;

impl AttemptGate for UnlimitedAttempts {
    fn remaining_attempts(&self, _path: &Path) -> i64 {
        i64::MAX
    }
}

#[derive(Debug, Clone)]
pub struct ArbitrationRequest {
    pub pid: i32,
    pub command: String,
    pub app_name: String,
    pub exec_hash: String,
    pub parent_pid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Where arbitration happens: embedded (direct prompt+verify) or daemon
/// (publish + await decision over the wire protocol). Modelled as a
/// boxed-future trait, a manual async-trait shape, because the controller
/// needs dynamic dispatch between the two modes.
pub trait ArbiterPort: Send + Sync {
    fn arbitrate(
        &self,
        request: ArbitrationRequest,
    ) -> Pin<Box<dyn Future<Output = Option<Decision>> + Send + '_>>;
}

/// Outcome of handling one EXEC event, for tests and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NotProtected,
    Duplicate,
    SuspendFailed,
    IdentityChangedBeforeArbitration,
    Denied,
    NoDecision,
    IdentityChangedBeforeResume,
    ResumeFailed,
    Resumed,
    AttemptsExhausted,
}

pub struct Controller {
    in_flight: Mutex<HashMap<i32, InterceptionRecord>>,
    /// Pids currently being deduped/inspected but not yet known to be
    /// protected, let alone suspended. Kept separate from `in_flight` so a
    /// pid in this set is never mistaken by `force_terminate_all_pending`
    /// for a real `Suspended`/`Arbitrating` record — only `in_flight`
    /// entries, created after `signaler.stop()` actually succeeds, are
    /// real in-flight interceptions.
    reserved: Mutex<HashSet<i32>>,
    inspector: Arc<dyn ProcessInspector>,
    signaler: Arc<dyn Signaler>,
    policy: ProtectionPolicy,
    attempts: Arc<dyn AttemptGate>,
    arbiter: Arc<dyn ArbiterPort>,
}

impl Controller {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        signaler: Arc<dyn Signaler>,
        policy: ProtectionPolicy,
        attempts: Arc<dyn AttemptGate>,
        arbiter: Arc<dyn ArbiterPort>,
    ) -> Self {
        Controller {
            in_flight: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            inspector,
            signaler,
            policy,
            attempts,
            arbiter,
        }
    }

    /// Runs `ProcessInspector::path` on a blocking-task thread so the
    /// underlying `/proc/<pid>/exe` syscall never ties up an async worker
    /// thread.
    async fn inspect_path(&self, pid: i32) -> Result<PathBuf, InspectError> {
        let inspector = self.inspector.clone();
        tokio::task::spawn_blocking(move || inspector.path(pid))
            .await
            .unwrap_or_else(|_| Err(InspectError::NoExePath(pid)))
    }

    /// Runs `ProcessInspector::parent` on a blocking-task thread; same
    /// rationale as `inspect_path`.
    async fn inspect_parent(&self, pid: i32) -> Result<i32, InspectError> {
        let inspector = self.inspector.clone();
        tokio::task::spawn_blocking(move || inspector.parent(pid))
            .await
            .unwrap_or_else(|_| Err(InspectError::NoStat(pid)))
    }

    /// Runs `ProcessInspector::hash` on a blocking-task thread; hashing is
    /// the slowest of the three inspections and the one most likely to
    /// starve the runtime if run inline.
    async fn inspect_hash(&self, path: PathBuf) -> Result<[u8; 32], InspectError> {
        let inspector = self.inspector.clone();
        let path_for_err = path.clone();
        tokio::task::spawn_blocking(move || inspector.hash(&path))
            .await
            .unwrap_or_else(|_| {
                Err(InspectError::Hash {
                    path: path_for_err,
                    source: std::io::Error::other("blocking inspection task panicked"),
                })
            })
    }

    /// Handles one EXEC event end to end, driving the pid through its full
    /// state diagram. Returns once the pid has reached a terminal state or
    /// was dropped early.
    pub async fn handle_exec(&self, event: ExecEvent) -> Outcome {
        let pid = event.pid;

        // Dedup must happen before the (possibly slow) inspection so two
        // EXEC frames for the same pid arriving back to back race into this
        // exact check rather than past it. The reservation lives in its own
        // set, not in `in_flight`, so a pid still being inspected — and not
        // yet known to be protected, let alone suspended — is never visible
        // to `force_terminate_all_pending`'s scan of real interceptions.
        {
            let mut reserved = self.reserved.lock().await;
            let in_flight = self.in_flight.lock().await;
            if reserved.contains(&pid) || in_flight.contains_key(&pid) {
                return Outcome::Duplicate;
            }
            drop(in_flight);
            reserved.insert(pid);
        }

        let path = match self.inspect_path(pid).await {
            Ok(p) => p,
            Err(_) => {
                self.reserved.lock().await.remove(&pid);
                return Outcome::NotProtected;
            }
        };

        if !self.policy.is_protected(&path) {
            self.reserved.lock().await.remove(&pid);
            return Outcome::NotProtected;
        }

        let parent_pid = self.inspect_parent(pid).await.unwrap_or(0);
        let hash = self.inspect_hash(path.clone()).await.unwrap_or([0u8; 32]);

        if self.attempts.remaining_attempts(&path) <= 0 {
            self.reserved.lock().await.remove(&pid);
            self.terminate(pid).await;
            return Outcome::AttemptsExhausted;
        }

        match self.signaler.stop(pid) {
            Ok(()) => {}
            Err(_) => {
                self.reserved.lock().await.remove(&pid);
                return Outcome::SuspendFailed;
            }
        }

        // STOP has actually been delivered: only now does this pid get a
        // real `Suspended` record, the one `force_terminate_all_pending`
        // and the shutdown sweep are allowed to act on.
        {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.insert(
                pid,
                InterceptionRecord {
                    pid,
                    original_path: path.clone(),
                    original_hash: hash,
                    state: State::Suspended,
                    enqueued_at: Instant::now(),
                },
            );
        }
        self.reserved.lock().await.remove(&pid);

        // Identity stability check #1: re-read immediately after suspend,
        // before handing off to arbitration.
        match self.inspect_path(pid).await {
            Ok(p) if p == path => {}
            _ => {
                self.terminate(pid).await;
                return Outcome::IdentityChangedBeforeArbitration;
            }
        }

        self.set_state(pid, State::Arbitrating).await;

        let app_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let request = ArbitrationRequest {
            pid,
            command: path.to_string_lossy().into_owned(),
            app_name,
            exec_hash: hex_encode(&hash),
            parent_pid,
        };

        let decision = self.arbiter.arbitrate(request).await;

        let decision = match decision {
            Some(d) => d,
            None => {
                self.terminate(pid).await;
                return Outcome::NoDecision;
            }
        };

        if decision == Decision::Deny {
            self.terminate(pid).await;
            return Outcome::Denied;
        }

        // Identity stability check #2: immediately before CONT. Guards
        // against races between the decision-to-allow and the actual
        // SIGCONT.
        match self.inspect_path(pid).await {
            Ok(p) if p == path => {}
            _ => {
                self.terminate(pid).await;
                return Outcome::IdentityChangedBeforeResume;
            }
        }

        match self.signaler.cont(pid) {
            Ok(()) => {
                self.finish(pid, State::Resumed).await;
                Outcome::Resumed
            }
            Err(_) => {
                // Logged but not retried; the record is still cleared.
                warn!(pid, "CONT failed after allow decision");
                self.finish(pid, State::Resumed).await;
                Outcome::ResumeFailed
            }
        }
    }

    async fn set_state(&self, pid: i32, state: State) {
        if let Some(record) = self.in_flight.lock().await.get_mut(&pid) {
            record.state = state;
        }
    }

    async fn finish(&self, pid: i32, _terminal_state: State) {
        self.in_flight.lock().await.remove(&pid);
    }

    /// Sends TERM and clears the record regardless of signal outcome.
    /// Signal errors such as ESRCH are not fatal; the record is cleared
    /// either way.
    async fn terminate(&self, pid: i32) {
        match self.signaler.term(pid) {
            Ok(()) | Err(SignalError::NoSuchProcess) => {}
            Err(SignalError::Other) => warn!(pid, "TERM delivery failed"),
        }
        info!(pid, "terminated intercepted process");
        self.in_flight.lock().await.remove(&pid);
    }

    /// Public terminal-state accessor for the arbitration server: when the
    /// last client with outstanding requests disconnects, force every
    /// `Suspended`/`Arbitrating` record to terminate.
    pub async fn force_terminate_all_pending(&self) {
        let pids: Vec<i32> = {
            let table = self.in_flight.lock().await;
            table
                .values()
                .filter(|r| matches!(r.state, State::Suspended | State::Arbitrating))
                .map(|r| r.pid)
                .collect()
        };
        for pid in pids {
            self.terminate(pid).await;
        }
    }

    /// Shutdown sweep: terminate every remaining in-flight record. Called
    /// under the bounded shutdown deadline.
    pub async fn shutdown_sweep(&self) {
        self.force_terminate_all_pending().await;
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    #[cfg(test)]
    pub async fn state_of(&self, pid: i32) -> Option<State> {
        self.in_flight.lock().await.get(&pid).map(|r| r.state)
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

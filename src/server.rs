//! Arbitration protocol server: accepts UNIX stream connections, broadcasts
//! `process_event` to every connected client, and resolves the first
//! `auth_response` received for a pid. Connection bookkeeping is a
//! connection set guarded by a mutex, with broadcasts snapshotting the set
//! before doing I/O so a slow peer never blocks delivery to the others.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::controller::{ArbitrationRequest, Controller, Decision};
use crate::error::ProtocolError;
use crate::protocol::{encode, ClientMessage, ServerMessage};

/// Rolling read deadline; refreshed on every received message.
const CONNECTION_READ_DEADLINE: Duration = Duration::from_secs(30);
/// Outbound queue depth per connection; a full queue means the peer is
/// stalled, not that other peers should stall with it.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

type ConnId = u64;

struct PendingArbitration {
    resolver: oneshot::Sender<bool>,
}

/// Owns the connection set and the pid -> pending-decision map. Shared
/// between the accept loop, per-connection tasks, and the `DaemonArbiter`.
pub struct ArbitrationHub {
    connections: Mutex<HashMap<ConnId, mpsc::Sender<ServerMessage>>>,
    pending: Mutex<HashMap<i32, PendingArbitration>>,
    next_conn_id: AtomicU64,
    controller: Mutex<Option<Arc<Controller>>>,
}

impl ArbitrationHub {
    pub fn new() -> Arc<Self> {
        Arc::new(ArbitrationHub {
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            controller: Mutex::new(None),
        })
    }

    /// Late-bound because the controller and the hub hold references to
    /// each other (controller drives arbitration through the hub; the hub
    /// must reach back into the controller when the last client vanishes).
    /// Wiring this after both are constructed avoids a reference cycle at
    /// construction time.
    pub async fn bind_controller(&self, controller: Arc<Controller>) {
        *self.controller.lock().await = Some(controller);
    }

    async fn add_connection(&self, id: ConnId, sender: mpsc::Sender<ServerMessage>) {
        self.connections.lock().await.insert(id, sender);
    }

    async fn remove_connection(&self, id: ConnId) {
        let now_empty = {
            let mut conns = self.connections.lock().await;
            conns.remove(&id);
            conns.is_empty()
        };
        if now_empty {
            debug!("last arbitration client disconnected");
            let controller = self.controller.lock().await.clone();
            if let Some(controller) = controller {
                controller.force_terminate_all_pending().await;
            }
            // Any pid still waiting on a decision now has no recipient at
            // all; dropping the resolvers makes their oneshot receivers
            // resolve to `Err`, which `DaemonArbiter::arbitrate` maps to
            // "no decision".
            self.pending.lock().await.clear();
        }
    }

    async fn broadcast(&self, msg: ServerMessage) {
        // Snapshot before doing I/O so one slow peer cannot hold up
        // delivery to the others.
        let senders: Vec<_> = self.connections.lock().await.values().cloned().collect();
        for sender in senders {
            if sender.try_send(msg.clone()).is_err() {
                warn!("dropping process_event for a stalled or closed client");
            }
        }
    }

    pub async fn register_pending(&self, pid: i32) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(pid, PendingArbitration { resolver: tx });
        rx
    }

    /// Resolves the first `auth_response` for `pid`; later ones for the
    /// same pid find nothing left to resolve and are silently ignored.
    async fn resolve(&self, pid: i32, success: bool) {
        if let Some(entry) = self.pending.lock().await.remove(&pid) {
            let _ = entry.resolver.send(success);
        }
    }

    pub async fn client_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

/// Daemon-mode `ArbiterPort`: publishes the interception event on the
/// arbitration channel and awaits a decision with a matching pid.
pub struct DaemonArbiter {
    hub: Arc<ArbitrationHub>,
}

impl DaemonArbiter {
    pub fn new(hub: Arc<ArbitrationHub>) -> Self {
        DaemonArbiter { hub }
    }
}

impl crate::controller::ArbiterPort for DaemonArbiter {
    fn arbitrate(
        &self,
        request: ArbitrationRequest,
    ) -> Pin<Box<dyn Future<Output = Option<Decision>> + Send + '_>> {
        Box::pin(async move {
            let rx = self.hub.register_pending(request.pid).await;
            self.hub
                .broadcast(ServerMessage::ProcessEvent {
                    pid: request.pid,
                    command: request.command,
                    app_name: request.app_name,
                    exec_hash: request.exec_hash,
                    parent_pid: request.parent_pid,
                })
                .await;

            // No user-facing timeout in daemon mode; the only non-decision
            // terminal event is loss of all clients, which
            // `remove_connection` turns into a dropped resolver.
            match rx.await {
                Ok(true) => Some(Decision::Allow),
                Ok(false) => Some(Decision::Deny),
                Err(_) => None,
            }
        })
    }
}

/// Accepts connections until `shutdown` fires, serving each on its own
/// task.
pub async fn run_accept_loop(
    listener: UnixListener,
    hub: Arc<ArbitrationHub>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("arbitration accept loop shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let id = hub.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        let hub = hub.clone();
                        tokio::spawn(async move { serve_connection(id, stream, hub).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept arbitration connection");
                    }
                }
            }
        }
    }
}

/// Reads one line within the rolling read deadline, mapping the three ways
/// this can fail to the typed protocol errors: the deadline firing, the
/// stream erroring, or a clean EOF both collapse to "nothing more will
/// arrive from this peer."
async fn read_line_with_deadline(
    reader: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
) -> Result<String, ProtocolError> {
    match tokio::time::timeout(CONNECTION_READ_DEADLINE, reader.next_line()).await {
        Ok(Ok(Some(line))) => Ok(line),
        Ok(Ok(None)) => Err(ProtocolError::Closed),
        Ok(Err(_)) => Err(ProtocolError::Closed),
        Err(_) => Err(ProtocolError::DeadlineExpired),
    }
}

async fn serve_connection(id: ConnId, stream: UnixStream, hub: Arc<ArbitrationHub>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_DEPTH);
    hub.add_connection(id, out_tx).await;

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if write_half.write_all(encode(&msg).as_bytes()).await.is_err() {
                break;
            }
        }
    });

    loop {
        let line = match read_line_with_deadline(&mut reader).await {
            Ok(line) => line,
            Err(ProtocolError::DeadlineExpired) => {
                debug!("arbitration connection read deadline expired");
                break;
            }
            Err(e) => {
                debug!(error = %e, "arbitration connection closed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match crate::protocol::decode_client_message(&line).map_err(ProtocolError::from) {
            Ok(ClientMessage::Ping) => {
                if let Some(sender) = hub.connections.lock().await.get(&id) {
                    let _ = sender.try_send(ServerMessage::Pong);
                }
            }
            Ok(ClientMessage::AuthResponse { pid, success }) => {
                hub.resolve(pid, success).await;
            }
            Ok(ClientMessage::Shutdown) => break,
            Err(e) => {
                warn!(error = %e, "malformed arbitration protocol frame");
            }
        }
    }

    hub.remove_connection(id).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolving_pending_pid_yields_decision() {
        let hub = ArbitrationHub::new();
        let rx = hub.register_pending(1234).await;
        hub.resolve(1234, true).await;
        assert_eq!(rx.await, Ok(true));
    }

    #[tokio::test]
    async fn second_resolve_for_same_pid_is_ignored() {
        let hub = ArbitrationHub::new();
        let rx = hub.register_pending(1234).await;
        hub.resolve(1234, true).await;
        hub.resolve(1234, false).await; // no-op: already removed
        assert_eq!(rx.await, Ok(true));
    }

    #[tokio::test]
    async fn last_client_disconnect_drops_pending_resolvers() {
        let hub = ArbitrationHub::new();
        let (tx, _rx) = mpsc::channel(1);
        hub.add_connection(0, tx).await;
        let rx = hub.register_pending(7000).await;

        hub.remove_connection(0).await;

        assert!(rx.await.is_err());
        assert_eq!(hub.client_count().await, 0);
    }
}

//! Line-delimited JSON-RPC transport over a child process's stdio.
//!
//! A background task owns the stdout reader loop for the lifetime of the
//! transport. Responses are dispatched to whichever `request()` call is
//! waiting on a matching `id`; anything else (notifications, unmatched
//! responses) is broadcast to every active subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::domain::error::BridgeError;

type PendingMap = HashMap<u64, oneshot::Sender<Value>>;
type SubscriberMap = HashMap<u64, mpsc::UnboundedSender<Value>>;

const STATE_OPEN: u8 = 0;
const STATE_CLOSED_REQUESTED: u8 = 1;
const STATE_CLOSED_EXITED: u8 = 2;
const STATE_CLOSED_FRAMING_ERROR: u8 = 3;

struct Inner {
    stdin: Mutex<Option<ChildStdin>>,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    subscribers: SyncMutex<SubscriberMap>,
    next_subscriber_id: AtomicU64,
    state: AtomicU8,
}

/// A handle to a running JSON-RPC transport. Cheaply `Clone`-able; clones
/// share the same underlying stdin writer and reader task.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

/// A live subscription to a transport's notification stream.
///
/// Dropping a `Subscription` unregisters it, so a transport that outlives
/// many short-lived subscribers (one per prompt, on a long-lived session
/// process) never accumulates dead senders.
pub struct Subscription {
    inner: Arc<Inner>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.remove(&self.id);
        }
    }
}

impl Transport {
    /// Attaches to a child process's stdio and spawns the background
    /// reader task. The caller retains ownership of the `Child` itself
    /// (for waiting on exit / killing); this only takes its stdio handles.
    #[must_use]
    pub fn attach(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let inner = Arc::new(Inner {
            stdin: Mutex::new(Some(stdin)),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            subscribers: SyncMutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
            state: AtomicU8::new(STATE_OPEN),
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let lines = BufReader::new(stdout).lines();
            reader_loop(reader_inner, lines).await;
        });

        Self { inner }
    }

    /// Sends a JSON-RPC request with the given method and params, and
    /// awaits the matching response, returning its `result` value.
    ///
    /// # Errors
    /// Returns [`BridgeError::AgentExited`] if the child process exited
    /// (stdout EOF or a read error) before a matching response arrives,
    /// [`BridgeError::TransportClosed`] if the transport was closed
    /// explicitly or a malformed line forced a framing-error shutdown, or
    /// [`BridgeError::AgentError`] if the response carries a JSON-RPC
    /// `error` object.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let state = self.inner.state.load(Ordering::SeqCst);
        if state != STATE_OPEN {
            return Err(error_for_state(state));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, reply_tx);

        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if let Err(err) = write_line(&self.inner, &payload).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(err);
        }

        let response = reply_rx
            .await
            .map_err(|_| error_for_state(self.inner.state.load(Ordering::SeqCst)))?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("agent returned a JSON-RPC error")
                .to_string();
            return Err(BridgeError::AgentError(message));
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Sends a JSON-RPC notification (no response expected).
    ///
    /// # Errors
    /// Returns [`BridgeError::TransportClosed`] or
    /// [`BridgeError::AgentExited`] if the transport is closed.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        let state = self.inner.state.load(Ordering::SeqCst);
        if state != STATE_OPEN {
            return Err(error_for_state(state));
        }
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        write_line(&self.inner, &payload).await
    }

    /// Subscribes to every non-response line (notifications, unmatched
    /// responses) received from the child. The returned [`Subscription`]
    /// unregisters itself when dropped.
    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.insert(id, tx);
        }
        Subscription { inner: Arc::clone(&self.inner), id, rx }
    }

    /// Closes stdin and marks the transport closed, failing every pending
    /// request and dropping all subscribers. Idempotent.
    pub async fn close(&self) {
        close_with_state(&self.inner, STATE_CLOSED_REQUESTED).await;
    }

    /// Whether the transport has been closed (stdout EOF, a malformed
    /// line, or an explicit `close()`).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) != STATE_OPEN
    }
}

fn error_for_state(state: u8) -> BridgeError {
    if state == STATE_CLOSED_EXITED {
        BridgeError::AgentExited
    } else {
        BridgeError::TransportClosed
    }
}

async fn write_line(inner: &Arc<Inner>, payload: &Value) -> Result<(), BridgeError> {
    let mut serialized = payload.to_string();
    serialized.push('\n');

    let mut stdin_guard = inner.stdin.lock().await;
    let Some(stdin) = stdin_guard.as_mut() else {
        return Err(error_for_state(inner.state.load(Ordering::SeqCst)));
    };
    stdin
        .write_all(serialized.as_bytes())
        .await
        .map_err(|_| BridgeError::TransportClosed)?;
    stdin.flush().await.map_err(|_| BridgeError::TransportClosed)
}

async fn reader_loop(inner: Arc<Inner>, mut lines: Lines<BufReader<ChildStdout>>) {
    let exit_state = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    tracing::warn!(%line, "discarding malformed JSON-RPC line, closing transport");
                    break STATE_CLOSED_FRAMING_ERROR;
                };
                dispatch(&inner, value).await;
                continue;
            }
            Ok(None) | Err(_) => break STATE_CLOSED_EXITED,
        }
    };

    close_with_state(&inner, exit_state).await;
}

async fn dispatch(inner: &Arc<Inner>, value: Value) {
    let id = value.get("id").and_then(Value::as_u64);

    if let Some(id) = id {
        let mut pending = inner.pending.lock().await;
        if let Some(sender) = pending.remove(&id) {
            let _ = sender.send(value);
            return;
        }
    }

    if let Ok(mut subscribers) = inner.subscribers.lock() {
        subscribers.retain(|_, subscriber| subscriber.send(value.clone()).is_ok());
    }
}

async fn close_with_state(inner: &Arc<Inner>, new_state: u8) {
    if inner
        .state
        .compare_exchange(STATE_OPEN, new_state, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    // Dropping stdin closes the pipe, signalling EOF to the child.
    inner.stdin.lock().await.take();

    let mut pending = inner.pending.lock().await;
    for (_, sender) in pending.drain() {
        drop(sender);
    }
    if let Ok(mut subscribers) = inner.subscribers.lock() {
        subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use tokio::process::Command;

    use super::*;

    /// Spawns `cat`, which echoes every stdin line back on stdout — a
    /// trivial, dependency-free stand-in for a real JSON-RPC agent that
    /// lets us exercise the real id-matching/dispatch logic end to end.
    fn spawn_cat() -> tokio::process::Child {
        Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("cat must be available in the test environment")
    }

    #[tokio::test]
    async fn request_ids_are_pairwise_distinct() {
        // Arrange
        let transport = Transport {
            inner: Arc::new(Inner {
                stdin: Mutex::new(spawn_cat().stdin.take()),
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                subscribers: SyncMutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(0),
                state: AtomicU8::new(STATE_OPEN),
            }),
        };

        // Act
        let first = transport.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let second = transport.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let third = transport.inner.next_id.fetch_add(1, Ordering::SeqCst);

        // Assert
        assert_eq!([first, second, third], [0, 1, 2]);
    }

    #[tokio::test]
    async fn request_resolves_with_matching_echoed_response() {
        // Arrange: `cat` just echoes our own request back as a line, and
        // since our request has an "id" field, the reader's dispatch loop
        // treats it as a matching response. The echoed line has no "error"
        // key and no "result" key, so it resolves with `Value::Null`.
        let mut child = spawn_cat();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let transport = Transport::attach(stdin, stdout);

        // Act
        let result = transport.request("ping", serde_json::json!({"a": 1})).await;

        // Assert
        assert_eq!(result.unwrap(), Value::Null);
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        // Arrange
        let mut child = spawn_cat();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let transport = Transport::attach(stdin, stdout);
        drop(child.stdout.take());

        // Act
        transport.close().await;
        let result = transport.request("ping", serde_json::Value::Null).await;

        // Assert
        assert!(matches!(result, Err(BridgeError::TransportClosed)));
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn notify_on_closed_transport_errors() {
        // Arrange
        let mut child = spawn_cat();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let transport = Transport::attach(stdin, stdout);
        transport.close().await;

        // Act
        let result = transport.notify("noop", serde_json::Value::Null).await;

        // Assert
        assert!(matches!(result, Err(BridgeError::TransportClosed)));
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn child_exit_surfaces_as_agent_exited() {
        // Arrange: kill the child out from under the transport so its
        // stdout hits EOF without us ever calling `close()`.
        let mut child = spawn_cat();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let transport = Transport::attach(stdin, stdout);
        let _ = child.kill().await;
        let _ = child.wait().await;

        // Act: give the reader task a beat to observe EOF and close.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let result = transport.request("ping", serde_json::Value::Null).await;

        // Assert
        assert!(matches!(result, Err(BridgeError::AgentExited)));
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned_from_dispatch() {
        // Arrange
        let mut child = spawn_cat();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let transport = Transport::attach(stdin, stdout);
        let subscription = transport.subscribe().await;
        assert_eq!(transport.inner.subscribers.lock().unwrap().len(), 1);

        // Act
        drop(subscription);

        // Assert
        assert_eq!(transport.inner.subscribers.lock().unwrap().len(), 0);
        let _ = child.kill().await;
    }
}

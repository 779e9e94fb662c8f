//! Subprocess lifecycle and JSON-RPC handshake for one south-side agent.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::domain::agent::AgentSpec;
use crate::domain::error::BridgeError;
use crate::domain::message::ContentBlock;

use super::transport::Transport;

const PROTOCOL_VERSION: u64 = 1;

/// A handle to an in-flight `session/prompt` call: a live stream of the
/// raw `session/update` payloads observed for it, plus a future that
/// resolves with the aggregated final text once the prompt response
/// itself arrives.
pub struct PromptHandle {
    pub updates: tokio::sync::mpsc::UnboundedReceiver<Value>,
    /// Resolves once the `session/prompt` response itself arrives, with
    /// the aggregated final text. `Err` on recv failure means the task
    /// driving the prompt was dropped before completing.
    pub completion: tokio::sync::oneshot::Receiver<Result<String, BridgeError>>,
}

/// A live south-side agent subprocess: its transport, its child handle,
/// and the south session id currently bound to it (if any).
pub struct AgentProcess {
    transport: Transport,
    child: Mutex<Child>,
    prompt_lock: Mutex<()>,
}

impl AgentProcess {
    /// Spawns the agent's command, attaches a [`Transport`], and performs
    /// the `initialize` (and, if offered, `authenticate`) handshake.
    ///
    /// # Errors
    /// Returns [`BridgeError::SpawnFailed`] if the process cannot be
    /// spawned, or a transport/agent error if the handshake fails.
    pub async fn spawn(spec: &AgentSpec, cwd: &Path) -> Result<Self, BridgeError> {
        let Some((program, args)) = spec.command.split_first() else {
            return Err(BridgeError::SpawnFailed(format!(
                "agent `{}` has an empty command",
                spec.name
            )));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(api_key) = spec.resolved_api_key() {
            command.env("ACP2_AGENT_API_KEY", api_key);
        }

        let mut child = command
            .spawn()
            .map_err(|err| BridgeError::SpawnFailed(format!("failed to spawn `{program}`: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("child has no stdout".into()))?;

        let transport = Transport::attach(stdin, stdout);

        let process = Self {
            transport,
            child: Mutex::new(child),
            prompt_lock: Mutex::new(()),
        };

        process.handshake(spec).await?;
        Ok(process)
    }

    async fn handshake(&self, spec: &AgentSpec) -> Result<(), BridgeError> {
        let init_result = self
            .transport
            .request(
                "initialize",
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientCapabilities": {
                        "fs": { "readTextFile": true, "writeTextFile": true },
                        "terminal": true,
                    },
                }),
            )
            .await?;

        let auth_methods = init_result
            .get("authMethods")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if !auth_methods.is_empty() {
            let mut params = serde_json::json!({ "methodId": "apikey" });
            if let Some(api_key) = spec.resolved_api_key() {
                params["apiKey"] = Value::String(api_key);
            }
            self.transport.request("authenticate", params).await?;
        }

        Ok(())
    }

    /// Opens a brand-new south session under the given working directory.
    ///
    /// # Errors
    /// Returns a transport/agent error if `session/new` fails.
    pub async fn open_new(&self, cwd: &Path) -> Result<String, BridgeError> {
        let result = self
            .transport
            .request(
                "session/new",
                serde_json::json!({
                    "cwd": cwd.to_string_lossy(),
                    "mcpServers": [],
                }),
            )
            .await?;

        result
            .get("sessionId")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| BridgeError::AgentError("session/new response missing sessionId".into()))
    }

    /// Attempts to resume a previously-bound south session. Returns
    /// `Ok(true)` if resumed, `Ok(false)` if the agent signalled (via a
    /// JSON-RPC error — normatively "method not found", but any error is
    /// accepted) that resumption is unsupported or the session is gone, in
    /// which case the caller should fall back to [`Self::open_new`].
    ///
    /// # Errors
    /// Returns an error only for transport failure (connection closed).
    pub async fn resume(&self, south_session_id: &str) -> Result<bool, BridgeError> {
        match self
            .transport
            .request("session/load", serde_json::json!({ "sessionId": south_session_id }))
            .await
        {
            Ok(_) => Ok(true),
            Err(BridgeError::TransportClosed) => Err(BridgeError::TransportClosed),
            Err(_) => Ok(false),
        }
    }

    /// Sends a prompt (the full content block array, passed through
    /// losslessly) to the given south session and aggregates every
    /// `agent_message_chunk` update into the final text, returning that
    /// text plus the raw update payloads observed along the way.
    ///
    /// # Errors
    /// Returns [`BridgeError::Busy`] immediately if a prompt is already in
    /// flight on this process.
    ///
    /// Returns a [`PromptHandle`] immediately: `updates` streams every raw
    /// `session/update` payload for this south session as it arrives, and
    /// `completion` resolves once the `session/prompt` response itself
    /// returns, with the aggregated chunk text.
    pub async fn prompt(
        &self,
        south_session_id: &str,
        blocks: &[ContentBlock],
    ) -> Result<PromptHandle, BridgeError> {
        let guard = match self.prompt_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err(BridgeError::Busy),
        };

        let updates = self.transport.subscribe().await;
        let request_future = self.transport.request(
            "session/prompt",
            serde_json::json!({
                "sessionId": south_session_id,
                "prompt": blocks,
            }),
        );

        let (update_tx, update_rx) = tokio::sync::mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = tokio::sync::oneshot::channel();
        let south_session_id = south_session_id.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            let mut updates = updates;
            tokio::pin!(request_future);

            let mut aggregated_text = String::new();

            let outcome = loop {
                tokio::select! {
                    biased;
                    response = &mut request_future => {
                        break response;
                    }
                    update = updates.recv() => {
                        match update {
                            Some(value) if is_session_update_for(&value, &south_session_id) => {
                                if let Some(chunk) = extract_chunk_text(&value) {
                                    aggregated_text.push_str(&chunk);
                                }
                                let _ = update_tx.send(value);
                            }
                            Some(_) => {}
                            None => {}
                        }
                    }
                }
            };

            let _ = completion_tx.send(outcome.map(|_| aggregated_text));
        });

        Ok(PromptHandle { updates: update_rx, completion: completion_rx })
    }

    /// Requests cancellation of the in-flight prompt on the given south
    /// session. Best-effort: the caller is still responsible for awaiting
    /// the prompt's own response.
    ///
    /// # Errors
    /// Returns a transport error if the request cannot be sent.
    pub async fn cancel(&self, south_session_id: &str) -> Result<(), BridgeError> {
        self.transport
            .request("session/cancel", serde_json::json!({ "sessionId": south_session_id }))
            .await
            .map(|_| ())
    }

    /// Whether the underlying transport has observed the child exit
    /// (stdout EOF or a malformed line) or been explicitly closed.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.transport.is_closed()
    }

    /// Gracefully terminates the process: closes stdin, waits up to
    /// `grace_period`, then sends SIGKILL if still alive. Idempotent.
    pub async fn terminate(&self, grace_period: Duration) {
        self.transport.close().await;
        let mut child = self.child.lock().await;

        if tokio::time::timeout(grace_period, child.wait()).await.is_err() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

fn is_session_update_for(value: &Value, south_session_id: &str) -> bool {
    value.get("method").and_then(Value::as_str) == Some("session/update")
        && value
            .get("params")
            .and_then(|params| params.get("sessionId"))
            .and_then(Value::as_str)
            == Some(south_session_id)
}

fn extract_chunk_text(value: &Value) -> Option<String> {
    let update = value.get("params")?.get("update")?;
    if update.get("sessionUpdate").and_then(Value::as_str) != Some("agent_message_chunk") {
        return None;
    }
    update
        .get("content")
        .and_then(|content| content.get("text"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_session_update_for_matches_method_and_session_id() {
        // Arrange
        let value = serde_json::json!({
            "method": "session/update",
            "params": { "sessionId": "sess-1", "update": {} },
        });

        // Act / Assert
        assert!(is_session_update_for(&value, "sess-1"));
        assert!(!is_session_update_for(&value, "sess-2"));
    }

    #[test]
    fn extract_chunk_text_reads_agent_message_chunk() {
        // Arrange
        let value = serde_json::json!({
            "method": "session/update",
            "params": {
                "sessionId": "sess-1",
                "update": { "sessionUpdate": "agent_message_chunk", "content": { "text": "he" } },
            },
        });

        // Act
        let text = extract_chunk_text(&value);

        // Assert
        assert_eq!(text.as_deref(), Some("he"));
    }

    #[test]
    fn extract_chunk_text_ignores_other_update_kinds() {
        // Arrange
        let value = serde_json::json!({
            "method": "session/update",
            "params": {
                "sessionId": "sess-1",
                "update": { "sessionUpdate": "tool_call", "content": {} },
            },
        });

        // Act / Assert
        assert_eq!(extract_chunk_text(&value), None);
    }
}

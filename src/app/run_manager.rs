//! Drives a single north-side run from `created` through to a terminal
//! state, serializing runs per session via one worker task per session id.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use uuid::Uuid;

use crate::domain::error::BridgeError;
use crate::domain::message::{ContentBlock, Message, Role};
use crate::domain::run::{Run, RunError, RunMode, RunStatus, TurnContent, UpdateEvent};
use crate::infra::db::SessionStore;
use crate::util::now_unix;

use super::registry::AgentRegistry;
use super::session_manager::{Acquired, SessionManager};

struct RunJob {
    run_id: String,
    agent_name: String,
    session_id: Option<String>,
    input: TurnContent,
    event_tx: mpsc::UnboundedSender<UpdateEvent>,
}

struct RunHandle {
    run: Mutex<Run>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
}

pub struct RunManager {
    store: SessionStore,
    sessions: Arc<SessionManager>,
    registry: Arc<AgentRegistry>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<RunJob>>>,
    persist_updates: bool,
}

impl RunManager {
    #[must_use]
    pub fn new(
        store: SessionStore,
        sessions: Arc<SessionManager>,
        registry: Arc<AgentRegistry>,
        persist_updates: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sessions,
            registry,
            runs: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            persist_updates,
        })
    }

    /// Creates and enqueues a run, returning its id and the event channel
    /// its worker will publish [`UpdateEvent`]s to.
    ///
    /// # Errors
    /// Returns [`BridgeError::AgentNotFound`] if `agent_name` isn't
    /// registered, or [`BridgeError::NotFound`] if `session_id` is given
    /// but doesn't name an existing session.
    pub async fn create_run(
        self: &Arc<Self>,
        agent_name: String,
        session_id: Option<String>,
        mode: RunMode,
        input: TurnContent,
    ) -> Result<(String, mpsc::UnboundedReceiver<UpdateEvent>), BridgeError> {
        self.registry
            .get(&agent_name)
            .ok_or_else(|| BridgeError::AgentNotFound(agent_name.clone()))?;

        if let Some(session_id) = &session_id {
            self.ensure_session_exists(session_id, &agent_name).await?;
        }

        let run_id = Uuid::new_v4().to_string();
        let now = now_unix();
        let run = Run {
            id: run_id.clone(),
            session_id: session_id.clone(),
            agent_name: agent_name.clone(),
            mode,
            status: RunStatus::Created,
            result: None,
            error: None,
            created_at: now,
            finished_at: None,
        };

        self.runs.write().await.insert(
            run_id.clone(),
            Arc::new(RunHandle { run: Mutex::new(run), cancel_tx: Mutex::new(None) }),
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let job = RunJob { run_id: run_id.clone(), agent_name, session_id: session_id.clone(), input, event_tx };

        let queue_key = session_id.unwrap_or_else(|| run_id.clone());
        self.enqueue(queue_key, job).await;

        Ok((run_id, event_rx))
    }

    /// Creates a session row with `agent_name` if `session_id` doesn't
    /// already name one, per the Run Manager's "ensure the session
    /// exists" policy for a supplied `session_id`.
    async fn ensure_session_exists(&self, session_id: &str, agent_name: &str) -> Result<(), BridgeError> {
        if let Some(session) = self.store.get_session(session_id).await? {
            if session.status == crate::domain::session::SessionStatus::Terminated {
                return Err(BridgeError::Conflict(format!("session `{session_id}` is terminated")));
            }
            return Ok(());
        }

        let now = now_unix();
        let session = crate::domain::session::Session {
            id: session_id.to_string(),
            agent_name: agent_name.to_string(),
            south_session_id: None,
            created_at: now,
            last_active_at: now,
            status: crate::domain::session::SessionStatus::Active,
            message_count: 0,
        };
        self.store.create_session(&session).await
    }

    async fn enqueue(self: &Arc<Self>, queue_key: String, job: RunJob) {
        let mut queues = self.queues.lock().await;
        let sender = queues.entry(queue_key.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.run_worker(rx).await });
            tx
        });
        let _ = sender.send(job);
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<RunJob>) {
        while let Some(job) = rx.recv().await {
            self.execute(job).await;
        }
    }

    /// Returns the current state of a run.
    pub async fn get_run(&self, run_id: &str) -> Option<Run> {
        let runs = self.runs.read().await;
        let handle = runs.get(run_id)?;
        Some(handle.run.lock().await.clone())
    }

    /// Requests cancellation of an in-progress run.
    ///
    /// # Errors
    /// Returns [`BridgeError::NotFound`] if the run doesn't exist, or
    /// [`BridgeError::Conflict`] if it isn't currently in progress.
    pub async fn cancel(&self, run_id: &str) -> Result<Run, BridgeError> {
        let handle = {
            let runs = self.runs.read().await;
            Arc::clone(runs.get(run_id).ok_or_else(|| BridgeError::NotFound(format!("run `{run_id}`")))?)
        };

        {
            let run = handle.run.lock().await;
            if run.status != RunStatus::InProgress {
                return Err(BridgeError::Conflict(format!("run `{run_id}` is {:?}", run.status)));
            }
        }

        let cancel_tx = handle.cancel_tx.lock().await.take();
        match cancel_tx {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => return Err(BridgeError::Conflict(format!("run `{run_id}` is not cancellable right now"))),
        }

        Ok(handle.run.lock().await.clone())
    }

    async fn execute(&self, job: RunJob) {
        let RunJob { run_id, agent_name, session_id, input, event_tx } = job;

        let handle = {
            let runs = self.runs.read().await;
            match runs.get(&run_id) {
                Some(handle) => Arc::clone(handle),
                None => return,
            }
        };

        {
            let mut run = handle.run.lock().await;
            run.status = RunStatus::InProgress;
        }

        let is_ephemeral = session_id.is_none();
        let acquired = match &session_id {
            Some(session_id) => self.sessions.acquire(session_id).await,
            None => self.sessions.ephemeral(&agent_name).await,
        };

        let acquired: Acquired = match acquired {
            Ok(acquired) => acquired,
            Err(err) => {
                self.finish_failed(&handle, &event_tx, err).await;
                return;
            }
        };

        if let Some(session_id) = &session_id {
            let user_message = Message {
                session_id: session_id.clone(),
                sequence: 0,
                role: Role::User,
                content: input.content.clone(),
                created_at: now_unix(),
                south_blocks: vec![],
            };
            if let Err(err) = self.store.append_message(&user_message).await {
                self.finish_failed(&handle, &event_tx, err).await;
                return;
            }
        }

        let prompt_handle = match acquired.process.prompt(&acquired.south_session_id, &input.content).await {
            Ok(handle) => handle,
            Err(err) => {
                self.finish_failed(&handle, &event_tx, err).await;
                return;
            }
        };

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        *handle.cancel_tx.lock().await = Some(cancel_tx);

        let mut south_blocks = Vec::new();
        let mut cancel_requested = false;
        let mut updates = prompt_handle.updates;
        let mut completion = prompt_handle.completion;

        let outcome = loop {
            tokio::select! {
                biased;
                result = &mut completion => {
                    break result.map_err(|_| BridgeError::TransportClosed).and_then(|inner| inner);
                }
                update = updates.recv() => {
                    if let Some(value) = update {
                        if let Some(event) = classify_update(&value) {
                            let _ = event_tx.send(event);
                        }
                        if self.persist_updates {
                            south_blocks.push(value);
                        }
                    }
                }
                _ = &mut cancel_rx, if !cancel_requested => {
                    cancel_requested = true;
                    let _ = acquired.process.cancel(&acquired.south_session_id).await;
                }
            }
        };

        *handle.cancel_tx.lock().await = None;

        if is_ephemeral {
            acquired.process.terminate(std::time::Duration::from_secs(2)).await;
        } else if let Some(session_id) = &session_id {
            let _ = self.sessions.release(session_id, now_unix()).await;
        }

        if cancel_requested {
            self.finish_cancelled(&handle, &event_tx).await;
            return;
        }

        match outcome {
            Ok(text) => {
                let final_message = TurnContent { role: Role::Agent, content: vec![ContentBlock::Text { text: text.clone() }] };

                if let Some(session_id) = &session_id {
                    let agent_message = Message {
                        session_id: session_id.clone(),
                        sequence: 0,
                        role: Role::Agent,
                        content: final_message.content.clone(),
                        created_at: now_unix(),
                        south_blocks: south_blocks.clone(),
                    };
                    if let Err(err) = self.store.append_message(&agent_message).await {
                        self.finish_failed(&handle, &event_tx, err).await;
                        return;
                    }
                }

                let mut run = handle.run.lock().await;
                run.status = RunStatus::Completed;
                run.result = Some(final_message.clone());
                run.finished_at = Some(now_unix());
                drop(run);

                let _ = event_tx.send(UpdateEvent::Completed { final_message });
            }
            Err(err) => self.finish_failed(&handle, &event_tx, err).await,
        }
    }

    async fn finish_cancelled(&self, handle: &Arc<RunHandle>, event_tx: &mpsc::UnboundedSender<UpdateEvent>) {
        let mut run = handle.run.lock().await;
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(now_unix());
        drop(run);
        let _ = event_tx.send(UpdateEvent::Cancelled);
    }

    async fn finish_failed(
        &self,
        handle: &Arc<RunHandle>,
        event_tx: &mpsc::UnboundedSender<UpdateEvent>,
        err: BridgeError,
    ) {
        let run_error = RunError { kind: err.kind().to_string(), message: err.to_string() };
        let mut run = handle.run.lock().await;
        run.status = RunStatus::Failed;
        run.error = Some(run_error.clone());
        run.finished_at = Some(now_unix());
        drop(run);
        let _ = event_tx.send(UpdateEvent::Failed { error: run_error });
    }
}

/// Maps a raw `session/update` JSON-RPC notification onto the
/// [`UpdateEvent`] it represents. Unrecognized `sessionUpdate` kinds (and
/// anything malformed enough to be missing `sessionUpdate` entirely) are
/// dropped from the event stream, though still collected into
/// `south_blocks` when `persist_updates` is set.
fn classify_update(value: &Value) -> Option<UpdateEvent> {
    let update = value.get("params")?.get("update")?;
    match update.get("sessionUpdate").and_then(Value::as_str)? {
        "agent_message_chunk" => {
            let text = update.get("content")?.get("text")?.as_str()?.to_string();
            Some(UpdateEvent::AgentMessageChunk { text })
        }
        "tool_call" => Some(UpdateEvent::ToolCall(update.clone())),
        "plan" => Some(UpdateEvent::Plan(update.clone())),
        "thought" => Some(UpdateEvent::Thought(update.clone())),
        _ => None,
    }
}

//! Runs: one north-side request to prompt an agent, and its lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{ContentBlock, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Sync,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Created,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// A single completed input/output turn, as persisted in `content` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnContent {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub session_id: Option<String>,
    pub agent_name: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub result: Option<TurnContent>,
    pub error: Option<RunError>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub message: String,
}

/// Events streamed for an in-progress run, either over SSE or aggregated
/// into a `Run::result` for a sync-mode caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum UpdateEvent {
    AgentMessageChunk { text: String },
    ToolCall(Value),
    Plan(Value),
    Thought(Value),
    Cancelled,
    Completed { final_message: TurnContent },
    Failed { error: RunError },
}

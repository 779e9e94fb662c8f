//! The bridge's error taxonomy.
//!
//! Every fallible operation that can surface to an HTTP caller or into a
//! `Run`'s terminal `failed` event returns a [`BridgeError`]. The `kind()`
//! string is stable and appears verbatim in HTTP error bodies and in log
//! lines; it must never change for a given variant.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("{0}")]
    AuthError(String),

    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("agent process exited")]
    AgentExited,

    #[error("agent error: {0}")]
    AgentError(String),

    #[error("session is busy with another prompt")]
    Busy,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable kebab-case tag used in the `{"error":{"kind": ...}}` HTTP body.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config-error",
            Self::AgentNotFound(_) => "agent-not-found",
            Self::AuthError(_) => "auth-error",
            Self::SpawnFailed(_) => "spawn-failed",
            Self::TransportClosed => "transport-closed",
            Self::AgentExited => "agent-exited",
            Self::AgentError(_) => "agent-error",
            Self::Busy => "busy",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not-found",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status code this error maps to when surfaced as a JSON body.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AgentNotFound(_) | Self::NotFound(_) => 404,
            Self::AuthError(_) => 401,
            Self::Busy | Self::Conflict(_) => 409,
            Self::ConfigError(_) | Self::SpawnFailed(_) => 500,
            Self::TransportClosed | Self::AgentExited | Self::AgentError(_) => 502,
            Self::Internal(_) => 500,
        }
    }
}

/// Maps a persisted `RunError::kind` string back onto an HTTP status, for
/// surfacing a run's terminal `failed` state through the sync-mode HTTP
/// response without reconstructing the original [`BridgeError`] variant.
#[must_use]
pub fn status_code_for_kind(kind: &str) -> u16 {
    match kind {
        "agent-not-found" | "not-found" => 404,
        "auth-error" => 401,
        "busy" | "conflict" => 409,
        "config-error" | "spawn-failed" => 500,
        "transport-closed" | "agent-exited" | "agent-error" => 502,
        _ => 500,
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(format!("store error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_for_every_variant() {
        let cases: Vec<(BridgeError, &str)> = vec![
            (BridgeError::ConfigError("x".into()), "config-error"),
            (BridgeError::AgentNotFound("x".into()), "agent-not-found"),
            (BridgeError::AuthError("x".into()), "auth-error"),
            (BridgeError::SpawnFailed("x".into()), "spawn-failed"),
            (BridgeError::TransportClosed, "transport-closed"),
            (BridgeError::AgentExited, "agent-exited"),
            (BridgeError::AgentError("x".into()), "agent-error"),
            (BridgeError::Busy, "busy"),
            (BridgeError::Conflict("x".into()), "conflict"),
            (BridgeError::NotFound("x".into()), "not-found"),
            (BridgeError::Internal("x".into()), "internal"),
        ];

        for (err, expected) in cases {
            assert_eq!(err.kind(), expected);
        }
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(BridgeError::AgentNotFound("a".into()).status_code(), 404);
        assert_eq!(BridgeError::AuthError("a".into()).status_code(), 401);
        assert_eq!(BridgeError::Busy.status_code(), 409);
        assert_eq!(BridgeError::TransportClosed.status_code(), 502);
        assert_eq!(BridgeError::Internal("a".into()).status_code(), 500);
    }
}

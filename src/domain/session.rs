//! North-side session records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Terminated,
}

impl SessionStatus {
    /// Whether a transition from `self` to `next` is legal. Terminated is
    /// absorbing; active and idle freely move between each other.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Terminated => false,
            Self::Active | Self::Idle => true,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// A north-side conversation bound to a south-side agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_name: String,
    pub south_session_id: Option<String>,
    pub created_at: i64,
    pub last_active_at: i64,
    pub status: SessionStatus,
    pub message_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_is_absorbing() {
        assert!(!SessionStatus::Terminated.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Terminated.can_transition_to(SessionStatus::Idle));
    }

    #[test]
    fn active_and_idle_interchange_freely() {
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Idle));
        assert!(SessionStatus::Idle.can_transition_to(SessionStatus::Active));
    }

    #[test]
    fn display_and_from_str_round_trip() {
        for status in [SessionStatus::Active, SessionStatus::Idle, SessionStatus::Terminated] {
            let rendered = status.to_string();
            assert_eq!(rendered.parse::<SessionStatus>().unwrap(), status);
        }
    }
}

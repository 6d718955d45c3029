use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// CeremonyStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CeremonyStatus {
    Active,
    Complete,
    Degraded,
    Abandoned,
}

impl CeremonyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CeremonyStatus::Active => "ACTIVE",
            CeremonyStatus::Complete => "COMPLETE",
            CeremonyStatus::Degraded => "DEGRADED",
            CeremonyStatus::Abandoned => "ABANDONED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, CeremonyStatus::Active)
    }
}

impl fmt::Display for CeremonyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Task lifecycle.
///
/// `PENDING → OFFERED → {ACCEPTED → IN_PROGRESS → {COMPLETE | FAILED}} | DECLINED`
///
/// DECLINED and FAILED go back to the orchestrator, which either re-offers
/// (back to PENDING) or settles the task as exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Offered,
    Accepted,
    Declined,
    InProgress,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Offered => "OFFERED",
            TaskStatus::Accepted => "ACCEPTED",
            TaskStatus::Declined => "DECLINED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// A worker is bound to the task in these states.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TaskStatus::Offered | TaskStatus::Accepted | TaskStatus::InProgress
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ReplayMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Re-spawn with the prior partial output supplied as context.
    Resume,
    /// Discard partial output and start over.
    Restart,
    /// Re-run the task and everything downstream of it.
    Selective,
    /// Restart with verbose instrumentation; free of retry budget.
    Debug,
}

impl ReplayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplayMode::Resume => "resume",
            ReplayMode::Restart => "restart",
            ReplayMode::Selective => "selective",
            ReplayMode::Debug => "debug",
        }
    }

    pub fn consumes_budget(self) -> bool {
        !matches!(self, ReplayMode::Debug)
    }

    pub fn keeps_partial_output(self) -> bool {
        matches!(self, ReplayMode::Resume)
    }
}

impl fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReplayMode {
    type Err = crate::error::LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "resume" => Ok(ReplayMode::Resume),
            "restart" => Ok(ReplayMode::Restart),
            "selective" => Ok(ReplayMode::Selective),
            "debug" => Ok(ReplayMode::Debug),
            _ => Err(crate::error::LoomError::InvalidReplayMode(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TransportKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Isolated,
    Lightweight,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Isolated => "isolated",
            TransportKind::Lightweight => "lightweight",
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_serializes_screaming_snake() {
        let yaml = serde_yaml::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(yaml.trim(), "IN_PROGRESS");
        for status in [
            TaskStatus::Pending,
            TaskStatus::Offered,
            TaskStatus::Accepted,
            TaskStatus::Declined,
            TaskStatus::InProgress,
            TaskStatus::Complete,
            TaskStatus::Failed,
        ] {
            let s = serde_yaml::to_string(&status).unwrap();
            assert_eq!(s.trim(), status.as_str());
        }
    }

    #[test]
    fn replay_mode_parses_case_insensitively() {
        assert_eq!("RESUME".parse::<ReplayMode>().unwrap(), ReplayMode::Resume);
        assert_eq!(
            "selective".parse::<ReplayMode>().unwrap(),
            ReplayMode::Selective
        );
        assert!("rewind".parse::<ReplayMode>().is_err());
    }

    #[test]
    fn only_debug_is_free() {
        assert!(ReplayMode::Resume.consumes_budget());
        assert!(ReplayMode::Restart.consumes_budget());
        assert!(ReplayMode::Selective.consumes_budget());
        assert!(!ReplayMode::Debug.consumes_budget());
    }
}

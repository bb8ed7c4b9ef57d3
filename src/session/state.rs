//! Session state machine
//!
//! ```text
//!   Idle ──start──► Running ──stop──► Stopped
//!     └─────────────stop──────────────┘
//! ```

use std::fmt;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Channel bound, not encoding
    #[default]
    Idle,
    /// Device encoding into the distributor
    Running,
    /// Channel released; terminal
    Stopped,
}

impl SessionPhase {
    pub fn is_running(self) -> bool {
        self == SessionPhase::Running
    }

    pub fn is_terminal(self) -> bool {
        self == SessionPhase::Stopped
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Running => "running",
            SessionPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

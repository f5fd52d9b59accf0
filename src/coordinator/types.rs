//! Process and connectivity state types.
//!
//! # Process State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (stopped before start)       │ (schema ready, polling)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!                                   │
//!                      (fatal or throwable error)
//!                                   ↓
//!                                Failed
//! ```
//!
//! Connectivity is tracked separately: a `Running` process can be
//! disconnected and reconnecting in the background.
//!
//! ```text
//! Disconnected ──connect_with_backoff──→ Connected
//!      ↑                                     │
//!      └──────── socket error / disconnect ──┘
//! ```

/// Lifecycle of a [`Satellite`](super::Satellite) process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created but not started.
    Created,

    /// Running the migrator, loading metadata and relations.
    Starting,

    /// Snapshot polling active. The connection may or may not be up.
    Running,

    /// `stop()` called. Waiting for the active snapshot and tasks.
    ShuttingDown,

    /// Stopped cleanly. Safe to drop.
    Stopped,

    /// A throwable or fatal error ended the process.
    Failed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Created => write!(f, "Created"),
            ProcessState::Starting => write!(f, "Starting"),
            ProcessState::Running => write!(f, "Running"),
            ProcessState::ShuttingDown => write!(f, "ShuttingDown"),
            ProcessState::Stopped => write!(f, "Stopped"),
            ProcessState::Failed => write!(f, "Failed"),
        }
    }
}

/// Connection state reported to the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Connected,
    Disconnected,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_state_display() {
        assert_eq!(ProcessState::Created.to_string(), "Created");
        assert_eq!(ProcessState::Starting.to_string(), "Starting");
        assert_eq!(ProcessState::Running.to_string(), "Running");
        assert_eq!(ProcessState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(ProcessState::Stopped.to_string(), "Stopped");
        assert_eq!(ProcessState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_process_state_equality() {
        assert_eq!(ProcessState::Created, ProcessState::Created);
        assert_ne!(ProcessState::Created, ProcessState::Running);
    }

    #[test]
    fn test_connectivity_state_display() {
        assert_eq!(ConnectivityState::Connected.to_string(), "connected");
        assert_eq!(ConnectivityState::Disconnected.to_string(), "disconnected");
    }
}

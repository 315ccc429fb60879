//! Agent subprocess mediator.
//!
//! Owns a single long-running child process that reads newline-delimited
//! JSON prompts on stdin and writes newline-delimited JSON events on stdout.
//! No other component touches the child's handles; everything observable
//! flows out as [`AgentUpdate`]s.

pub mod events;
pub mod process;

pub use events::{parse_line, AgentEvent};
pub use process::{AgentConfig, AgentProcess, AgentState, AgentUpdate, SubmitError, TurnError};

/// Errors from managing the agent child process.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The child could not be spawned.
    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    /// Reading or writing a child handle failed.
    #[error("agent io error: {0}")]
    Io(#[from] std::io::Error),

    /// Sending a signal to the child failed.
    #[error("failed to signal agent: {0}")]
    Signal(String),

    /// The child is not running.
    #[error("agent process is not running")]
    NotRunning,
}

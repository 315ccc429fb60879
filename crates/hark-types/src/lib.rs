//! Shared types for the hark voice-to-agent relay.
//!
//! Everything that crosses a crate boundary lives here: the error taxonomy,
//! typed ids, the bus event model, the Turn entity, and configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod turn;

pub use config::{ConfigPatch, RelayConfig, ResponseMode, ServerSettings};
pub use error::RelayError;
pub use event::{
    BusEvent, ChatMessage, ChatRole, ClientCommand, ClientInfo, ClientKind, PermissionDecision,
    PermissionRequest, Prompt, PromptKind, PromptOption, RelayStatus, UsageSnapshot,
};
pub use ids::{PermissionId, TurnId};
pub use turn::{StepStatus, Turn, TurnOrigin, TurnStatus, TurnStep};

//! Event model for the in-process bus and the WebSocket fan-out.
//!
//! Every server-to-client WebSocket frame is a serialized [`BusEvent`]; the
//! `type` discriminator is the snake_case variant name. Client-to-server
//! frames decode into [`ClientCommand`]. Unknown tags are tolerated at decode
//! time by the consumers, never at use time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{PermissionId, TurnId};

/// Public-facing relay status, derived by the state aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    /// Nothing in flight.
    Idle,
    /// An audio upload is being transcribed.
    Listening,
    /// The agent subprocess is working on a turn.
    Thinking,
    /// A synthesized audio response is ready and unacknowledged.
    Speaking,
}

impl RelayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayStatus::Idle => "idle",
            RelayStatus::Listening => "listening",
            RelayStatus::Thinking => "thinking",
            RelayStatus::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message in the bounded chat ring.
///
/// `seq` is monotonically increasing across the life of the process, so a
/// reader that remembers the last seen value can resume with `seq > last`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub seq: u64,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// What kind of operator decision a prompt asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Free-form multiple choice surfaced by the agent itself.
    AgentPrompt,
    /// A tool-permission decision relayed from the hook sidecar.
    Permission,
}

/// One selectable option in a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptOption {
    pub num: u32,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
}

/// A pending question to the operator. At most one is active at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub kind: PromptKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub question: String,
    pub options: Vec<PromptOption>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Set when `kind` is [`PromptKind::Permission`]; maps to the live
    /// permission request this prompt resolves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_request_id: Option<PermissionId>,
}

impl Prompt {
    /// Build the standard allow/deny permission prompt for a tool call.
    pub fn for_permission(
        request_id: PermissionId,
        tool_name: &str,
        question: String,
        context: Option<String>,
    ) -> Self {
        Prompt {
            id: request_id.to_string(),
            kind: PromptKind::Permission,
            title: Some(tool_name.to_string()),
            context,
            question,
            options: vec![
                PromptOption {
                    num: 1,
                    label: "Allow".into(),
                    description: Some("Permit this operation".into()),
                    selected: None,
                },
                PromptOption {
                    num: 2,
                    label: "Deny".into(),
                    description: Some("Block this operation".into()),
                    selected: None,
                },
            ],
            timestamp: Utc::now(),
            deadline: None,
            permission_request_id: Some(request_id),
        }
    }
}

/// Decision state of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Pending,
    Allow,
    Deny,
}

impl PermissionDecision {
    pub fn is_pending(self) -> bool {
        self == PermissionDecision::Pending
    }
}

/// An out-of-band tool authorisation query raised by the hook sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: PermissionId,
    pub tool_name: String,
    pub input_summary: String,
    pub created_at: DateTime<Utc>,
    pub decision: PermissionDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-turn token accounting, as reported by the child.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub total_context: u64,
    #[serde(default)]
    pub context_window: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl UsageSnapshot {
    /// Context consumption as a percentage of the window, one decimal.
    pub fn context_percent(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        (self.total_context as f64 / self.context_window as f64 * 1000.0).round() / 10.0
    }
}

/// What kind of device a client session identifies as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Watch,
    Phone,
    Dashboard,
    Viewer,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Summary of one connected WebSocket client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub session_id: String,
    pub kind: ClientKind,
    pub device_id: String,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
}

/// Everything that flows over the in-process bus and out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    StateChanged {
        status: RelayStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<TurnId>,
    },
    ChatAppended {
        message: ChatMessage,
    },
    HistorySnapshot {
        messages: Vec<ChatMessage>,
    },
    PromptPosted {
        prompt: Prompt,
    },
    PromptResolved {
        id: String,
    },
    PermissionPosted {
        request: PermissionRequest,
    },
    PermissionResolved {
        id: PermissionId,
        decision: PermissionDecision,
    },
    UsageUpdated {
        usage: UsageSnapshot,
    },
    TextChunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<TurnId>,
        text: String,
    },
    ToolInvoked {
        name: String,
        summary: String,
    },
    ClientsChanged {
        clients: Vec<ClientInfo>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<TurnId>,
        kind: String,
        message: String,
    },
}

/// Commands a client may send over its WebSocket.
///
/// Anything that fails to decode into this enum is ignored by the gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Acknowledge receipt of a turn's response; evicts its audio artifact.
    Ack { id: TurnId },
    /// Abort the current turn.
    Abort,
}

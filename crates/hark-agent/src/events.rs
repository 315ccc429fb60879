//! Decoding of the child's NDJSON stdout stream.
//!
//! Each line is a JSON object with a `type` discriminator. Unknown types and
//! extra fields are tolerated at decode time; malformed lines are skipped by
//! the caller and never change state.

use serde::Deserialize;
use serde_json::Value;

use hark_types::event::{PromptOption, UsageSnapshot};
use hark_types::TurnId;

/// One event from the child's stdout stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A fragment of assistant text for the given turn.
    TextChunk {
        turn_id: Option<TurnId>,
        delta: String,
    },
    /// The agent invoked a tool.
    ToolUse { name: String, summary: String },
    /// The turn is finished; the accumulated text is the assistant message.
    MessageEnd { turn_id: Option<TurnId> },
    /// The agent asks the operator a multiple-choice question and stays
    /// busy until an option is relayed back.
    Prompt {
        question: String,
        options: Vec<PromptOption>,
    },
    /// Token accounting for the current turn.
    Usage(UsageSnapshot),
    /// The child confirmed a cancelled turn.
    Aborted { turn_id: Option<TurnId> },
    /// A well-formed event of a kind this version does not know.
    Unknown { kind: String },
}

#[derive(Debug, Deserialize)]
struct TextChunkPayload {
    #[serde(default)]
    turn_id: Option<TurnId>,
    #[serde(default)]
    delta: String,
}

#[derive(Debug, Deserialize)]
struct ToolUsePayload {
    name: String,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct TurnRefPayload {
    #[serde(default)]
    turn_id: Option<TurnId>,
}

#[derive(Debug, Deserialize)]
struct PromptPayload {
    question: String,
    #[serde(default)]
    options: Vec<PromptOption>,
}

/// Parse one stdout line. Returns `None` for blank or malformed lines and
/// for known kinds whose payload is missing required fields.
pub fn parse_line(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value: Value = serde_json::from_str(trimmed).ok()?;
    let kind = value.get("type")?.as_str()?.to_string();

    let event = match kind.as_str() {
        "text_chunk" => {
            let payload: TextChunkPayload = serde_json::from_value(value).ok()?;
            AgentEvent::TextChunk {
                turn_id: payload.turn_id,
                delta: payload.delta,
            }
        }
        "tool_use" => {
            let payload: ToolUsePayload = serde_json::from_value(value).ok()?;
            AgentEvent::ToolUse {
                name: payload.name,
                summary: payload.summary,
            }
        }
        "message_end" => {
            let payload: TurnRefPayload = serde_json::from_value(value).ok()?;
            AgentEvent::MessageEnd {
                turn_id: payload.turn_id,
            }
        }
        "prompt" => {
            let payload: PromptPayload = serde_json::from_value(value).ok()?;
            AgentEvent::Prompt {
                question: payload.question,
                options: payload.options,
            }
        }
        "usage" => {
            let usage: UsageSnapshot = serde_json::from_value(value).ok()?;
            AgentEvent::Usage(usage)
        }
        "aborted" => {
            let payload: TurnRefPayload = serde_json::from_value(value).ok()?;
            AgentEvent::Aborted {
                turn_id: payload.turn_id,
            }
        }
        _ => AgentEvent::Unknown { kind },
    };

    Some(event)
}

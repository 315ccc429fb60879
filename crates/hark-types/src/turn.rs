//! The Turn entity: one operator-initiated exchange and its timeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ResponseMode;
use crate::ids::{PermissionId, TurnId};

/// How the turn entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOrigin {
    Voice,
    Text,
}

/// Lifecycle status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Created; the agent has not finished (or not started) yet.
    Pending,
    /// Audio response synthesized and waiting for acknowledgement.
    Speaking,
    /// The agent finished and the response (if any) is ready.
    Completed,
    /// Cancelled by the operator.
    Aborted,
    /// The agent crashed or errored mid-turn.
    Failed,
}

impl TurnStatus {
    /// Whether the turn can still change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnStatus::Completed | TurnStatus::Aborted | TurnStatus::Failed
        )
    }
}

/// Progress state of one timeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Completed,
    Skipped,
    Error,
}

/// One entry in a turn's timeline, shown in the dashboard's tracing view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnStep {
    /// Machine name used to find and update the step (`received`,
    /// `transcribed`, `agent`, `permission`, `tts`, `response_ready`, ...).
    pub name: String,
    /// Human-readable label.
    pub label: String,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Set on `permission` steps so a later decision can find them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_request_id: Option<PermissionId>,
}

impl TurnStep {
    pub fn new(name: &str, label: &str, status: StepStatus) -> Self {
        TurnStep {
            name: name.to_string(),
            label: label.to_string(),
            status,
            timestamp: Utc::now(),
            detail: None,
            duration_ms: None,
            permission_request_id: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One operator-initiated exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub origin: TurnOrigin,
    /// Empty until STT returns (voice) or set at intake (text).
    pub transcript: String,
    pub response_mode: ResponseMode,
    pub created_at: DateTime<Utc>,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    /// Set when a TTS artifact for this turn exists in the audio store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_artifact_id: Option<TurnId>,
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<TurnStep>,
}

impl Turn {
    pub fn new(origin: TurnOrigin, response_mode: ResponseMode) -> Self {
        Turn {
            id: TurnId::generate(),
            origin,
            transcript: String::new(),
            response_mode,
            created_at: Utc::now(),
            status: TurnStatus::Pending,
            response_text: None,
            audio_artifact_id: None,
            acknowledged: false,
            error: None,
            steps: Vec::new(),
        }
    }

    /// Append a step to the timeline.
    pub fn push_step(&mut self, step: TurnStep) {
        self.steps.push(step);
    }

    /// Update the most recent step with the given name, if present.
    pub fn update_step(&mut self, name: &str, f: impl FnOnce(&mut TurnStep)) -> bool {
        if let Some(step) = self.steps.iter_mut().rev().find(|s| s.name == name) {
            f(step);
            true
        } else {
            false
        }
    }
}

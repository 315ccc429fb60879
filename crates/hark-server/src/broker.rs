//! Permission broker: rendezvous between the hook sidecar and operators.
//!
//! The hook posts a permission query when the agent attempts a sensitive
//! tool, then polls for the decision. The broker surfaces the query as a
//! prompt to every connected client, waits for an operator response (or a
//! deadline), and keeps resolved requests around for an idempotency window
//! so duplicate polls and responses see the same answer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;

use hark_types::{
    BusEvent, PermissionDecision, PermissionId, PermissionRequest, Prompt, RelayError, StepStatus,
    TurnId, TurnStep,
};

use crate::bus::EventBus;
use crate::state::StateHandle;
use crate::turns::TurnStore;

/// Tunables for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a pending request may wait before it is denied.
    pub decision_timeout: Duration,
    /// How long a resolved request stays visible to duplicate polls.
    pub idempotency_window: Duration,
    /// Cap on a single `/status` long-poll.
    pub long_poll_cap: Duration,
    /// Tools that are always auto-allowed.
    pub auto_allow_tools: Vec<String>,
    /// Read-only command words auto-allowed for `Bash`.
    pub auto_allow_commands: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            decision_timeout: Duration::from_secs(300),
            idempotency_window: Duration::from_secs(60),
            long_poll_cap: Duration::from_secs(30),
            auto_allow_tools: vec!["Read".into(), "Glob".into(), "Grep".into()],
            auto_allow_commands: [
                "ls", "cat", "head", "tail", "grep", "find", "echo", "pwd", "whoami", "date",
                "which", "type", "file",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

struct Entry {
    request: PermissionRequest,
    decision_tx: watch::Sender<(PermissionDecision, Option<String>)>,
    resolved_at: Option<Instant>,
    turn_id: Option<TurnId>,
}

pub struct PermissionBroker {
    config: BrokerConfig,
    inner: Mutex<HashMap<PermissionId, Entry>>,
    bus: EventBus,
    state: StateHandle,
    turns: Arc<TurnStore>,
}

impl PermissionBroker {
    pub fn new(
        config: BrokerConfig,
        bus: EventBus,
        state: StateHandle,
        turns: Arc<TurnStore>,
    ) -> Arc<Self> {
        Arc::new(PermissionBroker {
            config,
            inner: Mutex::new(HashMap::new()),
            bus,
            state,
            turns,
        })
    }

    /// Register a permission query from the hook.
    ///
    /// Auto-allowed operations resolve immediately and are never surfaced.
    /// Everything else becomes a pending request: a prompt is posted, a
    /// deadline task armed, and the returned request carries
    /// `decision = pending`.
    pub async fn request(
        self: &Arc<Self>,
        tool_name: &str,
        tool_input: Option<&serde_json::Value>,
        input_summary: Option<String>,
    ) -> PermissionRequest {
        let summary = input_summary
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| tool_input.map(|v| summarize_tool_input(tool_name, v)).unwrap_or_default());

        let id = PermissionId::generate();
        let mut request = PermissionRequest {
            id: id.clone(),
            tool_name: tool_name.to_string(),
            input_summary: summary.clone(),
            created_at: Utc::now(),
            decision: PermissionDecision::Pending,
            reason: None,
        };

        if self.is_auto_allowed(tool_name, tool_input, &summary) {
            request.decision = PermissionDecision::Allow;
            request.reason = Some("auto-approved safe operation".to_string());
            tracing::info!(id = %id, tool = tool_name, "auto-allowed permission request");

            let (decision_tx, _) = watch::channel((PermissionDecision::Allow, request.reason.clone()));
            self.inner.lock().expect("broker lock poisoned").insert(
                id,
                Entry {
                    request: request.clone(),
                    decision_tx,
                    resolved_at: Some(Instant::now()),
                    turn_id: None,
                },
            );
            return request;
        }

        let turn_id = self.state.snapshot().await.turn_id;
        let question = permission_question(tool_name, &summary);
        tracing::info!(id = %id, tool = tool_name, question = %question, "permission request pending");

        let (decision_tx, _) = watch::channel((PermissionDecision::Pending, None));
        self.inner.lock().expect("broker lock poisoned").insert(
            id.clone(),
            Entry {
                request: request.clone(),
                decision_tx,
                resolved_at: None,
                turn_id: turn_id.clone(),
            },
        );

        if let Some(turn_id) = &turn_id {
            let mut step = TurnStep::new(
                "permission",
                &format!("Permission: {tool_name}"),
                StepStatus::InProgress,
            )
            .with_detail(question.clone());
            step.permission_request_id = Some(id.clone());
            self.turns.push_step(turn_id, step);
        }

        self.bus.publish(BusEvent::PermissionPosted {
            request: request.clone(),
        });
        self.state.post_prompt(Prompt::for_permission(
            id.clone(),
            tool_name,
            question,
            Some(summary),
        ));

        let broker = Arc::clone(self);
        let deadline_id = id.clone();
        let deadline = self.config.decision_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            broker.resolve(&deadline_id, PermissionDecision::Deny, Some("timeout"));
        });

        request
    }

    fn is_auto_allowed(
        &self,
        tool_name: &str,
        tool_input: Option<&serde_json::Value>,
        summary: &str,
    ) -> bool {
        if self.config.auto_allow_tools.iter().any(|t| t == tool_name) {
            return true;
        }
        if tool_name == "Bash" {
            let command = tool_input
                .and_then(|v| v.get("command"))
                .and_then(|v| v.as_str())
                .unwrap_or(summary);
            let first_word = command.split_whitespace().next().unwrap_or("");
            return self
                .config
                .auto_allow_commands
                .iter()
                .any(|c| c == first_word);
        }
        false
    }

    /// Record an operator decision.
    ///
    /// Idempotent: responding to an already-resolved request inside the
    /// retention window is a no-op returning success; the first decision
    /// stands.
    pub fn respond(
        &self,
        id: &PermissionId,
        decision: PermissionDecision,
        reason: Option<&str>,
    ) -> Result<(), RelayError> {
        if decision.is_pending() {
            return Err(RelayError::BadRequest(
                "decision must be allow or deny".to_string(),
            ));
        }
        {
            let inner = self.inner.lock().expect("broker lock poisoned");
            let entry = inner.get(id).ok_or(RelayError::NotFound)?;
            if !entry.request.decision.is_pending() {
                tracing::debug!(id = %id, "duplicate permission response ignored");
                return Ok(());
            }
        }
        self.resolve(id, decision, reason);
        Ok(())
    }

    /// Resolve a pending request. Resolving an unknown or already-resolved
    /// request is a no-op.
    fn resolve(&self, id: &PermissionId, decision: PermissionDecision, reason: Option<&str>) {
        let (turn_id, tool_name) = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            let Some(entry) = inner.get_mut(id) else {
                return;
            };
            if !entry.request.decision.is_pending() {
                return;
            }
            entry.request.decision = decision;
            entry.request.reason = reason.map(String::from);
            entry.resolved_at = Some(Instant::now());
            let _ = entry
                .decision_tx
                .send((decision, reason.map(String::from)));
            (entry.turn_id.clone(), entry.request.tool_name.clone())
        };

        tracing::info!(id = %id, decision = ?decision, reason = ?reason, "permission resolved");

        if let Some(turn_id) = turn_id {
            let permission_id = id.clone();
            self.turns.with_turn(&turn_id, |turn| {
                if let Some(step) = turn
                    .steps
                    .iter_mut()
                    .rev()
                    .find(|s| s.permission_request_id.as_ref() == Some(&permission_id))
                {
                    step.status = if decision == PermissionDecision::Allow {
                        StepStatus::Completed
                    } else {
                        StepStatus::Error
                    };
                    step.detail = Some(format!("{}: {}", decision_str(decision), tool_name));
                }
            });
        }

        self.state.resolve_prompt(id.to_string());
        self.bus.publish(BusEvent::PermissionResolved {
            id: id.clone(),
            decision,
        });
    }

    /// Current decision for a request, long-polling while pending.
    ///
    /// Waits up to `min(wait, long_poll_cap)` for a resolution before
    /// reporting `pending`. Returns `None` for unknown ids.
    pub async fn status(
        &self,
        id: &PermissionId,
        wait: Duration,
    ) -> Option<(PermissionDecision, Option<String>)> {
        let mut rx = {
            let inner = self.inner.lock().expect("broker lock poisoned");
            let entry = inner.get(id)?;
            if !entry.request.decision.is_pending() {
                return Some((entry.request.decision, entry.request.reason.clone()));
            }
            entry.decision_tx.subscribe()
        };

        let cap = wait.min(self.config.long_poll_cap);
        let _ = tokio::time::timeout(cap, rx.wait_for(|(d, _)| !d.is_pending())).await;
        let (decision, reason) = rx.borrow().clone();
        Some((decision, reason))
    }

    /// Deny every pending request, e.g. when the agent terminates.
    pub fn deny_all(&self, reason: &str) {
        let pending: Vec<PermissionId> = {
            let inner = self.inner.lock().expect("broker lock poisoned");
            inner
                .iter()
                .filter(|(_, e)| e.request.decision.is_pending())
                .map(|(id, _)| id.clone())
                .collect()
        };
        if !pending.is_empty() {
            tracing::warn!(count = pending.len(), reason, "denying all pending permissions");
        }
        for id in pending {
            self.resolve(&id, PermissionDecision::Deny, Some(reason));
        }
    }

    /// Drop resolved requests older than the idempotency window. Returns
    /// how many were removed.
    pub fn expire(&self) -> usize {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        let before = inner.len();
        let window = self.config.idempotency_window;
        inner.retain(|_, entry| match entry.resolved_at {
            Some(at) => at.elapsed() < window,
            None => true,
        });
        before - inner.len()
    }

    /// Number of requests currently pending.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .expect("broker lock poisoned")
            .values()
            .filter(|e| e.request.decision.is_pending())
            .count()
    }
}

fn decision_str(decision: PermissionDecision) -> &'static str {
    match decision {
        PermissionDecision::Allow => "allow",
        PermissionDecision::Deny => "deny",
        PermissionDecision::Pending => "pending",
    }
}

/// Build the operator-facing question for a tool call.
fn permission_question(tool_name: &str, summary: &str) -> String {
    match tool_name {
        "Bash" => format!("Run command: {summary}"),
        "Write" | "Edit" => format!("{tool_name} file: {summary}"),
        _ if summary.is_empty() => format!("Execute {tool_name}"),
        _ => format!("Execute {tool_name}: {summary}"),
    }
}

/// Short summary of a tool's raw input for prompts and timelines.
pub fn summarize_tool_input(tool_name: &str, input: &serde_json::Value) -> String {
    let field = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };
    let summary = match tool_name {
        "Bash" => field("command"),
        "Read" | "Write" | "Edit" => field("file_path"),
        "Glob" | "Grep" => field("pattern"),
        "WebFetch" => field("url"),
        "Task" => field("description"),
        _ => None,
    };
    let summary = summary.or_else(|| {
        input
            .as_object()
            .and_then(|map| map.values().find_map(|v| v.as_str().map(String::from)))
    });
    match summary {
        Some(s) => truncate(&s, 80),
        None => String::new(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::spawn_aggregator;
    use serde_json::json;

    fn setup(config: BrokerConfig) -> (Arc<PermissionBroker>, EventBus, StateHandle) {
        let bus = EventBus::new(64);
        let state = spawn_aggregator(bus.clone(), 50);
        let turns = Arc::new(TurnStore::default());
        let broker = PermissionBroker::new(config, bus.clone(), state.clone(), turns);
        (broker, bus, state)
    }

    #[tokio::test]
    async fn read_tools_are_auto_allowed() {
        let (broker, _bus, state) = setup(BrokerConfig::default());
        let request = broker
            .request("Read", Some(&json!({"file_path": "/etc/hosts"})), None)
            .await;
        assert_eq!(request.decision, PermissionDecision::Allow);
        // Nothing surfaced to operators.
        assert!(state.snapshot().await.prompt.is_none());
        // The hook's poll sees the stored answer.
        let (decision, _) = broker
            .status(&request.id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(decision, PermissionDecision::Allow);
    }

    #[tokio::test]
    async fn readonly_bash_is_auto_allowed() {
        let (broker, _bus, _state) = setup(BrokerConfig::default());
        let request = broker
            .request("Bash", Some(&json!({"command": "ls -la /tmp"})), None)
            .await;
        assert_eq!(request.decision, PermissionDecision::Allow);

        let request = broker
            .request("Bash", Some(&json!({"command": "rm -rf /tmp/x"})), None)
            .await;
        assert_eq!(request.decision, PermissionDecision::Pending);
    }

    #[tokio::test]
    async fn pending_request_posts_prompt_and_event() {
        let (broker, bus, state) = setup(BrokerConfig::default());
        let mut sub = bus.subscribe();

        let request = broker
            .request("Bash", Some(&json!({"command": "rm -rf /tmp/x"})), None)
            .await;

        match sub.recv().await {
            Some(BusEvent::PermissionPosted { request: posted }) => {
                assert_eq!(posted.id, request.id);
                assert_eq!(posted.tool_name, "Bash");
            }
            other => panic!("expected PermissionPosted, got {other:?}"),
        }
        match sub.recv().await {
            Some(BusEvent::PromptPosted { prompt }) => {
                assert_eq!(prompt.permission_request_id, Some(request.id.clone()));
                assert_eq!(prompt.question, "Run command: rm -rf /tmp/x");
            }
            other => panic!("expected PromptPosted, got {other:?}"),
        }
        assert!(state.snapshot().await.prompt.is_some());
    }

    #[tokio::test]
    async fn respond_resolves_and_is_idempotent() {
        let (broker, bus, state) = setup(BrokerConfig::default());
        let request = broker
            .request("Write", Some(&json!({"file_path": "/srv/app.conf"})), None)
            .await;
        let mut sub = bus.subscribe();

        broker
            .respond(&request.id, PermissionDecision::Allow, None)
            .unwrap();

        let (decision, _) = broker
            .status(&request.id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(decision, PermissionDecision::Allow);

        // A duplicate response, even a conflicting one, is a no-op success.
        broker
            .respond(&request.id, PermissionDecision::Deny, Some("changed my mind"))
            .unwrap();
        let (decision, _) = broker
            .status(&request.id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(decision, PermissionDecision::Allow);

        // Exactly one resolution event was published.
        let mut resolved = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), sub.recv()).await
        {
            if matches!(event, BusEvent::PermissionResolved { .. }) {
                resolved += 1;
            }
        }
        assert_eq!(resolved, 1);
        assert!(state.snapshot().await.prompt.is_none());
    }

    #[tokio::test]
    async fn respond_unknown_id_is_not_found() {
        let (broker, _bus, _state) = setup(BrokerConfig::default());
        let err = broker
            .respond(&PermissionId::new("deadbeef"), PermissionDecision::Allow, None)
            .unwrap_err();
        assert!(matches!(err, RelayError::NotFound));
    }

    #[tokio::test]
    async fn deadline_denies_with_timeout_reason() {
        let config = BrokerConfig {
            decision_timeout: Duration::from_millis(50),
            ..BrokerConfig::default()
        };
        let (broker, _bus, _state) = setup(config);
        let request = broker
            .request("Bash", Some(&json!({"command": "rm -rf /"})), None)
            .await;

        let (decision, reason) = broker
            .status(&request.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(decision, PermissionDecision::Deny);
        assert_eq!(reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn long_poll_wakes_on_concurrent_resolution() {
        let (broker, _bus, _state) = setup(BrokerConfig::default());
        let request = broker
            .request("Edit", Some(&json!({"file_path": "/srv/x"})), None)
            .await;

        let waiter = {
            let broker = Arc::clone(&broker);
            let id = request.id.clone();
            tokio::spawn(async move { broker.status(&id, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker
            .respond(&request.id, PermissionDecision::Deny, Some("no"))
            .unwrap();

        let (decision, reason) = waiter.await.unwrap().unwrap();
        assert_eq!(decision, PermissionDecision::Deny);
        assert_eq!(reason.as_deref(), Some("no"));
    }

    #[tokio::test]
    async fn deny_all_resolves_every_pending_request() {
        let (broker, _bus, _state) = setup(BrokerConfig::default());
        let first = broker
            .request("Bash", Some(&json!({"command": "rm a"})), None)
            .await;
        let second = broker
            .request("Write", Some(&json!({"file_path": "/srv/b"})), None)
            .await;
        assert_eq!(broker.pending_count(), 2);

        broker.deny_all("agent terminated");
        assert_eq!(broker.pending_count(), 0);

        for id in [first.id, second.id] {
            let (decision, reason) = broker.status(&id, Duration::ZERO).await.unwrap();
            assert_eq!(decision, PermissionDecision::Deny);
            assert_eq!(reason.as_deref(), Some("agent terminated"));
        }
    }

    #[tokio::test]
    async fn expire_drops_resolved_entries_after_window() {
        let config = BrokerConfig {
            idempotency_window: Duration::ZERO,
            ..BrokerConfig::default()
        };
        let (broker, _bus, _state) = setup(config);
        let resolved = broker
            .request("Bash", Some(&json!({"command": "rm a"})), None)
            .await;
        broker
            .respond(&resolved.id, PermissionDecision::Allow, None)
            .unwrap();
        let pending = broker
            .request("Bash", Some(&json!({"command": "rm b"})), None)
            .await;

        assert_eq!(broker.expire(), 1);
        // Pending entries are never expired here; the deadline task owns them.
        assert!(broker.status(&pending.id, Duration::ZERO).await.is_some());
        assert!(broker.status(&resolved.id, Duration::ZERO).await.is_none());
    }

    #[test]
    fn tool_input_summaries() {
        assert_eq!(
            summarize_tool_input("Bash", &json!({"command": "cargo build --release"})),
            "cargo build --release"
        );
        assert_eq!(
            summarize_tool_input("Read", &json!({"file_path": "/etc/hosts"})),
            "/etc/hosts"
        );
        assert_eq!(
            summarize_tool_input("Grep", &json!({"pattern": "fn main"})),
            "fn main"
        );
        assert_eq!(
            summarize_tool_input("WebFetch", &json!({"url": "https://example.com"})),
            "https://example.com"
        );
        // Unknown tool falls back to the first string field.
        assert_eq!(
            summarize_tool_input("Custom", &json!({"target": "thing"})),
            "thing"
        );
        // Long values are truncated.
        let long = "x".repeat(100);
        let summary = summarize_tool_input("Bash", &json!({ "command": long }));
        assert_eq!(summary.chars().count(), 83);
        assert!(summary.ends_with("..."));
    }
}

//! State aggregator: the single owner of all public-facing mutable state.
//!
//! One task consumes a serialising command channel and mutates the status,
//! the bounded chat ring, the current prompt, the latest usage snapshot and
//! the connected-client set. Every mutation that clients care about is also
//! published on the event bus, so readers either take an immutable snapshot
//! or follow the bus.

use std::collections::VecDeque;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use hark_types::{
    BusEvent, ChatMessage, ChatRole, ClientInfo, Prompt, RelayStatus, TurnId, UsageSnapshot,
};

use crate::bus::EventBus;

/// Default chat ring capacity.
pub const DEFAULT_CHAT_CAPACITY: usize = 200;

/// Immutable view handed to new subscribers and the chat endpoint.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub status: RelayStatus,
    pub turn_id: Option<TurnId>,
    pub messages: Vec<ChatMessage>,
    pub prompt: Option<Prompt>,
    pub usage: Option<UsageSnapshot>,
    pub clients: Vec<ClientInfo>,
}

enum StateCommand {
    SetStatus {
        status: RelayStatus,
        turn_id: Option<TurnId>,
    },
    AppendChat {
        role: ChatRole,
        content: String,
    },
    ClearChat,
    PostPrompt(Prompt),
    ResolvePrompt {
        id: String,
    },
    SetUsage(UsageSnapshot),
    ClientConnected(ClientInfo),
    ClientDisconnected {
        session_id: String,
    },
    Snapshot(oneshot::Sender<Snapshot>),
}

/// Handle for posting mutations and taking snapshots. Cheap to clone.
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::UnboundedSender<StateCommand>,
}

impl StateHandle {
    pub fn set_status(&self, status: RelayStatus, turn_id: Option<TurnId>) {
        let _ = self.tx.send(StateCommand::SetStatus { status, turn_id });
    }

    pub fn append_chat(&self, role: ChatRole, content: impl Into<String>) {
        let _ = self.tx.send(StateCommand::AppendChat {
            role,
            content: content.into(),
        });
    }

    pub fn clear_chat(&self) {
        let _ = self.tx.send(StateCommand::ClearChat);
    }

    pub fn post_prompt(&self, prompt: Prompt) {
        let _ = self.tx.send(StateCommand::PostPrompt(prompt));
    }

    /// Clear the active prompt if it has the given id.
    pub fn resolve_prompt(&self, id: impl Into<String>) {
        let _ = self.tx.send(StateCommand::ResolvePrompt { id: id.into() });
    }

    pub fn set_usage(&self, usage: UsageSnapshot) {
        let _ = self.tx.send(StateCommand::SetUsage(usage));
    }

    pub fn client_connected(&self, client: ClientInfo) {
        let _ = self.tx.send(StateCommand::ClientConnected(client));
    }

    pub fn client_disconnected(&self, session_id: impl Into<String>) {
        let _ = self.tx.send(StateCommand::ClientDisconnected {
            session_id: session_id.into(),
        });
    }

    /// Take an immutable snapshot of the current state.
    pub async fn snapshot(&self) -> Snapshot {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(StateCommand::Snapshot(tx)).is_err() {
            return Snapshot::empty();
        }
        rx.await.unwrap_or_else(|_| Snapshot::empty())
    }
}

impl Snapshot {
    fn empty() -> Self {
        Snapshot {
            status: RelayStatus::Idle,
            turn_id: None,
            messages: Vec::new(),
            prompt: None,
            usage: None,
            clients: Vec::new(),
        }
    }
}

struct Aggregator {
    bus: EventBus,
    capacity: usize,
    status: RelayStatus,
    turn_id: Option<TurnId>,
    chat: VecDeque<ChatMessage>,
    next_seq: u64,
    prompt: Option<Prompt>,
    usage: Option<UsageSnapshot>,
    clients: Vec<ClientInfo>,
}

/// Spawn the aggregator task and return its handle.
pub fn spawn_aggregator(bus: EventBus, chat_capacity: usize) -> StateHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut aggregator = Aggregator {
        bus,
        capacity: chat_capacity,
        status: RelayStatus::Idle,
        turn_id: None,
        chat: VecDeque::new(),
        next_seq: 1,
        prompt: None,
        usage: None,
        clients: Vec::new(),
    };

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            aggregator.handle(command);
        }
        tracing::debug!("state aggregator stopped");
    });

    StateHandle { tx }
}

impl Aggregator {
    fn handle(&mut self, command: StateCommand) {
        match command {
            StateCommand::SetStatus { status, turn_id } => {
                if self.status != status || self.turn_id != turn_id {
                    self.status = status;
                    self.turn_id = turn_id.clone();
                    tracing::info!(status = %status, "relay status changed");
                    self.bus.publish(BusEvent::StateChanged { status, turn_id });
                }
            }
            StateCommand::AppendChat { role, content } => {
                let message = ChatMessage {
                    seq: self.next_seq,
                    role,
                    content,
                    timestamp: Utc::now(),
                };
                self.next_seq += 1;
                self.chat.push_back(message.clone());
                while self.chat.len() > self.capacity {
                    self.chat.pop_front();
                }
                self.bus.publish(BusEvent::ChatAppended { message });
            }
            StateCommand::ClearChat => {
                self.chat.clear();
                self.bus.publish(BusEvent::HistorySnapshot {
                    messages: Vec::new(),
                });
            }
            StateCommand::PostPrompt(prompt) => {
                tracing::info!(
                    question = %prompt.question,
                    options = prompt.options.len(),
                    "prompt posted"
                );
                self.prompt = Some(prompt.clone());
                self.bus.publish(BusEvent::PromptPosted { prompt });
            }
            StateCommand::ResolvePrompt { id } => {
                if self.prompt.as_ref().is_some_and(|p| p.id == id) {
                    self.prompt = None;
                    self.bus.publish(BusEvent::PromptResolved { id });
                }
            }
            StateCommand::SetUsage(usage) => {
                self.usage = Some(usage);
                self.bus.publish(BusEvent::UsageUpdated { usage });
            }
            StateCommand::ClientConnected(client) => {
                tracing::info!(
                    kind = ?client.kind,
                    device = %client.device_id,
                    total = self.clients.len() + 1,
                    "client connected"
                );
                self.clients.push(client);
                self.publish_clients();
            }
            StateCommand::ClientDisconnected { session_id } => {
                self.clients.retain(|c| c.session_id != session_id);
                tracing::info!(total = self.clients.len(), "client disconnected");
                self.publish_clients();
            }
            StateCommand::Snapshot(reply) => {
                let _ = reply.send(Snapshot {
                    status: self.status,
                    turn_id: self.turn_id.clone(),
                    messages: self.chat.iter().cloned().collect(),
                    prompt: self.prompt.clone(),
                    usage: self.usage,
                    clients: self.clients.clone(),
                });
            }
        }
    }

    fn publish_clients(&self) {
        self.bus.publish(BusEvent::ClientsChanged {
            clients: self.clients.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hark_types::ClientKind;

    fn setup() -> (EventBus, StateHandle) {
        let bus = EventBus::new(64);
        let handle = spawn_aggregator(bus.clone(), 3);
        (bus, handle)
    }

    #[tokio::test]
    async fn chat_ring_is_bounded_fifo() {
        let (_bus, state) = setup();
        for i in 0..5 {
            state.append_chat(ChatRole::User, format!("m{i}"));
        }
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.messages.len(), 3);
        // Oldest evicted first; seq stays monotone.
        assert_eq!(snapshot.messages[0].content, "m2");
        assert_eq!(snapshot.messages[0].seq, 3);
        assert_eq!(snapshot.messages[2].content, "m4");
        assert_eq!(snapshot.messages[2].seq, 5);
    }

    #[tokio::test]
    async fn status_change_publishes_once() {
        let (bus, state) = setup();
        let mut sub = bus.subscribe();

        state.set_status(RelayStatus::Thinking, None);
        state.set_status(RelayStatus::Thinking, None);
        state.set_status(RelayStatus::Idle, None);

        assert_eq!(
            sub.recv().await,
            Some(BusEvent::StateChanged {
                status: RelayStatus::Thinking,
                turn_id: None
            })
        );
        // The duplicate set was suppressed; next event is the idle change.
        assert_eq!(
            sub.recv().await,
            Some(BusEvent::StateChanged {
                status: RelayStatus::Idle,
                turn_id: None
            })
        );
    }

    #[tokio::test]
    async fn prompt_resolution_matches_id() {
        let (_bus, state) = setup();
        let prompt = Prompt::for_permission(
            hark_types::PermissionId::new("aa11bb22"),
            "Bash",
            "Run command: ls".into(),
            None,
        );
        state.post_prompt(prompt);

        state.resolve_prompt("wrong-id");
        assert!(state.snapshot().await.prompt.is_some());

        state.resolve_prompt("aa11bb22");
        assert!(state.snapshot().await.prompt.is_none());
    }

    #[tokio::test]
    async fn clients_changed_is_broadcast() {
        let (bus, state) = setup();
        let mut sub = bus.subscribe();

        state.client_connected(ClientInfo {
            session_id: "s1".into(),
            kind: ClientKind::Watch,
            device_id: "w1".into(),
            peer: "127.0.0.1".into(),
            connected_at: Utc::now(),
        });

        match sub.recv().await {
            Some(BusEvent::ClientsChanged { clients }) => {
                assert_eq!(clients.len(), 1);
                assert_eq!(clients[0].session_id, "s1");
            }
            other => panic!("expected ClientsChanged, got {other:?}"),
        }

        state.client_disconnected("s1");
        match sub.recv().await {
            Some(BusEvent::ClientsChanged { clients }) => assert!(clients.is_empty()),
            other => panic!("expected ClientsChanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_chat_broadcasts_empty_history() {
        let (bus, state) = setup();
        state.append_chat(ChatRole::User, "hello");
        let mut sub = bus.subscribe();
        state.clear_chat();

        assert_eq!(
            sub.recv().await,
            Some(BusEvent::HistorySnapshot {
                messages: Vec::new()
            })
        );
        assert!(state.snapshot().await.messages.is_empty());
    }

    #[tokio::test]
    async fn usage_snapshot_is_retained() {
        let (_bus, state) = setup();
        state.set_usage(UsageSnapshot {
            input_tokens: 10,
            total_context: 100,
            context_window: 1000,
            ..UsageSnapshot::default()
        });
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.usage.unwrap().input_tokens, 10);
    }
}

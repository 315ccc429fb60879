//! Turn registry: every accepted submission, its status, response payload,
//! and timeline, kept in a bounded newest-first ring.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use hark_types::{
    ResponseMode, StepStatus, Turn, TurnId, TurnOrigin, TurnStatus, TurnStep,
};

/// How many turns the registry retains.
pub const DEFAULT_TURN_CAPACITY: usize = 100;

/// What `GET /api/response/<id>` reports about a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseView {
    NotFound,
    Pending,
    Disabled,
    Failed { error: String },
    CompletedText { response: String },
    CompletedAudio { response: String, audio_url: String },
}

struct TurnsInner {
    turns: HashMap<TurnId, Turn>,
    /// Newest first.
    order: VecDeque<TurnId>,
}

pub struct TurnStore {
    inner: Mutex<TurnsInner>,
    capacity: usize,
}

impl TurnStore {
    pub fn new(capacity: usize) -> Self {
        TurnStore {
            inner: Mutex::new(TurnsInner {
                turns: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    /// Create and register a new turn.
    pub fn create(&self, origin: TurnOrigin, response_mode: ResponseMode) -> Turn {
        let turn = Turn::new(origin, response_mode);
        let mut inner = self.inner.lock().expect("turn store lock poisoned");
        inner.order.push_front(turn.id.clone());
        inner.turns.insert(turn.id.clone(), turn.clone());
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_back() {
                inner.turns.remove(&evicted);
            }
        }
        turn
    }

    /// Run a closure against a turn, if it exists.
    pub fn with_turn<R>(&self, id: &TurnId, f: impl FnOnce(&mut Turn) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("turn store lock poisoned");
        inner.turns.get_mut(id).map(f)
    }

    pub fn get(&self, id: &TurnId) -> Option<Turn> {
        let inner = self.inner.lock().expect("turn store lock poisoned");
        inner.turns.get(id).cloned()
    }

    /// Recent turns, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Turn> {
        let inner = self.inner.lock().expect("turn store lock poisoned");
        inner
            .order
            .iter()
            .take(limit)
            .filter_map(|id| inner.turns.get(id).cloned())
            .collect()
    }

    /// Append a timeline step.
    pub fn push_step(&self, id: &TurnId, step: TurnStep) {
        self.with_turn(id, |turn| turn.push_step(step));
    }

    /// Update the most recent step with the given name.
    pub fn update_step(&self, id: &TurnId, name: &str, f: impl FnOnce(&mut TurnStep)) {
        self.with_turn(id, |turn| turn.update_step(name, f));
    }

    /// Mark a turn failed with an error note, unless it already settled.
    pub fn fail(&self, id: &TurnId, error: &str) {
        self.with_turn(id, |turn| {
            if !turn.status.is_terminal() {
                turn.status = TurnStatus::Failed;
                turn.error = Some(error.to_string());
                turn.push_step(
                    TurnStep::new("error", "Error", StepStatus::Error).with_detail(error),
                );
            }
        });
    }

    /// Remove a turn entirely (e.g. a duplicate rejected at intake).
    pub fn remove(&self, id: &TurnId) -> bool {
        let mut inner = self.inner.lock().expect("turn store lock poisoned");
        inner.order.retain(|t| t != id);
        inner.turns.remove(id).is_some()
    }

    /// Record the operator's acknowledgement. Returns the updated turn.
    pub fn ack(&self, id: &TurnId) -> Option<Turn> {
        self.with_turn(id, |turn| {
            if !turn.acknowledged {
                turn.acknowledged = true;
                if turn.status == TurnStatus::Speaking {
                    turn.status = TurnStatus::Completed;
                }
                turn.push_step(
                    TurnStep::new("acknowledged", "Client Received", StepStatus::Completed)
                        .with_detail("confirmed by client"),
                );
            }
            turn.clone()
        })
    }

    /// Derive the response view served by `GET /api/response/<id>`.
    pub fn response_view(&self, id: &TurnId) -> ResponseView {
        let inner = self.inner.lock().expect("turn store lock poisoned");
        let Some(turn) = inner.turns.get(id) else {
            return ResponseView::NotFound;
        };
        match turn.status {
            TurnStatus::Pending => ResponseView::Pending,
            TurnStatus::Aborted | TurnStatus::Failed => ResponseView::Failed {
                error: turn
                    .error
                    .clone()
                    .unwrap_or_else(|| "turn did not complete".to_string()),
            },
            TurnStatus::Speaking | TurnStatus::Completed => {
                if turn.response_mode == ResponseMode::Disabled {
                    return ResponseView::Disabled;
                }
                let response = turn.response_text.clone().unwrap_or_default();
                match &turn.audio_artifact_id {
                    Some(artifact) => ResponseView::CompletedAudio {
                        response,
                        audio_url: format!("/api/audio/{artifact}"),
                    },
                    None => ResponseView::CompletedText { response },
                }
            }
        }
    }
}

impl Default for TurnStore {
    fn default() -> Self {
        TurnStore::new(DEFAULT_TURN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_registers_newest_first() {
        let store = TurnStore::default();
        let a = store.create(TurnOrigin::Voice, ResponseMode::Text);
        let b = store.create(TurnOrigin::Text, ResponseMode::Text);

        let recent = store.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, b.id);
        assert_eq!(recent[1].id, a.id);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = TurnStore::new(2);
        let a = store.create(TurnOrigin::Text, ResponseMode::Text);
        let _b = store.create(TurnOrigin::Text, ResponseMode::Text);
        let _c = store.create(TurnOrigin::Text, ResponseMode::Text);

        assert!(store.get(&a.id).is_none());
        assert_eq!(store.recent(10).len(), 2);
    }

    #[test]
    fn response_view_transitions() {
        let store = TurnStore::default();
        let turn = store.create(TurnOrigin::Text, ResponseMode::Text);

        assert_eq!(store.response_view(&turn.id), ResponseView::Pending);

        store.with_turn(&turn.id, |t| {
            t.status = TurnStatus::Completed;
            t.response_text = Some("hi".into());
        });
        assert_eq!(
            store.response_view(&turn.id),
            ResponseView::CompletedText {
                response: "hi".into()
            }
        );

        assert_eq!(
            store.response_view(&TurnId::new("missing0")),
            ResponseView::NotFound
        );
    }

    #[test]
    fn response_view_audio_and_disabled() {
        let store = TurnStore::default();
        let audio = store.create(TurnOrigin::Voice, ResponseMode::Audio);
        store.with_turn(&audio.id, |t| {
            t.status = TurnStatus::Speaking;
            t.response_text = Some("spoken".into());
            t.audio_artifact_id = Some(t.id.clone());
        });
        assert_eq!(
            store.response_view(&audio.id),
            ResponseView::CompletedAudio {
                response: "spoken".into(),
                audio_url: format!("/api/audio/{}", audio.id),
            }
        );

        let muted = store.create(TurnOrigin::Text, ResponseMode::Disabled);
        store.with_turn(&muted.id, |t| t.status = TurnStatus::Completed);
        assert_eq!(store.response_view(&muted.id), ResponseView::Disabled);
    }

    #[test]
    fn fail_is_sticky_after_terminal() {
        let store = TurnStore::default();
        let turn = store.create(TurnOrigin::Text, ResponseMode::Text);
        store.with_turn(&turn.id, |t| t.status = TurnStatus::Completed);
        store.fail(&turn.id, "too late");
        assert_eq!(store.get(&turn.id).unwrap().status, TurnStatus::Completed);
    }

    #[test]
    fn ack_settles_speaking_turn() {
        let store = TurnStore::default();
        let turn = store.create(TurnOrigin::Voice, ResponseMode::Audio);
        store.with_turn(&turn.id, |t| t.status = TurnStatus::Speaking);

        let acked = store.ack(&turn.id).unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.status, TurnStatus::Completed);
        // Idempotent: a second ack does not add another step.
        let steps = store.get(&turn.id).unwrap().steps.len();
        store.ack(&turn.id);
        assert_eq!(store.get(&turn.id).unwrap().steps.len(), steps);
    }
}

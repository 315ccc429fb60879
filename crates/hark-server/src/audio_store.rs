//! Write-once keyed store of synthesized audio.
//!
//! Artifacts live in memory, keyed by the originating turn id, and are
//! reclaimed on acknowledgement or after a TTL, whichever comes first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hark_types::{RelayError, TurnId};

/// Default artifact time-to-live.
pub const DEFAULT_ARTIFACT_TTL: Duration = Duration::from_secs(600);

struct StoredArtifact {
    bytes: Arc<Vec<u8>>,
    mime: String,
    created_at: Instant,
}

pub struct AudioStore {
    inner: Mutex<HashMap<TurnId, StoredArtifact>>,
    ttl: Duration,
}

impl AudioStore {
    pub fn new(ttl: Duration) -> Self {
        AudioStore {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Store an artifact. Write-once: a second `put` for the same id fails
    /// with [`RelayError::Conflict`].
    pub fn put(&self, id: &TurnId, bytes: Vec<u8>, mime: &str) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().expect("audio store lock poisoned");
        if inner.contains_key(id) {
            return Err(RelayError::Conflict(format!(
                "artifact {id} already exists"
            )));
        }
        tracing::debug!(id = %id, bytes = bytes.len(), mime, "stored audio artifact");
        inner.insert(
            id.clone(),
            StoredArtifact {
                bytes: Arc::new(bytes),
                mime: mime.to_string(),
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Fetch an artifact's bytes and MIME type.
    pub fn get(&self, id: &TurnId) -> Option<(Arc<Vec<u8>>, String)> {
        let inner = self.inner.lock().expect("audio store lock poisoned");
        inner
            .get(id)
            .map(|artifact| (Arc::clone(&artifact.bytes), artifact.mime.clone()))
    }

    /// Drop an artifact. Returns whether it existed.
    pub fn remove(&self, id: &TurnId) -> bool {
        let mut inner = self.inner.lock().expect("audio store lock poisoned");
        let removed = inner.remove(id).is_some();
        if removed {
            tracing::debug!(id = %id, "dropped audio artifact");
        }
        removed
    }

    /// Drop artifacts older than the TTL, returning their ids so callers
    /// can settle the owning turns.
    pub fn reap(&self) -> Vec<TurnId> {
        let mut inner = self.inner.lock().expect("audio store lock poisoned");
        let expired: Vec<TurnId> = inner
            .iter()
            .filter(|(_, a)| a.created_at.elapsed() >= self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
            tracing::info!(id = %id, "reaped expired audio artifact");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("audio store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AudioStore {
    fn default() -> Self {
        AudioStore::new(DEFAULT_ARTIFACT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let store = AudioStore::default();
        let id = TurnId::new("ab12cd34");
        store.put(&id, vec![1, 2, 3], "audio/mpeg").unwrap();

        let (bytes, mime) = store.get(&id).unwrap();
        assert_eq!(*bytes, vec![1, 2, 3]);
        assert_eq!(mime, "audio/mpeg");

        assert!(store.remove(&id));
        assert!(store.get(&id).is_none());
        assert!(!store.remove(&id));
    }

    #[test]
    fn put_is_write_once() {
        let store = AudioStore::default();
        let id = TurnId::new("ab12cd34");
        store.put(&id, vec![1], "audio/mpeg").unwrap();
        match store.put(&id, vec![2], "audio/mpeg") {
            Err(RelayError::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
        // The original bytes are untouched.
        assert_eq!(*store.get(&id).unwrap().0, vec![1]);
    }

    #[test]
    fn reap_drops_only_expired() {
        let store = AudioStore::new(Duration::from_millis(20));
        let old = TurnId::new("old00000");
        store.put(&old, vec![1], "audio/mpeg").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let fresh = TurnId::new("fresh000");
        store.put(&fresh, vec![2], "audio/mpeg").unwrap();

        let reaped = store.reap();
        assert_eq!(reaped, vec![old]);
        assert!(store.get(&fresh).is_some());
        assert_eq!(store.len(), 1);
    }
}

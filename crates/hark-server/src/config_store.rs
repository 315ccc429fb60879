//! Live relay configuration with atomic patching.
//!
//! Readers see one version or the next, never a half-updated struct;
//! changes apply to future turns only.

use std::sync::RwLock;

use hark_types::{ConfigPatch, RelayConfig};

pub struct ConfigStore {
    inner: RwLock<RelayConfig>,
}

impl ConfigStore {
    pub fn new(config: RelayConfig) -> Self {
        ConfigStore {
            inner: RwLock::new(config),
        }
    }

    /// Snapshot the current configuration.
    pub fn get(&self) -> RelayConfig {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Validate and apply a patch atomically. On failure nothing changes
    /// and every offending field is named.
    pub fn patch(&self, patch: &ConfigPatch) -> Result<RelayConfig, Vec<String>> {
        let mut config = self.inner.write().expect("config lock poisoned");
        config.apply_patch(patch)?;
        tracing::info!(
            stt_model = %config.stt_model,
            language = %config.stt_language,
            response_mode = %config.response_mode,
            "configuration updated"
        );
        Ok(config.clone())
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        ConfigStore::new(RelayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_is_atomic() {
        let store = ConfigStore::default();
        let bad = ConfigPatch {
            stt_model: Some("nova-2".into()),
            stt_language: Some("nope".into()),
            ..ConfigPatch::default()
        };
        assert!(store.patch(&bad).is_err());
        // The valid half of the failed patch must not have been applied.
        assert_eq!(store.get().stt_model, "nova-3");

        let good = ConfigPatch {
            stt_model: Some("nova-2".into()),
            ..ConfigPatch::default()
        };
        let updated = store.patch(&good).unwrap();
        assert_eq!(updated.stt_model, "nova-2");
        assert_eq!(store.get().stt_model, "nova-2");
    }

    #[test]
    fn get_then_patch_with_same_body_is_identity() {
        let store = ConfigStore::default();
        let before = store.get();
        let patch = ConfigPatch {
            stt_model: Some(before.stt_model.clone()),
            stt_language: Some(before.stt_language.clone()),
            smart_format: Some(before.smart_format),
            punctuate: Some(before.punctuate),
            response_mode: Some(before.response_mode.as_str().to_string()),
            tts_voice: Some(before.tts_voice.clone()),
            tts_max_chars: Some(before.tts_max_chars),
            agent_model: Some(before.agent_model.clone()),
        };
        let after = store.patch(&patch).unwrap();
        assert_eq!(after, before);
    }
}

//! Relay configuration: the operator-tunable settings, their legal value
//! sets, and the process-level settings read from the environment.

use serde::{Deserialize, Serialize};

/// Process exit code for a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Process exit code when required configuration is missing or invalid.
pub const EXIT_CONFIG: i32 = 64;
/// Process exit code when the child keeps crashing across restarts.
pub const EXIT_CHILD_FAILURE: i32 = 70;

/// Default HTTP API port.
pub const DEFAULT_PORT_HTTP: u16 = 5566;
/// Default WebSocket port.
pub const DEFAULT_PORT_WS: u16 = 5567;

/// STT models accepted by the config endpoint.
pub const STT_MODELS: &[&str] = &["nova-3", "nova-2", "nova", "enhanced", "base"];
/// Languages accepted by the config endpoint.
pub const STT_LANGUAGES: &[&str] = &["en-US", "pl"];
/// TTS voices accepted by the config endpoint.
pub const TTS_VOICES: &[&str] = &["aura-asteria-en", "aura-orion-en", "aura-luna-en"];

/// How the relay answers the originating client after a turn completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// No response payload is produced; events still fan out.
    #[default]
    Disabled,
    /// The response text is served via `/api/response/<id>`.
    Text,
    /// The response is additionally synthesized to audio.
    Audio,
}

impl ResponseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseMode::Disabled => "disabled",
            ResponseMode::Text => "text",
            ResponseMode::Audio => "audio",
        }
    }

    /// Parse a wire value. Returns `None` for anything unrecognised.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(ResponseMode::Disabled),
            "text" => Some(ResponseMode::Text),
            "audio" => Some(ResponseMode::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-tunable settings. Changes apply to future turns only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// STT model identifier.
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    /// STT language tag.
    #[serde(default = "default_stt_language")]
    pub stt_language: String,
    /// Apply provider-side formatting to transcripts.
    #[serde(default = "default_true")]
    pub smart_format: bool,
    /// Apply provider-side punctuation to transcripts.
    #[serde(default = "default_true")]
    pub punctuate: bool,
    /// Default response mode for turns that do not override it.
    #[serde(default)]
    pub response_mode: ResponseMode,
    /// TTS voice identifier.
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    /// TTS input cap, in codepoints.
    #[serde(default = "default_tts_max_chars")]
    pub tts_max_chars: usize,
    /// Optional model override forwarded to the child on (re)launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_model: Option<String>,
}

fn default_stt_model() -> String {
    "nova-3".to_string()
}

fn default_stt_language() -> String {
    "en-US".to_string()
}

fn default_tts_voice() -> String {
    "aura-asteria-en".to_string()
}

fn default_tts_max_chars() -> usize {
    1500
}

fn default_true() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            stt_model: default_stt_model(),
            stt_language: default_stt_language(),
            smart_format: true,
            punctuate: true,
            response_mode: ResponseMode::default(),
            tts_voice: default_tts_voice(),
            tts_max_chars: default_tts_max_chars(),
            agent_model: None,
        }
    }
}

/// A partial update to [`RelayConfig`]. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub stt_model: Option<String>,
    pub stt_language: Option<String>,
    pub smart_format: Option<bool>,
    pub punctuate: Option<bool>,
    pub response_mode: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_max_chars: Option<usize>,
    /// `Some(None)` clears the override; absent leaves it unchanged.
    pub agent_model: Option<Option<String>>,
}

impl RelayConfig {
    /// Validate a patch and apply it atomically.
    ///
    /// On any validation failure nothing is applied and every offending
    /// field is named in the returned error list.
    pub fn apply_patch(&mut self, patch: &ConfigPatch) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut next = self.clone();

        if let Some(model) = &patch.stt_model {
            if STT_MODELS.contains(&model.as_str()) {
                next.stt_model = model.clone();
            } else {
                errors.push(format!("invalid model: {model}"));
            }
        }
        if let Some(language) = &patch.stt_language {
            if STT_LANGUAGES.contains(&language.as_str()) {
                next.stt_language = language.clone();
            } else {
                errors.push(format!("invalid language: {language}"));
            }
        }
        if let Some(smart_format) = patch.smart_format {
            next.smart_format = smart_format;
        }
        if let Some(punctuate) = patch.punctuate {
            next.punctuate = punctuate;
        }
        if let Some(mode) = &patch.response_mode {
            match ResponseMode::parse(mode) {
                Some(parsed) => next.response_mode = parsed,
                None => errors.push(format!("invalid response_mode: {mode}")),
            }
        }
        if let Some(voice) = &patch.tts_voice {
            if TTS_VOICES.contains(&voice.as_str()) {
                next.tts_voice = voice.clone();
            } else {
                errors.push(format!("invalid voice: {voice}"));
            }
        }
        if let Some(max_chars) = patch.tts_max_chars {
            if max_chars == 0 {
                errors.push("tts_max_chars must be positive".to_string());
            } else {
                next.tts_max_chars = max_chars;
            }
        }
        if let Some(agent_model) = &patch.agent_model {
            next.agent_model = agent_model.clone();
        }

        if errors.is_empty() {
            *self = next;
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Process-level settings resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Credential for the STT/TTS provider.
    pub stt_api_key: String,
    /// Node identities allowed to connect; empty disables the gate.
    pub allowed_nodes: Vec<String>,
    pub port_http: u16,
    pub port_ws: u16,
    /// Child working directory (CLI arg wins over `WORK_DIR`).
    pub work_dir: Option<std::path::PathBuf>,
}

impl ServerSettings {
    /// Read settings from the environment.
    ///
    /// Returns an error message naming the problem when a required value is
    /// missing or malformed; the caller exits with [`EXIT_CONFIG`].
    pub fn from_env() -> Result<Self, String> {
        let stt_api_key = std::env::var("STT_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| "STT_API_KEY environment variable is not set".to_string())?;

        let allowed_nodes = std::env::var("ALLOWED_NODES")
            .unwrap_or_default()
            .split(',')
            .map(|n| n.trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();

        let port_http = read_port("PORT_HTTP", DEFAULT_PORT_HTTP)?;
        let port_ws = read_port("PORT_WS", DEFAULT_PORT_WS)?;

        let work_dir = std::env::var("WORK_DIR").ok().map(std::path::PathBuf::from);

        Ok(ServerSettings {
            stt_api_key,
            allowed_nodes,
            port_http,
            port_ws,
            work_dir,
        })
    }
}

fn read_port(var: &str, default: u16) -> Result<u16, String> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("{var} is not a valid port: {raw:?}")),
        Err(_) => Ok(default),
    }
}

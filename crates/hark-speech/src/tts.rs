//! Text-to-speech client.
//!
//! Posts `{"text": …}` to the provider's `/v1/speak` endpoint and returns
//! the raw audio bytes (MP3). Input is truncated to the configured codepoint
//! cap before the call; the provider rejects oversized bodies.

use serde::Serialize;

use crate::{truncate_codepoints, validate_endpoint_url, SpeechError, SpeechResult};

/// Default provider API base.
const DEFAULT_BASE_URL: &str = "https://api.deepgram.com";

/// Request body for the speak endpoint.
#[derive(Debug, Serialize)]
struct SpeakRequest<'a> {
    text: &'a str,
}

/// Text-to-speech client.
pub struct TtsClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TtsClient {
    /// Create a client against the default provider endpoint.
    pub fn new(api_key: String) -> Self {
        TtsClient {
            client: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create a client against a custom base URL (validated).
    pub fn with_base_url(api_key: String, base_url: &str) -> SpeechResult<Self> {
        let validated = validate_endpoint_url(base_url)?;
        Ok(TtsClient {
            client: reqwest::Client::new(),
            api_key,
            base_url: validated.to_string().trim_end_matches('/').to_string(),
        })
    }

    /// Synthesize `text` with the given voice, returning MP3 bytes.
    ///
    /// `max_chars` caps the input in codepoints; longer text is truncated
    /// with an ellipsis before synthesis.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        max_chars: usize,
    ) -> SpeechResult<Vec<u8>> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SpeechError::EmptyText);
        }
        let capped = truncate_codepoints(trimmed, max_chars);

        tracing::debug!(
            voice = voice,
            text_chars = capped.chars().count(),
            "sending text to TTS provider"
        );

        let url = format!("{}/v1/speak", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("model", voice)])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&SpeakRequest { text: &capped })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(SpeechError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let audio = response.bytes().await?.to_vec();
        tracing::debug!(bytes = audio.len(), "received synthesized audio");
        Ok(audio)
    }
}

//! Speech-to-text client.
//!
//! Single POST of the raw audio body to the provider's `/v1/listen`
//! endpoint. Transcription options ride as query parameters. One retry on
//! transport failure; provider error statuses are surfaced, never retried.

use serde::Deserialize;

use hark_types::RelayConfig;

use crate::{validate_endpoint_url, AudioFormat, SpeechError, SpeechResult};

/// Default provider API base.
const DEFAULT_BASE_URL: &str = "https://api.deepgram.com";

/// Per-request transcription options, snapshotted from the live config.
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub model: String,
    pub language: String,
    pub smart_format: bool,
    pub punctuate: bool,
}

impl From<&RelayConfig> for TranscribeOptions {
    fn from(config: &RelayConfig) -> Self {
        TranscribeOptions {
            model: config.stt_model.clone(),
            language: config.stt_language.clone(),
            smart_format: config.smart_format,
            punctuate: config.punctuate,
        }
    }
}

/// Provider response shape: the transcript of the best alternative of the
/// first channel is the one we keep.
#[derive(Debug, Deserialize)]
struct ListenResponse {
    results: Option<ListenResults>,
}

#[derive(Debug, Deserialize)]
struct ListenResults {
    #[serde(default)]
    channels: Vec<ListenChannel>,
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    #[serde(default)]
    alternatives: Vec<ListenAlternative>,
}

#[derive(Debug, Deserialize)]
struct ListenAlternative {
    #[serde(default)]
    transcript: String,
}

/// Speech-to-text client.
pub struct SttClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl SttClient {
    /// Create a client against the default provider endpoint.
    pub fn new(api_key: String) -> Self {
        SttClient {
            client: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create a client against a custom base URL (validated). Tests point
    /// this at a local mock server.
    pub fn with_base_url(api_key: String, base_url: &str) -> SpeechResult<Self> {
        let validated = validate_endpoint_url(base_url)?;
        Ok(SttClient {
            client: reqwest::Client::new(),
            api_key,
            base_url: validated.to_string().trim_end_matches('/').to_string(),
        })
    }

    /// Transcribe an audio body. Returns the transcript, which may be empty
    /// when no speech was detected.
    pub async fn transcribe(
        &self,
        audio: &[u8],
        format: AudioFormat,
        opts: &TranscribeOptions,
    ) -> SpeechResult<String> {
        if audio.is_empty() {
            return Err(SpeechError::EmptyAudio);
        }

        tracing::debug!(
            model = %opts.model,
            language = %opts.language,
            format = %format,
            audio_bytes = audio.len(),
            "sending audio to STT provider"
        );

        // One retry on transport failure. A response with an error status is
        // a provider answer and is not retried.
        let response = match self.listen_once(audio, format, opts).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "STT request failed, retrying once");
                self.listen_once(audio, format, opts).await?
            }
        };

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

        let body: ListenResponse = response
            .json()
            .await
            .map_err(|e| SpeechError::MalformedResponse(format!("listen response: {e}")))?;
        let transcript = body
            .results
            .and_then(|r| r.channels.into_iter().next())
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default();
        Ok(transcript.trim().to_string())
    }

    async fn listen_once(
        &self,
        audio: &[u8],
        format: AudioFormat,
        opts: &TranscribeOptions,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}/v1/listen", self.base_url);
        let query = [
            ("model", opts.model.as_str()),
            ("language", opts.language.as_str()),
            ("smart_format", bool_str(opts.smart_format)),
            ("punctuate", bool_str(opts.punctuate)),
        ];
        self.client
            .post(&url)
            .query(&query)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", format.mime_type())
            .body(audio.to_vec())
            .send()
            .await
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn opts() -> TranscribeOptions {
        TranscribeOptions {
            model: "nova-3".into(),
            language: "en-US".into(),
            smart_format: true,
            punctuate: true,
        }
    }

    fn listen_body(transcript: &str) -> serde_json::Value {
        serde_json::json!({
            "results": {
                "channels": [
                    {"alternatives": [{"transcript": transcript, "confidence": 0.98}]}
                ]
            }
        })
    }

    #[tokio::test]
    async fn transcribe_sends_options_and_parses_transcript() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/listen"))
            .and(query_param("model", "nova-3"))
            .and(query_param("language", "en-US"))
            .and(query_param("smart_format", "true"))
            .and(query_param("punctuate", "true"))
            .and(header("Authorization", "Token dg-test"))
            .and(header("Content-Type", "audio/mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listen_body("open the pod bay doors")))
            .expect(1)
            .mount(&server)
            .await;

        let client = SttClient::with_base_url("dg-test".into(), &server.uri()).unwrap();
        let transcript = client
            .transcribe(b"\x00\x00\x00\x14ftypM4A ", AudioFormat::M4a, &opts())
            .await
            .unwrap();
        assert_eq!(transcript, "open the pod bay doors");
    }

    #[tokio::test]
    async fn provider_4xx_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/listen"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"err_msg":"unsupported encoding"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = SttClient::with_base_url("dg-test".into(), &server.uri()).unwrap();
        let err = client
            .transcribe(b"RIFF\x00\x00\x00\x00WAVE", AudioFormat::Wav, &opts())
            .await
            .unwrap_err();
        match err {
            SpeechError::Api { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("unsupported encoding"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_results_yields_empty_transcript() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/listen"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = SttClient::with_base_url("dg-test".into(), &server.uri()).unwrap();
        let transcript = client
            .transcribe(b"RIFF\x00\x00\x00\x00WAVE", AudioFormat::Wav, &opts())
            .await
            .unwrap();
        assert_eq!(transcript, "");
    }

    #[tokio::test]
    async fn empty_audio_rejected_before_any_request() {
        let client = SttClient::with_base_url("dg-test".into(), "http://127.0.0.1:1").unwrap();
        assert!(matches!(
            client.transcribe(b"", AudioFormat::Wav, &opts()).await,
            Err(SpeechError::EmptyAudio)
        ));
    }

    #[tokio::test]
    async fn transport_failure_surfaces_after_retry() {
        // Nothing listens on this port; both attempts fail at connect time.
        let client = SttClient::with_base_url("dg-test".into(), "http://127.0.0.1:9").unwrap();
        let err = client
            .transcribe(b"RIFF\x00\x00\x00\x00WAVE", AudioFormat::Wav, &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::Http(_)));
    }

    #[test]
    fn options_snapshot_from_config() {
        let config = RelayConfig::default();
        let opts = TranscribeOptions::from(&config);
        assert_eq!(opts.model, config.stt_model);
        assert_eq!(opts.language, config.stt_language);
        assert!(opts.smart_format);
        assert!(opts.punctuate);
    }
}

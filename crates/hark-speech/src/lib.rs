//! Speech-to-text and text-to-speech adapter.
//!
//! Both directions are single bounded HTTP calls against the provider's API:
//! [`stt::SttClient::transcribe`] posts raw audio to `/v1/listen`,
//! [`tts::TtsClient::synthesize`] posts text to `/v1/speak`. Neither call
//! runs on the event bus or aggregator tasks; callers own the spawning.
//!
//! Audio formats are detected from magic bytes, never from extensions or
//! client-supplied content types.

pub mod stt;
pub mod tts;

use std::net::IpAddr;

use url::Url;

/// Errors from the speech adapter.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// The audio body was empty.
    #[error("audio data is empty")]
    EmptyAudio,

    /// The audio magic bytes match no supported container.
    #[error("unrecognized audio format")]
    UnknownFormat,

    /// Text was empty after trimming.
    #[error("text is empty")]
    EmptyText,

    /// The provider returned a non-success status.
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Transport-level failure (connect, timeout, TLS).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body did not parse as expected.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// Endpoint URL failed validation.
    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
}

impl SpeechError {
    /// Upstream HTTP status, when the provider answered at all.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            SpeechError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convenience alias for speech results.
pub type SpeechResult<T> = Result<T, SpeechError>;

/// Recognized audio formats, detected by magic byte inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// MP3: frame sync or ID3 tag.
    Mp3,
    /// WAV: RIFF container with `WAVE` chunk.
    Wav,
    /// M4A/AAC: ISO Base Media File Format with `ftyp` box.
    M4a,
    /// Format not recognized; rejected by validation.
    Unknown,
}

impl AudioFormat {
    /// Detect the format from the first bytes of data.
    pub fn detect(data: &[u8]) -> AudioFormat {
        // MP3 with ID3 tag
        if data.len() >= 3 && data[..3] == *b"ID3" {
            return AudioFormat::Mp3;
        }
        // MP3 frame sync: 0xFF followed by three set bits, excluding the
        // reserved MPEG version.
        if data.len() >= 2 && data[0] == 0xFF && (data[1] & 0xE0) == 0xE0 {
            let version_bits = (data[1] >> 3) & 0x03;
            if version_bits != 0x01 {
                return AudioFormat::Mp3;
            }
        }
        // WAV: RIFF container with WAVE chunk
        if data.len() >= 12 && data[..4] == *b"RIFF" && data[8..12] == *b"WAVE" {
            return AudioFormat::Wav;
        }
        // M4A (ISO BMFF): 'ftyp' box at offset 4
        if data.len() >= 8 && data[4..8] == *b"ftyp" {
            return AudioFormat::M4a;
        }
        AudioFormat::Unknown
    }

    /// MIME type for the upload's Content-Type header.
    pub fn mime_type(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::M4a => "audio/mp4",
            AudioFormat::Unknown => "application/octet-stream",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::M4a => "m4a",
            AudioFormat::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate that audio data is non-empty and a recognized format.
pub fn validate_audio(data: &[u8]) -> SpeechResult<AudioFormat> {
    if data.is_empty() {
        return Err(SpeechError::EmptyAudio);
    }
    match AudioFormat::detect(data) {
        AudioFormat::Unknown => Err(SpeechError::UnknownFormat),
        format => Ok(format),
    }
}

/// Truncate text to `max_chars` codepoints, appending an ellipsis when cut.
pub fn truncate_codepoints(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Validate a provider endpoint base URL.
///
/// HTTPS is required except for loopback hosts, which tests and local
/// gateways use.
pub fn validate_endpoint_url(url_str: &str) -> SpeechResult<Url> {
    let url = Url::parse(url_str)
        .map_err(|e| SpeechError::InvalidEndpoint(format!("failed to parse URL: {e}")))?;

    let host = url.host_str().unwrap_or("");
    if host.is_empty() {
        return Err(SpeechError::InvalidEndpoint("URL has no host".to_string()));
    }

    let is_loopback = host == "localhost"
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false);

    match url.scheme() {
        "https" => {}
        "http" if is_loopback => {}
        scheme => {
            return Err(SpeechError::InvalidEndpoint(format!(
                "scheme {scheme:?} is not allowed for host {host:?}"
            )));
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_wav() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"RIFF");
        data.extend_from_slice(&[0x00; 4]);
        data.extend_from_slice(b"WAVE");
        data
    }

    fn minimal_m4a() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&20u32.to_be_bytes());
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(b"M4A ");
        data.extend_from_slice(&0u32.to_be_bytes());
        data
    }

    #[test]
    fn detects_mp3_variants() {
        assert_eq!(AudioFormat::detect(b"ID3\x03\x00\x00\x00"), AudioFormat::Mp3);
        assert_eq!(AudioFormat::detect(&[0xFF, 0xFB, 0x90, 0x00]), AudioFormat::Mp3);
    }

    #[test]
    fn detects_wav_and_m4a() {
        assert_eq!(AudioFormat::detect(&minimal_wav()), AudioFormat::Wav);
        assert_eq!(AudioFormat::detect(&minimal_m4a()), AudioFormat::M4a);
    }

    #[test]
    fn unknown_bytes_rejected() {
        assert_eq!(AudioFormat::detect(&[0x00, 0x01, 0x02]), AudioFormat::Unknown);
        assert!(matches!(
            validate_audio(&[0x42, 0x42, 0x42, 0x42]),
            Err(SpeechError::UnknownFormat)
        ));
    }

    #[test]
    fn empty_audio_rejected() {
        assert!(matches!(validate_audio(b""), Err(SpeechError::EmptyAudio)));
    }

    #[test]
    fn truncate_counts_codepoints_not_bytes() {
        // Multibyte characters must not be split.
        let text = "żółć".repeat(10); // 40 codepoints
        let cut = truncate_codepoints(&text, 8);
        assert_eq!(cut.chars().count(), 8 + 3);
        assert!(cut.ends_with("..."));

        let short = truncate_codepoints("hello", 1500);
        assert_eq!(short, "hello");
    }

    #[test]
    fn endpoint_validation() {
        assert!(validate_endpoint_url("https://api.deepgram.com").is_ok());
        assert!(validate_endpoint_url("http://127.0.0.1:9999").is_ok());
        assert!(validate_endpoint_url("http://localhost:9999").is_ok());
        assert!(validate_endpoint_url("http://api.deepgram.com").is_err());
        assert!(validate_endpoint_url("ftp://api.deepgram.com").is_err());
        assert!(validate_endpoint_url("not-a-url").is_err());
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification used by both the orchestrator and the raw text/OCR paths
/// to decide allocator release semantics, blocked-sets, and terminal error
/// codes. Auth and rate-limit are checked via status code, timeout via
/// status code or a small set of marker substrings, everything else falls
/// through to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    RateLimit,
    Timeout,
    Other,
}

impl ErrorKind {
    pub fn classify(status: Option<u16>, body_or_message: &str) -> Self {
        let lower = body_or_message.to_ascii_lowercase();
        match status {
            Some(401) | Some(403) => return ErrorKind::Auth,
            Some(429) => return ErrorKind::RateLimit,
            Some(504) => return ErrorKind::Timeout,
            _ => {}
        }
        if lower.contains("quota exceeded") || lower.contains("resource exhausted") {
            return ErrorKind::RateLimit;
        }
        if lower.contains("deadline exceeded") || lower.contains("timed out") {
            return ErrorKind::Timeout;
        }
        if lower.contains("permission denied") || lower.contains("unauthorized") || lower.contains("api key not valid") {
            return ErrorKind::Auth;
        }
        ErrorKind::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Other => "other",
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {summary}")]
    Status { status: u16, summary: String, kind: ErrorKind },
}

impl UpstreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::Transport(msg) => {
                if msg.to_ascii_lowercase().contains("timed out") {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Other
                }
            }
            UpstreamError::Status { kind, .. } => *kind,
        }
    }

    /// Trims a provider error string for caller-facing display: the error
    /// handling design caps surfaced summaries at 220 characters and never
    /// lets a raw key leak into the text.
    pub fn trimmed_summary(&self) -> String {
        let raw = self.to_string();
        if raw.len() <= 220 {
            raw
        } else {
            format!("{}...", &raw[..217])
        }
    }
}

fn status_to_kind(status: u16, body: &str) -> ErrorKind {
    ErrorKind::classify(Some(status), body)
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakerVoice {
    pub speaker: String,
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineMapEntry {
    #[serde(rename = "lineIndex")]
    pub line_index: usize,
    pub speaker: String,
    pub text: String,
}

/// Outbound synthesis request. Both `voice_id` and `voiceName` are carried
/// per the design note on the dual-field quirk; upstream chooses whichever
/// it recognizes.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesizeRequest {
    pub text: String,
    #[serde(rename = "voiceId", skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(rename = "voiceName", skip_serializing_if = "Option::is_none")]
    pub voice_name: Option<String>,
    #[serde(rename = "speakerVoices", skip_serializing_if = "Option::is_none")]
    pub speaker_voices: Option<Vec<SpeakerVoice>>,
    #[serde(rename = "lineMap", skip_serializing_if = "Option::is_none")]
    pub line_map: Option<Vec<LineMapEntry>>,
    pub structured: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructuredSynthesizeResponse {
    #[serde(rename = "wavBase64")]
    pub wav_base64: String,
    #[serde(rename = "lineChunks", default)]
    pub line_chunks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextGenerationRequest {
    #[serde(rename = "systemPrompt")]
    pub system_prompt: String,
    #[serde(rename = "userPrompt")]
    pub user_prompt: String,
    pub temperature: f32,
    #[serde(rename = "jsonMode")]
    pub json_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextGenerationResponse {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultimodalExtractionRequest {
    pub prompt: String,
    #[serde(rename = "mediaBase64")]
    pub media_base64: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultimodalExtractionResponse {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeHealth {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
}

impl RuntimeHealth {
    pub fn is_healthy(&self) -> bool {
        self.ok.unwrap_or(false) || self.status.as_deref() == Some("healthy")
    }
}

/// Thin typed wrapper over one engine runtime's HTTP surface. Timeouts are
/// computed per call from the caller's remaining acquisition budget rather
/// than fixed, so a near-expired request fails fast instead of blocking
/// past its deadline.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into() }
    }

    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_millis(2500))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp
                .json::<RuntimeHealth>()
                .await
                .map(|h| h.is_healthy())
                .unwrap_or(false),
            _ => false,
        }
    }

    pub async fn synthesize(
        &self,
        req: &SynthesizeRequest,
        timeout: Duration,
    ) -> Result<bytes::Bytes, UpstreamError> {
        let path = if req.structured { "/synthesize/structured" } else { "/synthesize" };
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(req)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let kind = status_to_kind(status, &body);
            return Err(UpstreamError::Status { status, summary: body, kind });
        }

        response
            .bytes()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))
    }

    pub async fn synthesize_structured(
        &self,
        req: &SynthesizeRequest,
        timeout: Duration,
    ) -> Result<StructuredSynthesizeResponse, UpstreamError> {
        let url = format!("{}/synthesize/structured", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(req)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let kind = status_to_kind(status, &body);
            return Err(UpstreamError::Status { status, summary: body, kind });
        }

        response
            .json()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))
    }

    pub async fn generate_text(
        &self,
        req: &TextGenerationRequest,
        timeout: Duration,
    ) -> Result<TextGenerationResponse, UpstreamError> {
        let url = format!("{}/generate", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(req)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let kind = status_to_kind(status, &body);
            return Err(UpstreamError::Status { status, summary: body, kind });
        }

        response
            .json()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))
    }

    pub async fn extract_multimodal(
        &self,
        req: &MultimodalExtractionRequest,
        timeout: Duration,
    ) -> Result<MultimodalExtractionResponse, UpstreamError> {
        let url = format!("{}/extract", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(req)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let kind = status_to_kind(status, &body);
            return Err(UpstreamError::Status { status, summary: body, kind });
        }

        response
            .json()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_markers() {
        assert_eq!(ErrorKind::classify(Some(401), ""), ErrorKind::Auth);
        assert_eq!(ErrorKind::classify(Some(429), ""), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::classify(Some(504), ""), ErrorKind::Timeout);
        assert_eq!(ErrorKind::classify(None, "Resource exhausted, try later"), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::classify(None, "Deadline exceeded"), ErrorKind::Timeout);
        assert_eq!(ErrorKind::classify(Some(500), "internal error"), ErrorKind::Other);
    }

    #[test]
    fn trims_long_summaries() {
        let err = UpstreamError::Status {
            status: 500,
            summary: "x".repeat(500),
            kind: ErrorKind::Other,
        };
        assert!(err.trimmed_summary().len() <= 223);
    }
}

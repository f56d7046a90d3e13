use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::allocator::Allocator;
use crate::audio_split::{split_int16_pcm_for_lines, SplitMode};
use crate::error::{GatewayError, GatewayResult};
use crate::upstream_clients::{
    ErrorKind, LineMapEntry, SpeakerVoice, SynthesizeRequest, UpstreamClient, UpstreamError,
};

/// The engine tag assigned to newly synthesized segments. The retired
/// `"XTTS"` literal is never produced here — it only ever survives as an
/// opaque value reproduced from a legacy report/error field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineTag {
    #[serde(rename = "GEM")]
    Gem,
    #[serde(rename = "KOKORO")]
    Kokoro,
}

impl EngineTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineTag::Gem => "GEM",
            EngineTag::Kokoro => "KOKORO",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LineInput {
    pub line_index: usize,
    pub speaker: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct SpeakerVoiceInput {
    pub speaker: String,
    pub voice_name: String,
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub speaker_voices: Vec<SpeakerVoiceInput>,
    pub line_map: Option<Vec<LineInput>>,
    pub studio_pair_groups_requested: bool,
    pub requested_concurrency: usize,
    pub target_voice: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub strategy: &'static str,
    pub concurrency_used: usize,
    pub split_mode: Option<&'static str>,
    pub silence_fallback: bool,
    pub realtime_factor_x: f64,
    pub target_met: bool,
}

#[derive(Debug, Clone)]
pub struct LineChunk {
    pub line_index: usize,
    pub engine: EngineTag,
    pub pcm: Vec<u8>,
}

pub struct SynthesisOutcome {
    pub wav: Vec<u8>,
    pub line_chunks: Vec<LineChunk>,
    pub diagnostics: Diagnostics,
}

const SAMPLE_RATE: u32 = 24_000;

/// Builds speaker-grouped requests, reassembles per-line audio, and falls
/// back across synthesis modes. Grounded on `video_dubbing/pipeline/stage6_tts.py`
/// and `backend/shared/gemini_multi_speaker.py`.
pub struct TtsOrchestrator {
    allocator: Arc<Allocator>,
    client: UpstreamClient,
    engine: EngineTag,
    max_words_per_request: usize,
    silence_bridge_ms: u64,
}

impl TtsOrchestrator {
    pub fn new(
        allocator: Arc<Allocator>,
        client: UpstreamClient,
        engine: EngineTag,
        max_words_per_request: usize,
        silence_bridge_ms: u64,
    ) -> Self {
        Self { allocator, client, engine, max_words_per_request, silence_bridge_ms }
    }

    pub async fn synthesize(&self, req: &SynthesisRequest) -> GatewayResult<SynthesisOutcome> {
        let start = Instant::now();

        let distinct_speakers = distinct_speakers(&req.line_map, &req.text);
        let word_count = req.text.split_whitespace().count();

        let (strategy, outcome) = if req.studio_pair_groups_requested
            && distinct_speakers.len() >= 2
            && req.line_map.as_ref().map(|m| m.len()).unwrap_or(0) >= 2
        {
            let line_map = req.line_map.as_ref().unwrap();
            if line_map_word_count(line_map) > self.max_words_per_request {
                ("line_map_word_windows", self.run_line_map_windows(req, line_map).await?)
            } else {
                ("studio_pair_groups", self.run_studio_pair_groups(req, line_map, 0).await?)
            }
        } else if distinct_speakers.len() > 2 && req.line_map.is_none() {
            ("text_order_two_speaker_windows", self.run_text_order_windows(req).await?)
        } else {
            if word_count > self.max_words_per_request {
                return Err(GatewayError::WordLimitExceeded);
            }
            ("legacy_single_window", self.run_legacy_single_window(req).await?)
        };

        let processing_sec = start.elapsed().as_secs_f64().max(0.001);
        let audio_duration_sec = outcome.wav_duration_sec();
        let realtime_factor_x = audio_duration_sec / processing_sec;

        Ok(SynthesisOutcome {
            wav: outcome.wav_bytes(),
            line_chunks: outcome.line_chunks,
            diagnostics: Diagnostics {
                strategy,
                concurrency_used: outcome.concurrency_used,
                split_mode: outcome.split_mode,
                silence_fallback: outcome.silence_fallback,
                realtime_factor_x,
                target_met: realtime_factor_x >= 150.0,
            },
        })
    }

    /// Strategy 1: partition speakers into groups of 2, synthesize each
    /// group's contiguous lines in parallel, reassemble by lineIndex.
    async fn run_studio_pair_groups(
        &self,
        req: &SynthesisRequest,
        line_map: &[LineInput],
        depth: usize,
    ) -> GatewayResult<RawOutcome> {
        let groups = build_studio_pair_groups(line_map, &req.speaker_voices, &req.target_voice);
        let concurrency = req
            .requested_concurrency
            .min(7)
            .min(groups.len().max(1))
            .min(self.allocator.key_pool_size().await.max(1));
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let mut tasks = Vec::new();
        for group in groups.clone() {
            let semaphore = semaphore.clone();
            let this = self;
            let req_clone = req.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                this.synthesize_group(&req_clone, &group).await
            });
        }

        let results = futures::future::join_all(tasks).await;
        let mut line_chunks: Vec<LineChunk> = Vec::new();
        for (idx, result) in results.into_iter().enumerate() {
            match result {
                Ok(chunks) => line_chunks.extend(chunks),
                Err(err) if err.kind() == ErrorKind::Other && depth == 0 => {
                    warn!(group = idx, "group synthesis failed, falling back to segmented mode");
                    let group = &groups[idx];
                    let fallback = self.synthesize_segmented(req, group).await?;
                    line_chunks.extend(fallback);
                }
                Err(err) => return Err(classify_to_gateway_error(&err)),
            }
        }
        line_chunks.sort_by_key(|c| c.line_index);

        let split_mode = Some("pause");
        Ok(RawOutcome {
            line_chunks,
            concurrency_used: concurrency,
            split_mode,
            silence_fallback: false,
        })
    }

    async fn synthesize_group(&self, req: &SynthesisRequest, group: &StudioPairGroup) -> Result<Vec<LineChunk>, UpstreamError> {
        let lease = self.acquire_lease(group.speakers.clone(), &group.text).await.map_err(|_| {
            UpstreamError::Status { status: 503, summary: "RUNTIME_SDK_UNAVAILABLE".into(), kind: ErrorKind::Other }
        })?;

        let synth_req = SynthesizeRequest {
            text: group.text.clone(),
            voice_id: Some(req.target_voice.clone()),
            voice_name: Some(req.target_voice.clone()),
            speaker_voices: Some(group.speaker_voices.clone()),
            line_map: Some(
                group
                    .lines
                    .iter()
                    .map(|l| LineMapEntry { line_index: l.line_index, speaker: l.speaker.clone(), text: l.text.clone() })
                    .collect(),
            ),
            structured: true,
        };

        let timeout = Duration::from_secs(30);
        let result = self.client.synthesize_structured(&synth_req, timeout).await;

        match result {
            Ok(structured) => {
                self.allocator.release(&lease, true, 0, None).await;
                self.allocator.affinity_bind(&group.speakers, &lease.key_fingerprint).await;

                let weights: Vec<f64> = group.lines.iter().map(|l| l.text.split_whitespace().count().max(1) as f64).collect();
                let joined = base64_decode(&structured.wav_base64).unwrap_or_default();
                let split = split_int16_pcm_for_lines(&joined, &weights)
                    .map_err(|e| UpstreamError::Status { status: 500, summary: e, kind: ErrorKind::Other })?;

                Ok(group
                    .lines
                    .iter()
                    .zip(split.chunks.into_iter())
                    .map(|(line, pcm)| LineChunk { line_index: line.line_index, engine: self.engine, pcm })
                    .collect())
            }
            Err(err) => {
                let kind = err.kind();
                self.allocator.release(&lease, false, 0, Some(kind)).await;
                if kind == ErrorKind::Auth {
                    self.allocator.mark_auth_failed(&lease.key_fingerprint).await;
                } else if kind == ErrorKind::RateLimit {
                    self.allocator.mark_rate_limited(&lease.key_fingerprint, &lease.model).await;
                }
                Err(err)
            }
        }
    }

    async fn synthesize_segmented(&self, req: &SynthesisRequest, group: &StudioPairGroup) -> GatewayResult<Vec<LineChunk>> {
        let mut out = Vec::new();
        for line in &group.lines {
            let single = SynthesisRequest {
                text: line.text.clone(),
                speaker_voices: req.speaker_voices.clone(),
                line_map: None,
                studio_pair_groups_requested: false,
                requested_concurrency: 1,
                target_voice: req.target_voice.clone(),
            };
            let outcome = self.run_legacy_single_window(&single).await?;
            out.push(LineChunk { line_index: line.line_index, engine: self.engine, pcm: outcome.wav_bytes() });
        }
        Ok(out)
    }

    /// Strategy 2: split the line map into ≤ MAX_WORDS windows at whole-line
    /// boundaries, run strategy 1 on each window serially, concatenate.
    async fn run_line_map_windows(&self, req: &SynthesisRequest, line_map: &[LineInput]) -> GatewayResult<RawOutcome> {
        let windows = window_line_map(line_map, self.max_words_per_request);
        let mut line_chunks = Vec::new();
        let mut concurrency_used = 0;
        for window in windows {
            let outcome = self.run_studio_pair_groups(req, &window, 1).await?;
            concurrency_used = concurrency_used.max(outcome.concurrency_used);
            line_chunks.extend(outcome.line_chunks);
        }
        line_chunks.sort_by_key(|c| c.line_index);
        Ok(RawOutcome { line_chunks, concurrency_used, split_mode: Some("pause"), silence_fallback: false })
    }

    /// Strategy 3: scan the script line by line; a third distinct speaker
    /// flushes the current window and opens a new two-speaker window.
    async fn run_text_order_windows(&self, req: &SynthesisRequest) -> GatewayResult<RawOutcome> {
        let lines: Vec<&str> = req.text.lines().collect();
        let mut windows: Vec<Vec<&str>> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_speakers: Vec<String> = Vec::new();

        for line in lines {
            let speaker = line.split(':').next().unwrap_or("").trim().to_string();
            if !speaker.is_empty() && !current_speakers.contains(&speaker) {
                if current_speakers.len() >= 2 {
                    windows.push(std::mem::take(&mut current));
                    current_speakers.clear();
                }
                current_speakers.push(speaker);
            }
            current.push(line);
        }
        if !current.is_empty() {
            windows.push(current);
        }

        let mut wav_parts: Vec<Vec<u8>> = Vec::new();
        for window in windows {
            let text = window.join("\n");
            let single = SynthesisRequest {
                text,
                speaker_voices: req.speaker_voices.clone(),
                line_map: None,
                studio_pair_groups_requested: false,
                requested_concurrency: 1,
                target_voice: req.target_voice.clone(),
            };
            let outcome = self.run_legacy_single_window(&single).await?;
            wav_parts.push(outcome.wav_bytes());
        }

        let bridge_samples = (SAMPLE_RATE as u64 * self.silence_bridge_ms / 1000) as usize;
        let bridge = vec![0u8; bridge_samples * 2];
        let mut joined = Vec::new();
        for (idx, part) in wav_parts.iter().enumerate() {
            if idx > 0 {
                joined.extend_from_slice(&bridge);
            }
            joined.extend_from_slice(part);
        }

        Ok(RawOutcome {
            line_chunks: vec![LineChunk { line_index: 0, engine: self.engine, pcm: joined }],
            concurrency_used: 1,
            split_mode: None,
            silence_fallback: false,
        })
    }

    /// Strategy 4: a single call, single- or two-speaker config depending on
    /// declared speaker count, with the per-call retry/fallback loop.
    async fn run_legacy_single_window(&self, req: &SynthesisRequest) -> GatewayResult<RawOutcome> {
        let distinct = distinct_speakers(&req.line_map, &req.text);
        let mut multi_speaker = distinct.len() == 2;
        let mut blocked_keys: Vec<String> = Vec::new();
        let mut blocked_models: Vec<String> = Vec::new();
        let mut last_model_other_failure: Option<String> = None;

        loop {
            let lease = self
                .allocator
                .acquire_for_task("tts", estimate_tokens(&req.text), &blocked_keys, &blocked_models, None, None)
                .await;

            let (Some(lease), _outcome) = lease else {
                return Err(GatewayError::KeyPoolTimeout { retry_after_ms: 0 });
            };

            let synth_req = SynthesizeRequest {
                text: req.text.clone(),
                voice_id: Some(req.target_voice.clone()),
                voice_name: Some(req.target_voice.clone()),
                speaker_voices: if multi_speaker { Some(to_speaker_voices(&req.speaker_voices, &req.target_voice)) } else { None },
                line_map: None,
                structured: false,
            };

            match self.client.synthesize(&synth_req, Duration::from_secs(30)).await {
                Ok(bytes) => {
                    self.allocator.release(&lease, true, 0, None).await;
                    return Ok(RawOutcome {
                        line_chunks: vec![LineChunk { line_index: 0, engine: self.engine, pcm: bytes.to_vec() }],
                        concurrency_used: 1,
                        split_mode: None,
                        silence_fallback: false,
                    });
                }
                Err(err) => {
                    let kind = err.kind();
                    self.allocator.release(&lease, false, 0, Some(kind)).await;
                    match kind {
                        ErrorKind::Auth => {
                            blocked_keys.push(lease.key_fingerprint.clone());
                            self.allocator.mark_auth_failed(&lease.key_fingerprint).await;
                        }
                        ErrorKind::RateLimit => {
                            self.allocator.mark_rate_limited(&lease.key_fingerprint, &lease.model).await;
                        }
                        ErrorKind::Timeout => {
                            return Err(GatewayError::UpstreamModelFailed { summary: err.trimmed_summary() });
                        }
                        ErrorKind::Other => {
                            if multi_speaker {
                                multi_speaker = false;
                            } else if last_model_other_failure.as_deref() == Some(lease.model.as_str()) {
                                blocked_models.push(lease.model.clone());
                            }
                            last_model_other_failure = Some(lease.model.clone());
                        }
                    }
                    if blocked_keys.len() >= self.allocator.key_pool_size().await {
                        return Err(classify_to_gateway_error(&err));
                    }
                }
            }
        }
    }

    async fn acquire_lease(&self, speakers: Vec<String>, text: &str) -> GatewayResult<crate::allocator::Lease> {
        let preferred = self.allocator.affinity_preferred_key(&speakers).await;
        let (lease, outcome) = self
            .allocator
            .acquire_for_task("tts", estimate_tokens(text), &[], &[], None, preferred.as_deref())
            .await;
        lease.ok_or(GatewayError::KeyPoolTimeout { retry_after_ms: outcome.retry_after_ms })
    }
}

struct RawOutcome {
    line_chunks: Vec<LineChunk>,
    concurrency_used: usize,
    split_mode: Option<&'static str>,
    silence_fallback: bool,
}

impl RawOutcome {
    fn wav_bytes(&self) -> Vec<u8> {
        let mut pcm = Vec::new();
        let mut sorted = self.line_chunks.clone();
        sorted.sort_by_key(|c| c.line_index);
        for chunk in &sorted {
            pcm.extend_from_slice(&chunk.pcm);
        }
        wrap_wav(&pcm, SAMPLE_RATE)
    }

    fn wav_duration_sec(&self) -> f64 {
        let total_samples: usize = self.line_chunks.iter().map(|c| c.pcm.len() / 2).sum();
        total_samples as f64 / SAMPLE_RATE as f64
    }
}

fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() as f64 / 4.0).ceil() as u64).max(1)
}

fn to_speaker_voices(inputs: &[SpeakerVoiceInput], target_voice: &str) -> Vec<SpeakerVoice> {
    inputs
        .iter()
        .map(|s| SpeakerVoice {
            speaker: s.speaker.clone(),
            voice_name: if s.voice_name.is_empty() { target_voice.to_string() } else { s.voice_name.clone() },
        })
        .collect()
}

fn distinct_speakers(line_map: &Option<Vec<LineInput>>, text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    if let Some(map) = line_map {
        for line in map {
            let key = line.speaker.to_lowercase();
            if !seen.contains(&key) {
                seen.push(key);
            }
        }
        return seen;
    }
    for line in text.lines() {
        if let Some((speaker, _)) = line.split_once(':') {
            let key = speaker.trim().to_lowercase();
            if !key.is_empty() && !seen.contains(&key) {
                seen.push(key);
            }
        }
    }
    seen
}

fn line_map_word_count(line_map: &[LineInput]) -> usize {
    line_map.iter().map(|l| l.text.split_whitespace().count()).sum()
}

fn window_line_map(line_map: &[LineInput], max_words: usize) -> Vec<Vec<LineInput>> {
    let mut windows = Vec::new();
    let mut current = Vec::new();
    let mut current_words = 0usize;
    for line in line_map {
        let words = line.text.split_whitespace().count();
        if current_words + words > max_words && !current.is_empty() {
            windows.push(std::mem::take(&mut current));
            current_words = 0;
        }
        current_words += words;
        current.push(line.clone());
    }
    if !current.is_empty() {
        windows.push(current);
    }
    windows
}

#[derive(Debug, Clone)]
struct StudioPairGroup {
    speakers: Vec<String>,
    speaker_voices: Vec<SpeakerVoice>,
    lines: Vec<LineInput>,
    text: String,
}

fn build_studio_pair_groups(
    line_map: &[LineInput],
    speaker_voices: &[SpeakerVoiceInput],
    target_voice: &str,
) -> Vec<StudioPairGroup> {
    let mut voice_by_speaker = std::collections::HashMap::new();
    for sv in speaker_voices {
        voice_by_speaker.insert(sv.speaker.to_lowercase(), sv.voice_name.clone());
    }

    let mut speaker_order = Vec::new();
    for line in line_map {
        let key = line.speaker.to_lowercase();
        if !speaker_order.contains(&key) {
            speaker_order.push(key);
        }
    }

    let mut groups = Vec::new();
    for chunk in speaker_order.chunks(2) {
        let group_keys: Vec<String> = chunk.to_vec();
        let group_lines: Vec<LineInput> = line_map
            .iter()
            .filter(|l| group_keys.contains(&l.speaker.to_lowercase()))
            .cloned()
            .collect();
        if group_lines.is_empty() {
            continue;
        }
        let speaker_voices: Vec<SpeakerVoice> = group_keys
            .iter()
            .map(|k| SpeakerVoice {
                speaker: k.clone(),
                voice_name: voice_by_speaker.get(k).cloned().unwrap_or_else(|| target_voice.to_string()),
            })
            .collect();
        let text = group_lines
            .iter()
            .map(|l| format!("{}: {}", l.speaker, l.text))
            .collect::<Vec<_>>()
            .join("\n");
        groups.push(StudioPairGroup { speakers: group_keys, speaker_voices, lines: group_lines, text });
    }
    groups
}

fn classify_to_gateway_error(err: &UpstreamError) -> GatewayError {
    match err.kind() {
        ErrorKind::Auth => GatewayError::AllKeysAuthFailed,
        ErrorKind::RateLimit => GatewayError::AllKeysRateLimited { retry_after_ms: 1000 },
        ErrorKind::Timeout => GatewayError::KeyPoolTimeout { retry_after_ms: 0 },
        ErrorKind::Other => GatewayError::UpstreamModelFailed { summary: err.trimmed_summary() },
    }
}

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim()).ok()
}

fn wrap_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let byte_rate = sample_rate * 2;
    let data_len = pcm.len() as u32;
    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_wrapping_preserves_payload_and_adds_header() {
        let pcm = vec![1, 2, 3, 4];
        let wav = wrap_wav(&pcm, 24_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[44..], &pcm[..]);
    }

    #[test]
    fn studio_pair_groups_partition_speakers_by_two() {
        let line_map = vec![
            LineInput { line_index: 0, speaker: "A".into(), text: "hello".into() },
            LineInput { line_index: 1, speaker: "B".into(), text: "world".into() },
            LineInput { line_index: 2, speaker: "C".into(), text: "foo".into() },
            LineInput { line_index: 3, speaker: "D".into(), text: "bar".into() },
        ];
        let groups = build_studio_pair_groups(&line_map, &[], "default-voice");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].speakers, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn base64_roundtrip_minimal() {
        let decoded = base64_decode("aGVsbG8=").unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[tokio::test]
    async fn grouped_synthesis_falls_back_to_segmented_mode_on_structured_failure() {
        use crate::config::AllocatorConfig;
        use httpmock::prelude::*;

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/synthesize/structured");
            then.status(503).body("structured synthesis unavailable");
        });
        server.mock(|when, then| {
            when.method(POST).path("/synthesize");
            then.status(200).body(vec![0u8; 64]);
        });

        let allocator_config: AllocatorConfig = serde_json::from_value(serde_json::json!({
            "version": "1",
            "windowSeconds": 60,
            "defaultWaitTimeoutMs": 1000,
            "models": [{"id": "m1", "rpm": 10, "tpm": 10_000, "enabledFor": ["tts"]}],
            "routes": {"tts": ["m1"], "text": [], "ocr": []},
        }))
        .unwrap();
        let allocator = Arc::new(Allocator::new(
            allocator_config,
            vec!["AIzaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string()],
            300_000,
            50,
        ));
        let client = UpstreamClient::new(reqwest::Client::new(), server.base_url());
        let orchestrator = TtsOrchestrator::new(allocator, client, EngineTag::Gem, 1800, 250);

        let req = SynthesisRequest {
            text: "hello world".into(),
            speaker_voices: vec![],
            line_map: Some(vec![
                LineInput { line_index: 0, speaker: "A".into(), text: "hello".into() },
                LineInput { line_index: 1, speaker: "B".into(), text: "world".into() },
            ]),
            studio_pair_groups_requested: true,
            requested_concurrency: 2,
            target_voice: "default".into(),
        };

        let outcome = orchestrator.synthesize(&req).await.unwrap();
        assert_eq!(outcome.line_chunks.len(), 2);
        assert!(outcome.line_chunks.iter().all(|c| c.engine == EngineTag::Gem));
    }
}

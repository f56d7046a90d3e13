//! Background job lifecycle: queued -> running -> {completed, failed,
//! cancelled}, with a cooperative cancelling branch. Stages are registered
//! generically so only the TTS stage carries real synthesis logic; the
//! dubbing pipeline's other stages are modeled as opaque contract
//! registrations per the scope cut in `spec.md` §1.
//!
//! Grounded on `video_dubbing/pipeline/pipeline_contracts.py`
//! (`STAGE_INPUT_KEYS`/`STAGE_OUTPUT_KEYS`/`validate_stage_contract`) and
//! `video_dubbing/pipeline/stage6_tts.py` (the TTS stage's own input/output
//! shape).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTimelineEntry {
    pub stage: String,
    pub status: StageStatus,
    #[serde(rename = "startMs")]
    pub start_ms: i64,
    #[serde(rename = "endMs")]
    pub end_ms: Option<i64>,
    #[serde(rename = "durationMs")]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityGateReport {
    #[serde(rename = "segmentFailures")]
    pub segment_failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub stage: Option<String>,
    pub progress: f32,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "cancelRequested")]
    pub cancel_requested: bool,
    pub logs: Vec<String>,
    #[serde(rename = "resultPath")]
    pub result_path: Option<String>,
    #[serde(rename = "reportPath")]
    pub report_path: Option<String>,
    #[serde(rename = "stageTimeline")]
    pub stage_timeline: Vec<StageTimelineEntry>,
    pub preflight: Value,
    #[serde(rename = "outputFiles")]
    pub output_files: Vec<String>,
    #[serde(rename = "qualityGate")]
    pub quality_gate: QualityGateReport,
    #[serde(skip)]
    pub failure_reason: Option<String>,
}

impl Job {
    fn new(preflight: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            stage: None,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            cancel_requested: false,
            logs: Vec::new(),
            result_path: None,
            report_path: None,
            stage_timeline: Vec::new(),
            preflight,
            output_files: Vec::new(),
            quality_gate: QualityGateReport::default(),
            failure_reason: None,
        }
    }
}

/// A stage's declared input/output contract, validated before it runs and
/// after it returns. Missing keys abort the job with
/// `stage_contract_violation:<stage>:<when>:missing=<keys>`.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn required_input_keys(&self) -> &'static [&'static str];
    fn produced_output_keys(&self) -> &'static [&'static str];

    /// Mutates `ctx` in place, inserting its declared output keys.
    async fn run(&self, ctx: &mut HashMap<String, Value>) -> Result<(), GatewayError>;
}

fn validate_stage_contract(
    stage: &str,
    ctx: &HashMap<String, Value>,
    keys: &[&'static str],
    when: &'static str,
) -> Result<(), GatewayError> {
    let missing: Vec<String> = keys
        .iter()
        .filter(|k| !ctx.get(**k).map(|v| !v.is_null()).unwrap_or(false))
        .map(|k| k.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::stage_contract_violation(stage, when, &missing))
    }
}

/// TTS stage's declared contract, matching `stage6_tts.py`'s `run()` shape:
/// consumes `segments`/`vocals`, produces `tts_segments` plus the
/// `tts_requests`/`synthesis_failures` bookkeeping the quality gate reads.
pub const TTS_STAGE_NAME: &str = "stage6_tts";
pub const TTS_INPUT_KEYS: &[&str] = &["segments", "vocals"];
pub const TTS_OUTPUT_KEYS: &[&str] = &["tts_segments"];

struct JobRecord {
    job: Mutex<Job>,
}

/// Owns all jobs; only the worker task spawned for a given job mutates its
/// record, with concurrent reads guarded by the same per-job lock (matching
/// the ownership rule in `spec.md` §3).
pub struct JobEngine {
    jobs: Mutex<HashMap<Uuid, Arc<JobRecord>>>,
    stages: Vec<Arc<dyn Stage>>,
}

impl JobEngine {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { jobs: Mutex::new(HashMap::new()), stages }
    }

    pub async fn enqueue(&self, preflight: Value, initial_ctx: HashMap<String, Value>) -> Uuid {
        let job = Job::new(preflight);
        let id = job.id;
        let record = Arc::new(JobRecord { job: Mutex::new(job) });
        self.jobs.lock().await.insert(id, record.clone());

        let stages = self.stages.clone();
        tokio::spawn(async move {
            run_job(record, stages, initial_ctx).await;
        });

        id
    }

    pub async fn get(&self, id: Uuid) -> Option<Job> {
        let jobs = self.jobs.lock().await;
        let record = jobs.get(&id)?;
        Some(record.job.lock().await.clone())
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), GatewayError> {
        let jobs = self.jobs.lock().await;
        let record = jobs.get(&id).ok_or(GatewayError::NotFound)?;
        let mut job = record.job.lock().await;
        match job.status {
            JobStatus::Queued | JobStatus::Running => {
                job.cancel_requested = true;
                job.updated_at = Utc::now();
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

async fn run_job(record: Arc<JobRecord>, stages: Vec<Arc<dyn Stage>>, mut ctx: HashMap<String, Value>) {
    {
        let mut job = record.job.lock().await;
        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
    }

    for stage in &stages {
        let cancel_requested = record.job.lock().await.cancel_requested;
        if cancel_requested {
            close_running_stage_as(&record, StageStatus::Failed).await;
            let mut job = record.job.lock().await;
            job.status = JobStatus::Cancelled;
            job.updated_at = Utc::now();
            info!(job_id = %job.id, "job cancelled between stages");
            return;
        }

        let start_ms = Utc::now().timestamp_millis();
        {
            let mut job = record.job.lock().await;
            job.stage = Some(stage.name().to_string());
            job.stage_timeline.push(StageTimelineEntry {
                stage: stage.name().to_string(),
                status: StageStatus::Running,
                start_ms,
                end_ms: None,
                duration_ms: None,
            });
            job.updated_at = Utc::now();
        }

        if let Err(err) = validate_stage_contract(stage.name(), &ctx, stage.required_input_keys(), "before") {
            fail_job(&record, start_ms, err).await;
            return;
        }

        let run_result = stage.run(&mut ctx).await;

        if let Err(err) = run_result {
            fail_job(&record, start_ms, err).await;
            return;
        }

        if let Err(err) = validate_stage_contract(stage.name(), &ctx, stage.produced_output_keys(), "after") {
            fail_job(&record, start_ms, err).await;
            return;
        }

        let end_ms = Utc::now().timestamp_millis();
        {
            let mut job = record.job.lock().await;
            if let Some(entry) = job.stage_timeline.last_mut() {
                entry.status = StageStatus::Completed;
                entry.end_ms = Some(end_ms);
                entry.duration_ms = Some(end_ms - start_ms);
            }
            job.updated_at = Utc::now();
        }
    }

    let segment_failures = extract_synthesis_failures(&ctx);
    if !segment_failures.is_empty() {
        let mut job = record.job.lock().await;
        job.quality_gate = QualityGateReport { segment_failures: segment_failures.clone() };
        job.status = JobStatus::Failed;
        job.failure_reason = Some(format!("tts_segment_failures:{}", segment_failures.len()));
        job.updated_at = Utc::now();
        warn!(job_id = %job.id, count = segment_failures.len(), "job failed quality gate");
        return;
    }

    let mut job = record.job.lock().await;
    job.status = JobStatus::Completed;
    job.progress = 1.0;
    job.updated_at = Utc::now();
    info!(job_id = %job.id, "job completed");
}

async fn close_running_stage_as(record: &Arc<JobRecord>, status: StageStatus) {
    let mut job = record.job.lock().await;
    let now_ms = Utc::now().timestamp_millis();
    if let Some(entry) = job.stage_timeline.last_mut() {
        if matches!(entry.status, StageStatus::Running) {
            entry.status = status;
            entry.end_ms = Some(now_ms);
            entry.duration_ms = Some(now_ms - entry.start_ms);
        }
    }
}

async fn fail_job(record: &Arc<JobRecord>, start_ms: i64, err: GatewayError) {
    let reason = err.to_string();
    error!(reason = %reason, "job stage failed");
    let mut job = record.job.lock().await;
    let end_ms = Utc::now().timestamp_millis();
    if let Some(entry) = job.stage_timeline.last_mut() {
        entry.status = StageStatus::Failed;
        entry.end_ms = Some(end_ms);
        entry.duration_ms = Some(end_ms - start_ms);
    }
    job.status = JobStatus::Failed;
    job.failure_reason = Some(reason);
    job.updated_at = Utc::now();
}

fn extract_synthesis_failures(ctx: &HashMap<String, Value>) -> Vec<String> {
    ctx.get("synthesis_failures")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// A stage registration with no synthesis logic behind it: the dubbing
/// stages outside TTS are out of scope (`spec.md` §1) and exist here only
/// so the job engine's contract validation and timeline have something
/// concrete to run against in tests and in a future extension.
pub struct OpaqueStage {
    name: &'static str,
    inputs: &'static [&'static str],
    outputs: &'static [&'static str],
}

impl OpaqueStage {
    pub fn new(name: &'static str, inputs: &'static [&'static str], outputs: &'static [&'static str]) -> Self {
        Self { name, inputs, outputs }
    }
}

#[async_trait]
impl Stage for OpaqueStage {
    fn name(&self) -> &'static str {
        self.name
    }

    fn required_input_keys(&self) -> &'static [&'static str] {
        self.inputs
    }

    fn produced_output_keys(&self) -> &'static [&'static str] {
        self.outputs
    }

    async fn run(&self, ctx: &mut HashMap<String, Value>) -> Result<(), GatewayError> {
        for key in self.outputs {
            ctx.entry(key.to_string()).or_insert(Value::Bool(true));
        }
        Ok(())
    }
}

/// The dubbing pipeline's only stage with real synthesis logic behind it.
/// Reads `segments` (line map entries) and `voice_map` (speaker→voice name)
/// from the job context, calls the TTS Orchestrator once for the whole
/// transcript, and writes `tts_segments`/`synthesis_failures` back. The
/// orchestrator call is all-or-nothing per `spec.md` §4.3, so a failure is
/// recorded as every line in the batch failing together rather than a
/// partial list — this stage has no per-line retry of its own.
pub struct TtsStage {
    orchestrator: Arc<crate::tts_orchestrator::TtsOrchestrator>,
}

impl TtsStage {
    pub fn new(orchestrator: Arc<crate::tts_orchestrator::TtsOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Stage for TtsStage {
    fn name(&self) -> &'static str {
        TTS_STAGE_NAME
    }

    fn required_input_keys(&self) -> &'static [&'static str] {
        TTS_INPUT_KEYS
    }

    fn produced_output_keys(&self) -> &'static [&'static str] {
        TTS_OUTPUT_KEYS
    }

    async fn run(&self, ctx: &mut HashMap<String, Value>) -> Result<(), GatewayError> {
        use crate::tts_orchestrator::{LineInput, SpeakerVoiceInput, SynthesisRequest};

        let segments = ctx
            .get("segments")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let line_map: Vec<LineInput> = segments
            .iter()
            .enumerate()
            .map(|(idx, seg)| LineInput {
                line_index: seg.get("lineIndex").and_then(|v| v.as_u64()).map(|n| n as usize).unwrap_or(idx),
                speaker: seg.get("speaker").and_then(|v| v.as_str()).unwrap_or("default").to_string(),
                text: seg.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            })
            .collect();

        let speaker_voices: Vec<SpeakerVoiceInput> = ctx
            .get("voice_map")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .map(|(speaker, voice)| SpeakerVoiceInput {
                        speaker: speaker.clone(),
                        voice_name: voice.as_str().unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let target_voice = ctx
            .get("target_voice")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();

        let text = line_map.iter().map(|l| l.text.as_str()).collect::<Vec<_>>().join(" ");
        let requested_concurrency = line_map.len().max(1).min(7);
        let req = SynthesisRequest {
            text,
            speaker_voices,
            studio_pair_groups_requested: line_map.len() >= 2,
            requested_concurrency,
            target_voice,
            line_map: if line_map.is_empty() { None } else { Some(line_map.clone()) },
        };

        match self.orchestrator.synthesize(&req).await {
            Ok(outcome) => {
                let tts_segments: Vec<Value> = outcome
                    .line_chunks
                    .iter()
                    .map(|chunk| {
                        serde_json::json!({
                            "lineIndex": chunk.line_index,
                            "engine": chunk.engine.as_str(),
                        })
                    })
                    .collect();
                ctx.insert("tts_segments".into(), Value::Array(tts_segments));
                ctx.insert("synthesis_failures".into(), Value::Array(vec![]));
                ctx.insert(
                    "tts_diagnostics".into(),
                    serde_json::to_value(&outcome.diagnostics).unwrap_or(Value::Null),
                );
                Ok(())
            }
            Err(err) => {
                let failures: Vec<Value> = line_map
                    .iter()
                    .map(|l| Value::String(format!("segment-{}", l.line_index)))
                    .collect();
                ctx.insert("tts_segments".into(), Value::Array(vec![]));
                ctx.insert("synthesis_failures".into(), Value::Array(failures));
                warn!(error = %err, "tts stage synthesis failed");
                Ok(())
            }
        }
    }
}

const STAGE1_INPUTS: &[&str] = &["source_path", "target_language", "voice_map"];
const STAGE1_OUTPUTS: &[&str] = &["audio_raw", "vocals", "no_vocals", "language", "segments"];
const VOCALS_SEGMENTS_IN: &[&str] = &["vocals", "segments"];
const SEGMENTS_OUT: &[&str] = &["segments"];
const STAGE5_INPUTS: &[&str] = &["segments", "target_language"];
const STAGE7_INPUTS: &[&str] = &["segments", "tts_segments", "vocals"];
const STAGE7_OUTPUTS: &[&str] = &["world_segments"];
const STAGE8_INPUTS: &[&str] = &["segments", "world_segments", "audio_raw", "no_vocals", "source_path"];
const STAGE8_OUTPUTS: &[&str] = &["dubbed_audio", "dubbed_video_raw"];
const STAGE9_INPUTS: &[&str] = &["dubbed_video_raw"];
const STAGE9_OUTPUTS: &[&str] = &["dubbed_video_final"];

/// Builds the full nine-stage pipeline, mirroring [`default_stage_keys`]
/// exactly: every stage but `stage6_tts` is an [`OpaqueStage`] whose
/// `run()` only fills in placeholder outputs so the contract chain stays
/// satisfiable end to end. Kept as literal `&'static` slices (rather than
/// deriving from `default_stage_keys`'s `HashSet`s) since `OpaqueStage`
/// needs `'static` key lists and a `HashSet` can't be built `const`.
pub fn build_stage_pipeline(orchestrator: Arc<crate::tts_orchestrator::TtsOrchestrator>) -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(OpaqueStage::new("stage1_preprocess", STAGE1_INPUTS, STAGE1_OUTPUTS)),
        Arc::new(OpaqueStage::new("stage2_diarize", VOCALS_SEGMENTS_IN, SEGMENTS_OUT)),
        Arc::new(OpaqueStage::new("stage3_emotion", VOCALS_SEGMENTS_IN, SEGMENTS_OUT)),
        Arc::new(OpaqueStage::new("stage4_segment_detect", VOCALS_SEGMENTS_IN, SEGMENTS_OUT)),
        Arc::new(OpaqueStage::new("stage5_translate", STAGE5_INPUTS, SEGMENTS_OUT)),
        Arc::new(TtsStage::new(orchestrator)),
        Arc::new(OpaqueStage::new("stage7_world", STAGE7_INPUTS, STAGE7_OUTPUTS)),
        Arc::new(OpaqueStage::new("stage8_reconstruct", STAGE8_INPUTS, STAGE8_OUTPUTS)),
        Arc::new(OpaqueStage::new("stage9_lipsync", STAGE9_INPUTS, STAGE9_OUTPUTS)),
    ]
}

pub fn default_stage_keys() -> HashMap<&'static str, (HashSet<&'static str>, HashSet<&'static str>)> {
    let mut map = HashMap::new();
    map.insert("stage1_preprocess", (
        HashSet::from(["source_path", "target_language", "voice_map"]),
        HashSet::from(["audio_raw", "vocals", "no_vocals", "language", "segments"]),
    ));
    map.insert("stage2_diarize", (HashSet::from(["vocals", "segments"]), HashSet::from(["segments"])));
    map.insert("stage3_emotion", (HashSet::from(["vocals", "segments"]), HashSet::from(["segments"])));
    map.insert("stage4_segment_detect", (HashSet::from(["vocals", "segments"]), HashSet::from(["segments"])));
    map.insert("stage5_translate", (HashSet::from(["segments", "target_language"]), HashSet::from(["segments"])));
    map.insert(TTS_STAGE_NAME, (HashSet::from(["segments", "vocals"]), HashSet::from(["tts_segments"])));
    map.insert("stage7_world", (
        HashSet::from(["segments", "tts_segments", "vocals"]),
        HashSet::from(["world_segments"]),
    ));
    map.insert("stage8_reconstruct", (
        HashSet::from(["segments", "world_segments", "audio_raw", "no_vocals", "source_path"]),
        HashSet::from(["dubbed_audio", "dubbed_video_raw"]),
    ));
    map.insert("stage9_lipsync", (HashSet::from(["dubbed_video_raw"]), HashSet::from(["dubbed_video_final"])));
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingTtsStage;

    #[async_trait]
    impl Stage for FailingTtsStage {
        fn name(&self) -> &'static str {
            TTS_STAGE_NAME
        }
        fn required_input_keys(&self) -> &'static [&'static str] {
            TTS_INPUT_KEYS
        }
        fn produced_output_keys(&self) -> &'static [&'static str] {
            TTS_OUTPUT_KEYS
        }
        async fn run(&self, ctx: &mut HashMap<String, Value>) -> Result<(), GatewayError> {
            ctx.insert("tts_segments".into(), Value::Array(vec![]));
            ctx.insert(
                "synthesis_failures".into(),
                Value::Array(vec![Value::String("segment-3".into())]),
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn missing_input_key_fails_with_stage_contract_violation() {
        let engine = JobEngine::new(vec![Arc::new(OpaqueStage::new(
            TTS_STAGE_NAME,
            TTS_INPUT_KEYS,
            TTS_OUTPUT_KEYS,
        ))]);
        let id = engine.enqueue(Value::Null, HashMap::new()).await;

        let mut job = engine.get(id).await.unwrap();
        let mut attempts = 0;
        while !matches!(job.status, JobStatus::Failed | JobStatus::Completed) && attempts < 50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            job = engine.get(id).await.unwrap();
            attempts += 1;
        }

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().starts_with("stage_contract_violation:stage6_tts:before:missing="));
    }

    #[tokio::test]
    async fn synthesis_failures_trip_the_quality_gate() {
        let engine = JobEngine::new(vec![Arc::new(FailingTtsStage)]);
        let mut ctx = HashMap::new();
        ctx.insert("segments".into(), Value::Array(vec![]));
        ctx.insert("vocals".into(), Value::String("vocals.wav".into()));
        let id = engine.enqueue(Value::Null, ctx).await;

        let mut job = engine.get(id).await.unwrap();
        let mut attempts = 0;
        while !matches!(job.status, JobStatus::Failed | JobStatus::Completed) && attempts < 50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            job = engine.get(id).await.unwrap();
            attempts += 1;
        }

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.unwrap(), "tts_segment_failures:1");
        assert_eq!(job.quality_gate.segment_failures, vec!["segment-3".to_string()]);
    }

    #[tokio::test]
    async fn cancel_flag_stops_the_worker_between_stages() {
        struct SlowStage;
        #[async_trait]
        impl Stage for SlowStage {
            fn name(&self) -> &'static str {
                "stage1_preprocess"
            }
            fn required_input_keys(&self) -> &'static [&'static str] {
                &["source_path", "target_language", "voice_map"]
            }
            fn produced_output_keys(&self) -> &'static [&'static str] {
                &["audio_raw", "vocals", "no_vocals", "language", "segments"]
            }
            async fn run(&self, ctx: &mut HashMap<String, Value>) -> Result<(), GatewayError> {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                for key in self.produced_output_keys() {
                    ctx.insert(key.to_string(), Value::Bool(true));
                }
                Ok(())
            }
        }

        let engine = JobEngine::new(vec![Arc::new(SlowStage), Arc::new(OpaqueStage::new(TTS_STAGE_NAME, TTS_INPUT_KEYS, TTS_OUTPUT_KEYS))]);
        let mut ctx = HashMap::new();
        ctx.insert("source_path".into(), Value::String("in.mp4".into()));
        ctx.insert("target_language".into(), Value::String("es".into()));
        ctx.insert("voice_map".into(), Value::Object(Default::default()));
        let id = engine.enqueue(Value::Null, ctx).await;

        engine.cancel(id).await.unwrap();

        let mut job = engine.get(id).await.unwrap();
        let mut attempts = 0;
        while !matches!(job.status, JobStatus::Cancelled | JobStatus::Failed | JobStatus::Completed) && attempts < 50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            job = engine.get(id).await.unwrap();
            attempts += 1;
        }

        assert_eq!(job.status, JobStatus::Cancelled);
    }
}

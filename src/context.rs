//! Per-run state owned by the orchestrator driving that run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const INITIAL_QUALITY_SCORE: f64 = 100.0;
pub const WARNING_PENALTY: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Ingestion,
    UploadValidation,
    Sanitization,
    Profiling,
    Preprocessing,
    FeatureEngineering,
    ModelRouting,
    Training,
    TrainValidation,
}

impl StageName {
    pub const SEQUENCE: [StageName; 9] = [
        StageName::Ingestion,
        StageName::UploadValidation,
        StageName::Sanitization,
        StageName::Profiling,
        StageName::Preprocessing,
        StageName::FeatureEngineering,
        StageName::ModelRouting,
        StageName::Training,
        StageName::TrainValidation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Ingestion => "ingestion",
            StageName::UploadValidation => "upload_validation",
            StageName::Sanitization => "sanitization",
            StageName::Profiling => "profiling",
            StageName::Preprocessing => "preprocessing",
            StageName::FeatureEngineering => "feature_engineering",
            StageName::ModelRouting => "model_routing",
            StageName::Training => "training",
            StageName::TrainValidation => "train_validation",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageName,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: StageStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

/// Snapshot published to status pollers while a run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub state: RunState,
    pub current_stage: Option<StageName>,
    pub completed_stages: usize,
    pub quality_score: f64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    run_id: Uuid,
    session_id: String,
    created_at: DateTime<Utc>,
    state: RunState,
    current_stage: Option<StageName>,
    history: Vec<StageRecord>,
    quality_score: f64,
    errors: Vec<String>,
    warnings: Vec<String>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl PipelineContext {
    pub fn new(run_id: Uuid, session_id: impl Into<String>) -> Self {
        Self {
            run_id,
            session_id: session_id.into(),
            created_at: Utc::now(),
            state: RunState::Running,
            current_stage: None,
            history: Vec::new(),
            quality_score: INITIAL_QUALITY_SCORE,
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn current_stage(&self) -> Option<StageName> {
        self.current_stage
    }

    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    pub fn quality_score(&self) -> f64 {
        self.quality_score
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.run_id,
            state: self.state,
            current_stage: self.current_stage,
            completed_stages: self
                .history
                .iter()
                .filter(|r| r.status == StageStatus::Completed)
                .count(),
            quality_score: self.quality_score,
            warnings: self.warnings.clone(),
        }
    }

    pub(crate) fn enter_stage(&mut self, stage: StageName) {
        self.current_stage = Some(stage);
    }

    /// History is append-only.
    pub(crate) fn record_stage(&mut self, record: StageRecord) {
        if let Some(error) = &record.error {
            self.errors.push(format!("{}: {error}", record.stage));
        }
        self.history.push(record);
    }

    pub(crate) fn add_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    /// Gate warnings also cost quality points.
    pub(crate) fn add_gate_warning(&mut self, warning: impl Into<String>) {
        self.add_warning(warning);
        self.set_quality_score(self.quality_score - WARNING_PENALTY);
    }

    pub(crate) fn set_quality_score(&mut self, score: f64) {
        self.quality_score = score.clamp(0.0, 100.0);
    }

    pub(crate) fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub(crate) fn finish(&mut self, state: RunState) {
        self.state = state;
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use adaptive_forecast::{
    dataset_from_csv_reader, AttemptOutcome, BuiltinStrategies, Dataset, ForecastResult,
    Forecaster, ForecasterError, Orchestrator, PipelineConfig, RunOutcome, RunRequest, RunState,
    SemanticRoles, SmallDatasetPolicy, StageName, StageStatus, StrategyFactory, StrategyId,
    TrainingMetrics, GENERIC_FAILURE_MESSAGE,
};
use chrono::{Duration as ChronoDuration, NaiveDate};
use regex::Regex;

fn dated_csv(rows: usize, features: usize) -> String {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid start date");
    let mut header = vec!["date".to_string(), "sales".to_string()];
    header.extend((0..features).map(|f| format!("f{f}")));

    let mut out = header.join(",");
    out.push('\n');
    for i in 0..rows {
        let day = start + ChronoDuration::days(i as i64);
        let weekly = [0.0, 4.0, 8.0, 6.0, 3.0, -5.0, -9.0][i % 7];
        let sales = 100.0 + 0.5 * i as f64 + weekly + ((i * 7919) % 5) as f64 * 0.3;
        let mut line = vec![day.format("%Y-%m-%d").to_string(), format!("{sales:.2}")];
        line.extend((0..features).map(|f| format!("{:.2}", ((i + f * 3) % 11) as f64 + f as f64)));
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn dated_dataset(rows: usize, features: usize) -> Dataset {
    let roles = SemanticRoles::new("sales")
        .with_date("date")
        .with_features((0..features).map(|f| format!("f{f}")));
    dataset_from_csv_reader(dated_csv(rows, features).as_bytes(), roles)
        .expect("generated CSV should parse")
}

fn orchestrator() -> Orchestrator {
    Orchestrator::new(PipelineConfig::default()).expect("default config should be valid")
}

fn completed(outcome: RunOutcome) -> adaptive_forecast::RunReport {
    match outcome {
        RunOutcome::Completed(report) => *report,
        RunOutcome::Failed(failure) => panic!("run should complete, got {failure:?}"),
    }
}

fn failed(outcome: RunOutcome) -> adaptive_forecast::RunFailure {
    match outcome {
        RunOutcome::Failed(failure) => *failure,
        RunOutcome::Completed(report) => panic!("run should fail, got {:?}", report.model_type),
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    NanMetric,
    Refuse,
    Sleep(u64),
    PanicOnPredict,
}

struct Scripted {
    strategy: StrategyId,
    behavior: Behavior,
}

impl Forecaster for Scripted {
    fn strategy(&self) -> StrategyId {
        self.strategy
    }

    fn train(&mut self, _dataset: &Dataset) -> Result<TrainingMetrics, ForecasterError> {
        match self.behavior {
            Behavior::NanMetric => {
                let mut metrics = TrainingMetrics::from_holdout(&[1.0], &[1.0], 10, Vec::new());
                metrics.mape = f64::NAN;
                Ok(metrics)
            }
            Behavior::Refuse => Err(ForecasterError::training(
                self.strategy,
                "matrix rank 0 at column 3",
            )),
            Behavior::Sleep(ms) => {
                std::thread::sleep(Duration::from_millis(ms));
                Err(ForecasterError::training(self.strategy, "woke up too late"))
            }
            Behavior::PanicOnPredict => Ok(TrainingMetrics::from_holdout(
                &[10.0, 12.0],
                &[11.0, 12.0],
                10,
                Vec::new(),
            )),
        }
    }

    fn predict(
        &self,
        _periods: usize,
        _confidence_level: f64,
    ) -> Result<ForecastResult, ForecasterError> {
        if let Behavior::PanicOnPredict = self.behavior {
            panic!("forecast buffer index out of range");
        }
        Err(ForecasterError::NotTrained {
            strategy: self.strategy,
        })
    }
}

/// Built-in strategies, except the scripted ones.
struct Overrides {
    builtin: BuiltinStrategies,
    scripted: Vec<(StrategyId, Behavior)>,
    everything: Option<Behavior>,
}

impl StrategyFactory for Overrides {
    fn create(&self, strategy: StrategyId) -> Box<dyn Forecaster> {
        let behavior = self.everything.or_else(|| {
            self.scripted
                .iter()
                .find(|(id, _)| *id == strategy)
                .map(|(_, behavior)| *behavior)
        });
        match behavior {
            Some(behavior) => Box::new(Scripted { strategy, behavior }),
            None => self.builtin.create(strategy),
        }
    }
}

fn with_overrides(
    scripted: Vec<(StrategyId, Behavior)>,
    everything: Option<Behavior>,
) -> Orchestrator {
    orchestrator().with_factory(Arc::new(Overrides {
        builtin: BuiltinStrategies::default(),
        scripted,
        everything,
    }))
}

#[tokio::test]
async fn very_small_dataset_completes_with_moving_average() {
    let report = completed(
        orchestrator()
            .execute(RunRequest::new("scenario-a", dated_dataset(5, 0)).with_horizon(3))
            .await,
    );

    assert_eq!(report.decision.primary, StrategyId::MovingAverage);
    assert_eq!(report.model_type, StrategyId::MovingAverage);
    assert_eq!(report.forecast.len(), 3);
    assert!(report
        .context
        .warnings()
        .iter()
        .any(|w| w.contains("very small dataset")));
    assert_eq!(report.context.state(), RunState::Completed);
    assert_eq!(report.context.history().len(), StageName::SEQUENCE.len());
}

#[tokio::test]
async fn dated_target_only_routes_to_seasonal_decomposition() {
    let report = completed(
        orchestrator()
            .execute(RunRequest::new("scenario-b", dated_dataset(40, 0)))
            .await,
    );

    assert_eq!(report.decision.primary, StrategyId::SeasonalDecomposition);
    assert_eq!(
        report.decision.fallback_chain,
        vec![
            StrategyId::FeatureBoosting,
            StrategyId::LastValue,
            StrategyId::MovingAverage
        ]
    );
    assert_eq!(report.forecast.len(), PipelineConfig::default().horizon);
    assert!(report.forecast.timestamps.is_some());
    let stages: Vec<StageName> = report.context.history().iter().map(|r| r.stage).collect();
    assert_eq!(stages, StageName::SEQUENCE.to_vec());
}

#[tokio::test]
async fn feature_rich_history_routes_to_ensemble() {
    let report = completed(
        orchestrator()
            .execute(RunRequest::new("scenario-c", dated_dataset(200, 5)))
            .await,
    );

    assert_eq!(report.decision.primary, StrategyId::Ensemble);
    assert_eq!(report.model_type, StrategyId::Ensemble);
    let ensemble = report.ensemble.expect("ensemble report should be attached");
    assert!(!ensemble.contributions.is_empty());
    let total: f64 = ensemble.contributions.iter().map(|c| c.weight).sum();
    assert!((total - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn nan_metric_falls_through_to_next_candidate() {
    let orchestrator = with_overrides(
        vec![(StrategyId::SeasonalDecomposition, Behavior::NanMetric)],
        None,
    );
    let report = completed(
        orchestrator
            .execute(RunRequest::new("scenario-d", dated_dataset(40, 0)))
            .await,
    );

    assert_eq!(report.decision.primary, StrategyId::SeasonalDecomposition);
    assert_eq!(report.model_type, StrategyId::FeatureBoosting);
    assert_eq!(report.attempts[0].strategy, StrategyId::SeasonalDecomposition);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Failed);
    assert_eq!(
        report.context.metadata_value("model_type"),
        Some(&serde_json::json!("feature_boosting"))
    );
}

#[tokio::test]
async fn exhausted_chain_returns_generic_failure() {
    let orchestrator = with_overrides(Vec::new(), Some(Behavior::Refuse));
    let failure = failed(
        orchestrator
            .execute(RunRequest::new("fatal", dated_dataset(40, 0)))
            .await,
    );

    assert!(!failure.recoverable);
    assert_eq!(failure.stage, Some(StageName::Training));
    assert_eq!(failure.message, GENERIC_FAILURE_MESSAGE);
    assert!(failure.remediation.is_empty());
    assert!(!failure.message.contains("matrix rank"));

    let uuid = Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("pattern should compile");
    assert!(uuid.is_match(&failure.correlation_id.to_string()));
    assert_ne!(failure.correlation_id, failure.run_id);
}

#[tokio::test]
async fn panicking_predict_still_records_failed_training() {
    let orchestrator = with_overrides(Vec::new(), Some(Behavior::PanicOnPredict));
    let handle = orchestrator.start(RunRequest::new("predict-panic", dated_dataset(40, 0)));
    let status = handle.subscribe();
    let failure = failed(handle.wait().await);

    assert!(!failure.recoverable);
    assert_eq!(failure.stage, Some(StageName::Training));
    assert_eq!(failure.message, GENERIC_FAILURE_MESSAGE);
    assert!(!failure.message.contains("index out of range"));

    let ctx = failure.context.expect("context should survive the panic");
    assert_eq!(ctx.state(), RunState::Failed);
    let last = ctx.history().last().expect("training should be recorded");
    assert_eq!(last.stage, StageName::Training);
    assert_eq!(last.status, StageStatus::Failed);
    assert_eq!(status.borrow().state, RunState::Failed);
}

#[tokio::test]
async fn horizon_past_calendar_limit_drops_timestamps() {
    let mut csv = String::from("date,sales\n");
    for (i, year) in (1980..2020).enumerate() {
        csv.push_str(&format!("{year}-01-01,{}\n", 200 + (i % 4) * 15 + i * 2));
    }
    let roles = SemanticRoles::new("sales").with_date("date");
    let dataset = dataset_from_csv_reader(csv.as_bytes(), roles).expect("CSV should parse");

    let report = completed(
        orchestrator()
            .execute(RunRequest::new("yearly", dataset).with_horizon(300_000))
            .await,
    );

    assert_eq!(report.forecast.len(), 300_000);
    assert_eq!(report.forecast.timestamps, None);
}

#[test]
fn blocking_execute_does_not_wait_for_abandoned_attempts() {
    let config = PipelineConfig {
        attempt_budget_ms: 50,
        ..PipelineConfig::default()
    };
    let orchestrator = Orchestrator::new(config)
        .expect("valid config")
        .with_factory(Arc::new(Overrides {
            builtin: BuiltinStrategies::default(),
            scripted: Vec::new(),
            everything: Some(Behavior::Sleep(10_000)),
        }));

    let started = Instant::now();
    let outcome = orchestrator
        .execute_blocking(
            RunRequest::new("abandoned", dated_dataset(40, 0)),
            Duration::from_millis(100),
        )
        .expect("runtime should build");

    let failure = failed(outcome);
    assert_eq!(failure.stage, Some(StageName::Training));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn validation_failure_is_recoverable_with_remediation() {
    let roles = SemanticRoles::new("sales");
    let dataset = dataset_from_csv_reader("sales\n1\n2\n3\n".as_bytes(), roles)
        .expect("single-column CSV should parse");
    let failure = failed(
        orchestrator()
            .execute(RunRequest::new("one-column", dataset))
            .await,
    );

    assert!(failure.recoverable);
    assert_eq!(failure.stage, Some(StageName::UploadValidation));
    assert!(failure
        .remediation
        .iter()
        .any(|m| m.contains("at least 2 are required")));
    let ctx = failure.context.expect("context should be returned");
    assert_eq!(ctx.state(), RunState::Failed);
    assert_eq!(ctx.errors().len(), 1);
}

#[tokio::test]
async fn mostly_missing_dataset_fails_at_profile_boundary() {
    let mut csv = String::from("date,sales,a,b\n");
    for day in 1..=20 {
        csv.push_str(&format!("2024-01-{day:02},{},,\n", day * 3));
    }
    let roles = SemanticRoles::new("sales")
        .with_date("date")
        .with_features(["a", "b"]);
    let dataset = dataset_from_csv_reader(csv.as_bytes(), roles).expect("CSV should parse");

    let failure = failed(
        orchestrator()
            .execute(RunRequest::new("sparse", dataset))
            .await,
    );
    assert!(failure.recoverable);
    assert_eq!(failure.stage, Some(StageName::Profiling));
    assert!(failure.remediation[0].contains("missing"));
}

#[tokio::test]
async fn reject_policy_refuses_tiny_uploads() {
    let mut config = PipelineConfig::default();
    config.gates.small_dataset_policy = SmallDatasetPolicy::Reject;
    let orchestrator = Orchestrator::new(config).expect("config should be valid");

    let failure = failed(
        orchestrator
            .execute(RunRequest::new("tiny", dated_dataset(5, 0)))
            .await,
    );
    assert!(failure.recoverable);
    assert_eq!(failure.stage, Some(StageName::UploadValidation));
}

#[tokio::test]
async fn invalid_overrides_fail_at_ingestion() {
    let failure = failed(
        orchestrator()
            .execute(RunRequest::new("bad-horizon", dated_dataset(40, 0)).with_horizon(0))
            .await,
    );
    assert!(failure.recoverable);
    assert_eq!(failure.stage, Some(StageName::Ingestion));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_during_training_stops_the_run() {
    let orchestrator = with_overrides(Vec::new(), Some(Behavior::Sleep(1_500)));
    let handle = orchestrator.start(RunRequest::new("cancel", dated_dataset(40, 0)));
    let mut status = handle.subscribe();

    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.current_stage == Some(StageName::Training)),
    )
    .await
    .expect("run should reach training")
    .expect("status channel should stay open");

    handle.cancel();
    let started = std::time::Instant::now();
    let failure = failed(handle.wait().await);

    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert!(failure.recoverable);
    assert_eq!(failure.stage, Some(StageName::Training));
    assert_eq!(status.borrow().state, RunState::Failed);
}

#[tokio::test]
async fn status_channel_reports_completion() {
    let handle = orchestrator().start(RunRequest::new("status", dated_dataset(12, 0)));
    let status = handle.subscribe();
    let run_id = handle.run_id();

    let report = completed(handle.wait().await);
    assert_eq!(report.run_id, run_id);

    let last = status.borrow().clone();
    assert_eq!(last.state, RunState::Completed);
    assert_eq!(last.completed_stages, StageName::SEQUENCE.len());
    assert_eq!(last.quality_score, report.context.quality_score());
}

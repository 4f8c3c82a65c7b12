use std::path::PathBuf;
use std::time::Duration;

use adaptive_forecast::{
    init_logging, load_csv_dataset, log_app_start, logging_config_from_env,
    pipeline_config_from_env, Orchestrator, RunOutcome, RunRequest, SemanticRoles,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let pipeline_cfg = pipeline_config_from_env();
    log_app_start(&logging_cfg, &pipeline_cfg);

    let input: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FORECAST_INPUT").ok())
        .ok_or("usage: forecast_run <input.csv> (or set FORECAST_INPUT)")?
        .into();

    let dataset = load_csv_dataset(&input, roles_from_env())?;
    let session_id = std::env::var("FORECAST_SESSION_ID").unwrap_or_else(|_| "cli".to_string());

    let orchestrator = Orchestrator::new(pipeline_cfg)?;
    let outcome =
        orchestrator.execute_blocking(RunRequest::new(session_id, dataset), SHUTDOWN_GRACE)?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if let RunOutcome::Failed(_) = outcome {
        std::process::exit(1);
    }
    Ok(())
}

fn roles_from_env() -> SemanticRoles {
    let target = std::env::var("FORECAST_TARGET_COLUMN").unwrap_or_else(|_| "value".to_string());
    let mut roles = SemanticRoles::new(target.trim());

    if let Ok(date) = std::env::var("FORECAST_DATE_COLUMN") {
        let date = date.trim();
        if !date.is_empty() {
            roles = roles.with_date(date);
        }
    }

    if let Ok(features) = std::env::var("FORECAST_FEATURE_COLUMNS") {
        roles = roles.with_features(
            features
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty()),
        );
    }

    roles
}

use std::sync::Arc;

use adaptive_forecast::{
    dataset_from_csv_reader, InMemoryRunStore, Orchestrator, PipelineConfig, RunOutcome,
    RunRequest, RunState, RunStore, SemanticRoles, SqliteRunStore,
};

fn weekly_csv(rows: usize) -> String {
    let mut csv = String::from("date,orders,price\n");
    for i in 0..rows {
        let day = chrono::NaiveDate::from_ymd_opt(2023, 6, 5).expect("valid date")
            + chrono::Duration::days(i as i64);
        csv.push_str(&format!(
            "{},{},{:.2}\n",
            day.format("%Y-%m-%d"),
            20 + (i % 7) * 2,
            9.5 + (i % 3) as f64 * 0.25
        ));
    }
    csv
}

fn request(session: &str, rows: usize) -> RunRequest {
    let roles = SemanticRoles::new("orders")
        .with_date("date")
        .with_features(["price"]);
    let dataset =
        dataset_from_csv_reader(weekly_csv(rows).as_bytes(), roles).expect("CSV should parse");
    RunRequest::new(session, dataset)
}

#[tokio::test]
async fn sqlite_store_archives_completed_runs() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let path = dir.path().join("runs").join("contexts.sqlite");
    let store = Arc::new(SqliteRunStore::open(&path).expect("store should open"));

    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .expect("valid config")
        .with_store(store.clone());
    let outcome = orchestrator.execute(request("sqlite", 35)).await;
    let RunOutcome::Completed(report) = outcome else {
        panic!("run should complete");
    };

    assert_eq!(store.count().expect("count should work"), 1);
    let archived = store
        .load(report.run_id)
        .expect("load should work")
        .expect("context should be archived");
    assert_eq!(archived.state(), RunState::Completed);
    assert_eq!(archived.history(), report.context.history());
    assert_eq!(archived.warnings(), report.context.warnings());
    assert_eq!(
        archived.metadata_value("model_type"),
        report.context.metadata_value("model_type")
    );
    assert_eq!(archived.session_id(), "sqlite");
}

#[tokio::test]
async fn failed_runs_are_archived_too() {
    let store = Arc::new(InMemoryRunStore::new());
    let orchestrator = Orchestrator::new(PipelineConfig::default())
        .expect("valid config")
        .with_store(store.clone());

    let outcome = orchestrator
        .execute(request("bad", 35).with_confidence_level(1.5))
        .await;
    let RunOutcome::Failed(failure) = outcome else {
        panic!("invalid confidence level should fail the run");
    };

    let archived = store
        .load(failure.run_id)
        .expect("load should work")
        .expect("context should be archived");
    assert_eq!(archived.state(), RunState::Failed);
    assert_eq!(Some(archived), failure.context);
}

#[test]
fn reopening_sqlite_store_keeps_contexts() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let path = dir.path().join("contexts.sqlite");
    let ctx = adaptive_forecast::PipelineContext::new(uuid::Uuid::new_v4(), "reopen");

    {
        let store = SqliteRunStore::open(&path).expect("store should open");
        store.archive(&ctx).expect("archive should work");
        store.archive(&ctx).expect("re-archiving should upsert");
    }

    let store = SqliteRunStore::open(&path).expect("store should reopen");
    assert_eq!(store.count().expect("count should work"), 1);
    assert_eq!(store.load(ctx.run_id()).expect("load should work"), Some(ctx));
}

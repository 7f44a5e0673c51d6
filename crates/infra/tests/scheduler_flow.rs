//! End-to-end scheduler flow against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::json;

use resaleops_core::DomainError;
use resaleops_infra::config::JobEngineConfig;
use resaleops_infra::jobs::{
    InMemoryJobStore, Job, JobExecutor, JobId, JobStatus, JobStore, Priority, RetryPolicy,
};
use resaleops_infra::scheduler::{ExecutionStatus, Scheduler, SchedulerError};

fn setup() -> (Scheduler<InMemoryJobStore>, Arc<InMemoryJobStore>) {
    resaleops_observability::init();
    let store = InMemoryJobStore::arc();
    let config = JobEngineConfig {
        history_limit: 3,
        ..JobEngineConfig::default()
    };
    let scheduler = Scheduler::from_config(JobExecutor::new(store.clone()), &config);
    (scheduler, store)
}

fn healthy(id: &str) -> Job {
    let name = id.to_string();
    Job::new(id, id, move |_ctx| {
        let name = name.clone();
        async move { Ok(json!({ "synced": name })) }
    })
}

#[tokio::test]
async fn register_toggle_and_delete_lifecycle() {
    let (scheduler, _store) = setup();

    let relist = scheduler
        .register_scheduled_job(
            "nightly-relist",
            "relist stale items",
            "0 3 * * *",
            json!({"shop": "mercari"}),
        )
        .await
        .unwrap();
    let prices = scheduler
        .register_scheduled_job("price-sync", "", "*/15 * * * *", json!({}))
        .await
        .unwrap();

    let active: Vec<_> = scheduler
        .get_active_scheduled_jobs()
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(active, vec![relist, prices]);

    scheduler.toggle_job_enabled(relist, false).await.unwrap();

    let active = scheduler.get_active_scheduled_jobs().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, prices);

    let all = scheduler.get_all_job_status().await.unwrap();
    assert_eq!(all.len(), 2);
    let disabled = all.iter().find(|j| j.id == relist).unwrap();
    assert!(!disabled.is_enabled);
    assert_eq!(disabled.metadata["shop"], "mercari");

    scheduler.toggle_job_enabled(relist, true).await.unwrap();
    assert_eq!(scheduler.get_active_scheduled_jobs().await.unwrap().len(), 2);

    scheduler.delete_scheduled_job(prices).await.unwrap();
    assert!(scheduler.get_scheduled_job(prices).await.unwrap().is_none());
    assert!(matches!(
        scheduler.delete_scheduled_job(prices).await,
        Err(SchedulerError::Store(_))
    ));
}

#[tokio::test]
async fn three_healthy_jobs_produce_a_clean_run() {
    let (scheduler, store) = setup();
    let id = scheduler
        .register_scheduled_job("inventory-pull", "", "@hourly", json!({}))
        .await
        .unwrap();

    let summary = scheduler
        .execute_job(id, || async {
            Ok(vec![healthy("ebay"), healthy("mercari"), healthy("rakuma")])
        })
        .await
        .unwrap();

    assert_eq!(
        (summary.total_jobs, summary.successful, summary.failed, summary.timeout),
        (3, 3, 0, 0)
    );

    let logs = store
        .list_job_executions(&JobId::new("mercari"), 10)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, JobStatus::Completed);
    assert_eq!(logs[0].result, Some(json!({ "synced": "mercari" })));

    let history = scheduler.get_execution_history(id, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Success);
    assert_eq!(history[0].summary.successful, 3);

    let job = scheduler.get_scheduled_job(id).await.unwrap().unwrap();
    assert_eq!(job.last_status, Some(ExecutionStatus::Success));
    assert_eq!(job.last_run_at, Some(history[0].started_at));
}

#[tokio::test]
async fn factory_failure_leaves_one_failed_row_and_surfaces() {
    let (scheduler, store) = setup();
    let id = scheduler
        .register_scheduled_job("supplier-import", "", "@daily", json!({}))
        .await
        .unwrap();

    let result = scheduler
        .execute_job(id, || async { Err(anyhow!("supplier API returned 401")) })
        .await;

    match result {
        Err(SchedulerError::Factory(msg)) => assert_eq!(msg, "supplier API returned 401"),
        other => panic!("expected factory error, got {other:?}"),
    }

    let history = scheduler.get_execution_history(id, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Failed);
    assert_eq!(history[0].summary.total_jobs, 0);
    assert_eq!(history[0].error.as_deref(), Some("supplier API returned 401"));
    assert!(store.execution_logs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timed_out_job_fails_the_run() {
    let (scheduler, _store) = setup();
    let id = scheduler
        .register_scheduled_job("photo-upload", "", "@hourly", json!({}))
        .await
        .unwrap();

    let summary = scheduler
        .execute_job(id, || async {
            Ok(vec![
                healthy("thumb"),
                Job::new("upload", "upload", |_ctx| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(json!(null))
                })
                .with_timeout(Duration::from_secs(5))
                .with_priority(Priority::High),
            ])
        })
        .await
        .unwrap();

    assert_eq!(summary.timeout, 1);
    assert_eq!(summary.successful, 1);

    let job = scheduler.get_scheduled_job(id).await.unwrap().unwrap();
    assert_eq!(job.last_status, Some(ExecutionStatus::Failed));
    assert!(job.last_error.unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn retries_are_visible_in_the_run_summary() {
    let (scheduler, _store) = setup();
    let id = scheduler
        .register_scheduled_job("flaky-sync", "", "@hourly", json!({}))
        .await
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let summary = scheduler
        .execute_job(id, move || async move {
            Ok(vec![
                Job::new("flaky", "flaky", move |ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if ctx.attempt() == 0 {
                            Err(anyhow!("rate limited"))
                        } else {
                            Ok(json!("ok"))
                        }
                    }
                })
                .with_retry_policy(RetryPolicy::exponential(
                    3,
                    Duration::from_millis(100),
                    Duration::from_secs(1),
                )),
            ])
        })
        .await
        .unwrap();

    assert_eq!(summary.successful, 1);
    assert_eq!(summary.results[0].retry_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn history_is_newest_first_and_limited() {
    let (scheduler, _store) = setup();
    let id = scheduler
        .register_scheduled_job("stats-rollup", "", "@hourly", json!({}))
        .await
        .unwrap();

    for _ in 0..5 {
        scheduler
            .execute_job(id, || async { Ok(vec![healthy("rollup")]) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let limited = scheduler.get_execution_history(id, None).await.unwrap();
    assert_eq!(limited.len(), 3);
    assert!(limited.windows(2).all(|w| w[0].started_at >= w[1].started_at));

    let all = scheduler.get_execution_history(id, Some(10)).await.unwrap();
    assert_eq!(all.len(), 5);
    assert_eq!(all[0].id, limited[0].id);
}

#[tokio::test]
async fn blank_definitions_are_rejected() {
    let (scheduler, _store) = setup();

    let err = scheduler
        .register_scheduled_job("", "no name", "@daily", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::Validation(DomainError::Validation(_))));
    assert!(scheduler.get_all_job_status().await.unwrap().is_empty());
}

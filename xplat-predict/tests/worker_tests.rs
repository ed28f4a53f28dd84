//! Worker pool lifecycle: background processing, wakeups, recovery and shutdown

mod helpers;

use helpers::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn wait_until_finished(app: &TestApp, prediction_id: Uuid) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let statuses = app.record_statuses(prediction_id).await;
        if statuses.iter().all(|s| s == "SUCCESS" || s == "ERROR") && app.job_count().await == 0 {
            return statuses;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "records not finished in time: {:?}",
            statuses
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workers_process_uploads_in_background() {
    let app = create_test_app().await;
    let shutdown = CancellationToken::new();
    let handle = app.workers.spawn(shutdown.clone());

    let prediction_id = app
        .create_prediction("x,y\n1,0\n6,0\n-1,0\n9,0\n", "churn-xgb")
        .await;

    let statuses = wait_until_finished(&app, prediction_id).await;
    assert_eq!(statuses, ["SUCCESS", "SUCCESS", "ERROR", "SUCCESS"]);
    assert_eq!(app.inference.predict_count(), 4);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle.join())
        .await
        .expect("workers did not stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enqueue_wakes_idle_workers_before_poll_interval() {
    let mut config = queue_config();
    config.poll_interval = Duration::from_secs(30);
    let app = create_test_app_with(config).await;

    let shutdown = CancellationToken::new();
    let handle = app.workers.spawn(shutdown.clone());

    // Let every worker reach its idle wait
    tokio::time::sleep(Duration::from_millis(100)).await;

    let prediction_id = app.create_prediction("x\n2\n", "churn-xgb").await;
    let statuses = wait_until_finished(&app, prediction_id).await;
    assert_eq!(statuses, ["SUCCESS"]);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle.join())
        .await
        .expect("workers did not stop");
}

#[tokio::test]
async fn test_idle_pool_stops_promptly() {
    let mut config = queue_config();
    config.poll_interval = Duration::from_secs(30);
    let app = create_test_app_with(config).await;

    let shutdown = CancellationToken::new();
    let handle = app.workers.spawn(shutdown.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle.join())
        .await
        .expect("idle workers did not stop");
}

#[tokio::test]
async fn test_jobs_left_active_are_recovered() {
    let app = create_test_app().await;
    let prediction_id = app.create_prediction("x\n3\n4\n", "churn-xgb").await;

    // Simulate a process that died mid-job
    sqlx::query("UPDATE jobs SET state = 'active', attempts = 1")
        .execute(&app.pool)
        .await
        .unwrap();
    assert_eq!(app.drain().await, 0);

    assert_eq!(app.state.queue.recover_stale().await.unwrap(), 3);
    assert_eq!(app.drain().await, 3);
    assert_eq!(app.record_statuses(prediction_id).await, ["SUCCESS", "SUCCESS"]);
    assert_eq!(app.job_count().await, 0);
}

#[tokio::test]
async fn test_canceled_batch_jobs_never_reach_workers() {
    let app = create_test_app().await;
    let prediction_id = app.create_prediction("x\n3\n4\n", "churn-xgb").await;

    app.state.predictions.cancel(prediction_id).await.unwrap();
    assert_eq!(app.drain().await, 0);
    assert_eq!(app.inference.predict_count(), 0);
    assert_eq!(
        app.inference.heatmap_calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

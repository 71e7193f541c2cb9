use agentmesh::performance::PerformanceTracker;

mod common;

#[tokio::test]
async fn test_ranking_orders_by_score() {
    let dir = common::temp_dir("perf_rank");
    let tracker = PerformanceTracker::new(dir.join("metrics.json"));

    // Reliable and fast.
    for _ in 0..10 {
        tracker.record_call("openrouter", "good", 500.0, true).await;
    }
    // Unreliable.
    for i in 0..10 {
        tracker
            .record_call("openrouter", "flaky", 500.0, i % 2 == 0)
            .await;
    }
    // Slow but reliable.
    for _ in 0..10 {
        tracker.record_call("openrouter", "slow", 20_000.0, true).await;
    }

    let ranked = tracker.get_ranked_models(Some("openrouter"), 5).await;
    let order: Vec<&str> = ranked.iter().map(|r| r.model_id.as_str()).collect();
    assert_eq!(order[0], "good");
    assert!(ranked[0].score > ranked[1].score);
    // The flaky model's 50% success rate hurts more than the slow model's
    // latency penalty.
    assert_eq!(order[1], "slow");
    assert_eq!(order[2], "flaky");
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_metrics_roundtrip() {
    let dir = common::temp_dir("perf_roundtrip");
    let path = dir.join("metrics.json");
    {
        let tracker = PerformanceTracker::new(&path);
        tracker.record_call("openrouter", "m1", 1200.0, true).await;
        tracker.record_call("openrouter", "m1", 900.0, false).await;
        tracker.save_metrics().await.unwrap();
    }
    let tracker = PerformanceTracker::new(&path);
    let metrics = tracker.metrics_for("openrouter", "m1").await.unwrap();
    assert_eq!(metrics.call_count, 2);
    assert_eq!(metrics.success_count, 1);
    assert_eq!(metrics.failure_count, 1);
    assert!((metrics.total_duration_ms - 1200.0).abs() < 1e-9);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_score_for_unknown_pair_is_neutral() {
    let dir = common::temp_dir("perf_unknown");
    let tracker = PerformanceTracker::new(dir.join("metrics.json"));
    assert_eq!(tracker.score_for("nowhere", "nothing").await, 0.0);
    let _ = std::fs::remove_dir_all(&dir);
}

//! Collective decisions driven through a running swarm's message loop.

use std::time::Duration;

use serde_json::json;

use hive::collective::FALLBACK_CONFIDENCE;
use hive::{Swarm, Task, TaskId, TaskResult, VotingMethod, Worker};

use crate::fixtures::{fast_config, ScriptedWorker};

fn options(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_majority_decision_through_swarm() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();

    for (name, option) in [("a", "approve"), ("b", "approve"), ("c", "reject")] {
        swarm
            .add_worker(ScriptedWorker::builder(name).votes(option, 0.9).build())
            .await;
    }

    let decision = swarm
        .collective()
        .decide(
            "ship it?",
            &options(&["approve", "reject"]),
            VotingMethod::Majority,
            Duration::from_secs(2),
            None,
        )
        .await
        .unwrap();

    assert_eq!(decision.decision.as_deref(), Some("approve"));
    assert_eq!(decision.votes.len(), 3);
    assert!((decision.confidence - 2.0 / 3.0).abs() < 1e-9);

    swarm.stop().await;
}

#[tokio::test]
async fn test_consensus_fails_closed_on_split_vote() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();
    swarm
        .add_worker(ScriptedWorker::builder("a").votes("x", 1.0).build())
        .await;
    swarm
        .add_worker(ScriptedWorker::builder("b").votes("y", 1.0).build())
        .await;

    let decision = swarm
        .collective()
        .decide(
            "split?",
            &options(&["x", "y"]),
            VotingMethod::Consensus,
            Duration::from_secs(2),
            None,
        )
        .await
        .unwrap();

    // An even split cannot reach the consensus threshold.
    assert!(decision.decision.is_none());
    assert_eq!(decision.confidence, 0.0);
    assert_eq!(decision.method, "consensus_failed");

    swarm.stop().await;
}

#[tokio::test]
async fn test_borda_decision_through_swarm() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();
    swarm
        .add_worker(ScriptedWorker::builder("a").votes("blue", 0.9).build())
        .await;
    swarm
        .add_worker(ScriptedWorker::builder("b").votes("blue", 0.8).build())
        .await;
    swarm
        .add_worker(ScriptedWorker::builder("c").votes("green", 0.4).build())
        .await;

    let decision = swarm
        .collective()
        .decide(
            "color?",
            &options(&["red", "green", "blue"]),
            VotingMethod::BordaCount,
            Duration::from_secs(2),
            None,
        )
        .await
        .unwrap();

    assert_eq!(decision.decision.as_deref(), Some("blue"));
    assert!(decision.confidence > 0.0 && decision.confidence <= 1.0);

    swarm.stop().await;
}

#[tokio::test]
async fn test_weighted_decision_respects_reputation() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();

    let trusted = ScriptedWorker::builder("trusted").votes("a", 0.9).build();
    let distrusted = ScriptedWorker::builder("distrusted").votes("b", 0.9).build();
    let distrusted_id = distrusted.id();
    swarm.add_worker(trusted).await;
    swarm.add_worker(distrusted).await;

    // Tank the distrusted worker's reputation with a failure batch.
    let collective = swarm.collective();
    for _ in 0..30 {
        collective.update_performance(&[TaskResult::failure(
            TaskId::new(),
            Some(distrusted_id),
            "flaky",
            Duration::ZERO,
        )]);
    }

    let decision = collective
        .decide(
            "who wins?",
            &options(&["a", "b"]),
            VotingMethod::Weighted,
            Duration::from_secs(2),
            None,
        )
        .await
        .unwrap();

    assert_eq!(decision.decision.as_deref(), Some("a"));
    assert!(decision.confidence > 0.5);

    swarm.stop().await;
}

#[tokio::test]
async fn test_non_voting_worker_contributes_fallback() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();

    let voter = ScriptedWorker::builder("voter").votes("approve", 1.0).build();
    let mute = ScriptedWorker::builder("mute").build();
    let mute_id = mute.id();
    swarm.add_worker(voter).await;
    swarm.add_worker(mute).await;

    let decision = swarm
        .collective()
        .decide(
            "anyone home?",
            &options(&["approve", "reject"]),
            VotingMethod::Majority,
            Duration::from_millis(300),
            None,
        )
        .await
        .unwrap();

    // The mute worker timed out and was replaced by a fallback vote, so the
    // round still completed with a full vote set.
    assert_eq!(decision.votes.len(), 2);
    let fallback = decision
        .votes
        .iter()
        .find(|v| v.worker_id == mute_id)
        .unwrap();
    assert_eq!(fallback.confidence, FALLBACK_CONFIDENCE);

    swarm.stop().await;
}

#[tokio::test]
async fn test_knowledge_flows_through_swarm_collective() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();

    let a = ScriptedWorker::analyzer("a");
    let b = ScriptedWorker::analyzer("b");
    let c = ScriptedWorker::analyzer("c");
    let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());
    for worker in [a, b, c] {
        swarm.add_worker(worker).await;
    }

    let collective = swarm.collective();
    collective.share_knowledge(a_id, "entrypoint", json!("src/lib.rs"), 1.0);
    collective.share_knowledge(b_id, "entrypoint", json!("src/lib.rs"), 0.9);
    collective.share_knowledge(c_id, "entrypoint", json!("src/lib.rs"), 0.8);

    assert_eq!(
        collective.get_knowledge("entrypoint"),
        Some(json!("src/lib.rs"))
    );

    let metrics = collective.metrics();
    assert_eq!(metrics.registered_workers, 3);
    assert_eq!(metrics.knowledge_items, 1);
    assert_eq!(metrics.confirmed_knowledge_items, 1);

    swarm.stop().await;
}

#[tokio::test]
async fn test_decision_history_feeds_patterns() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();
    swarm
        .add_worker(ScriptedWorker::builder("a").votes("yes", 0.9).build())
        .await;
    swarm
        .add_worker(ScriptedWorker::builder("b").votes("yes", 0.9).build())
        .await;

    let collective = swarm.collective();
    for _ in 0..5 {
        collective
            .decide(
                "again?",
                &options(&["yes", "no"]),
                VotingMethod::Weighted,
                Duration::from_secs(2),
                None,
            )
            .await
            .unwrap();
    }

    let patterns = collective.detect_patterns();
    assert_eq!(patterns.method_preference.get("weighted"), Some(&5));
    assert!(patterns.confidence_trend.is_some());
    assert_eq!(collective.metrics().decisions_made, 5);

    swarm.stop().await;
}

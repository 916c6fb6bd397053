//! End-to-end swarm scenarios: dispatch, retries, lifecycle, invariants.

use std::time::Duration;

use serde_json::json;

use hive::{Swarm, SwarmConfig, Task, Worker, WorkerState};

use crate::fixtures::{fast_config, ScriptedWorker};

#[tokio::test]
async fn test_five_tasks_across_three_workers() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();

    let workers = [
        ScriptedWorker::builder("w1")
            .capability("analyze")
            .delay(Duration::from_millis(30))
            .build(),
        ScriptedWorker::builder("w2")
            .capability("analyze")
            .delay(Duration::from_millis(30))
            .build(),
        ScriptedWorker::builder("w3")
            .capability("analyze")
            .delay(Duration::from_millis(30))
            .build(),
    ];
    for worker in &workers {
        assert!(swarm.add_worker(worker.clone()).await);
    }

    let tasks: Vec<Task> = (0..5)
        .map(|i| Task::new(json!(i)).with_priority(1).requiring("analyze"))
        .collect();
    let results = swarm.submit_batch(tasks).await;

    // All five complete successfully.
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.success));

    // No worker ever exceeded its concurrency limit of 1.
    for worker in &workers {
        assert!(
            worker.peak_load() <= 1,
            "worker {} peaked at load {}",
            worker.name(),
            worker.peak_load()
        );
    }

    // The counter loop consumes scheduler events asynchronously.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = swarm.status().await;
    assert_eq!(status.successful_tasks, 5);
    assert_eq!(status.failed_tasks, 0);
    assert_eq!(status.success_rate, 1.0);

    swarm.stop().await;
}

#[tokio::test]
async fn test_always_failing_worker_exhausts_attempts() {
    let config = fast_config();
    let max_attempts = config.max_task_attempts as usize;
    let swarm = Swarm::new(config);
    swarm.start().unwrap();

    let worker = ScriptedWorker::builder("broken").always_fail().build();
    swarm.add_worker(worker.clone()).await;

    let task = Task::new("doomed");
    let task_id = task.id;
    let result = swarm.submit(task).await;

    assert!(!result.success);
    // Exactly max_attempts execution attempts, each recorded as a failure.
    assert_eq!(worker.executions(), max_attempts);
    let attempts: Vec<_> = worker
        .core()
        .history()
        .into_iter()
        .filter(|r| r.task_id == task_id)
        .collect();
    assert_eq!(attempts.len(), max_attempts);
    assert!(attempts.iter().all(|r| !r.success));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = swarm.status().await;
    assert_eq!(status.failed_tasks, 1);
    assert_eq!(status.queue.failed_tasks, 1);

    swarm.stop().await;
}

#[tokio::test]
async fn test_capability_mismatch_blocks_until_capable_worker_joins() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();
    swarm
        .add_worker(ScriptedWorker::builder("generalist").build())
        .await;

    // Nobody declares "review" yet: the task waits in the backlog until a
    // capable worker joins.
    let task = Task::new("needs review").requiring("review");
    let task_id = task.id;
    let reviewer = ScriptedWorker::builder("reviewer").capability("review").build();

    let (result, _) = tokio::join!(swarm.submit(task), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        swarm.add_worker(reviewer.clone()).await;
    });

    assert!(result.success);
    assert_eq!(result.task_id, task_id);
    assert_eq!(reviewer.executions(), 1);

    swarm.stop().await;
}

#[tokio::test]
async fn test_remove_worker_mid_run_cancels_its_work() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();

    let slow = ScriptedWorker::builder("slow")
        .capability("analyze")
        .delay(Duration::from_secs(30))
        .build();
    let slow_id = slow.id();
    swarm.add_worker(slow.clone()).await;

    // The task occupies the slow worker until the worker is removed, which
    // cancels its in-flight assignment.
    let task = Task::new("stuck").requiring("analyze");
    let task_id = task.id;

    let (result, removed) = tokio::join!(swarm.submit(task), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        swarm.remove_worker(slow_id).await
    });

    assert!(removed);
    assert!(!result.success);
    assert_eq!(result.task_id, task_id);
    assert_eq!(slow.state(), WorkerState::Shutdown);
    assert_eq!(swarm.status().await.worker_count, 0);

    swarm.stop().await;
}

#[tokio::test]
async fn test_priority_order_with_single_worker() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();

    let worker = ScriptedWorker::builder("solo")
        .capability("analyze")
        .delay(Duration::from_millis(120))
        .build();
    swarm.add_worker(worker.clone()).await;

    // A blocker task occupies the worker while the low- and high-priority
    // tasks accumulate in the backlog; when the worker frees up, the
    // high-priority task must run before the earlier-submitted low one.
    let blocker = Task::new("blocker").requiring("analyze");
    let low = Task::new("low").with_priority(1).requiring("analyze");
    let high = Task::new("high").with_priority(9).requiring("analyze");
    let blocker_id = blocker.id;
    let low_id = low.id;
    let high_id = high.id;

    let (blocker_result, low_result, high_result) = tokio::join!(
        swarm.submit(blocker),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            swarm.submit(low).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            swarm.submit(high).await
        },
    );

    assert!(blocker_result.success);
    assert!(low_result.success);
    assert!(high_result.success);

    let history: Vec<_> = worker.core().history().iter().map(|r| r.task_id).collect();
    assert_eq!(history, vec![blocker_id, high_id, low_id]);

    swarm.stop().await;
}

#[tokio::test]
async fn test_task_timeout_is_a_retryable_failure() {
    let mut config = fast_config();
    config.max_task_attempts = 2;
    let swarm = Swarm::new(config);
    swarm.start().unwrap();

    let sluggish = ScriptedWorker::builder("sluggish")
        .capability("analyze")
        .delay(Duration::from_secs(10))
        .build();
    swarm.add_worker(sluggish.clone()).await;

    let task = Task::new("slow job")
        .requiring("analyze")
        .with_timeout(Duration::from_millis(50));
    let result = swarm.submit(task).await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(sluggish.executions(), 2);

    swarm.stop().await;
}

#[tokio::test]
async fn test_status_reflects_mixed_outcomes() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();
    swarm
        .add_worker(ScriptedWorker::analyzer("good"))
        .await;

    let ok = swarm.submit(Task::new("fine").requiring("analyze")).await;
    assert!(ok.success);

    let impossible = swarm
        .submit(
            Task::new("never")
                .requiring("missing-capability")
                .with_timeout(Duration::from_millis(100)),
        )
        .await;
    assert!(!impossible.success);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = swarm.status().await;
    assert_eq!(status.worker_count, 1);
    assert_eq!(status.successful_tasks, 1);
    assert!(status.uptime_secs > 0.0);
    assert!(status.success_rate <= 1.0);

    let list = swarm.worker_list().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].metrics.total_tasks, 1);

    swarm.stop().await;
}

#[tokio::test]
async fn test_scheduler_assignment_reports_terminal_status() {
    let swarm = Swarm::new(fast_config());
    swarm.start().unwrap();
    swarm.add_worker(ScriptedWorker::analyzer("w")).await;

    let task = Task::new("tracked").requiring("analyze");
    let result = swarm.submit(task).await;
    assert!(result.success);

    let queue = swarm.status().await.queue;
    assert_eq!(queue.completed_tasks, 1);
    assert_eq!(queue.pending_tasks, 0);
    assert_eq!(queue.in_progress_tasks, 0);
    assert_eq!(queue.total_assignments, 1);

    swarm.stop().await;
}

#[tokio::test]
async fn test_custom_strategy_config_end_to_end() {
    let swarm = Swarm::new(SwarmConfig {
        strategy: hive::Strategy::RoundRobin,
        ..fast_config()
    });
    swarm.start().unwrap();

    let a = ScriptedWorker::analyzer("a");
    let b = ScriptedWorker::analyzer("b");
    swarm.add_worker(a.clone()).await;
    swarm.add_worker(b.clone()).await;

    let tasks: Vec<Task> = (0..4)
        .map(|i| Task::new(json!(i)).requiring("analyze"))
        .collect();
    let results = swarm.submit_batch(tasks).await;

    assert!(results.iter().all(|r| r.success));
    // Round-robin spreads work across both workers.
    assert!(a.executions() >= 1);
    assert!(b.executions() >= 1);

    swarm.stop().await;
}

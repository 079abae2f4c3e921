//! End-to-end scenarios against a running `Runner`: linear propagation,
//! cross-pipeline isolation, and bounded shutdown.

use std::sync::Arc;
use std::time::Duration;

use angzarr_runner::config::RunnerConfig;
use angzarr_runner::model::{NewEvent, PipelineId};
use angzarr_runner::process::{DecodedEvent, Policy, ProcessApplication, StoreBackedProcess};
use angzarr_runner::runner::Runner;
use angzarr_runner::store::{InMemoryRecordStore, RecordStore};
use angzarr_runner::system::{ProcessFactory, System};

/// A policy that forwards every upstream event verbatim — enough to observe
/// propagation without caring about any particular domain.
struct EchoPolicy;

impl Policy for EchoPolicy {
    fn handle(&self, _upstream: &str, event: &DecodedEvent) -> Vec<NewEvent> {
        vec![NewEvent::new(event.topic.clone(), event.state.clone())]
    }
}

fn echo_factory(name: &'static str) -> ProcessFactory {
    Arc::new(move |pipeline: PipelineId, store: Arc<dyn RecordStore>| {
        Arc::new(StoreBackedProcess::new(name, pipeline, store, EchoPolicy)) as Arc<dyn ProcessApplication>
    })
}

async fn wait_for_count(
    store: &InMemoryRecordStore,
    pipeline: PipelineId,
    process: &str,
    expected: usize,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let notifications = store.get_notifications(pipeline, process, None, None).await.unwrap();
        if notifications.len() == expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "expected {expected} notifications for '{process}' in pipeline {pipeline}, saw {}",
                notifications.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn linear_pipeline_propagates_events_downstream() {
    let store = Arc::new(InMemoryRecordStore::new());
    let dyn_store: Arc<dyn RecordStore> = store.clone();

    let system = System::new([("a", "b")])
        .with_factory("a", echo_factory("a"))
        .with_factory("b", echo_factory("b"));
    let config = RunnerConfig {
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };

    let runner = Runner::start(system, config, dyn_store).await.unwrap();

    let args = serde_json::json!([
        {"topic": "created", "state": {"n": 1}},
        {"topic": "created", "state": {"n": 2}},
    ]);
    runner.call("a", 0, "emit", args).await.unwrap();

    wait_for_count(&store, 0, "b", 2, Duration::from_secs(2)).await;

    runner.close().await;
}

#[tokio::test]
async fn pipelines_stay_isolated_across_a_fan_in() {
    let store = Arc::new(InMemoryRecordStore::new());
    let dyn_store: Arc<dyn RecordStore> = store.clone();

    let system = System::new([("a", "b")])
        .with_factory("a", echo_factory("a"))
        .with_factory("b", echo_factory("b"));
    let config = RunnerConfig {
        pipeline_ids: vec![0, 1],
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    };

    let runner = Runner::start(system, config, dyn_store).await.unwrap();

    runner
        .call("a", 0, "emit", serde_json::json!([{"topic": "x", "state": 1}]))
        .await
        .unwrap();
    runner
        .call(
            "a",
            1,
            "emit",
            serde_json::json!([{"topic": "x", "state": 1}, {"topic": "x", "state": 2}]),
        )
        .await
        .unwrap();

    wait_for_count(&store, 0, "b", 1, Duration::from_secs(2)).await;
    wait_for_count(&store, 1, "b", 2, Duration::from_secs(2)).await;

    runner.close().await;
}

#[tokio::test]
async fn close_completes_within_the_bounded_timeout_with_work_in_flight() {
    let store = Arc::new(InMemoryRecordStore::new());
    let dyn_store: Arc<dyn RecordStore> = store.clone();

    let system = System::new([("a", "b")])
        .with_factory("a", echo_factory("a"))
        .with_factory("b", echo_factory("b"));
    let config = RunnerConfig {
        poll_interval: Duration::from_millis(30),
        ..Default::default()
    };

    let runner = Runner::start(system, config, dyn_store).await.unwrap();
    runner
        .call("a", 0, "emit", serde_json::json!([{"topic": "x", "state": 1}]))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), runner.close())
        .await
        .expect("close should complete within its bounded timeout");
}

#[tokio::test]
async fn puller_catches_up_after_a_dropped_prompt() {
    // Append directly to the backing store instead of driving "a" through
    // `call("emit", ...)`: this bypasses the process application's prompt
    // hook entirely, simulating a lost prompt. Recovery must come from the
    // Puller's periodic poll-interval fallback alone.
    let store = Arc::new(InMemoryRecordStore::new());
    let dyn_store: Arc<dyn RecordStore> = store.clone();

    let system = System::new([("a", "b")])
        .with_factory("a", echo_factory("a"))
        .with_factory("b", echo_factory("b"));
    let poll_interval = Duration::from_millis(40);
    let config = RunnerConfig {
        poll_interval,
        ..Default::default()
    };

    let runner = Runner::start(system, config, dyn_store).await.unwrap();

    store
        .append(
            0,
            "a",
            (1..=5)
                .map(|n| NewEvent::new("created", serde_json::json!({"n": n})))
                .collect(),
        )
        .await
        .unwrap();

    // No prompt was ever sent for this append; only the polling fallback
    // can surface it, within roughly 2x the poll interval.
    wait_for_count(&store, 0, "b", 5, Duration::from_secs(2)).await;

    runner.close().await;
}

#[tokio::test]
async fn causal_dependency_stall_resolves_once_the_dependency_catches_up() {
    // System A -> B, A -> C, C -> B. The event A delivers to B declares a
    // causal dependency on a C notification that hasn't been produced (and
    // thus tracked by B) yet, so B must stall, reset, and only complete
    // once B has also caught up on C via the C -> B edge.
    let store = Arc::new(InMemoryRecordStore::new());
    let dyn_store: Arc<dyn RecordStore> = store.clone();

    let system = System::new([("a", "b"), ("a", "c"), ("c", "b")])
        .with_factory("a", echo_factory("a"))
        .with_factory("b", echo_factory("b"))
        .with_factory("c", echo_factory("c"));
    let config = RunnerConfig {
        poll_interval: Duration::from_millis(30),
        ..Default::default()
    };

    let runner = Runner::start(system, config, dyn_store).await.unwrap();

    // First A-event carries no dependency: both B and C consume it freely,
    // and C's echo produces c#1.
    runner
        .call(
            "a",
            0,
            "emit",
            serde_json::json!([{"topic": "created", "state": {"n": 1}}]),
        )
        .await
        .unwrap();
    wait_for_count(&store, 0, "c", 1, Duration::from_secs(2)).await;
    wait_for_count(&store, 0, "b", 1, Duration::from_secs(2)).await;

    // Second A-event depends on c#1. B also follows "c" directly (the
    // C -> B edge) and will have already tracked c#1 by the time it
    // re-attempts this notification after its first causal-dependency
    // stall and reset, so it completes; a Notification's causal
    // dependencies are checked identically for every follower of "a", so C
    // would stall forever checking a dependency on its own output — this
    // is why the test only asserts on B's progress past this point.
    runner
        .call(
            "a",
            0,
            "emit",
            serde_json::json!([{
                "topic": "created",
                "state": {"n": 2},
                "causal_dependencies": [
                    {"pipeline": 0, "upstream_process": "c", "notification_id": 1}
                ]
            }]),
        )
        .await
        .unwrap();

    wait_for_count(&store, 0, "b", 2, Duration::from_secs(3)).await;

    runner.close().await;
}

#[tokio::test]
async fn redelivering_an_already_tracked_notification_is_a_no_op() {
    // Once the runner has processed a#1 into b, a second, independent
    // delivery of the same notification id must not produce a duplicate
    // event or a second tracking row — the store's uniqueness constraint
    // on (downstream, upstream, pipeline, notification_id) is the sole
    // source of truth, and the host handles it as a no-op.
    let store = Arc::new(InMemoryRecordStore::new());
    let dyn_store: Arc<dyn RecordStore> = store.clone();

    let system = System::new([("a", "b")])
        .with_factory("a", echo_factory("a"))
        .with_factory("b", echo_factory("b"));
    let config = RunnerConfig {
        poll_interval: Duration::from_millis(40),
        ..Default::default()
    };

    let runner = Runner::start(system, config, dyn_store).await.unwrap();

    runner
        .call(
            "a",
            0,
            "emit",
            serde_json::json!([{"topic": "created", "state": {"n": 1}}]),
        )
        .await
        .unwrap();
    wait_for_count(&store, 0, "b", 1, Duration::from_secs(2)).await;

    // Re-deliver notification a#1 to b directly at the store boundary,
    // exactly what a second EventProcessor pass over the same notification
    // would do.
    let redelivery = store
        .insert_tracking_and_append(0, "b", "a", 1, vec![NewEvent::new("created", serde_json::json!({"n": 1}))])
        .await
        .unwrap();
    assert!(matches!(
        redelivery,
        angzarr_runner::store::AppendOutcome::DuplicateTracking
    ));

    // b's position advanced exactly once; no duplicate event was appended.
    let b_notifications = store.get_notifications(0, "b", None, None).await.unwrap();
    assert_eq!(b_notifications.len(), 1);

    runner.close().await;
}

#[tokio::test]
async fn nudge_resolves_a_headless_prompt_and_forces_downstream_to_catch_up() {
    // Append directly to the backing store, then nudge "a" instead of
    // driving it through `call("emit", ...)`: "a" never fires its own
    // prompt hook, so the only way b's puller wakes up is via the headless
    // prompt this pushes, which the promoter resolves against the store's
    // current max notification id before forwarding.
    let store = Arc::new(InMemoryRecordStore::new());
    let dyn_store: Arc<dyn RecordStore> = store.clone();

    let system = System::new([("a", "b")])
        .with_factory("a", echo_factory("a"))
        .with_factory("b", echo_factory("b"));
    let config = RunnerConfig {
        poll_interval: Duration::from_secs(3600),
        ..Default::default()
    };

    let runner = Runner::start(system, config, dyn_store).await.unwrap();

    store
        .append(
            0,
            "a",
            vec![NewEvent::new("created", serde_json::json!({"n": 1}))],
        )
        .await
        .unwrap();

    runner.nudge("a", 0).await.unwrap();

    wait_for_count(&store, 0, "b", 1, Duration::from_secs(2)).await;

    runner.close().await;
}

#[tokio::test]
async fn nudge_against_an_unknown_process_is_a_programming_error() {
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let system = System::new([("a", "b")])
        .with_factory("a", echo_factory("a"))
        .with_factory("b", echo_factory("b"));
    let runner = Runner::start(system, RunnerConfig::default(), store).await.unwrap();

    let err = runner.nudge("does-not-exist", 0).await;
    assert!(err.is_err());

    runner.close().await;
}

#[tokio::test]
async fn a_disconnected_single_process_system_runs_on_its_own() {
    // No edges at all: "a" has no upstream and no downstream, and must
    // still be a valid, runnable System member.
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let system = System::new(std::iter::empty::<(&str, &str)>())
        .with_process("a")
        .with_factory("a", echo_factory("a"));

    let runner = Runner::start(system, RunnerConfig::default(), store).await.unwrap();

    let result = runner
        .call(
            "a",
            0,
            "emit",
            serde_json::json!([{"topic": "created", "state": {"n": 1}}]),
        )
        .await;
    assert!(result.is_ok());

    runner.close().await;
}

#[tokio::test]
async fn call_against_an_unknown_process_is_a_programming_error() {
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let system = System::new([("a", "b")])
        .with_factory("a", echo_factory("a"))
        .with_factory("b", echo_factory("b"));
    let runner = Runner::start(system, RunnerConfig::default(), store).await.unwrap();

    let err = runner.call("does-not-exist", 0, "emit", serde_json::Value::Null).await;
    assert!(err.is_err());

    runner.close().await;
}

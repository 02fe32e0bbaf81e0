//! Integration tests for the task runner.

mod common;

use common::{wait_for, ConcurrencyProbe, EventLog};
use deferred_worker::services::ServiceProvider;
use deferred_worker::task_queue::{QueueHandle, TaskQueue, UnboundedTaskQueue, WorkItem};
use deferred_worker::task_runner::{
    RunnerSettings, RunnerState, ShutdownBehavior, ShutdownOutcome, TaskRunner,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scoped capability that logs its construction and disposal.
struct UnitOfWork {
    id: usize,
    log: EventLog,
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        self.log.push(format!("dispose {}", self.id));
    }
}

fn start_runner(
    queue: Arc<UnboundedTaskQueue>,
    services: Arc<ServiceProvider>,
    settings: RunnerSettings,
) -> (TaskRunner, CancellationToken) {
    (
        TaskRunner::new(queue, services, settings),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn test_failures_do_not_stop_the_runner() {
    let queue = Arc::new(UnboundedTaskQueue::new());
    let log = EventLog::default();

    queue
        .push(WorkItem::new(|_| async { anyhow::bail!("boom") }))
        .unwrap();
    queue
        .push(WorkItem::new(|_| async { panic!("kaboom") }))
        .unwrap();
    let done = log.clone();
    queue
        .push(WorkItem::new(move |_| async move {
            done.push("after failures");
            Ok(())
        }))
        .unwrap();

    let (runner, shutdown) = start_runner(
        queue.clone(),
        ServiceProvider::empty(),
        RunnerSettings::default(),
    );
    runner.start(&shutdown).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || !log.events().is_empty()).await);
    assert_eq!(runner.state(), RunnerState::Running);
    assert_eq!(log.events(), vec!["after failures"]);

    assert_eq!(runner.stop().await, ShutdownOutcome::Completed);
}

#[tokio::test]
async fn test_each_scoped_item_gets_its_own_scope() {
    let log = EventLog::default();
    let next_id = Arc::new(AtomicUsize::new(0));
    let services = {
        let log = log.clone();
        let next_id = next_id.clone();
        ServiceProvider::builder()
            .add_scoped(move |_| {
                let id = next_id.fetch_add(1, Ordering::SeqCst);
                log.push(format!("create {}", id));
                Ok(UnitOfWork {
                    id,
                    log: log.clone(),
                })
            })
            .build()
    };

    let queue = Arc::new(UnboundedTaskQueue::new());
    for item in 0..3 {
        let log = log.clone();
        queue
            .push(WorkItem::scoped::<UnitOfWork, _, _>(
                move |unit: Arc<UnitOfWork>, _| async move {
                    log.push(format!("item {} uses {}", item, unit.id));
                    Ok(())
                },
            ))
            .unwrap();
    }

    let (runner, shutdown) = start_runner(queue, services, RunnerSettings::default());
    runner.start(&shutdown).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || log.events().len() == 9).await);
    runner.stop().await;

    assert_eq!(
        log.events(),
        vec![
            "create 0",
            "item 0 uses 0",
            "dispose 0",
            "create 1",
            "item 1 uses 1",
            "dispose 1",
            "create 2",
            "item 2 uses 2",
            "dispose 2",
        ]
    );
}

#[tokio::test]
async fn test_scope_disposed_after_failed_item() {
    let log = EventLog::default();
    let services = {
        let log = log.clone();
        ServiceProvider::builder()
            .add_scoped(move |_| Ok(UnitOfWork { id: 7, log: log.clone() }))
            .build()
    };

    let queue = Arc::new(UnboundedTaskQueue::new());
    queue
        .push(WorkItem::scoped::<UnitOfWork, _, _>(|_, _| async {
            anyhow::bail!("failed mid-unit")
        }))
        .unwrap();

    let (runner, shutdown) = start_runner(queue, services, RunnerSettings::default());
    runner.start(&shutdown).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || log.events() == vec!["dispose 7"]).await);
    runner.stop().await;
}

#[tokio::test]
async fn test_missing_capability_skips_only_that_item() {
    let queue = Arc::new(UnboundedTaskQueue::new());
    let log = EventLog::default();
    queue
        .push(WorkItem::scoped::<UnitOfWork, _, _>(|_, _| async { Ok(()) }))
        .unwrap();
    let done = log.clone();
    queue
        .push(WorkItem::new(move |_| async move {
            done.push("next");
            Ok(())
        }))
        .unwrap();

    let (runner, shutdown) =
        start_runner(queue, ServiceProvider::empty(), RunnerSettings::default());
    runner.start(&shutdown).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || log.events() == vec!["next"]).await);
    runner.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_run_items_concurrently() {
    let queue = Arc::new(UnboundedTaskQueue::new());
    let probe = ConcurrencyProbe::new();
    for _ in 0..8 {
        let probe = probe.clone();
        queue
            .push(WorkItem::new(move |_| async move {
                let _inside = probe.enter();
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }))
            .unwrap();
    }

    let settings = RunnerSettings {
        workers: 4,
        ..Default::default()
    };
    let (runner, shutdown) = start_runner(queue, ServiceProvider::empty(), settings);
    runner.start(&shutdown).await.unwrap();
    assert!(
        wait_for(Duration::from_secs(3), || probe.invocations() == 8 && probe.current() == 0).await
    );
    runner.stop().await;

    assert!(probe.max_concurrent() > 1);
    assert!(probe.max_concurrent() <= 4);
}

#[tokio::test]
async fn test_drain_queue_runs_pending_items_before_stopping() {
    let queue = Arc::new(UnboundedTaskQueue::new());
    let log = EventLog::default();
    for i in 0..5 {
        let log = log.clone();
        queue
            .push(WorkItem::new(move |_| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                log.push(i.to_string());
                Ok(())
            }))
            .unwrap();
    }

    let settings = RunnerSettings {
        shutdown_behavior: ShutdownBehavior::DrainQueue,
        ..Default::default()
    };
    let (runner, shutdown) = start_runner(queue.clone(), ServiceProvider::empty(), settings);
    runner.start(&shutdown).await.unwrap();

    assert_eq!(runner.stop().await, ShutdownOutcome::Completed);
    assert_eq!(log.events(), vec!["0", "1", "2", "3", "4"]);
    assert!(queue.is_completed());
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_wait_for_completion_leaves_pending_items_queued() {
    let queue = Arc::new(UnboundedTaskQueue::new());
    let started = Arc::new(tokio::sync::Notify::new());
    {
        let started = started.clone();
        queue
            .push(WorkItem::new(move |_| async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }))
            .unwrap();
    }
    for _ in 0..3 {
        queue.push(WorkItem::new(|_| async { Ok(()) })).unwrap();
    }

    let (runner, shutdown) = start_runner(
        queue.clone(),
        ServiceProvider::empty(),
        RunnerSettings::default(),
    );
    runner.start(&shutdown).await.unwrap();
    started.notified().await;

    assert_eq!(runner.stop().await, ShutdownOutcome::Completed);
    assert_eq!(queue.len(), 3);
    assert!(!queue.is_completed());
}

#[tokio::test]
async fn test_root_cancellation_reaches_in_flight_items() {
    let queue = Arc::new(UnboundedTaskQueue::new());
    let observed = EventLog::default();
    {
        let observed = observed.clone();
        queue
            .push(WorkItem::new(move |token: CancellationToken| async move {
                token.cancelled().await;
                observed.push("cancelled");
                Ok(())
            }))
            .unwrap();
    }

    let (runner, shutdown) =
        start_runner(queue, ServiceProvider::empty(), RunnerSettings::default());
    runner.start(&shutdown).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    shutdown.cancel();
    assert!(wait_for(Duration::from_secs(1), || observed.events() == vec!["cancelled"]).await);
    assert_eq!(runner.stop().await, ShutdownOutcome::Completed);
}

#[tokio::test]
async fn test_queue_handle_feeds_the_runner() {
    let queue = Arc::new(UnboundedTaskQueue::new());
    let shutdown = CancellationToken::new();
    let handle = QueueHandle::new(queue.clone(), shutdown.clone());
    let log = EventLog::default();

    let (runner, _) = start_runner(queue, ServiceProvider::empty(), RunnerSettings::default());
    runner.start(&shutdown).await.unwrap();

    let done = log.clone();
    handle
        .enqueue(move |_| async move {
            done.push("handled");
            Ok(())
        })
        .await
        .unwrap();

    assert!(wait_for(Duration::from_secs(1), || log.events() == vec!["handled"]).await);
    assert_eq!(handle.depth(), 0);
    runner.stop().await;
}

//! End-to-end engine scenarios against an in-memory SQLite store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use packmule_queue::{
    handler_fn, HandlerOpts, JobOptions, JobQueue, JobSelector, JobStatus, QueueConfig,
    QueueEvent,
};

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> QueueConfig {
    QueueConfig::default().idle_sleep_ms(20).active_sleep_ms(5)
}

async fn connect(config: QueueConfig) -> JobQueue {
    JobQueue::connect("sqlite::memory:", config)
        .await
        .expect("connect in-memory queue")
}

async fn wait_for<F>(events: &mut broadcast::Receiver<QueueEvent>, mut pred: F) -> QueueEvent
where
    F: FnMut(&QueueEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn simple_round_trip() {
    let queue = connect(fast_config()).await;
    queue
        .handle(
            "test",
            HandlerOpts::default(),
            handler_fn(|_job, _cancel| Box::pin(async { Ok(Some(json!("ok"))) })),
        )
        .unwrap();

    let mut events = queue.subscribe();
    assert!(queue
        .push("test", json!("hi"), JobOptions::default())
        .await
        .unwrap());
    queue.start();

    let QueueEvent::BeforeRun(record) =
        wait_for(&mut events, |e| matches!(e, QueueEvent::BeforeRun(_))).await
    else {
        unreachable!()
    };
    wait_for(&mut events, |e| matches!(e, QueueEvent::AfterRun(_))).await;

    let result = queue
        .read_job_result(&record.id)
        .await
        .unwrap()
        .expect("result row");
    assert_eq!(result.message, json!("ok"));

    let final_state = queue.find_job(&record.id).await.unwrap().unwrap();
    assert_eq!(final_state.status, JobStatus::Completed);
    assert_eq!(final_state.message, json!("hi"));
    let stopwatches = final_state.stopwatches.expect("stopwatches recorded");
    assert!(stopwatches.completed.unwrap() >= 0);

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn unique_id_dedup() {
    let queue = connect(fast_config()).await;
    let mut events = queue.subscribe();

    let options = JobOptions::default().unique_id("u1");
    assert!(queue.push("t", json!(1), options.clone()).await.unwrap());
    assert!(!queue.push("t", json!(2), options).await.unwrap());

    let QueueEvent::Push(record) =
        wait_for(&mut events, |e| matches!(e, QueueEvent::Push(_))).await
    else {
        unreachable!()
    };
    let found = queue.find_job(&record.id).await.unwrap().unwrap();
    assert_eq!(found.status, JobStatus::Waiting);
    assert_eq!(found.message, json!(1));
}

#[tokio::test]
async fn lease_timeout_fires_cancel_and_the_job_is_reclaimed() {
    let config = fast_config().timeout_secs(1);
    let queue = connect(config).await;

    let attempts = Arc::new(Mutex::new(0u32));
    let handler_attempts = attempts.clone();
    queue
        .handle(
            "slow",
            HandlerOpts::default(),
            handler_fn(move |_job, cancel| {
                let attempts = handler_attempts.clone();
                Box::pin(async move {
                    let attempt = {
                        let mut guard = attempts.lock().unwrap();
                        *guard += 1;
                        *guard
                    };
                    if attempt == 1 {
                        // Sit out the lease; the supervisor's cancel ends
                        // the wait long before the ten seconds do.
                        tokio::select! {
                            _ = cancel.cancelled() => Ok(Some(json!("late result"))),
                            _ = sleep(Duration::from_secs(10)) => Ok(Some(json!("slept"))),
                        }
                    } else {
                        Ok(Some(json!("second try")))
                    }
                })
            }),
        )
        .unwrap();

    let mut events = queue.subscribe();
    queue
        .push("slow", json!(null), JobOptions::default().retries(1))
        .await
        .unwrap();
    queue.start();

    let QueueEvent::Timeout(timed_out) =
        wait_for(&mut events, |e| matches!(e, QueueEvent::Timeout(_))).await
    else {
        unreachable!()
    };
    assert_eq!(timed_out.try_count, 1);

    wait_for(&mut events, |e| {
        matches!(e, QueueEvent::AfterRun(r) if r.status == JobStatus::Completed)
    })
    .await;

    let final_state = queue.find_job(&timed_out.id).await.unwrap().unwrap();
    assert_eq!(final_state.status, JobStatus::Completed);
    assert_eq!(final_state.try_count, 2);

    // The first run's late result was discarded; only the retry's result
    // was stored.
    let result = queue.read_job_result(&timed_out.id).await.unwrap().unwrap();
    assert_eq!(result.message, json!("second try"));

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn retry_exhaustion_promotes_to_failed() {
    let queue = connect(fast_config()).await;
    queue
        .handle(
            "bad",
            HandlerOpts::default(),
            handler_fn(|_job, _cancel| Box::pin(async { Err("kaboom".into()) })),
        )
        .unwrap();

    let mut events = queue.subscribe();
    queue
        .push("bad", json!(null), JobOptions::default().retries(0))
        .await
        .unwrap();
    queue.start();

    let QueueEvent::HandlerError { job, message } = wait_for(&mut events, |e| {
        matches!(e, QueueEvent::HandlerError { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(message, "handler failed: kaboom");
    assert_eq!(job.try_count, 1);

    let final_state = timeout(WAIT, async {
        loop {
            let state = queue.find_job(&job.id).await.unwrap().unwrap();
            if state.status == JobStatus::Failed {
                return state;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("job promoted to failed");
    // The promoting claim's increment is normalized away: one real attempt.
    assert_eq!(final_state.try_count, 1);

    let log = queue.read_job_log(&job.id, 0, 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].message, json!("handler failed: kaboom"));

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn priority_orders_execution() {
    let queue = connect(fast_config()).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let handler_order = order.clone();
    queue
        .handle(
            "ordered",
            HandlerOpts::default(),
            handler_fn(move |job, _cancel| {
                let order = handler_order.clone();
                Box::pin(async move {
                    order
                        .lock()
                        .unwrap()
                        .push(job.snapshot().message.as_i64().unwrap());
                    Ok(None)
                })
            }),
        )
        .unwrap();

    for priority in [5, 0, 10] {
        queue
            .push(
                "ordered",
                json!(priority),
                JobOptions::default().priority(priority as i32),
            )
            .await
            .unwrap();
    }
    queue.start();

    timeout(WAIT, async {
        loop {
            if order.lock().unwrap().len() == 3 {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("all three jobs ran");

    assert_eq!(*order.lock().unwrap(), vec![0, 5, 10]);
    queue.stop().await.unwrap();
}

#[tokio::test]
async fn canceling_a_running_job_invalidates_its_lease() {
    let queue = connect(fast_config()).await;

    let canceler = queue.clone();
    queue
        .handle(
            "c",
            HandlerOpts::default(),
            handler_fn(move |job, cancel| {
                let queue = canceler.clone();
                Box::pin(async move {
                    queue.cancel(JobSelector::Id(job.id())).await?;
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sleep(Duration::from_millis(100)) => {}
                    }
                    Ok(Some(json!("never stored")))
                })
            }),
        )
        .unwrap();

    let mut events = queue.subscribe();
    queue.push("c", json!(null), JobOptions::default()).await.unwrap();
    queue.start();

    let QueueEvent::Cancel(canceled) =
        wait_for(&mut events, |e| matches!(e, QueueEvent::Cancel(_))).await
    else {
        unreachable!()
    };
    assert_eq!(canceled.status, JobStatus::Canceled);

    wait_for(&mut events, |e| matches!(e, QueueEvent::AfterRun(_))).await;

    let final_state = queue.find_job(&canceled.id).await.unwrap().unwrap();
    assert_eq!(final_state.status, JobStatus::Canceled);
    assert!(queue
        .read_job_result(&canceled.id)
        .await
        .unwrap()
        .is_none());

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn per_type_concurrency_runs_jobs_in_parallel() {
    let queue = connect(fast_config()).await;

    // Neither handler can pass the barrier alone, so completion proves
    // both jobs were in flight at the same time.
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_barrier = barrier.clone();
    let handler_seen = seen.clone();
    queue
        .handle(
            "par",
            HandlerOpts::concurrency(2),
            handler_fn(move |job, _cancel| {
                let barrier = handler_barrier.clone();
                let seen = handler_seen.clone();
                Box::pin(async move {
                    seen.lock().unwrap().push(job.id());
                    barrier.wait().await;
                    Ok(None)
                })
            }),
        )
        .unwrap();

    let mut events = queue.subscribe();
    let mut pushed = HashSet::new();
    for n in 0..2 {
        queue.push("par", json!(n), JobOptions::default()).await.unwrap();
        let QueueEvent::Push(record) =
            wait_for(&mut events, |e| matches!(e, QueueEvent::Push(_))).await
        else {
            unreachable!()
        };
        pushed.insert(record.id);
    }
    queue.start();

    for _ in 0..2 {
        wait_for(&mut events, |e| {
            matches!(e, QueueEvent::AfterRun(r) if r.status == JobStatus::Completed)
        })
        .await;
    }

    // Each job ran exactly once.
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen.iter().cloned().collect::<HashSet<_>>(), pushed);
    for id in &pushed {
        let state = queue.find_job(id).await.unwrap().unwrap();
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.try_count, 1);
    }

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn lease_overrun_is_not_double_executed() {
    // Headroom of 2 on the type plus a short lease: reclaims of the
    // overrunning job are offered back to this engine and must be dropped
    // while the first run is still executing.
    let config = QueueConfig::default()
        .timeout_secs(1)
        .idle_sleep_ms(100)
        .active_sleep_ms(5);
    let queue = connect(config).await;

    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler_active = active.clone();
    let handler_max = max_active.clone();
    let handler_invocations = invocations.clone();
    queue
        .handle(
            "stubborn",
            HandlerOpts::concurrency(2),
            handler_fn(move |_job, _cancel| {
                let active = handler_active.clone();
                let max_active = handler_max.clone();
                let invocations = handler_invocations.clone();
                Box::pin(async move {
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now_active, Ordering::SeqCst);
                    let attempt = invocations.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt == 1 {
                        // Ignores cooperative cancel and runs well past the
                        // one-second lease.
                        sleep(Duration::from_secs(3)).await;
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(Some(json!(attempt)))
                })
            }),
        )
        .unwrap();

    let mut events = queue.subscribe();
    queue
        .push("stubborn", json!(null), JobOptions::default().retries(100))
        .await
        .unwrap();
    queue.start();

    let QueueEvent::Timeout(timed_out) =
        wait_for(&mut events, |e| matches!(e, QueueEvent::Timeout(_))).await
    else {
        unreachable!()
    };

    // The lease is lapsed and polls keep offering the job back, but no
    // second run may start while the first is still going. The window ends
    // well before the first run's three seconds are up.
    sleep(Duration::from_millis(700)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let final_state = timeout(WAIT, async {
        loop {
            let state = queue.find_job(&timed_out.id).await.unwrap().unwrap();
            if state.status == JobStatus::Completed {
                return state;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("retry completes after the overrun ends");

    // Exactly one re-execution, never overlapping the first.
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    // The overrun result was discarded; the stored one is the retry's.
    let result = queue
        .read_job_result(&final_state.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.message, json!(2));

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn recurring_job_returns_to_waiting() {
    let queue = connect(fast_config()).await;
    queue
        .handle(
            "tick",
            HandlerOpts::default(),
            handler_fn(|_job, _cancel| Box::pin(async { Ok(Some(json!("tick"))) })),
        )
        .unwrap();

    let mut events = queue.subscribe();
    queue
        .push(
            "tick",
            json!(null),
            JobOptions::default()
                .recurring("0 0 * * * *")
                // Run immediately despite the recurrence.
                .scheduled(chrono::Utc::now()),
        )
        .await
        .unwrap();
    queue.start();

    let QueueEvent::AfterRun(record) =
        wait_for(&mut events, |e| matches!(e, QueueEvent::AfterRun(_))).await
    else {
        unreachable!()
    };

    let state = queue.find_job(&record.id).await.unwrap().unwrap();
    assert_eq!(state.status, JobStatus::Waiting);
    assert_eq!(state.try_count, 0);
    assert!(state.scheduled > chrono::Utc::now());
    assert!(state.completed.is_none());

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn expired_job_is_abandoned_before_dispatch() {
    let queue = connect(fast_config()).await;
    let ran = Arc::new(Mutex::new(false));
    let handler_ran = ran.clone();
    queue
        .handle(
            "stale",
            HandlerOpts::default(),
            handler_fn(move |_job, _cancel| {
                let ran = handler_ran.clone();
                Box::pin(async move {
                    *ran.lock().unwrap() = true;
                    Ok(None)
                })
            }),
        )
        .unwrap();

    let mut events = queue.subscribe();
    queue
        .push(
            "stale",
            json!(null),
            JobOptions::default().expire(chrono::Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();
    let QueueEvent::Push(record) =
        wait_for(&mut events, |e| matches!(e, QueueEvent::Push(_))).await
    else {
        unreachable!()
    };
    queue.start();

    let final_state = timeout(WAIT, async {
        loop {
            let state = queue.find_job(&record.id).await.unwrap().unwrap();
            if state.status == JobStatus::Expired {
                return state;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("job expired");
    assert!(final_state.completed.is_some());
    assert!(!*ran.lock().unwrap());

    queue.stop().await.unwrap();
}

#[tokio::test]
async fn stop_drains_running_jobs_and_disconnects() {
    let queue = connect(fast_config()).await;
    queue
        .handle(
            "lingering",
            HandlerOpts::default(),
            handler_fn(|_job, cancel| {
                Box::pin(async move {
                    // Runs until stop requests cancellation.
                    cancel.cancelled().await;
                    Ok(None)
                })
            }),
        )
        .unwrap();

    let mut events = queue.subscribe();
    queue
        .push("lingering", json!(null), JobOptions::default())
        .await
        .unwrap();
    queue.start();
    wait_for(&mut events, |e| matches!(e, QueueEvent::BeforeRun(_))).await;

    timeout(WAIT, queue.stop()).await.expect("stop drains").unwrap();
    assert_eq!(queue.running(), 0);

    wait_for(&mut events, |e| matches!(e, QueueEvent::Stop)).await;
}

//! Integration tests for single-item workers.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{SLEEP, wait_until};
use tokio::sync::Notify;
use workq::Error;
use workq::handler::{handler_fn, wasted_fn};
use workq::model::{HandlerError, Mode, Requeue};
use workq::queue::Queue;
use workq::worker::{Worker, WorkerContext, WorkerState};

const TIMEOUT: Duration = Duration::from_secs(5);

fn queue(mode: Mode) -> Arc<Queue<String>> {
    Arc::new(Queue::new("worker-test", mode, 0))
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_twice_then_succeeding_is_not_wasted() {
    let queue = queue(Mode::Fifo);
    let attempts = Arc::new(AtomicU32::new(0));
    let wasted = Arc::new(AtomicU32::new(0));

    let handler = {
        let attempts = Arc::clone(&attempts);
        handler_fn(move |_id, _payload: String| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 2 {
                    Err(HandlerError::new(format!("attempt {n} failed")))
                } else {
                    Ok(())
                }
            }
        })
    };
    let on_wasted = {
        let wasted = Arc::clone(&wasted);
        wasted_fn(move |_id, _payload: String| {
            wasted.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(()) }
        })
    };

    let ctx = WorkerContext::new(Arc::clone(&queue), 3, SLEEP).with_wasted_handler(on_wasted);
    let stats = Arc::clone(&ctx.stats);
    let worker = Worker::new("w-0", ctx, handler);

    queue.add("X", "payload".to_string()).unwrap();
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || stats.snapshot().succeeded == 1).await);
    worker.join().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(wasted.load(Ordering::SeqCst), 0);
    assert!(queue.is_empty());

    let stats = stats.snapshot();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.failed_attempts, 2);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.wasted, 0);
}

#[tokio::test]
async fn always_failing_item_is_wasted_after_max_retries_plus_one() {
    let queue = queue(Mode::Fifo);
    let attempts = Arc::new(AtomicU32::new(0));
    let wasted = Arc::new(Mutex::new(Vec::new()));

    let handler = {
        let attempts = Arc::clone(&attempts);
        handler_fn(move |_id, _payload: String| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HandlerError::new("always fails")) }
        })
    };
    let on_wasted = {
        let wasted = Arc::clone(&wasted);
        wasted_fn(move |id, payload: String| {
            wasted.lock().unwrap().push((id, payload));
            async { Ok::<_, HandlerError>(()) }
        })
    };

    let ctx = WorkerContext::new(Arc::clone(&queue), 1, SLEEP).with_wasted_handler(on_wasted);
    let worker = Worker::new("w-0", ctx, handler);

    queue.add("Y", "data".to_string()).unwrap();
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || !wasted.lock().unwrap().is_empty()).await);
    // Give the worker a few more idle cycles to prove nothing else fires.
    tokio::time::sleep(SLEEP * 4).await;
    worker.join().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        *wasted.lock().unwrap(),
        vec![("Y".to_string(), "data".to_string())]
    );
    assert!(!queue.contains("Y"));
}

#[tokio::test]
async fn zero_retries_discards_on_first_failure_without_wasted_handler() {
    let queue = queue(Mode::Lifo);
    let handler =
        handler_fn(|_id, _payload: String| async { Err::<(), _>(HandlerError::new("nope")) });

    let ctx = WorkerContext::new(Arc::clone(&queue), 0, SLEEP);
    let stats = Arc::clone(&ctx.stats);
    let worker = Worker::new("w-0", ctx, handler);

    queue.add("Z", String::new()).unwrap();
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || stats.snapshot().wasted == 1).await);
    worker.join().await;
    assert_eq!(stats.snapshot().processed, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn panicking_handler_counts_as_a_failed_attempt() {
    let queue = queue(Mode::Fifo);
    let attempts = Arc::new(AtomicU32::new(0));

    let handler = {
        let attempts = Arc::clone(&attempts);
        handler_fn(move |_id, _payload: String| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    panic!("first attempt blows up");
                }
                Ok::<_, HandlerError>(())
            }
        })
    };

    let ctx = WorkerContext::new(Arc::clone(&queue), 2, SLEEP);
    let stats = Arc::clone(&ctx.stats);
    let worker = Worker::new("w-0", ctx, handler);

    queue.add("P", String::new()).unwrap();
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || stats.snapshot().succeeded == 1).await);
    assert!(worker.started());
    worker.join().await;

    let stats = stats.snapshot();
    assert_eq!(stats.panics, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn requeue_next_retries_before_older_items() {
    let queue = queue(Mode::Fifo);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handler = {
        let seen = Arc::clone(&seen);
        handler_fn(move |id: String, _payload: String| {
            let first_time = {
                let mut seen = seen.lock().unwrap();
                let first = !seen.contains(&id);
                seen.push(id.clone());
                first
            };
            async move {
                if id == "a" && first_time {
                    Err(HandlerError::new("retry me"))
                } else {
                    Ok(())
                }
            }
        })
    };

    let ctx = WorkerContext::new(Arc::clone(&queue), 1, SLEEP).with_requeue(Requeue::Next);
    let stats = Arc::clone(&ctx.stats);
    let worker = Worker::new("w-0", ctx, handler);

    for id in ["a", "b", "c"] {
        queue.add(id, String::new()).unwrap();
    }
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || stats.snapshot().succeeded == 3).await);
    worker.join().await;
    assert_eq!(*seen.lock().unwrap(), vec!["a", "a", "b", "c"]);
}

#[tokio::test]
async fn requeue_back_retries_after_items_already_waiting() {
    let queue = queue(Mode::Fifo);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handler = {
        let seen = Arc::clone(&seen);
        handler_fn(move |id: String, _payload: String| {
            let first_time = {
                let mut seen = seen.lock().unwrap();
                let first = !seen.contains(&id);
                seen.push(id.clone());
                first
            };
            async move {
                if id == "a" && first_time {
                    Err(HandlerError::new("retry me"))
                } else {
                    Ok(())
                }
            }
        })
    };

    let ctx = WorkerContext::new(Arc::clone(&queue), 1, SLEEP);
    let stats = Arc::clone(&ctx.stats);
    let worker = Worker::new("w-0", ctx, handler);

    for id in ["a", "b", "c"] {
        queue.add(id, String::new()).unwrap();
    }
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || stats.snapshot().succeeded == 3).await);
    worker.join().await;
    assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c", "a"]);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_moves_through_idle_running_stopped() {
    let queue = queue(Mode::Fifo);
    let handler = handler_fn(|_id, _payload: String| async { Ok::<_, HandlerError>(()) });
    let worker = Worker::new("w-0", WorkerContext::new(queue, 0, SLEEP), handler);

    assert_eq!(worker.state(), WorkerState::Idle);
    assert!(!worker.started());

    worker.start().unwrap();
    assert_eq!(worker.state(), WorkerState::Running);
    assert!(worker.started());
    assert!(matches!(worker.start(), Err(Error::AlreadyStarted(_))));

    worker.stop();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(!worker.started());

    worker.join().await;
    assert!(worker.is_finished());
    assert!(matches!(worker.start(), Err(Error::AlreadyStarted(_))));
}

#[test]
fn start_outside_runtime_fails() {
    let handler = handler_fn(|_id, _payload: String| async { Ok::<_, HandlerError>(()) });
    let worker = Worker::new("w-0", WorkerContext::new(queue(Mode::Fifo), 0, SLEEP), handler);

    assert!(matches!(worker.start(), Err(Error::NoRuntime)));
    assert_eq!(worker.state(), WorkerState::Idle);
}

#[tokio::test]
async fn stop_lets_in_flight_handler_finish_and_leaves_rest_queued() {
    let queue = queue(Mode::Fifo);
    let entered = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let release = Arc::new(Notify::new());

    let handler = {
        let entered = Arc::clone(&entered);
        let finished = Arc::clone(&finished);
        let release = Arc::clone(&release);
        handler_fn(move |_id, _payload: String| {
            let entered = Arc::clone(&entered);
            let finished = Arc::clone(&finished);
            let release = Arc::clone(&release);
            async move {
                entered.store(true, Ordering::SeqCst);
                release.notified().await;
                finished.store(true, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        })
    };

    let worker = Worker::new(
        "w-0",
        WorkerContext::new(Arc::clone(&queue), 0, SLEEP),
        handler,
    );
    queue.add("first", String::new()).unwrap();
    queue.add("second", String::new()).unwrap();
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || entered.load(Ordering::SeqCst)).await);
    worker.stop();
    assert!(!worker.is_finished());

    release.notify_one();
    worker.join().await;

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(queue.peek_ids(), vec!["second"]);
}

#[tokio::test(start_paused = true)]
async fn item_added_while_idle_is_picked_up_after_sleep() {
    let queue = queue(Mode::Fifo);
    let done = Arc::new(AtomicU32::new(0));
    let handler = {
        let done = Arc::clone(&done);
        handler_fn(move |_id, _payload: String| {
            done.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(()) }
        })
    };

    let sleep_time = Duration::from_secs(60);
    let worker = Worker::new(
        "w-0",
        WorkerContext::new(Arc::clone(&queue), 0, sleep_time),
        handler,
    );
    worker.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The worker saw an empty queue and is mid-sleep; it must not poll early.
    queue.add("late", String::new()).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(done.load(Ordering::SeqCst), 0);
    assert_eq!(queue.size(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty());
    worker.join().await;
}

#[tokio::test]
async fn stop_cuts_an_idle_sleep_short() {
    let handler = handler_fn(|_id, _payload: String| async { Ok::<_, HandlerError>(()) });
    let ctx = WorkerContext::new(queue(Mode::Fifo), 0, Duration::from_secs(3600));
    let worker = Worker::new("w-0", ctx, handler);
    worker.start().unwrap();
    tokio::time::sleep(SLEEP).await;

    let joined = tokio::time::timeout(TIMEOUT, worker.join()).await;
    assert!(joined.is_ok());
    assert!(worker.is_finished());
}

// ---------------------------------------------------------------------------
// Discard paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_into_a_full_queue_goes_to_wasted_handler() {
    let queue: Arc<Queue<String>> = Arc::new(Queue::new("bounded", Mode::Fifo, 1));
    let wasted = Arc::new(Mutex::new(Vec::new()));

    // "A" fills the single slot with "B" before failing, so its retry has
    // nowhere to go.
    let handler = {
        let queue = Arc::clone(&queue);
        handler_fn(move |id, _payload: String| {
            let failed = id == "A";
            if failed {
                queue.add("B", "data".to_string()).unwrap();
            }
            async move {
                if failed {
                    Err(HandlerError::new("A fails"))
                } else {
                    Ok(())
                }
            }
        })
    };
    let on_wasted = {
        let wasted = Arc::clone(&wasted);
        wasted_fn(move |id, payload: String| {
            wasted.lock().unwrap().push((id, payload));
            async { Ok::<_, HandlerError>(()) }
        })
    };

    queue.add("A", "payload-a".to_string()).unwrap();
    let ctx = WorkerContext::new(Arc::clone(&queue), 3, SLEEP).with_wasted_handler(on_wasted);
    let stats = Arc::clone(&ctx.stats);
    let worker = Worker::new("w-0", ctx, handler);
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || stats.snapshot().succeeded == 1).await);
    worker.join().await;

    assert_eq!(
        *wasted.lock().unwrap(),
        vec![("A".to_string(), "payload-a".to_string())]
    );
    let s = stats.snapshot();
    assert_eq!(s.processed, 2);
    assert_eq!(s.failed_attempts, 1);
    assert_eq!(s.retried, 0);
    assert_eq!(s.wasted, 1);
}

#[tokio::test]
async fn retry_colliding_with_a_queued_id_goes_to_wasted_handler() {
    let queue = queue(Mode::Fifo);
    let attempts = Arc::new(AtomicU32::new(0));
    let wasted = Arc::new(Mutex::new(Vec::new()));

    // The first attempt enqueues a fresh item under its own id, then fails.
    let handler = {
        let queue = Arc::clone(&queue);
        let attempts = Arc::clone(&attempts);
        handler_fn(move |id, _payload: String| {
            let first = attempts.fetch_add(1, Ordering::SeqCst) == 0;
            if first {
                queue.add(id, "fresh".to_string()).unwrap();
            }
            async move {
                if first {
                    Err(HandlerError::new("first attempt fails"))
                } else {
                    Ok(())
                }
            }
        })
    };
    let on_wasted = {
        let wasted = Arc::clone(&wasted);
        wasted_fn(move |id, payload: String| {
            wasted.lock().unwrap().push((id, payload));
            async { Ok::<_, HandlerError>(()) }
        })
    };

    queue.add("A", "original".to_string()).unwrap();
    let ctx = WorkerContext::new(Arc::clone(&queue), 3, SLEEP).with_wasted_handler(on_wasted);
    let stats = Arc::clone(&ctx.stats);
    let worker = Worker::new("w-0", ctx, handler);
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || stats.snapshot().succeeded == 1).await);
    worker.join().await;

    assert_eq!(
        *wasted.lock().unwrap(),
        vec![("A".to_string(), "original".to_string())]
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn failing_wasted_handler_does_not_stop_the_worker() {
    let queue = queue(Mode::Fifo);
    let handler = handler_fn(|id, _payload: String| async move {
        if id == "bad" {
            Err(HandlerError::new("always"))
        } else {
            Ok(())
        }
    });
    let on_wasted = wasted_fn(|_id, _payload: String| async {
        Err::<(), _>(HandlerError::new("dead letter store unavailable"))
    });

    queue.add("bad", String::new()).unwrap();
    queue.add("good", String::new()).unwrap();
    let ctx = WorkerContext::new(Arc::clone(&queue), 0, SLEEP).with_wasted_handler(on_wasted);
    let stats = Arc::clone(&ctx.stats);
    let worker = Worker::new("w-0", ctx, handler);
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || stats.snapshot().succeeded == 1).await);
    assert!(!worker.is_finished());
    worker.join().await;

    assert_eq!(stats.snapshot().wasted, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn panicking_wasted_handler_does_not_stop_the_worker() {
    let queue = queue(Mode::Fifo);
    let handler = handler_fn(|id, _payload: String| async move {
        if id == "bad" {
            Err(HandlerError::new("always"))
        } else {
            Ok(())
        }
    });
    let on_wasted = wasted_fn(|id, _payload: String| async move {
        if id == "bad" {
            panic!("dead letter store exploded");
        }
        Ok::<_, HandlerError>(())
    });

    queue.add("bad", String::new()).unwrap();
    queue.add("good", String::new()).unwrap();
    let ctx = WorkerContext::new(Arc::clone(&queue), 0, SLEEP).with_wasted_handler(on_wasted);
    let stats = Arc::clone(&ctx.stats);
    let worker = Worker::new("w-0", ctx, handler);
    worker.start().unwrap();

    assert!(wait_until(TIMEOUT, || stats.snapshot().succeeded == 1).await);
    assert!(!worker.is_finished());
    worker.join().await;

    let s = stats.snapshot();
    assert_eq!(s.wasted, 1);
    assert_eq!(s.panics, 0);
}

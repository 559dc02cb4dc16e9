//! Running handlers for normalized events.
//!
//! # Execution
//!
//! For one event the dispatcher takes a registry snapshot, keeps the
//! matching registrations (already in priority order) and walks them in
//! order:
//!
//! - **Blocking** registrations run to completion before the next one starts.
//!   Synchronous bodies run on the blocking pool via
//!   [`tokio::task::spawn_blocking`]; asynchronous bodies run as a spawned
//!   task. The dispatcher awaits either way, so the ingestion loop that
//!   called [`Dispatcher::dispatch`] does not pick up the next event until
//!   every blocking handler is done.
//! - **Non-blocking** registrations are spawned on a [`TaskTracker`] and
//!   take a permit from the worker semaphore before running, so at most
//!   `max_workers` of them execute at once. Dispatch continues immediately.
//!
//! Running bodies inside their own task means a panic surfaces as a
//! [`JoinError`](tokio::task::JoinError) instead of unwinding through the
//! dispatcher. Errors and panics become a [`HandlerError`], which is logged
//! and reported on the feed; later handlers still run.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace};

use crate::error::HandlerError;
use crate::events::FileEvent;
use crate::feed::{
    CompletionRecord, DispatchRecord, EventFeed, HandlerOutcome, HandlerReport, Observation,
};
use crate::registry::{
    Callable, ExecutionMode, HandlerRegistration, HandlerRegistry, HandlerResult,
};

/// Routes events to matching handlers.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    feed: EventFeed,
    workers: Arc<Semaphore>,
    max_workers: usize,
    tracker: TaskTracker,
    cancel: CancellationToken,
    sequence: AtomicU64,
}

impl Dispatcher {
    /// Creates a dispatcher with a pool of `max_workers` non-blocking slots.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, feed: EventFeed, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            registry,
            feed,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Returns the registry this dispatcher reads.
    #[inline]
    #[must_use]
    pub const fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Returns the feed this dispatcher publishes to.
    #[inline]
    #[must_use]
    pub const fn feed(&self) -> &EventFeed {
        &self.feed
    }

    /// Returns the size of the non-blocking worker pool.
    #[inline]
    #[must_use]
    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Dispatches `event` to every matching handler.
    ///
    /// Returns once all blocking handlers have finished and all non-blocking
    /// ones have been queued. Handler failures are never returned.
    pub async fn dispatch(&self, event: FileEvent) {
        let handlers = self.registry.matching(&event);
        self.run(event, handlers).await;
    }

    /// Dispatches a synthetic event for a file that existed at startup.
    ///
    /// Only handlers that opted into existing-file processing receive it.
    /// Nothing is published when none of them match.
    pub async fn dispatch_existing(&self, event: FileEvent) {
        let handlers: Vec<_> = self
            .registry
            .matching(&event)
            .into_iter()
            .filter(|h| h.process_existing())
            .collect();
        if handlers.is_empty() {
            return;
        }
        self.run(event, handlers).await;
    }

    /// Abandons queued and running non-blocking invocations.
    ///
    /// Queued invocations never start. Bodies that already started, sync or
    /// async, keep running in their own task until they return; only the
    /// wait for them is abandoned and their outcome is reported as
    /// [`HandlerOutcome::Abandoned`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once [`Dispatcher::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits until every non-blocking invocation has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Returns the number of non-blocking invocations queued or running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    async fn run(&self, event: FileEvent, handlers: Vec<Arc<HandlerRegistration>>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        if handlers.is_empty() {
            trace!(path = %event.path, kind = %event.kind, "No handlers matched");
        } else {
            debug!(
                sequence,
                path = %event.path,
                kind = %event.kind,
                handlers = handlers.len(),
                "Dispatching event"
            );
        }

        let event = Arc::new(event);
        let mut reports: SmallVec<[HandlerReport; 4]> = SmallVec::new();
        let (published_tx, published) = watch::channel(false);

        for registration in handlers {
            let outcome = match registration.mode() {
                ExecutionMode::Blocking => {
                    let result = invoke(&registration, &event).await;
                    settle(&registration, &event, result)
                }
                ExecutionMode::NonBlocking => {
                    self.schedule(
                        sequence,
                        Arc::clone(&registration),
                        Arc::clone(&event),
                        published.clone(),
                    );
                    HandlerOutcome::Pending
                }
            };
            reports.push(HandlerReport::new(&registration, outcome));
        }

        self.feed.publish(Observation::Dispatched(DispatchRecord::new(
            sequence,
            &event,
            reports.into_vec(),
        )));
        published_tx.send_replace(true);
    }

    /// Spawns a non-blocking invocation. Its completion is published only
    /// after the dispatch record for `sequence`.
    fn schedule(
        &self,
        sequence: u64,
        registration: Arc<HandlerRegistration>,
        event: Arc<FileEvent>,
        mut published: watch::Receiver<bool>,
    ) {
        let workers = Arc::clone(&self.workers);
        let cancel = self.cancel.clone();
        let feed = self.feed.clone();

        self.tracker.spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(
                        handler_id = %registration.id(),
                        path = %event.path,
                        "Abandoned non-blocking handler"
                    );
                    HandlerOutcome::Abandoned
                }
                outcome = async {
                    let Ok(_permit) = workers.acquire_owned().await else {
                        return HandlerOutcome::Abandoned;
                    };
                    let result = invoke(&registration, &event).await;
                    settle(&registration, &event, result)
                } => outcome,
            };

            if published.wait_for(|done| *done).await.is_err() {
                trace!(sequence, "Dispatch record was never published");
            }

            feed.publish(Observation::HandlerCompleted(CompletionRecord {
                sequence,
                handler_id: registration.id(),
                handler_name: registration.name().to_owned(),
                kind: event.kind,
                path: event.path.clone(),
                outcome,
            }));
        });
    }
}

/// Runs one handler body in its own task.
///
/// Dropping the returned future detaches the task; the body still runs to
/// completion.
async fn invoke(
    registration: &HandlerRegistration,
    event: &Arc<FileEvent>,
) -> Result<HandlerResult, JoinError> {
    match registration.callable() {
        Callable::Sync(body) => {
            let body = Arc::clone(body);
            let event = Arc::clone(event);
            tokio::task::spawn_blocking(move || body(event.as_ref())).await
        }
        Callable::Async(body) => {
            let future = body(FileEvent::clone(event));
            tokio::spawn(future).await
        }
    }
}

/// Turns a join result into an outcome, logging failures.
fn settle(
    registration: &HandlerRegistration,
    event: &FileEvent,
    result: Result<HandlerResult, JoinError>,
) -> HandlerOutcome {
    let (message, panicked) = match result {
        Ok(Ok(())) => {
            trace!(handler_id = %registration.id(), path = %event.path, "Handler succeeded");
            return HandlerOutcome::Success;
        }
        Ok(Err(e)) => (e.to_string(), false),
        Err(join_error) if join_error.is_panic() => {
            (panic_message(join_error.into_panic().as_ref()), true)
        }
        Err(_) => ("handler task was cancelled".to_owned(), false),
    };

    let failure = HandlerError {
        handler_id: registration.id(),
        handler_name: registration.name().to_owned(),
        path: event.path.clone(),
        kind: event.kind,
        message,
        panicked,
    };

    error!(
        handler_id = %failure.handler_id,
        handler = %failure.handler_name,
        path = %failure.path,
        kind = %failure.kind,
        panicked = failure.panicked,
        error = %failure.message,
        "Handler failed"
    );

    HandlerOutcome::Failed {
        message: failure.message,
        panicked: failure.panicked,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::builder::{on_any, on_created};
    use crate::events::EventKind;

    fn setup() -> (Arc<HandlerRegistry>, Dispatcher) {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), EventFeed::new(64), 2);
        (registry, dispatcher)
    }

    fn created(path: &str) -> FileEvent {
        FileEvent::new("/watch", path, EventKind::Created)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_handler_does_not_stop_later_handlers() {
        let (registry, dispatcher) = setup();
        let mut feed = dispatcher.feed().subscribe();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&calls);
        on_created("/watch")
            .priority(1)
            .register_fn(&registry, move |_| {
                first.lock().push("first");
                Err("boom".into())
            })
            .unwrap();
        let second = Arc::clone(&calls);
        on_created("/watch")
            .register_fn(&registry, move |_| {
                second.lock().push("second");
                Ok(())
            })
            .unwrap();

        dispatcher.dispatch(created("/watch/a.txt")).await;

        assert_eq!(*calls.lock(), vec!["first", "second"]);
        let Ok(Observation::Dispatched(record)) = feed.recv().await else {
            panic!("expected a dispatch record");
        };
        assert_eq!(record.handlers.len(), 2);
        assert_eq!(
            record.handlers[0].outcome,
            HandlerOutcome::Failed {
                message: "boom".to_owned(),
                panicked: false
            }
        );
        assert_eq!(record.handlers[1].outcome, HandlerOutcome::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_handler_is_isolated() {
        let (registry, dispatcher) = setup();
        let mut feed = dispatcher.feed().subscribe();
        let reached = Arc::new(AtomicUsize::new(0));

        on_created("/watch")
            .priority(5)
            .register_fn(&registry, |_| panic!("handler exploded"))
            .unwrap();
        let counter = Arc::clone(&reached);
        on_created("/watch")
            .register_async(&registry, move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        dispatcher.dispatch(created("/watch/a.txt")).await;

        assert_eq!(reached.load(Ordering::SeqCst), 1);
        let Ok(Observation::Dispatched(record)) = feed.recv().await else {
            panic!("expected a dispatch record");
        };
        assert_eq!(
            record.handlers[0].outcome,
            HandlerOutcome::Failed {
                message: "handler exploded".to_owned(),
                panicked: true
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_non_blocking_does_not_hold_dispatch() {
        let (registry, dispatcher) = setup();
        let release = Arc::new(tokio::sync::Notify::new());
        let done = Arc::new(AtomicUsize::new(0));

        let gate = Arc::clone(&release);
        let finished = Arc::clone(&done);
        on_created("/watch")
            .non_blocking()
            .register_async(&registry, move |_| {
                let gate = Arc::clone(&gate);
                let finished = Arc::clone(&finished);
                async move {
                    gate.notified().await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), dispatcher.dispatch(created("/watch/a")))
            .await
            .expect("dispatch should not wait for non-blocking handlers");
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.in_flight(), 1);

        release.notify_one();
        dispatcher.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_pool_limits_concurrency() {
        let (registry, dispatcher) = setup();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (now, max) = (Arc::clone(&running), Arc::clone(&peak));
        on_created("/watch")
            .non_blocking()
            .register_fn(&registry, move |_| {
                let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(current, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                now.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        for i in 0..6 {
            dispatcher.dispatch(created(&format!("/watch/{i}.txt"))).await;
        }
        dispatcher.wait_idle().await;

        assert!(peak.load(Ordering::SeqCst) <= dispatcher.max_workers());
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completion_is_published() {
        let (registry, dispatcher) = setup();
        let mut feed = dispatcher.feed().subscribe();

        let id = on_any("/watch")
            .non_blocking()
            .name("slow")
            .register_async(&registry, |_| async { Err("late failure".into()) })
            .unwrap();

        dispatcher.dispatch(created("/watch/a")).await;
        dispatcher.wait_idle().await;

        let mut completion = None;
        while let Ok(observation) = feed.try_recv() {
            if let Observation::HandlerCompleted(record) = observation {
                completion = Some(record);
            }
        }
        let completion = completion.expect("completion record");
        assert_eq!(completion.handler_id, id);
        assert_eq!(completion.handler_name, "slow");
        assert!(completion.outcome.is_failure());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_abandons_queued_work() {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), EventFeed::new(64), 1);
        let mut feed = dispatcher.feed().subscribe();

        on_created("/watch")
            .non_blocking()
            .register_async(&registry, |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .unwrap();

        dispatcher.dispatch(created("/watch/a")).await;
        dispatcher.dispatch(created("/watch/b")).await;
        dispatcher.cancel();

        tokio::time::timeout(Duration::from_secs(2), dispatcher.wait_idle())
            .await
            .expect("cancelled work should finish promptly");

        let mut abandoned = 0;
        while let Ok(observation) = feed.try_recv() {
            if let Observation::HandlerCompleted(record) = observation {
                assert_eq!(record.outcome, HandlerOutcome::Abandoned);
                abandoned += 1;
            }
        }
        assert_eq!(abandoned, 2);
        assert!(dispatcher.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_lets_started_async_body_finish() {
        let (registry, dispatcher) = setup();
        let mut feed = dispatcher.feed().subscribe();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let (start_count, finish_count) = (Arc::clone(&started), Arc::clone(&finished));
        on_created("/watch")
            .non_blocking()
            .register_async(&registry, move |_| {
                let (start_count, finish_count) =
                    (Arc::clone(&start_count), Arc::clone(&finish_count));
                async move {
                    start_count.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finish_count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        dispatcher.dispatch(created("/watch/a")).await;
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        dispatcher.cancel();
        dispatcher.wait_idle().await;

        let mut outcome = None;
        while let Ok(observation) = feed.try_recv() {
            if let Observation::HandlerCompleted(record) = observation {
                outcome = Some(record.outcome);
            }
        }
        assert_eq!(outcome, Some(HandlerOutcome::Abandoned));
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unregister_does_not_cancel_in_flight() {
        let (registry, dispatcher) = setup();
        let done = Arc::new(AtomicUsize::new(0));

        let finished = Arc::clone(&done);
        let id = on_created("/watch")
            .non_blocking()
            .register_async(&registry, move |_| {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        dispatcher.dispatch(created("/watch/a")).await;
        assert!(registry.unregister(id));
        dispatcher.wait_idle().await;

        assert_eq!(done.load(Ordering::SeqCst), 1);

        // No longer matched once removed
        dispatcher.dispatch(created("/watch/b")).await;
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispatch_existing_only_reaches_opted_in() {
        let (registry, dispatcher) = setup();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let opted = Arc::clone(&hits);
        on_created("/watch")
            .process_existing(true)
            .register_fn(&registry, move |_| {
                opted.lock().push("opted-in");
                Ok(())
            })
            .unwrap();
        let other = Arc::clone(&hits);
        on_created("/watch")
            .register_fn(&registry, move |_| {
                other.lock().push("live-only");
                Ok(())
            })
            .unwrap();

        dispatcher.dispatch_existing(created("/watch/old.txt")).await;
        assert_eq!(*hits.lock(), vec!["opted-in"]);
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let (_registry, dispatcher) = setup();
        let mut feed = dispatcher.feed().subscribe();

        dispatcher.dispatch(created("/watch/a")).await;
        dispatcher.dispatch(created("/watch/b")).await;

        let mut sequences = Vec::new();
        while let Ok(Observation::Dispatched(record)) = feed.try_recv() {
            assert!(record.handlers.is_empty());
            sequences.push(record.sequence);
        }
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_panic_message_payloads() {
        let text: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(text.as_ref()), "static str");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(other.as_ref()), "handler panicked");
    }
}

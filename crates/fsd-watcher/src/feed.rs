//! The observation feed: what was dispatched, to whom, and how it went.
//!
//! The feed is a Tokio broadcast channel. Publishing never blocks and never
//! waits for readers; a reader that falls behind the channel capacity skips
//! the oldest records and sees [`broadcast::error::RecvError::Lagged`].
//! Dispatch does not depend on anyone reading the feed.
//!
//! [`FeedHistory`] is a bounded, newest-first view of the feed with running
//! counts per event kind, suitable for status displays. Every [`EventFeed`]
//! folds what it publishes into one, so the history never lags.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use fsd_core::DispatchConfig;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::events::{EventKind, FileEvent};
use crate::registry::{ExecutionMode, HandlerId, HandlerRegistration};

/// How one handler invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// The handler returned `Ok`.
    Success,
    /// The handler returned an error or panicked.
    Failed {
        /// Error message or panic payload.
        message: String,
        /// Whether the handler panicked.
        panicked: bool,
    },
    /// Queued on the worker pool; a completion record follows.
    Pending,
    /// Cancelled by a forced stop before it finished.
    Abandoned,
}

impl HandlerOutcome {
    /// Returns `true` for [`HandlerOutcome::Failed`].
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A handler's part in one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerReport {
    /// The handler.
    pub handler_id: HandlerId,
    /// The handler's display name.
    pub handler_name: String,
    /// How the handler was run.
    pub mode: ExecutionMode,
    /// How it went, as far as known at publish time.
    pub outcome: HandlerOutcome,
}

impl HandlerReport {
    pub(crate) fn new(registration: &HandlerRegistration, outcome: HandlerOutcome) -> Self {
        Self {
            handler_id: registration.id(),
            handler_name: registration.name().to_owned(),
            mode: registration.mode(),
            outcome,
        }
    }
}

/// One event and the handlers it reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRecord {
    /// Monotonic dispatch number within a session run.
    pub sequence: u64,
    /// The event kind.
    pub kind: EventKind,
    /// The event path.
    pub path: Utf8PathBuf,
    /// The root the event came from.
    pub watch_root: Utf8PathBuf,
    /// Wall-clock time the event was produced, in Unix milliseconds.
    pub timestamp_ms: u64,
    /// Every matched handler, in dispatch order.
    pub handlers: Vec<HandlerReport>,
}

impl DispatchRecord {
    pub(crate) fn new(sequence: u64, event: &FileEvent, handlers: Vec<HandlerReport>) -> Self {
        Self {
            sequence,
            kind: event.kind,
            path: event.path.clone(),
            watch_root: event.watch_root.clone(),
            timestamp_ms: event.unix_millis(),
            handlers,
        }
    }
}

/// The final outcome of a non-blocking invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRecord {
    /// The dispatch this invocation belongs to.
    pub sequence: u64,
    /// The handler.
    pub handler_id: HandlerId,
    /// The handler's display name.
    pub handler_name: String,
    /// The event kind.
    pub kind: EventKind,
    /// The event path.
    pub path: Utf8PathBuf,
    /// How it ended.
    pub outcome: HandlerOutcome,
}

/// A session stopped because its event source failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    /// The affected root.
    pub root: Utf8PathBuf,
    /// What the source reported.
    pub reason: String,
    /// When the fault was recorded, in Unix milliseconds.
    pub timestamp_ms: u64,
}

impl FaultRecord {
    pub(crate) fn now(root: Utf8PathBuf, reason: String) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        Self {
            root,
            reason,
            timestamp_ms,
        }
    }
}

/// Everything published on the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observation {
    /// An event was dispatched.
    Dispatched(DispatchRecord),
    /// A non-blocking invocation finished.
    HandlerCompleted(CompletionRecord),
    /// The session stopped on a source failure.
    SessionFault(FaultRecord),
}

/// Publishing side of the observation feed.
///
/// Cloning is cheap; all clones publish into the same channel and history.
#[derive(Debug, Clone)]
pub struct EventFeed {
    sender: broadcast::Sender<Observation>,
    history: Arc<Mutex<FeedHistory>>,
}

impl EventFeed {
    /// Creates a feed that buffers up to `capacity` records per reader and
    /// keeps the default number of recent dispatches.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_history(capacity, FeedHistory::DEFAULT_CAPACITY)
    }

    /// Creates a feed sized by `feed_capacity` and `history_capacity`.
    #[must_use]
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::with_history(config.feed_capacity, config.history_capacity)
    }

    /// Creates a feed with explicit channel and history capacities.
    #[must_use]
    pub fn with_history(capacity: usize, history_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Arc::new(Mutex::new(FeedHistory::new(history_capacity))),
        }
    }

    /// Subscribes to records published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.sender.subscribe()
    }

    /// Records and publishes an observation. The broadcast is dropped
    /// silently when nobody is subscribed.
    pub fn publish(&self, observation: Observation) {
        self.history.lock().record(&observation);
        let _ = self.sender.send(observation);
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Copies the history of everything published so far.
    #[must_use]
    pub fn history(&self) -> HistorySnapshot {
        self.history.lock().snapshot()
    }

    /// Clears the history. Subscribers are unaffected.
    pub fn reset_history(&self) {
        self.history.lock().reset();
    }
}

/// Running totals per dispatched event kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    /// Created events.
    pub created: u64,
    /// Modified events.
    pub modified: u64,
    /// Deleted events.
    pub deleted: u64,
    /// Renamed events.
    pub renamed: u64,
    /// All events.
    pub total: u64,
}

impl FeedStats {
    fn count(&mut self, kind: EventKind) {
        match kind {
            EventKind::Created => self.created += 1,
            EventKind::Modified => self.modified += 1,
            EventKind::Deleted => self.deleted += 1,
            EventKind::Renamed => self.renamed += 1,
        }
        self.total += 1;
    }
}

/// A bounded, newest-first record of recent dispatches.
///
/// # Examples
///
/// ```
/// use fsd_watcher::FeedHistory;
///
/// let history = FeedHistory::new(100);
/// assert!(history.is_empty());
/// assert_eq!(history.stats().total, 0);
/// ```
#[derive(Debug, Clone)]
pub struct FeedHistory {
    capacity: usize,
    events: VecDeque<DispatchRecord>,
    stats: FeedStats,
}

/// A serializable copy of a [`FeedHistory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistorySnapshot {
    /// Running totals.
    pub stats: FeedStats,
    /// Recent dispatches, newest first.
    pub events: Vec<DispatchRecord>,
}

impl FeedHistory {
    /// Retained dispatches when no capacity is configured.
    pub const DEFAULT_CAPACITY: usize = 100;

    /// Creates an empty history keeping at most `capacity` dispatches.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::with_capacity(capacity.max(1)),
            stats: FeedStats::default(),
        }
    }

    /// Folds one observation into the history.
    ///
    /// Completion records update the matching pending outcome if that
    /// dispatch is still retained.
    pub fn record(&mut self, observation: &Observation) {
        match observation {
            Observation::Dispatched(record) => {
                self.stats.count(record.kind);
                self.events.push_front(record.clone());
                self.events.truncate(self.capacity);
            }
            Observation::HandlerCompleted(completion) => {
                let report = self
                    .events
                    .iter_mut()
                    .find(|record| record.sequence == completion.sequence)
                    .and_then(|record| {
                        record
                            .handlers
                            .iter_mut()
                            .find(|report| report.handler_id == completion.handler_id)
                    });
                if let Some(report) = report {
                    report.outcome = completion.outcome.clone();
                }
            }
            Observation::SessionFault(_) => {}
        }
    }

    /// Iterates over retained dispatches, newest first.
    pub fn recent(&self) -> impl Iterator<Item = &DispatchRecord> {
        self.events.iter()
    }

    /// Returns the running totals.
    #[must_use]
    pub const fn stats(&self) -> FeedStats {
        self.stats
    }

    /// Returns the number of retained dispatches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Clears retained dispatches and totals.
    pub fn reset(&mut self) {
        self.events.clear();
        self.stats = FeedStats::default();
    }

    /// Copies the history into a serializable value.
    #[must_use]
    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            stats: self.stats,
            events: self.events.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sequence: u64, kind: EventKind, path: &str) -> DispatchRecord {
        DispatchRecord {
            sequence,
            kind,
            path: Utf8PathBuf::from(path),
            watch_root: Utf8PathBuf::from("/watch"),
            timestamp_ms: 1_700_000_000_000,
            handlers: vec![HandlerReport {
                handler_id: HandlerId::new(1),
                handler_name: "handler-1".to_owned(),
                mode: ExecutionMode::NonBlocking,
                outcome: HandlerOutcome::Pending,
            }],
        }
    }

    #[test]
    fn test_history_is_newest_first_and_bounded() {
        let mut history = FeedHistory::new(3);
        for i in 0..5 {
            history.record(&Observation::Dispatched(record(i, EventKind::Modified, "/watch/a")));
        }

        let sequences: Vec<_> = history.recent().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![4, 3, 2]);
        assert_eq!(history.stats().total, 5);
        assert_eq!(history.stats().modified, 5);
    }

    #[test]
    fn test_history_counts_kinds() {
        let mut history = FeedHistory::new(10);
        history.record(&Observation::Dispatched(record(1, EventKind::Created, "/watch/a")));
        history.record(&Observation::Dispatched(record(2, EventKind::Deleted, "/watch/a")));
        history.record(&Observation::Dispatched(record(3, EventKind::Renamed, "/watch/b")));

        let stats = history.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.renamed, 1);
        assert_eq!(stats.modified, 0);
        assert_eq!(stats.total, 3);

        history.reset();
        assert!(history.is_empty());
        assert_eq!(history.stats(), FeedStats::default());
    }

    #[test]
    fn test_history_applies_completions() {
        let mut history = FeedHistory::new(10);
        history.record(&Observation::Dispatched(record(7, EventKind::Created, "/watch/a")));
        history.record(&Observation::HandlerCompleted(CompletionRecord {
            sequence: 7,
            handler_id: HandlerId::new(1),
            handler_name: "handler-1".to_owned(),
            kind: EventKind::Created,
            path: Utf8PathBuf::from("/watch/a"),
            outcome: HandlerOutcome::Failed {
                message: "boom".to_owned(),
                panicked: false,
            },
        }));

        let latest = history.recent().next().unwrap();
        assert!(latest.handlers[0].outcome.is_failure());
    }

    #[test]
    fn test_history_ignores_faults() {
        let mut history = FeedHistory::new(10);
        history.record(&Observation::SessionFault(FaultRecord::now(
            Utf8PathBuf::from("/watch"),
            "gone".to_owned(),
        )));
        assert!(history.is_empty());
        assert_eq!(history.stats().total, 0);
    }

    #[test]
    fn test_feed_history_follows_config() {
        let config = DispatchConfig {
            history_capacity: 2,
            ..DispatchConfig::default()
        };
        let feed = EventFeed::from_config(&config);

        for i in 0..4 {
            feed.publish(Observation::Dispatched(record(i, EventKind::Created, "/watch/a")));
        }

        let history = feed.history();
        let sequences: Vec<_> = history.events.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![3, 2]);
        assert_eq!(history.stats.created, 4);

        feed.reset_history();
        assert!(feed.history().events.is_empty());
    }

    #[test]
    fn test_feed_history_without_subscribers() {
        let feed = EventFeed::new(4);
        assert_eq!(feed.receiver_count(), 0);

        feed.publish(Observation::Dispatched(record(1, EventKind::Deleted, "/watch/a")));
        assert_eq!(feed.history().stats.deleted, 1);
    }

    #[tokio::test]
    async fn test_feed_delivers_to_subscribers() {
        let feed = EventFeed::new(4);
        let mut rx = feed.subscribe();
        assert_eq!(feed.receiver_count(), 1);

        feed.publish(Observation::Dispatched(record(1, EventKind::Created, "/watch/a")));
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Observation::Dispatched(r) if r.sequence == 1));
    }

    #[tokio::test]
    async fn test_slow_reader_lags_instead_of_blocking() {
        let feed = EventFeed::new(2);
        let mut rx = feed.subscribe();

        for i in 0..5 {
            feed.publish(Observation::Dispatched(record(i, EventKind::Created, "/watch/a")));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert!(matches!(rx.recv().await, Ok(Observation::Dispatched(r)) if r.sequence == 3));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let feed = EventFeed::new(1);
        feed.publish(Observation::Dispatched(record(1, EventKind::Created, "/watch/a")));
        assert_eq!(feed.receiver_count(), 0);
    }

    #[test]
    fn test_observation_json_snapshot() {
        let mut history = FeedHistory::new(10);
        history.record(&Observation::Dispatched(record(1, EventKind::Created, "/watch/a.txt")));

        insta::assert_json_snapshot!(history.snapshot(), @r#"
        {
          "stats": {
            "created": 1,
            "modified": 0,
            "deleted": 0,
            "renamed": 0,
            "total": 1
          },
          "events": [
            {
              "sequence": 1,
              "kind": "created",
              "path": "/watch/a.txt",
              "watch_root": "/watch",
              "timestamp_ms": 1700000000000,
              "handlers": [
                {
                  "handler_id": 1,
                  "handler_name": "handler-1",
                  "mode": "non_blocking",
                  "outcome": {
                    "status": "pending"
                  }
                }
              ]
            }
          ]
        }
        "#);
    }

    #[test]
    fn test_fault_observation_json() {
        let observation = Observation::SessionFault(FaultRecord {
            root: Utf8PathBuf::from("/watch"),
            reason: "watch root was removed".to_owned(),
            timestamp_ms: 5,
        });
        let json = serde_json::to_value(&observation).unwrap();
        assert_eq!(json["type"], "session_fault");
        assert_eq!(json["root"], "/watch");
    }
}

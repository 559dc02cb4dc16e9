//! Watch sessions: the lifecycle that ties sources, normalizer and
//! dispatcher together.
//!
//! # Lifecycle
//!
//! ```text
//!            start()                 stop(graceful)
//!   Idle ───────────────> Running ─────────────────> Draining ──> Stopped
//!                            │                                       │
//!                            └──── source disconnect ───────────────>┤
//!                                                                    │
//!   Stopped ──── start() ──> Running                                 │
//! ```
//!
//! One ingestion task per run owns the raw event receiver and the
//! normalizer. It dispatches each normalized event in order and waits for
//! blocking handlers before reading the next raw event, so per-path order is
//! preserved end to end. Non-blocking handlers run on the dispatcher's
//! worker pool.
//!
//! A graceful stop cancels the subscriptions, lets the ingestion task finish
//! the handler it is in, releases deletions still held by the normalizer,
//! and waits (up to the timeout) for non-blocking work. A forced stop, or a
//! drain that times out, abandons whatever is left.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use fsd_core::Config;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::WatchError;
use crate::events::{EventKind, FileEvent};
use crate::feed::{EventFeed, FaultRecord, HistorySnapshot, Observation};
use crate::filter::{CompositeFilter, FileFilter, IgnoreFilter};
use crate::normalizer::EventNormalizer;
use crate::registry::HandlerRegistry;
use crate::root::{WatchRoot, resolve_root};
use crate::source::{RawEventSource, SourceMessage, Subscription};
use crate::walker::ExistingFileWalker;
use crate::watcher::NotifySource;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Built but never started.
    #[default]
    Idle,
    /// Subscribed and dispatching.
    Running,
    /// Stopping gracefully; in-flight work is finishing.
    Draining,
    /// Stopped by request or by a source failure.
    Stopped,
}

impl SessionStatus {
    /// Returns a lowercase label for display and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a session stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFault {
    /// The root whose source failed.
    pub root: Utf8PathBuf,
    /// What the source reported.
    pub reason: String,
}

/// Builder for a [`WatchSession`].
#[must_use]
pub struct WatchSessionBuilder {
    registry: Arc<HandlerRegistry>,
    roots: Vec<(Utf8PathBuf, Option<Arc<dyn FileFilter>>)>,
    source: Option<Arc<dyn RawEventSource>>,
    config: Config,
}

impl WatchSessionBuilder {
    /// Watches `path` with the ignore rules from the configuration.
    pub fn root(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.roots.push((path.into(), None));
        self
    }

    /// Watches `path`, accepting only paths that pass both the configured
    /// ignore rules and `filter`.
    pub fn root_with_filter(mut self, path: impl Into<Utf8PathBuf>, filter: impl FileFilter) -> Self {
        self.roots.push((path.into(), Some(Arc::new(filter))));
        self
    }

    /// Replaces the default [`NotifySource`].
    pub fn source(mut self, source: impl RawEventSource) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and resolves the roots.
    ///
    /// Without explicit roots, the roots named by current registrations are
    /// used.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Config`] for an invalid configuration,
    /// [`WatchError::InvalidPattern`] for a bad ignore pattern, and
    /// [`WatchError::InvalidRegistration`] when there is nothing to watch.
    pub fn build(self) -> Result<WatchSession, WatchError> {
        self.config.validate()?;

        let default_filter: Arc<dyn FileFilter> =
            Arc::new(IgnoreFilter::from_config(&self.config.ignore)?);

        let mut requested = self.roots;
        if requested.is_empty() {
            requested = self
                .registry
                .roots()
                .into_iter()
                .map(|root| (root, None))
                .collect();
        }
        if requested.is_empty() {
            return Err(WatchError::invalid_registration(
                "a session needs at least one watch root",
            ));
        }

        let mut roots: Vec<WatchRoot> = Vec::with_capacity(requested.len());
        for (path, filter) in requested {
            let path = resolve_root(&path)?;
            if roots.iter().any(|root| root.path() == path) {
                continue;
            }
            let filter: Arc<dyn FileFilter> = match filter {
                Some(extra) => Arc::new(
                    CompositeFilter::new()
                        .and(Arc::clone(&default_filter))
                        .and(extra),
                ),
                None => Arc::clone(&default_filter),
            };
            roots.push(WatchRoot::with_filter(path, filter));
        }

        for handler_root in self.registry.roots() {
            if !roots.iter().any(|root| root.path() == handler_root) {
                warn!(root = %handler_root, "Handlers registered for a root this session does not watch");
            }
        }

        let (status, _) = watch::channel(SessionStatus::Idle);
        Ok(WatchSession {
            feed: EventFeed::from_config(&self.config.dispatch),
            registry: self.registry,
            roots,
            source: self.source.unwrap_or_else(|| Arc::new(NotifySource::new())),
            config: self.config,
            status: Arc::new(status),
            fault: Arc::new(Mutex::new(None)),
            run: Mutex::new(None),
        })
    }
}

struct ActiveRun {
    subscriptions: Vec<Box<dyn Subscription>>,
    shutdown: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    ingest: JoinHandle<()>,
}

/// A set of watched roots dispatching into a handler registry.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use fsd_watcher::{HandlerRegistry, WatchSession, on_created};
///
/// # async fn example() -> Result<(), fsd_watcher::WatchError> {
/// let registry = Arc::new(HandlerRegistry::new());
/// on_created("/srv/inbox")
///     .pattern("**/*.csv")
///     .register_fn(&registry, |event| {
///         tracing::info!(path = %event.path, "New upload");
///         Ok(())
///     })?;
///
/// let session = WatchSession::builder(Arc::clone(&registry)).build()?;
/// session.start()?;
/// // ...
/// session.stop(true, Some(Duration::from_secs(5))).await;
/// # Ok(())
/// # }
/// ```
pub struct WatchSession {
    registry: Arc<HandlerRegistry>,
    roots: Vec<WatchRoot>,
    source: Arc<dyn RawEventSource>,
    config: Config,
    feed: EventFeed,
    status: Arc<watch::Sender<SessionStatus>>,
    fault: Arc<Mutex<Option<SessionFault>>>,
    run: Mutex<Option<ActiveRun>>,
}

impl WatchSession {
    /// Starts building a session over `registry`.
    pub fn builder(registry: Arc<HandlerRegistry>) -> WatchSessionBuilder {
        WatchSessionBuilder {
            registry,
            roots: Vec::new(),
            source: None,
            config: Config::default(),
        }
    }

    /// Subscribes to every root and starts dispatching.
    ///
    /// The ingestion task runs on the current Tokio runtime. A stopped
    /// session may be started again; the feed and registry carry over.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::AlreadyRunning`] if the session is running or
    /// draining, [`WatchError::NoRuntime`] when called outside a Tokio
    /// runtime, or the source's error if a root cannot be subscribed. On
    /// error the status is unchanged.
    pub fn start(&self) -> Result<(), WatchError> {
        let mut active = self.run.lock();
        let status = *self.status.borrow();
        if matches!(status, SessionStatus::Running | SessionStatus::Draining) {
            return Err(WatchError::AlreadyRunning(status));
        }
        let runtime = Handle::try_current()?;

        if let Some(previous) = active.take() {
            debug!("Releasing resources of a run that stopped on its own");
            previous.shutdown.cancel();
            previous.ingest.abort();
        }

        let recursive = self.config.watch.recursive;
        let (sender, receiver) = mpsc::channel(self.config.watch.channel_capacity);
        let mut subscriptions = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            subscriptions.push(self.source.subscribe(root.path(), recursive, sender.clone())?);
        }
        drop(sender);

        *self.fault.lock() = None;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.registry),
            self.feed.clone(),
            self.config.dispatch.max_workers,
        ));
        let shutdown = CancellationToken::new();
        let window = self.config.watch.debounce();

        let ingestion = Ingestion {
            rx: receiver,
            normalizer: EventNormalizer::new(window, self.roots.clone()),
            dispatcher: Arc::clone(&dispatcher),
            shutdown: shutdown.clone(),
            status: Arc::clone(&self.status),
            fault: Arc::clone(&self.fault),
            recursive,
            sweep_every: sweep_interval(window),
        };

        self.status.send_replace(SessionStatus::Running);
        let ingest = runtime.spawn(ingestion.run());

        *active = Some(ActiveRun {
            subscriptions,
            shutdown,
            dispatcher,
            ingest,
        });

        info!(
            name = %self.config.name,
            roots = self.roots.len(),
            handlers = self.registry.len(),
            debounce_ms = self.config.watch.debounce_ms,
            max_workers = self.config.dispatch.max_workers,
            "Watch session started"
        );
        Ok(())
    }

    /// Stops the session.
    ///
    /// With `graceful`, the handler currently running finishes, deletions
    /// held for debouncing are dispatched, and non-blocking work is awaited
    /// for up to `timeout` (`None` waits indefinitely). Whatever is left when
    /// the timeout expires is abandoned. Without `graceful`, everything is
    /// abandoned immediately.
    ///
    /// The status is [`SessionStatus::Stopped`] when this returns. Calling it
    /// on an idle or stopped session does nothing.
    pub async fn stop(&self, graceful: bool, timeout: Option<Duration>) {
        let Some(run) = self.run.lock().take() else {
            debug!(status = %self.status(), "Stop requested for a session that is not running");
            return;
        };
        let ActiveRun {
            subscriptions,
            shutdown,
            dispatcher,
            ingest,
        } = run;

        if self.status() == SessionStatus::Running {
            self.status.send_replace(SessionStatus::Draining);
        }
        info!(graceful, ?timeout, "Stopping watch session");

        shutdown.cancel();
        drop(subscriptions);

        if !graceful {
            dispatcher.cancel();
            ingest.abort();
            self.status.send_replace(SessionStatus::Stopped);
            info!(abandoned = dispatcher.in_flight(), "Watch session stopped without draining");
            return;
        }

        let abort = ingest.abort_handle();
        let drain = async {
            if let Err(e) = ingest.await {
                if e.is_panic() {
                    error!(error = %e, "Ingestion task panicked");
                }
            }
            dispatcher.wait_idle().await;
        };

        let drained = match timeout {
            Some(limit) => tokio::time::timeout(limit, drain).await.is_ok(),
            None => {
                drain.await;
                true
            }
        };

        if drained {
            info!("Watch session drained and stopped");
        } else {
            warn!(
                in_flight = dispatcher.in_flight(),
                "Drain timed out, abandoning remaining work"
            );
            dispatcher.cancel();
            abort.abort();
        }

        self.status.send_replace(SessionStatus::Stopped);
    }

    /// Stops gracefully with the configured drain timeout.
    pub async fn shutdown(&self) {
        self.stop(true, self.config.dispatch.drain_timeout()).await;
    }

    /// Waits until the session is stopped (or was never started).
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::SourceDisconnected`] if the session stopped
    /// because its event source failed.
    pub async fn wait(&self) -> Result<(), WatchError> {
        let mut status = self.status.subscribe();
        if status
            .wait_for(|s| matches!(s, SessionStatus::Idle | SessionStatus::Stopped))
            .await
            .is_err()
        {
            debug!("Status channel closed while waiting");
        }

        match self.fault() {
            Some(fault) => Err(WatchError::source_disconnected(fault.root, fault.reason)),
            None => Ok(()),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Returns a receiver that observes status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Returns the fault that stopped the last run, if any.
    #[must_use]
    pub fn fault(&self) -> Option<SessionFault> {
        self.fault.lock().clone()
    }

    /// Returns the observation feed.
    #[must_use]
    pub const fn feed(&self) -> &EventFeed {
        &self.feed
    }

    /// Returns the recent dispatches and running totals.
    ///
    /// Retains up to `dispatch.history_capacity` dispatches across runs.
    #[must_use]
    pub fn history(&self) -> HistorySnapshot {
        self.feed.history()
    }

    /// Subscribes to the observation feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.feed.subscribe()
    }

    /// Returns the handler registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Returns the resolved roots.
    pub fn roots(&self) -> impl Iterator<Item = &Utf8Path> {
        self.roots.iter().map(WatchRoot::path)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}

impl fmt::Debug for WatchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSession")
            .field("roots", &self.roots)
            .field("status", &self.status())
            .field("handlers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.shutdown.cancel();
            run.dispatcher.cancel();
            run.ingest.abort();
        }
    }
}

/// How often held deletions and stale debounce entries are checked.
fn sweep_interval(window: Duration) -> Duration {
    if window.is_zero() {
        return Duration::from_millis(100);
    }
    (window / 4).clamp(Duration::from_millis(10), Duration::from_millis(250))
}

/// The per-run task that owns the raw receiver and the normalizer.
struct Ingestion {
    rx: mpsc::Receiver<SourceMessage>,
    normalizer: EventNormalizer,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    status: Arc<watch::Sender<SessionStatus>>,
    fault: Arc<Mutex<Option<SessionFault>>>,
    recursive: bool,
    sweep_every: Duration,
}

impl Ingestion {
    async fn run(mut self) {
        self.process_existing().await;

        let mut sweep = tokio::time::interval(self.sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ready: Vec<FileEvent> = Vec::new();

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(SourceMessage::Event(raw)) => {
                        self.normalizer.ingest(raw, &mut |event| ready.push(event));
                    }
                    Some(SourceMessage::Disconnected { root, reason }) => {
                        self.fail(root, reason);
                        return;
                    }
                    None if self.shutdown.is_cancelled() => break,
                    None => {
                        let root = self
                            .normalizer
                            .roots()
                            .first()
                            .map(|root| root.path().to_owned())
                            .unwrap_or_default();
                        self.fail(root, "event source closed".to_owned());
                        return;
                    }
                },
                _ = sweep.tick() => {
                    self.normalizer.sweep(Instant::now(), &mut |event| ready.push(event));
                }
            }

            for event in ready.drain(..) {
                self.dispatcher.dispatch(event).await;
            }
        }

        if !self.dispatcher.is_cancelled() {
            self.normalizer.flush(&mut |event| ready.push(event));
            for event in ready.drain(..) {
                self.dispatcher.dispatch(event).await;
            }
        }

        debug!(stats = ?self.normalizer.stats(), "Ingestion stopped");
    }

    async fn process_existing(&self) {
        let snapshot = self.dispatcher.registry().snapshot();

        for root in self.normalizer.roots() {
            let wanted = snapshot
                .iter()
                .any(|h| h.process_existing() && h.watch_root() == root.path());
            if !wanted {
                continue;
            }

            let walker = ExistingFileWalker::new(root.clone()).recursive(self.recursive);
            let paths = match tokio::task::spawn_blocking(move || walker.collect_paths()).await {
                Ok(Ok(paths)) => paths,
                Ok(Err(e)) => {
                    warn!(root = %root.path(), error = %e, "Could not scan existing files");
                    continue;
                }
                Err(e) => {
                    warn!(root = %root.path(), error = %e, "Existing file scan failed");
                    continue;
                }
            };

            info!(root = %root.path(), files = paths.len(), "Dispatching existing files");
            for path in paths {
                if self.shutdown.is_cancelled() {
                    return;
                }
                let event = FileEvent::new(root.path(), path, EventKind::Created);
                self.dispatcher.dispatch_existing(event).await;
            }
        }
    }

    fn fail(&self, root: Utf8PathBuf, reason: String) {
        error!(root = %root, reason = %reason, "Event source disconnected, stopping session");

        *self.fault.lock() = Some(SessionFault {
            root: root.clone(),
            reason: reason.clone(),
        });
        self.dispatcher
            .feed()
            .publish(Observation::SessionFault(FaultRecord::now(root, reason)));
        self.status.send_replace(SessionStatus::Stopped);
    }
}

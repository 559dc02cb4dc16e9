//! Handler registrations and the copy-on-write registry that holds them.
//!
//! The registry is read on every dispatch and written rarely, so it stores an
//! immutable `Arc<[Arc<HandlerRegistration>]>` behind a read-write lock.
//! Readers clone the outer `Arc` and release the lock immediately; writers
//! build a new slice and swap it in. A dispatch that already took its
//! snapshot is unaffected by a concurrent `register` or `unregister`.
//!
//! Registrations are kept sorted by descending priority, with ties broken by
//! registration order, so a snapshot is already in dispatch order.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::WatchError;
use crate::events::{EventKinds, FileEvent};
use crate::matcher::Pattern;
use crate::root::resolve_root;

/// Error type handlers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a handler invocation returns.
pub type HandlerResult = Result<(), BoxError>;

/// A synchronous handler body.
pub type SyncHandlerFn = dyn Fn(&FileEvent) -> HandlerResult + Send + Sync;

/// An asynchronous handler body.
pub type AsyncHandlerFn = dyn Fn(FileEvent) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// Opaque identifier assigned to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Wraps a raw identifier.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the dispatcher runs a handler relative to the ingestion loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The handler finishes before the next handler or event is dispatched.
    #[default]
    Blocking,
    /// The handler is queued on the worker pool and dispatch continues.
    NonBlocking,
}

impl ExecutionMode {
    /// Returns a lowercase label for display and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::NonBlocking => "non_blocking",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The body of a handler: a plain function or one returning a future.
///
/// Synchronous bodies run on Tokio's blocking pool; asynchronous bodies run
/// as tasks on the runtime.
#[derive(Clone)]
pub enum Callable {
    /// A synchronous function.
    Sync(Arc<SyncHandlerFn>),
    /// A function returning a future.
    Async(Arc<AsyncHandlerFn>),
}

impl Callable {
    /// Wraps a synchronous function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&FileEvent) -> HandlerResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Wraps a function returning a future.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(FileEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::Async(Arc::new(
            move |event| -> BoxFuture<'static, HandlerResult> { Box::pin(f(event)) },
        ))
    }

    /// Returns `true` for asynchronous bodies.
    #[inline]
    #[must_use]
    pub const fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Callable::Sync(..)"),
            Self::Async(_) => f.write_str("Callable::Async(..)"),
        }
    }
}

/// A registration request, before validation.
#[derive(Debug, Clone)]
pub struct NewRegistration {
    /// Root whose events the handler receives.
    pub watch_root: Utf8PathBuf,
    /// Glob matched against the root-relative path.
    pub pattern: String,
    /// Event kinds the handler receives.
    pub kinds: EventKinds,
    /// How the handler runs.
    pub mode: ExecutionMode,
    /// The handler body.
    pub callable: Callable,
    /// Display name; defaults to `handler-<id>`.
    pub name: Option<String>,
    /// Higher priorities run first.
    pub priority: i32,
    /// Whether the handler sees files that exist when the session starts.
    pub process_existing: bool,
}

impl NewRegistration {
    /// Creates a request with default name, priority and no existing-file scan.
    #[must_use]
    pub fn new(
        watch_root: impl Into<Utf8PathBuf>,
        pattern: impl Into<String>,
        kinds: EventKinds,
        mode: ExecutionMode,
        callable: Callable,
    ) -> Self {
        Self {
            watch_root: watch_root.into(),
            pattern: pattern.into(),
            kinds,
            mode,
            callable,
            name: None,
            priority: 0,
            process_existing: false,
        }
    }
}

/// A validated handler registration.
#[derive(Debug)]
pub struct HandlerRegistration {
    id: HandlerId,
    name: String,
    watch_root: Utf8PathBuf,
    pattern: Pattern,
    kinds: EventKinds,
    mode: ExecutionMode,
    callable: Callable,
    priority: i32,
    process_existing: bool,
}

impl HandlerRegistration {
    /// Returns the registration's identifier.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> HandlerId {
        self.id
    }

    /// Returns the display name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the resolved watch root.
    #[inline]
    #[must_use]
    pub fn watch_root(&self) -> &Utf8Path {
        &self.watch_root
    }

    /// Returns the compiled pattern.
    #[inline]
    #[must_use]
    pub const fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Returns the accepted kinds.
    #[inline]
    #[must_use]
    pub const fn kinds(&self) -> EventKinds {
        self.kinds
    }

    /// Returns the execution mode.
    #[inline]
    #[must_use]
    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Returns the handler body.
    #[inline]
    #[must_use]
    pub const fn callable(&self) -> &Callable {
        &self.callable
    }

    /// Returns the priority.
    #[inline]
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Returns `true` if the handler opted into existing-file dispatch.
    #[inline]
    #[must_use]
    pub const fn process_existing(&self) -> bool {
        self.process_existing
    }

    /// Returns `true` if this registration should receive `event`.
    ///
    /// Root equality, kind acceptance and a whole-path pattern match must all
    /// hold.
    #[must_use]
    pub fn matches(&self, event: &FileEvent) -> bool {
        self.watch_root == event.watch_root
            && self.kinds.accepts(event.kind)
            && event
                .relative_path()
                .is_some_and(|relative| self.pattern.is_match(relative))
    }
}

type Snapshot = Arc<[Arc<HandlerRegistration>]>;

/// Thread-safe set of handler registrations.
///
/// # Examples
///
/// ```
/// use fsd_watcher::{
///     Callable, EventKind, EventKinds, ExecutionMode, FileEvent, HandlerRegistry,
///     NewRegistration,
/// };
///
/// let registry = HandlerRegistry::new();
/// let id = registry
///     .register(NewRegistration::new(
///         "/watch",
///         "**/*.txt",
///         EventKinds::only(EventKind::Created),
///         ExecutionMode::Blocking,
///         Callable::from_fn(|_event| Ok(())),
///     ))
///     .unwrap();
///
/// let event = FileEvent::new("/watch", "/watch/docs/a.txt", EventKind::Created);
/// assert_eq!(registry.matching(&event).len(), 1);
///
/// assert!(registry.unregister(id));
/// assert!(!registry.unregister(id));
/// ```
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<Snapshot>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Validates and stores a registration.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidPattern`] for a malformed pattern and
    /// [`WatchError::InvalidRegistration`] for an empty kind set or watch
    /// root. Nothing is stored on error.
    pub fn register(&self, request: NewRegistration) -> Result<HandlerId, WatchError> {
        if request.kinds.is_empty() {
            return Err(WatchError::invalid_registration(
                "a handler must accept at least one event kind",
            ));
        }

        let pattern = Pattern::new(&request.pattern)?;
        let watch_root = resolve_root(&request.watch_root)?;

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = request.name.unwrap_or_else(|| format!("handler-{}", id.0));

        let registration = Arc::new(HandlerRegistration {
            id,
            name,
            watch_root,
            pattern,
            kinds: request.kinds,
            mode: request.mode,
            callable: request.callable,
            priority: request.priority,
            process_existing: request.process_existing,
        });

        info!(
            handler_id = %id,
            handler = %registration.name,
            root = %registration.watch_root,
            pattern = %registration.pattern,
            kinds = ?registration.kinds,
            mode = %registration.mode,
            priority = registration.priority,
            "Registered handler"
        );

        let mut handlers = self.handlers.write();
        let mut next: Vec<_> = handlers.iter().map(Arc::clone).collect();
        let position = next.partition_point(|h| h.priority >= registration.priority);
        next.insert(position, registration);
        *handlers = Arc::from(next);

        Ok(id)
    }

    /// Removes a registration.
    ///
    /// Returns `false` if the identifier is unknown or already removed.
    /// Invocations already in flight are not interrupted.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        if !handlers.iter().any(|h| h.id == id) {
            debug!(handler_id = %id, "Unregister of unknown handler");
            return false;
        }

        let next: Vec<_> = handlers
            .iter()
            .filter(|h| h.id != id)
            .map(Arc::clone)
            .collect();
        *handlers = Arc::from(next);

        info!(handler_id = %id, "Unregistered handler");
        true
    }

    /// Returns the current registrations in dispatch order.
    ///
    /// The snapshot is immutable; later changes to the registry do not affect it.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.handlers.read())
    }

    /// Returns the registrations that should receive `event`, in dispatch order.
    #[must_use]
    pub fn matching(&self, event: &FileEvent) -> Vec<Arc<HandlerRegistration>> {
        self.snapshot()
            .iter()
            .filter(|h| h.matches(event))
            .map(Arc::clone)
            .collect()
    }

    /// Looks up a registration by identifier.
    #[must_use]
    pub fn get(&self, id: HandlerId) -> Option<Arc<HandlerRegistration>> {
        self.snapshot().iter().find(|h| h.id == id).map(Arc::clone)
    }

    /// Returns the distinct watch roots named by registrations, in the order
    /// they were first registered.
    #[must_use]
    pub fn roots(&self) -> Vec<Utf8PathBuf> {
        let snapshot = self.snapshot();
        let mut by_id: Vec<_> = snapshot.iter().collect();
        by_id.sort_by_key(|h| h.id);

        let mut roots: Vec<Utf8PathBuf> = Vec::new();
        for handler in by_id {
            if !roots.iter().any(|root| *root == handler.watch_root) {
                roots.push(handler.watch_root.clone());
            }
        }
        roots
    }

    /// Returns the number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish_non_exhaustive()
    }
}

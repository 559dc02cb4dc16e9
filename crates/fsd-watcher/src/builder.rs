//! Fluent construction of handler registrations.
//!
//! ```
//! use fsd_watcher::{HandlerRegistry, on_created, on_any};
//!
//! let registry = HandlerRegistry::new();
//!
//! on_created("/watch")
//!     .pattern("**/*.png")
//!     .non_blocking()
//!     .name("thumbnails")
//!     .register_fn(&registry, |event| {
//!         let _ = event.path.file_name();
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! on_any("/watch")
//!     .priority(10)
//!     .register_async(&registry, |event| async move {
//!         let _ = event.kind;
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert_eq!(registry.len(), 2);
//! ```

use std::future::Future;

use camino::Utf8PathBuf;

use crate::error::WatchError;
use crate::events::{EventKind, EventKinds, FileEvent};
use crate::matcher::MATCH_ALL;
use crate::registry::{
    Callable, ExecutionMode, HandlerId, HandlerRegistry, HandlerResult, NewRegistration,
};

/// Builder for a [`NewRegistration`].
///
/// Defaults: pattern `**`, [`ExecutionMode::Blocking`], priority `0`, no
/// existing-file scan. A builder made with [`HandlerBuilder::new`] starts
/// with no kinds and must be given some before registering.
#[derive(Debug, Clone)]
#[must_use]
pub struct HandlerBuilder {
    watch_root: Utf8PathBuf,
    pattern: String,
    kinds: EventKinds,
    mode: ExecutionMode,
    name: Option<String>,
    priority: i32,
    process_existing: bool,
}

impl HandlerBuilder {
    /// Starts a registration for `watch_root` with no kinds selected.
    pub fn new(watch_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            watch_root: watch_root.into(),
            pattern: MATCH_ALL.to_owned(),
            kinds: EventKinds::empty(),
            mode: ExecutionMode::Blocking,
            name: None,
            priority: 0,
            process_existing: false,
        }
    }

    /// Sets the glob pattern.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    /// Adds one event kind.
    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    /// Adds several event kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        for kind in kinds {
            self.kinds.insert(kind);
        }
        self
    }

    /// Sets the execution mode.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Shorthand for [`ExecutionMode::Blocking`].
    pub fn blocking(self) -> Self {
        self.mode(ExecutionMode::Blocking)
    }

    /// Shorthand for [`ExecutionMode::NonBlocking`].
    pub fn non_blocking(self) -> Self {
        self.mode(ExecutionMode::NonBlocking)
    }

    /// Sets the priority. Higher runs first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Also dispatch a created event for every matching file present when
    /// the session starts.
    pub fn process_existing(mut self, enabled: bool) -> Self {
        self.process_existing = enabled;
        self
    }

    /// Sets the display name used in logs and the feed.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Finishes the request without registering it.
    #[must_use]
    pub fn build(self, callable: Callable) -> NewRegistration {
        NewRegistration {
            watch_root: self.watch_root,
            pattern: self.pattern,
            kinds: self.kinds,
            mode: self.mode,
            callable,
            name: self.name,
            priority: self.priority,
            process_existing: self.process_existing,
        }
    }

    /// Registers `callable` with `registry`.
    ///
    /// # Errors
    ///
    /// See [`HandlerRegistry::register`].
    pub fn register(
        self,
        registry: &HandlerRegistry,
        callable: Callable,
    ) -> Result<HandlerId, WatchError> {
        registry.register(self.build(callable))
    }

    /// Registers a synchronous function.
    ///
    /// # Errors
    ///
    /// See [`HandlerRegistry::register`].
    pub fn register_fn<F>(self, registry: &HandlerRegistry, f: F) -> Result<HandlerId, WatchError>
    where
        F: Fn(&FileEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(registry, Callable::from_fn(f))
    }

    /// Registers a function returning a future.
    ///
    /// # Errors
    ///
    /// See [`HandlerRegistry::register`].
    pub fn register_async<F, Fut>(
        self,
        registry: &HandlerRegistry,
        f: F,
    ) -> Result<HandlerId, WatchError>
    where
        F: Fn(FileEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(registry, Callable::from_async(f))
    }
}

/// Starts a registration for created events (and renames).
pub fn on_created(watch_root: impl Into<Utf8PathBuf>) -> HandlerBuilder {
    HandlerBuilder::new(watch_root).kind(EventKind::Created)
}

/// Starts a registration for modified events.
pub fn on_modified(watch_root: impl Into<Utf8PathBuf>) -> HandlerBuilder {
    HandlerBuilder::new(watch_root).kind(EventKind::Modified)
}

/// Starts a registration for deleted events.
pub fn on_deleted(watch_root: impl Into<Utf8PathBuf>) -> HandlerBuilder {
    HandlerBuilder::new(watch_root).kind(EventKind::Deleted)
}

/// Starts a registration for every event kind.
pub fn on_any(watch_root: impl Into<Utf8PathBuf>) -> HandlerBuilder {
    HandlerBuilder::new(watch_root).kinds(EventKind::ALL)
}

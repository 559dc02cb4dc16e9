//! Watch-and-dispatch engine for file system changes.
//!
//! Register handlers for file patterns under one or more root directories,
//! start a [`WatchSession`], and each normalized change (created, modified,
//! deleted, renamed) is delivered to every matching handler.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  RawEventSource (NotifySource / ChannelSource)                   │
//! │  one Subscription per root ── blocking_send ──┐                  │
//! └───────────────────────────────────────────────│──────────────────┘
//!                                                 ▼ bounded mpsc
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Ingestion task (one per run)                                    │
//! │  ┌────────────────┐    ┌──────────────┐    ┌──────────────────┐  │
//! │  │ EventNormalizer│ -> │ Dispatcher   │ -> │ blocking: inline │  │
//! │  │ root/filter/   │    │ registry     │    │ non-blocking:    │  │
//! │  │ debounce       │    │ snapshot     │    │ worker pool      │  │
//! │  └────────────────┘    └──────┬───────┘    └──────────────────┘  │
//! └───────────────────────────────│──────────────────────────────────┘
//!                                 ▼ broadcast
//!                          EventFeed (Observation)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use fsd_watcher::{EventKind, HandlerBuilder, HandlerRegistry, WatchSession};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), fsd_watcher::WatchError> {
//! let registry = Arc::new(HandlerRegistry::new());
//!
//! HandlerBuilder::new("./logs")
//!     .pattern("**/*.log")
//!     .kind(EventKind::Modified)
//!     .non_blocking()
//!     .register_async(&registry, |event| async move {
//!         tracing::info!(path = %event.path, "Log rotated");
//!         Ok(())
//!     })?;
//!
//! let session = WatchSession::builder(Arc::clone(&registry)).build()?;
//! session.start()?;
//! session.wait().await
//! # }
//! ```
//!
//! # Patterns
//!
//! Patterns are matched against the path relative to its watch root, and must
//! match the whole path. `*` and `?` never cross a `/`; `**` does.
//!
//! ```
//! use camino::Utf8Path;
//! use fsd_watcher::Pattern;
//!
//! let top_level = Pattern::new("*.txt")?;
//! let anywhere = Pattern::new("**/*.txt")?;
//!
//! assert!(top_level.is_match(Utf8Path::new("a.txt")));
//! assert!(!top_level.is_match(Utf8Path::new("sub/a.txt")));
//! assert!(anywhere.is_match(Utf8Path::new("sub/a.txt")));
//! # Ok::<(), fsd_watcher::WatchError>(())
//! ```
//!
//! # Error Handling
//!
//! Registration and session control return [`WatchError`]. Handler failures
//! never propagate: they are logged as [`HandlerError`] and reported on the
//! feed.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod builder;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod feed;
pub mod filter;
pub mod matcher;
pub mod normalizer;
pub mod registry;
pub mod root;
pub mod session;
pub mod source;
pub mod walker;
pub mod watcher;

// Re-export error types
pub use error::{HandlerError, WatchError};

// Re-export event types
pub use events::{EventKind, EventKinds, FileEvent, RawEvent, RawKind};

// Re-export matching and filtering
pub use filter::{AcceptAllFilter, CompositeFilter, FileFilter, IgnoreFilter};
pub use matcher::{MATCH_ALL, Pattern, matches};
pub use root::{WatchRoot, normalize_lexically, relative_to, resolve_root};

// Re-export the pipeline
pub use dispatcher::Dispatcher;
pub use normalizer::{EventNormalizer, NormalizerStats};
pub use walker::ExistingFileWalker;

// Re-export registration types
pub use builder::{HandlerBuilder, on_any, on_created, on_deleted, on_modified};
pub use registry::{
    AsyncHandlerFn, BoxError, Callable, ExecutionMode, HandlerId, HandlerRegistration,
    HandlerRegistry, HandlerResult, NewRegistration, SyncHandlerFn,
};

// Re-export the observation feed
pub use feed::{
    CompletionRecord, DispatchRecord, EventFeed, FaultRecord, FeedHistory, FeedStats,
    HandlerOutcome, HandlerReport, HistorySnapshot, Observation,
};

// Re-export sessions and sources
pub use session::{SessionFault, SessionStatus, WatchSession, WatchSessionBuilder};
pub use source::{ChannelSource, RawEventSender, RawEventSource, SourceMessage, Subscription};
pub use watcher::NotifySource;

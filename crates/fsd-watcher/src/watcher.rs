//! The operating system watcher, via `notify`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                notify thread (one per subscription)          │
//! │  ┌────────────────────┐    ┌──────────────────────────────┐  │
//! │  │ RecommendedWatcher │ -> │ callback: translate kinds,   │  │
//! │  │ (inotify/FSEvents) │    │ skip directories, UTF-8 only │  │
//! │  └────────────────────┘    └──────────────┬───────────────┘  │
//! └───────────────────────────────────────────│──────────────────┘
//!                                             │ blocking_send
//!                                             ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                Async runtime (tokio)                         │
//! │      mpsc::Receiver<SourceMessage> -> ingestion task         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `blocking_send` parks the notify thread while the channel is full, so a
//! slow handler slows the watcher instead of growing a queue without bound.
//! A watcher error, or the removal of the root itself, is reported as
//! [`SourceMessage::Disconnected`].
//!
//! # Renames
//!
//! Backends differ in how they report a rename. inotify sends the two halves
//! (`RenameMode::From`, `RenameMode::To`) and then a `RenameMode::Both`
//! record for the same move. The halves win: a `Both` record whose
//! destination was already reported as a `To` half is dropped, so one
//! rename yields `Deleted(old)` + `Created(new)`. A `Both` record with no
//! preceding halves becomes a single `Renamed` event.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use smallvec::{SmallVec, smallvec};
use tracing::{debug, info, trace, warn};

use crate::error::WatchError;
use crate::events::{RawEvent, RawKind};
use crate::source::{RawEventSender, RawEventSource, SourceMessage, Subscription};

/// What is currently at a path, as far as the watcher callback can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathState {
    Missing,
    File,
    Directory,
}

fn probe(path: &Utf8Path) -> PathState {
    match path.metadata() {
        Ok(metadata) if metadata.is_dir() => PathState::Directory,
        Ok(_) => PathState::File,
        Err(_) => PathState::Missing,
    }
}

/// Rename destinations recently reported through a `RenameMode::To` half.
#[derive(Debug, Default)]
struct RenamePairs {
    reported: VecDeque<PathBuf>,
}

impl RenamePairs {
    /// Halves whose `Both` record never comes (moves into the root from
    /// outside) are forgotten once this many newer ones arrive.
    const MEMORY: usize = 64;

    /// Returns `true` if `event` repeats a rename already reported in halves.
    fn is_repeat(&mut self, event: &notify::Event) -> bool {
        match event.kind {
            NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    if self.reported.len() == Self::MEMORY {
                        self.reported.pop_front();
                    }
                    self.reported.push_back(path.clone());
                }
                false
            }
            NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let Some(to) = event.paths.get(1) else {
                    return false;
                };
                match self.reported.iter().position(|seen| seen == to) {
                    Some(index) => {
                        self.reported.remove(index);
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }
}

/// Raw event source backed by the platform's native file watcher.
///
/// # Examples
///
/// ```no_run
/// use fsd_watcher::{NotifySource, RawEventSource};
/// use camino::Utf8Path;
/// use tokio::sync::mpsc;
///
/// # async fn example() -> Result<(), fsd_watcher::WatchError> {
/// let (tx, mut rx) = mpsc::channel(1024);
/// let subscription = NotifySource::new().subscribe(Utf8Path::new("/srv/inbox"), true, tx)?;
///
/// while let Some(message) = rx.recv().await {
///     println!("{message:?}");
/// }
/// drop(subscription);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifySource;

impl NotifySource {
    /// Creates the source.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl RawEventSource for NotifySource {
    fn subscribe(
        &self,
        root: &Utf8Path,
        recursive: bool,
        sender: RawEventSender,
    ) -> Result<Box<dyn Subscription>, WatchError> {
        if !root.exists() {
            return Err(WatchError::path_not_found(root));
        }

        let callback_root = root.to_owned();
        let mut renames = RenamePairs::default();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let messages = match result {
                Ok(event) if renames.is_repeat(&event) => {
                    trace!(paths = ?event.paths, "Skipping rename already reported in halves");
                    SmallVec::new()
                }
                Ok(event) => translate(&callback_root, event, Instant::now(), probe),
                Err(error) => smallvec![SourceMessage::Disconnected {
                    root: callback_root.clone(),
                    reason: error.to_string(),
                }],
            };

            for message in messages {
                if sender.blocking_send(message).is_err() {
                    trace!(root = %callback_root, "Raw event channel closed");
                    break;
                }
            }
        })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root.as_std_path(), mode)?;

        info!(path = %root, recursive, "File watcher started");

        Ok(Box::new(NotifySubscription {
            root: root.to_owned(),
            _watcher: watcher,
        }))
    }
}

struct NotifySubscription {
    root: Utf8PathBuf,
    _watcher: RecommendedWatcher,
}

impl Subscription for NotifySubscription {
    fn root(&self) -> &Utf8Path {
        &self.root
    }
}

impl fmt::Debug for NotifySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifySubscription")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Drop for NotifySubscription {
    fn drop(&mut self) {
        info!(path = %self.root, "File watcher stopped");
    }
}

fn utf8_paths(paths: Vec<PathBuf>) -> SmallVec<[Utf8PathBuf; 2]> {
    paths
        .into_iter()
        .filter_map(|path| match Utf8PathBuf::try_from(path) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(
                    path = %e.into_path_buf().display(),
                    "Skipping non-UTF-8 path in file event"
                );
                None
            }
        })
        .collect()
}

/// Translates one notify event into source messages.
///
/// Directory creations and modifications are skipped. Removal of the root
/// itself ends the subscription.
fn translate<P>(
    root: &Utf8Path,
    event: notify::Event,
    timestamp: Instant,
    probe: P,
) -> SmallVec<[SourceMessage; 2]>
where
    P: Fn(&Utf8Path) -> PathState,
{
    let paths = utf8_paths(event.paths);
    let raw = |path: Utf8PathBuf, kind: RawKind| {
        SourceMessage::Event(RawEvent::with_timestamp(root, path, kind, timestamp))
    };

    let mut messages = SmallVec::new();
    match event.kind {
        NotifyKind::Create(CreateKind::Folder) => {}
        NotifyKind::Create(_) => {
            for path in paths {
                if probe(&path) != PathState::Directory {
                    messages.push(raw(path, RawKind::Create));
                }
            }
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            let mut paths = paths.into_iter();
            if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                if probe(&to) != PathState::Directory {
                    messages.push(raw(to, RawKind::Rename { from }));
                }
            }
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            messages.extend(paths.into_iter().map(|path| raw(path, RawKind::RenameFrom)));
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in paths {
                if probe(&path) != PathState::Directory {
                    messages.push(raw(path, RawKind::RenameTo));
                }
            }
        }
        NotifyKind::Modify(ModifyKind::Name(_)) => {
            for path in paths {
                match probe(&path) {
                    PathState::Missing => messages.push(raw(path, RawKind::RenameFrom)),
                    PathState::File => messages.push(raw(path, RawKind::RenameTo)),
                    PathState::Directory => {}
                }
            }
        }
        NotifyKind::Modify(_) => {
            for path in paths {
                if probe(&path) != PathState::Directory {
                    messages.push(raw(path, RawKind::Modify));
                }
            }
        }
        NotifyKind::Remove(_) => {
            for path in paths {
                if path == root {
                    debug!(root = %root, "Watch root removed");
                    messages.push(SourceMessage::Disconnected {
                        root: root.to_owned(),
                        reason: "watch root was removed".to_owned(),
                    });
                } else {
                    messages.push(raw(path, RawKind::Remove));
                }
            }
        }
        NotifyKind::Access(_) | NotifyKind::Any | NotifyKind::Other => {}
    }
    messages
}

//! Event types for raw and normalized file change notifications.
//!
//! # Event Flow
//!
//! ```text
//! RawEventSource
//!        │  RawEvent (root, path, RawKind, Instant)
//!        ▼
//! EventNormalizer (ignore rules, kind classification, debounce)
//!        │  FileEvent (watch_root, path, EventKind, Instant)
//!        ▼
//!   Dispatcher
//! ```

use std::fmt;
use std::time::{Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// The semantic kind of a normalized file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A file appeared.
    Created,
    /// A file's contents or metadata changed.
    Modified,
    /// A file was removed.
    Deleted,
    /// A file was moved to this path (the event carries the new path only).
    Renamed,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 4] = [Self::Created, Self::Modified, Self::Deleted, Self::Renamed];

    /// Returns a lowercase label for display and logs.
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
        }
    }

    #[inline]
    const fn bit(self) -> u8 {
        match self {
            Self::Created => 0b0001,
            Self::Modified => 0b0010,
            Self::Deleted => 0b0100,
            Self::Renamed => 0b1000,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A set of [`EventKind`]s a handler accepts.
///
/// # Examples
///
/// ```
/// use fsd_watcher::{EventKind, EventKinds};
///
/// let kinds: EventKinds = [EventKind::Created, EventKind::Deleted].into_iter().collect();
/// assert!(kinds.contains(EventKind::Created));
/// assert!(!kinds.contains(EventKind::Modified));
///
/// // Renames are matched like creations of the new path.
/// assert!(kinds.accepts(EventKind::Renamed));
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventKinds(u8);

impl EventKinds {
    /// The empty set.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The set of every kind.
    #[inline]
    #[must_use]
    pub const fn all() -> Self {
        Self(0b1111)
    }

    /// A set containing exactly one kind.
    #[inline]
    #[must_use]
    pub const fn only(kind: EventKind) -> Self {
        Self(kind.bit())
    }

    /// Returns this set with `kind` added.
    #[inline]
    #[must_use]
    pub const fn with(self, kind: EventKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Adds a kind to the set.
    #[inline]
    pub fn insert(&mut self, kind: EventKind) {
        self.0 |= kind.bit();
    }

    /// Returns `true` if `kind` is a member of the set.
    #[inline]
    #[must_use]
    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Returns `true` if a handler with this set should receive an event of `kind`.
    ///
    /// Membership, except that [`EventKind::Renamed`] is also accepted by any
    /// set containing [`EventKind::Created`].
    #[inline]
    #[must_use]
    pub const fn accepts(self, kind: EventKind) -> bool {
        self.contains(kind)
            || (matches!(kind, EventKind::Renamed) && self.contains(EventKind::Created))
    }

    /// Returns `true` if the set has no members.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the number of kinds in the set.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates over the members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl From<EventKind> for EventKinds {
    fn from(kind: EventKind) -> Self {
        Self::only(kind)
    }
}

impl FromIterator<EventKind> for EventKinds {
    fn from_iter<T: IntoIterator<Item = EventKind>>(iter: T) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl fmt::Debug for EventKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for EventKinds {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// What a raw event source reported, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawKind {
    /// A file was created.
    Create,
    /// A file was written to or had its metadata changed.
    Modify,
    /// A file was removed.
    Remove,
    /// The old half of a rename whose halves arrive separately.
    RenameFrom,
    /// The new half of a rename whose halves arrive separately.
    RenameTo,
    /// A rename reported as one record; the event path is the new path.
    Rename {
        /// The path the file was moved from.
        from: Utf8PathBuf,
    },
}

/// An unprocessed change record from a raw event source.
///
/// Raw events may be duplicated, bursty, or refer to paths outside their
/// root; the normalizer deals with all of that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// The watch root whose subscription produced this record.
    pub root: Utf8PathBuf,

    /// Absolute path the record refers to.
    pub path: Utf8PathBuf,

    /// What happened.
    pub kind: RawKind,

    /// When the source observed the change.
    pub timestamp: Instant,
}

impl RawEvent {
    /// Creates a raw event timestamped now.
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>, path: impl Into<Utf8PathBuf>, kind: RawKind) -> Self {
        Self::with_timestamp(root, path, kind, Instant::now())
    }

    /// Creates a raw event with a specific timestamp.
    #[inline]
    #[must_use]
    pub fn with_timestamp(
        root: impl Into<Utf8PathBuf>,
        path: impl Into<Utf8PathBuf>,
        kind: RawKind,
        timestamp: Instant,
    ) -> Self {
        Self {
            root: root.into(),
            path: path.into(),
            kind,
            timestamp,
        }
    }
}

/// A normalized, deduplicated file change delivered to handlers.
///
/// # Examples
///
/// ```
/// use fsd_watcher::{EventKind, FileEvent};
///
/// let event = FileEvent::new("/watch", "/watch/docs/notes.txt", EventKind::Created);
/// assert!(event.is_created());
/// assert_eq!(event.relative_path().map(|p| p.as_str()), Some("docs/notes.txt"));
/// assert_eq!(event.file_name(), Some("notes.txt"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Absolute, normalized path of the changed file.
    pub path: Utf8PathBuf,

    /// What happened to the file.
    pub kind: EventKind,

    /// The watch root that produced this event.
    pub watch_root: Utf8PathBuf,

    /// Monotonic time the change was observed, used for debouncing.
    pub timestamp: Instant,

    /// Wall-clock time the event was produced, for display.
    pub observed_at: SystemTime,
}

impl FileEvent {
    /// Creates an event timestamped now.
    #[inline]
    #[must_use]
    pub fn new(
        watch_root: impl Into<Utf8PathBuf>,
        path: impl Into<Utf8PathBuf>,
        kind: EventKind,
    ) -> Self {
        Self::with_timestamp(watch_root, path, kind, Instant::now())
    }

    /// Creates an event with a specific monotonic timestamp.
    #[inline]
    #[must_use]
    pub fn with_timestamp(
        watch_root: impl Into<Utf8PathBuf>,
        path: impl Into<Utf8PathBuf>,
        kind: EventKind,
        timestamp: Instant,
    ) -> Self {
        Self {
            path: path.into(),
            kind,
            watch_root: watch_root.into(),
            timestamp,
            observed_at: SystemTime::now(),
        }
    }

    /// Returns the path relative to the watch root.
    ///
    /// Returns `None` if the path is not strictly inside the root.
    #[must_use]
    pub fn relative_path(&self) -> Option<&Utf8Path> {
        crate::root::relative_to(&self.path, &self.watch_root)
    }

    /// Returns `true` for [`EventKind::Created`].
    #[inline]
    #[must_use]
    pub fn is_created(&self) -> bool {
        self.kind == EventKind::Created
    }

    /// Returns `true` for [`EventKind::Modified`].
    #[inline]
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.kind == EventKind::Modified
    }

    /// Returns `true` for [`EventKind::Deleted`].
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.kind == EventKind::Deleted
    }

    /// Returns `true` for [`EventKind::Renamed`].
    #[inline]
    #[must_use]
    pub fn is_renamed(&self) -> bool {
        self.kind == EventKind::Renamed
    }

    /// Returns the file name without the directory path.
    #[inline]
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name()
    }

    /// Returns the file extension, if any.
    #[inline]
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        self.path.extension()
    }

    /// Returns the wall-clock time as milliseconds since the Unix epoch.
    #[must_use]
    pub fn unix_millis(&self) -> u64 {
        self.observed_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

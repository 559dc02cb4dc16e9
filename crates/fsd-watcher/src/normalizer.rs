//! Turning raw source records into debounced [`FileEvent`]s.
//!
//! # Pipeline
//!
//! For each [`RawEvent`]:
//!
//! 1. The path is normalized lexically and must lie strictly inside a known
//!    watch root; the root's [`FileFilter`](crate::FileFilter) must accept it.
//! 2. The raw kind is classified: creations and rename targets become
//!    [`EventKind::Created`], writes become [`EventKind::Modified`], removals
//!    and rename sources become [`EventKind::Deleted`], and single-record
//!    renames become [`EventKind::Renamed`] at the new path.
//! 3. Deletions are held for one debounce window. A creation of the same path
//!    inside that window cancels the deletion and is delivered as a single
//!    [`EventKind::Modified`] (the save-by-replace pattern many editors use).
//! 4. The debounce table, keyed by `(root, path, kind)`, drops repeats closer
//!    than the window to the last one seen. A suppressed repeat refreshes the
//!    entry, so a sustained burst stays collapsed.
//!
//! The normalizer is a plain state machine: it does no I/O and never sleeps.
//! Time only advances through event timestamps and [`EventNormalizer::sweep`].

use std::collections::hash_map::Entry;
use std::time::{Duration, Instant, SystemTime};

use camino::Utf8PathBuf;
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::events::{EventKind, FileEvent, RawEvent, RawKind};
use crate::root::{WatchRoot, normalize_lexically, relative_to};

type DebounceKey = (Utf8PathBuf, Utf8PathBuf, EventKind);
type PathKey = (Utf8PathBuf, Utf8PathBuf);

/// Counters describing what the normalizer did with its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizerStats {
    /// Raw events received.
    pub received: u64,
    /// File events emitted.
    pub emitted: u64,
    /// Raw events dropped by the debounce table.
    pub suppressed: u64,
    /// Raw events dropped for being outside a root or ignored.
    pub filtered: u64,
    /// Delete-then-create pairs delivered as one modification.
    pub collapsed: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingDelete {
    timestamp: Instant,
}

/// Debouncing state machine between raw sources and the dispatcher.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, Instant};
/// use fsd_watcher::{EventKind, EventNormalizer, RawEvent, RawKind, WatchRoot};
/// use camino::Utf8Path;
///
/// let root = WatchRoot::new(Utf8Path::new("/watch")).unwrap();
/// let mut normalizer = EventNormalizer::new(Duration::from_millis(100), vec![root]);
///
/// let start = Instant::now();
/// let mut events = Vec::new();
/// for offset in [0, 10, 20] {
///     let raw = RawEvent::with_timestamp(
///         "/watch",
///         "/watch/notes.txt",
///         RawKind::Modify,
///         start + Duration::from_millis(offset),
///     );
///     normalizer.ingest(raw, &mut |event| events.push(event));
/// }
///
/// assert_eq!(events.len(), 1);
/// assert_eq!(events[0].kind, EventKind::Modified);
/// ```
#[derive(Debug)]
pub struct EventNormalizer {
    window: Duration,
    roots: Vec<WatchRoot>,
    debounce: FxHashMap<DebounceKey, Instant>,
    pending_deletes: FxHashMap<PathKey, PendingDelete>,
    stats: NormalizerStats,
}

impl EventNormalizer {
    /// Creates a normalizer for the given roots.
    #[must_use]
    pub fn new(window: Duration, roots: Vec<WatchRoot>) -> Self {
        Self {
            window,
            roots,
            debounce: FxHashMap::default(),
            pending_deletes: FxHashMap::default(),
            stats: NormalizerStats::default(),
        }
    }

    /// Returns the debounce window.
    #[inline]
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Returns the roots this normalizer accepts events for.
    #[inline]
    #[must_use]
    pub fn roots(&self) -> &[WatchRoot] {
        &self.roots
    }

    /// Returns counters for everything processed so far.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> NormalizerStats {
        self.stats
    }

    /// Returns the number of entries in the debounce table.
    #[inline]
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.debounce.len()
    }

    /// Returns the number of deletions waiting out the window.
    #[inline]
    #[must_use]
    pub fn pending_deletes(&self) -> usize {
        self.pending_deletes.len()
    }

    /// Processes one raw event, passing zero or more file events to `sink`.
    pub fn ingest<S>(&mut self, raw: RawEvent, sink: &mut S)
    where
        S: FnMut(FileEvent),
    {
        self.stats.received += 1;

        let Some(root) = self.roots.iter().find(|root| root.path() == raw.root) else {
            trace!(root = %raw.root, path = %raw.path, "Dropping event for unknown root");
            self.stats.filtered += 1;
            return;
        };

        let path = normalize_lexically(&raw.path);
        let Some(relative) = relative_to(&path, root.path()) else {
            trace!(root = %root.path(), path = %path, "Dropping event outside watch root");
            self.stats.filtered += 1;
            return;
        };

        if !root.accepts(relative) {
            trace!(path = %path, "Dropping ignored path");
            self.stats.filtered += 1;
            return;
        }

        let root_path = root.path().to_owned();
        let mut kind = classify(&raw.kind);

        if kind == EventKind::Deleted && !self.window.is_zero() {
            self.hold_delete(root_path, path, raw.timestamp);
            return;
        }

        let key = (root_path, path);
        if let Some(pending) = self.pending_deletes.remove(&key) {
            let within_window =
                raw.timestamp.saturating_duration_since(pending.timestamp) < self.window;
            if within_window && matches!(kind, EventKind::Created | EventKind::Renamed) {
                debug!(path = %key.1, "Collapsing delete and create into a modification");
                self.stats.collapsed += 1;
                kind = EventKind::Modified;
            } else {
                self.emit(
                    key.0.clone(),
                    key.1.clone(),
                    EventKind::Deleted,
                    pending.timestamp,
                    sink,
                );
            }
        }

        let (root_path, path) = key;
        self.emit(root_path, path, kind, raw.timestamp, sink);
    }

    /// Releases deletions whose window has passed and forgets stale
    /// debounce entries.
    pub fn sweep<S>(&mut self, now: Instant, sink: &mut S)
    where
        S: FnMut(FileEvent),
    {
        let window = self.window;
        let mut expired: SmallVec<[(PathKey, PendingDelete); 4]> = SmallVec::new();
        self.pending_deletes.retain(|key, pending| {
            if now.saturating_duration_since(pending.timestamp) >= window {
                expired.push((key.clone(), *pending));
                false
            } else {
                true
            }
        });
        self.release(expired, sink);

        let before = self.debounce.len();
        self.debounce
            .retain(|_, last| now.saturating_duration_since(*last) < window);
        let purged = before - self.debounce.len();
        if purged > 0 {
            trace!(purged, remaining = self.debounce.len(), "Purged debounce entries");
        }
    }

    /// Releases every held deletion regardless of age.
    ///
    /// Used when a session drains so that accepted deletions are not lost.
    pub fn flush<S>(&mut self, sink: &mut S)
    where
        S: FnMut(FileEvent),
    {
        let pending: SmallVec<[(PathKey, PendingDelete); 4]> = self.pending_deletes.drain().collect();
        self.release(pending, sink);
    }

    fn release<S>(&mut self, mut deletes: SmallVec<[(PathKey, PendingDelete); 4]>, sink: &mut S)
    where
        S: FnMut(FileEvent),
    {
        deletes.sort_by(|(a_key, a), (b_key, b)| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a_key.cmp(b_key))
        });
        for ((root, path), pending) in deletes {
            self.emit(root, path, EventKind::Deleted, pending.timestamp, sink);
        }
    }

    fn hold_delete(&mut self, root: Utf8PathBuf, path: Utf8PathBuf, timestamp: Instant) {
        match self.pending_deletes.entry((root, path)) {
            Entry::Occupied(entry) => {
                trace!(path = %entry.key().1, "Deletion already pending");
                self.stats.suppressed += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingDelete { timestamp });
            }
        }
    }

    fn emit<S>(
        &mut self,
        root: Utf8PathBuf,
        path: Utf8PathBuf,
        kind: EventKind,
        timestamp: Instant,
        sink: &mut S,
    ) where
        S: FnMut(FileEvent),
    {
        match self.debounce.entry((root.clone(), path.clone(), kind)) {
            Entry::Occupied(mut entry) => {
                let last = *entry.get();
                if timestamp.saturating_duration_since(last) < self.window {
                    if timestamp > last {
                        entry.insert(timestamp);
                    }
                    trace!(path = %path, kind = %kind, "Debounced repeat event");
                    self.stats.suppressed += 1;
                    return;
                }
                entry.insert(timestamp);
            }
            Entry::Vacant(entry) => {
                entry.insert(timestamp);
            }
        }

        self.stats.emitted += 1;
        sink(FileEvent {
            path,
            kind,
            watch_root: root,
            timestamp,
            observed_at: SystemTime::now(),
        });
    }
}

/// Maps a raw kind onto the kind delivered to handlers.
fn classify(kind: &RawKind) -> EventKind {
    match kind {
        RawKind::Create | RawKind::RenameTo => EventKind::Created,
        RawKind::Modify => EventKind::Modified,
        RawKind::Remove | RawKind::RenameFrom => EventKind::Deleted,
        RawKind::Rename { .. } => EventKind::Renamed,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use camino::Utf8Path;

    use super::*;
    use crate::filter::{AcceptAllFilter, IgnoreFilter};

    const WINDOW: Duration = Duration::from_millis(100);

    fn root(path: &str) -> WatchRoot {
        WatchRoot::with_filter(Utf8PathBuf::from(path), Arc::new(IgnoreFilter::default()))
    }

    fn normalizer() -> EventNormalizer {
        EventNormalizer::new(WINDOW, vec![root("/watch")])
    }

    fn raw(path: &str, kind: RawKind, at: Instant) -> RawEvent {
        RawEvent::with_timestamp("/watch", path, kind, at)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn kinds(events: &[FileEvent]) -> Vec<(String, EventKind)> {
        events
            .iter()
            .map(|e| (e.path.to_string(), e.kind))
            .collect()
    }

    #[test]
    fn test_burst_collapses_to_one() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        for i in 0..10 {
            n.ingest(raw("/watch/a.txt", RawKind::Modify, start + ms(i * 5)), &mut |e| out.push(e));
        }

        assert_eq!(out.len(), 1);
        assert_eq!(n.stats().suppressed, 9);
        assert_eq!(n.stats().emitted, 1);
    }

    #[test]
    fn test_events_outside_window_are_delivered() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Modify, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Modify, start + ms(150)), &mut |e| out.push(e));

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].timestamp, start + ms(150));
    }

    #[test]
    fn test_suppressed_repeat_extends_window() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Modify, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Modify, start + ms(60)), &mut |e| out.push(e));
        // 120ms after the first, but only 60ms after the refreshed entry
        n.ingest(raw("/watch/a.txt", RawKind::Modify, start + ms(120)), &mut |e| out.push(e));

        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_distinct_kinds_are_not_debounced_together() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Create, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Modify, start + ms(5)), &mut |e| out.push(e));

        assert_eq!(
            kinds(&out),
            vec![
                ("/watch/a.txt".to_owned(), EventKind::Created),
                ("/watch/a.txt".to_owned(), EventKind::Modified),
            ]
        );
    }

    #[test]
    fn test_per_path_order_is_preserved() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Create, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/b.txt", RawKind::Create, start + ms(1)), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Modify, start + ms(200)), &mut |e| out.push(e));

        let a_events: Vec<_> = out.iter().filter(|e| e.path == "/watch/a.txt").collect();
        assert_eq!(a_events.len(), 2);
        assert!(a_events[0].timestamp < a_events[1].timestamp);
        assert_eq!(a_events[0].kind, EventKind::Created);
        assert_eq!(a_events[1].kind, EventKind::Modified);
    }

    #[test]
    fn test_paths_outside_root_are_dropped() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/elsewhere/a.txt", RawKind::Create, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/../etc/passwd", RawKind::Modify, start), &mut |e| out.push(e));
        n.ingest(raw("/watch", RawKind::Modify, start), &mut |e| out.push(e));
        n.ingest(
            RawEvent::with_timestamp("/unknown", "/unknown/a", RawKind::Create, start),
            &mut |e| out.push(e),
        );

        assert!(out.is_empty());
        assert_eq!(n.stats().filtered, 4);
    }

    #[test]
    fn test_paths_are_normalized() {
        let mut n = normalizer();
        let mut out = Vec::new();

        n.ingest(raw("/watch/./sub/../a.txt", RawKind::Create, Instant::now()), &mut |e| out.push(e));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path.as_str(), "/watch/a.txt");
        assert_eq!(out[0].relative_path().map(Utf8Path::as_str), Some("a.txt"));
    }

    #[test]
    fn test_ignored_paths_are_dropped() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/.git/index", RawKind::Modify, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/notes.txt.swp", RawKind::Modify, start), &mut |e| out.push(e));

        assert!(out.is_empty());
        assert_eq!(n.tracked(), 0);
    }

    #[test]
    fn test_rename_pair_with_split_records() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/old.txt", RawKind::RenameFrom, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/new.txt", RawKind::RenameTo, start), &mut |e| out.push(e));
        assert_eq!(kinds(&out), vec![("/watch/new.txt".to_owned(), EventKind::Created)]);

        n.sweep(start + ms(100), &mut |e| out.push(e));
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].kind, EventKind::Deleted);
        assert_eq!(out[1].path.as_str(), "/watch/old.txt");
    }

    #[test]
    fn test_single_rename_record() {
        let mut n = normalizer();
        let mut out = Vec::new();

        n.ingest(
            raw(
                "/watch/new.txt",
                RawKind::Rename {
                    from: Utf8PathBuf::from("/watch/old.txt"),
                },
                Instant::now(),
            ),
            &mut |e| out.push(e),
        );

        assert_eq!(kinds(&out), vec![("/watch/new.txt".to_owned(), EventKind::Renamed)]);
    }

    #[test]
    fn test_delete_then_create_is_modification() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Remove, start), &mut |e| out.push(e));
        assert!(out.is_empty());
        assert_eq!(n.pending_deletes(), 1);

        n.ingest(raw("/watch/a.txt", RawKind::Create, start + ms(20)), &mut |e| out.push(e));
        n.sweep(start + ms(500), &mut |e| out.push(e));

        assert_eq!(kinds(&out), vec![("/watch/a.txt".to_owned(), EventKind::Modified)]);
        assert_eq!(n.stats().collapsed, 1);
        assert_eq!(n.pending_deletes(), 0);
    }

    #[test]
    fn test_delete_then_late_create_is_two_events() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Remove, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Create, start + ms(150)), &mut |e| out.push(e));

        assert_eq!(
            kinds(&out),
            vec![
                ("/watch/a.txt".to_owned(), EventKind::Deleted),
                ("/watch/a.txt".to_owned(), EventKind::Created),
            ]
        );
    }

    #[test]
    fn test_delete_then_modify_keeps_order() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Remove, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Modify, start + ms(10)), &mut |e| out.push(e));

        assert_eq!(
            kinds(&out),
            vec![
                ("/watch/a.txt".to_owned(), EventKind::Deleted),
                ("/watch/a.txt".to_owned(), EventKind::Modified),
            ]
        );
    }

    #[test]
    fn test_pending_delete_waits_for_window() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Remove, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Remove, start + ms(10)), &mut |e| out.push(e));

        n.sweep(start + ms(50), &mut |e| out.push(e));
        assert!(out.is_empty());

        n.sweep(start + ms(100), &mut |e| out.push(e));
        assert_eq!(kinds(&out), vec![("/watch/a.txt".to_owned(), EventKind::Deleted)]);
        assert_eq!(out[0].timestamp, start);
    }

    #[test]
    fn test_flush_releases_pending_deletes_in_order() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/b.txt", RawKind::Remove, start + ms(5)), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Remove, start), &mut |e| out.push(e));
        n.flush(&mut |e| out.push(e));

        assert_eq!(
            kinds(&out),
            vec![
                ("/watch/a.txt".to_owned(), EventKind::Deleted),
                ("/watch/b.txt".to_owned(), EventKind::Deleted),
            ]
        );
        assert_eq!(n.pending_deletes(), 0);
    }

    #[test]
    fn test_sweep_purges_stale_entries() {
        let mut n = normalizer();
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Modify, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/b.txt", RawKind::Modify, start + ms(80)), &mut |e| out.push(e));
        assert_eq!(n.tracked(), 2);

        n.sweep(start + ms(120), &mut |e| out.push(e));
        assert_eq!(n.tracked(), 1);

        n.sweep(start + ms(500), &mut |e| out.push(e));
        assert_eq!(n.tracked(), 0);
    }

    #[test]
    fn test_zero_window_disables_debounce() {
        let filter = Arc::new(AcceptAllFilter);
        let mut n = EventNormalizer::new(
            Duration::ZERO,
            vec![WatchRoot::with_filter(Utf8PathBuf::from("/watch"), filter)],
        );
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Modify, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Modify, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Remove, start), &mut |e| out.push(e));

        assert_eq!(out.len(), 3);
        assert_eq!(out[2].kind, EventKind::Deleted);
        assert_eq!(n.pending_deletes(), 0);
    }

    #[test]
    fn test_out_of_order_timestamps_do_not_underflow() {
        let mut n = normalizer();
        let start = Instant::now() + ms(1000);
        let mut out = Vec::new();

        n.ingest(raw("/watch/a.txt", RawKind::Modify, start), &mut |e| out.push(e));
        n.ingest(raw("/watch/a.txt", RawKind::Modify, start - ms(500)), &mut |e| out.push(e));
        n.sweep(start - ms(900), &mut |e| out.push(e));

        assert_eq!(out.len(), 1);
        assert_eq!(n.tracked(), 1);
    }

    #[test]
    fn test_multiple_roots() {
        let mut n = EventNormalizer::new(WINDOW, vec![root("/a"), root("/b")]);
        let start = Instant::now();
        let mut out = Vec::new();

        n.ingest(RawEvent::with_timestamp("/a", "/a/x.txt", RawKind::Create, start), &mut |e| out.push(e));
        n.ingest(RawEvent::with_timestamp("/b", "/b/x.txt", RawKind::Create, start), &mut |e| out.push(e));
        // Reported by /a's subscription but lies under /b
        n.ingest(RawEvent::with_timestamp("/a", "/b/y.txt", RawKind::Create, start), &mut |e| out.push(e));

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].watch_root.as_str(), "/a");
        assert_eq!(out[1].watch_root.as_str(), "/b");
    }
}

//! Discovery of files that already exist under a watch root.
//!
//! Used once per session start for handlers registered with
//! `process_existing`. The walk ignores `.gitignore` and friends: the root's
//! own [`FileFilter`](crate::FileFilter) decides, exactly as it does for live
//! events.

use camino::{Utf8Path, Utf8PathBuf};
use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::error::WatchError;
use crate::root::{WatchRoot, relative_to};

/// Walks a watch root and lists the files its filter accepts.
///
/// # Examples
///
/// ```no_run
/// use fsd_watcher::{ExistingFileWalker, WatchRoot};
/// use camino::Utf8Path;
///
/// let root = WatchRoot::new(Utf8Path::new("./data"))?;
/// let paths = ExistingFileWalker::new(root).collect_paths()?;
/// assert!(paths.iter().all(|p| p.is_absolute()));
/// # Ok::<(), fsd_watcher::WatchError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ExistingFileWalker {
    root: WatchRoot,
    recursive: bool,
    follow_links: bool,
}

impl ExistingFileWalker {
    /// Creates a recursive walker that does not follow symbolic links.
    #[must_use]
    pub fn new(root: WatchRoot) -> Self {
        Self {
            root,
            recursive: true,
            follow_links: false,
        }
    }

    /// Limits the walk to the root's direct children when `false`.
    #[must_use]
    pub const fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Configures whether to follow symbolic links.
    #[must_use]
    pub const fn with_follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    /// Returns the root being walked.
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        self.root.path()
    }

    /// Collects accepted file paths, sorted.
    ///
    /// Unreadable entries and non-UTF-8 names are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::PathNotFound`] if the root is not a directory.
    pub fn collect_paths(&self) -> Result<Vec<Utf8PathBuf>, WatchError> {
        let root = self.root.path();
        if !root.is_dir() {
            return Err(WatchError::path_not_found(root));
        }

        let mut paths = Vec::new();
        for result in self.build_walker() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %root, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }

            let Some(path) = Utf8Path::from_path(entry.path()) else {
                warn!(path = %entry.path().display(), "Skipping non-UTF-8 path");
                continue;
            };

            let accepted =
                relative_to(path, root).is_some_and(|relative| self.root.accepts(relative));
            if accepted {
                paths.push(path.to_owned());
            }
        }

        paths.sort();
        debug!(root = %root, files = paths.len(), "Collected existing files");
        Ok(paths)
    }

    fn build_walker(&self) -> ignore::Walk {
        let mut builder = WalkBuilder::new(self.root.path());
        builder
            .standard_filters(false)
            .follow_links(self.follow_links)
            .threads(1);
        if !self.recursive {
            builder.max_depth(Some(1));
        }
        builder.build()
    }
}

//! Watch roots and path resolution.
//!
//! Every path the engine compares is first brought into one canonical shape:
//! roots are canonicalized when they exist (otherwise made absolute), and
//! event paths are normalized lexically so `.` and `..` components never
//! cause a mismatch.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::WatchError;
use crate::filter::{FileFilter, IgnoreFilter};

/// A directory tree under observation, with the ignore rules applied to it.
#[derive(Clone)]
pub struct WatchRoot {
    path: Utf8PathBuf,
    filter: Arc<dyn FileFilter>,
}

impl WatchRoot {
    /// Creates a root with the default [`IgnoreFilter`].
    pub fn new(path: &Utf8Path) -> Result<Self, WatchError> {
        Ok(Self::with_filter(resolve_root(path)?, Arc::new(IgnoreFilter::default())))
    }

    /// Creates a root from an already resolved path and a filter.
    #[must_use]
    pub fn with_filter(path: Utf8PathBuf, filter: Arc<dyn FileFilter>) -> Self {
        Self { path, filter }
    }

    /// Returns the resolved root path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the ignore filter for this root.
    #[inline]
    #[must_use]
    pub fn filter(&self) -> &Arc<dyn FileFilter> {
        &self.filter
    }

    /// Returns `true` if the relative path passes this root's filter.
    #[inline]
    #[must_use]
    pub fn accepts(&self, relative: &Utf8Path) -> bool {
        self.filter.should_process(relative)
    }
}

impl fmt::Debug for WatchRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRoot")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Resolves a watch root to its canonical form.
///
/// Existing paths are canonicalized (symlinks resolved). Paths that do not
/// exist yet are made absolute against the current directory and normalized
/// lexically.
pub fn resolve_root(path: &Utf8Path) -> Result<Utf8PathBuf, WatchError> {
    if path.as_str().is_empty() {
        return Err(WatchError::invalid_registration("watch root must not be empty"));
    }

    if path.exists() {
        return Ok(path.canonicalize_utf8()?);
    }

    if path.is_absolute() {
        return Ok(normalize_lexically(path));
    }

    let cwd = std::env::current_dir()?;
    let cwd = Utf8PathBuf::try_from(cwd).map_err(|e| WatchError::non_utf8_path(e.into_path_buf()))?;
    Ok(normalize_lexically(&cwd.join(path)))
}

/// Removes `.` components and resolves `..` against preceding components
/// without touching the filesystem.
///
/// `..` never climbs above the filesystem root.
///
/// # Examples
///
/// ```
/// use fsd_watcher::normalize_lexically;
/// use camino::Utf8Path;
///
/// let path = normalize_lexically(Utf8Path::new("/watch/./a/../b.txt"));
/// assert_eq!(path.as_str(), "/watch/b.txt");
/// ```
#[must_use]
pub fn normalize_lexically(path: &Utf8Path) -> Utf8PathBuf {
    let mut stack: Vec<Utf8Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => match stack.last() {
                Some(Utf8Component::Normal(_)) => {
                    stack.pop();
                }
                Some(Utf8Component::RootDir | Utf8Component::Prefix(_)) => {}
                _ => stack.push(component),
            },
            _ => stack.push(component),
        }
    }

    stack.into_iter().collect()
}

/// Returns `path` relative to `root`, or `None` if it is not strictly inside.
#[must_use]
pub fn relative_to<'a>(path: &'a Utf8Path, root: &Utf8Path) -> Option<&'a Utf8Path> {
    path.strip_prefix(root)
        .ok()
        .filter(|relative| !relative.as_str().is_empty())
}

//! Path filtering applied before pattern matching.
//!
//! Every watch root carries a [`FileFilter`]. Paths it rejects are dropped by
//! the normalizer and never reach the debounce table or the registry, so the
//! usual noise (hidden directories, editor swap files, partial downloads)
//! costs nothing downstream.
//!
//! Filters are always consulted with the path relative to the watch root.
//!
//! # Examples
//!
//! ```
//! use fsd_watcher::{FileFilter, IgnoreFilter};
//! use camino::Utf8Path;
//!
//! let filter = IgnoreFilter::default();
//!
//! assert!(filter.should_process(Utf8Path::new("src/main.rs")));
//! assert!(!filter.should_process(Utf8Path::new(".git/HEAD")));
//! assert!(!filter.should_process(Utf8Path::new("notes.txt.swp")));
//! ```

use camino::Utf8Path;
use fsd_core::IgnoreConfig;
use smallvec::SmallVec;

use crate::error::WatchError;
use crate::matcher::Pattern;

/// A filter for determining which paths under a watch root are processed.
///
/// # Thread Safety
///
/// Filters must be [`Send`] and [`Sync`]: they are shared between the
/// ingestion task and the blocking thread that scans existing files.
///
/// # Examples
///
/// ```
/// use fsd_watcher::FileFilter;
/// use camino::Utf8Path;
///
/// struct NoTargetDir;
///
/// impl FileFilter for NoTargetDir {
///     fn should_process(&self, path: &Utf8Path) -> bool {
///         !path.starts_with("target")
///     }
/// }
///
/// assert!(!NoTargetDir.should_process(Utf8Path::new("target/debug/fsd")));
/// ```
pub trait FileFilter: Send + Sync + 'static {
    /// Returns `true` if the root-relative path should be processed.
    fn should_process(&self, path: &Utf8Path) -> bool;
}

/// A filter that accepts all paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllFilter;

impl FileFilter for AcceptAllFilter {
    #[inline]
    fn should_process(&self, _path: &Utf8Path) -> bool {
        true
    }
}

/// Drops hidden paths, files with noise suffixes, and explicit ignore globs.
///
/// # Configuration
///
/// [`IgnoreFilter::default`] follows [`IgnoreConfig::default`]:
/// - Any path component starting with `.` is ignored
/// - Editor swap and backup files (`~`, `.swp`, ...) are ignored
/// - No extra glob patterns
///
/// # Examples
///
/// ```
/// use fsd_watcher::{FileFilter, IgnoreFilter};
/// use camino::Utf8Path;
///
/// let filter = IgnoreFilter::new()
///     .with_suffix(".bak")
///     .with_pattern("build/**")
///     .unwrap();
///
/// assert!(filter.should_process(Utf8Path::new(".env")));
/// assert!(!filter.should_process(Utf8Path::new("old.bak")));
/// assert!(!filter.should_process(Utf8Path::new("build/out.o")));
/// ```
#[derive(Debug, Clone)]
pub struct IgnoreFilter {
    ignore_hidden: bool,
    suffixes: SmallVec<[String; 8]>,
    patterns: SmallVec<[Pattern; 4]>,
}

impl IgnoreFilter {
    /// Creates a filter that ignores nothing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ignore_hidden: false,
            suffixes: SmallVec::new(),
            patterns: SmallVec::new(),
        }
    }

    /// Builds a filter from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidPattern`] if an ignore pattern is malformed.
    pub fn from_config(config: &IgnoreConfig) -> Result<Self, WatchError> {
        let patterns = config
            .patterns
            .iter()
            .map(|pattern| Pattern::new(pattern))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            ignore_hidden: config.ignore_hidden,
            suffixes: config.suffixes.iter().cloned().collect(),
            patterns,
        })
    }

    /// Sets whether dot-prefixed path components are ignored.
    #[must_use]
    pub fn ignore_hidden(mut self, ignore: bool) -> Self {
        self.ignore_hidden = ignore;
        self
    }

    /// Adds a file name suffix to ignore.
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        if !suffix.is_empty() && !self.suffixes.contains(&suffix) {
            self.suffixes.push(suffix);
        }
        self
    }

    /// Adds a glob pattern to ignore.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidPattern`] if the pattern is malformed.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, WatchError> {
        self.patterns.push(Pattern::new(pattern)?);
        Ok(self)
    }

    fn is_hidden(path: &Utf8Path) -> bool {
        path.components().any(|component| {
            let name = component.as_str();
            name.starts_with('.') && name != "." && name != ".."
        })
    }

    fn has_ignored_suffix(&self, path: &Utf8Path) -> bool {
        path.file_name().is_some_and(|name| {
            self.suffixes
                .iter()
                .any(|suffix| name.ends_with(suffix.as_str()))
        })
    }

    fn matches_ignore_pattern(&self, path: &Utf8Path) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(path))
    }
}

impl Default for IgnoreFilter {
    fn default() -> Self {
        let config = IgnoreConfig::default();
        Self {
            ignore_hidden: config.ignore_hidden,
            suffixes: config.suffixes.into_iter().collect(),
            patterns: SmallVec::new(),
        }
    }
}

impl FileFilter for IgnoreFilter {
    fn should_process(&self, path: &Utf8Path) -> bool {
        if self.ignore_hidden && Self::is_hidden(path) {
            return false;
        }

        if self.has_ignored_suffix(path) {
            return false;
        }

        !self.matches_ignore_pattern(path)
    }
}

/// A composite filter that combines multiple filters with AND logic.
///
/// # Examples
///
/// ```
/// use fsd_watcher::{CompositeFilter, FileFilter, IgnoreFilter};
/// use camino::Utf8Path;
///
/// struct OnlyInbox;
/// impl FileFilter for OnlyInbox {
///     fn should_process(&self, path: &Utf8Path) -> bool {
///         path.starts_with("inbox")
///     }
/// }
///
/// let filter = CompositeFilter::new()
///     .and(IgnoreFilter::default())
///     .and(OnlyInbox);
///
/// assert!(filter.should_process(Utf8Path::new("inbox/invoice.pdf")));
/// assert!(!filter.should_process(Utf8Path::new("inbox/invoice.pdf.part")));
/// assert!(!filter.should_process(Utf8Path::new("archive/invoice.pdf")));
/// ```
pub struct CompositeFilter {
    filters: Vec<Box<dyn FileFilter>>,
}

impl CompositeFilter {
    /// Creates an empty composite filter, which accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Adds a filter to the composite.
    #[must_use]
    pub fn and<F: FileFilter>(mut self, filter: F) -> Self {
        self.filters.push(Box::new(filter));
        self
    }
}

impl Default for CompositeFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl FileFilter for CompositeFilter {
    fn should_process(&self, path: &Utf8Path) -> bool {
        self.filters.iter().all(|f| f.should_process(path))
    }
}

impl<F: FileFilter + ?Sized> FileFilter for Box<F> {
    fn should_process(&self, path: &Utf8Path) -> bool {
        (**self).should_process(path)
    }
}

impl<F: FileFilter + ?Sized> FileFilter for std::sync::Arc<F> {
    fn should_process(&self, path: &Utf8Path) -> bool {
        (**self).should_process(path)
    }
}

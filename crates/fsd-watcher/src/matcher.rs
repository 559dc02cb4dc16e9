//! Glob pattern matching against root-relative paths.
//!
//! Patterns use `/` as the separator and are always matched against the whole
//! relative path, never a substring:
//!
//! | Syntax  | Matches                                         |
//! |---------|-------------------------------------------------|
//! | `*`     | any run of characters except `/`                |
//! | `**`    | any run of characters including `/`             |
//! | `?`     | exactly one character other than `/`            |
//! | `[...]` | one character from the class                    |
//!
//! Matching is case-sensitive.

use std::fmt;

use camino::Utf8Path;
use globset::{GlobBuilder, GlobMatcher};

use crate::error::WatchError;

/// The pattern used when a registration does not name one.
pub const MATCH_ALL: &str = "**";

/// A compiled glob pattern.
///
/// # Examples
///
/// ```
/// use fsd_watcher::Pattern;
/// use camino::Utf8Path;
///
/// let top_level = Pattern::new("*.txt").unwrap();
/// assert!(top_level.is_match(Utf8Path::new("notes.txt")));
/// assert!(!top_level.is_match(Utf8Path::new("sub/notes.txt")));
///
/// let anywhere = Pattern::new("**/*.txt").unwrap();
/// assert!(anywhere.is_match(Utf8Path::new("sub/notes.txt")));
/// ```
#[derive(Clone)]
pub struct Pattern {
    source: String,
    matcher: GlobMatcher,
}

impl Pattern {
    /// Compiles a glob pattern.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::InvalidPattern`] if the pattern is empty or
    /// malformed.
    pub fn new(pattern: &str) -> Result<Self, WatchError> {
        if pattern.is_empty() {
            return Err(WatchError::invalid_pattern(pattern, "pattern is empty"));
        }

        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map_err(|e| WatchError::invalid_pattern(pattern, e.kind()))?;

        Ok(Self {
            source: pattern.to_owned(),
            matcher: glob.compile_matcher(),
        })
    }

    /// Returns the pattern text as written.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns `true` if the whole relative path matches.
    #[inline]
    #[must_use]
    pub fn is_match(&self, relative: &Utf8Path) -> bool {
        self.matcher.is_match(relative.as_std_path())
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

/// Returns `true` if `pattern` matches `relative_path` in full.
#[inline]
#[must_use]
pub fn matches(pattern: &Pattern, relative_path: &Utf8Path) -> bool {
    pattern.is_match(relative_path)
}

//! Error types for the fsd-watcher crate.
//!
//! This module provides [`WatchError`] for everything the registration and
//! session APIs can return, and [`HandlerError`] for failures captured while
//! running a single handler invocation.
//!
//! # Propagation
//!
//! - **Registration errors** ([`WatchError::InvalidPattern`],
//!   [`WatchError::InvalidRegistration`]) are returned synchronously to the
//!   caller and no registration is created.
//! - **Session errors** ([`WatchError::AlreadyRunning`],
//!   [`WatchError::SourceDisconnected`], [`WatchError::Notify`], ...) are
//!   returned from session control methods.
//! - **Handler errors** ([`HandlerError`]) are never returned from any API.
//!   They are logged and published on the observation feed.

use std::fmt;

use camino::Utf8PathBuf;

use crate::events::EventKind;
use crate::registry::HandlerId;
use crate::session::SessionStatus;

/// Errors returned by the registration and session APIs.
///
/// # Examples
///
/// ```
/// use fsd_watcher::{Pattern, WatchError};
///
/// let err = Pattern::new("src/[abc").unwrap_err();
/// assert!(err.is_registration_error());
/// assert!(matches!(err, WatchError::InvalidPattern { .. }));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// A glob pattern could not be compiled.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// Why the pattern was rejected.
        reason: String,
    },

    /// A registration is structurally invalid (for example, no event kinds).
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// `start()` was called on a session that is already running or draining.
    #[error("session is already running (status: {0})")]
    AlreadyRunning(SessionStatus),

    /// The raw event source stopped delivering events unexpectedly.
    ///
    /// This is terminal for the session: it moves to `Stopped`.
    #[error("event source disconnected for {root}: {reason}")]
    SourceDisconnected {
        /// The watch root whose subscription dropped.
        root: Utf8PathBuf,
        /// What the source reported.
        reason: String,
    },

    /// Failed to initialize or operate the notify watcher.
    #[error("notify watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// The specified path does not exist.
    #[error("path does not exist: {0}")]
    PathNotFound(Utf8PathBuf),

    /// A path is not valid UTF-8.
    #[error("path is not valid UTF-8: {}", _0.display())]
    NonUtf8Path(std::path::PathBuf),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] fsd_core::ConfigError),

    /// A session was started outside a Tokio runtime.
    #[error("no Tokio runtime to run the session on: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl WatchError {
    /// Creates a new [`WatchError::InvalidPattern`] error.
    #[inline]
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a new [`WatchError::InvalidRegistration`] error.
    #[inline]
    pub fn invalid_registration(reason: impl Into<String>) -> Self {
        Self::InvalidRegistration(reason.into())
    }

    /// Creates a new [`WatchError::PathNotFound`] error.
    #[inline]
    pub fn path_not_found(path: impl Into<Utf8PathBuf>) -> Self {
        Self::PathNotFound(path.into())
    }

    /// Creates a new [`WatchError::NonUtf8Path`] error.
    #[inline]
    pub fn non_utf8_path(path: impl Into<std::path::PathBuf>) -> Self {
        Self::NonUtf8Path(path.into())
    }

    /// Creates a new [`WatchError::SourceDisconnected`] error.
    #[inline]
    pub fn source_disconnected(root: impl Into<Utf8PathBuf>, reason: impl Into<String>) -> Self {
        Self::SourceDisconnected {
            root: root.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error was raised while validating a registration.
    #[inline]
    #[must_use]
    pub const fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPattern { .. } | Self::InvalidRegistration(_)
        )
    }

    /// Returns `true` if this error ends a running session.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceDisconnected { .. } | Self::Notify(_) | Self::Io(_)
        )
    }

    /// Returns the file path associated with this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8PathBuf> {
        match self {
            Self::PathNotFound(path) | Self::SourceDisconnected { root: path, .. } => Some(path),
            Self::InvalidPattern { .. }
            | Self::InvalidRegistration(_)
            | Self::AlreadyRunning(_)
            | Self::Notify(_)
            | Self::NonUtf8Path(_)
            | Self::Io(_)
            | Self::Config(_)
            | Self::NoRuntime(_) => None,
        }
    }
}

/// A failure captured from one handler invocation.
///
/// Produced when a handler returns an error or panics. The dispatcher logs it
/// and reports it on the observation feed; it never reaches the caller of
/// `dispatch` nor sibling handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler {handler_name} ({handler_id}) failed on {kind} {path}: {message}")]
pub struct HandlerError {
    /// The failing handler.
    pub handler_id: HandlerId,
    /// The handler's display name.
    pub handler_name: String,
    /// Path of the event being handled.
    pub path: Utf8PathBuf,
    /// Kind of the event being handled.
    pub kind: EventKind,
    /// The handler's own error message, or the panic payload.
    pub message: String,
    /// Whether the handler panicked rather than returning an error.
    pub panicked: bool,
}

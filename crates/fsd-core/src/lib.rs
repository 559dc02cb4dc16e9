//! Core configuration types and errors for fsdispatch.
//!
//! This crate holds the pieces shared by the engine and the CLI:
//!
//! - [`Config`] and its sections ([`WatchConfig`], [`DispatchConfig`],
//!   [`IgnoreConfig`])
//! - [`ConfigError`] for validation and parsing failures

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;

pub use config::{Config, DispatchConfig, IgnoreConfig, WatchConfig};
pub use error::ConfigError;

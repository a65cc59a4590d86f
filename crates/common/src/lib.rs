//! Common types shared across SFU components.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for identifier types
pub mod types;

/// Module for common configuration
pub mod config;

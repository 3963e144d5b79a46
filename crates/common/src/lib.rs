//! Common utilities and types shared across Huddle call components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for tracing initialisation
pub mod observability;

/// Module for secret types that prevent accidental logging
pub mod secret;

//! # Call Test Utilities
//!
//! Shared test utilities for the call session.
//!
//! This crate provides fake backends and fixtures for exercising the
//! negotiator and controller without devices or a network.
//!
//! ## Modules
//!
//! - `fake_peer` - Scripted offer/answer/ICE connection objects
//! - `fake_media` - Capture devices with injectable failures
//! - `fixtures` - Clients wired to one shared in-memory store
//! - `assertions` - Bounded waits on views and conditions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_session::actors::{DesiredMedia, SessionNegotiator};
//! use call_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let network = TestNetwork::new();
//!     let alice = network.client("alice");
//!
//!     let (handle, _task) = SessionNegotiator::spawn(
//!         alice.ctx.clone(),
//!         TestNetwork::channel(),
//!         DesiredMedia::default(),
//!         CancellationToken::new(),
//!     );
//!     handle.join().await.unwrap();
//! }
//! ```

pub mod assertions;
pub mod fake_media;
pub mod fake_peer;
pub mod fixtures;

pub use assertions::*;
pub use fake_media::*;
pub use fake_peer::*;
pub use fixtures::*;

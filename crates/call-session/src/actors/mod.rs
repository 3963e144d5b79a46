//! Actors of a call session.
//!
//! ```text
//! SessionController (one per client)
//! └── SessionNegotiator (at most one, per joined channel)
//!     ├── owns the connection object and local tracks
//!     └── forwards change feeds and connection events into its mailbox
//! ```
//!
//! - [`controller`] - reconciles the desired session with the negotiator
//! - [`negotiator`] - join/leave state machine for one session
//! - [`messages`] - message and view types

pub mod controller;
pub mod messages;
pub mod negotiator;

pub use controller::{SessionController, SessionControllerHandle};
pub use messages::*;
pub use negotiator::{NegotiatorHandle, SessionNegotiator};

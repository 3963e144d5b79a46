//! Huddle call session library.
//!
//! Peer-to-peer audio/video calls between members of a chat channel with no
//! dedicated media or signaling server. All signaling goes through a shared
//! realtime document store:
//!
//! - Role arbitration (offerer or answerer) via an atomic conditional write
//! - Offer/answer exchange and trickled connectivity candidates
//! - A roster of participants with media flags and moderator removal
//! - Best-effort cleanup of the shared documents once nobody is left
//!
//! # Architecture
//!
//! ```text
//! SessionController (one per client, talks to the UI)
//! └── SessionNegotiator (one per joined channel)
//!     ├── MediaDeviceManager   local tracks
//!     ├── PeerConnection       offer/answer/ICE connection object
//!     ├── PresenceTracker      own roster entry, removal detection
//!     └── SignalingChannel     typed access to the channel's documents
//! ```
//!
//! [`router::route`] turns the negotiator's view into render tiles.
//!
//! # Modules
//!
//! - [`actors`] - controller and negotiator actors
//! - [`config`] - configuration from environment
//! - [`errors`] - error types
//! - [`signaling`] - session documents, candidate logs and the roster
//! - [`store`] - document store abstraction with memory and Redis backends

pub mod actors;
pub mod authz;
pub mod candidates;
pub mod config;
pub mod context;
pub mod errors;
pub mod media;
pub mod model;
pub mod observability;
pub mod peer;
pub mod prefs;
pub mod presence;
pub mod router;
pub mod signaling;
pub mod store;

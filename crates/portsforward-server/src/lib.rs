//! Port forwarding engine
//!
//! Owns one rate-limited listener per forwarding rule, relays every accepted
//! connection to the rule's destination with two concurrent stream pumps, and
//! replaces the whole listener set when the rules change.

mod error;
mod forwarder;
mod manager;
mod mirror;
mod pump;
mod tap;

pub use error::ServerError;
pub use forwarder::{ConnectionForwarder, ConnectionIdGenerator, ForwardReport};
pub use manager::ListenerManager;
pub use mirror::{MirrorSink, MIRROR_QUEUE_CHUNKS};
pub use pump::{pump, Direction, PumpOptions, PumpOutcome, PumpReport, Tee};
pub use tap::{DataTap, DataTaps};

//! Bandwidth shaping for forwarded connections
//!
//! A [`RateLimitedListener`] wraps a bound `TcpListener`. Every connection it
//! accepts is throttled twice: by a budget private to that connection and by a
//! budget shared with every other connection of the same listener.

mod listener;
mod rate;
mod stream;

pub use listener::{Accepted, ListenerConfig, RateLimitedListener};
pub use rate::{Budget, RateConfig};
pub use stream::{RateLimitedReadHalf, RateLimitedStream, RateLimitedWriteHalf, ThrottledReader, ThrottledWriter};

//! Wire protocol for the crawl progress broker
//!
//! STOMP frames carry JSON progress envelopes on user and per-job destinations.

pub mod destinations;
pub mod frame;
pub mod messages;

pub use destinations::*;
pub use frame::{Command, Frame, FrameError};
pub use messages::*;

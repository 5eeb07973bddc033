pub mod address;
pub mod controller;
pub mod error;
pub mod listener;
pub mod logging;
pub mod mail;
pub mod status;
pub mod traits;
pub mod transmitter;

pub use tracing;

/// Broadcast to listeners, sessions and the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

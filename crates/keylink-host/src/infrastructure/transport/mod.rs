//! The physical link to a key.
//!
//! Real transports (USB CCID, NFC readers, accessory protocols) live outside
//! this crate.  They plug in by implementing [`Transport`]: a raw
//! frame-in/frame-out exchange plus a [`watch`] channel announcing when the
//! link comes and goes.
//!
//! # Testability
//!
//! Unit tests use the `mockall`-generated `MockTransport`.  Integration tests
//! and the `keylink` binary use [`simulated::SimulatedKey`], an in-process key
//! that speaks enough of the protocol to exercise the whole stack.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

pub mod simulated;

/// Whether the physical link is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// Error type for a single raw exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link dropped before or during the exchange.
    #[error("link is down")]
    LinkDown,

    /// The device did not answer in time.
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),

    /// The underlying driver reported a failure.
    #[error("transport I/O failure: {0}")]
    Io(String),
}

/// Raw access to one physical link.
///
/// Implementations may assume that at most one [`transmit`](Transport::transmit)
/// is in progress at a time; the connection task guarantees it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns `true` while the link is up.
    fn is_connected(&self) -> bool;

    /// Subscribes to link state changes.
    ///
    /// The sender side must announce every drop; dropping the sender is
    /// treated as a permanent disconnect.
    fn link_state(&self) -> watch::Receiver<LinkState>;

    /// Whether frames may use extended length encoding.
    fn supports_extended_length(&self) -> bool {
        false
    }

    /// Sends one encoded command frame and returns the raw response frame.
    async fn transmit(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;
}

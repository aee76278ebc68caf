//! Transport Socket Abstraction
//!
//! The connection layer never listens on a port. An acceptor hands it
//! already-established bidirectional sockets behind this trait and feeds
//! inbound events back through the manager (`handle_frame`, `handle_pong`,
//! `handle_close`).

use crate::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// One accepted bidirectional socket
#[async_trait]
pub trait ClientSocket: Send + Sync + Debug {
    /// Send one outbound frame
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Send a transport-level ping
    async fn ping(&self) -> Result<()>;

    /// Whether the socket is still open for sending
    fn is_open(&self) -> bool;

    /// Close the socket; further sends fail
    async fn close(&self);
}

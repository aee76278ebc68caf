//! Test Fakes
//!
//! In-memory `ClientSocket` implementation shared by unit and integration
//! tests. Kept in the library (not `#[cfg(test)]`) so downstream crates can
//! drive the manager without a real transport.

use crate::socket::ClientSocket;
use crate::{RealtimeError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A scriptable in-memory socket that records every outbound frame
#[derive(Debug, Default)]
pub struct MockSocket {
    open: AtomicBool,
    fail_sends: AtomicBool,
    pings: AtomicU64,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MockSocket {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            pings: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent `send` fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Frames sent so far, oldest first
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Most recent frame, if any
    pub fn last_frame(&self) -> Option<Vec<u8>> {
        self.sent.lock().last().cloned()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn ping_count(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientSocket for MockSocket {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RealtimeError::connection("Socket closed", None));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RealtimeError::connection("Simulated send failure", None));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RealtimeError::connection("Socket closed", None));
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

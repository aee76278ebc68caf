//! Cancellable One-Shot Timers
//!
//! One timer abstraction shared by the heartbeat pong timeout and the
//! circuit breaker reset, so cancel-on-early-success is implemented and
//! tested once. Dropping the handle cancels the timer.

use std::time::Duration;
use tokio::task::JoinHandle;

/// A fire-once timer that runs a callback after a delay unless cancelled
#[derive(Debug)]
pub struct OneShot {
    handle: JoinHandle<()>,
}

impl OneShot {
    /// Arm a timer that invokes `f` after `delay`
    pub fn arm<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Self { handle }
    }

    /// Arm a timer that runs an async task after `delay`
    pub fn arm_task<Fut>(delay: Duration, fut: Fut) -> Self
    where
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        Self { handle }
    }

    /// Cancel the timer; idempotent, a no-op if it already fired
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Whether the timer has fired or been cancelled
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

//! Single-fire deadline for multi-way waits

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// A deadline that completes once and then stays pending.
///
/// Unlike a bare `Sleep`, polling a fired `Deadline` again is harmless, so
/// one can sit in a `select!` loop across iterations without re-arming.
/// There is no reset: a new wait needs a new `Deadline`.
#[derive(Debug)]
pub struct Deadline {
    sleep: Pin<Box<Sleep>>,
    fired: bool,
}

impl Deadline {
    /// Deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(duration)),
            fired: false,
        }
    }

    /// Deadline `ms` milliseconds from now.
    pub fn after_millis(ms: u64) -> Self {
        Self::after(Duration::from_millis(ms))
    }

    /// Whether the deadline already completed a poll.
    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// When the deadline fires.
    pub fn deadline(&self) -> Instant {
        self.sleep
            .deadline()
    }
}

impl Future for Deadline {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.fired {
            return Poll::Pending;
        }
        match self
            .sleep
            .as_mut()
            .poll(cx)
        {
            Poll::Ready(()) => {
                self.fired = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

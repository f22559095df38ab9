//! Cancellable one-shot timer implemented using `tokio::time::Sleep`.

use std::future;
use std::pin::Pin;

use crate::utils::RendezvousError;

use tokio::time::{self, Duration, Instant, Sleep};

/// One-shot timer meant to be awaited as a `tokio::select!` branch. An idle
/// (never kicked-off or cancelled) timer never fires.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner sleep future, pinned in a box so it can be reset and awaited
    /// repeatedly.
    sleep: Pin<Box<Sleep>>,

    /// Duration used by the last kick-off.
    last_dur: Duration,

    /// Whether the timer is currently counting down.
    armed: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Creates a new idle timer.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
            armed: false,
        }
    }

    /// Gets the duration used by the last kick-off.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Returns true if the timer is counting down.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Starts (or restarts) the countdown with the given duration.
    pub fn kickoff(&mut self, dur: Duration) -> Result<(), RendezvousError> {
        if dur.is_zero() {
            return Err(RendezvousError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.armed = true;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Stops the countdown if one is running.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Waits for the timer to fire, disarming it. Pends forever if the timer
    /// is idle.
    pub async fn timeout(&mut self) {
        if !self.armed {
            future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

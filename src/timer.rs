//! The duration timer and the periodic tickers of a run.
//!
//! Both follow the same lifecycle: unset until `start`, running until `stop`,
//! then unset again. Starting a running primitive is an error; stopping an
//! unset one does nothing. `stop` waits for the task to exit, so a callback is
//! never running once it returns.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct Running {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            if e.is_panic() {
                log::warn!("timer task panicked: {}", e);
            }
        }
    }
}

/// One-shot timer that cancels a token when the duration elapses.
#[derive(Default)]
pub struct DurationTimer {
    running: Option<Running>,
}

impl DurationTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn start(&mut self, duration: Duration, expire: CancellationToken) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::InvalidState("duration timer already running".into()));
        }
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                _ = stopped.cancelled() => {}
                _ = time::sleep(duration) => {
                    log::debug!("duration of {:?} elapsed", duration);
                    expire.cancel();
                }
            }
        });
        self.running = Some(Running { cancel, join });
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop().await;
        }
    }
}

/// Repeating ticker invoking a callback every period.
///
/// The first call happens one period after `start`. Missed ticks are skipped
/// rather than bunched up.
#[derive(Default)]
pub struct Ticker {
    running: Option<Running>,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn start<F>(&mut self, period: Duration, mut on_tick: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        if self.running.is_some() {
            return Err(Error::InvalidState("ticker already running".into()));
        }
        if period.is_zero() {
            return Err(Error::Config("ticker period must be positive".into()));
        }
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let join = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    _ = interval.tick() => on_tick(),
                }
            }
        });
        self.running = Some(Running { cancel, join });
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop().await;
        }
    }
}

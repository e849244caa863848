use super::IperfTest;
use crate::config::Role;
use crate::error::{Error, Result};
use crate::reporter::EventCallback;
use crate::state::TestState;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

impl IperfTest {
    /// Serves sessions one after another until stopped.
    ///
    /// The engine is reset between sessions. A recoverable failure waits out
    /// the backoff its kind calls for and counts against the configured
    /// ceiling of consecutive failures; a successful session clears the
    /// count. Terminal failures end the loop immediately. Returns `Ok` once
    /// [`EngineHandle::stop`](super::EngineHandle::stop) has been called.
    pub async fn run_server_loop<C: EventCallback + 'static>(&mut self, callback: C) -> Result<()> {
        if self.config.role != Role::Server {
            return Err(Error::Config("the server loop needs the server role".into()));
        }
        if self.state() != TestState::Initialized {
            self.reset_for_next_test().await?;
        }
        let callback: Arc<dyn EventCallback> = Arc::new(callback);
        let policy = self.config.server_loop;
        let mut failures = 0u32;

        loop {
            if self.shared.stopped() {
                break;
            }
            let outcome = self.run_session(Arc::clone(&callback)).await;
            self.reset_for_next_test().await?;
            if self.shared.stopped() {
                break;
            }

            let pause = match outcome {
                Ok(_) => {
                    failures = 0;
                    policy.settle_delay
                }
                Err(e) => {
                    let Some(backoff) = policy.backoff_for(e.kind()) else {
                        error!("server stopping on terminal error: {}", e);
                        return Err(e);
                    };
                    failures += 1;
                    if failures >= policy.max_consecutive_failures {
                        error!("{} consecutive sessions failed, giving up", failures);
                        return Err(Error::TooManyFailures {
                            failures,
                            last: Box::new(e),
                        });
                    }
                    warn!(
                        "session failed ({}/{}): {}; retrying in {:?}",
                        failures, policy.max_consecutive_failures, e, backoff
                    );
                    backoff
                }
            };
            self.pause(pause).await;
        }

        info!("server loop stopped after {} sessions", self.test_count());
        Ok(())
    }

    /// Sleeps unless the engine is stopped first.
    async fn pause(&self, period: Duration) {
        let root = self.shared.root();
        tokio::select! {
            _ = root.cancelled() => {}
            _ = tokio::time::sleep(period) => {}
        }
    }
}

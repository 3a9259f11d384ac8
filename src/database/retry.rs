//! Bounded retry of metadata-store calls that fail transiently.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::StoreResult;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Pause after the first failure; doubles with every further one
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            pause: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempts run out
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        let mut pause = self.pause;
        loop {
            match operation().await {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(
                        operation = %name,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Transient metadata store error, retrying"
                    );
                    tokio::time::sleep(pause).await;
                    pause = pause.saturating_mul(2);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

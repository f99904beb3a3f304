//! Exponential backoff for re-establishing an endpoint's WebSocket.
//!
//! The first attempt is immediate; each failure doubles the wait, capped
//! at 30 seconds. A successful connection resets the schedule.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Tunable parameters for the backoff schedule.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Stateful backoff schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
            attempts: 0,
        }
    }

    /// Delay to wait after the latest failure; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = (self.current.as_millis() as f64 * self.config.multiplier) as u64;
        self.current = Duration::from_millis(grown).min(self.config.max_delay);
        self.attempts += 1;
        delay
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

/// Connect to the endpoint's ComfyUI, retrying with backoff.
///
/// Returns `None` if `cancel` fires before a connection succeeds.
pub async fn connect_with_backoff(
    client: &ComfyUIClient,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            result = client.connect() => match result {
                Ok(conn) => {
                    if backoff.attempts() > 0 {
                        tracing::info!(
                            endpoint = client.endpoint(),
                            attempts = backoff.attempts(),
                            "Reconnected to ComfyUI",
                        );
                    }
                    backoff.reset();
                    return Some(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = client.endpoint(),
                        error = %e,
                        attempt = backoff.attempts() + 1,
                        "ComfyUI connect attempt failed",
                    );
                }
            },
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

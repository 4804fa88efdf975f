//! Bounded retry with exponential backoff.
//!
//! Used to open the push channel (the engine may be briefly unreachable
//! between jobs) and by callers that poll the engine for a condition.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Constant spacing: `attempts` tries, `delay` apart.
    pub fn fixed(delay: Duration, attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts: attempts,
        }
    }

    /// The sequence of waits between attempts (one fewer than attempts).
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let waits = self.max_attempts.saturating_sub(1) as usize;
        std::iter::successors(Some(self.initial_delay), move |d| Some(next_delay(*d, self)))
            .take(waits)
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`].
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Connect as `client_id`, retrying per `config`.
///
/// Gives up after `max_attempts` failures or when `cancel` fires.
pub async fn connect_with_retry(
    client: &ComfyUIClient,
    client_id: &str,
    config: &BackoffConfig,
    cancel: &CancellationToken,
) -> Result<ComfyUIConnection, ComfyUIClientError> {
    let mut delays = config.delays();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ComfyUIClientError::Cancelled),
            result = client.connect_as(client_id) => result,
        };

        let err = match result {
            Ok(conn) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Connected to ComfyUI after retry");
                }
                return Ok(conn);
            }
            Err(e) => e,
        };

        let Some(delay) = delays.next() else {
            tracing::error!(attempt, error = %err, "Giving up connecting to ComfyUI");
            return Err(err);
        };
        tracing::warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "ComfyUI connect attempt failed, retrying",
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ComfyUIClientError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn next_delay_doubles_and_clamps() {
        let config = BackoffConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(2), &config), Duration::from_secs(4));
        assert_eq!(next_delay(Duration::from_secs(8), &config), Duration::from_secs(10));
    }

    #[test]
    fn delays_are_one_fewer_than_attempts() {
        let config = BackoffConfig::default();
        let secs: Vec<u64> = config.delays().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8]);
    }

    #[test]
    fn fixed_spacing() {
        let config = BackoffConfig::fixed(Duration::from_secs(1), 15);
        let delays: Vec<Duration> = config.delays().collect();
        assert_eq!(delays.len(), 14);
        assert!(delays.iter().all(|d| *d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn cancelled_token_stops_connecting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = ComfyUIClient::new("ws://127.0.0.1:9".into());
        let result =
            connect_with_retry(&client, "c1", &BackoffConfig::default(), &cancel).await;
        assert_matches!(result, Err(ComfyUIClientError::Cancelled));
    }

    #[tokio::test]
    async fn unreachable_engine_fails_after_budget() {
        let client = ComfyUIClient::new("ws://127.0.0.1:9".into());
        let config = BackoffConfig::fixed(Duration::from_millis(5), 2);
        let result = connect_with_retry(&client, "c1", &config, &CancellationToken::new()).await;
        assert_matches!(result, Err(ComfyUIClientError::Connection(_)));
    }
}

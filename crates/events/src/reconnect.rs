//! Exponential-backoff re-subscription.
//!
//! When a change subscription fails (transport error, timeout, closed
//! stream), the consumer calls [`resubscribe_loop`] to keep retrying with
//! increasing delays until a subscription is established or the
//! [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::feed::{ChangeFeed, Subscription};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
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

/// Calculate the next backoff delay, clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Wait `config.initial_delay`, then try to subscribe with backoff.
///
/// Returns `Some(subscription)` once one is established, or `None` if
/// `cancel` fires first.
pub async fn resubscribe_loop(
    feed: &dyn ChangeFeed,
    table: &str,
    filter: Option<&str>,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<Subscription> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        tracing::info!(
            table,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Re-subscribing to change feed",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(table, "Re-subscribe cancelled");
                return None;
            }
            result = feed.subscribe(table, filter) => match result {
                Ok(sub) => {
                    tracing::info!(table, attempt, "Change feed re-subscribed");
                    return Some(sub);
                }
                Err(e) => {
                    tracing::warn!(table, error = %e, "Re-subscribe attempt {attempt} failed");
                }
            }
        }

        delay = next_delay(delay, config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChangeBus;

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        assert_eq!(next_delay(Duration::from_secs(1), &config), Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(8), &config), Duration::from_secs(10));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &config);
        }
    }

    #[tokio::test]
    async fn cancellation_token_stops_resubscribe() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let bus = ChangeBus::default();
        let result = resubscribe_loop(&bus, "presence_records", None, &ReconnectConfig::default(), &cancel).await;
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_after_initial_delay() {
        let cancel = CancellationToken::new();
        let bus = ChangeBus::default();

        let sub = resubscribe_loop(&bus, "presence_records", None, &ReconnectConfig::default(), &cancel).await;
        assert!(sub.is_some());
    }
}

//! Best-effort notification dispatch with exponential backoff.
//!
//! Effects returned by the dossier reducer are dispatched after the booking transaction
//! committed. Delivery failures are retried, then logged and counted; they never undo a
//! booking.
//!
//! # Example
//!
//! ```rust
//! use terminbuchung_service::notification::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::new(2, Duration::from_millis(100));
//!
//! let result = retry_with_backoff(&policy, || async { Ok::<_, String>(42) }).await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use crate::config::NotificationConfig;
use crate::metrics::BENACHRICHTIGUNGEN;
use std::sync::Arc;
use std::time::Duration;
use terminbuchung_core::effect::Effect;
use terminbuchung_core::environment::ConfirmationService;
use terminbuchung_core::types::Impfdossier;
use tokio::time::sleep;

/// Upper bound for a single backoff delay
const MAX_DELAY: Duration = Duration::from_secs(5);

/// How often and how patiently a failed notification is retried.
///
/// The delay doubles after every failed attempt, capped at five seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
}

impl RetryPolicy {
    /// Creates a new `RetryPolicy`
    #[must_use]
    pub const fn new(max_retries: usize, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// Delay before retry number `attempt` (zero-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let faktor = 1_u32.checked_shl(u32::try_from(attempt).unwrap_or(u32::MAX)).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(faktor).min(MAX_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&NotificationConfig::default())
    }
}

impl From<&NotificationConfig> for RetryPolicy {
    fn from(config: &NotificationConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.initial_delay_ms))
    }
}

/// Retry an async operation with exponential backoff.
///
/// Returns the first success, or the last error once `max_retries` retries failed.
///
/// # Errors
///
/// Returns the operation's last error when all attempts failed.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

/// Dispatches reducer effects to the [`ConfirmationService`]
#[derive(Clone)]
pub struct Notifier {
    service: Arc<dyn ConfirmationService>,
    policy: RetryPolicy,
}

impl Notifier {
    /// Creates a new `Notifier`
    #[must_use]
    pub fn new(service: Arc<dyn ConfirmationService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    /// Deliver every effect; failures are logged and counted, never returned.
    pub async fn dispatch(&self, dossier: &Impfdossier, effects: &[Effect]) {
        for effect in effects {
            let (art, result) = match effect {
                Effect::BookingConfirmation { booster_termin } => {
                    let result = retry_with_backoff(&self.policy, || {
                        self.service
                            .send_booking_confirmation(dossier, booster_termin.as_ref())
                    })
                    .await;
                    ("bestaetigung", result)
                },
                Effect::Cancellation {
                    termin,
                    original_zeit,
                } => {
                    let result = retry_with_backoff(&self.policy, || {
                        self.service
                            .send_cancellation(dossier, termin.as_ref(), original_zeit)
                    })
                    .await;
                    ("absage", result)
                },
            };

            match result {
                Ok(()) => {
                    metrics::counter!(BENACHRICHTIGUNGEN, "art" => art, "ergebnis" => "ok").increment(1);
                },
                Err(error) => {
                    tracing::error!(
                        dossier_id = %dossier.id,
                        art,
                        error = %error,
                        "Notification failed after max retries"
                    );
                    metrics::counter!(BENACHRICHTIGUNGEN, "art" => art, "ergebnis" => "fehler")
                        .increment(1);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(5));
    }

    #[test]
    fn policy_follows_notification_config() {
        let config = NotificationConfig {
            max_retries: 4,
            initial_delay_ms: 250,
        };

        let policy = RetryPolicy::from(&config);

        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let mut calls = 0;

        let result: Result<(), String> = retry_with_backoff(&policy, || {
            calls += 1;
            async { Err("gateway down".to_string()) }
        })
        .await;

        assert_eq!(result, Err("gateway down".to_string()));
        assert_eq!(calls, 3);
    }
}

//! # Terminbuchung Testing
//!
//! Testing utilities for vaccination appointment booking.
//!
//! This crate provides:
//! - [`InMemoryStore`]: transactional in-memory store with row locks and version checks
//! - Mock implementations of Environment traits
//! - Fixtures for sites, slots and dossiers
//! - Property-based testing strategies
//! - [`ReducerTest`]: Given-When-Then harness for the dossier status machine
//!
//! ## Example
//!
//! ```ignore
//! use terminbuchung_testing::{test_clock, InMemoryStore};
//!
//! #[tokio::test]
//! async fn test_booking_flow() {
//!     let store = InMemoryStore::new();
//!     let service = BookingService::new(Arc::new(store.clone()), test_environment());
//!
//!     service.book_grundimmunisierung(dossier_id, slot1, slot2, &identity).await?;
//!
//!     assert_eq!(store.dossier(dossier_id).unwrap().status, ImpfdossierStatus::Gebucht);
//! }
//! ```

use chrono::{DateTime, Utc};
use terminbuchung_core::environment::Clock;

mod memory_store;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex, RwLock};
    use terminbuchung_core::environment::{ConfirmationService, EligibilityEngine, NotificationError};
    use terminbuchung_core::types::{DossierId, Impfdossier, Impftermin, Krankheit, Prioritaet, TerminId};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use terminbuchung_testing::mocks::FixedClock;
    /// use terminbuchung_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock that tests can move forward, for TTL and sweep scenarios
    #[derive(Debug)]
    pub struct ManualClock {
        time: RwLock<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: RwLock::new(time),
            }
        }

        /// Move the clock forward
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap();
            *time += by;
        }

        /// Set the clock to `time`
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned.
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Eligibility engine with a fixed set of unlocked priority groups
    #[derive(Debug, Default)]
    pub struct StaticEligibility {
        unlocked: RwLock<BTreeSet<Prioritaet>>,
        all: bool,
    }

    impl StaticEligibility {
        /// Every priority group is unlocked
        #[must_use]
        pub fn all_unlocked() -> Self {
            Self {
                unlocked: RwLock::new(BTreeSet::new()),
                all: true,
            }
        }

        /// No priority group is unlocked
        #[must_use]
        pub fn none_unlocked() -> Self {
            Self::default()
        }

        /// Unlock a priority group
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned.
        #[allow(clippy::unwrap_used)]
        pub fn unlock(&self, prioritaet: Prioritaet) {
            self.unlocked.write().unwrap().insert(prioritaet);
        }
    }

    impl EligibilityEngine for StaticEligibility {
        #[allow(clippy::unwrap_used)]
        fn is_prioritaet_freigegeben(&self, _krankheit: Krankheit, prioritaet: Prioritaet) -> bool {
            self.all || self.unlocked.read().unwrap().contains(&prioritaet)
        }
    }

    /// A notification captured by [`RecordingConfirmationService`]
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum SentNotification {
        /// Booking confirmation
        Confirmation {
            /// Dossier
            dossier_id: DossierId,
            /// Booster appointment
            booster_termin: Option<TerminId>,
        },
        /// Cancellation notice
        Cancellation {
            /// Dossier
            dossier_id: DossierId,
            /// Cancelled appointment
            termin: Option<TerminId>,
            /// Original time text
            original_zeit: String,
        },
    }

    /// Confirmation service that records deliveries and can fail on demand
    #[derive(Debug, Default, Clone)]
    pub struct RecordingConfirmationService {
        sent: Arc<Mutex<Vec<SentNotification>>>,
        attempts: Arc<AtomicU32>,
        failures_left: Arc<AtomicU32>,
    }

    impl RecordingConfirmationService {
        /// Create a service that always succeeds
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a service whose first `failures` attempts fail
        #[must_use]
        pub fn failing(failures: u32) -> Self {
            let service = Self::default();
            service.failures_left.store(failures, Ordering::SeqCst);
            service
        }

        /// Successfully delivered notifications
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned.
        #[must_use]
        #[allow(clippy::unwrap_used)]
        pub fn sent(&self) -> Vec<SentNotification> {
            self.sent.lock().unwrap().clone()
        }

        /// Delivery attempts including failed ones
        #[must_use]
        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        #[allow(clippy::unwrap_used)]
        fn deliver(&self, notification: SentNotification) -> Result<(), NotificationError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(NotificationError("SMS gateway unavailable".to_string()));
            }
            self.sent.lock().unwrap().push(notification);
            Ok(())
        }
    }

    #[async_trait]
    impl ConfirmationService for RecordingConfirmationService {
        async fn send_booking_confirmation(
            &self,
            dossier: &Impfdossier,
            booster_termin: Option<&Impftermin>,
        ) -> Result<(), NotificationError> {
            self.deliver(SentNotification::Confirmation {
                dossier_id: dossier.id,
                booster_termin: booster_termin.map(|t| t.id),
            })
        }

        async fn send_cancellation(
            &self,
            dossier: &Impfdossier,
            termin: Option<&Impftermin>,
            original_zeit: &str,
        ) -> Result<(), NotificationError> {
            self.deliver(SentNotification::Cancellation {
                dossier_id: dossier.id,
                termin: termin.map(|t| t.id),
                original_zeit: original_zeit.to_string(),
            })
        }
    }
}

/// Fixtures for sites, dossiers and timestamps
pub mod helpers {
    use chrono::{DateTime, TimeZone, Utc};
    use terminbuchung_core::types::{
        Impfdossier, ImpfdossierStatus, Krankheit, Odi, Prioritaet, Registrierungsnummer,
    };

    /// UTC timestamp; out-of-range input yields the Unix epoch
    #[must_use]
    pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .unwrap_or_default()
    }

    /// Site with managed appointments
    #[must_use]
    pub fn impfzentrum() -> Odi {
        Odi::new("Impfzentrum Bern", true)
    }

    /// Site without managed appointments
    #[must_use]
    pub fn hausarzt() -> Odi {
        Odi::new("Hausarztpraxis Dr. Muster", false)
    }

    /// Dossier in the given status, priority `A`
    #[must_use]
    pub fn dossier(krankheit: Krankheit, status: ImpfdossierStatus) -> Impfdossier {
        let mut dossier = Impfdossier::new(
            Registrierungsnummer::new(format!("REG{}", &uuid_suffix())),
            krankheit,
            Prioritaet::new('A'),
        );
        dossier.status = status;
        dossier
    }

    fn uuid_suffix() -> String {
        terminbuchung_core::types::DossierId::new()
            .to_string()
            .chars()
            .take(6)
            .collect::<String>()
            .to_uppercase()
    }

    /// Install a test subscriber; repeated calls are ignored
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("terminbuchung=debug"))
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing strategies using proptest.
pub mod properties {
    use proptest::prelude::*;
    use terminbuchung_core::types::{Impffolge, Kapazitaet};

    /// Any dose type
    pub fn impffolge() -> impl Strategy<Value = Impffolge> {
        prop_oneof![
            Just(Impffolge::ErsteImpfung),
            Just(Impffolge::ZweiteImpfung),
            Just(Impffolge::BoosterImpfung),
        ]
    }

    /// Capacities with every counter at most `max`
    pub fn kapazitaet(max: u32) -> impl Strategy<Value = Kapazitaet> {
        (0..=max, 0..=max, 0..=max).prop_map(|(erste, zweite, booster)| {
            Kapazitaet::new(erste, zweite, booster)
        })
    }
}

// Re-export commonly used items
pub use memory_store::{InMemoryStore, InMemoryTransaction};
pub use mocks::{
    FixedClock, ManualClock, RecordingConfirmationService, SentNotification, StaticEligibility,
    test_clock,
};
pub use reducer_test::{ReducerTest, assertions};

#[cfg(test)]
mod tests {
    use super::*;
    use terminbuchung_core::environment::ConfirmationService;
    use terminbuchung_core::types::{ImpfdossierStatus, Krankheit};

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(helpers::at(2025, 1, 1, 8, 0));
        clock.advance(chrono::Duration::hours(25));
        assert_eq!(clock.now(), helpers::at(2025, 1, 2, 9, 0));
    }

    #[tokio::test]
    async fn test_failing_confirmation_service_recovers() {
        let service = RecordingConfirmationService::failing(1);
        let dossier = helpers::dossier(Krankheit::Covid, ImpfdossierStatus::Gebucht);

        assert!(service.send_booking_confirmation(&dossier, None).await.is_err());
        assert!(service.send_booking_confirmation(&dossier, None).await.is_ok());
        assert_eq!(service.attempts(), 2);
        assert_eq!(service.sent().len(), 1);
    }
}

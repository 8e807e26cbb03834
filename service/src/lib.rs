//! # Terminbuchung Service
//!
//! Transactional use cases for vaccination appointment booking:
//!
//! - [`slots::SlotService`]: slot generation and availability
//! - [`allocator::AppointmentAllocator`]: find, reserve, book, free and create appointments
//! - [`resizer::CapacityResizer`]: keep appointment rows in step with slot capacity
//! - [`booking::BookingService`]: booking, rebooking, cancellation, controls and
//!   vaccinations, driving the dossier status machine
//! - [`sweep::KontrolleSweep`]: reset controls that became stale
//!
//! Every use case runs in one store transaction. Notifications are dispatched after
//! commit and never fail a booking.

use std::sync::Arc;
use terminbuchung_core::environment::{Clock, EligibilityEngine};
use terminbuchung_core::status::DossierEnvironment;
use terminbuchung_core::store::Transaction;

pub mod allocator;
pub mod booking;
pub mod config;
pub mod metrics;
pub mod notification;
pub mod resizer;
pub mod slots;
pub mod sweep;

pub use allocator::{AppointmentAllocator, Buchungsziel};
pub use booking::BookingService;
pub use config::{BookingConfig, Config};
pub use notification::{Notifier, RetryPolicy};
pub use resizer::CapacityResizer;
pub use slots::{FreierSlot, SlotService};
pub use sweep::{KontrolleSweep, SweepReport};

/// Dependencies shared by the booking use cases
#[derive(Clone)]
pub struct BookingEnvironment {
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Priority unlock rules
    pub eligibility: Arc<dyn EligibilityEngine>,
    /// Notification dispatch
    pub notifier: Notifier,
    /// Booking rules
    pub config: BookingConfig,
}

impl BookingEnvironment {
    /// Creates a new `BookingEnvironment`
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        eligibility: Arc<dyn EligibilityEngine>,
        notifier: Notifier,
        config: BookingConfig,
    ) -> Self {
        Self {
            clock,
            eligibility,
            notifier,
            config,
        }
    }

    /// Environment for the dossier reducer
    #[must_use]
    pub fn dossier_environment(&self) -> DossierEnvironment {
        DossierEnvironment::new(Arc::clone(&self.clock), Arc::clone(&self.eligibility))
    }
}

/// Roll back after a failed use case; the original error is what the caller sees.
pub(crate) async fn rollback(tx: &mut dyn Transaction) {
    if let Err(error) = tx.rollback().await {
        tracing::warn!(error = %error, "Rollback failed");
    }
}

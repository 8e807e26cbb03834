//! Error types for appointment booking.
//!
//! [`StoreError`] is what storage adapters report. [`BookingError`] is what every
//! use case returns; store conflicts on appointments surface as
//! [`BookingError::AppointmentTaken`] so callers can retry with another appointment.

use crate::types::{DossierId, Impffolge, ImpfdossierStatus, SlotId};
use std::fmt;
use thiserror::Error;

/// Kind of persisted entity, used in error context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Entity {
    /// Vaccination site
    Odi,
    /// Slot
    Slot,
    /// Appointment
    Termin,
    /// Dossier
    Dossier,
    /// Booster entry
    Eintrag,
    /// Administered vaccination
    Impfung,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Odi => "odi",
            Self::Slot => "impfslot",
            Self::Termin => "impftermin",
            Self::Dossier => "impfdossier",
            Self::Eintrag => "impfdossiereintrag",
            Self::Impfung => "impfung",
        };
        f.write_str(name)
    }
}

/// Errors reported by a [`Store`](crate::store::Store) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the row changed since it was read.
    #[error("Concurrent modification of {entity} {id}")]
    Conflict {
        /// Entity kind
        entity: Entity,
        /// Entity identifier
        id: String,
    },

    /// A uniqueness constraint rejected the write.
    #[error("Unique constraint {constraint} violated on {entity}")]
    UniqueViolation {
        /// Entity the constrained column references
        entity: Entity,
        /// Constraint name
        constraint: String,
    },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),
}

/// Errors returned by booking use cases.
#[derive(Error, Debug)]
pub enum BookingError {
    /// Every candidate appointment is taken, or a concurrent booking won the race.
    #[error("Appointment no longer available ({})", describe_slot(*slot_id, *impffolge))]
    AppointmentTaken {
        /// Slot that ran out of appointments, if known
        slot_id: Option<SlotId>,
        /// Dose type that ran out, if known
        impffolge: Option<Impffolge>,
    },

    /// The dossier's status does not allow the operation.
    #[error("Dossier {dossier_id} in status {status} does not allow {operation}")]
    WrongDossierStatus {
        /// Dossier identifier
        dossier_id: DossierId,
        /// Current status
        status: ImpfdossierStatus,
        /// Rejected operation
        operation: &'static str,
    },

    /// Capacity cannot shrink because too many appointments are booked or referenced.
    #[error(
        "Cannot reduce {impffolge} capacity of slot {slot_id} to {requested}: only {removable} appointments removable"
    )]
    CapacityReductionBlocked {
        /// Slot identifier
        slot_id: SlotId,
        /// Dose type
        impffolge: Impffolge,
        /// Requested capacity
        requested: u32,
        /// Appointments that could be deleted
        removable: u32,
    },

    /// Programming or data-integrity error.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    EntityNotFound {
        /// Entity kind
        entity: Entity,
        /// Entity identifier
        id: String,
    },

    /// Invalid input.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Storage failure.
    #[error("Store error: {0}")]
    Store(StoreError),
}

fn describe_slot(slot_id: Option<SlotId>, impffolge: Option<Impffolge>) -> String {
    match (slot_id, impffolge) {
        (Some(slot), Some(folge)) => format!("slot {slot}, {folge}"),
        (Some(slot), None) => format!("slot {slot}"),
        (None, Some(folge)) => folge.to_string(),
        (None, None) => "concurrent booking".to_string(),
    }
}

impl BookingError {
    /// Shorthand for [`BookingError::EntityNotFound`]
    #[must_use]
    pub fn not_found(entity: Entity, id: impl fmt::Display) -> Self {
        Self::EntityNotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the error is the caller's fault and must not be retried blindly.
    ///
    /// Everything else is an internal error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::AppointmentTaken { .. }
                | Self::WrongDossierStatus { .. }
                | Self::CapacityReductionBlocked { .. }
                | Self::EntityNotFound { .. }
                | Self::Validation(_)
        )
    }
}

impl From<StoreError> for BookingError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict {
                entity: Entity::Termin,
                ..
            }
            | StoreError::UniqueViolation {
                entity: Entity::Termin,
                ..
            } => Self::AppointmentTaken {
                slot_id: None,
                impffolge: None,
            },
            other => Self::Store(other),
        }
    }
}

/// Result alias for booking use cases
pub type Result<T> = std::result::Result<T, BookingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termin_conflicts_become_appointment_taken() {
        let conflict = StoreError::Conflict {
            entity: Entity::Termin,
            id: "t-1".to_string(),
        };
        assert!(matches!(
            BookingError::from(conflict),
            BookingError::AppointmentTaken { .. }
        ));

        let unique = StoreError::UniqueViolation {
            entity: Entity::Termin,
            constraint: "uq_dossier_termin1".to_string(),
        };
        assert!(BookingError::from(unique).is_validation());
    }

    #[test]
    fn dossier_conflicts_stay_internal() {
        let conflict = StoreError::Conflict {
            entity: Entity::Dossier,
            id: "d-1".to_string(),
        };
        let error = BookingError::from(conflict);
        assert!(matches!(error, BookingError::Store(_)));
        assert!(!error.is_validation());
    }
}

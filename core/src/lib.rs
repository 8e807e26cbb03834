//! # Terminbuchung Core
//!
//! Domain model, dossier status machine and storage port for vaccination
//! appointment booking.
//!
//! ## Core Concepts
//!
//! - **Slot / Termin**: capacity of a time window at a site, backed one-to-one by
//!   bookable appointments
//! - **Dossier**: a person's case for one disease, with a status machine
//! - **Reducer**: pure function `(State, Action, Environment) → (State, Effects)`
//!   driving dossier status changes
//! - **Effect**: notification descriptions, executed by the service after commit
//! - **Environment**: injected clock, eligibility and identity ports
//!
//! ## Example
//!
//! ```ignore
//! use terminbuchung_core::reducer::Reducer;
//! use terminbuchung_core::status::{DossierAction, DossierReducer, DossierState};
//!
//! let mut state = DossierState::new(dossier, None);
//! let effects = DossierReducer.reduce(&mut state, DossierAction::PrioritaetFreigegeben, &env)?;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod error;
pub mod status;
pub mod store;
pub mod types;

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
/// They contain all business logic and are deterministic and testable.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    /// - `Error`: Rejection reason when the action is not allowed
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// The rejection type
        type Error;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        ///
        /// A rejected action leaves the state untouched.
        ///
        /// # Errors
        ///
        /// Returns `Self::Error` when the action is not allowed in the current state.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> Result<SmallVec<[Effect; 4]>, Self::Error>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects are NOT executed by the reducer. They are descriptions returned to the
/// service, which dispatches them after the surrounding transaction committed.
pub mod effect {
    use crate::types::Impftermin;

    /// Effect type - describes a notification to be sent
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Effect {
        /// Send a booking confirmation for the dossier's current appointments
        BookingConfirmation {
            /// Booked booster appointment, `None` for grundimmunisierung bookings
            booster_termin: Option<Impftermin>,
        },

        /// Send a cancellation notice
        Cancellation {
            /// First cancelled appointment, as it was before release
            termin: Option<Impftermin>,
            /// Original time text of the cancelled appointment
            original_zeit: String,
        },
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use crate::types::{Impfdossier, Impftermin, Krankheit, Prioritaet};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::BTreeSet;
    use thiserror::Error;

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Decides whether a priority group is unlocked for a disease
    pub trait EligibilityEngine: Send + Sync {
        /// Whether persons of `prioritaet` may book for `krankheit`
        fn is_prioritaet_freigegeben(&self, krankheit: Krankheit, prioritaet: Prioritaet) -> bool;
    }

    /// Caller roles known to the booking service
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Rolle {
        /// The person booking for themselves
        Impfwilliger,
        /// Call-centre agent booking on behalf of a person
        Callcenter,
        /// Site staff recording controls
        OiKontrolle,
        /// Site staff documenting vaccinations
        OiDokumentation,
    }

    /// Supplies the caller's role set
    pub trait IdentityProvider: Send + Sync {
        /// Roles of the current caller
        fn roles(&self) -> BTreeSet<Rolle>;

        /// Whether the caller holds `rolle`
        fn has_role(&self, rolle: Rolle) -> bool {
            self.roles().contains(&rolle)
        }
    }

    /// Fixed role set, for batch jobs and tests
    #[derive(Clone, Debug, Default)]
    pub struct StaticIdentity(pub BTreeSet<Rolle>);

    impl StaticIdentity {
        /// Identity holding the given roles
        #[must_use]
        pub fn with_roles(roles: impl IntoIterator<Item = Rolle>) -> Self {
            Self(roles.into_iter().collect())
        }
    }

    impl IdentityProvider for StaticIdentity {
        fn roles(&self) -> BTreeSet<Rolle> {
            self.0.clone()
        }
    }

    /// Notification delivery failure
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    #[error("Notification failed: {0}")]
    pub struct NotificationError(pub String);

    /// Sends booking confirmations and cancellation notices
    #[async_trait]
    pub trait ConfirmationService: Send + Sync {
        /// Confirm the dossier's booked appointments.
        ///
        /// # Errors
        ///
        /// Returns [`NotificationError`] when delivery failed.
        async fn send_booking_confirmation(
            &self,
            dossier: &Impfdossier,
            booster_termin: Option<&Impftermin>,
        ) -> Result<(), NotificationError>;

        /// Announce a cancelled appointment.
        ///
        /// # Errors
        ///
        /// Returns [`NotificationError`] when delivery failed.
        async fn send_cancellation(
            &self,
            dossier: &Impfdossier,
            termin: Option<&Impftermin>,
            original_zeit: &str,
        ) -> Result<(), NotificationError>;
    }
}

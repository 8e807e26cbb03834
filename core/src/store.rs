//! Storage port for slots, appointments and dossiers.
//!
//! All use cases run inside a [`Transaction`] obtained from a [`Store`]. Writes become
//! visible only after [`Transaction::commit`]; dropping a transaction without committing
//! discards it.
//!
//! # Concurrency
//!
//! - `update_*` methods use optimistic versioning: a stale `version` yields
//!   [`StoreError::Conflict`].
//! - [`Transaction::find_free_termin`] locks the returned row and skips rows locked by
//!   other transactions, so concurrent bookers never receive the same appointment.
//! - A given appointment may be referenced by at most one dossier or booster entry;
//!   a second reference fails with [`StoreError::UniqueViolation`].
//!
//! # Implementations
//!
//! - `PostgresStore` (in `terminbuchung-postgres`): production implementation
//! - `InMemoryStore` (in `terminbuchung-testing`): fast, deterministic testing

use crate::error::StoreError;
use crate::types::{
    DossierId, Impfdossier, Impffolge, Impfslot, Impftermin, Impfung, Krankheit, Odi, OdiId,
    Registrierungsnummer, SlotId, TerminId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Filter for slot listings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotFilter {
    /// Site
    pub odi_id: OdiId,
    /// Disease
    pub krankheit: Krankheit,
    /// Earliest slot start (inclusive)
    pub von: DateTime<Utc>,
    /// Latest slot start (exclusive)
    pub bis: DateTime<Utc>,
}

/// Factory for transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Begin a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no connection is available.
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;
}

/// One unit of work against the store.
#[async_trait]
pub trait Transaction: Send {
    // ---- Sites ----

    /// Load a site.
    async fn find_odi(&mut self, id: OdiId) -> StoreResult<Option<Odi>>;

    /// Insert a site.
    async fn insert_odi(&mut self, odi: &Odi) -> StoreResult<()>;

    // ---- Slots ----

    /// Load a slot.
    async fn find_slot(&mut self, id: SlotId) -> StoreResult<Option<Impfslot>>;

    /// Slot of `odi_id` and `krankheit` whose window contains `zeitpunkt`.
    async fn find_slot_covering(
        &mut self,
        odi_id: OdiId,
        krankheit: Krankheit,
        zeitpunkt: DateTime<Utc>,
    ) -> StoreResult<Option<Impfslot>>;

    /// Slots matching the filter, ordered by start time.
    async fn find_slots(&mut self, filter: &SlotFilter) -> StoreResult<Vec<Impfslot>>;

    /// Insert a slot.
    async fn insert_slot(&mut self, slot: &Impfslot) -> StoreResult<()>;

    /// Update a slot's capacity; bumps and returns the version.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if `slot.version` is stale.
    async fn update_slot(&mut self, slot: &Impfslot) -> StoreResult<i64>;

    // ---- Appointments ----

    /// Load an appointment.
    async fn find_termin(&mut self, id: TerminId) -> StoreResult<Option<Impftermin>>;

    /// Appointments of a slot and dose type in storage order.
    async fn list_termine(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
    ) -> StoreResult<Vec<Impftermin>>;

    /// Lock and return one free appointment of the slot and dose type.
    ///
    /// Reservations taken before `reservation_cutoff` count as free. Rows locked by
    /// other transactions are skipped.
    async fn find_free_termin(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
        reservation_cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Impftermin>>;

    /// Appointment of the slot and dose type actively reserved for `registrierung`.
    async fn find_reserved_termin(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
        registrierung: &Registrierungsnummer,
        reservation_cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Impftermin>>;

    /// Number of free appointments of the slot and dose type.
    async fn count_free_termine(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
        reservation_cutoff: DateTime<Utc>,
    ) -> StoreResult<u32>;

    /// Insert an appointment.
    async fn insert_termin(&mut self, termin: &Impftermin) -> StoreResult<()>;

    /// Update booking and reservation markers; bumps and returns the version.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if `termin.version` is stale.
    async fn update_termin(&mut self, termin: &Impftermin) -> StoreResult<i64>;

    /// Delete a free appointment.
    ///
    /// Fails with [`StoreError::Conflict`] if the row changed since `termin` was read
    /// or is booked.
    async fn delete_termin(&mut self, termin: &Impftermin) -> StoreResult<()>;

    /// Whether a dossier or booster entry references the appointment.
    async fn is_termin_referenced(&mut self, id: TerminId) -> StoreResult<bool>;

    // ---- Dossiers ----

    /// Load a dossier with its booster entries.
    async fn find_dossier(&mut self, id: DossierId) -> StoreResult<Option<Impfdossier>>;

    /// Insert a dossier with its booster entries.
    async fn insert_dossier(&mut self, dossier: &Impfdossier) -> StoreResult<()>;

    /// Update a dossier and synchronise its booster entries; bumps and returns the version.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if `dossier.version` is stale
    /// - [`StoreError::UniqueViolation`] if an appointment is referenced twice
    async fn update_dossier(&mut self, dossier: &Impfdossier) -> StoreResult<i64>;

    /// Dossiers in a controlled status whose control is older than `cutoff`.
    async fn find_dossiers_kontrolliert_vor(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<DossierId>>;

    // ---- Vaccinations ----

    /// Vaccination administered in the given appointment.
    async fn find_impfung_by_termin(&mut self, termin_id: TerminId) -> StoreResult<Option<Impfung>>;

    /// Vaccinations of a dossier ordered by administration time.
    async fn list_impfungen(&mut self, dossier_id: DossierId) -> StoreResult<Vec<Impfung>>;

    /// Insert a vaccination.
    async fn insert_impfung(&mut self, impfung: &Impfung) -> StoreResult<()>;

    /// Delete a vaccination.
    async fn delete_impfung(&mut self, impfung: &Impfung) -> StoreResult<()>;

    // ---- Lifecycle ----

    /// Commit the transaction.
    async fn commit(&mut self) -> StoreResult<()>;

    /// Roll the transaction back.
    async fn rollback(&mut self) -> StoreResult<()>;
}

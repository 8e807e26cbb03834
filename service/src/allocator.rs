//! Appointment allocation within slots.
//!
//! The allocator works inside the caller's [`Transaction`]: it finds, reserves, books
//! and releases [`Impftermin`] rows and keeps the dossier's appointment references in
//! step. Status changes are left to the dossier reducer.

use crate::config::BookingConfig;
use crate::metrics::{TERMINE_AD_HOC, TERMINE_FREIGEGEBEN, TERMINE_GEBUCHT};
use std::sync::Arc;
use terminbuchung_core::environment::Clock;
use terminbuchung_core::error::{BookingError, Entity, Result};
use terminbuchung_core::store::Transaction;
use terminbuchung_core::types::{
    Impfdossier, Impffolge, Impfslot, Impftermin, Kapazitaet, Krankheit, OdiId,
    Registrierungsnummer, SlotId, TerminId, Zeitfenster, reservation_cutoff,
};
use chrono::{DateTime, Utc};

/// Where a booked appointment is referenced from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Buchungsziel {
    /// `Buchung.impftermin1`
    ErsteImpfung,
    /// `Buchung.impftermin2`
    ZweiteImpfung,
    /// The booster entry with this sequence number
    Booster {
        /// Booster sequence number
        impffolge_nr: u32,
    },
}

impl Buchungsziel {
    /// Dose type of appointments that fit this target
    #[must_use]
    pub const fn impffolge(self) -> Impffolge {
        match self {
            Self::ErsteImpfung => Impffolge::ErsteImpfung,
            Self::ZweiteImpfung => Impffolge::ZweiteImpfung,
            Self::Booster { .. } => Impffolge::BoosterImpfung,
        }
    }

    /// Appointment the dossier currently references at this target
    #[must_use]
    pub fn termin_von(self, dossier: &Impfdossier) -> Option<TerminId> {
        match self {
            Self::ErsteImpfung => dossier.buchung.impftermin1,
            Self::ZweiteImpfung => dossier.buchung.impftermin2,
            Self::Booster { impffolge_nr } => {
                dossier.eintrag(impffolge_nr).and_then(|e| e.impftermin)
            },
        }
    }

    fn setzen(self, dossier: &mut Impfdossier, termin: Option<TerminId>) {
        match self {
            Self::ErsteImpfung => dossier.buchung.impftermin1 = termin,
            Self::ZweiteImpfung => dossier.buchung.impftermin2 = termin,
            Self::Booster { impffolge_nr } => dossier.eintrag_anlegen(impffolge_nr).impftermin = termin,
        }
    }
}

/// Finds, reserves, books and releases appointments
#[derive(Clone)]
pub struct AppointmentAllocator {
    clock: Arc<dyn Clock>,
    config: BookingConfig,
}

impl AppointmentAllocator {
    /// Creates a new `AppointmentAllocator`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: BookingConfig) -> Self {
        Self { clock, config }
    }

    fn cutoff(&self) -> DateTime<Utc> {
        reservation_cutoff(self.clock.now(), self.config.reservation_ttl())
    }

    /// One free appointment of the slot and dose type, locked for this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Store`] on storage failure.
    pub async fn find_free_appointment(
        &self,
        tx: &mut dyn Transaction,
        slot_id: SlotId,
        impffolge: Impffolge,
    ) -> Result<Option<Impftermin>> {
        Ok(tx.find_free_termin(slot_id, impffolge, self.cutoff()).await?)
    }

    /// The appointment reserved for `registrierung`, else a free one.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Store`] on storage failure.
    pub async fn find_my_reserved_or_free_appointment(
        &self,
        tx: &mut dyn Transaction,
        registrierung: &Registrierungsnummer,
        slot_id: SlotId,
        impffolge: Impffolge,
    ) -> Result<Option<Impftermin>> {
        let cutoff = self.cutoff();
        if let Some(termin) = tx
            .find_reserved_termin(slot_id, impffolge, registrierung, cutoff)
            .await?
        {
            return Ok(Some(termin));
        }
        Ok(tx.find_free_termin(slot_id, impffolge, cutoff).await?)
    }

    /// Soft-hold `termin` for `registrierung`.
    ///
    /// # Errors
    ///
    /// - [`BookingError::AppointmentTaken`] if the appointment is booked or held by
    ///   someone else, or a concurrent writer changed it
    pub async fn reserve(
        &self,
        tx: &mut dyn Transaction,
        registrierung: &Registrierungsnummer,
        termin: &mut Impftermin,
    ) -> Result<()> {
        let cutoff = self.cutoff();
        if !termin.is_frei(cutoff) && !termin.is_reserviert_fuer(registrierung, cutoff) {
            return Err(taken(termin));
        }
        termin.reserviert_fuer = Some(registrierung.clone());
        termin.timestamp_reserviert = Some(self.clock.now());
        termin.version = tx.update_termin(termin).await?;
        tracing::debug!(termin_id = %termin.id, registrierung = %registrierung, "Appointment reserved");
        Ok(())
    }

    /// Hard-assign `termin` to the dossier at `ziel`.
    ///
    /// The caller frees any appointment previously booked at `ziel` first.
    ///
    /// # Errors
    ///
    /// - [`BookingError::AppointmentTaken`] if the appointment is booked or held by
    ///   another registration
    /// - [`BookingError::IllegalState`] if the dose type does not fit or `ziel` is
    ///   still occupied
    pub async fn book(
        &self,
        tx: &mut dyn Transaction,
        dossier: &mut Impfdossier,
        termin: &mut Impftermin,
        ziel: Buchungsziel,
    ) -> Result<()> {
        if termin.impffolge != ziel.impffolge() {
            return Err(illegal(format!(
                "appointment {} is for {}, not {}",
                termin.id,
                termin.impffolge,
                ziel.impffolge()
            )));
        }
        match ziel.termin_von(dossier) {
            Some(current) if current == termin.id && termin.gebucht => return Ok(()),
            Some(current) => {
                return Err(illegal(format!(
                    "dossier {} still holds appointment {current} for {:?}",
                    dossier.id, ziel
                )));
            },
            None => {},
        }

        let cutoff = self.cutoff();
        if !termin.is_frei(cutoff) && !termin.is_reserviert_fuer(&dossier.registrierungsnummer, cutoff) {
            return Err(taken(termin));
        }

        termin.gebucht = true;
        termin.reserviert_fuer = Some(dossier.registrierungsnummer.clone());
        termin.timestamp_reserviert = None;
        termin.version = tx.update_termin(termin).await?;
        ziel.setzen(dossier, Some(termin.id));

        metrics::counter!(TERMINE_GEBUCHT, "impffolge" => termin.impffolge.as_str()).increment(1);
        tracing::debug!(
            dossier_id = %dossier.id,
            termin_id = %termin.id,
            slot_id = %termin.slot_id,
            impffolge = %termin.impffolge,
            "Appointment booked"
        );
        Ok(())
    }

    /// Release the appointment booked at `ziel` and clear the dossier's reference.
    ///
    /// Returns the appointment as it was before release, or `None` if nothing was booked.
    ///
    /// # Errors
    ///
    /// - [`BookingError::IllegalState`] if a vaccination references the appointment
    /// - [`BookingError::EntityNotFound`] if the referenced appointment is missing
    pub async fn free(
        &self,
        tx: &mut dyn Transaction,
        dossier: &mut Impfdossier,
        ziel: Buchungsziel,
    ) -> Result<Option<Impftermin>> {
        let Some(termin_id) = ziel.termin_von(dossier) else {
            return Ok(None);
        };
        if tx.find_impfung_by_termin(termin_id).await?.is_some() {
            return Err(illegal(format!(
                "appointment {termin_id} of dossier {} has a vaccination and cannot be freed",
                dossier.id
            )));
        }
        let vorher = tx
            .find_termin(termin_id)
            .await?
            .ok_or_else(|| BookingError::not_found(Entity::Termin, termin_id))?;

        let mut termin = vorher.clone();
        termin.freigeben();
        tx.update_termin(&termin).await?;
        ziel.setzen(dossier, None);

        metrics::counter!(TERMINE_FREIGEGEBEN, "impffolge" => termin.impffolge.as_str()).increment(1);
        tracing::debug!(dossier_id = %dossier.id, termin_id = %termin_id, "Appointment freed");
        Ok(Some(vorher))
    }

    /// A free appointment at `odi_id` for the walk-in time `zeitpunkt`.
    ///
    /// Returns an existing free appointment of the slot covering `zeitpunkt`. Otherwise
    /// a new appointment is added to that slot (or to a new grid-aligned slot) and the
    /// slot's capacity grows by one.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Store`] on storage failure.
    pub async fn create_on_demand_appointment(
        &self,
        tx: &mut dyn Transaction,
        krankheit: Krankheit,
        impffolge: Impffolge,
        odi_id: OdiId,
        zeitpunkt: DateTime<Utc>,
    ) -> Result<Impftermin> {
        let slot = match tx.find_slot_covering(odi_id, krankheit, zeitpunkt).await? {
            Some(slot) => {
                if let Some(termin) = tx.find_free_termin(slot.id, impffolge, self.cutoff()).await? {
                    return Ok(termin);
                }
                let mut slot = slot;
                let kapazitaet = slot.kapazitaet.get(impffolge) + 1;
                slot.kapazitaet.set(impffolge, kapazitaet);
                slot.version = tx.update_slot(&slot).await?;
                slot
            },
            None => {
                let mut kapazitaet = Kapazitaet::default();
                kapazitaet.set(impffolge, 1);
                let slot = Impfslot::new(
                    krankheit,
                    odi_id,
                    Zeitfenster::ausgerichtet(zeitpunkt, self.config.slot_duration()),
                    kapazitaet,
                );
                tx.insert_slot(&slot).await?;
                tracing::info!(
                    slot_id = %slot.id,
                    odi_id = %odi_id,
                    zeitfenster = %slot.zeitfenster,
                    "Slot created on demand"
                );
                slot
            },
        };

        let termin = Impftermin::new(slot.id, impffolge);
        tx.insert_termin(&termin).await?;
        metrics::counter!(TERMINE_AD_HOC, "impffolge" => impffolge.as_str()).increment(1);
        tracing::debug!(slot_id = %slot.id, termin_id = %termin.id, "Appointment created on demand");
        Ok(termin)
    }
}

fn taken(termin: &Impftermin) -> BookingError {
    BookingError::AppointmentTaken {
        slot_id: Some(termin.slot_id),
        impffolge: Some(termin.impffolge),
    }
}

fn illegal(message: String) -> BookingError {
    tracing::error!(%message, "Illegal allocation state");
    BookingError::IllegalState(message)
}

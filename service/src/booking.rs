//! Booking use cases.
//!
//! Each public method of [`BookingService`] is one transaction: load the dossier,
//! let the allocator change appointments, reduce the matching [`DossierAction`], write
//! the dossier and commit. Effects returned by the reducer are dispatched only after a
//! successful commit.

use crate::allocator::{AppointmentAllocator, Buchungsziel};
use crate::metrics::APPOINTMENT_TAKEN;
use crate::BookingEnvironment;
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use std::sync::Arc;
use terminbuchung_core::effect::Effect;
use terminbuchung_core::environment::{IdentityProvider, Rolle};
use terminbuchung_core::error::{BookingError, Entity, Result};
use terminbuchung_core::reducer::Reducer;
use terminbuchung_core::status::{
    DossierAction, DossierEnvironment, DossierReducer, DossierState, Ereignis, StatusGuards,
    naechster_status,
};
use terminbuchung_core::store::{Store, Transaction};
use terminbuchung_core::types::{
    AbgesagteTermine, DossierId, ExternesZertifikat, ImpfdossierStatus, Impfdossier, Impffolge,
    Impfschutz, Impfslot, Impftermin, Impfung, ImpfungId, Kontrolle, OdiId, SlotId, TerminId,
};

/// Outcome of a use case before commit
struct Ergebnis<T = ()> {
    dossier: Impfdossier,
    effects: SmallVec<[Effect; 4]>,
    wert: T,
}

/// Transactional booking use cases
#[derive(Clone)]
pub struct BookingService {
    store: Arc<dyn Store>,
    env: BookingEnvironment,
    dossier_env: DossierEnvironment,
    allocator: AppointmentAllocator,
    reducer: DossierReducer,
}

impl BookingService {
    /// Creates a new `BookingService`
    #[must_use]
    pub fn new(store: Arc<dyn Store>, env: BookingEnvironment) -> Self {
        let allocator = AppointmentAllocator::new(Arc::clone(&env.clock), env.config.clone());
        Self {
            store,
            dossier_env: env.dossier_environment(),
            env,
            allocator,
            reducer: DossierReducer::new(),
        }
    }

    /// The allocator used by this service
    #[must_use]
    pub const fn allocator(&self) -> &AppointmentAllocator {
        &self.allocator
    }

    // ========================================================================
    // Booking
    // ========================================================================

    /// Book the first and second dose appointments.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] unless the dossier is `Freigegeben`
    /// - [`BookingError::Validation`] if the slots are for another disease, out of
    ///   order, or violate the configured distance between doses
    /// - [`BookingError::AppointmentTaken`] if either slot has no free appointment
    pub async fn book_grundimmunisierung(
        &self,
        dossier_id: DossierId,
        slot1_id: SlotId,
        slot2_id: SlotId,
    ) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.grundimmunisierung_buchen(tx.as_mut(), dossier_id, slot1_id, slot2_id).await;
        self.beenden("grundimmunisierung_buchen", dossier_id, tx, result).await
    }

    async fn grundimmunisierung_buchen(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        slot1_id: SlotId,
        slot2_id: SlotId,
    ) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        if state.dossier.status != ImpfdossierStatus::Freigegeben {
            return Err(falscher_status(&state, "grundimmunisierung_buchen"));
        }
        if !state.dossier.krankheit.hat_grundimmunisierung() {
            return Err(BookingError::Validation(format!(
                "{} has no grundimmunisierung",
                state.dossier.krankheit
            )));
        }

        let slot1 = slot_laden(tx, slot1_id).await?;
        let slot2 = slot_laden(tx, slot2_id).await?;
        for slot in [&slot1, &slot2] {
            krankheit_pruefen(&state.dossier, slot)?;
        }
        self.abstand_pruefen(&slot1, &slot2)?;

        self.freien_termin_buchen(tx, &mut state.dossier, &slot1, Buchungsziel::ErsteImpfung).await?;
        self.freien_termin_buchen(tx, &mut state.dossier, &slot2, Buchungsziel::ZweiteImpfung).await?;
        odi_uebernehmen(tx, &mut state, slot1.odi_id).await?;

        let effects = self.reduzieren(&mut state, DossierAction::GrundimmunisierungGebucht)?;
        speichern(tx, state, effects, ()).await
    }

    /// Book a booster appointment on the next booster entry.
    ///
    /// Allowed from `Immunisiert`, `FreigegebenBooster` and `OdiGewaehltBooster`. Unless the
    /// booking is a self-payer (`selbstzahler`) one, an impfschutz whose freigabe date lies
    /// in the future blocks it. Self-payer bookings need the `Impfwilliger` or `Callcenter` role.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] if the dossier is not eligible for a booster
    /// - [`BookingError::Validation`] if the caller may not book as self-payer or the
    ///   slot is for another disease
    /// - [`BookingError::AppointmentTaken`] if the slot has no free booster appointment
    pub async fn book_booster(
        &self,
        dossier_id: DossierId,
        slot_id: SlotId,
        selbstzahler: bool,
        identity: &dyn IdentityProvider,
    ) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self
            .booster_buchen(tx.as_mut(), dossier_id, slot_id, selbstzahler, identity)
            .await;
        self.beenden("booster_buchen", dossier_id, tx, result).await
    }

    async fn booster_buchen(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        slot_id: SlotId,
        selbstzahler: bool,
        identity: &dyn IdentityProvider,
    ) -> Result<Ergebnis> {
        if selbstzahler && !(identity.has_role(Rolle::Impfwilliger) || identity.has_role(Rolle::Callcenter)) {
            return Err(BookingError::Validation(
                "self-payer bookings require the Impfwilliger or Callcenter role".to_string(),
            ));
        }

        let mut state = laden(tx, dossier_id).await?;
        let now = self.env.clock.now();
        let zugelassen = match state.dossier.status {
            ImpfdossierStatus::Immunisiert
            | ImpfdossierStatus::FreigegebenBooster
            | ImpfdossierStatus::OdiGewaehltBooster => {
                selbstzahler || !freigabe_ausstehend(state.dossier.impfschutz.as_ref(), now)
            },
            _ => false,
        };
        if !zugelassen {
            return Err(falscher_status(&state, "booster_buchen"));
        }

        let slot = slot_laden(tx, slot_id).await?;
        krankheit_pruefen(&state.dossier, &slot)?;

        let ziel = Buchungsziel::Booster {
            impffolge_nr: state.dossier.aktuelle_booster_nr(),
        };
        let termin = self.freien_termin_buchen(tx, &mut state.dossier, &slot, ziel).await?;
        state.dossier.buchung.selbstzahler = selbstzahler;
        odi_uebernehmen(tx, &mut state, slot.odi_id).await?;

        let effects = self.reduzieren(&mut state, DossierAction::BoosterGebucht { termin })?;
        speichern(tx, state, effects, ()).await
    }

    /// Soft-hold an appointment of the slot for the dossier's registration.
    ///
    /// A later booking of the same slot prefers the held appointment.
    ///
    /// # Errors
    ///
    /// - [`BookingError::AppointmentTaken`] if the slot has no free appointment
    pub async fn reserve_termin(
        &self,
        dossier_id: DossierId,
        slot_id: SlotId,
        impffolge: Impffolge,
    ) -> Result<Impftermin> {
        let mut tx = self.store.begin().await?;
        let result = self.termin_reservieren(tx.as_mut(), dossier_id, slot_id, impffolge).await;
        match result {
            Ok(termin) => {
                tx.commit().await.map_err(|e| self.melden("termin_reservieren", dossier_id, e.into()))?;
                Ok(termin)
            },
            Err(error) => {
                crate::rollback(tx.as_mut()).await;
                Err(self.melden("termin_reservieren", dossier_id, error))
            },
        }
    }

    async fn termin_reservieren(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        slot_id: SlotId,
        impffolge: Impffolge,
    ) -> Result<Impftermin> {
        let dossier = tx
            .find_dossier(dossier_id)
            .await?
            .ok_or_else(|| BookingError::not_found(Entity::Dossier, dossier_id))?;
        let mut termin = self
            .allocator
            .find_my_reserved_or_free_appointment(tx, &dossier.registrierungsnummer, slot_id, impffolge)
            .await?
            .ok_or(BookingError::AppointmentTaken {
                slot_id: Some(slot_id),
                impffolge: Some(impffolge),
            })?;
        self.allocator
            .reserve(tx, &dossier.registrierungsnummer, &mut termin)
            .await?;
        Ok(termin)
    }

    // ========================================================================
    // Rebooking and cancellation
    // ========================================================================

    /// Move the first and/or second dose to other slots.
    ///
    /// Only doses whose slot actually changes are released and rebooked.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] if the dossier holds no grundimmunisierung
    ///   booking that may move
    /// - [`BookingError::Validation`] if the first dose is already administered and its
    ///   slot would change, or the first appointment would not precede the second
    /// - [`BookingError::AppointmentTaken`] if a new slot has no free appointment
    pub async fn umbuchen_grundimmunisierung(
        &self,
        dossier_id: DossierId,
        slot1_id: SlotId,
        slot2_id: SlotId,
    ) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self
            .grundimmunisierung_umbuchen(tx.as_mut(), dossier_id, slot1_id, slot2_id)
            .await;
        self.beenden("grundimmunisierung_umbuchen", dossier_id, tx, result).await
    }

    async fn grundimmunisierung_umbuchen(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        slot1_id: SlotId,
        slot2_id: SlotId,
    ) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        vorab_pruefen(&state, Ereignis::GrundimmunisierungUmgebucht, "grundimmunisierung_umbuchen")?;

        let slot1 = slot_laden(tx, slot1_id).await?;
        let slot2 = slot_laden(tx, slot2_id).await?;
        for slot in [&slot1, &slot2] {
            krankheit_pruefen(&state.dossier, slot)?;
        }
        if slot1.zeitfenster.von >= slot2.zeitfenster.von {
            return Err(BookingError::Validation(format!(
                "first appointment ({}) must precede the second ({})",
                slot1.zeitfenster, slot2.zeitfenster
            )));
        }

        let bisher1 = gebuchter_slot(tx, state.dossier.buchung.impftermin1).await?;
        if bisher1 != Some(slot1.id) {
            if let Some(termin1) = state.dossier.buchung.impftermin1 {
                if tx.find_impfung_by_termin(termin1).await?.is_some() {
                    return Err(BookingError::Validation(
                        "the first dose is already administered; its appointment cannot move".to_string(),
                    ));
                }
            }
            self.allocator
                .free(tx, &mut state.dossier, Buchungsziel::ErsteImpfung)
                .await?;
            self.freien_termin_buchen(tx, &mut state.dossier, &slot1, Buchungsziel::ErsteImpfung)
                .await?;
        }

        let bisher2 = gebuchter_slot(tx, state.dossier.buchung.impftermin2).await?;
        if bisher2 != Some(slot2.id) {
            self.allocator
                .free(tx, &mut state.dossier, Buchungsziel::ZweiteImpfung)
                .await?;
            self.freien_termin_buchen(tx, &mut state.dossier, &slot2, Buchungsziel::ZweiteImpfung)
                .await?;
        }

        let effects = self.reduzieren(&mut state, DossierAction::GrundimmunisierungUmgebucht)?;
        speichern(tx, state, effects, ()).await
    }

    /// Move the booked booster appointment to another slot.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] unless a booster is booked
    /// - [`BookingError::AppointmentTaken`] if the new slot has no free booster appointment
    pub async fn umbuchen_booster(&self, dossier_id: DossierId, slot_id: SlotId) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.booster_umbuchen(tx.as_mut(), dossier_id, slot_id).await;
        self.beenden("booster_umbuchen", dossier_id, tx, result).await
    }

    async fn booster_umbuchen(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        slot_id: SlotId,
    ) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        vorab_pruefen(&state, Ereignis::BoosterUmgebucht, "booster_umbuchen")?;
        let Some((nr, bisher)) = gebuchter_booster(&state.dossier) else {
            return Err(falscher_status(&state, "booster_umbuchen"));
        };

        let slot = slot_laden(tx, slot_id).await?;
        krankheit_pruefen(&state.dossier, &slot)?;
        let ziel = Buchungsziel::Booster { impffolge_nr: nr };

        let termin = if gebuchter_slot(tx, Some(bisher)).await? == Some(slot.id) {
            tx.find_termin(bisher)
                .await?
                .ok_or_else(|| BookingError::not_found(Entity::Termin, bisher))?
        } else {
            self.allocator.free(tx, &mut state.dossier, ziel).await?;
            let termin = self.freien_termin_buchen(tx, &mut state.dossier, &slot, ziel).await?;
            odi_uebernehmen(tx, &mut state, slot.odi_id).await?;
            termin
        };

        let effects = self.reduzieren(&mut state, DossierAction::BoosterUmgebucht { termin })?;
        speichern(tx, state, effects, ()).await
    }

    /// Cancel the grundimmunisierung appointments.
    ///
    /// Before the first dose both appointments are released; afterwards only the second.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] if nothing can be cancelled
    /// - [`BookingError::IllegalState`] if a released appointment has a vaccination
    pub async fn cancel_termine(&self, dossier_id: DossierId) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.termine_absagen(tx.as_mut(), dossier_id).await;
        self.beenden("termine_absagen", dossier_id, tx, result).await
    }

    async fn termine_absagen(&self, tx: &mut dyn Transaction, dossier_id: DossierId) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        vorab_pruefen(&state, Ereignis::TermineAbgesagt, "termine_absagen")?;

        let ziele: &[Buchungsziel] = match state.dossier.status {
            ImpfdossierStatus::Gebucht | ImpfdossierStatus::Impfung1Kontrolliert => {
                &[Buchungsziel::ErsteImpfung, Buchungsziel::ZweiteImpfung]
            },
            _ => &[Buchungsziel::ZweiteImpfung],
        };

        let mut abgesagt = AbgesagteTermine::default();
        let mut erster: Option<(Impftermin, String)> = None;
        for ziel in ziele {
            let Some(termin) = self.allocator.free(tx, &mut state.dossier, *ziel).await? else {
                continue;
            };
            let slot = slot_laden(tx, termin.slot_id).await?;
            let zeit = slot.zeitfenster.anzeige_text();
            abgesagt.odi_id = Some(slot.odi_id);
            match ziel {
                Buchungsziel::ErsteImpfung => abgesagt.termin1 = Some(zeit.clone()),
                _ => abgesagt.termin2 = Some(zeit.clone()),
            }
            if erster.is_none() {
                erster = Some((termin, zeit));
            }
        }

        let (termin, original_zeit) = match erster {
            Some((termin, zeit)) => (Some(termin), zeit),
            None => (None, String::new()),
        };
        let effects = self.reduzieren(
            &mut state,
            DossierAction::TermineAbgesagt {
                abgesagt,
                termin,
                original_zeit,
            },
        )?;
        speichern(tx, state, effects, ()).await
    }

    /// Cancel the booked booster appointment.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] unless a booster is booked
    /// - [`BookingError::IllegalState`] if the appointment has a vaccination
    pub async fn cancel_booster(&self, dossier_id: DossierId) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.booster_absagen(tx.as_mut(), dossier_id).await;
        self.beenden("booster_termin_absagen", dossier_id, tx, result).await
    }

    async fn booster_absagen(&self, tx: &mut dyn Transaction, dossier_id: DossierId) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        vorab_pruefen(&state, Ereignis::BoosterTerminAbgesagt, "booster_termin_absagen")?;
        let Some((nr, _)) = gebuchter_booster(&state.dossier) else {
            return Err(falscher_status(&state, "booster_termin_absagen"));
        };

        let termin = self
            .allocator
            .free(tx, &mut state.dossier, Buchungsziel::Booster { impffolge_nr: nr })
            .await?
            .ok_or_else(|| BookingError::IllegalState(format!("booster entry {nr} lost its appointment")))?;
        let slot = slot_laden(tx, termin.slot_id).await?;
        let original_zeit = slot.zeitfenster.anzeige_text();
        let abgesagt = AbgesagteTermine {
            odi_id: Some(slot.odi_id),
            termin_booster: Some(original_zeit.clone()),
            ..AbgesagteTermine::default()
        };

        let effects = self.reduzieren(
            &mut state,
            DossierAction::BoosterTerminAbgesagt {
                abgesagt,
                termin,
                original_zeit,
            },
        )?;
        speichern(tx, state, effects, ()).await
    }

    // ========================================================================
    // Eligibility and site selection
    // ========================================================================

    /// Choose a vaccination site.
    ///
    /// # Errors
    ///
    /// - [`BookingError::EntityNotFound`] if the site does not exist
    /// - [`BookingError::WrongDossierStatus`] if the dossier is past booking
    pub async fn select_odi(&self, dossier_id: DossierId, odi_id: OdiId) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.odi_waehlen(tx.as_mut(), dossier_id, odi_id).await;
        self.beenden("odi_waehlen", dossier_id, tx, result).await
    }

    async fn odi_waehlen(&self, tx: &mut dyn Transaction, dossier_id: DossierId, odi_id: OdiId) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        let odi = tx
            .find_odi(odi_id)
            .await?
            .ok_or_else(|| BookingError::not_found(Entity::Odi, odi_id))?;
        let effects = self.reduzieren(&mut state, DossierAction::OdiGewaehlt { odi })?;
        speichern(tx, state, effects, ()).await
    }

    /// Re-evaluate the dossier's priority unlock.
    ///
    /// # Errors
    ///
    /// - [`BookingError::EntityNotFound`] if the dossier does not exist
    pub async fn freigabe_aktualisieren(&self, dossier_id: DossierId) -> Result<Impfdossier> {
        self.einfache_aktion(dossier_id, DossierAction::PrioritaetFreigegeben).await
    }

    /// Store a new eligibility snapshot.
    ///
    /// # Errors
    ///
    /// - [`BookingError::EntityNotFound`] if the dossier does not exist
    pub async fn update_impfschutz(
        &self,
        dossier_id: DossierId,
        impfschutz: Option<Impfschutz>,
    ) -> Result<Impfdossier> {
        self.einfache_aktion(dossier_id, DossierAction::ImpfschutzAktualisiert { impfschutz })
            .await
    }

    // ========================================================================
    // Controls and vaccinations
    // ========================================================================

    /// Record the pre-vaccination control for a dose.
    ///
    /// A walk-in without a booked appointment gets one created on demand at `odi_id`.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] if the dose cannot be controlled now
    /// - [`BookingError::EntityNotFound`] if the site does not exist
    pub async fn record_kontrolle(
        &self,
        dossier_id: DossierId,
        impffolge: Impffolge,
        odi_id: OdiId,
    ) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.kontrolle_erfassen(tx.as_mut(), dossier_id, impffolge, odi_id).await;
        self.beenden("kontrolle_erfassen", dossier_id, tx, result).await
    }

    async fn kontrolle_erfassen(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        impffolge: Impffolge,
        odi_id: OdiId,
    ) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        vorab_pruefen(&state, Ereignis::Kontrolliert(impffolge), "kontrolle_erfassen")?;
        if tx.find_odi(odi_id).await?.is_none() {
            return Err(BookingError::not_found(Entity::Odi, odi_id));
        }

        let ziel = match impffolge {
            Impffolge::ErsteImpfung => Buchungsziel::ErsteImpfung,
            Impffolge::ZweiteImpfung => Buchungsziel::ZweiteImpfung,
            Impffolge::BoosterImpfung => Buchungsziel::Booster {
                impffolge_nr: booster_nr_fuer_kontrolle(&state.dossier),
            },
        };
        if ziel.termin_von(&state.dossier).is_none() {
            self.ad_hoc_buchen(tx, &mut state.dossier, ziel, odi_id).await?;
        }

        let impffolge_nr = match ziel {
            Buchungsziel::Booster { impffolge_nr } => Some(impffolge_nr),
            _ => None,
        };
        let kontrolle = Kontrolle {
            timestamp: self.env.clock.now(),
            odi_id,
        };
        let effects = self.reduzieren(
            &mut state,
            DossierAction::Kontrolliert {
                impffolge,
                impffolge_nr,
                kontrolle,
            },
        )?;
        speichern(tx, state, effects, ()).await
    }

    /// Record an administered dose.
    ///
    /// Without a booked appointment one is created on demand at `odi_id`.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] unless the dose was controlled
    /// - [`BookingError::EntityNotFound`] if the site does not exist
    pub async fn record_impfung(
        &self,
        dossier_id: DossierId,
        impffolge: Impffolge,
        odi_id: OdiId,
    ) -> Result<(Impfdossier, Impfung)> {
        let mut tx = self.store.begin().await?;
        let result = self.impfung_erfassen(tx.as_mut(), dossier_id, impffolge, odi_id).await;
        self.beenden_mit("impfung_erfassen", dossier_id, tx, result).await
    }

    async fn impfung_erfassen(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        impffolge: Impffolge,
        odi_id: OdiId,
    ) -> Result<Ergebnis<Impfung>> {
        let mut state = laden(tx, dossier_id).await?;
        vorab_pruefen(&state, Ereignis::Geimpft(impffolge), "impfung_erfassen")?;
        if tx.find_odi(odi_id).await?.is_none() {
            return Err(BookingError::not_found(Entity::Odi, odi_id));
        }

        let ziel = match impffolge {
            Impffolge::ErsteImpfung => Buchungsziel::ErsteImpfung,
            Impffolge::ZweiteImpfung => Buchungsziel::ZweiteImpfung,
            Impffolge::BoosterImpfung => Buchungsziel::Booster {
                impffolge_nr: state
                    .dossier
                    .letzter_eintrag()
                    .map_or(1, |eintrag| eintrag.impffolge_nr),
            },
        };
        let termin_id = match ziel.termin_von(&state.dossier) {
            Some(termin_id) => termin_id,
            None => self.ad_hoc_buchen(tx, &mut state.dossier, ziel, odi_id).await?,
        };
        if tx.find_impfung_by_termin(termin_id).await?.is_some() {
            return Err(BookingError::IllegalState(format!(
                "appointment {termin_id} already has a vaccination"
            )));
        }

        let impfung = Impfung::new(dossier_id, termin_id, impffolge, odi_id, self.env.clock.now());
        tx.insert_impfung(&impfung).await?;
        tracing::info!(
            dossier_id = %dossier_id,
            impfung_id = %impfung.id,
            impffolge = %impffolge,
            "Vaccination recorded"
        );

        let effects = self.reduzieren(&mut state, DossierAction::Geimpft { impffolge, termin_id })?;
        speichern(tx, state, effects, impfung).await
    }

    /// Delete a vaccination; only the most recent one of the dossier may be deleted.
    ///
    /// # Errors
    ///
    /// - [`BookingError::EntityNotFound`] if the vaccination does not belong to the dossier
    /// - [`BookingError::Validation`] if a later vaccination exists
    /// - [`BookingError::WrongDossierStatus`] if the status does not allow the deletion
    pub async fn delete_impfung(&self, dossier_id: DossierId, impfung_id: ImpfungId) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.impfung_loeschen(tx.as_mut(), dossier_id, impfung_id).await;
        self.beenden("impfung_loeschen", dossier_id, tx, result).await
    }

    async fn impfung_loeschen(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        impfung_id: ImpfungId,
    ) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        let impfungen = tx.list_impfungen(dossier_id).await?;
        let impfung = impfungen
            .iter()
            .find(|impfung| impfung.id == impfung_id)
            .cloned()
            .ok_or_else(|| BookingError::not_found(Entity::Impfung, impfung_id))?;
        if impfungen.last().is_some_and(|letzte| letzte.id != impfung_id) {
            return Err(BookingError::Validation(
                "only the most recent vaccination can be deleted".to_string(),
            ));
        }
        vorab_pruefen(&state, Ereignis::ImpfungGeloescht(impfung.impffolge), "impfung_loeschen")?;

        tx.delete_impfung(&impfung).await?;
        let effects = self.reduzieren(
            &mut state,
            DossierAction::ImpfungGeloescht {
                impffolge: impfung.impffolge,
                termin_id: impfung.termin_id,
            },
        )?;
        speichern(tx, state, effects, ()).await
    }

    /// Complete the grundimmunisierung after the second dose.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] unless the second dose was administered
    pub async fn abschliessen(&self, dossier_id: DossierId) -> Result<Impfdossier> {
        self.einfache_aktion(dossier_id, DossierAction::Abschliessen).await
    }

    /// Enter the booster cycle after a completed grundimmunisierung.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] unless the grundimmunisierung is complete
    pub async fn immunisieren(&self, dossier_id: DossierId) -> Result<Impfdossier> {
        self.einfache_aktion(dossier_id, DossierAction::Immunisieren).await
    }

    /// Waive the second dose; a booked second appointment is released.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] unless the first dose was administered
    pub async fn zweite_impfung_verzichten(&self, dossier_id: DossierId) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.zweite_verzichten(tx.as_mut(), dossier_id).await;
        self.beenden("zweite_impfung_verzichten", dossier_id, tx, result).await
    }

    async fn zweite_verzichten(&self, tx: &mut dyn Transaction, dossier_id: DossierId) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        vorab_pruefen(&state, Ereignis::ZweiteImpfungVerzichtet, "zweite_impfung_verzichten")?;
        self.allocator
            .free(tx, &mut state.dossier, Buchungsziel::ZweiteImpfung)
            .await?;
        let effects = self.reduzieren(&mut state, DossierAction::ZweiteImpfungVerzichtet)?;
        speichern(tx, state, effects, ()).await
    }

    /// Take the waived second dose after all.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] unless the second dose was waived and no
    ///   booster exists
    pub async fn zweite_impfung_wahrnehmen(&self, dossier_id: DossierId) -> Result<Impfdossier> {
        self.einfache_aktion(dossier_id, DossierAction::ZweiteImpfungWahrgenommen)
            .await
    }

    // ========================================================================
    // External certificates
    // ========================================================================

    /// Record externally documented vaccinations.
    ///
    /// A certificate with a complete grundimmunisierung releases any booked first and
    /// second dose appointments and moves the dossier into the booster cycle.
    ///
    /// # Errors
    ///
    /// - [`BookingError::WrongDossierStatus`] if the dossier is already past its first dose
    pub async fn erfasse_externes_zertifikat(
        &self,
        dossier_id: DossierId,
        zertifikat: ExternesZertifikat,
    ) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.zertifikat_erfassen(tx.as_mut(), dossier_id, zertifikat).await;
        self.beenden("externes_zertifikat_erfassen", dossier_id, tx, result).await
    }

    async fn zertifikat_erfassen(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        zertifikat: ExternesZertifikat,
    ) -> Result<Ergebnis> {
        let mut state = laden(tx, dossier_id).await?;
        let action = DossierAction::ExternesZertifikatErfasst { zertifikat };
        vorab_pruefen(&state, action.ereignis(), action.name())?;

        if action.ereignis() == Ereignis::ExternGrundimmunisiert && !state.dossier.status.is_booster_status() {
            for ziel in [Buchungsziel::ErsteImpfung, Buchungsziel::ZweiteImpfung] {
                self.allocator.free(tx, &mut state.dossier, ziel).await?;
            }
        }

        let effects = self.reduzieren(&mut state, action)?;
        speichern(tx, state, effects, ()).await
    }

    /// Renumber the first booster entry; all other booster entries are removed.
    ///
    /// Appointments of removed entries are released unless a vaccination documents them.
    ///
    /// # Errors
    ///
    /// - [`BookingError::Validation`] if `neue_nr` is zero or no booster entry exists
    /// - [`BookingError::WrongDossierStatus`] while a booster is booked or controlled
    pub async fn korrigiere_erste_booster_nummer(&self, dossier_id: DossierId, neue_nr: u32) -> Result<Impfdossier> {
        let mut tx = self.store.begin().await?;
        let result = self.booster_nummer_korrigieren(tx.as_mut(), dossier_id, neue_nr).await;
        self.beenden("booster_nummer_korrigieren", dossier_id, tx, result).await
    }

    async fn booster_nummer_korrigieren(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
        neue_nr: u32,
    ) -> Result<Ergebnis> {
        if neue_nr == 0 {
            return Err(BookingError::Validation("booster numbers start at 1".to_string()));
        }
        let mut state = laden(tx, dossier_id).await?;
        if !matches!(
            state.dossier.status,
            ImpfdossierStatus::Immunisiert
                | ImpfdossierStatus::FreigegebenBooster
                | ImpfdossierStatus::OdiGewaehltBooster
        ) {
            return Err(falscher_status(&state, "booster_nummer_korrigieren"));
        }
        let Some(erste_nr) = state.dossier.eintraege.first().map(|e| e.impffolge_nr) else {
            return Err(BookingError::Validation(format!("dossier {dossier_id} has no booster entry")));
        };

        let geschwister: Vec<(u32, Option<TerminId>)> = state
            .dossier
            .eintraege
            .iter()
            .filter(|e| e.impffolge_nr != erste_nr)
            .map(|e| (e.impffolge_nr, e.impftermin))
            .collect();
        for (nr, termin) in geschwister {
            if let Some(termin_id) = termin {
                if tx.find_impfung_by_termin(termin_id).await?.is_none() {
                    self.allocator
                        .free(tx, &mut state.dossier, Buchungsziel::Booster { impffolge_nr: nr })
                        .await?;
                }
            }
        }

        state.dossier.eintraege.retain(|e| e.impffolge_nr == erste_nr);
        if let Some(erster) = state.dossier.eintraege.first_mut() {
            erster.impffolge_nr = neue_nr;
        }
        state.dossier.timestamp_sent_to_registry = None;
        tracing::info!(dossier_id = %dossier_id, von = erste_nr, nach = neue_nr, "First booster renumbered");

        speichern(tx, state, SmallVec::new(), ()).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn einfache_aktion(&self, dossier_id: DossierId, action: DossierAction) -> Result<Impfdossier> {
        let operation = action.name();
        let mut tx = self.store.begin().await?;
        let result = async {
            let mut state = laden(tx.as_mut(), dossier_id).await?;
            let effects = self.reduzieren(&mut state, action)?;
            speichern(tx.as_mut(), state, effects, ()).await
        }
        .await;
        self.beenden(operation, dossier_id, tx, result).await
    }

    fn reduzieren(&self, state: &mut DossierState, action: DossierAction) -> Result<SmallVec<[Effect; 4]>> {
        self.reducer.reduce(state, action, &self.dossier_env)
    }

    fn abstand_pruefen(&self, slot1: &Impfslot, slot2: &Impfslot) -> Result<()> {
        let tage = (slot2.zeitfenster.von.date_naive() - slot1.zeitfenster.von.date_naive()).num_days();
        let config = &self.env.config;
        if slot1.zeitfenster.von >= slot2.zeitfenster.von {
            return Err(BookingError::Validation(format!(
                "first appointment ({}) must precede the second ({})",
                slot1.zeitfenster, slot2.zeitfenster
            )));
        }
        if tage < config.min_abstand_tage || tage > config.max_abstand_tage {
            return Err(BookingError::Validation(format!(
                "{tage} days between doses, allowed are {} to {}",
                config.min_abstand_tage, config.max_abstand_tage
            )));
        }
        Ok(())
    }

    /// Book a free (or own reserved) appointment of `slot` at `ziel`.
    async fn freien_termin_buchen(
        &self,
        tx: &mut dyn Transaction,
        dossier: &mut Impfdossier,
        slot: &Impfslot,
        ziel: Buchungsziel,
    ) -> Result<Impftermin> {
        let impffolge = ziel.impffolge();
        let mut termin = self
            .allocator
            .find_my_reserved_or_free_appointment(tx, &dossier.registrierungsnummer, slot.id, impffolge)
            .await?
            .ok_or(BookingError::AppointmentTaken {
                slot_id: Some(slot.id),
                impffolge: Some(impffolge),
            })?;
        self.allocator.book(tx, dossier, &mut termin, ziel).await?;
        Ok(termin)
    }

    /// Create and book a walk-in appointment at `odi_id` for now.
    async fn ad_hoc_buchen(
        &self,
        tx: &mut dyn Transaction,
        dossier: &mut Impfdossier,
        ziel: Buchungsziel,
        odi_id: OdiId,
    ) -> Result<TerminId> {
        let mut termin = self
            .allocator
            .create_on_demand_appointment(tx, dossier.krankheit, ziel.impffolge(), odi_id, self.env.clock.now())
            .await?;
        self.allocator.book(tx, dossier, &mut termin, ziel).await?;
        Ok(termin.id)
    }

    async fn beenden(
        &self,
        operation: &'static str,
        dossier_id: DossierId,
        tx: Box<dyn Transaction>,
        result: Result<Ergebnis>,
    ) -> Result<Impfdossier> {
        self.beenden_mit(operation, dossier_id, tx, result)
            .await
            .map(|(dossier, ())| dossier)
    }

    /// Commit or roll back, then dispatch the effects of a committed use case.
    async fn beenden_mit<T>(
        &self,
        operation: &'static str,
        dossier_id: DossierId,
        mut tx: Box<dyn Transaction>,
        result: Result<Ergebnis<T>>,
    ) -> Result<(Impfdossier, T)> {
        let ergebnis = match result {
            Ok(ergebnis) => ergebnis,
            Err(error) => {
                crate::rollback(tx.as_mut()).await;
                return Err(self.melden(operation, dossier_id, error));
            },
        };
        tx.commit()
            .await
            .map_err(|error| self.melden(operation, dossier_id, error.into()))?;

        tracing::info!(
            dossier_id = %dossier_id,
            status = %ergebnis.dossier.status,
            operation,
            "Use case committed"
        );
        self.env
            .notifier
            .dispatch(&ergebnis.dossier, &ergebnis.effects)
            .await;
        Ok((ergebnis.dossier, ergebnis.wert))
    }

    fn melden(&self, operation: &'static str, dossier_id: DossierId, error: BookingError) -> BookingError {
        match &error {
            BookingError::AppointmentTaken { .. } => {
                metrics::counter!(APPOINTMENT_TAKEN, "operation" => operation).increment(1);
                tracing::warn!(dossier_id = %dossier_id, operation, error = %error, "Appointment taken");
            },
            BookingError::IllegalState(_) | BookingError::Store(_) => {
                tracing::error!(dossier_id = %dossier_id, operation, error = %error, "Use case failed");
            },
            _ => {
                tracing::debug!(dossier_id = %dossier_id, operation, error = %error, "Use case rejected");
            },
        }
        error
    }
}

// ============================================================================
// Free helpers
// ============================================================================

async fn laden(tx: &mut dyn Transaction, dossier_id: DossierId) -> Result<DossierState> {
    let dossier = tx
        .find_dossier(dossier_id)
        .await?
        .ok_or_else(|| BookingError::not_found(Entity::Dossier, dossier_id))?;
    let odi = match dossier.buchung.gewuenschter_odi {
        Some(odi_id) => tx.find_odi(odi_id).await?,
        None => None,
    };
    let impfungen = tx.list_impfungen(dossier_id).await?;
    Ok(DossierState::new(dossier, odi).with_geimpfte_termine(impfungen.iter().map(|impfung| impfung.termin_id)))
}

async fn speichern<T>(
    tx: &mut dyn Transaction,
    mut state: DossierState,
    effects: SmallVec<[Effect; 4]>,
    wert: T,
) -> Result<Ergebnis<T>> {
    state.dossier.version = tx.update_dossier(&state.dossier).await?;
    Ok(Ergebnis {
        dossier: state.dossier,
        effects,
        wert,
    })
}

async fn slot_laden(tx: &mut dyn Transaction, slot_id: SlotId) -> Result<Impfslot> {
    tx.find_slot(slot_id)
        .await?
        .ok_or_else(|| BookingError::not_found(Entity::Slot, slot_id))
}

/// Record the booked slot's site as the dossier's desired site.
async fn odi_uebernehmen(tx: &mut dyn Transaction, state: &mut DossierState, odi_id: OdiId) -> Result<()> {
    state.dossier.buchung.gewuenschter_odi = Some(odi_id);
    state.gewuenschter_odi = tx.find_odi(odi_id).await?;
    Ok(())
}

async fn gebuchter_slot(tx: &mut dyn Transaction, termin_id: Option<TerminId>) -> Result<Option<SlotId>> {
    let Some(termin_id) = termin_id else {
        return Ok(None);
    };
    Ok(tx.find_termin(termin_id).await?.map(|termin| termin.slot_id))
}

fn krankheit_pruefen(dossier: &Impfdossier, slot: &Impfslot) -> Result<()> {
    if slot.krankheit == dossier.krankheit {
        Ok(())
    } else {
        Err(BookingError::Validation(format!(
            "slot {} is for {}, dossier {} for {}",
            slot.id, slot.krankheit, dossier.id, dossier.krankheit
        )))
    }
}

/// Latest booster entry holding an appointment
fn gebuchter_booster(dossier: &Impfdossier) -> Option<(u32, TerminId)> {
    let eintrag = dossier.letzter_eintrag()?;
    eintrag.impftermin.map(|termin| (eintrag.impffolge_nr, termin))
}

/// Booster entry a control refers to: the booked or controlled one, else the next.
fn booster_nr_fuer_kontrolle(dossier: &Impfdossier) -> u32 {
    match (dossier.status, dossier.letzter_eintrag()) {
        (ImpfdossierStatus::GebuchtBooster | ImpfdossierStatus::KontrolliertBooster, Some(eintrag)) => {
            eintrag.impffolge_nr
        },
        _ => dossier.aktuelle_booster_nr(),
    }
}

fn falscher_status(state: &DossierState, operation: &'static str) -> BookingError {
    BookingError::WrongDossierStatus {
        dossier_id: state.dossier.id,
        status: state.dossier.status,
        operation,
    }
}

/// Reject early when the event is not allowed in the current status.
///
/// Only used for events whose acceptance does not depend on the guards.
/// The eligibility engine has set a freigabe date that is not reached yet
fn freigabe_ausstehend(impfschutz: Option<&Impfschutz>, now: DateTime<Utc>) -> bool {
    impfschutz.is_some_and(|schutz| {
        schutz.freigegeben_naechste_impfung_ab.is_some() && !schutz.is_freigegeben(now, false)
    })
}

fn vorab_pruefen(state: &DossierState, ereignis: Ereignis, operation: &'static str) -> Result<()> {
    match naechster_status(state.dossier.status, ereignis, &StatusGuards::default()) {
        Some(_) => Ok(()),
        None => Err(falscher_status(state, operation)),
    }
}

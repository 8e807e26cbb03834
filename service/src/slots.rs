//! Slot generation and availability queries.

use crate::config::BookingConfig;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use terminbuchung_core::environment::Clock;
use terminbuchung_core::error::{BookingError, Entity, Result};
use terminbuchung_core::store::{SlotFilter, Store};
use terminbuchung_core::types::{
    Impffolge, Impfslot, Impftermin, Kapazitaet, Krankheit, OdiId, Zeitfenster, reservation_cutoff,
};

/// A slot together with its number of free appointments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreierSlot {
    /// The slot
    pub slot: Impfslot,
    /// Free appointments of the requested dose type
    pub frei: u32,
}

/// Creates slots for a site and lists bookable ones
#[derive(Clone)]
pub struct SlotService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: BookingConfig,
}

impl SlotService {
    /// Creates a new `SlotService`
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: BookingConfig) -> Self {
        Self { store, clock, config }
    }

    /// Create grid slots covering `oeffnung_von..oeffnung_bis` on `tag`.
    ///
    /// Windows that already have a slot are skipped. Every new slot gets one appointment
    /// per unit of `kapazitaet`.
    ///
    /// # Errors
    ///
    /// - [`BookingError::EntityNotFound`] if the site does not exist
    /// - [`BookingError::Validation`] if the opening hours are empty
    pub async fn generate_slots(
        &self,
        odi_id: OdiId,
        krankheit: Krankheit,
        tag: NaiveDate,
        oeffnung_von: NaiveTime,
        oeffnung_bis: NaiveTime,
        kapazitaet: Kapazitaet,
    ) -> Result<Vec<Impfslot>> {
        if oeffnung_von >= oeffnung_bis {
            return Err(BookingError::Validation(format!(
                "opening hours {oeffnung_von} - {oeffnung_bis} are empty"
            )));
        }
        let von = tag.and_time(oeffnung_von).and_utc();
        let bis = tag.and_time(oeffnung_bis).and_utc();
        let dauer = self.config.slot_duration();

        let mut tx = self.store.begin().await?;
        if tx.find_odi(odi_id).await?.is_none() {
            crate::rollback(tx.as_mut()).await;
            return Err(BookingError::not_found(Entity::Odi, odi_id));
        }

        let mut erzeugt = Vec::new();
        let mut fenster = Zeitfenster::ausgerichtet(von, dauer);
        while fenster.von < bis {
            if tx.find_slot_covering(odi_id, krankheit, fenster.von).await?.is_none() {
                let slot = Impfslot::new(krankheit, odi_id, fenster, kapazitaet);
                tx.insert_slot(&slot).await?;
                for impffolge in Impffolge::ALL {
                    for _ in 0..kapazitaet.get(impffolge) {
                        tx.insert_termin(&Impftermin::new(slot.id, impffolge)).await?;
                    }
                }
                erzeugt.push(slot);
            }
            fenster = Zeitfenster::new(fenster.bis, fenster.bis + dauer);
        }
        tx.commit().await?;

        tracing::info!(
            odi_id = %odi_id,
            krankheit = %krankheit,
            tag = %tag,
            slots = erzeugt.len(),
            "Slots generated"
        );
        Ok(erzeugt)
    }

    /// Slots of a site with at least one free appointment of `impffolge`, by start time.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Store`] on storage failure.
    pub async fn find_available_slots(
        &self,
        odi_id: OdiId,
        krankheit: Krankheit,
        impffolge: Impffolge,
        von: DateTime<Utc>,
        bis: DateTime<Utc>,
    ) -> Result<Vec<FreierSlot>> {
        let cutoff = reservation_cutoff(self.clock.now(), self.config.reservation_ttl());
        let filter = SlotFilter {
            odi_id,
            krankheit,
            von,
            bis,
        };

        let mut tx = self.store.begin().await?;
        let slots = tx.find_slots(&filter).await?;
        let mut verfuegbar = Vec::new();
        for slot in slots {
            let frei = tx.count_free_termine(slot.id, impffolge, cutoff).await?;
            if frei > 0 {
                verfuegbar.push(FreierSlot { slot, frei });
            }
        }
        tx.commit().await?;
        Ok(verfuegbar)
    }
}

//! Slot capacity changes.
//!
//! A slot's capacity counters and its appointment rows are changed together in one
//! transaction. Shrinking only ever removes appointments that are neither booked nor
//! referenced by a dossier; if not enough such appointments exist the whole change is
//! rejected before anything is deleted.

use crate::metrics::KAPAZITAET_AENDERUNGEN;
use std::sync::Arc;
use terminbuchung_core::error::{BookingError, Entity, Result};
use terminbuchung_core::store::{Store, Transaction};
use terminbuchung_core::types::{Impffolge, Impfslot, Impftermin, Kapazitaet, SlotId};

/// Changes slot capacities and keeps appointment rows in step
#[derive(Clone)]
pub struct CapacityResizer {
    store: Arc<dyn Store>,
}

/// Planned row changes for one dose type
#[derive(Debug, Default)]
struct Plan {
    loeschen: Vec<Impftermin>,
    anlegen: u32,
}

impl CapacityResizer {
    /// Creates a new `CapacityResizer`
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Set the capacity of one slot in its own transaction.
    ///
    /// # Errors
    ///
    /// - [`BookingError::EntityNotFound`] if the slot does not exist
    /// - [`BookingError::CapacityReductionBlocked`] if a reduction would remove a booked
    ///   or referenced appointment
    /// - [`BookingError::Store`] on storage failure or a concurrent slot update
    pub async fn resize(&self, slot_id: SlotId, neu: Kapazitaet) -> Result<Impfslot> {
        let mut tx = self.store.begin().await?;
        let result = Self::resize_in(tx.as_mut(), slot_id, neu).await;
        match result {
            Ok(slot) => {
                tx.commit().await?;
                metrics::counter!(KAPAZITAET_AENDERUNGEN, "ergebnis" => "ok").increment(1);
                Ok(slot)
            },
            Err(error) => {
                crate::rollback(tx.as_mut()).await;
                if matches!(error, BookingError::CapacityReductionBlocked { .. }) {
                    metrics::counter!(KAPAZITAET_AENDERUNGEN, "ergebnis" => "blocked").increment(1);
                }
                Err(error)
            },
        }
    }

    /// Set the capacities of many slots, one transaction per slot.
    ///
    /// A failing slot does not affect the others; every slot's outcome is returned in
    /// input order.
    pub async fn resize_many(&self, aenderungen: Vec<(SlotId, Kapazitaet)>) -> Vec<(SlotId, Result<Impfslot>)> {
        let mut ergebnisse = Vec::with_capacity(aenderungen.len());
        for (slot_id, kapazitaet) in aenderungen {
            let result = self.resize(slot_id, kapazitaet).await;
            if let Err(error) = &result {
                tracing::warn!(slot_id = %slot_id, error = %error, "Capacity change rejected");
            }
            ergebnisse.push((slot_id, result));
        }
        ergebnisse
    }

    /// Set the capacity of one slot inside an open transaction.
    ///
    /// # Errors
    ///
    /// See [`CapacityResizer::resize`].
    pub async fn resize_in(tx: &mut dyn Transaction, slot_id: SlotId, neu: Kapazitaet) -> Result<Impfslot> {
        let mut slot = tx
            .find_slot(slot_id)
            .await?
            .ok_or_else(|| BookingError::not_found(Entity::Slot, slot_id))?;

        let mut plaene = Vec::with_capacity(Impffolge::ALL.len());
        for impffolge in Impffolge::ALL {
            let plan = Self::planen(tx, slot_id, impffolge, neu.get(impffolge)).await?;
            plaene.push((impffolge, plan));
        }

        for (impffolge, plan) in &plaene {
            for termin in &plan.loeschen {
                tx.delete_termin(termin).await?;
            }
            for _ in 0..plan.anlegen {
                tx.insert_termin(&Impftermin::new(slot_id, *impffolge)).await?;
            }
        }

        let alt = slot.kapazitaet;
        slot.kapazitaet = neu;
        slot.version = tx.update_slot(&slot).await?;

        tracing::info!(slot_id = %slot_id, alt = %alt, neu = %neu, "Slot capacity changed");
        Ok(slot)
    }

    /// Rows to delete or create so the dose type ends up with `soll` appointments.
    async fn planen(tx: &mut dyn Transaction, slot_id: SlotId, impffolge: Impffolge, soll: u32) -> Result<Plan> {
        let termine = tx.list_termine(slot_id, impffolge).await?;
        let ist = u32::try_from(termine.len()).unwrap_or(u32::MAX);

        if soll >= ist {
            return Ok(Plan {
                loeschen: Vec::new(),
                anlegen: soll - ist,
            });
        }

        let zu_loeschen = (ist - soll) as usize;
        let mut loeschen = Vec::with_capacity(zu_loeschen);
        for termin in termine.iter().filter(|t| !t.gebucht) {
            if loeschen.len() == zu_loeschen {
                break;
            }
            if !tx.is_termin_referenced(termin.id).await? {
                loeschen.push(termin.clone());
            }
        }

        if loeschen.len() < zu_loeschen {
            let removable = u32::try_from(loeschen.len()).unwrap_or(u32::MAX);
            tracing::warn!(
                slot_id = %slot_id,
                impffolge = %impffolge,
                requested = soll,
                removable,
                "Capacity reduction blocked by booked appointments"
            );
            return Err(BookingError::CapacityReductionBlocked {
                slot_id,
                impffolge,
                requested: soll,
                removable,
            });
        }

        Ok(Plan { loeschen, anlegen: 0 })
    }
}

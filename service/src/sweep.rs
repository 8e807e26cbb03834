//! Control-expiry sweep.
//!
//! A dossier sitting in a `*Kontrolliert` status longer than the control TTL is rolled
//! back to the status it had before the control. Each dossier is reset in its own
//! transaction so one failure does not undo the others. Vaccination records are never
//! touched.

use crate::config::{BookingConfig, SweepConfig};
use crate::metrics::{KONTROLLEN_ABGELAUFEN, SWEEP_FEHLER};
use std::sync::Arc;
use terminbuchung_core::error::{BookingError, Entity, Result};
use terminbuchung_core::reducer::Reducer;
use terminbuchung_core::status::{DossierAction, DossierEnvironment, DossierReducer, DossierState};
use terminbuchung_core::store::{Store, Transaction};
use terminbuchung_core::types::{DossierId, ImpfdossierStatus};

/// Outcome of one sweep run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Dossiers whose control was reset, with their new status
    pub zurueckgesetzt: Vec<(DossierId, ImpfdossierStatus)>,
    /// Dossiers that could not be reset
    pub fehlgeschlagen: Vec<DossierId>,
    /// Dossiers controlled again after they were listed
    pub uebersprungen: Vec<DossierId>,
}

/// Resets stale controls
#[derive(Clone)]
pub struct KontrolleSweep {
    store: Arc<dyn Store>,
    env: DossierEnvironment,
    booking: BookingConfig,
    config: SweepConfig,
}

impl KontrolleSweep {
    /// Creates a new `KontrolleSweep`
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        env: DossierEnvironment,
        booking: BookingConfig,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            env,
            booking,
            config,
        }
    }

    /// Reset every dossier whose control is older than the control TTL.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Store`] only if the candidates cannot be listed;
    /// failures of single dossiers are reported in the [`SweepReport`].
    pub async fn run(&self) -> Result<SweepReport> {
        let cutoff = self.env.clock.now() - self.booking.kontrolle_ttl();
        let kandidaten = {
            let mut tx = self.store.begin().await?;
            let kandidaten = tx
                .find_dossiers_kontrolliert_vor(cutoff, self.config.batch_limit)
                .await?;
            tx.commit().await?;
            kandidaten
        };

        let mut report = SweepReport::default();
        for dossier_id in kandidaten {
            match self.zuruecksetzen(dossier_id).await {
                Ok(Some(status)) => {
                    metrics::counter!(KONTROLLEN_ABGELAUFEN).increment(1);
                    report.zurueckgesetzt.push((dossier_id, status));
                },
                Ok(None) => report.uebersprungen.push(dossier_id),
                Err(error) => {
                    metrics::counter!(SWEEP_FEHLER).increment(1);
                    tracing::error!(dossier_id = %dossier_id, error = %error, "Failed to reset stale control");
                    report.fehlgeschlagen.push(dossier_id);
                },
            }
        }

        if !report.zurueckgesetzt.is_empty() || !report.fehlgeschlagen.is_empty() {
            tracing::info!(
                zurueckgesetzt = report.zurueckgesetzt.len(),
                fehlgeschlagen = report.fehlgeschlagen.len(),
                "Control sweep finished"
            );
        }
        Ok(report)
    }

    /// Reset one dossier if its control is still older than the control TTL.
    ///
    /// Returns the new status, or `None` if the dossier is no longer sitting on a
    /// stale control.
    ///
    /// # Errors
    ///
    /// - [`BookingError::EntityNotFound`] if the dossier does not exist
    /// - [`BookingError::Store`] if the dossier cannot be written
    pub async fn zuruecksetzen(&self, dossier_id: DossierId) -> Result<Option<ImpfdossierStatus>> {
        let mut tx = self.store.begin().await?;
        match self.zuruecksetzen_in(tx.as_mut(), dossier_id).await {
            Ok(status) => {
                tx.commit().await?;
                Ok(status)
            },
            Err(error) => {
                crate::rollback(tx.as_mut()).await;
                Err(error)
            },
        }
    }

    async fn zuruecksetzen_in(
        &self,
        tx: &mut dyn Transaction,
        dossier_id: DossierId,
    ) -> Result<Option<ImpfdossierStatus>> {
        let dossier = tx
            .find_dossier(dossier_id)
            .await?
            .ok_or_else(|| BookingError::not_found(Entity::Dossier, dossier_id))?;
        let cutoff = self.env.clock.now() - self.booking.kontrolle_ttl();
        if !dossier.aktuelle_kontrolle().is_some_and(|kontrolle| kontrolle.timestamp < cutoff) {
            tracing::debug!(dossier_id = %dossier_id, status = %dossier.status, "Control no longer stale, skipped");
            return Ok(None);
        }
        let odi = match dossier.buchung.gewuenschter_odi {
            Some(odi_id) => tx.find_odi(odi_id).await?,
            None => None,
        };
        let von = dossier.status;
        let impfungen = tx.list_impfungen(dossier_id).await?;
        let mut state =
            DossierState::new(dossier, odi).with_geimpfte_termine(impfungen.iter().map(|impfung| impfung.termin_id));

        DossierReducer.reduce(&mut state, DossierAction::KontrolleAbgelaufen, &self.env)?;
        tx.update_dossier(&state.dossier).await?;

        tracing::debug!(
            dossier_id = %dossier_id,
            von = %von,
            nach = %state.dossier.status,
            "Stale control reset"
        );
        Ok(Some(state.dossier.status))
    }
}

//! [`Transaction`] implementation over a sqlx transaction.

use crate::db_error;
use crate::rows::{self, DOSSIER_COLUMNS, IMPFUNG_COLUMNS, SLOT_COLUMNS, TERMIN_COLUMNS, to_i32, to_u32};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use sqlx::types::Json;
use sqlx::Postgres;
use std::collections::HashSet;
use terminbuchung_core::error::{Entity, StoreError};
use terminbuchung_core::store::{SlotFilter, StoreResult, Transaction};
use terminbuchung_core::types::{
    DossierId, Impfdossier, Impfdossiereintrag, ImpfdossierStatus, Impffolge, Impfslot, Impftermin,
    Impfung, Kontrolle, Krankheit, Odi, OdiId, Registrierungsnummer, SlotId, TerminId,
};
use uuid::Uuid;

/// One database transaction.
///
/// Dropping it without [`Transaction::commit`] rolls back.
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    pub(crate) const fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx: Some(tx) }
    }

    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| StoreError::Database("Transaction already finished".to_string()))
    }
}

fn conflict(entity: Entity, id: impl ToString) -> StoreError {
    metrics::counter!("terminbuchung_store_conflicts_total", "entity" => entity.to_string()).increment(1);
    StoreError::Conflict {
        entity,
        id: id.to_string(),
    }
}

fn kontrolle_spalten(kontrolle: Option<&Kontrolle>) -> (Option<DateTime<Utc>>, Option<Uuid>) {
    kontrolle.map_or((None, None), |k| (Some(k.timestamp), Some(*k.odi_id.as_uuid())))
}

async fn upsert_eintrag(
    conn: &mut PgConnection,
    dossier_id: DossierId,
    eintrag: &Impfdossiereintrag,
) -> StoreResult<()> {
    let (kontrolle_timestamp, kontrolle_odi) = kontrolle_spalten(eintrag.kontrolle.as_ref());
    sqlx::query(
        r"
        INSERT INTO impfdossiereintrag (
            id, dossier_id, impffolge_nr, impftermin, kontrolle_timestamp, kontrolle_odi
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE SET
            impffolge_nr = EXCLUDED.impffolge_nr,
            impftermin = EXCLUDED.impftermin,
            kontrolle_timestamp = EXCLUDED.kontrolle_timestamp,
            kontrolle_odi = EXCLUDED.kontrolle_odi
        ",
    )
    .bind(*eintrag.id.as_uuid())
    .bind(*dossier_id.as_uuid())
    .bind(to_i32(eintrag.impffolge_nr))
    .bind(eintrag.impftermin.map(|t| *t.as_uuid()))
    .bind(kontrolle_timestamp)
    .bind(kontrolle_odi)
    .execute(conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn find_odi(&mut self, id: OdiId) -> StoreResult<Option<Odi>> {
        let row = sqlx::query("SELECT id, name, terminverwaltung FROM odi WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(self.conn()?)
            .await
            .map_err(db_error)?;
        row.as_ref().map(rows::odi).transpose()
    }

    async fn insert_odi(&mut self, odi: &Odi) -> StoreResult<()> {
        sqlx::query("INSERT INTO odi (id, name, terminverwaltung) VALUES ($1, $2, $3)")
            .bind(*odi.id.as_uuid())
            .bind(&odi.name)
            .bind(odi.terminverwaltung)
            .execute(self.conn()?)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn find_slot(&mut self, id: SlotId) -> StoreResult<Option<Impfslot>> {
        let row = sqlx::query(&format!("SELECT {SLOT_COLUMNS} FROM impfslot WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(self.conn()?)
            .await
            .map_err(db_error)?;
        row.as_ref().map(rows::slot).transpose()
    }

    async fn find_slot_covering(
        &mut self,
        odi_id: OdiId,
        krankheit: Krankheit,
        zeitpunkt: DateTime<Utc>,
    ) -> StoreResult<Option<Impfslot>> {
        let row = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM impfslot \
             WHERE odi_id = $1 AND krankheit = $2 AND von <= $3 AND bis > $3 \
             ORDER BY von LIMIT 1"
        ))
        .bind(*odi_id.as_uuid())
        .bind(krankheit.as_str())
        .bind(zeitpunkt)
        .fetch_optional(self.conn()?)
        .await
        .map_err(db_error)?;
        row.as_ref().map(rows::slot).transpose()
    }

    async fn find_slots(&mut self, filter: &SlotFilter) -> StoreResult<Vec<Impfslot>> {
        let found = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM impfslot \
             WHERE odi_id = $1 AND krankheit = $2 AND von >= $3 AND von < $4 \
             ORDER BY von"
        ))
        .bind(*filter.odi_id.as_uuid())
        .bind(filter.krankheit.as_str())
        .bind(filter.von)
        .bind(filter.bis)
        .fetch_all(self.conn()?)
        .await
        .map_err(db_error)?;
        found.iter().map(rows::slot).collect()
    }

    async fn insert_slot(&mut self, slot: &Impfslot) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO impfslot (
                id, krankheit, odi_id, von, bis, kapazitaet_erste_impfung,
                kapazitaet_zweite_impfung, kapazitaet_booster, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(*slot.id.as_uuid())
        .bind(slot.krankheit.as_str())
        .bind(*slot.odi_id.as_uuid())
        .bind(slot.zeitfenster.von)
        .bind(slot.zeitfenster.bis)
        .bind(to_i32(slot.kapazitaet.erste_impfung))
        .bind(to_i32(slot.kapazitaet.zweite_impfung))
        .bind(to_i32(slot.kapazitaet.booster))
        .bind(slot.version)
        .execute(self.conn()?)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update_slot(&mut self, slot: &Impfslot) -> StoreResult<i64> {
        let version: Option<(i64,)> = sqlx::query_as(
            r"
            UPDATE impfslot SET
                kapazitaet_erste_impfung = $2,
                kapazitaet_zweite_impfung = $3,
                kapazitaet_booster = $4,
                version = version + 1
            WHERE id = $1 AND version = $5
            RETURNING version
            ",
        )
        .bind(*slot.id.as_uuid())
        .bind(to_i32(slot.kapazitaet.erste_impfung))
        .bind(to_i32(slot.kapazitaet.zweite_impfung))
        .bind(to_i32(slot.kapazitaet.booster))
        .bind(slot.version)
        .fetch_optional(self.conn()?)
        .await
        .map_err(db_error)?;
        version
            .map(|(v,)| v)
            .ok_or_else(|| conflict(Entity::Slot, slot.id))
    }

    async fn find_termin(&mut self, id: TerminId) -> StoreResult<Option<Impftermin>> {
        let row = sqlx::query(&format!("SELECT {TERMIN_COLUMNS} FROM impftermin WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(self.conn()?)
            .await
            .map_err(db_error)?;
        row.as_ref().map(rows::termin).transpose()
    }

    async fn list_termine(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
    ) -> StoreResult<Vec<Impftermin>> {
        let found = sqlx::query(&format!(
            "SELECT {TERMIN_COLUMNS} FROM impftermin \
             WHERE slot_id = $1 AND impffolge = $2 ORDER BY seq"
        ))
        .bind(*slot_id.as_uuid())
        .bind(impffolge.as_str())
        .fetch_all(self.conn()?)
        .await
        .map_err(db_error)?;
        found.iter().map(rows::termin).collect()
    }

    async fn find_free_termin(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
        reservation_cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Impftermin>> {
        let row = sqlx::query(&format!(
            "SELECT {TERMIN_COLUMNS} FROM impftermin \
             WHERE slot_id = $1 AND impffolge = $2 AND gebucht = FALSE \
               AND (reserviert_fuer IS NULL OR timestamp_reserviert IS NULL OR timestamp_reserviert < $3) \
             ORDER BY seq \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(*slot_id.as_uuid())
        .bind(impffolge.as_str())
        .bind(reservation_cutoff)
        .fetch_optional(self.conn()?)
        .await
        .map_err(db_error)?;
        row.as_ref().map(rows::termin).transpose()
    }

    async fn find_reserved_termin(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
        registrierung: &Registrierungsnummer,
        reservation_cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Impftermin>> {
        let row = sqlx::query(&format!(
            "SELECT {TERMIN_COLUMNS} FROM impftermin \
             WHERE slot_id = $1 AND impffolge = $2 AND gebucht = FALSE \
               AND reserviert_fuer = $3 AND timestamp_reserviert >= $4 \
             ORDER BY seq \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(*slot_id.as_uuid())
        .bind(impffolge.as_str())
        .bind(registrierung.as_str())
        .bind(reservation_cutoff)
        .fetch_optional(self.conn()?)
        .await
        .map_err(db_error)?;
        row.as_ref().map(rows::termin).transpose()
    }

    async fn count_free_termine(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
        reservation_cutoff: DateTime<Utc>,
    ) -> StoreResult<u32> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM impftermin
            WHERE slot_id = $1 AND impffolge = $2 AND gebucht = FALSE
              AND (reserviert_fuer IS NULL OR timestamp_reserviert IS NULL OR timestamp_reserviert < $3)
            ",
        )
        .bind(*slot_id.as_uuid())
        .bind(impffolge.as_str())
        .bind(reservation_cutoff)
        .fetch_one(self.conn()?)
        .await
        .map_err(db_error)?;
        Ok(to_u32(count))
    }

    async fn insert_termin(&mut self, termin: &Impftermin) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO impftermin (
                id, slot_id, impffolge, gebucht, reserviert_fuer, timestamp_reserviert, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(*termin.id.as_uuid())
        .bind(*termin.slot_id.as_uuid())
        .bind(termin.impffolge.as_str())
        .bind(termin.gebucht)
        .bind(termin.reserviert_fuer.as_ref().map(Registrierungsnummer::as_str))
        .bind(termin.timestamp_reserviert)
        .bind(termin.version)
        .execute(self.conn()?)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn update_termin(&mut self, termin: &Impftermin) -> StoreResult<i64> {
        let version: Option<(i64,)> = sqlx::query_as(
            r"
            UPDATE impftermin SET
                gebucht = $2,
                reserviert_fuer = $3,
                timestamp_reserviert = $4,
                version = version + 1
            WHERE id = $1 AND version = $5
            RETURNING version
            ",
        )
        .bind(*termin.id.as_uuid())
        .bind(termin.gebucht)
        .bind(termin.reserviert_fuer.as_ref().map(Registrierungsnummer::as_str))
        .bind(termin.timestamp_reserviert)
        .bind(termin.version)
        .fetch_optional(self.conn()?)
        .await
        .map_err(db_error)?;
        version
            .map(|(v,)| v)
            .ok_or_else(|| conflict(Entity::Termin, termin.id))
    }

    async fn delete_termin(&mut self, termin: &Impftermin) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM impftermin WHERE id = $1 AND version = $2 AND gebucht = FALSE")
            .bind(*termin.id.as_uuid())
            .bind(termin.version)
            .execute(self.conn()?)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(conflict(Entity::Termin, termin.id));
        }
        Ok(())
    }

    async fn is_termin_referenced(&mut self, id: TerminId) -> StoreResult<bool> {
        let (referenced,): (bool,) = sqlx::query_as(
            r"
            SELECT EXISTS (
                SELECT 1 FROM impfdossier WHERE impftermin1 = $1 OR impftermin2 = $1
            ) OR EXISTS (
                SELECT 1 FROM impfdossiereintrag WHERE impftermin = $1
            )
            ",
        )
        .bind(*id.as_uuid())
        .fetch_one(self.conn()?)
        .await
        .map_err(db_error)?;
        Ok(referenced)
    }

    async fn find_dossier(&mut self, id: DossierId) -> StoreResult<Option<Impfdossier>> {
        let conn = self.conn()?;
        let Some(row) = sqlx::query(&format!("SELECT {DOSSIER_COLUMNS} FROM impfdossier WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error)?
        else {
            return Ok(None);
        };

        let eintraege = sqlx::query(
            r"
            SELECT id, impffolge_nr, impftermin, kontrolle_timestamp, kontrolle_odi
            FROM impfdossiereintrag
            WHERE dossier_id = $1
            ORDER BY impffolge_nr
            ",
        )
        .bind(*id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?
        .iter()
        .map(rows::eintrag)
        .collect::<StoreResult<Vec<_>>>()?;

        rows::dossier(&row, eintraege).map(Some)
    }

    async fn insert_dossier(&mut self, dossier: &Impfdossier) -> StoreResult<()> {
        let conn = self.conn()?;
        let (kontrolle1_timestamp, kontrolle1_odi) = kontrolle_spalten(dossier.kontrolle1.as_ref());
        let (kontrolle2_timestamp, kontrolle2_odi) = kontrolle_spalten(dossier.kontrolle2.as_ref());
        sqlx::query(&format!(
            "INSERT INTO impfdossier ({DOSSIER_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        ))
        .bind(*dossier.id.as_uuid())
        .bind(dossier.registrierungsnummer.as_str())
        .bind(dossier.krankheit.as_str())
        .bind(dossier.prioritaet.as_char().to_string())
        .bind(dossier.status.as_str())
        .bind(dossier.buchung.gewuenschter_odi.map(|o| *o.as_uuid()))
        .bind(dossier.buchung.impftermin1.map(|t| *t.as_uuid()))
        .bind(dossier.buchung.impftermin2.map(|t| *t.as_uuid()))
        .bind(dossier.buchung.selbstzahler)
        .bind(dossier.buchung.abgesagte_termine.as_ref().map(Json))
        .bind(kontrolle1_timestamp)
        .bind(kontrolle1_odi)
        .bind(kontrolle2_timestamp)
        .bind(kontrolle2_odi)
        .bind(dossier.impfschutz.as_ref().map(Json))
        .bind(dossier.externes_zertifikat.as_ref().map(Json))
        .bind(dossier.timestamp_sent_to_registry)
        .bind(dossier.version)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

        for eintrag in &dossier.eintraege {
            upsert_eintrag(&mut *conn, dossier.id, eintrag).await?;
        }
        Ok(())
    }

    async fn update_dossier(&mut self, dossier: &Impfdossier) -> StoreResult<i64> {
        let conn = self.conn()?;
        let (kontrolle1_timestamp, kontrolle1_odi) = kontrolle_spalten(dossier.kontrolle1.as_ref());
        let (kontrolle2_timestamp, kontrolle2_odi) = kontrolle_spalten(dossier.kontrolle2.as_ref());
        let version: Option<(i64,)> = sqlx::query_as(
            r"
            UPDATE impfdossier SET
                status = $2,
                gewuenschter_odi = $3,
                impftermin1 = $4,
                impftermin2 = $5,
                selbstzahler = $6,
                abgesagte_termine = $7,
                kontrolle1_timestamp = $8,
                kontrolle1_odi = $9,
                kontrolle2_timestamp = $10,
                kontrolle2_odi = $11,
                impfschutz = $12,
                externes_zertifikat = $13,
                timestamp_sent_to_registry = $14,
                version = version + 1
            WHERE id = $1 AND version = $15
            RETURNING version
            ",
        )
        .bind(*dossier.id.as_uuid())
        .bind(dossier.status.as_str())
        .bind(dossier.buchung.gewuenschter_odi.map(|o| *o.as_uuid()))
        .bind(dossier.buchung.impftermin1.map(|t| *t.as_uuid()))
        .bind(dossier.buchung.impftermin2.map(|t| *t.as_uuid()))
        .bind(dossier.buchung.selbstzahler)
        .bind(dossier.buchung.abgesagte_termine.as_ref().map(Json))
        .bind(kontrolle1_timestamp)
        .bind(kontrolle1_odi)
        .bind(kontrolle2_timestamp)
        .bind(kontrolle2_odi)
        .bind(dossier.impfschutz.as_ref().map(Json))
        .bind(dossier.externes_zertifikat.as_ref().map(Json))
        .bind(dossier.timestamp_sent_to_registry)
        .bind(dossier.version)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
        let Some((version,)) = version else {
            return Err(conflict(Entity::Dossier, dossier.id));
        };

        // Removed entries go first: a renumbered entry may take over their number.
        let vorhanden: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM impfdossiereintrag WHERE dossier_id = $1")
                .bind(*dossier.id.as_uuid())
                .fetch_all(&mut *conn)
                .await
                .map_err(db_error)?;
        let behalten: HashSet<Uuid> = dossier.eintraege.iter().map(|e| *e.id.as_uuid()).collect();
        let entfernt: Vec<Uuid> = vorhanden
            .into_iter()
            .map(|(id,)| id)
            .filter(|id| !behalten.contains(id))
            .collect();
        if !entfernt.is_empty() {
            sqlx::query("DELETE FROM impfdossiereintrag WHERE id = ANY($1)")
                .bind(&entfernt)
                .execute(&mut *conn)
                .await
                .map_err(db_error)?;
        }
        for eintrag in &dossier.eintraege {
            upsert_eintrag(&mut *conn, dossier.id, eintrag).await?;
        }
        Ok(version)
    }

    async fn find_dossiers_kontrolliert_vor(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<DossierId>> {
        let found: Vec<(Uuid,)> = sqlx::query_as(
            r"
            SELECT id FROM (
                SELECT d.id,
                    CASE d.status
                        WHEN $3 THEN d.kontrolle1_timestamp
                        WHEN $4 THEN d.kontrolle2_timestamp
                        WHEN $5 THEN b.kontrolle_timestamp
                    END AS kontrolliert_am
                FROM impfdossier d
                LEFT JOIN LATERAL (
                    SELECT e.kontrolle_timestamp
                    FROM impfdossiereintrag e
                    WHERE e.dossier_id = d.id
                    ORDER BY e.impffolge_nr DESC
                    LIMIT 1
                ) b ON TRUE
                WHERE d.status IN ($3, $4, $5)
            ) k
            WHERE kontrolliert_am < $1
            ORDER BY kontrolliert_am
            LIMIT $2
            ",
        )
        .bind(cutoff)
        .bind(i64::from(limit))
        .bind(ImpfdossierStatus::Impfung1Kontrolliert.as_str())
        .bind(ImpfdossierStatus::Impfung2Kontrolliert.as_str())
        .bind(ImpfdossierStatus::KontrolliertBooster.as_str())
        .fetch_all(self.conn()?)
        .await
        .map_err(db_error)?;
        Ok(found.into_iter().map(|(id,)| DossierId::from_uuid(id)).collect())
    }

    async fn find_impfung_by_termin(&mut self, termin_id: TerminId) -> StoreResult<Option<Impfung>> {
        let row = sqlx::query(&format!("SELECT {IMPFUNG_COLUMNS} FROM impfung WHERE termin_id = $1"))
            .bind(*termin_id.as_uuid())
            .fetch_optional(self.conn()?)
            .await
            .map_err(db_error)?;
        row.as_ref().map(rows::impfung).transpose()
    }

    async fn list_impfungen(&mut self, dossier_id: DossierId) -> StoreResult<Vec<Impfung>> {
        let found = sqlx::query(&format!(
            "SELECT {IMPFUNG_COLUMNS} FROM impfung WHERE dossier_id = $1 ORDER BY timestamp_impfung"
        ))
        .bind(*dossier_id.as_uuid())
        .fetch_all(self.conn()?)
        .await
        .map_err(db_error)?;
        found.iter().map(rows::impfung).collect()
    }

    async fn insert_impfung(&mut self, impfung: &Impfung) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO impfung ({IMPFUNG_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(*impfung.id.as_uuid())
        .bind(*impfung.dossier_id.as_uuid())
        .bind(*impfung.termin_id.as_uuid())
        .bind(impfung.impffolge.as_str())
        .bind(*impfung.odi_id.as_uuid())
        .bind(impfung.timestamp_impfung)
        .execute(self.conn()?)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn delete_impfung(&mut self, impfung: &Impfung) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM impfung WHERE id = $1")
            .bind(*impfung.id.as_uuid())
            .execute(self.conn()?)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(conflict(Entity::Impfung, impfung.id));
        }
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Database("Transaction already finished".to_string()))?;
        tx.commit().await.map_err(db_error)
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(db_error),
            None => Ok(()),
        }
    }
}

//! Row decoding and column conversions.

use crate::db_error;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use terminbuchung_core::error::StoreError;
use terminbuchung_core::store::StoreResult;
use terminbuchung_core::types::{
    AbgesagteTermine, Buchung, DossierId, EintragId, ExternesZertifikat, Impfdossier,
    Impfdossiereintrag, ImpfdossierStatus, Impffolge, Impfschutz, Impfslot, Impftermin, Impfung,
    ImpfungId, Kapazitaet, Kontrolle, Krankheit, Odi, OdiId, Prioritaet, Registrierungsnummer,
    SlotId, TerminId, Zeitfenster,
};
use uuid::Uuid;

pub(crate) const TERMIN_COLUMNS: &str =
    "id, slot_id, impffolge, gebucht, reserviert_fuer, timestamp_reserviert, version";

pub(crate) const SLOT_COLUMNS: &str = "id, krankheit, odi_id, von, bis, kapazitaet_erste_impfung, \
     kapazitaet_zweite_impfung, kapazitaet_booster, version";

pub(crate) const DOSSIER_COLUMNS: &str = "id, registrierungsnummer, krankheit, prioritaet, status, \
     gewuenschter_odi, impftermin1, impftermin2, selbstzahler, abgesagte_termine, \
     kontrolle1_timestamp, kontrolle1_odi, kontrolle2_timestamp, kontrolle2_odi, \
     impfschutz, externes_zertifikat, timestamp_sent_to_registry, version";

pub(crate) const IMPFUNG_COLUMNS: &str =
    "id, dossier_id, termin_id, impffolge, odi_id, timestamp_impfung";

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(db_error)
}

fn invalid(column: &str, value: &str) -> StoreError {
    StoreError::Database(format!("Invalid {column} value: {value}"))
}

pub(crate) fn krankheit(value: &str) -> StoreResult<Krankheit> {
    Krankheit::parse(value).ok_or_else(|| invalid("krankheit", value))
}

pub(crate) fn impffolge(value: &str) -> StoreResult<Impffolge> {
    Impffolge::parse(value).ok_or_else(|| invalid("impffolge", value))
}

fn status(value: &str) -> StoreResult<ImpfdossierStatus> {
    ImpfdossierStatus::parse(value).ok_or_else(|| invalid("status", value))
}

/// Capacities and booster numbers are `u32` in the domain and `INTEGER` in the schema.
pub(crate) fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn kontrolle(timestamp: Option<DateTime<Utc>>, odi: Option<Uuid>) -> Option<Kontrolle> {
    match (timestamp, odi) {
        (Some(timestamp), Some(odi)) => Some(Kontrolle {
            timestamp,
            odi_id: OdiId::from_uuid(odi),
        }),
        _ => None,
    }
}

pub(crate) fn odi(row: &PgRow) -> StoreResult<Odi> {
    Ok(Odi {
        id: OdiId::from_uuid(get(row, "id")?),
        name: get(row, "name")?,
        terminverwaltung: get(row, "terminverwaltung")?,
    })
}

pub(crate) fn slot(row: &PgRow) -> StoreResult<Impfslot> {
    let krankheit_text: String = get(row, "krankheit")?;
    let erste: i32 = get(row, "kapazitaet_erste_impfung")?;
    let zweite: i32 = get(row, "kapazitaet_zweite_impfung")?;
    let booster: i32 = get(row, "kapazitaet_booster")?;
    Ok(Impfslot {
        id: SlotId::from_uuid(get(row, "id")?),
        krankheit: krankheit(&krankheit_text)?,
        odi_id: OdiId::from_uuid(get(row, "odi_id")?),
        zeitfenster: Zeitfenster::new(get(row, "von")?, get(row, "bis")?),
        kapazitaet: Kapazitaet::new(
            to_u32(i64::from(erste)),
            to_u32(i64::from(zweite)),
            to_u32(i64::from(booster)),
        ),
        version: get(row, "version")?,
    })
}

pub(crate) fn termin(row: &PgRow) -> StoreResult<Impftermin> {
    let impffolge_text: String = get(row, "impffolge")?;
    let reserviert_fuer: Option<String> = get(row, "reserviert_fuer")?;
    Ok(Impftermin {
        id: TerminId::from_uuid(get(row, "id")?),
        slot_id: SlotId::from_uuid(get(row, "slot_id")?),
        impffolge: impffolge(&impffolge_text)?,
        gebucht: get(row, "gebucht")?,
        reserviert_fuer: reserviert_fuer.map(Registrierungsnummer::new),
        timestamp_reserviert: get(row, "timestamp_reserviert")?,
        version: get(row, "version")?,
    })
}

pub(crate) fn eintrag(row: &PgRow) -> StoreResult<Impfdossiereintrag> {
    let impffolge_nr: i32 = get(row, "impffolge_nr")?;
    let impftermin: Option<Uuid> = get(row, "impftermin")?;
    Ok(Impfdossiereintrag {
        id: EintragId::from_uuid(get(row, "id")?),
        impffolge_nr: to_u32(i64::from(impffolge_nr)),
        impftermin: impftermin.map(TerminId::from_uuid),
        kontrolle: kontrolle(get(row, "kontrolle_timestamp")?, get(row, "kontrolle_odi")?),
    })
}

/// Decode a dossier row; booster entries are loaded separately.
pub(crate) fn dossier(row: &PgRow, eintraege: Vec<Impfdossiereintrag>) -> StoreResult<Impfdossier> {
    let krankheit_text: String = get(row, "krankheit")?;
    let prioritaet_text: String = get(row, "prioritaet")?;
    let status_text: String = get(row, "status")?;
    let registrierungsnummer: String = get(row, "registrierungsnummer")?;
    let gewuenschter_odi: Option<Uuid> = get(row, "gewuenschter_odi")?;
    let impftermin1: Option<Uuid> = get(row, "impftermin1")?;
    let impftermin2: Option<Uuid> = get(row, "impftermin2")?;
    let abgesagte_termine: Option<Json<AbgesagteTermine>> = get(row, "abgesagte_termine")?;
    let impfschutz: Option<Json<Impfschutz>> = get(row, "impfschutz")?;
    let externes_zertifikat: Option<Json<ExternesZertifikat>> = get(row, "externes_zertifikat")?;

    let prioritaet = prioritaet_text
        .chars()
        .next()
        .map(Prioritaet::new)
        .ok_or_else(|| invalid("prioritaet", &prioritaet_text))?;

    Ok(Impfdossier {
        id: DossierId::from_uuid(get(row, "id")?),
        registrierungsnummer: Registrierungsnummer::new(registrierungsnummer),
        krankheit: krankheit(&krankheit_text)?,
        prioritaet,
        status: status(&status_text)?,
        buchung: Buchung {
            gewuenschter_odi: gewuenschter_odi.map(OdiId::from_uuid),
            impftermin1: impftermin1.map(TerminId::from_uuid),
            impftermin2: impftermin2.map(TerminId::from_uuid),
            selbstzahler: get(row, "selbstzahler")?,
            abgesagte_termine: abgesagte_termine.map(|Json(a)| a),
        },
        kontrolle1: kontrolle(get(row, "kontrolle1_timestamp")?, get(row, "kontrolle1_odi")?),
        kontrolle2: kontrolle(get(row, "kontrolle2_timestamp")?, get(row, "kontrolle2_odi")?),
        eintraege,
        impfschutz: impfschutz.map(|Json(i)| i),
        externes_zertifikat: externes_zertifikat.map(|Json(z)| z),
        timestamp_sent_to_registry: get(row, "timestamp_sent_to_registry")?,
        version: get(row, "version")?,
    })
}

pub(crate) fn impfung(row: &PgRow) -> StoreResult<Impfung> {
    let impffolge_text: String = get(row, "impffolge")?;
    Ok(Impfung {
        id: ImpfungId::from_uuid(get(row, "id")?),
        dossier_id: DossierId::from_uuid(get(row, "dossier_id")?),
        termin_id: TerminId::from_uuid(get(row, "termin_id")?),
        impffolge: impffolge(&impffolge_text)?,
        odi_id: OdiId::from_uuid(get(row, "odi_id")?),
        timestamp_impfung: get(row, "timestamp_impfung")?,
    })
}

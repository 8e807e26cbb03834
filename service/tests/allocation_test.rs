//! Appointment allocation and capacity tests.
//!
//! Exercises the allocator, the capacity resizer and the control sweep against the
//! in-memory store: concurrent bookings of the last appointments, reference
//! uniqueness after rebooking, capacity invariants and stale-control resets.
//!
//! Run with: `cargo test --test allocation_test`

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use chrono::Duration;
use common::{Umgebung, tag};
use futures::future::join_all;
use proptest::prelude::*;
use std::collections::HashMap;
use terminbuchung_core::environment::{Clock, Rolle, StaticIdentity};
use terminbuchung_core::error::BookingError;
use terminbuchung_core::status::{DossierState, StatusGuards, letzter_status_vor_kontrolle_1};
use terminbuchung_core::store::Store;
use terminbuchung_core::types::{
    DossierId, Impfdossier, ImpfdossierStatus, Impffolge, Impfschutz, Kapazitaet, Krankheit,
    TerminId,
};
use terminbuchung_testing::{RecordingConfirmationService, SentNotification, StaticEligibility, properties};

/// Every appointment referenced by the given dossiers, with its number of references
fn referenzen(env: &Umgebung, dossiers: &[DossierId]) -> HashMap<TerminId, usize> {
    let mut zaehler = HashMap::new();
    for id in dossiers {
        let dossier = env.store.dossier(*id).expect("dossier exists");
        let termine = [dossier.buchung.impftermin1, dossier.buchung.impftermin2]
            .into_iter()
            .chain(dossier.eintraege.iter().map(|e| e.impftermin))
            .flatten();
        for termin in termine {
            *zaehler.entry(termin).or_insert(0) += 1;
        }
    }
    zaehler
}

fn freigegebener_booster(env: &Umgebung) -> Impfdossier {
    let mut dossier = terminbuchung_testing::helpers::dossier(Krankheit::Covid, ImpfdossierStatus::FreigegebenBooster);
    dossier.impfschutz = Some(Impfschutz {
        freigegeben_naechste_impfung_ab: Some(env.clock.now() - Duration::days(1)),
        freigegeben_ab_selbstzahler: None,
    });
    env.store.seed_dossier(&dossier);
    dossier
}

/// Test 1: Three concurrent bookings for two first-dose appointments
///
/// Exactly two succeed, the third sees `AppointmentTaken`, and no appointment is
/// referenced twice.
#[tokio::test]
async fn test_concurrent_bookings_of_last_appointments() {
    let env = Umgebung::new();
    let s = env.slot(Krankheit::Covid, tag(3, 2), 9, Kapazitaet::new(2, 0, 0)).await;
    let t = env.slot(Krankheit::Covid, tag(3, 31), 9, Kapazitaet::new(0, 3, 0)).await;
    let dossiers: Vec<DossierId> = (0..3)
        .map(|_| env.dossier(Krankheit::Covid, ImpfdossierStatus::Freigegeben).id)
        .collect();

    let results = join_all(
        dossiers
            .iter()
            .map(|id| env.booking.book_grundimmunisierung(*id, s.id, t.id)),
    )
    .await;

    let gebucht = results.iter().filter(|r| r.is_ok()).count();
    let vergeben = results
        .iter()
        .filter(|r| matches!(r, Err(BookingError::AppointmentTaken { .. })))
        .count();
    assert_eq!(gebucht, 2);
    assert_eq!(vergeben, 1);

    assert!(env.store.termine(s.id, Impffolge::ErsteImpfung).iter().all(|t| t.gebucht));
    assert!(referenzen(&env, &dossiers).values().all(|n| *n == 1));
    assert_eq!(env.store.locked_termine(), 0);

    let verlierer = dossiers
        .iter()
        .zip(&results)
        .find_map(|(id, r)| r.is_err().then_some(*id))
        .unwrap();
    let dossier = env.store.dossier(verlierer).unwrap();
    assert_eq!(dossier.status, ImpfdossierStatus::Freigegeben);
    assert_eq!(dossier.buchung.impftermin1, None);
    assert_eq!(dossier.buchung.impftermin2, None);
}

/// Test 2: A rebooked appointment is released for others
#[tokio::test]
async fn test_rebooking_releases_previous_appointment() {
    let env = Umgebung::new();
    let s1 = env.slot(Krankheit::Covid, tag(3, 2), 9, Kapazitaet::new(1, 0, 0)).await;
    let s2 = env.slot(Krankheit::Covid, tag(3, 3), 9, Kapazitaet::new(1, 0, 0)).await;
    let t = env.slot(Krankheit::Covid, tag(3, 31), 9, Kapazitaet::new(0, 2, 0)).await;
    let a = env.dossier(Krankheit::Covid, ImpfdossierStatus::Freigegeben);
    let b = env.dossier(Krankheit::Covid, ImpfdossierStatus::Freigegeben);

    let gebucht = env.booking.book_grundimmunisierung(a.id, s1.id, t.id).await.unwrap();
    let alter_termin = gebucht.buchung.impftermin1.unwrap();
    let termin2 = gebucht.buchung.impftermin2;

    let umgebucht = env.booking.umbuchen_grundimmunisierung(a.id, s2.id, t.id).await.unwrap();
    assert_eq!(umgebucht.status, ImpfdossierStatus::Gebucht);
    assert_ne!(umgebucht.buchung.impftermin1, Some(alter_termin));
    assert_eq!(umgebucht.buchung.impftermin2, termin2);

    let frei = env.store.termin(alter_termin).unwrap();
    assert!(!frei.gebucht);
    assert_eq!(frei.reserviert_fuer, None);

    env.booking.book_grundimmunisierung(b.id, s1.id, t.id).await.unwrap();
    let zaehler = referenzen(&env, &[a.id, b.id]);
    assert_eq!(zaehler.len(), 4);
    assert!(zaehler.values().all(|n| *n == 1));
}

/// Test 3: Booster capacity cannot shrink below its booked appointments
#[tokio::test]
async fn test_capacity_reduction_blocked_by_bookings() {
    let env = Umgebung::new();
    let slot = env.slot(Krankheit::Covid, tag(3, 2), 9, Kapazitaet::new(0, 0, 5)).await;
    for _ in 0..4 {
        let dossier = freigegebener_booster(&env);
        env.booking
            .book_booster(dossier.id, slot.id, false, &StaticIdentity::default())
            .await
            .unwrap();
    }

    let result = env.resizer.resize(slot.id, Kapazitaet::new(0, 0, 2)).await;

    assert!(matches!(
        result,
        Err(BookingError::CapacityReductionBlocked {
            impffolge: Impffolge::BoosterImpfung,
            requested: 2,
            removable: 1,
            ..
        })
    ));
    assert_eq!(env.store.slot(slot.id).unwrap().kapazitaet, Kapazitaet::new(0, 0, 5));
    assert_eq!(env.store.termine(slot.id, Impffolge::BoosterImpfung).len(), 5);

    let slot = env.resizer.resize(slot.id, Kapazitaet::new(1, 0, 4)).await.unwrap();
    assert_eq!(slot.kapazitaet, Kapazitaet::new(1, 0, 4));
    let booster = env.store.termine(slot.id, Impffolge::BoosterImpfung);
    assert_eq!(booster.len(), 4);
    assert!(booster.iter().all(|t| t.gebucht));
    assert_eq!(env.store.termine(slot.id, Impffolge::ErsteImpfung).len(), 1);
}

/// Test 4: Resizing many slots reports each slot on its own
#[tokio::test]
async fn test_resize_many_isolates_failures() {
    let env = Umgebung::new();
    let voll = env.slot(Krankheit::Covid, tag(3, 2), 9, Kapazitaet::new(0, 0, 1)).await;
    let leer = env.slot(Krankheit::Covid, tag(3, 2), 10, Kapazitaet::new(0, 0, 1)).await;
    let dossier = freigegebener_booster(&env);
    env.booking
        .book_booster(dossier.id, voll.id, false, &StaticIdentity::default())
        .await
        .unwrap();

    let ergebnisse = env
        .resizer
        .resize_many(vec![
            (voll.id, Kapazitaet::new(0, 0, 0)),
            (leer.id, Kapazitaet::new(0, 0, 0)),
        ])
        .await;

    assert_eq!(ergebnisse.len(), 2);
    assert!(ergebnisse[0].1.is_err());
    assert!(ergebnisse[1].1.is_ok());
    assert_eq!(env.store.termine(voll.id, Impffolge::BoosterImpfung).len(), 1);
    assert!(env.store.termine(leer.id, Impffolge::BoosterImpfung).is_empty());
}

/// Test 5: On-demand creation reuses a free appointment before adding one
#[tokio::test]
async fn test_on_demand_appointment_is_idempotent_while_free() {
    let env = Umgebung::new();
    let allocator = env.booking.allocator();
    let jetzt = env.clock.now();

    let mut tx = env.store.begin().await.unwrap();
    let erster = allocator
        .create_on_demand_appointment(tx.as_mut(), Krankheit::Covid, Impffolge::ErsteImpfung, env.odi.id, jetzt)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = env.store.begin().await.unwrap();
    let zweiter = allocator
        .create_on_demand_appointment(
            tx.as_mut(),
            Krankheit::Covid,
            Impffolge::ErsteImpfung,
            env.odi.id,
            jetzt + Duration::minutes(5),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(erster.id, zweiter.id);
    assert_eq!(env.store.slot_count(), 1);
    let slot = env.store.slot(erster.slot_id).unwrap();
    assert_eq!(slot.kapazitaet.erste_impfung, 1);
    assert!(slot.zeitfenster.enthaelt(jetzt));

    let mut tx = env.store.begin().await.unwrap();
    let mut gebucht = zweiter;
    gebucht.gebucht = true;
    tx.update_termin(&gebucht).await.unwrap();
    let dritter = allocator
        .create_on_demand_appointment(tx.as_mut(), Krankheit::Covid, Impffolge::ErsteImpfung, env.odi.id, jetzt)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_ne!(dritter.id, erster.id);
    assert_eq!(env.store.slot(erster.slot_id).unwrap().kapazitaet.erste_impfung, 2);
    assert_eq!(env.store.termine(erster.slot_id, Impffolge::ErsteImpfung).len(), 2);
}

/// Test 6: An immunised dossier books its first booster
///
/// No impfschutz has been computed yet; the booking creates booster entry 1.
#[tokio::test]
async fn test_immunisiert_books_first_booster() {
    let env = Umgebung::new();
    let slot = env.slot(Krankheit::Covid, tag(3, 2), 9, Kapazitaet::new(0, 0, 1)).await;
    let dossier = env.dossier(Krankheit::Covid, ImpfdossierStatus::Immunisiert);

    let gebucht = env
        .booking
        .book_booster(dossier.id, slot.id, false, &StaticIdentity::default())
        .await
        .unwrap();

    assert_eq!(gebucht.status, ImpfdossierStatus::GebuchtBooster);
    assert!(!gebucht.buchung.selbstzahler);
    assert_eq!(gebucht.eintraege.len(), 1);
    assert_eq!(gebucht.eintraege[0].impffolge_nr, 1);
    let termin_id = gebucht.eintraege[0].impftermin.unwrap();
    assert_eq!(env.store.termin(termin_id).unwrap().slot_id, slot.id);
    assert!(env.store.termin(termin_id).unwrap().gebucht);
}

/// Test 6b: A self-payer books before the regular freigabe date
///
/// The regular booking is held back by the pending freigabe; paying oneself
/// bypasses it but needs the right role.
#[tokio::test]
async fn test_self_payer_booster_before_freigabe() {
    let env = Umgebung::new();
    let slot = env.slot(Krankheit::Covid, tag(3, 2), 9, Kapazitaet::new(0, 0, 1)).await;
    let mut dossier = terminbuchung_testing::helpers::dossier(Krankheit::Covid, ImpfdossierStatus::Immunisiert);
    dossier.impfschutz = Some(Impfschutz {
        freigegeben_naechste_impfung_ab: Some(env.clock.now() + Duration::days(30)),
        freigegeben_ab_selbstzahler: None,
    });
    env.store.seed_dossier(&dossier);

    let regulaer = env
        .booking
        .book_booster(dossier.id, slot.id, false, &StaticIdentity::default())
        .await;
    assert!(matches!(
        regulaer,
        Err(BookingError::WrongDossierStatus {
            status: ImpfdossierStatus::Immunisiert,
            ..
        })
    ));

    let ohne_rolle = env
        .booking
        .book_booster(dossier.id, slot.id, true, &StaticIdentity::with_roles([Rolle::OiKontrolle]))
        .await;
    assert!(matches!(ohne_rolle, Err(BookingError::Validation(_))));

    let gebucht = env
        .booking
        .book_booster(dossier.id, slot.id, true, &StaticIdentity::with_roles([Rolle::Impfwilliger]))
        .await
        .unwrap();

    assert_eq!(gebucht.status, ImpfdossierStatus::GebuchtBooster);
    assert!(gebucht.buchung.selbstzahler);
    assert_eq!(gebucht.eintraege.len(), 1);
    assert_eq!(gebucht.eintraege[0].impffolge_nr, 1);
    let termin_id = gebucht.eintraege[0].impftermin.unwrap();
    assert!(env.store.termin(termin_id).unwrap().gebucht);
    assert_eq!(
        env.benachrichtigungen.sent(),
        vec![SentNotification::Confirmation {
            dossier_id: dossier.id,
            booster_termin: Some(termin_id),
        }]
    );
}

/// Test 7: A stale booster control falls back to the booked booster
#[tokio::test]
async fn test_sweep_resets_stale_booster_control() {
    let env = Umgebung::new();
    let slot = env.slot(Krankheit::Covid, tag(3, 1), 8, Kapazitaet::new(0, 0, 1)).await;
    let dossier = freigegebener_booster(&env);
    env.booking
        .book_booster(dossier.id, slot.id, false, &StaticIdentity::default())
        .await
        .unwrap();
    let kontrolliert = env
        .booking
        .record_kontrolle(dossier.id, Impffolge::BoosterImpfung, env.odi.id)
        .await
        .unwrap();
    assert_eq!(kontrolliert.status, ImpfdossierStatus::KontrolliertBooster);
    assert!(kontrolliert.eintraege[0].kontrolle.is_some());

    let report = env.sweep.run().await.unwrap();
    assert!(report.zurueckgesetzt.is_empty());

    env.clock.advance(Duration::hours(25));
    let report = env.sweep.run().await.unwrap();

    assert_eq!(report.zurueckgesetzt, vec![(dossier.id, ImpfdossierStatus::GebuchtBooster)]);
    assert!(report.fehlgeschlagen.is_empty());
    let dossier = env.store.dossier(dossier.id).unwrap();
    assert_eq!(dossier.status, ImpfdossierStatus::GebuchtBooster);
    assert_eq!(dossier.eintraege[0].kontrolle, None);
    assert!(dossier.eintraege[0].impftermin.is_some());
    assert!(env.store.impfungen(dossier.id).is_empty());
}

/// Test 7b: A dossier controlled again after listing keeps its fresh control
#[tokio::test]
async fn test_sweep_rechecks_control_before_reset() {
    let env = Umgebung::new();
    let slot = env.slot(Krankheit::Covid, tag(3, 1), 8, Kapazitaet::new(0, 0, 1)).await;
    let dossier = freigegebener_booster(&env);
    env.booking
        .book_booster(dossier.id, slot.id, false, &StaticIdentity::default())
        .await
        .unwrap();
    env.booking
        .record_kontrolle(dossier.id, Impffolge::BoosterImpfung, env.odi.id)
        .await
        .unwrap();
    env.clock.advance(Duration::hours(25));

    let mut tx = env.store.begin().await.unwrap();
    let cutoff = env.clock.now() - Duration::hours(24);
    let kandidaten = tx.find_dossiers_kontrolliert_vor(cutoff, 10).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(kandidaten, vec![dossier.id]);

    let erneut = env
        .booking
        .record_kontrolle(dossier.id, Impffolge::BoosterImpfung, env.odi.id)
        .await
        .unwrap();

    let ergebnis = env.sweep.zuruecksetzen(dossier.id).await.unwrap();

    assert_eq!(ergebnis, None);
    let gespeichert = env.store.dossier(dossier.id).unwrap();
    assert_eq!(gespeichert.status, ImpfdossierStatus::KontrolliertBooster);
    assert_eq!(gespeichert.aktuelle_kontrolle(), erneut.aktuelle_kontrolle());
    assert_eq!(gespeichert.aktuelle_kontrolle().unwrap().timestamp, env.clock.now());
}

/// Test 8: The sweep skips dossiers it cannot write and resets the rest
#[tokio::test]
async fn test_sweep_reports_failed_dossiers() {
    let env = Umgebung::new();
    let a = env.dossier(Krankheit::Covid, ImpfdossierStatus::Freigegeben);
    let b = env.dossier(Krankheit::Covid, ImpfdossierStatus::Freigegeben);
    for dossier in [&a, &b] {
        env.booking
            .record_kontrolle(dossier.id, Impffolge::ErsteImpfung, env.odi.id)
            .await
            .unwrap();
    }
    env.store.fail_dossier_updates(b.id);
    env.clock.advance(Duration::hours(25));

    let report = env.sweep.run().await.unwrap();

    assert_eq!(report.zurueckgesetzt.len(), 1);
    assert_eq!(report.zurueckgesetzt[0].0, a.id);
    assert_eq!(report.fehlgeschlagen, vec![b.id]);
    assert_eq!(
        env.store.dossier(b.id).unwrap().status,
        ImpfdossierStatus::Impfung1Kontrolliert
    );
}

/// Notifications are not part of the allocation contract
#[tokio::test]
async fn test_failed_notification_keeps_booking() {
    let env = Umgebung::mit(StaticEligibility::all_unlocked(), RecordingConfirmationService::failing(5));
    let s = env.slot(Krankheit::Covid, tag(3, 2), 9, Kapazitaet::new(1, 0, 0)).await;
    let t = env.slot(Krankheit::Covid, tag(3, 31), 9, Kapazitaet::new(0, 1, 0)).await;
    let dossier = env.dossier(Krankheit::Covid, ImpfdossierStatus::Freigegeben);

    let gebucht = env.booking.book_grundimmunisierung(dossier.id, s.id, t.id).await.unwrap();

    assert_eq!(gebucht.status, ImpfdossierStatus::Gebucht);
    assert!(env.benachrichtigungen.sent().is_empty());
    assert_eq!(env.benachrichtigungen.attempts(), 3);
    assert_eq!(env.store.dossier(dossier.id).unwrap().status, ImpfdossierStatus::Gebucht);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A stale first control always lands on the status the guards derive.
    #[test]
    fn prop_stale_first_control_returns_to_derived_status(unlocked in any::<bool>(), vorgebucht in any::<bool>()) {
        let (dossier, erwartet) = tokio_test::block_on(async move {
            let eligibility = if unlocked {
                StaticEligibility::all_unlocked()
            } else {
                StaticEligibility::none_unlocked()
            };
            let env = Umgebung::mit(eligibility, RecordingConfirmationService::new());
            let dossier = env.dossier(Krankheit::Covid, ImpfdossierStatus::Freigegeben);
            if vorgebucht {
                let s = env.slot(Krankheit::Covid, tag(3, 2), 9, Kapazitaet::new(1, 0, 0)).await;
                let t = env.slot(Krankheit::Covid, tag(3, 31), 9, Kapazitaet::new(0, 1, 0)).await;
                env.booking.book_grundimmunisierung(dossier.id, s.id, t.id).await.unwrap();
            }
            env.booking
                .record_kontrolle(dossier.id, Impffolge::ErsteImpfung, env.odi.id)
                .await
                .unwrap();

            env.clock.advance(Duration::hours(25));
            env.sweep.run().await.unwrap();

            let dossier = env.store.dossier(dossier.id).unwrap();
            let state = DossierState::new(dossier.clone(), Some(env.odi.clone()));
            let guards = StatusGuards::ermitteln(&state, env.eligibility.as_ref(), env.clock.now());
            (dossier, letzter_status_vor_kontrolle_1(&guards))
        });

        prop_assert_eq!(dossier.status, erwartet);
        prop_assert!(dossier.kontrolle1.is_none());
        prop_assert!(dossier.buchung.impftermin1.is_some());
    }

    /// Appointment rows always match the stored capacity, and booked rows survive.
    #[test]
    fn prop_capacity_matches_appointment_rows(
        gebucht in 0usize..=3,
        aenderungen in proptest::collection::vec(properties::kapazitaet(4), 1..6),
    ) {
        let verlauf = tokio_test::block_on(async move {
            let env = Umgebung::new();
            let slot = env.slot(Krankheit::Covid, tag(3, 2), 9, Kapazitaet::new(2, 2, 3)).await;

            let mut tx = env.store.begin().await.unwrap();
            for mut termin in env.store.termine(slot.id, Impffolge::BoosterImpfung).into_iter().take(gebucht) {
                termin.gebucht = true;
                tx.update_termin(&termin).await.unwrap();
            }
            tx.commit().await.unwrap();

            let mut verlauf = Vec::new();
            let mut vorher = slot.kapazitaet;
            for neu in aenderungen {
                let ergebnis = env.resizer.resize(slot.id, neu).await;
                let gespeichert = env.store.slot(slot.id).unwrap().kapazitaet;
                let zeilen: Vec<usize> = Impffolge::ALL
                    .into_iter()
                    .map(|f| env.store.termine(slot.id, f).len())
                    .collect();
                let gebuchte = env
                    .store
                    .termine(slot.id, Impffolge::BoosterImpfung)
                    .iter()
                    .filter(|t| t.gebucht)
                    .count();
                verlauf.push((neu, vorher, ergebnis.is_ok(), gespeichert, zeilen, gebuchte));
                vorher = gespeichert;
            }
            verlauf
        });

        for (neu, vorher, ok, gespeichert, zeilen, gebuchte) in verlauf {
            let erwartet = if ok { neu } else { vorher };
            prop_assert_eq!(gespeichert, erwartet);
            prop_assert_eq!(ok, neu.booster as usize >= gebucht);
            for (impffolge, anzahl) in Impffolge::ALL.into_iter().zip(zeilen) {
                prop_assert_eq!(anzahl, gespeichert.get(impffolge) as usize);
            }
            prop_assert_eq!(gebuchte, gebucht);
        }
    }
}

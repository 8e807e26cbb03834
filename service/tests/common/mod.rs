//! Shared fixture for the service integration tests.

#![allow(dead_code)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use chrono::{NaiveDate, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use terminbuchung_core::status::DossierEnvironment;
use terminbuchung_core::store::Store;
use terminbuchung_core::types::{Impfdossier, ImpfdossierStatus, Impfslot, Kapazitaet, Krankheit, Odi};
use terminbuchung_service::config::SweepConfig;
use terminbuchung_service::{
    BookingConfig, BookingEnvironment, BookingService, CapacityResizer, KontrolleSweep, Notifier,
    RetryPolicy, SlotService,
};
use terminbuchung_testing::helpers;
use terminbuchung_testing::{InMemoryStore, ManualClock, RecordingConfirmationService, StaticEligibility};

/// Services wired to one in-memory store and a movable clock
pub struct Umgebung {
    pub store: InMemoryStore,
    pub clock: Arc<ManualClock>,
    pub eligibility: Arc<StaticEligibility>,
    pub benachrichtigungen: RecordingConfirmationService,
    pub booking: BookingService,
    pub slots: SlotService,
    pub resizer: CapacityResizer,
    pub sweep: KontrolleSweep,
    /// Seeded site with managed appointments
    pub odi: Odi,
}

impl Umgebung {
    /// Every priority unlocked, notifications succeed
    pub fn new() -> Self {
        Self::mit(StaticEligibility::all_unlocked(), RecordingConfirmationService::new())
    }

    pub fn mit(eligibility: StaticEligibility, benachrichtigungen: RecordingConfirmationService) -> Self {
        helpers::init_tracing();

        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(helpers::at(2026, 3, 1, 8, 0)));
        let eligibility = Arc::new(eligibility);
        let odi = helpers::impfzentrum();
        store.seed_odi(&odi);

        let config = BookingConfig::default();
        let notifier = Notifier::new(
            Arc::new(benachrichtigungen.clone()),
            RetryPolicy::new(2, Duration::from_millis(1)),
        );
        let env = BookingEnvironment::new(clock.clone(), eligibility.clone(), notifier, config.clone());
        let shared: Arc<dyn Store> = Arc::new(store.clone());

        Self {
            booking: BookingService::new(Arc::clone(&shared), env),
            slots: SlotService::new(Arc::clone(&shared), clock.clone(), config.clone()),
            resizer: CapacityResizer::new(Arc::clone(&shared)),
            sweep: KontrolleSweep::new(
                shared,
                DossierEnvironment::new(clock.clone(), eligibility.clone()),
                config,
                SweepConfig::default(),
            ),
            store,
            clock,
            eligibility,
            benachrichtigungen,
            odi,
        }
    }

    /// One 30-minute slot at the seeded site
    pub async fn slot(&self, krankheit: Krankheit, tag: NaiveDate, stunde: u32, kapazitaet: Kapazitaet) -> Impfslot {
        let von = NaiveTime::from_hms_opt(stunde, 0, 0).expect("valid hour");
        let bis = NaiveTime::from_hms_opt(stunde, 30, 0).expect("valid hour");
        self.slots
            .generate_slots(self.odi.id, krankheit, tag, von, bis, kapazitaet)
            .await
            .expect("slot generation succeeds")
            .pop()
            .expect("one slot generated")
    }

    /// Seed a dossier in `status`
    pub fn dossier(&self, krankheit: Krankheit, status: ImpfdossierStatus) -> Impfdossier {
        let dossier = helpers::dossier(krankheit, status);
        self.store.seed_dossier(&dossier);
        dossier
    }
}

pub fn tag(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, month, day).expect("valid date")
}

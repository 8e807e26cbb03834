//! Dossier status machine.
//!
//! Status changes are a transition table `(status, event) → status` evaluated against a
//! small set of guard predicates computed from the dossier's booking state. Every event
//! has its own transition function; [`naechster_status`] dispatches to them.
//!
//! The [`DossierReducer`] applies an action's data (controls, mementos, site choice) to
//! the dossier, evaluates the table and returns the notifications to send. Appointment
//! references are set and cleared by the allocator before the action is reduced, so the
//! guards always reflect the post-allocation booking state.

use crate::effect::Effect;
use crate::environment::{Clock, EligibilityEngine};
use crate::error::BookingError;
use crate::reducer::Reducer;
use crate::types::{
    AbgesagteTermine, ExternesZertifikat, Impfdossier, ImpfdossierStatus, Impffolge, Impfschutz,
    Impftermin, Kontrolle, Odi, TerminId,
};
use chrono::{DateTime, Utc};
use smallvec::{SmallVec, smallvec};
use std::collections::BTreeSet;
use std::sync::Arc;

use ImpfdossierStatus::{
    Abgeschlossen, AbgeschlossenOhneZweiteImpfung, Freigegeben, FreigegebenBooster, Gebucht,
    GebuchtBooster, Immunisiert, Impfung1Durchgefuehrt, Impfung1Kontrolliert,
    Impfung2Durchgefuehrt, Impfung2Kontrolliert, KontrolliertBooster, Neu, OdiGewaehlt,
    OdiGewaehltBooster,
};

// ============================================================================
// State, Environment, Actions
// ============================================================================

/// State reduced by the [`DossierReducer`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DossierState {
    /// The dossier
    pub dossier: Impfdossier,
    /// Loaded desired site, if any
    pub gewuenschter_odi: Option<Odi>,
    /// Appointments of the dossier that already have a vaccination
    pub geimpfte_termine: BTreeSet<TerminId>,
}

impl DossierState {
    /// Creates a new `DossierState` without administered vaccinations
    #[must_use]
    pub const fn new(dossier: Impfdossier, gewuenschter_odi: Option<Odi>) -> Self {
        Self {
            dossier,
            gewuenschter_odi,
            geimpfte_termine: BTreeSet::new(),
        }
    }

    /// Set the appointments that already have a vaccination
    #[must_use]
    pub fn with_geimpfte_termine(mut self, termine: impl IntoIterator<Item = TerminId>) -> Self {
        self.geimpfte_termine = termine.into_iter().collect();
        self
    }
}

/// Dependencies of the [`DossierReducer`]
#[derive(Clone)]
pub struct DossierEnvironment {
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Priority unlock rules
    pub eligibility: Arc<dyn EligibilityEngine>,
}

impl DossierEnvironment {
    /// Creates a new `DossierEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, eligibility: Arc<dyn EligibilityEngine>) -> Self {
        Self { clock, eligibility }
    }
}

/// Inputs to the dossier status machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DossierAction {
    /// The dossier's priority group may have been unlocked
    PrioritaetFreigegeben,
    /// A vaccination site was chosen
    OdiGewaehlt {
        /// Chosen site
        odi: Odi,
    },
    /// Eligibility snapshot was recomputed externally
    ImpfschutzAktualisiert {
        /// New snapshot
        impfschutz: Option<Impfschutz>,
    },
    /// Both grundimmunisierung appointments were booked
    GrundimmunisierungGebucht,
    /// Grundimmunisierung appointments were moved
    GrundimmunisierungUmgebucht,
    /// A booster appointment was booked
    BoosterGebucht {
        /// Booked appointment
        termin: Impftermin,
    },
    /// The booster appointment was moved
    BoosterUmgebucht {
        /// New appointment
        termin: Impftermin,
    },
    /// Grundimmunisierung appointments were released
    TermineAbgesagt {
        /// Cancellation memento
        abgesagt: AbgesagteTermine,
        /// First released appointment
        termin: Option<Impftermin>,
        /// Original time text of the released appointment
        original_zeit: String,
    },
    /// The booster appointment was released
    BoosterTerminAbgesagt {
        /// Cancellation memento
        abgesagt: AbgesagteTermine,
        /// Released appointment
        termin: Impftermin,
        /// Original time text of the released appointment
        original_zeit: String,
    },
    /// A control was recorded
    Kontrolliert {
        /// Dose the control belongs to
        impffolge: Impffolge,
        /// Booster entry number for booster controls
        impffolge_nr: Option<u32>,
        /// Control record
        kontrolle: Kontrolle,
    },
    /// The pending control became stale
    KontrolleAbgelaufen,
    /// A dose was administered
    Geimpft {
        /// Administered dose
        impffolge: Impffolge,
        /// Appointment the dose was given in
        termin_id: TerminId,
    },
    /// The grundimmunisierung was completed
    Abschliessen,
    /// The completed grundimmunisierung enters the booster cycle
    Immunisieren,
    /// The second dose was waived
    ZweiteImpfungVerzichtet,
    /// The waived second dose is taken after all
    ZweiteImpfungWahrgenommen,
    /// The most recent vaccination was deleted
    ImpfungGeloescht {
        /// Dose of the deleted vaccination
        impffolge: Impffolge,
        /// Appointment of the deleted vaccination
        termin_id: TerminId,
    },
    /// Externally documented vaccinations were recorded
    ExternesZertifikatErfasst {
        /// The certificate
        zertifikat: ExternesZertifikat,
    },
}

/// Event key of the transition table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ereignis {
    /// See [`DossierAction::PrioritaetFreigegeben`]
    PrioritaetFreigegeben,
    /// See [`DossierAction::OdiGewaehlt`]
    OdiGewaehlt,
    /// See [`DossierAction::ImpfschutzAktualisiert`]
    ImpfschutzAktualisiert,
    /// See [`DossierAction::GrundimmunisierungGebucht`]
    GrundimmunisierungGebucht,
    /// See [`DossierAction::GrundimmunisierungUmgebucht`]
    GrundimmunisierungUmgebucht,
    /// See [`DossierAction::BoosterGebucht`]
    BoosterGebucht,
    /// See [`DossierAction::BoosterUmgebucht`]
    BoosterUmgebucht,
    /// See [`DossierAction::TermineAbgesagt`]
    TermineAbgesagt,
    /// See [`DossierAction::BoosterTerminAbgesagt`]
    BoosterTerminAbgesagt,
    /// See [`DossierAction::Kontrolliert`]
    Kontrolliert(Impffolge),
    /// See [`DossierAction::KontrolleAbgelaufen`]
    KontrolleAbgelaufen,
    /// See [`DossierAction::Geimpft`]
    Geimpft(Impffolge),
    /// See [`DossierAction::Abschliessen`]
    Abschliessen,
    /// See [`DossierAction::Immunisieren`]
    Immunisieren,
    /// See [`DossierAction::ZweiteImpfungVerzichtet`]
    ZweiteImpfungVerzichtet,
    /// See [`DossierAction::ZweiteImpfungWahrgenommen`]
    ZweiteImpfungWahrgenommen,
    /// See [`DossierAction::ImpfungGeloescht`]
    ImpfungGeloescht(Impffolge),
    /// External certificate with complete grundimmunisierung
    ExternGrundimmunisiert,
    /// External certificate without complete grundimmunisierung
    ExternTeilweise,
}

impl DossierAction {
    /// Event key of the action
    #[must_use]
    pub const fn ereignis(&self) -> Ereignis {
        match self {
            Self::PrioritaetFreigegeben => Ereignis::PrioritaetFreigegeben,
            Self::OdiGewaehlt { .. } => Ereignis::OdiGewaehlt,
            Self::ImpfschutzAktualisiert { .. } => Ereignis::ImpfschutzAktualisiert,
            Self::GrundimmunisierungGebucht => Ereignis::GrundimmunisierungGebucht,
            Self::GrundimmunisierungUmgebucht => Ereignis::GrundimmunisierungUmgebucht,
            Self::BoosterGebucht { .. } => Ereignis::BoosterGebucht,
            Self::BoosterUmgebucht { .. } => Ereignis::BoosterUmgebucht,
            Self::TermineAbgesagt { .. } => Ereignis::TermineAbgesagt,
            Self::BoosterTerminAbgesagt { .. } => Ereignis::BoosterTerminAbgesagt,
            Self::Kontrolliert { impffolge, .. } => Ereignis::Kontrolliert(*impffolge),
            Self::KontrolleAbgelaufen => Ereignis::KontrolleAbgelaufen,
            Self::Geimpft { impffolge, .. } => Ereignis::Geimpft(*impffolge),
            Self::Abschliessen => Ereignis::Abschliessen,
            Self::Immunisieren => Ereignis::Immunisieren,
            Self::ZweiteImpfungVerzichtet => Ereignis::ZweiteImpfungVerzichtet,
            Self::ZweiteImpfungWahrgenommen => Ereignis::ZweiteImpfungWahrgenommen,
            Self::ImpfungGeloescht { impffolge, .. } => Ereignis::ImpfungGeloescht(*impffolge),
            Self::ExternesZertifikatErfasst { zertifikat } => {
                if zertifikat.grundimmunisiert {
                    Ereignis::ExternGrundimmunisiert
                } else {
                    Ereignis::ExternTeilweise
                }
            },
        }
    }

    /// Operation name used in error messages
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PrioritaetFreigegeben => "prioritaet_freigegeben",
            Self::OdiGewaehlt { .. } => "odi_gewaehlt",
            Self::ImpfschutzAktualisiert { .. } => "impfschutz_aktualisiert",
            Self::GrundimmunisierungGebucht => "grundimmunisierung_buchen",
            Self::GrundimmunisierungUmgebucht => "grundimmunisierung_umbuchen",
            Self::BoosterGebucht { .. } => "booster_buchen",
            Self::BoosterUmgebucht { .. } => "booster_umbuchen",
            Self::TermineAbgesagt { .. } => "termine_absagen",
            Self::BoosterTerminAbgesagt { .. } => "booster_termin_absagen",
            Self::Kontrolliert { .. } => "kontrolle_erfassen",
            Self::KontrolleAbgelaufen => "kontrolle_abgelaufen",
            Self::Geimpft { .. } => "impfung_erfassen",
            Self::Abschliessen => "abschliessen",
            Self::Immunisieren => "immunisieren",
            Self::ZweiteImpfungVerzichtet => "zweite_impfung_verzichten",
            Self::ZweiteImpfungWahrgenommen => "zweite_impfung_wahrnehmen",
            Self::ImpfungGeloescht { .. } => "impfung_loeschen",
            Self::ExternesZertifikatErfasst { .. } => "externes_zertifikat_erfassen",
        }
    }
}

// ============================================================================
// Guards
// ============================================================================

/// Predicates over the dossier's booking state that select between transitions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusGuards {
    /// A first or second grundimmunisierung appointment is booked
    pub hat_grund_termine: bool,
    /// The latest booster entry carries an appointment without a vaccination
    pub hat_booster_termin: bool,
    /// Booster entries exist
    pub hat_booster_eintraege: bool,
    /// The dossier's priority group is unlocked
    pub prioritaet_freigegeben: bool,
    /// The chosen site does not manage appointments
    pub odi_ohne_terminverwaltung: bool,
    /// The next booster's freigabe date has been reached
    pub booster_freigegeben: bool,
}

impl StatusGuards {
    /// Evaluate the guards for a dossier at `now`
    #[must_use]
    pub fn ermitteln(state: &DossierState, eligibility: &dyn EligibilityEngine, now: DateTime<Utc>) -> Self {
        let dossier = &state.dossier;
        Self {
            hat_grund_termine: dossier.hat_grund_termine(),
            hat_booster_termin: dossier
                .letzter_eintrag()
                .and_then(|eintrag| eintrag.impftermin)
                .is_some_and(|termin| !state.geimpfte_termine.contains(&termin)),
            hat_booster_eintraege: !dossier.eintraege.is_empty(),
            prioritaet_freigegeben: eligibility
                .is_prioritaet_freigegeben(dossier.krankheit, dossier.prioritaet),
            odi_ohne_terminverwaltung: state
                .gewuenschter_odi
                .as_ref()
                .is_some_and(|odi| !odi.terminverwaltung),
            booster_freigegeben: dossier
                .impfschutz
                .as_ref()
                .is_some_and(|schutz| schutz.is_freigegeben(now, dossier.buchung.selbstzahler)),
        }
    }
}

// ============================================================================
// Rollback rules
// ============================================================================

/// Status a grundimmunisierung dossier had before its first control
#[must_use]
pub const fn letzter_status_vor_kontrolle_1(guards: &StatusGuards) -> ImpfdossierStatus {
    if guards.hat_grund_termine {
        Gebucht
    } else if !guards.prioritaet_freigegeben {
        Neu
    } else if guards.odi_ohne_terminverwaltung {
        OdiGewaehlt
    } else {
        Freigegeben
    }
}

/// Status a grundimmunisierung dossier had before its second control
#[must_use]
pub const fn letzter_status_vor_kontrolle_2() -> ImpfdossierStatus {
    Impfung1Durchgefuehrt
}

/// Status a booster-cycle dossier had before its booster control
#[must_use]
pub const fn letzter_status_vor_kontrolle_booster(guards: &StatusGuards) -> ImpfdossierStatus {
    if guards.hat_booster_termin {
        GebuchtBooster
    } else if !guards.booster_freigegeben {
        Immunisiert
    } else if guards.odi_ohne_terminverwaltung {
        OdiGewaehltBooster
    } else {
        FreigegebenBooster
    }
}

// ============================================================================
// Transition table
// ============================================================================

/// Next status for `ereignis`, or `None` if the event is not allowed in `status`
#[must_use]
pub const fn naechster_status(
    status: ImpfdossierStatus,
    ereignis: Ereignis,
    guards: &StatusGuards,
) -> Option<ImpfdossierStatus> {
    match ereignis {
        Ereignis::PrioritaetFreigegeben => bei_prioritaet_freigegeben(status, guards),
        Ereignis::OdiGewaehlt => bei_odi_gewaehlt(status, guards),
        Ereignis::ImpfschutzAktualisiert => bei_impfschutz_aktualisiert(status, guards),
        Ereignis::GrundimmunisierungGebucht => bei_grundimmunisierung_gebucht(status),
        Ereignis::GrundimmunisierungUmgebucht => bei_grundimmunisierung_umgebucht(status),
        Ereignis::BoosterGebucht => bei_booster_gebucht(status),
        Ereignis::BoosterUmgebucht => bei_booster_umgebucht(status),
        Ereignis::TermineAbgesagt => bei_termine_abgesagt(status, guards),
        Ereignis::BoosterTerminAbgesagt => bei_booster_termin_abgesagt(status, guards),
        Ereignis::Kontrolliert(impffolge) => bei_kontrolliert(status, impffolge),
        Ereignis::KontrolleAbgelaufen => bei_kontrolle_abgelaufen(status, guards),
        Ereignis::Geimpft(impffolge) => bei_geimpft(status, impffolge),
        Ereignis::Abschliessen => bei_abschliessen(status),
        Ereignis::Immunisieren => bei_immunisieren(status),
        Ereignis::ZweiteImpfungVerzichtet => bei_zweite_impfung_verzichtet(status),
        Ereignis::ZweiteImpfungWahrgenommen => bei_zweite_impfung_wahrgenommen(status, guards),
        Ereignis::ImpfungGeloescht(impffolge) => bei_impfung_geloescht(status, impffolge, guards),
        Ereignis::ExternGrundimmunisiert => bei_extern_grundimmunisiert(status),
        Ereignis::ExternTeilweise => Some(status),
    }
}

/// Only `Neu` moves; every other status already passed the unlock.
const fn bei_prioritaet_freigegeben(
    status: ImpfdossierStatus,
    guards: &StatusGuards,
) -> Option<ImpfdossierStatus> {
    match status {
        Neu => Some(letzter_status_vor_kontrolle_1(guards)),
        _ => Some(status),
    }
}

const fn bei_odi_gewaehlt(status: ImpfdossierStatus, guards: &StatusGuards) -> Option<ImpfdossierStatus> {
    match status {
        Neu | Freigegeben | OdiGewaehlt => Some(letzter_status_vor_kontrolle_1(guards)),
        Immunisiert | FreigegebenBooster | OdiGewaehltBooster => {
            Some(letzter_status_vor_kontrolle_booster(guards))
        },
        // The site is stored for later; the booking keeps its status.
        Gebucht | GebuchtBooster => Some(status),
        _ => None,
    }
}

const fn bei_impfschutz_aktualisiert(
    status: ImpfdossierStatus,
    guards: &StatusGuards,
) -> Option<ImpfdossierStatus> {
    match status {
        Immunisiert | FreigegebenBooster | OdiGewaehltBooster => {
            Some(letzter_status_vor_kontrolle_booster(guards))
        },
        _ => Some(status),
    }
}

const fn bei_grundimmunisierung_gebucht(status: ImpfdossierStatus) -> Option<ImpfdossierStatus> {
    match status {
        Neu | Freigegeben | OdiGewaehlt => Some(Gebucht),
        _ => None,
    }
}

const fn bei_grundimmunisierung_umgebucht(status: ImpfdossierStatus) -> Option<ImpfdossierStatus> {
    match status {
        Gebucht | Impfung1Kontrolliert | Impfung1Durchgefuehrt | Impfung2Kontrolliert => Some(status),
        _ => None,
    }
}

const fn bei_booster_gebucht(status: ImpfdossierStatus) -> Option<ImpfdossierStatus> {
    match status {
        Immunisiert | FreigegebenBooster | OdiGewaehltBooster => Some(GebuchtBooster),
        GebuchtBooster | KontrolliertBooster => Some(status),
        _ => None,
    }
}

const fn bei_booster_umgebucht(status: ImpfdossierStatus) -> Option<ImpfdossierStatus> {
    match status {
        GebuchtBooster | KontrolliertBooster => Some(status),
        _ => None,
    }
}

const fn bei_termine_abgesagt(status: ImpfdossierStatus, guards: &StatusGuards) -> Option<ImpfdossierStatus> {
    match status {
        Gebucht | Impfung1Kontrolliert => Some(letzter_status_vor_kontrolle_1(guards)),
        Impfung1Durchgefuehrt | Impfung2Kontrolliert => Some(letzter_status_vor_kontrolle_2()),
        _ => None,
    }
}

const fn bei_booster_termin_abgesagt(
    status: ImpfdossierStatus,
    guards: &StatusGuards,
) -> Option<ImpfdossierStatus> {
    match status {
        GebuchtBooster | KontrolliertBooster => Some(letzter_status_vor_kontrolle_booster(guards)),
        _ => None,
    }
}

const fn bei_kontrolliert(status: ImpfdossierStatus, impffolge: Impffolge) -> Option<ImpfdossierStatus> {
    match (impffolge, status) {
        (
            Impffolge::ErsteImpfung,
            Neu | Freigegeben | OdiGewaehlt | Gebucht | Impfung1Kontrolliert,
        ) => Some(Impfung1Kontrolliert),
        (Impffolge::ZweiteImpfung, Impfung1Durchgefuehrt | Impfung2Kontrolliert) => {
            Some(Impfung2Kontrolliert)
        },
        (
            Impffolge::BoosterImpfung,
            Immunisiert | FreigegebenBooster | OdiGewaehltBooster | GebuchtBooster | KontrolliertBooster,
        ) => Some(KontrolliertBooster),
        _ => None,
    }
}

const fn bei_kontrolle_abgelaufen(
    status: ImpfdossierStatus,
    guards: &StatusGuards,
) -> Option<ImpfdossierStatus> {
    match status {
        Impfung1Kontrolliert => Some(letzter_status_vor_kontrolle_1(guards)),
        Impfung2Kontrolliert => Some(letzter_status_vor_kontrolle_2()),
        KontrolliertBooster => Some(letzter_status_vor_kontrolle_booster(guards)),
        _ => None,
    }
}

const fn bei_geimpft(status: ImpfdossierStatus, impffolge: Impffolge) -> Option<ImpfdossierStatus> {
    match (impffolge, status) {
        (Impffolge::ErsteImpfung, Impfung1Kontrolliert) => Some(Impfung1Durchgefuehrt),
        (Impffolge::ZweiteImpfung, Impfung2Kontrolliert) => Some(Impfung2Durchgefuehrt),
        (Impffolge::BoosterImpfung, KontrolliertBooster) => Some(Immunisiert),
        _ => None,
    }
}

const fn bei_abschliessen(status: ImpfdossierStatus) -> Option<ImpfdossierStatus> {
    match status {
        Impfung2Durchgefuehrt => Some(Abgeschlossen),
        _ => None,
    }
}

const fn bei_immunisieren(status: ImpfdossierStatus) -> Option<ImpfdossierStatus> {
    match status {
        Abgeschlossen | AbgeschlossenOhneZweiteImpfung => Some(Immunisiert),
        _ => None,
    }
}

const fn bei_zweite_impfung_verzichtet(status: ImpfdossierStatus) -> Option<ImpfdossierStatus> {
    match status {
        Impfung1Durchgefuehrt | Impfung2Kontrolliert => Some(AbgeschlossenOhneZweiteImpfung),
        _ => None,
    }
}

const fn bei_zweite_impfung_wahrgenommen(
    status: ImpfdossierStatus,
    guards: &StatusGuards,
) -> Option<ImpfdossierStatus> {
    match status {
        AbgeschlossenOhneZweiteImpfung if !guards.hat_booster_eintraege => Some(Impfung1Durchgefuehrt),
        _ => None,
    }
}

const fn bei_impfung_geloescht(
    status: ImpfdossierStatus,
    impffolge: Impffolge,
    guards: &StatusGuards,
) -> Option<ImpfdossierStatus> {
    match (impffolge, status) {
        (Impffolge::ErsteImpfung, Impfung1Durchgefuehrt | AbgeschlossenOhneZweiteImpfung) => {
            Some(letzter_status_vor_kontrolle_1(guards))
        },
        (Impffolge::ZweiteImpfung, Impfung2Durchgefuehrt | Abgeschlossen) => {
            Some(letzter_status_vor_kontrolle_2())
        },
        // Booster cycle entered, but no booster yet: the grund dose is still the latest.
        (Impffolge::ErsteImpfung, Immunisiert | FreigegebenBooster | OdiGewaehltBooster)
            if !guards.hat_booster_eintraege =>
        {
            Some(letzter_status_vor_kontrolle_1(guards))
        },
        (Impffolge::ZweiteImpfung, Immunisiert | FreigegebenBooster | OdiGewaehltBooster)
            if !guards.hat_booster_eintraege =>
        {
            Some(letzter_status_vor_kontrolle_2())
        },
        (
            Impffolge::BoosterImpfung,
            Immunisiert | FreigegebenBooster | OdiGewaehltBooster | GebuchtBooster,
        ) => Some(letzter_status_vor_kontrolle_booster(guards)),
        _ => None,
    }
}

const fn bei_extern_grundimmunisiert(status: ImpfdossierStatus) -> Option<ImpfdossierStatus> {
    match status {
        Neu | Freigegeben | OdiGewaehlt | Gebucht => Some(Immunisiert),
        _ if status.is_booster_status() => Some(status),
        _ => None,
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer driving [`Impfdossier`] status changes
#[derive(Clone, Copy, Debug, Default)]
pub struct DossierReducer;

impl DossierReducer {
    /// Creates a new `DossierReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Apply the action's payload to the dossier before the guards are evaluated.
    fn daten_uebernehmen(state: &mut DossierState, action: &DossierAction) -> Result<(), BookingError> {
        let dossier = &mut state.dossier;
        match action {
            DossierAction::OdiGewaehlt { odi } => {
                dossier.buchung.gewuenschter_odi = Some(odi.id);
                state.gewuenschter_odi = Some(odi.clone());
            },
            DossierAction::ImpfschutzAktualisiert { impfschutz } => {
                dossier.impfschutz.clone_from(impfschutz);
            },
            DossierAction::TermineAbgesagt { abgesagt, .. }
            | DossierAction::BoosterTerminAbgesagt { abgesagt, .. } => {
                dossier.buchung.abgesagte_termine = Some(abgesagt.clone());
            },
            DossierAction::Kontrolliert {
                impffolge,
                impffolge_nr,
                kontrolle,
            } => match impffolge {
                Impffolge::ErsteImpfung => dossier.kontrolle1 = Some(kontrolle.clone()),
                Impffolge::ZweiteImpfung => dossier.kontrolle2 = Some(kontrolle.clone()),
                Impffolge::BoosterImpfung => {
                    let nr = impffolge_nr.ok_or_else(|| {
                        BookingError::IllegalState("booster control without entry number".to_string())
                    })?;
                    dossier.eintrag_anlegen(nr).kontrolle = Some(kontrolle.clone());
                },
            },
            DossierAction::KontrolleAbgelaufen => Self::kontrolle_entfernen(dossier),
            DossierAction::Geimpft { termin_id, .. } => {
                state.geimpfte_termine.insert(*termin_id);
            },
            DossierAction::ImpfungGeloescht { impffolge, termin_id } => {
                state.geimpfte_termine.remove(termin_id);
                match impffolge {
                    Impffolge::ErsteImpfung => dossier.kontrolle1 = None,
                    Impffolge::ZweiteImpfung => dossier.kontrolle2 = None,
                    Impffolge::BoosterImpfung => Self::booster_kontrolle_entfernen(dossier),
                }
            },
            DossierAction::ExternesZertifikatErfasst { zertifikat } => {
                dossier.externes_zertifikat = Some(zertifikat.clone());
            },
            _ => {},
        }
        Ok(())
    }

    fn kontrolle_entfernen(dossier: &mut Impfdossier) {
        match dossier.status {
            Impfung1Kontrolliert => dossier.kontrolle1 = None,
            Impfung2Kontrolliert => dossier.kontrolle2 = None,
            KontrolliertBooster => Self::booster_kontrolle_entfernen(dossier),
            _ => {},
        }
    }

    fn booster_kontrolle_entfernen(dossier: &mut Impfdossier) {
        if let Some(nr) = dossier.letzter_eintrag().map(|e| e.impffolge_nr) {
            if let Some(eintrag) = dossier.eintrag_mut(nr) {
                eintrag.kontrolle = None;
            }
        }
    }

    fn effects(action: DossierAction) -> SmallVec<[Effect; 4]> {
        match action {
            DossierAction::GrundimmunisierungGebucht | DossierAction::GrundimmunisierungUmgebucht => {
                smallvec![Effect::BookingConfirmation {
                    booster_termin: None
                }]
            },
            DossierAction::BoosterGebucht { termin } | DossierAction::BoosterUmgebucht { termin } => {
                smallvec![Effect::BookingConfirmation {
                    booster_termin: Some(termin)
                }]
            },
            DossierAction::TermineAbgesagt {
                termin,
                original_zeit,
                ..
            } => smallvec![Effect::Cancellation {
                termin,
                original_zeit
            }],
            DossierAction::BoosterTerminAbgesagt {
                termin,
                original_zeit,
                ..
            } => smallvec![Effect::Cancellation {
                termin: Some(termin),
                original_zeit
            }],
            _ => SmallVec::new(),
        }
    }
}

/// Actions after which the registry must receive the dossier again
const fn betrifft_register(ereignis: Ereignis) -> bool {
    matches!(
        ereignis,
        Ereignis::GrundimmunisierungGebucht
            | Ereignis::GrundimmunisierungUmgebucht
            | Ereignis::BoosterGebucht
            | Ereignis::BoosterUmgebucht
            | Ereignis::TermineAbgesagt
            | Ereignis::BoosterTerminAbgesagt
            | Ereignis::Geimpft(_)
            | Ereignis::ImpfungGeloescht(_)
            | Ereignis::ExternGrundimmunisiert
            | Ereignis::ExternTeilweise
    )
}

impl Reducer for DossierReducer {
    type State = DossierState;
    type Action = DossierAction;
    type Environment = DossierEnvironment;
    type Error = BookingError;

    fn reduce(
        &self,
        state: &mut DossierState,
        action: DossierAction,
        env: &DossierEnvironment,
    ) -> Result<SmallVec<[Effect; 4]>, BookingError> {
        let ereignis = action.ereignis();
        let von = state.dossier.status;

        let mut next = state.clone();
        Self::daten_uebernehmen(&mut next, &action)?;
        let guards = StatusGuards::ermitteln(&next, env.eligibility.as_ref(), env.clock.now());

        let Some(nach) = naechster_status(von, ereignis, &guards) else {
            tracing::debug!(
                dossier_id = %state.dossier.id,
                status = %von,
                ereignis = ?ereignis,
                "Transition rejected"
            );
            return Err(BookingError::WrongDossierStatus {
                dossier_id: state.dossier.id,
                status: von,
                operation: action.name(),
            });
        };

        next.dossier.status = nach;
        if betrifft_register(ereignis) {
            next.dossier.timestamp_sent_to_registry = None;
        }
        *state = next;

        if von != nach {
            tracing::debug!(
                dossier_id = %state.dossier.id,
                von = %von,
                nach = %nach,
                ereignis = ?ereignis,
                "Dossier status changed"
            );
        }

        Ok(Self::effects(action))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Krankheit, Prioritaet, Registrierungsnummer, TerminId};
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    struct Unlocked(bool);

    impl EligibilityEngine for Unlocked {
        fn is_prioritaet_freigegeben(&self, _: Krankheit, _: Prioritaet) -> bool {
            self.0
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap()
    }

    fn env(unlocked: bool) -> DossierEnvironment {
        DossierEnvironment::new(Arc::new(FixedClock(now())), Arc::new(Unlocked(unlocked)))
    }

    fn dossier(status: ImpfdossierStatus) -> DossierState {
        let mut dossier = Impfdossier::new(
            Registrierungsnummer::new("REG001"),
            Krankheit::Covid,
            Prioritaet::new('B'),
        );
        dossier.status = status;
        DossierState::new(dossier, None)
    }

    fn guards() -> StatusGuards {
        StatusGuards::default()
    }

    #[test]
    fn rollback_rule_one_covers_all_booking_states() {
        let mut g = guards();
        assert_eq!(letzter_status_vor_kontrolle_1(&g), Neu);

        g.prioritaet_freigegeben = true;
        assert_eq!(letzter_status_vor_kontrolle_1(&g), Freigegeben);

        g.odi_ohne_terminverwaltung = true;
        assert_eq!(letzter_status_vor_kontrolle_1(&g), OdiGewaehlt);

        g.hat_grund_termine = true;
        assert_eq!(letzter_status_vor_kontrolle_1(&g), Gebucht);
    }

    #[test]
    fn booster_rollback_requires_freigabe() {
        let mut g = guards();
        g.odi_ohne_terminverwaltung = true;
        assert_eq!(letzter_status_vor_kontrolle_booster(&g), Immunisiert);

        g.booster_freigegeben = true;
        assert_eq!(letzter_status_vor_kontrolle_booster(&g), OdiGewaehltBooster);

        g.hat_booster_termin = true;
        assert_eq!(letzter_status_vor_kontrolle_booster(&g), GebuchtBooster);
    }

    #[test]
    fn booking_grundimmunisierung_only_from_early_states() {
        for status in [Neu, Freigegeben, OdiGewaehlt] {
            assert_eq!(
                naechster_status(status, Ereignis::GrundimmunisierungGebucht, &guards()),
                Some(Gebucht)
            );
        }
        assert_eq!(
            naechster_status(Impfung1Durchgefuehrt, Ereignis::GrundimmunisierungGebucht, &guards()),
            None
        );
    }

    #[test]
    fn rebooking_a_controlled_booster_keeps_status() {
        assert_eq!(
            naechster_status(KontrolliertBooster, Ereignis::BoosterGebucht, &guards()),
            Some(KontrolliertBooster)
        );
        assert_eq!(
            naechster_status(FreigegebenBooster, Ereignis::BoosterGebucht, &guards()),
            Some(GebuchtBooster)
        );
    }

    #[test]
    fn cancelling_after_first_dose_keeps_first_dose() {
        assert_eq!(
            naechster_status(Impfung2Kontrolliert, Ereignis::TermineAbgesagt, &guards()),
            Some(Impfung1Durchgefuehrt)
        );
    }

    #[test]
    fn taking_second_dose_after_all_requires_no_booster() {
        let mut g = guards();
        assert_eq!(
            naechster_status(AbgeschlossenOhneZweiteImpfung, Ereignis::ZweiteImpfungWahrgenommen, &g),
            Some(Impfung1Durchgefuehrt)
        );
        g.hat_booster_eintraege = true;
        assert_eq!(
            naechster_status(AbgeschlossenOhneZweiteImpfung, Ereignis::ZweiteImpfungWahrgenommen, &g),
            None
        );
    }

    #[test]
    fn grund_dose_deletable_in_booster_cycle_until_first_booster() {
        let mut g = guards();
        for status in [Immunisiert, FreigegebenBooster, OdiGewaehltBooster] {
            assert_eq!(
                naechster_status(status, Ereignis::ImpfungGeloescht(Impffolge::ZweiteImpfung), &g),
                Some(Impfung1Durchgefuehrt)
            );
        }
        g.hat_grund_termine = true;
        assert_eq!(
            naechster_status(Immunisiert, Ereignis::ImpfungGeloescht(Impffolge::ErsteImpfung), &g),
            Some(Gebucht)
        );

        g.hat_booster_eintraege = true;
        assert_eq!(
            naechster_status(Immunisiert, Ereignis::ImpfungGeloescht(Impffolge::ZweiteImpfung), &g),
            None
        );
        assert_eq!(
            naechster_status(FreigegebenBooster, Ereignis::ImpfungGeloescht(Impffolge::ErsteImpfung), &g),
            None
        );
    }

    #[test]
    fn booking_emits_confirmation_and_flags_registry() {
        let mut state = dossier(Freigegeben);
        state.dossier.timestamp_sent_to_registry = Some(now());
        state.dossier.buchung.impftermin1 = Some(TerminId::new());
        state.dossier.buchung.impftermin2 = Some(TerminId::new());

        let effects = DossierReducer
            .reduce(&mut state, DossierAction::GrundimmunisierungGebucht, &env(true))
            .unwrap();

        assert_eq!(state.dossier.status, Gebucht);
        assert_eq!(state.dossier.timestamp_sent_to_registry, None);
        assert_eq!(
            effects.as_slice(),
            &[Effect::BookingConfirmation {
                booster_termin: None
            }]
        );
    }

    #[test]
    fn rejected_action_leaves_state_untouched() {
        let mut state = dossier(Neu);
        let before = state.clone();

        let result = DossierReducer.reduce(&mut state, DossierAction::Abschliessen, &env(true));

        assert!(matches!(
            result,
            Err(BookingError::WrongDossierStatus { status: Neu, .. })
        ));
        assert_eq!(state, before);
    }

    #[test]
    fn choosing_unmanaged_site_moves_to_odi_gewaehlt() {
        let mut state = dossier(Freigegeben);
        let odi = Odi::new("Hausarztpraxis", false);

        DossierReducer
            .reduce(&mut state, DossierAction::OdiGewaehlt { odi: odi.clone() }, &env(true))
            .unwrap();

        assert_eq!(state.dossier.status, OdiGewaehlt);
        assert_eq!(state.dossier.buchung.gewuenschter_odi, Some(odi.id));
    }

    #[test]
    fn administered_booster_does_not_count_as_booked() {
        let termin = TerminId::new();
        let mut state = dossier(Immunisiert);
        state.dossier.eintrag_anlegen(1).impftermin = Some(termin);
        let mut state = state.with_geimpfte_termine([termin]);
        let impfschutz = Impfschutz {
            freigegeben_naechste_impfung_ab: Some(now() - chrono::Duration::days(1)),
            freigegeben_ab_selbstzahler: None,
        };

        DossierReducer
            .reduce(
                &mut state,
                DossierAction::ImpfschutzAktualisiert {
                    impfschutz: Some(impfschutz),
                },
                &env(true),
            )
            .unwrap();

        assert_eq!(state.dossier.status, FreigegebenBooster);
    }

    #[test]
    fn deleting_a_vaccination_forgets_its_appointment() {
        let termin = TerminId::new();
        let mut state = dossier(Impfung1Durchgefuehrt).with_geimpfte_termine([termin]);
        state.dossier.buchung.impftermin1 = Some(termin);

        DossierReducer
            .reduce(
                &mut state,
                DossierAction::ImpfungGeloescht {
                    impffolge: Impffolge::ErsteImpfung,
                    termin_id: termin,
                },
                &env(true),
            )
            .unwrap();

        assert!(state.geimpfte_termine.is_empty());
    }

    #[test]
    fn expired_first_control_is_cleared() {
        let mut state = dossier(Impfung1Kontrolliert);
        state.dossier.kontrolle1 = Some(Kontrolle {
            timestamp: now(),
            odi_id: crate::types::OdiId::new(),
        });

        DossierReducer
            .reduce(&mut state, DossierAction::KontrolleAbgelaufen, &env(false))
            .unwrap();

        assert_eq!(state.dossier.status, Neu);
        assert_eq!(state.dossier.kontrolle1, None);
    }
}

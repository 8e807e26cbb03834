//! Domain types for vaccination appointment booking.
//!
//! Slots ([`Impfslot`]) own a time window at a vaccination site with one capacity counter
//! per dose sequence. Each unit of capacity is backed by exactly one physical appointment
//! ([`Impftermin`]). A person's case for one disease is an [`Impfdossier`]; it references
//! booked appointments through its [`Buchung`] (first/second dose) and through its ordered
//! booster entries ([`Impfdossiereintrag`]).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create the identifier from a `Uuid`
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an [`Impfslot`]
    SlotId
);
uuid_id!(
    /// Identifier of an [`Impftermin`]
    TerminId
);
uuid_id!(
    /// Identifier of an [`Impfdossier`]
    DossierId
);
uuid_id!(
    /// Identifier of an [`Impfdossiereintrag`]
    EintragId
);
uuid_id!(
    /// Identifier of a vaccination site ([`Odi`])
    OdiId
);
uuid_id!(
    /// Identifier of an administered vaccination ([`Impfung`])
    ImpfungId
);

/// Public registration code of a person (one registration, one dossier per disease)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Registrierungsnummer(String);

impl Registrierungsnummer {
    /// Creates a new `Registrierungsnummer`
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the code as a string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Registrierungsnummer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Eligibility priority group of a person (`A` is vaccinated first)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Prioritaet(char);

impl Prioritaet {
    /// Creates a new `Prioritaet`
    #[must_use]
    pub const fn new(value: char) -> Self {
        Self(value)
    }

    /// Returns the priority letter
    #[must_use]
    pub const fn as_char(&self) -> char {
        self.0
    }
}

impl fmt::Display for Prioritaet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Disease a dossier and a slot belong to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Krankheit {
    /// Classic two-dose grundimmunisierung followed by boosters
    Covid,
    /// Booster-only: every dose is a booster entry
    Affenpocken,
    /// Booster-only: every dose is a booster entry
    Fsme,
}

impl Krankheit {
    /// Whether the first two doses are booked through the dossier's [`Buchung`].
    ///
    /// Booster-only diseases record every dose as an [`Impfdossiereintrag`].
    #[must_use]
    pub const fn hat_grundimmunisierung(self) -> bool {
        matches!(self, Self::Covid)
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Covid => "COVID",
            Self::Affenpocken => "AFFENPOCKEN",
            Self::Fsme => "FSME",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COVID" => Some(Self::Covid),
            "AFFENPOCKEN" => Some(Self::Affenpocken),
            "FSME" => Some(Self::Fsme),
            _ => None,
        }
    }
}

impl fmt::Display for Krankheit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dose-sequence tag of an appointment
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Impffolge {
    /// First grundimmunisierung dose
    ErsteImpfung,
    /// Second grundimmunisierung dose
    ZweiteImpfung,
    /// Any booster dose
    BoosterImpfung,
}

impl Impffolge {
    /// All dose-sequence tags in capacity order
    pub const ALL: [Self; 3] = [Self::ErsteImpfung, Self::ZweiteImpfung, Self::BoosterImpfung];

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ErsteImpfung => "ERSTE_IMPFUNG",
            Self::ZweiteImpfung => "ZWEITE_IMPFUNG",
            Self::BoosterImpfung => "BOOSTER_IMPFUNG",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ERSTE_IMPFUNG" => Some(Self::ErsteImpfung),
            "ZWEITE_IMPFUNG" => Some(Self::ZweiteImpfung),
            "BOOSTER_IMPFUNG" => Some(Self::BoosterImpfung),
            _ => None,
        }
    }
}

impl fmt::Display for Impffolge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an [`Impfdossier`]
///
/// Two families: the grundimmunisierung path (`Neu` … `Abgeschlossen*`) and the booster
/// cycle (`Immunisiert` → … → `KontrolliertBooster` → `Immunisiert`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImpfdossierStatus {
    /// Registered, priority not yet unlocked
    Neu,
    /// Priority unlocked, nothing booked
    Freigegeben,
    /// Site without managed schedule chosen
    OdiGewaehlt,
    /// Both grundimmunisierung appointments booked
    Gebucht,
    /// First dose controlled
    Impfung1Kontrolliert,
    /// First dose administered
    Impfung1Durchgefuehrt,
    /// Second dose controlled
    Impfung2Kontrolliert,
    /// Second dose administered
    Impfung2Durchgefuehrt,
    /// Grundimmunisierung complete
    Abgeschlossen,
    /// Grundimmunisierung complete, second dose waived
    AbgeschlossenOhneZweiteImpfung,
    /// Immunised, waiting for the next booster freigabe
    Immunisiert,
    /// Eligible for the next booster
    FreigegebenBooster,
    /// Site without managed schedule chosen for the booster
    OdiGewaehltBooster,
    /// Booster appointment booked
    GebuchtBooster,
    /// Booster dose controlled
    KontrolliertBooster,
}

impl ImpfdossierStatus {
    /// Whether a completed control is pending vaccination
    #[must_use]
    pub const fn is_kontrolliert(self) -> bool {
        matches!(
            self,
            Self::Impfung1Kontrolliert | Self::Impfung2Kontrolliert | Self::KontrolliertBooster
        )
    }

    /// Whether the status belongs to the booster cycle
    #[must_use]
    pub const fn is_booster_status(self) -> bool {
        matches!(
            self,
            Self::Immunisiert
                | Self::FreigegebenBooster
                | Self::OdiGewaehltBooster
                | Self::GebuchtBooster
                | Self::KontrolliertBooster
        )
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Neu => "NEU",
            Self::Freigegeben => "FREIGEGEBEN",
            Self::OdiGewaehlt => "ODI_GEWAEHLT",
            Self::Gebucht => "GEBUCHT",
            Self::Impfung1Kontrolliert => "IMPFUNG_1_KONTROLLIERT",
            Self::Impfung1Durchgefuehrt => "IMPFUNG_1_DURCHGEFUEHRT",
            Self::Impfung2Kontrolliert => "IMPFUNG_2_KONTROLLIERT",
            Self::Impfung2Durchgefuehrt => "IMPFUNG_2_DURCHGEFUEHRT",
            Self::Abgeschlossen => "ABGESCHLOSSEN",
            Self::AbgeschlossenOhneZweiteImpfung => "ABGESCHLOSSEN_OHNE_ZWEITE_IMPFUNG",
            Self::Immunisiert => "IMMUNISIERT",
            Self::FreigegebenBooster => "FREIGEGEBEN_BOOSTER",
            Self::OdiGewaehltBooster => "ODI_GEWAEHLT_BOOSTER",
            Self::GebuchtBooster => "GEBUCHT_BOOSTER",
            Self::KontrolliertBooster => "KONTROLLIERT_BOOSTER",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "NEU" => Self::Neu,
            "FREIGEGEBEN" => Self::Freigegeben,
            "ODI_GEWAEHLT" => Self::OdiGewaehlt,
            "GEBUCHT" => Self::Gebucht,
            "IMPFUNG_1_KONTROLLIERT" => Self::Impfung1Kontrolliert,
            "IMPFUNG_1_DURCHGEFUEHRT" => Self::Impfung1Durchgefuehrt,
            "IMPFUNG_2_KONTROLLIERT" => Self::Impfung2Kontrolliert,
            "IMPFUNG_2_DURCHGEFUEHRT" => Self::Impfung2Durchgefuehrt,
            "ABGESCHLOSSEN" => Self::Abgeschlossen,
            "ABGESCHLOSSEN_OHNE_ZWEITE_IMPFUNG" => Self::AbgeschlossenOhneZweiteImpfung,
            "IMMUNISIERT" => Self::Immunisiert,
            "FREIGEGEBEN_BOOSTER" => Self::FreigegebenBooster,
            "ODI_GEWAEHLT_BOOSTER" => Self::OdiGewaehltBooster,
            "GEBUCHT_BOOSTER" => Self::GebuchtBooster,
            "KONTROLLIERT_BOOSTER" => Self::KontrolliertBooster,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for ImpfdossierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Value Objects
// ============================================================================

/// Half-open time window `[von, bis)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Zeitfenster {
    /// Start (inclusive)
    pub von: DateTime<Utc>,
    /// End (exclusive)
    pub bis: DateTime<Utc>,
}

impl Zeitfenster {
    /// Creates a new `Zeitfenster`
    #[must_use]
    pub const fn new(von: DateTime<Utc>, bis: DateTime<Utc>) -> Self {
        Self { von, bis }
    }

    /// The slot-grid window of length `dauer` that contains `zeitpunkt`.
    ///
    /// Windows are aligned to multiples of `dauer` since the epoch, so a half-hour grid
    /// yields `:00`/`:30` boundaries.
    #[must_use]
    pub fn ausgerichtet(zeitpunkt: DateTime<Utc>, dauer: Duration) -> Self {
        let sekunden = dauer.num_seconds().max(1);
        let start = zeitpunkt.timestamp() - zeitpunkt.timestamp().rem_euclid(sekunden);
        let von = DateTime::from_timestamp(start, 0).unwrap_or(zeitpunkt);
        Self::new(von, von + Duration::seconds(sekunden))
    }

    /// Whether `zeitpunkt` lies inside the window
    #[must_use]
    pub fn enthaelt(&self, zeitpunkt: DateTime<Utc>) -> bool {
        self.von <= zeitpunkt && zeitpunkt < self.bis
    }

    /// Time text used in confirmation and cancellation messages
    #[must_use]
    pub fn anzeige_text(&self) -> String {
        format!("{} - {}", self.von.format("%d.%m.%Y %H:%M"), self.bis.format("%H:%M"))
    }
}

impl fmt::Display for Zeitfenster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.anzeige_text())
    }
}

/// Per-dose-type capacity of a slot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Kapazitaet {
    /// First-dose capacity
    pub erste_impfung: u32,
    /// Second-dose capacity
    pub zweite_impfung: u32,
    /// Booster capacity
    pub booster: u32,
}

impl Kapazitaet {
    /// Creates a new `Kapazitaet`
    #[must_use]
    pub const fn new(erste_impfung: u32, zweite_impfung: u32, booster: u32) -> Self {
        Self {
            erste_impfung,
            zweite_impfung,
            booster,
        }
    }

    /// Capacity for one dose type
    #[must_use]
    pub const fn get(&self, impffolge: Impffolge) -> u32 {
        match impffolge {
            Impffolge::ErsteImpfung => self.erste_impfung,
            Impffolge::ZweiteImpfung => self.zweite_impfung,
            Impffolge::BoosterImpfung => self.booster,
        }
    }

    /// Set the capacity for one dose type
    pub fn set(&mut self, impffolge: Impffolge, wert: u32) {
        match impffolge {
            Impffolge::ErsteImpfung => self.erste_impfung = wert,
            Impffolge::ZweiteImpfung => self.zweite_impfung = wert,
            Impffolge::BoosterImpfung => self.booster = wert,
        }
    }
}

impl fmt::Display for Kapazitaet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.erste_impfung, self.zweite_impfung, self.booster)
    }
}

/// Lower bound for an active reservation: reservations taken before it count as free.
#[must_use]
pub fn reservation_cutoff(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now - ttl
}

// ============================================================================
// Entities
// ============================================================================

/// Vaccination site (Ort der Impfung)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Odi {
    /// Unique site identifier
    pub id: OdiId,
    /// Display name
    pub name: String,
    /// Whether the site books appointments through slots
    pub terminverwaltung: bool,
}

impl Odi {
    /// Creates a new `Odi`
    #[must_use]
    pub fn new(name: impl Into<String>, terminverwaltung: bool) -> Self {
        Self {
            id: OdiId::new(),
            name: name.into(),
            terminverwaltung,
        }
    }
}

/// Time window × site × disease with per-dose-type capacity.
///
/// The number of [`Impftermin`] rows per dose type always equals the matching capacity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impfslot {
    /// Unique slot identifier
    pub id: SlotId,
    /// Disease the slot serves
    pub krankheit: Krankheit,
    /// Site the slot belongs to
    pub odi_id: OdiId,
    /// Time window
    pub zeitfenster: Zeitfenster,
    /// Denormalized capacity counters
    pub kapazitaet: Kapazitaet,
    /// Optimistic lock version
    pub version: i64,
}

impl Impfslot {
    /// Creates a new `Impfslot` (without appointments)
    #[must_use]
    pub fn new(
        krankheit: Krankheit,
        odi_id: OdiId,
        zeitfenster: Zeitfenster,
        kapazitaet: Kapazitaet,
    ) -> Self {
        Self {
            id: SlotId::new(),
            krankheit,
            odi_id,
            zeitfenster,
            kapazitaet,
            version: 0,
        }
    }
}

/// One bookable unit within a slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impftermin {
    /// Unique appointment identifier
    pub id: TerminId,
    /// Owning slot
    pub slot_id: SlotId,
    /// Dose-sequence tag
    pub impffolge: Impffolge,
    /// Hard-assigned to a dossier
    pub gebucht: bool,
    /// Registration holding a soft reservation
    pub reserviert_fuer: Option<Registrierungsnummer>,
    /// When the soft reservation was taken
    pub timestamp_reserviert: Option<DateTime<Utc>>,
    /// Optimistic lock version
    pub version: i64,
}

impl Impftermin {
    /// Creates a new free `Impftermin`
    #[must_use]
    pub fn new(slot_id: SlotId, impffolge: Impffolge) -> Self {
        Self {
            id: TerminId::new(),
            slot_id,
            impffolge,
            gebucht: false,
            reserviert_fuer: None,
            timestamp_reserviert: None,
            version: 0,
        }
    }

    fn reservation_aktiv(&self, cutoff: DateTime<Utc>) -> bool {
        self.reserviert_fuer.is_some()
            && self.timestamp_reserviert.is_some_and(|reserviert| reserviert >= cutoff)
    }

    /// Free: not booked and not held by a reservation newer than `cutoff`.
    #[must_use]
    pub fn is_frei(&self, cutoff: DateTime<Utc>) -> bool {
        !self.gebucht && !self.reservation_aktiv(cutoff)
    }

    /// Soft-held for `registrierung` by a reservation newer than `cutoff`.
    #[must_use]
    pub fn is_reserviert_fuer(&self, registrierung: &Registrierungsnummer, cutoff: DateTime<Utc>) -> bool {
        !self.gebucht
            && self.reserviert_fuer.as_ref() == Some(registrierung)
            && self.reservation_aktiv(cutoff)
    }

    /// Clear booking and reservation markers
    pub fn freigeben(&mut self) {
        self.gebucht = false;
        self.reserviert_fuer = None;
        self.timestamp_reserviert = None;
    }
}

/// Memento of the last cancelled appointments, used for the cancellation message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbgesagteTermine {
    /// Site of the cancelled appointments
    pub odi_id: Option<OdiId>,
    /// Original time text of the first-dose appointment
    pub termin1: Option<String>,
    /// Original time text of the second-dose appointment
    pub termin2: Option<String>,
    /// Original time text of the booster appointment
    pub termin_booster: Option<String>,
}

/// Booking state embedded in the dossier
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buchung {
    /// Desired vaccination site
    pub gewuenschter_odi: Option<OdiId>,
    /// Booked first-dose appointment
    pub impftermin1: Option<TerminId>,
    /// Booked second-dose appointment
    pub impftermin2: Option<TerminId>,
    /// Person pays for the dose themselves
    pub selbstzahler: bool,
    /// Last cancelled appointments
    pub abgesagte_termine: Option<AbgesagteTermine>,
}

/// Completed pre-vaccination control
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kontrolle {
    /// When the control was recorded
    pub timestamp: DateTime<Utc>,
    /// Site where the control happened
    pub odi_id: OdiId,
}

/// Record of the Nth booster dose
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impfdossiereintrag {
    /// Unique entry identifier
    pub id: EintragId,
    /// Booster sequence number (1-based)
    pub impffolge_nr: u32,
    /// Booked booster appointment
    pub impftermin: Option<TerminId>,
    /// Control for this booster
    pub kontrolle: Option<Kontrolle>,
}

impl Impfdossiereintrag {
    /// Creates a new empty `Impfdossiereintrag`
    #[must_use]
    pub fn new(impffolge_nr: u32) -> Self {
        Self {
            id: EintragId::new(),
            impffolge_nr,
            impftermin: None,
            kontrolle: None,
        }
    }
}

/// Externally computed eligibility snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impfschutz {
    /// Eligible for the next dose from this moment
    pub freigegeben_naechste_impfung_ab: Option<DateTime<Utc>>,
    /// Eligible from this moment when paying oneself
    pub freigegeben_ab_selbstzahler: Option<DateTime<Utc>>,
}

impl Impfschutz {
    /// Whether the freigabe date applicable to the payer model has been reached
    #[must_use]
    pub fn is_freigegeben(&self, now: DateTime<Utc>, selbstzahler: bool) -> bool {
        let ab = if selbstzahler {
            self.freigegeben_ab_selbstzahler.or(self.freigegeben_naechste_impfung_ab)
        } else {
            self.freigegeben_naechste_impfung_ab
        };
        ab.is_some_and(|ab| ab <= now)
    }
}

/// Vaccinations documented outside the system
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternesZertifikat {
    /// Number of doses received externally
    pub anzahl_impfungen: u32,
    /// Date of the most recent external dose
    pub letzte_impfung: Option<DateTime<Utc>>,
    /// External doses amount to a complete grundimmunisierung
    pub grundimmunisiert: bool,
}

/// A person's vaccination case for one disease
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impfdossier {
    /// Unique dossier identifier
    pub id: DossierId,
    /// Registration the dossier belongs to
    pub registrierungsnummer: Registrierungsnummer,
    /// Disease of this dossier
    pub krankheit: Krankheit,
    /// Eligibility priority group
    pub prioritaet: Prioritaet,
    /// State-machine value
    pub status: ImpfdossierStatus,
    /// Grundimmunisierung booking
    pub buchung: Buchung,
    /// Control of the first dose
    pub kontrolle1: Option<Kontrolle>,
    /// Control of the second dose
    pub kontrolle2: Option<Kontrolle>,
    /// Booster entries ordered by `impffolge_nr`
    pub eintraege: Vec<Impfdossiereintrag>,
    /// Externally computed eligibility
    pub impfschutz: Option<Impfschutz>,
    /// External pre-immunisation
    pub externes_zertifikat: Option<ExternesZertifikat>,
    /// Last transfer to the registry; `None` flags a resend
    pub timestamp_sent_to_registry: Option<DateTime<Utc>>,
    /// Optimistic lock version
    pub version: i64,
}

impl Impfdossier {
    /// Creates a new `Impfdossier`.
    ///
    /// Booster-only diseases start in the booster cycle (`Immunisiert`).
    #[must_use]
    pub fn new(
        registrierungsnummer: Registrierungsnummer,
        krankheit: Krankheit,
        prioritaet: Prioritaet,
    ) -> Self {
        let status = if krankheit.hat_grundimmunisierung() {
            ImpfdossierStatus::Neu
        } else {
            ImpfdossierStatus::Immunisiert
        };
        Self {
            id: DossierId::new(),
            registrierungsnummer,
            krankheit,
            prioritaet,
            status,
            buchung: Buchung::default(),
            kontrolle1: None,
            kontrolle2: None,
            eintraege: Vec::new(),
            impfschutz: None,
            externes_zertifikat: None,
            timestamp_sent_to_registry: None,
            version: 0,
        }
    }

    /// Booked grundimmunisierung appointment for a dose type
    #[must_use]
    pub const fn grund_termin(&self, impffolge: Impffolge) -> Option<TerminId> {
        match impffolge {
            Impffolge::ErsteImpfung => self.buchung.impftermin1,
            Impffolge::ZweiteImpfung => self.buchung.impftermin2,
            Impffolge::BoosterImpfung => None,
        }
    }

    /// Whether any grundimmunisierung appointment is booked
    #[must_use]
    pub const fn hat_grund_termine(&self) -> bool {
        self.buchung.impftermin1.is_some() || self.buchung.impftermin2.is_some()
    }

    /// Booster entry with the given sequence number
    #[must_use]
    pub fn eintrag(&self, impffolge_nr: u32) -> Option<&Impfdossiereintrag> {
        self.eintraege.iter().find(|e| e.impffolge_nr == impffolge_nr)
    }

    /// Mutable booster entry with the given sequence number
    pub fn eintrag_mut(&mut self, impffolge_nr: u32) -> Option<&mut Impfdossiereintrag> {
        self.eintraege.iter_mut().find(|e| e.impffolge_nr == impffolge_nr)
    }

    /// Booster entry with the highest sequence number
    #[must_use]
    pub fn letzter_eintrag(&self) -> Option<&Impfdossiereintrag> {
        self.eintraege.iter().max_by_key(|e| e.impffolge_nr)
    }

    /// Control the current `*Kontrolliert` status rests on
    #[must_use]
    pub fn aktuelle_kontrolle(&self) -> Option<&Kontrolle> {
        match self.status {
            ImpfdossierStatus::Impfung1Kontrolliert => self.kontrolle1.as_ref(),
            ImpfdossierStatus::Impfung2Kontrolliert => self.kontrolle2.as_ref(),
            ImpfdossierStatus::KontrolliertBooster => self.letzter_eintrag().and_then(|e| e.kontrolle.as_ref()),
            _ => None,
        }
    }

    /// Entry the next booster booking or control belongs to.
    ///
    /// The latest entry is reused while it has no appointment; otherwise a new sequence
    /// number follows it.
    #[must_use]
    pub fn aktuelle_booster_nr(&self) -> u32 {
        match self.letzter_eintrag() {
            Some(eintrag) if eintrag.impftermin.is_none() => eintrag.impffolge_nr,
            Some(eintrag) => eintrag.impffolge_nr + 1,
            None => 1,
        }
    }

    /// Get or create the booster entry with the given sequence number
    pub fn eintrag_anlegen(&mut self, impffolge_nr: u32) -> &mut Impfdossiereintrag {
        let index = match self.eintraege.iter().position(|e| e.impffolge_nr == impffolge_nr) {
            Some(index) => index,
            None => {
                self.eintraege.push(Impfdossiereintrag::new(impffolge_nr));
                self.eintraege.sort_by_key(|e| e.impffolge_nr);
                self.eintraege
                    .iter()
                    .position(|e| e.impffolge_nr == impffolge_nr)
                    .unwrap_or(self.eintraege.len() - 1)
            }
        };
        &mut self.eintraege[index]
    }

    /// Booster entry holding the given appointment
    #[must_use]
    pub fn eintrag_mit_termin(&self, termin_id: TerminId) -> Option<&Impfdossiereintrag> {
        self.eintraege.iter().find(|e| e.impftermin == Some(termin_id))
    }
}

/// An administered vaccination; references the appointment it was given in
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impfung {
    /// Unique vaccination identifier
    pub id: ImpfungId,
    /// Dossier the dose belongs to
    pub dossier_id: DossierId,
    /// Appointment the dose was administered in
    pub termin_id: TerminId,
    /// Dose type
    pub impffolge: Impffolge,
    /// Site of administration
    pub odi_id: OdiId,
    /// When the dose was administered
    pub timestamp_impfung: DateTime<Utc>,
}

impl Impfung {
    /// Creates a new `Impfung`
    #[must_use]
    pub fn new(
        dossier_id: DossierId,
        termin_id: TerminId,
        impffolge: Impffolge,
        odi_id: OdiId,
        timestamp_impfung: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ImpfungId::new(),
            dossier_id,
            termin_id,
            impffolge,
            odi_id,
            timestamp_impfung,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).single().unwrap_or_default()
    }

    #[test]
    fn zeitfenster_is_aligned_to_grid() {
        let fenster = Zeitfenster::ausgerichtet(at(9, 47), Duration::minutes(30));
        assert_eq!(fenster.von, at(9, 30));
        assert_eq!(fenster.bis, at(10, 0));
        assert!(fenster.enthaelt(at(9, 47)));
        assert!(!fenster.enthaelt(at(10, 0)));
    }

    #[test]
    fn expired_reservation_counts_as_free() {
        let mut termin = Impftermin::new(SlotId::new(), Impffolge::ErsteImpfung);
        let registrierung = Registrierungsnummer::new("ABC123");
        termin.reserviert_fuer = Some(registrierung.clone());
        termin.timestamp_reserviert = Some(at(9, 0));

        let cutoff_active = reservation_cutoff(at(9, 5), Duration::minutes(10));
        assert!(!termin.is_frei(cutoff_active));
        assert!(termin.is_reserviert_fuer(&registrierung, cutoff_active));

        let cutoff_expired = reservation_cutoff(at(9, 11), Duration::minutes(10));
        assert!(termin.is_frei(cutoff_expired));
        assert!(!termin.is_reserviert_fuer(&registrierung, cutoff_expired));
    }

    #[test]
    fn booster_nr_reuses_entry_without_appointment() {
        let mut dossier = Impfdossier::new(
            Registrierungsnummer::new("XYZ789"),
            Krankheit::Fsme,
            Prioritaet::new('A'),
        );
        assert_eq!(dossier.status, ImpfdossierStatus::Immunisiert);
        assert_eq!(dossier.aktuelle_booster_nr(), 1);

        dossier.eintrag_anlegen(1);
        assert_eq!(dossier.aktuelle_booster_nr(), 1);

        dossier.eintrag_anlegen(1).impftermin = Some(TerminId::new());
        assert_eq!(dossier.aktuelle_booster_nr(), 2);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ImpfdossierStatus::Neu,
            ImpfdossierStatus::AbgeschlossenOhneZweiteImpfung,
            ImpfdossierStatus::KontrolliertBooster,
        ] {
            assert_eq!(ImpfdossierStatus::parse(status.as_str()), Some(status));
        }
    }
}

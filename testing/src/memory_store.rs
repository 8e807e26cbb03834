//! In-memory [`Store`] for fast, deterministic tests.
//!
//! Transactions read committed data plus their own pending writes (read committed),
//! and buffer writes until [`Transaction::commit`]. Commit checks every optimistic
//! version expectation, then the appointment-reference uniqueness constraints, and
//! applies all writes atomically or none of them.
//!
//! [`Transaction::find_free_termin`] takes a row lock that other transactions skip,
//! mirroring `SELECT … FOR UPDATE SKIP LOCKED`. Locks are released on commit, rollback
//! or drop.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Mutex poisoning only happens after a test panicked

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use terminbuchung_core::error::{Entity, StoreError};
use terminbuchung_core::store::{SlotFilter, Store, StoreResult, Transaction};
use terminbuchung_core::types::{
    DossierId, Impfdossier, Impffolge, Impfslot, Impftermin, Impfung, ImpfungId,
    Krankheit, Odi, OdiId, Registrierungsnummer, SlotId, TerminId,
};

#[derive(Clone, Debug, Default)]
struct Tables {
    odis: HashMap<OdiId, Odi>,
    slots: HashMap<SlotId, Impfslot>,
    termine: HashMap<TerminId, Impftermin>,
    /// Insertion order of appointments (storage order)
    termin_order: Vec<TerminId>,
    dossiers: HashMap<DossierId, Impfdossier>,
    impfungen: HashMap<ImpfungId, Impfung>,
}

impl Tables {
    fn termine_of(&self, slot_id: SlotId, impffolge: Impffolge) -> Vec<Impftermin> {
        self.termin_order
            .iter()
            .filter_map(|id| self.termine.get(id))
            .filter(|t| t.slot_id == slot_id && t.impffolge == impffolge)
            .cloned()
            .collect()
    }

    fn referenced_termine(&self) -> Vec<(DossierId, TerminId, &'static str)> {
        let mut refs = Vec::new();
        for dossier in self.dossiers.values() {
            if let Some(id) = dossier.buchung.impftermin1 {
                refs.push((dossier.id, id, "uq_dossier_termin1"));
            }
            if let Some(id) = dossier.buchung.impftermin2 {
                refs.push((dossier.id, id, "uq_dossier_termin2"));
            }
            for eintrag in &dossier.eintraege {
                if let Some(id) = eintrag.impftermin {
                    refs.push((dossier.id, id, "uq_eintrag_termin"));
                }
            }
        }
        refs
    }

    fn check_constraints(&self) -> StoreResult<()> {
        let mut seen = HashSet::new();
        for (_, termin_id, constraint) in self.referenced_termine() {
            if !seen.insert(termin_id) {
                return Err(StoreError::UniqueViolation {
                    entity: Entity::Termin,
                    constraint: constraint.to_string(),
                });
            }
        }
        for dossier in self.dossiers.values() {
            let mut nummern = HashSet::new();
            if !dossier.eintraege.iter().all(|e| nummern.insert(e.impffolge_nr)) {
                return Err(StoreError::UniqueViolation {
                    entity: Entity::Eintrag,
                    constraint: "uq_eintrag_nr".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A buffered write: the committed version it expects (`None` for inserts) and the new row
/// (`None` for deletes).
type Pending<T> = HashMap<<T as Keyed>::Key, (Option<i64>, Option<T>)>;

trait Keyed {
    type Key;
}

impl Keyed for Impfslot {
    type Key = SlotId;
}

impl Keyed for Impftermin {
    type Key = TerminId;
}

impl Keyed for Impfdossier {
    type Key = DossierId;
}

#[derive(Default)]
struct Writes {
    odis: HashMap<OdiId, Odi>,
    slots: Pending<Impfslot>,
    termine: Pending<Impftermin>,
    termin_inserts: Vec<TerminId>,
    dossiers: Pending<Impfdossier>,
    impfungen: HashMap<ImpfungId, Option<Impfung>>,
}

impl Writes {
    fn apply_to(&self, tables: &mut Tables) {
        tables.odis.extend(self.odis.iter().map(|(k, v)| (*k, v.clone())));
        for (id, (_, slot)) in &self.slots {
            match slot {
                Some(slot) => {
                    tables.slots.insert(*id, slot.clone());
                },
                None => {
                    tables.slots.remove(id);
                },
            }
        }
        for id in &self.termin_inserts {
            if !tables.termin_order.contains(id) {
                tables.termin_order.push(*id);
            }
        }
        for (id, (_, termin)) in &self.termine {
            match termin {
                Some(termin) => {
                    tables.termine.insert(*id, termin.clone());
                },
                None => {
                    tables.termine.remove(id);
                    tables.termin_order.retain(|t| t != id);
                },
            }
        }
        for (id, (_, dossier)) in &self.dossiers {
            match dossier {
                Some(dossier) => {
                    tables.dossiers.insert(*id, dossier.clone());
                },
                None => {
                    tables.dossiers.remove(id);
                },
            }
        }
        for (id, impfung) in &self.impfungen {
            match impfung {
                Some(impfung) => {
                    tables.impfungen.insert(*id, impfung.clone());
                },
                None => {
                    tables.impfungen.remove(id);
                },
            }
        }
    }
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    locks: Mutex<HashMap<TerminId, u64>>,
    failing_dossiers: Mutex<HashSet<DossierId>>,
    next_tx: AtomicU64,
}

/// In-memory store for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use terminbuchung_testing::InMemoryStore;
/// use terminbuchung_core::store::Store;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryStore::new();
/// let mut tx = store.begin().await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl InMemoryStore {
    /// Create a new empty in-memory store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a site directly (test setup)
    pub fn seed_odi(&self, odi: &Odi) {
        self.shared.tables.lock().unwrap().odis.insert(odi.id, odi.clone());
    }

    /// Insert a dossier directly (test setup)
    pub fn seed_dossier(&self, dossier: &Impfdossier) {
        self.shared
            .tables
            .lock()
            .unwrap()
            .dossiers
            .insert(dossier.id, dossier.clone());
    }

    /// Committed dossier
    #[must_use]
    pub fn dossier(&self, id: DossierId) -> Option<Impfdossier> {
        self.shared.tables.lock().unwrap().dossiers.get(&id).cloned()
    }

    /// Committed slot
    #[must_use]
    pub fn slot(&self, id: SlotId) -> Option<Impfslot> {
        self.shared.tables.lock().unwrap().slots.get(&id).cloned()
    }

    /// Number of committed slots
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.shared.tables.lock().unwrap().slots.len()
    }

    /// Committed appointment
    #[must_use]
    pub fn termin(&self, id: TerminId) -> Option<Impftermin> {
        self.shared.tables.lock().unwrap().termine.get(&id).cloned()
    }

    /// Committed appointments of a slot and dose type in storage order
    #[must_use]
    pub fn termine(&self, slot_id: SlotId, impffolge: Impffolge) -> Vec<Impftermin> {
        self.shared.tables.lock().unwrap().termine_of(slot_id, impffolge)
    }

    /// Committed vaccinations of a dossier
    #[must_use]
    pub fn impfungen(&self, dossier_id: DossierId) -> Vec<Impfung> {
        let tables = self.shared.tables.lock().unwrap();
        let mut impfungen: Vec<_> = tables
            .impfungen
            .values()
            .filter(|i| i.dossier_id == dossier_id)
            .cloned()
            .collect();
        impfungen.sort_by_key(|i| i.timestamp_impfung);
        impfungen
    }

    /// Number of appointment rows currently locked by open transactions
    #[must_use]
    pub fn locked_termine(&self) -> usize {
        self.shared.locks.lock().unwrap().len()
    }

    /// Make every `update_dossier` for `id` fail with a database error
    pub fn fail_dossier_updates(&self, id: DossierId) {
        self.shared.failing_dossiers.lock().unwrap().insert(id);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryTransaction {
            id,
            shared: Arc::clone(&self.shared),
            writes: Writes::default(),
        }))
    }
}

/// Transaction of an [`InMemoryStore`]
pub struct InMemoryTransaction {
    id: u64,
    shared: Arc<Shared>,
    writes: Writes,
}

impl InMemoryTransaction {
    /// Committed data overlaid with this transaction's writes
    fn view(&self) -> Tables {
        let mut tables = self.shared.tables.lock().unwrap().clone();
        self.writes.apply_to(&mut tables);
        tables
    }

    fn lock_termin(&self, id: TerminId) -> bool {
        let mut locks = self.shared.locks.lock().unwrap();
        match locks.get(&id) {
            Some(owner) if *owner != self.id => false,
            _ => {
                locks.insert(id, self.id);
                true
            },
        }
    }

    fn release_locks(&self) {
        if let Ok(mut locks) = self.shared.locks.lock() {
            locks.retain(|_, owner| *owner != self.id);
        }
    }

    fn conflict(entity: Entity, id: impl std::fmt::Display) -> StoreError {
        StoreError::Conflict {
            entity,
            id: id.to_string(),
        }
    }

    fn first_lockable(
        &self,
        candidates: Vec<Impftermin>,
        accept: impl Fn(&Impftermin) -> bool,
    ) -> Option<Impftermin> {
        candidates
            .into_iter()
            .filter(|t| accept(t))
            .find(|t| self.lock_termin(t.id))
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.release_locks();
    }
}

fn check_expected<T>(
    committed: &HashMap<T::Key, T>,
    pending: &Pending<T>,
    entity: Entity,
    version: impl Fn(&T) -> i64,
) -> StoreResult<()>
where
    T: Keyed,
    T::Key: std::hash::Hash + Eq + std::fmt::Display,
{
    for (id, (expected, _)) in pending {
        if let Some(expected) = expected {
            match committed.get(id) {
                Some(row) if version(row) == *expected => {},
                _ => return Err(InMemoryTransaction::conflict(entity, id)),
            }
        }
    }
    Ok(())
}

/// Check version expectations and constraints, then apply all writes or none.
fn apply_writes(tables: &mut Tables, writes: &Writes) -> StoreResult<()> {
    check_expected(&tables.slots, &writes.slots, Entity::Slot, |s| s.version)?;
    check_expected(&tables.termine, &writes.termine, Entity::Termin, |t| t.version)?;
    check_expected(&tables.dossiers, &writes.dossiers, Entity::Dossier, |d| d.version)?;

    let mut next = tables.clone();
    writes.apply_to(&mut next);
    next.check_constraints()?;
    *tables = next;
    Ok(())
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn find_odi(&mut self, id: OdiId) -> StoreResult<Option<Odi>> {
        Ok(self.view().odis.get(&id).cloned())
    }

    async fn insert_odi(&mut self, odi: &Odi) -> StoreResult<()> {
        self.writes.odis.insert(odi.id, odi.clone());
        Ok(())
    }

    async fn find_slot(&mut self, id: SlotId) -> StoreResult<Option<Impfslot>> {
        Ok(self.view().slots.get(&id).cloned())
    }

    async fn find_slot_covering(
        &mut self,
        odi_id: OdiId,
        krankheit: Krankheit,
        zeitpunkt: DateTime<Utc>,
    ) -> StoreResult<Option<Impfslot>> {
        Ok(self
            .view()
            .slots
            .values()
            .filter(|s| s.odi_id == odi_id && s.krankheit == krankheit)
            .filter(|s| s.zeitfenster.enthaelt(zeitpunkt))
            .min_by_key(|s| s.zeitfenster.von)
            .cloned())
    }

    async fn find_slots(&mut self, filter: &SlotFilter) -> StoreResult<Vec<Impfslot>> {
        let mut slots: Vec<_> = self
            .view()
            .slots
            .into_values()
            .filter(|s| s.odi_id == filter.odi_id && s.krankheit == filter.krankheit)
            .filter(|s| s.zeitfenster.von >= filter.von && s.zeitfenster.von < filter.bis)
            .collect();
        slots.sort_by_key(|s| s.zeitfenster.von);
        Ok(slots)
    }

    async fn insert_slot(&mut self, slot: &Impfslot) -> StoreResult<()> {
        self.writes.slots.insert(slot.id, (None, Some(slot.clone())));
        Ok(())
    }

    async fn update_slot(&mut self, slot: &Impfslot) -> StoreResult<i64> {
        let current = self
            .view()
            .slots
            .get(&slot.id)
            .map(|s| s.version)
            .ok_or_else(|| Self::conflict(Entity::Slot, slot.id))?;
        if current != slot.version {
            return Err(Self::conflict(Entity::Slot, slot.id));
        }
        let expected = self
            .writes
            .slots
            .get(&slot.id)
            .map_or(Some(slot.version), |(expected, _)| *expected);
        let mut updated = slot.clone();
        updated.version += 1;
        let version = updated.version;
        self.writes.slots.insert(slot.id, (expected, Some(updated)));
        Ok(version)
    }

    async fn find_termin(&mut self, id: TerminId) -> StoreResult<Option<Impftermin>> {
        Ok(self.view().termine.get(&id).cloned())
    }

    async fn list_termine(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
    ) -> StoreResult<Vec<Impftermin>> {
        Ok(self.view().termine_of(slot_id, impffolge))
    }

    async fn find_free_termin(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
        reservation_cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Impftermin>> {
        let candidates = self.view().termine_of(slot_id, impffolge);
        Ok(self.first_lockable(candidates, |t| t.is_frei(reservation_cutoff)))
    }

    async fn find_reserved_termin(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
        registrierung: &Registrierungsnummer,
        reservation_cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Impftermin>> {
        let candidates = self.view().termine_of(slot_id, impffolge);
        Ok(self.first_lockable(candidates, |t| {
            t.is_reserviert_fuer(registrierung, reservation_cutoff)
        }))
    }

    async fn count_free_termine(
        &mut self,
        slot_id: SlotId,
        impffolge: Impffolge,
        reservation_cutoff: DateTime<Utc>,
    ) -> StoreResult<u32> {
        let count = self
            .view()
            .termine_of(slot_id, impffolge)
            .iter()
            .filter(|t| t.is_frei(reservation_cutoff))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn insert_termin(&mut self, termin: &Impftermin) -> StoreResult<()> {
        self.writes.termine.insert(termin.id, (None, Some(termin.clone())));
        self.writes.termin_inserts.push(termin.id);
        Ok(())
    }

    async fn update_termin(&mut self, termin: &Impftermin) -> StoreResult<i64> {
        let current = self
            .view()
            .termine
            .get(&termin.id)
            .map(|t| t.version)
            .ok_or_else(|| Self::conflict(Entity::Termin, termin.id))?;
        if current != termin.version {
            return Err(Self::conflict(Entity::Termin, termin.id));
        }
        let expected = self
            .writes
            .termine
            .get(&termin.id)
            .map_or(Some(termin.version), |(expected, _)| *expected);
        let mut updated = termin.clone();
        updated.version += 1;
        let version = updated.version;
        self.writes.termine.insert(termin.id, (expected, Some(updated)));
        Ok(version)
    }

    async fn delete_termin(&mut self, termin: &Impftermin) -> StoreResult<()> {
        let id = termin.id;
        let current = self
            .view()
            .termine
            .get(&id)
            .filter(|t| t.version == termin.version && !t.gebucht)
            .map(|t| t.version)
            .ok_or_else(|| Self::conflict(Entity::Termin, id))?;
        let expected = self
            .writes
            .termine
            .get(&id)
            .map_or(Some(current), |(expected, _)| *expected);
        match expected {
            // Inserted and deleted within this transaction
            None => {
                self.writes.termine.remove(&id);
                self.writes.termin_inserts.retain(|t| *t != id);
            },
            Some(_) => {
                self.writes.termine.insert(id, (expected, None));
            },
        }
        Ok(())
    }

    async fn is_termin_referenced(&mut self, id: TerminId) -> StoreResult<bool> {
        Ok(self
            .view()
            .referenced_termine()
            .iter()
            .any(|(_, termin_id, _)| *termin_id == id))
    }

    async fn find_dossier(&mut self, id: DossierId) -> StoreResult<Option<Impfdossier>> {
        Ok(self.view().dossiers.get(&id).cloned())
    }

    async fn insert_dossier(&mut self, dossier: &Impfdossier) -> StoreResult<()> {
        self.writes
            .dossiers
            .insert(dossier.id, (None, Some(dossier.clone())));
        Ok(())
    }

    async fn update_dossier(&mut self, dossier: &Impfdossier) -> StoreResult<i64> {
        if self.shared.failing_dossiers.lock().unwrap().contains(&dossier.id) {
            return Err(StoreError::Database(format!(
                "injected failure for dossier {}",
                dossier.id
            )));
        }
        let current = self
            .view()
            .dossiers
            .get(&dossier.id)
            .map(|d| d.version)
            .ok_or_else(|| Self::conflict(Entity::Dossier, dossier.id))?;
        if current != dossier.version {
            return Err(Self::conflict(Entity::Dossier, dossier.id));
        }
        let expected = self
            .writes
            .dossiers
            .get(&dossier.id)
            .map_or(Some(dossier.version), |(expected, _)| *expected);
        let mut updated = dossier.clone();
        updated.version += 1;
        updated.eintraege.sort_by_key(|e| e.impffolge_nr);
        let version = updated.version;
        self.writes.dossiers.insert(dossier.id, (expected, Some(updated)));
        Ok(version)
    }

    async fn find_dossiers_kontrolliert_vor(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<DossierId>> {
        let mut kandidaten: Vec<_> = self
            .view()
            .dossiers
            .values()
            .filter_map(|d| {
                let kontrolle = d.aktuelle_kontrolle()?;
                (kontrolle.timestamp < cutoff).then_some((kontrolle.timestamp, d.id))
            })
            .collect();
        kandidaten.sort();
        Ok(kandidaten
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|(_, id)| id)
            .collect())
    }

    async fn find_impfung_by_termin(&mut self, termin_id: TerminId) -> StoreResult<Option<Impfung>> {
        Ok(self
            .view()
            .impfungen
            .values()
            .find(|i| i.termin_id == termin_id)
            .cloned())
    }

    async fn list_impfungen(&mut self, dossier_id: DossierId) -> StoreResult<Vec<Impfung>> {
        let mut impfungen: Vec<_> = self
            .view()
            .impfungen
            .into_values()
            .filter(|i| i.dossier_id == dossier_id)
            .collect();
        impfungen.sort_by_key(|i| i.timestamp_impfung);
        Ok(impfungen)
    }

    async fn insert_impfung(&mut self, impfung: &Impfung) -> StoreResult<()> {
        if self.view().impfungen.values().any(|i| i.termin_id == impfung.termin_id) {
            return Err(StoreError::UniqueViolation {
                entity: Entity::Impfung,
                constraint: "uq_impfung_termin".to_string(),
            });
        }
        self.writes.impfungen.insert(impfung.id, Some(impfung.clone()));
        Ok(())
    }

    async fn delete_impfung(&mut self, impfung: &Impfung) -> StoreResult<()> {
        self.writes.impfungen.insert(impfung.id, None);
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let result = {
            let mut tables = self.shared.tables.lock().unwrap();
            apply_writes(&mut tables, &self.writes)
        };
        self.writes = Writes::default();
        self.release_locks();
        if let Err(error) = &result {
            tracing::debug!(tx = self.id, error = %error, "In-memory commit rejected");
        }
        result
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.writes = Writes::default();
        self.release_locks();
        Ok(())
    }
}

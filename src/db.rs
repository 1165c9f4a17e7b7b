//! The graph store.
//!
//! Three flat tables (patients, visits, events) keyed by [`EntityId`], plus two domain indexes:
//! `patient_id -> patient` and `(patient_id, visit_id) -> visit`. Events are added to a staging
//! list and only become part of the graph when [`PatientDb::attach_events_to_visits`] runs, or
//! when they arrive nested in a patient/visit record.
pub mod counters;
pub mod io;
pub mod matching;
pub mod period;

use crate::{
    record::{EventRecord, PatientRecord, VisitRecord},
    ArcStr, EntityId, Event, Patient, Visit,
};
use chrono::NaiveDate;
use qu::ick_use::*;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
};

/// An in-memory graph of patients, visits and events.
#[derive(Debug, Clone)]
pub struct PatientDb {
    name: ArcStr,
    patients: BTreeMap<EntityId, Patient>,
    visits: BTreeMap<EntityId, Visit>,
    events: BTreeMap<EntityId, Event>,
    patient_idx: HashMap<ArcStr, EntityId>,
    visit_idx: HashMap<(ArcStr, ArcStr), EntityId>,
    /// Events waiting for `attach_events_to_visits`, in insertion order.
    staged: Vec<EntityId>,
    next_patient: u64,
    next_visit: u64,
    next_event: u64,
}

/// Counts describing a store.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Stats {
    pub num_patients: usize,
    pub num_visits: usize,
    pub num_events: usize,
    pub num_staged_events: usize,
    pub avg_visits_per_patient: f64,
    pub avg_events_per_visit: f64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "patients: {}", self.num_patients)?;
        writeln!(f, "visits: {}", self.num_visits)?;
        writeln!(f, "events: {}", self.num_events)?;
        if self.num_staged_events > 0 {
            writeln!(f, "staged events: {}", self.num_staged_events)?;
        }
        writeln!(f, "visits per patient: {:.2}", self.avg_visits_per_patient)?;
        write!(f, "events per visit: {:.2}", self.avg_events_per_visit)
    }
}

impl PatientDb {
    pub fn new(name: impl Into<ArcStr>) -> Self {
        PatientDb {
            name: name.into(),
            patients: BTreeMap::new(),
            visits: BTreeMap::new(),
            events: BTreeMap::new(),
            patient_idx: HashMap::new(),
            visit_idx: HashMap::new(),
            staged: vec![],
            next_patient: 0,
            next_visit: 0,
            next_event: 0,
        }
    }

    /// Build a store from patient records, keeping their entity IDs.
    pub fn from_records(
        name: impl Into<ArcStr>,
        records: impl IntoIterator<Item = PatientRecord>,
    ) -> Self {
        let mut db = Self::new(name);
        for record in records {
            db.add_patient(record, None);
        }
        db
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<ArcStr>) {
        self.name = name.into();
    }

    pub fn num_patients(&self) -> usize {
        self.patients.len()
    }

    pub fn num_visits(&self) -> usize {
        self.visits.len()
    }

    /// All events, including staged ones.
    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    pub fn num_staged_events(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty() && self.visits.is_empty() && self.events.is_empty()
    }

    pub fn stats(&self) -> Stats {
        let ratio = |num: usize, den: usize| {
            if den == 0 {
                0.
            } else {
                num as f64 / den as f64
            }
        };
        let attached = self.events.len().saturating_sub(self.staged.len());
        Stats {
            num_patients: self.num_patients(),
            num_visits: self.num_visits(),
            num_events: self.num_events(),
            num_staged_events: self.num_staged_events(),
            avg_visits_per_patient: ratio(self.num_visits(), self.num_patients()),
            avg_events_per_visit: ratio(attached, self.num_visits()),
        }
    }

    // lookup

    pub fn patient(&self, id: EntityId) -> Option<&Patient> {
        self.patients.get(&id)
    }

    pub fn visit(&self, id: EntityId) -> Option<&Visit> {
        self.visits.get(&id)
    }

    pub fn event(&self, id: EntityId) -> Option<&Event> {
        self.events.get(&id)
    }

    pub fn find_patient(&self, patient_id: &str) -> Option<(EntityId, &Patient)> {
        let id = *self.patient_idx.get(patient_id)?;
        Some((id, self.patients.get(&id)?))
    }

    pub fn find_visit(&self, patient_id: &str, visit_id: &str) -> Option<(EntityId, &Visit)> {
        let id = *self
            .visit_idx
            .get(&(ArcStr::from(patient_id), ArcStr::from(visit_id)))?;
        Some((id, self.visits.get(&id)?))
    }

    /// Patients in ascending entity ID order.
    pub fn patients(&self) -> impl Iterator<Item = (EntityId, &Patient)> + '_ {
        self.patients.iter().map(|(id, p)| (*id, p))
    }

    pub fn visits(&self) -> impl Iterator<Item = (EntityId, &Visit)> + '_ {
        self.visits.iter().map(|(id, v)| (*id, v))
    }

    pub fn events(&self) -> impl Iterator<Item = (EntityId, &Event)> + '_ {
        self.events.iter().map(|(id, e)| (*id, e))
    }

    /// The visits of `patient`, in order.
    pub fn visits_of<'a>(
        &'a self,
        patient: &'a Patient,
    ) -> impl Iterator<Item = (EntityId, &'a Visit)> + 'a {
        patient
            .visits
            .iter()
            .filter_map(|id| Some((*id, self.visits.get(id)?)))
    }

    /// The events attached to `visit`, in order.
    pub fn events_of<'a>(
        &'a self,
        visit: &'a Visit,
    ) -> impl Iterator<Item = (EntityId, &'a Event)> + 'a {
        visit
            .events
            .iter()
            .filter_map(|id| Some((*id, self.events.get(id)?)))
    }

    /// Whether `patient` owns an event: one attached to any of its visits, or a staged one
    /// naming it. [`select_non_empty_patients`](Self::select_non_empty_patients) uses the same
    /// rule.
    pub fn has_events(&self, patient: &Patient) -> bool {
        self.visits_of(patient).any(|(_, v)| !v.events.is_empty())
            || self.staged_events().any(|(_, e)| e.patient_id == patient.patient_id)
    }

    /// Events waiting for [`attach_events_to_visits`](Self::attach_events_to_visits), in the
    /// order they were added.
    pub fn staged_events(&self) -> impl Iterator<Item = (EntityId, &Event)> + '_ {
        self.staged
            .iter()
            .filter_map(|id| Some((*id, self.events.get(id)?)))
    }

    pub(crate) fn demographics_mut(
        &mut self,
        id: EntityId,
    ) -> Option<&mut crate::Demographics> {
        self.patients.get_mut(&id).map(|p| &mut p.demographics)
    }

    pub(crate) fn patients_mut(&mut self) -> impl Iterator<Item = &mut Patient> + '_ {
        self.patients.values_mut()
    }

    // insertion

    /// Insert a patient, along with any visits and events nested in `record`.
    ///
    /// The entity ID is `id` if given, otherwise the ID of the patient already stored under the
    /// same `patient_id`, otherwise the record's own entity ID if that slot is free, otherwise a
    /// fresh one. Whatever was stored at that ID (or under that `patient_id`) is replaced along
    /// with its visits and events: last write wins. A persisted entity ID never displaces a
    /// different patient.
    pub fn add_patient(
        &mut self,
        record: impl Into<PatientRecord>,
        id: Option<EntityId>,
    ) -> (EntityId, &Patient) {
        let PatientRecord {
            entity_id,
            patient,
            visits,
        } = record.into();
        let id = id
            .or_else(|| self.patient_idx.get(&patient.patient_id).copied())
            .or_else(|| {
                entity_id
                    .filter(|id| claimable(*id) && !self.patients.contains_key(id))
            })
            .unwrap_or_else(|| self.fresh_patient_id());

        if self.remove_patient(id) {
            event!(Level::TRACE, "overwriting patient at {}", id);
        }
        if let Some(other) = self.patient_idx.get(&patient.patient_id).copied() {
            self.remove_patient(other);
        }
        self.claim_patient_id(id);
        let patient_id = patient.patient_id.clone();
        self.patient_idx.insert(patient_id.clone(), id);
        self.patients.insert(
            id,
            Patient {
                visits: vec![],
                ..patient
            },
        );

        for mut visit in visits {
            visit.set_patient_id(&patient_id);
            self.add_visit(visit, None);
        }
        (id, &self.patients[&id])
    }

    /// Insert a visit, along with any events nested in `record`.
    ///
    /// The owning patient is created if it does not exist. ID choice and overwrite follow
    /// [`add_patient`](Self::add_patient), using `(patient_id, visit_id)` as the domain key.
    pub fn add_visit(
        &mut self,
        record: impl Into<VisitRecord>,
        id: Option<EntityId>,
    ) -> (EntityId, &Visit) {
        let VisitRecord {
            entity_id,
            visit,
            events,
        } = record.into();
        let key = (visit.patient_id.clone(), visit.visit_id.clone());
        let id = id
            .or_else(|| self.visit_idx.get(&key).copied())
            .or_else(|| {
                entity_id.filter(|id| claimable(*id) && !self.visits.contains_key(id))
            })
            .unwrap_or_else(|| self.fresh_visit_id());

        let patient = self.get_or_create_patient(&visit.patient_id);
        // keep the slot in the patient's visit list when replacing a visit of the same patient
        let same_owner = matches!(
            self.visits.get(&id),
            Some(old) if old.patient_id == visit.patient_id
        );
        if same_owner {
            self.clear_visit(id);
        } else {
            self.remove_visit(id);
        }
        if let Some(other) = self.visit_idx.get(&key).copied() {
            if other != id {
                self.remove_visit(other);
            }
        }
        self.claim_visit_id(id);
        self.visit_idx.insert(key, id);
        self.visits.insert(
            id,
            Visit {
                events: vec![],
                ..visit
            },
        );
        if !same_owner {
            if let Some(patient) = self.patients.get_mut(&patient) {
                patient.visits.push(id);
            }
        }

        for event in events {
            let EventRecord {
                entity_id,
                mut event,
            } = event;
            event.patient_id = self.visits[&id].patient_id.clone();
            event.visit_id = self.visits[&id].visit_id.clone();
            let entity_id = self.persisted_event_id(entity_id, &event);
            let event_id = self.insert_event(event, entity_id);
            self.link_event(event_id, id);
        }
        (id, &self.visits[&id])
    }

    /// Stage an event. It joins its visit on the next
    /// [`attach_events_to_visits`](Self::attach_events_to_visits).
    ///
    /// If an event already exists at `id` it is replaced (and detached from its visit). The
    /// record's own entity ID is only used when its slot is free or holds the same event.
    pub fn add_event(
        &mut self,
        record: impl Into<EventRecord>,
        id: Option<EntityId>,
    ) -> (EntityId, &Event) {
        let EventRecord { entity_id, event } = record.into();
        let id = id.or_else(|| self.persisted_event_id(entity_id, &event));
        let id = self.insert_event(event, id);
        self.staged.push(id);
        (id, &self.events[&id])
    }

    /// Attach every staged event to the visit named by its `(patient_id, visit_id)`, creating the
    /// visit (dated by the event's chart date) and the patient when missing.
    ///
    /// Events are processed in the order they were added. The staging list is consumed, so a
    /// second call does nothing. Returns the number of events attached.
    pub fn attach_events_to_visits(&mut self) -> usize {
        let staged = std::mem::take(&mut self.staged);
        let mut attached = 0;
        for event_id in staged {
            let Some(event) = self.events.get(&event_id) else {
                continue;
            };
            if event.visit.is_some() {
                continue;
            }
            let (patient_id, visit_id, date) = (
                event.patient_id.clone(),
                event.visit_id.clone(),
                event.chartdate,
            );
            let visit = self.get_or_create_visit(&patient_id, &visit_id, date);
            self.link_event(event_id, visit);
            attached += 1;
        }
        event!(Level::DEBUG, "attached {} events to visits", attached);
        attached
    }

    /// The entity ID of the patient with `patient_id`, creating a bare patient if there is none.
    pub fn get_or_create_patient(&mut self, patient_id: &ArcStr) -> EntityId {
        if let Some(id) = self.patient_idx.get(patient_id) {
            return *id;
        }
        let id = self.fresh_patient_id();
        self.claim_patient_id(id);
        self.patient_idx.insert(patient_id.clone(), id);
        self.patients.insert(id, Patient::new(patient_id.clone()));
        id
    }

    /// The entity ID of the visit `(patient_id, visit_id)`, creating it (and its patient) if
    /// there is none.
    pub fn get_or_create_visit(
        &mut self,
        patient_id: &ArcStr,
        visit_id: &ArcStr,
        date: NaiveDate,
    ) -> EntityId {
        if let Some(id) = self
            .visit_idx
            .get(&(patient_id.clone(), visit_id.clone()))
        {
            return *id;
        }
        let patient = self.get_or_create_patient(patient_id);
        let id = self.fresh_visit_id();
        self.claim_visit_id(id);
        self.visit_idx
            .insert((patient_id.clone(), visit_id.clone()), id);
        self.visits.insert(
            id,
            Visit::new(patient_id.clone(), visit_id.clone(), date),
        );
        if let Some(patient) = self.patients.get_mut(&patient) {
            patient.visits.push(id);
        }
        id
    }

    /// Create a bare patient for each ID that isn't already in the store. Returns how many were
    /// created.
    pub fn generate_patients_from_ids<I, S>(&mut self, patient_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.patients.len();
        for patient_id in patient_ids {
            self.get_or_create_patient(&ArcStr::from(patient_id.as_ref()));
        }
        self.patients.len() - before
    }

    /// Insert a patient from another store. Entity IDs from the other store are discarded and
    /// a patient with the same `patient_id` is replaced.
    pub fn merge_patient(&mut self, record: PatientRecord) -> EntityId {
        self.add_patient(record.without_entity_ids(), None).0
    }

    /// Merge every patient of `other` into this store (see [`merge_patient`](Self::merge_patient)).
    pub fn merge_patients(&mut self, other: &PatientDb) {
        for record in other.records() {
            self.merge_patient(record);
        }
    }

    // selection

    /// The candidates that own at least one event in this store (attached or staged, as in
    /// [`has_events`](Self::has_events)), deduplicated, in the order given.
    pub fn select_non_empty_patients<I, S>(&self, candidates: I) -> Vec<ArcStr>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let with_events: HashSet<&str> =
            self.events.values().map(|e| &*e.patient_id).collect();
        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter_map(|candidate| {
                let candidate = candidate.as_ref();
                (with_events.contains(candidate) && seen.insert(candidate.to_owned()))
                    .then(|| ArcStr::from(candidate))
            })
            .collect()
    }

    /// The patient with `id` as a nested record, keeping entity IDs.
    pub fn extract_patient(&self, id: EntityId) -> Option<PatientRecord> {
        let patient = self.patients.get(&id)?;
        Some(self.patient_record(id, patient, |_| true))
    }

    /// Every patient as a nested record, in ascending entity ID order.
    pub fn records(&self) -> impl Iterator<Item = PatientRecord> + '_ {
        self.patients
            .iter()
            .map(|(id, patient)| self.patient_record(*id, patient, |_| true))
    }

    /// A new store holding the given patients (with all their visits and events).
    pub fn select_patients(
        &self,
        name: impl Into<ArcStr>,
        ids: impl IntoIterator<Item = EntityId>,
    ) -> PatientDb {
        let ids: BTreeSet<EntityId> = ids.into_iter().collect();
        PatientDb::from_records(name, ids.into_iter().filter_map(|id| self.extract_patient(id)))
    }

    /// A new store holding, for every patient with at least one visit satisfying `keep`, that
    /// patient with only those visits.
    pub fn select_visits(
        &self,
        name: impl Into<ArcStr>,
        mut keep: impl FnMut(&Visit) -> bool,
    ) -> PatientDb {
        let records = self.patients.iter().filter_map(|(id, patient)| {
            if !self.visits_of(patient).any(|(_, v)| keep(v)) {
                return None;
            }
            Some(self.patient_record(*id, patient, &mut keep))
        });
        PatientDb::from_records(name, records.collect::<Vec<_>>())
    }

    pub(crate) fn patient_record(
        &self,
        id: EntityId,
        patient: &Patient,
        mut keep: impl FnMut(&Visit) -> bool,
    ) -> PatientRecord {
        let visits = self
            .visits_of(patient)
            .filter(|(_, visit)| keep(*visit))
            .map(|(visit_id, visit)| VisitRecord {
                entity_id: Some(visit_id),
                visit: Visit {
                    events: vec![],
                    ..visit.clone()
                },
                events: self
                    .events_of(visit)
                    .map(|(event_id, event)| EventRecord {
                        entity_id: Some(event_id),
                        event: Event {
                            visit: None,
                            ..event.clone()
                        },
                    })
                    .collect(),
            })
            .collect();
        PatientRecord {
            entity_id: Some(id),
            patient: Patient {
                visits: vec![],
                ..patient.clone()
            },
            visits,
        }
    }

    // internals

    fn fresh_patient_id(&self) -> EntityId {
        EntityId(self.next_patient)
    }

    fn fresh_visit_id(&self) -> EntityId {
        EntityId(self.next_visit)
    }

    fn fresh_event_id(&self) -> EntityId {
        EntityId(self.next_event)
    }

    fn claim_patient_id(&mut self, id: EntityId) {
        self.next_patient = self.next_patient.max(id.0.saturating_add(1));
    }

    fn claim_visit_id(&mut self, id: EntityId) {
        self.next_visit = self.next_visit.max(id.0.saturating_add(1));
    }

    fn claim_event_id(&mut self, id: EntityId) {
        self.next_event = self.next_event.max(id.0.saturating_add(1));
    }

    /// `id` if it is usable for `event`: the slot is free, or already holds an event with the
    /// same patient, visit and event IDs.
    fn persisted_event_id(&self, id: Option<EntityId>, event: &Event) -> Option<EntityId> {
        id.filter(|id| {
            claimable(*id)
                && self.events.get(id).map_or(true, |old| {
                    old.patient_id == event.patient_id
                        && old.visit_id == event.visit_id
                        && old.event_id == event.event_id
                })
        })
    }

    /// Insert or replace an event, unattached. Returns its ID.
    fn insert_event(&mut self, event: Event, id: Option<EntityId>) -> EntityId {
        let id = id.unwrap_or_else(|| self.fresh_event_id());
        if let Some(old) = self.events.remove(&id) {
            event!(Level::TRACE, "overwriting event at {}", id);
            self.unlink_event(id, &old);
        }
        self.claim_event_id(id);
        self.events.insert(
            id,
            Event {
                visit: None,
                ..event
            },
        );
        id
    }

    fn link_event(&mut self, event_id: EntityId, visit_id: EntityId) {
        if let (Some(event), Some(visit)) = (
            self.events.get_mut(&event_id),
            self.visits.get_mut(&visit_id),
        ) {
            event.visit = Some(visit_id);
            visit.events.push(event_id);
        }
    }

    fn unlink_event(&mut self, event_id: EntityId, event: &Event) {
        match event.visit {
            Some(visit_id) => {
                if let Some(visit) = self.visits.get_mut(&visit_id) {
                    visit.events.retain(|id| *id != event_id);
                }
            }
            None => self.staged.retain(|id| *id != event_id),
        }
    }

    /// Remove a patient with its visits and their events. Returns whether there was one.
    fn remove_patient(&mut self, id: EntityId) -> bool {
        let Some(patient) = self.patients.remove(&id) else {
            return false;
        };
        if self.patient_idx.get(&patient.patient_id) == Some(&id) {
            self.patient_idx.remove(&patient.patient_id);
        }
        for visit in patient.visits {
            self.drop_visit(visit);
        }
        true
    }

    /// Remove a visit, detaching it from its patient.
    fn remove_visit(&mut self, id: EntityId) {
        let Some(visit) = self.visits.get(&id) else {
            return;
        };
        if let Some(patient) = self
            .patient_idx
            .get(&visit.patient_id)
            .and_then(|p| self.patients.get_mut(p))
        {
            patient.visits.retain(|v| *v != id);
        }
        self.drop_visit(id);
    }

    /// Remove a visit and its events without touching the patient.
    fn drop_visit(&mut self, id: EntityId) {
        self.clear_visit(id);
        self.visits.remove(&id);
    }

    /// Remove the events of a visit and its index entry, leaving the visit itself in place.
    fn clear_visit(&mut self, id: EntityId) {
        let Some(visit) = self.visits.get_mut(&id) else {
            return;
        };
        let events = std::mem::take(&mut visit.events);
        let key = (visit.patient_id.clone(), visit.visit_id.clone());
        if self.visit_idx.get(&key) == Some(&id) {
            self.visit_idx.remove(&key);
        }
        for event in events {
            self.events.remove(&event);
        }
    }
}

/// Persisted IDs at the very top of the range are not honoured, so there is always a next ID.
fn claimable(id: EntityId) -> bool {
    id.0 < u64::MAX
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{roles::Diagnosis, EventKind};

    pub(crate) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub(crate) fn diagnosis(name: &str) -> EventKind {
        EventKind::Diagnosis(Diagnosis {
            name: Some(name.into()),
            ..Default::default()
        })
    }

    #[test]
    fn nested_patient_is_normalized() {
        let mut db = PatientDb::new("test");
        let visit = VisitRecord::from(Visit::new("42", "v1", date(2020, 3, 1)))
            .with_event(Event::new("42", "v1", date(2020, 3, 1), diagnosis("Depression")))
            .with_event(Event::new("42", "v1", date(2020, 3, 1), diagnosis("Anxiety")));
        let (id, patient) = db.add_patient(PatientRecord::from(Patient::new("42")).with_visit(visit), None);
        assert_eq!(id, EntityId(0));
        assert_eq!(patient.visit_ids().len(), 1);
        assert_eq!(db.num_visits(), 1);
        assert_eq!(db.num_events(), 2);
        assert_eq!(db.num_staged_events(), 0);
        let (_, visit) = db.find_visit("42", "v1").unwrap();
        assert_eq!(visit.event_ids().len(), 2);
        assert!(db.events().all(|(_, e)| e.is_attached()));
    }

    #[test]
    fn overwrite_is_last_write_wins() {
        let mut db = PatientDb::new("test");
        let visit = VisitRecord::from(Visit::new("42", "v1", date(2020, 3, 1)))
            .with_event(Event::new("42", "v1", date(2020, 3, 1), diagnosis("Depression")));
        db.add_patient(PatientRecord::from(Patient::new("42")).with_visit(visit), None);
        let (id, _) = db.add_patient(Patient::new("42"), None);
        assert_eq!(id, EntityId(0));
        assert_eq!(db.num_patients(), 1);
        assert_eq!(db.num_visits(), 0);
        assert_eq!(db.num_events(), 0);

        // explicit ID replaces whatever lives there
        db.add_patient(Patient::new("43"), Some(EntityId(0)));
        assert_eq!(db.num_patients(), 1);
        assert!(db.find_patient("42").is_none());
        assert_eq!(db.find_patient("43").unwrap().0, EntityId(0));
    }

    #[test]
    fn orphan_visit_creates_patient() {
        let mut db = PatientDb::new("test");
        let (visit_id, _) = db.add_visit(Visit::new("7", "v1", date(2021, 1, 1)), None);
        let (_, patient) = db.find_patient("7").unwrap();
        assert_eq!(patient.visit_ids(), [visit_id]);
    }

    #[test]
    fn attach_is_idempotent() {
        let mut db = PatientDb::new("test");
        for (patient, day) in [("1", 1), ("1", 1), ("1", 2), ("2", 1)] {
            db.add_event(Event::dated(patient, date(2020, 1, day), diagnosis("Cough")), None);
        }
        assert_eq!(db.num_visits(), 0);
        assert_eq!(db.attach_events_to_visits(), 4);
        let edges = |db: &PatientDb| db.visits().map(|(_, v)| v.event_ids().len()).sum::<usize>();
        assert_eq!(edges(&db), 4);
        assert_eq!(db.num_visits(), 3);
        assert_eq!(db.num_patients(), 2);
        assert_eq!(db.attach_events_to_visits(), 0);
        assert_eq!(edges(&db), 4);
        let (_, visit) = db.find_visit("1", "2020-01-01").unwrap();
        assert_eq!(visit.event_ids(), [EntityId(0), EntityId(1)]);
        assert_eq!(visit.date, date(2020, 1, 1));
    }

    #[test]
    fn replacing_an_attached_event_detaches_it() {
        let mut db = PatientDb::new("test");
        db.add_event(Event::dated("1", date(2020, 1, 1), diagnosis("Cough")), None);
        db.attach_events_to_visits();
        db.add_event(Event::dated("1", date(2020, 1, 2), diagnosis("Cold")), Some(EntityId(0)));
        assert_eq!(db.find_visit("1", "2020-01-01").unwrap().1.event_ids().len(), 0);
        db.attach_events_to_visits();
        assert_eq!(db.find_visit("1", "2020-01-02").unwrap().1.event_ids(), [EntityId(0)]);
        assert_eq!(db.num_events(), 1);
    }

    #[test]
    fn non_empty_patients() {
        let mut db = PatientDb::new("test");
        db.generate_patients_from_ids(["1", "2", "3"]);
        db.add_event(Event::dated("2", date(2020, 1, 1), diagnosis("Cough")), None);
        db.add_event(Event::dated("9", date(2020, 1, 1), diagnosis("Cough")), None);
        let selected = db.select_non_empty_patients(["1", "2", "2", "3", "9", "10"]);
        assert_eq!(selected, [ArcStr::from("2"), ArcStr::from("9")]);
    }

    #[test]
    fn generate_is_get_or_create() {
        let mut db = PatientDb::new("test");
        assert_eq!(db.generate_patients_from_ids(["1", "2"]), 2);
        assert_eq!(db.generate_patients_from_ids(["2", "3"]), 1);
        assert_eq!(db.num_patients(), 3);
    }

    #[test]
    fn merge_prefers_latest() {
        let mut a = PatientDb::new("a");
        a.add_visit(Visit::new("1", "v1", date(2020, 1, 1)), None);
        a.add_patient(Patient::new("2"), None);
        let mut b = PatientDb::new("b");
        b.add_visit(Visit::new("1", "v2", date(2021, 1, 1)), None);
        b.add_visit(Visit::new("1", "v3", date(2021, 2, 1)), None);
        a.merge_patients(&b);
        assert_eq!(a.num_patients(), 2);
        let (_, patient) = a.find_patient("1").unwrap();
        let visit_ids: Vec<_> = a.visits_of(patient).map(|(_, v)| v.visit_id.clone()).collect();
        assert_eq!(visit_ids, [ArcStr::from("v2"), ArcStr::from("v3")]);
        assert_eq!(a.num_visits(), 2);
    }

    #[test]
    fn select_visits_keeps_ids() {
        let mut db = PatientDb::new("test");
        db.add_visit(Visit::new("1", "a", date(2020, 1, 1)), None);
        db.add_visit(Visit::new("1", "b", date(2020, 2, 1)), None);
        db.add_visit(Visit::new("2", "c", date(2020, 2, 1)), None);
        let feb = db.select_visits("feb", |v| v.date.format("%m").to_string() == "02");
        assert_eq!(feb.name(), "feb");
        assert_eq!(feb.num_patients(), 2);
        assert_eq!(feb.num_visits(), 2);
        assert_eq!(feb.find_visit("1", "b").unwrap().0, db.find_visit("1", "b").unwrap().0);
        assert!(feb.find_visit("1", "a").is_none());
    }
}

//! Counting role values at patient, visit and event level.
//!
//! Each level answers "in how many patients (visits, events) did this value appear": values are
//! collected into a set per entity and only counted once that entity is finished.
use super::{matching::EventTypeRoles, PatientDb};
use crate::{ArcStr, EventType, Patient};
use qu::ick_use::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    str::FromStr,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityLevel {
    Patient,
    Visit,
    Event,
}

impl EntityLevel {
    pub const ALL: [EntityLevel; 3] = [EntityLevel::Patient, EntityLevel::Visit, EntityLevel::Event];
}

impl fmt::Display for EntityLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            EntityLevel::Patient => "patient",
            EntityLevel::Visit => "visit",
            EntityLevel::Event => "event",
        })
    }
}

impl FromStr for EntityLevel {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(match input.to_ascii_lowercase().as_str() {
            "patient" => EntityLevel::Patient,
            "visit" => EntityLevel::Visit,
            "event" => EntityLevel::Event,
            _ => bail!("unknown entity level \"{}\"", input),
        })
    }
}

/// Value -> count, remembering the order values were first seen in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counter {
    order: Vec<ArcStr>,
    counts: HashMap<ArcStr, usize>,
}

impl Counter {
    pub fn add(&mut self, value: &ArcStr) {
        self.add_n(value, 1)
    }

    pub fn add_n(&mut self, value: &ArcStr, n: usize) {
        match self.counts.get_mut(value) {
            Some(count) => *count += n,
            None => {
                self.order.push(value.clone());
                self.counts.insert(value.clone(), n);
            }
        }
    }

    pub fn get(&self, value: &str) -> usize {
        self.counts.get(value).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Values in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&ArcStr, usize)> + '_ {
        self.order
            .iter()
            .map(|value| (value, self.counts.get(value).copied().unwrap_or(0)))
    }

    /// The `k` highest counts, ties in first-seen order.
    pub fn most_common(&self, k: usize) -> Vec<(ArcStr, usize)> {
        let mut all: Vec<_> = self.iter().map(|(v, c)| (v.clone(), c)).collect();
        // stable
        all.sort_by(|l, r| r.1.cmp(&l.1));
        all.truncate(k);
        all
    }

    /// Add `other`'s counts, appending values new to `self` in `other`'s order.
    pub fn merge(&mut self, other: &Counter) {
        for (value, count) in other.iter() {
            self.add_n(value, count);
        }
    }
}

/// The result of counting: one [`Counter`] per level and role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCounters {
    counters: BTreeMap<EntityLevel, BTreeMap<ArcStr, Counter>>,
    roles: BTreeSet<ArcStr>,
}

impl EventCounters {
    fn new(roles: &BTreeSet<ArcStr>) -> Self {
        let per_role: BTreeMap<ArcStr, Counter> = roles
            .iter()
            .map(|role| (role.clone(), Counter::default()))
            .collect();
        EventCounters {
            counters: EntityLevel::ALL
                .into_iter()
                .map(|level| (level, per_role.clone()))
                .collect(),
            roles: roles.clone(),
        }
    }

    pub fn get(&self, level: EntityLevel, role: &str) -> Option<&Counter> {
        self.counters.get(&level)?.get(role)
    }

    /// The roles that were counted.
    pub fn roles(&self) -> &BTreeSet<ArcStr> {
        &self.roles
    }

    pub fn levels(&self) -> [EntityLevel; 3] {
        EntityLevel::ALL
    }

    fn flush(&mut self, level: EntityLevel, roles: &[ArcStr], seen: &[BTreeSet<ArcStr>]) {
        let Some(by_role) = self.counters.get_mut(&level) else {
            return;
        };
        for (role, values) in roles.iter().zip(seen) {
            if let Some(counter) = by_role.get_mut(role) {
                for value in values {
                    counter.add(value);
                }
            }
        }
    }

    fn merge(&mut self, other: EventCounters) {
        for (level, by_role) in other.counters {
            let ours = self.counters.entry(level).or_default();
            for (role, counter) in by_role {
                ours.entry(role).or_default().merge(&counter);
            }
        }
    }
}

/// Per-role sets of values seen in the current patient, visit and event.
struct Scratch {
    patient: Vec<BTreeSet<ArcStr>>,
    visit: Vec<BTreeSet<ArcStr>>,
    event: Vec<BTreeSet<ArcStr>>,
}

impl Scratch {
    fn new(num_roles: usize) -> Self {
        Scratch {
            patient: vec![BTreeSet::new(); num_roles],
            visit: vec![BTreeSet::new(); num_roles],
            event: vec![BTreeSet::new(); num_roles],
        }
    }

    fn clear(sets: &mut [BTreeSet<ArcStr>]) {
        sets.iter_mut().for_each(BTreeSet::clear);
    }
}

impl PatientDb {
    /// Count the values of `roles` on attached events whose type is in `event_types`.
    pub fn event_counters(
        &self,
        event_types: &[EventType],
        roles: &BTreeSet<ArcStr>,
    ) -> EventCounters {
        let event_types: BTreeSet<&EventType> = event_types.iter().collect();
        let role_list: Vec<ArcStr> = roles.iter().cloned().collect();
        let mut counters = EventCounters::new(roles);
        let mut scratch = Scratch::new(role_list.len());
        for patient in self.patients.values() {
            self.count_patient(patient, &event_types, &role_list, &mut counters, &mut scratch);
        }
        counters
    }

    /// The same as [`event_counters`](Self::event_counters), spread over the rayon thread pool.
    ///
    /// Every worker has its own scratch sets and partial counters. Partials are merged in
    /// patient order, so the result (tie order included) equals the sequential one.
    pub fn par_event_counters(
        &self,
        event_types: &[EventType],
        roles: &BTreeSet<ArcStr>,
    ) -> EventCounters {
        let event_types: BTreeSet<&EventType> = event_types.iter().collect();
        let role_list: Vec<ArcStr> = roles.iter().cloned().collect();
        let patients: Vec<&Patient> = self.patients.values().collect();
        patients
            .par_iter()
            .fold(
                || (EventCounters::new(roles), Scratch::new(role_list.len())),
                |(mut counters, mut scratch), patient| {
                    self.count_patient(patient, &event_types, &role_list, &mut counters, &mut scratch);
                    (counters, scratch)
                },
            )
            .map(|(counters, _)| counters)
            .reduce(
                || EventCounters::new(roles),
                |mut left, right| {
                    left.merge(right);
                    left
                },
            )
    }

    fn count_patient(
        &self,
        patient: &Patient,
        event_types: &BTreeSet<&EventType>,
        roles: &[ArcStr],
        counters: &mut EventCounters,
        scratch: &mut Scratch,
    ) {
        Scratch::clear(&mut scratch.patient);
        for (_, visit) in self.visits_of(patient) {
            Scratch::clear(&mut scratch.visit);
            for (_, event) in self.events_of(visit) {
                if !event_types.contains(&event.event_type()) {
                    continue;
                }
                Scratch::clear(&mut scratch.event);
                for (idx, role) in roles.iter().enumerate() {
                    let Some(value) = event.role(role) else {
                        continue;
                    };
                    for value in value.values() {
                        for seen in [
                            &mut scratch.event[idx],
                            &mut scratch.visit[idx],
                            &mut scratch.patient[idx],
                        ] {
                            if !seen.contains(value) {
                                seen.insert(value.into());
                            }
                        }
                    }
                }
                counters.flush(EntityLevel::Event, roles, &scratch.event);
            }
            counters.flush(EntityLevel::Visit, roles, &scratch.visit);
        }
        counters.flush(EntityLevel::Patient, roles, &scratch.patient);
    }
}

/// Ranked values per level, event type and role.
pub type TopK = BTreeMap<EntityLevel, BTreeMap<EventType, BTreeMap<ArcStr, Vec<(ArcStr, usize)>>>>;

/// The `k` most frequent values for every (level, event type, role) asked for. Roles that were
/// not counted are left out.
pub fn top_k(
    counters: &EventCounters,
    levels: &[EntityLevel],
    event_type_roles: &EventTypeRoles,
    k: usize,
) -> TopK {
    let mut out = TopK::new();
    for level in levels {
        let by_type = out.entry(*level).or_default();
        for (event_type, roles) in event_type_roles {
            let by_role = by_type.entry(event_type.clone()).or_default();
            for role in roles {
                if let Some(counter) = counters.get(*level, role) {
                    by_role.insert(role.clone(), counter.most_common(k));
                }
            }
        }
    }
    out
}

//! An in-memory graph of patients, their visits, and the clinical events recorded at each visit,
//! with a query layer on top for term matching, counting, and period/demographic splits.
//!
//! Entities live in flat tables inside [`PatientDb`] keyed by [`EntityId`]. Parents refer to
//! their children by ID, and children name their parents by domain identifier (`patient_id`,
//! `visit_id`), so there are no owning cycles.
mod db;
mod demographics;
mod range;
mod record;
pub mod roles;
mod util;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

pub use crate::{
    db::{
        counters::{top_k, Counter, EntityLevel, EventCounters, TopK},
        io::{DumpSummary, LoadSummary},
        matching::{same_roles, EventTypeRoles, Match},
        period::Frequency,
        PatientDb, Stats,
    },
    demographics::{BackfillSummary, DemographicRow},
    range::{Range, RangeSet, RangeSetCounts, RangeSetCountsWithMissing},
    record::{Entity, EventRecord, PatientRecord, VisitRecord},
    roles::{event_roles, EventKind, EventType, OtherEvent, RoleRef, RoleValue},
    util::{check_extension, header, path_exists, ResultExt},
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;

/// Age at which a patient counts as an adult.
pub const ADULT_AGE: u32 = 18;

/// The store-assigned identity of an entity.
///
/// Unique within one table of one store. Persisted as a decimal string.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(EntityId)
    }
}

impl Serialize for EntityId {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(EntityIdVisitor)
    }
}

struct EntityIdVisitor;

impl<'de> serde::de::Visitor<'de> for EntityIdVisitor {
    type Value = EntityId;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an entity ID (either as a decimal string or an unsigned integer)")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(serde::de::Error::custom)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(EntityId(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u64::try_from(v)
            .map(EntityId)
            .map_err(serde::de::Error::custom)
    }
}

/// Demographic attributes of a patient. Everything is optional because feeds rarely have all of
/// it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Demographics {
    pub age: Option<u32>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<ArcStr>,
    pub race: Option<ArcStr>,
    pub ethnicity: Option<ArcStr>,
    pub adult: bool,
    pub smoker: bool,
}

impl Demographics {
    /// Whole years between the date of birth and `date`. Negative if `date` is before birth.
    pub fn age_at(&self, date: impl Datelike) -> Option<i32> {
        let dob = self.date_of_birth?;
        let mut age = date.year() - dob.year();
        if (date.month(), date.day()) < (dob.month(), dob.day()) {
            age -= 1;
        }
        Some(age)
    }
}

/// A patient. `patient_id` is the identifier from the source data and is unique in a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patient {
    pub patient_id: ArcStr,
    pub demographics: Demographics,
    pub(crate) visits: Vec<EntityId>,
}

impl Patient {
    pub fn new(patient_id: impl Into<ArcStr>) -> Self {
        Patient {
            patient_id: patient_id.into(),
            demographics: Demographics::default(),
            visits: vec![],
        }
    }

    pub fn with_demographics(mut self, demographics: Demographics) -> Self {
        self.demographics = demographics;
        self
    }

    /// The visits of this patient, in the order they were added.
    pub fn visit_ids(&self) -> &[EntityId] {
        &self.visits
    }
}

/// A visit (encounter) of a patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visit {
    pub visit_id: ArcStr,
    pub patient_id: ArcStr,
    pub date: NaiveDate,
    pub(crate) events: Vec<EntityId>,
}

impl Visit {
    pub fn new(patient_id: impl Into<ArcStr>, visit_id: impl Into<ArcStr>, date: NaiveDate) -> Self {
        Visit {
            visit_id: visit_id.into(),
            patient_id: patient_id.into(),
            date,
            events: vec![],
        }
    }

    /// A visit for sources without visit identifiers: the date doubles as the visit ID, so
    /// there is one visit per patient per day.
    pub fn dated(patient_id: impl Into<ArcStr>, date: NaiveDate) -> Self {
        Self::new(patient_id, date_visit_id(date), date)
    }

    /// The events of this visit, in the order they were attached.
    pub fn event_ids(&self) -> &[EntityId] {
        &self.events
    }
}

/// A clinical event (a diagnosis, a medication, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Optional identifier from the source data.
    pub event_id: Option<ArcStr>,
    pub visit_id: ArcStr,
    pub patient_id: ArcStr,
    pub chartdate: NaiveDate,
    pub kind: EventKind,
    /// The visit this event is attached to, or `None` while it is staged.
    pub(crate) visit: Option<EntityId>,
}

impl Event {
    pub fn new(
        patient_id: impl Into<ArcStr>,
        visit_id: impl Into<ArcStr>,
        chartdate: NaiveDate,
        kind: EventKind,
    ) -> Self {
        Event {
            event_id: None,
            visit_id: visit_id.into(),
            patient_id: patient_id.into(),
            chartdate,
            kind,
            visit: None,
        }
    }

    /// An event whose visit is identified by its chart date (see [`Visit::dated`]).
    pub fn dated(patient_id: impl Into<ArcStr>, chartdate: NaiveDate, kind: EventKind) -> Self {
        Self::new(patient_id, date_visit_id(chartdate), chartdate, kind)
    }

    pub fn with_event_id(mut self, event_id: impl Into<ArcStr>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn role(&self, name: &str) -> Option<RoleRef<'_>> {
        self.kind.role(name)
    }

    pub fn is_attached(&self) -> bool {
        self.visit.is_some()
    }
}

fn date_visit_id(date: NaiveDate) -> ArcStr {
    date.format("%Y-%m-%d").to_string().into()
}

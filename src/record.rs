//! The persisted form of the graph: one JSON object per line, tagged by `__type__`.
//!
//! Patient lines nest their visits, and visits nest their events. Visit and event lines may
//! also stand alone, in which case they are linked up by their `patient_id`/`visit_id` when
//! loaded.
use crate::{
    roles::{EventKind, RawRoles, RoleValue},
    util::{date_serialize, lenient_date, opt_date_serialize, opt_lenient_date, optional_string},
    ArcStr, Demographics, EntityId, Event, Patient, Visit,
};
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A patient together with its visits and their events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientRecord {
    pub entity_id: Option<EntityId>,
    pub patient: Patient,
    pub visits: Vec<VisitRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitRecord {
    pub entity_id: Option<EntityId>,
    pub visit: Visit,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub entity_id: Option<EntityId>,
    pub event: Event,
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Patient(PatientRecord),
    Visit(VisitRecord),
    Event(EventRecord),
}

impl Entity {
    pub fn decode(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        let tag = value
            .get("__type__")
            .and_then(Value::as_str)
            .ok_or_else(|| format_err!("missing \"__type__\" tag"))?
            .to_owned();
        Ok(match tag.as_str() {
            "__Patient__" => Entity::Patient(serde_json::from_value::<PatientRaw>(value)?.try_into()?),
            "__Visit__" => Entity::Visit(serde_json::from_value::<VisitRaw>(value)?.try_into()?),
            "__Event__" => Entity::Event(serde_json::from_value::<EventRaw>(value)?.try_into()?),
            other => bail!("unknown entity type \"{}\"", other),
        })
    }
}

impl From<Patient> for PatientRecord {
    fn from(patient: Patient) -> Self {
        PatientRecord {
            entity_id: None,
            patient,
            visits: vec![],
        }
    }
}

impl PatientRecord {
    pub fn with_visit(mut self, visit: impl Into<VisitRecord>) -> Self {
        self.visits.push(visit.into());
        self
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&PatientRaw::from(self))?)
    }

    /// Forget every entity ID in the tree, so the receiving store assigns fresh ones.
    pub fn without_entity_ids(mut self) -> Self {
        self.entity_id = None;
        for visit in &mut self.visits {
            visit.entity_id = None;
            for event in &mut visit.events {
                event.entity_id = None;
            }
        }
        self
    }

    pub fn num_events(&self) -> usize {
        self.visits.iter().map(|v| v.events.len()).sum()
    }
}

impl From<Visit> for VisitRecord {
    fn from(visit: Visit) -> Self {
        VisitRecord {
            entity_id: None,
            visit,
            events: vec![],
        }
    }
}

impl VisitRecord {
    pub fn with_event(mut self, event: impl Into<EventRecord>) -> Self {
        self.events.push(event.into());
        self
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&VisitRaw::from(self))?)
    }
}

impl From<Event> for EventRecord {
    fn from(event: Event) -> Self {
        EventRecord {
            entity_id: None,
            event,
        }
    }
}

impl EventRecord {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&EventRaw::from(self))?)
    }
}

// The raw forms below mirror the JSON exactly.

#[derive(Debug, Serialize, Deserialize)]
enum PatientTag {
    #[serde(rename = "__Patient__")]
    Patient,
}

#[derive(Debug, Serialize, Deserialize)]
enum VisitTag {
    #[serde(rename = "__Visit__")]
    Visit,
}

#[derive(Debug, Serialize, Deserialize)]
enum EventTag {
    #[serde(rename = "__Event__")]
    Event,
}

#[derive(Debug, Serialize, Deserialize)]
struct PatientRaw {
    #[serde(rename = "__type__")]
    tag: PatientTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity_id: Option<EntityId>,
    #[serde(deserialize_with = "id_string")]
    patient_id: ArcStr,
    #[serde(default)]
    age: Option<u32>,
    #[serde(
        default,
        alias = "dob",
        deserialize_with = "opt_lenient_date",
        serialize_with = "opt_date_serialize"
    )]
    date_of_birth: Option<NaiveDate>,
    #[serde(default, deserialize_with = "optional_string")]
    gender: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    race: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    ethnicity: Option<ArcStr>,
    #[serde(default)]
    adult: bool,
    #[serde(default)]
    smoker: bool,
    #[serde(default)]
    visits: Vec<VisitRaw>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VisitRaw {
    #[serde(rename = "__type__")]
    tag: VisitTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity_id: Option<EntityId>,
    #[serde(alias = "hadm_id", deserialize_with = "id_string")]
    visit_id: ArcStr,
    #[serde(deserialize_with = "id_string")]
    patient_id: ArcStr,
    #[serde(deserialize_with = "lenient_date", serialize_with = "date_serialize")]
    date: NaiveDate,
    #[serde(default)]
    events: Vec<EventRaw>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventRaw {
    #[serde(rename = "__type__")]
    tag: EventTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity_id: Option<EntityId>,
    #[serde(
        default,
        deserialize_with = "optional_string",
        skip_serializing_if = "Option::is_none"
    )]
    event_id: Option<ArcStr>,
    #[serde(alias = "provenance", deserialize_with = "id_string")]
    visit_id: ArcStr,
    #[serde(deserialize_with = "id_string")]
    patient_id: ArcStr,
    #[serde(deserialize_with = "lenient_date", serialize_with = "date_serialize")]
    chartdate: NaiveDate,
    event_type: ArcStr,
    #[serde(default)]
    roles: BTreeMap<String, Value>,
}

/// Source identifiers are sometimes written as numbers.
fn id_string<'de, D>(d: D) -> Result<ArcStr, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Str(String),
        Int(i64),
    }
    Ok(match Repr::deserialize(d)? {
        Repr::Str(s) => s.into(),
        Repr::Int(i) => i.to_string().into(),
    })
}

impl TryFrom<PatientRaw> for PatientRecord {
    type Error = Error;
    fn try_from(raw: PatientRaw) -> Result<Self> {
        let visits = raw
            .visits
            .into_iter()
            .map(|visit| {
                let mut visit = VisitRecord::try_from(visit)?;
                visit.set_patient_id(&raw.patient_id);
                Ok(visit)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PatientRecord {
            entity_id: raw.entity_id,
            patient: Patient {
                patient_id: raw.patient_id,
                demographics: Demographics {
                    age: raw.age,
                    date_of_birth: raw.date_of_birth,
                    gender: raw.gender,
                    race: raw.race,
                    ethnicity: raw.ethnicity,
                    adult: raw.adult,
                    smoker: raw.smoker,
                },
                visits: vec![],
            },
            visits,
        })
    }
}

impl VisitRecord {
    /// Children always take their identifiers from the parent they are nested in.
    pub(crate) fn set_patient_id(&mut self, patient_id: &ArcStr) {
        if self.visit.patient_id != *patient_id {
            event!(
                Level::DEBUG,
                "visit {} nested under patient {} names patient {}",
                self.visit.visit_id,
                patient_id,
                self.visit.patient_id
            );
        }
        self.visit.patient_id = patient_id.clone();
        for event in &mut self.events {
            event.event.patient_id = patient_id.clone();
        }
    }
}

impl TryFrom<VisitRaw> for VisitRecord {
    type Error = Error;
    fn try_from(raw: VisitRaw) -> Result<Self> {
        let events = raw
            .events
            .into_iter()
            .map(|event| {
                let mut event = EventRecord::try_from(event)?;
                event.event.visit_id = raw.visit_id.clone();
                Ok(event)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(VisitRecord {
            entity_id: raw.entity_id,
            visit: Visit {
                visit_id: raw.visit_id,
                patient_id: raw.patient_id,
                date: raw.date,
                events: vec![],
            },
            events,
        })
    }
}

impl TryFrom<EventRaw> for EventRecord {
    type Error = Error;
    fn try_from(raw: EventRaw) -> Result<Self> {
        let roles = raw
            .roles
            .into_iter()
            .filter_map(|(name, value)| match role_value(value) {
                Ok(Some(value)) => Some(Ok((name, value))),
                Ok(None) => None,
                Err(e) => Some(Err(e.context(format!("in role \"{}\"", name)))),
            })
            .collect::<Result<RawRoles>>()?;
        let kind = EventKind::from_roles(&raw.event_type, roles)?;
        Ok(EventRecord {
            entity_id: raw.entity_id,
            event: Event {
                event_id: raw.event_id,
                visit_id: raw.visit_id,
                patient_id: raw.patient_id,
                chartdate: raw.chartdate,
                kind,
                visit: None,
            },
        })
    }
}

/// Nulls and empty strings are absent values. Scalars are kept as their text.
fn role_value(value: Value) -> Result<Option<RoleValue>> {
    fn scalar(value: Value) -> Result<Option<ArcStr>> {
        Ok(match value {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.into()),
            Value::Number(n) => Some(n.to_string().into()),
            Value::Bool(b) => Some(b.to_string().into()),
            other => bail!("expected a scalar, found {}", other),
        })
    }
    Ok(match value {
        Value::Array(list) => {
            let list = list
                .into_iter()
                .filter_map(|el| scalar(el).transpose())
                .collect::<Result<Vec<_>>>()?;
            if list.is_empty() {
                None
            } else {
                Some(RoleValue::List(list))
            }
        }
        other => scalar(other)?.map(RoleValue::Text),
    })
}

impl From<&PatientRecord> for PatientRaw {
    fn from(record: &PatientRecord) -> Self {
        let demographics = &record.patient.demographics;
        PatientRaw {
            tag: PatientTag::Patient,
            entity_id: record.entity_id,
            patient_id: record.patient.patient_id.clone(),
            age: demographics.age,
            date_of_birth: demographics.date_of_birth,
            gender: demographics.gender.clone(),
            race: demographics.race.clone(),
            ethnicity: demographics.ethnicity.clone(),
            adult: demographics.adult,
            smoker: demographics.smoker,
            visits: record.visits.iter().map(VisitRaw::from).collect(),
        }
    }
}

impl From<&VisitRecord> for VisitRaw {
    fn from(record: &VisitRecord) -> Self {
        VisitRaw {
            tag: VisitTag::Visit,
            entity_id: record.entity_id,
            visit_id: record.visit.visit_id.clone(),
            patient_id: record.visit.patient_id.clone(),
            date: record.visit.date,
            events: record.events.iter().map(EventRaw::from).collect(),
        }
    }
}

impl From<&EventRecord> for EventRaw {
    fn from(record: &EventRecord) -> Self {
        let event = &record.event;
        EventRaw {
            tag: EventTag::Event,
            entity_id: record.entity_id,
            event_id: event.event_id.clone(),
            visit_id: event.visit_id.clone(),
            patient_id: event.patient_id.clone(),
            chartdate: event.chartdate,
            event_type: event.event_type().as_str().into(),
            roles: event
                .kind
                .to_roles()
                .into_iter()
                .map(|(name, value)| {
                    let value = match value {
                        RoleValue::Text(s) => Value::String(s.to_string()),
                        RoleValue::List(list) => Value::Array(
                            list.iter().map(|s| Value::String(s.to_string())).collect(),
                        ),
                    };
                    (name.to_string(), value)
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{roles::RoleRef, EventType};

    const PATIENT_LINE: &str = r#"{"__type__": "__Patient__", "entity_id": "1", "patient_id": "42",
        "gender": "F", "dob": "1980-02-01", "visits": [
        {"__type__": "__Visit__", "entity_id": "7", "visit_id": "v1", "patient_id": "42",
         "date": "2020-01-01 00:00:00", "events": [
            {"__type__": "__Event__", "entity_id": "3", "visit_id": "v1", "patient_id": "42",
             "chartdate": "2020-01-01", "event_type": "DiagnosisEvent",
             "roles": {"diagnosis_name": "Depression", "diagnosis_icd9": null}}
        ]}
    ]}"#;

    #[test]
    fn decode_nested_patient() {
        let Entity::Patient(record) = Entity::decode(&PATIENT_LINE.replace('\n', " ")).unwrap()
        else {
            panic!("expected a patient")
        };
        assert_eq!(record.entity_id, Some(EntityId(1)));
        assert_eq!(&*record.patient.patient_id, "42");
        assert_eq!(
            record.patient.demographics.date_of_birth,
            NaiveDate::from_ymd_opt(1980, 2, 1)
        );
        assert_eq!(record.visits.len(), 1);
        let visit = &record.visits[0];
        assert_eq!(visit.entity_id, Some(EntityId(7)));
        let event = &visit.events[0].event;
        assert_eq!(event.event_type(), EventType::Diagnosis);
        assert_eq!(event.role("diagnosis_name"), Some(RoleRef::One("Depression")));
        assert_eq!(event.role("diagnosis_icd9"), None);
    }

    #[test]
    fn encode_then_decode() {
        let Entity::Patient(record) = Entity::decode(&PATIENT_LINE.replace('\n', " ")).unwrap()
        else {
            panic!("expected a patient")
        };
        let line = record.encode().unwrap();
        assert!(line.contains("\"__type__\":\"__Patient__\""));
        assert!(line.contains("\"entity_id\":\"1\""));
        assert!(line.contains("\"date_of_birth\":\"1980-02-01\""));
        assert_eq!(Entity::decode(&line).unwrap(), Entity::Patient(record));
    }

    #[test]
    fn standalone_event_with_numeric_ids() {
        let line = r#"{"__type__": "__Event__", "provenance": 10, "patient_id": 5,
            "chartdate": "2019-07-04", "event_type": "LabEvent",
            "roles": {"test_name": "HbA1c", "test_value": 6.5}}"#;
        let Entity::Event(record) = Entity::decode(line).unwrap() else {
            panic!("expected an event")
        };
        assert_eq!(record.entity_id, None);
        assert_eq!(&*record.event.visit_id, "10");
        assert_eq!(&*record.event.patient_id, "5");
        assert_eq!(record.event.role("test_value"), Some(RoleRef::One("6.5")));
    }

    #[test]
    fn malformed_lines() {
        assert!(Entity::decode("not json").is_err());
        assert!(Entity::decode(r#"{"patient_id": "1"}"#).is_err());
        assert!(Entity::decode(r#"{"__type__": "__Ward__"}"#).is_err());
        // a medication role on a diagnosis
        assert!(Entity::decode(
            r#"{"__type__": "__Event__", "visit_id": "1", "patient_id": "1",
                "chartdate": "2019-07-04", "event_type": "DiagnosisEvent",
                "roles": {"medication": "aspirin"}}"#
        )
        .is_err());
    }
}

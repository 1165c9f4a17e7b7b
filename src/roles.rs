//! Event kinds and the role vocabulary attached to each of them.
//!
//! In the persisted format every event carries an `event_type` tag and a flat `roles` object. In
//! memory the roles live in a variant of [`EventKind`], so an event can only ever have the shape
//! of its own type. The name-based accessors ([`EventKind::role`], [`EventKind::to_roles`],
//! [`EventKind::from_roles`]) exist for the query layer and for the on-disk format.
use crate::ArcStr;
use itertools::Either;
use once_cell::sync::Lazy;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
    fmt, iter,
    str::FromStr,
};

pub const DIAGNOSIS_ROLES: &[&str] = &["diagnosis_icd9", "diagnosis_name", "diagnosis_long_name"];
pub const MEDICATION_ROLES: &[&str] = &["dosage", "duration", "indication", "medication"];
pub const LAB_ROLES: &[&str] = &["test_name", "test_status", "test_value"];
pub const PROCEDURE_ROLES: &[&str] = &["procedure_icd9", "procedure_name", "targeted_organs"];
pub const VITAL_ROLES: &[&str] = &["location", "vital_outcome"];
pub const PATIENT_ATTRIBUTE_ROLES: &[&str] = &["attribute", "attribute_value"];
/// The MedDRA hierarchy text roles. These are also legal on diagnosis events.
pub const MEDDRA_ROLES: &[&str] = &["SOC_text", "HLGT_text", "HLT_text", "PT_text", "concept_text"];
pub const DRUG_EXPOSURE_ROLES: &[&str] =
    &["drug_concept_name", "drug_concept_id", "quantity", "route"];

/// Every role name any known event type can carry.
static ALL_KNOWN_ROLES: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        DIAGNOSIS_ROLES,
        MEDICATION_ROLES,
        LAB_ROLES,
        PROCEDURE_ROLES,
        VITAL_ROLES,
        PATIENT_ATTRIBUTE_ROLES,
        MEDDRA_ROLES,
        DRUG_EXPOSURE_ROLES,
    ]
    .into_iter()
    .flatten()
    .copied()
    .collect()
});

/// The type tag of an event.
///
/// The set of tags is open: anything we don't recognise is kept as `Other` so it survives a
/// load/dump cycle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    Diagnosis,
    Medication,
    Lab,
    Procedure,
    Vital,
    PatientAttribute,
    Meddra,
    DrugExposure,
    Other(ArcStr),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        use EventType::*;
        match self {
            Diagnosis => "DiagnosisEvent",
            Medication => "MedicationEvent",
            Lab => "LabEvent",
            Procedure => "ProcedureEvent",
            Vital => "VitalEvent",
            PatientAttribute => "PatientEvent",
            Meddra => "MEDDRAEvent",
            DrugExposure => "DRUG_EXPOSURE",
            Other(name) => name,
        }
    }

    /// The role names events of this type may carry.
    ///
    /// `Other` has no fixed vocabulary, so this returns an empty slice for it.
    pub fn roles(&self) -> &'static [&'static str] {
        use EventType::*;
        match self {
            Diagnosis => DIAGNOSIS_ROLES,
            Medication => MEDICATION_ROLES,
            Lab => LAB_ROLES,
            Procedure => PROCEDURE_ROLES,
            Vital => VITAL_ROLES,
            PatientAttribute => PATIENT_ATTRIBUTE_ROLES,
            Meddra => MEDDRA_ROLES,
            DrugExposure => DRUG_EXPOSURE_ROLES,
            Other(_) => &[],
        }
    }
}

impl FromStr for EventType {
    type Err = Infallible;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        use EventType::*;
        Ok(match input {
            "DiagnosisEvent" => Diagnosis,
            "MedicationEvent" => Medication,
            "LabEvent" => Lab,
            "ProcedureEvent" => Procedure,
            "VitalEvent" => Vital,
            "PatientEvent" => PatientAttribute,
            "MEDDRAEvent" => Meddra,
            "DRUG_EXPOSURE" => DrugExposure,
            other => Other(other.into()),
        })
    }
}

impl From<&str> for EventType {
    fn from(input: &str) -> Self {
        match input.parse() {
            Ok(ty) => ty,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(d)?;
        Ok(EventType::from(s.as_str()))
    }
}

/// The union of role names used by the given event types.
///
/// If `include_meddra` is set, the MedDRA text roles are added as well (they ride along on
/// diagnosis events).
pub fn event_roles<'a>(
    event_types: impl IntoIterator<Item = &'a EventType>,
    include_meddra: bool,
) -> BTreeSet<ArcStr> {
    let mut roles: BTreeSet<ArcStr> = event_types
        .into_iter()
        .flat_map(|ty| ty.roles().iter().copied())
        .map(ArcStr::from)
        .collect();
    if include_meddra {
        roles.extend(MEDDRA_ROLES.iter().copied().map(ArcStr::from));
    }
    roles
}

/// Whether any known event type uses this role name.
pub fn is_known_role(role: &str) -> bool {
    ALL_KNOWN_ROLES.contains(role)
}

/// The value of a role as it appears in the persisted format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleValue {
    Text(ArcStr),
    List(Vec<ArcStr>),
}

impl RoleValue {
    pub fn as_ref(&self) -> RoleRef<'_> {
        match self {
            RoleValue::Text(s) => RoleRef::One(s),
            RoleValue::List(l) => RoleRef::Many(l),
        }
    }
}

/// A borrowed role value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RoleRef<'a> {
    One(&'a str),
    Many(&'a [ArcStr]),
}

impl<'a> RoleRef<'a> {
    /// The individual values of this role. Empty strings are not values.
    pub fn values(self) -> impl Iterator<Item = &'a str> + 'a {
        let iter = match self {
            RoleRef::One(s) => Either::Left(iter::once(s)),
            RoleRef::Many(list) => Either::Right(list.iter().map(|s| &**s)),
        };
        iter.filter(|s| !s.is_empty())
    }

    /// Case-insensitive equality with `term` (already lower-cased).
    ///
    /// A list matches if any of its elements does.
    pub fn matches_lowercase(self, term: &str) -> bool {
        self.values().any(|v| v.to_lowercase() == term)
    }
}

/// MedDRA hierarchy text for a mention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meddra {
    pub soc_text: Option<ArcStr>,
    pub hlgt_text: Option<ArcStr>,
    pub hlt_text: Option<ArcStr>,
    pub pt_text: Option<ArcStr>,
    pub concept_text: Option<ArcStr>,
}

impl Meddra {
    fn role(&self, name: &str) -> Option<&ArcStr> {
        match name {
            "SOC_text" => self.soc_text.as_ref(),
            "HLGT_text" => self.hlgt_text.as_ref(),
            "HLT_text" => self.hlt_text.as_ref(),
            "PT_text" => self.pt_text.as_ref(),
            "concept_text" => self.concept_text.as_ref(),
            _ => None,
        }
    }

    fn fields(&self) -> [(&'static str, &Option<ArcStr>); 5] {
        [
            ("SOC_text", &self.soc_text),
            ("HLGT_text", &self.hlgt_text),
            ("HLT_text", &self.hlt_text),
            ("PT_text", &self.pt_text),
            ("concept_text", &self.concept_text),
        ]
    }

    fn take(roles: &mut RawRoles) -> Result<Option<Self>> {
        let meddra = Meddra {
            soc_text: take_text(roles, "SOC_text")?,
            hlgt_text: take_text(roles, "HLGT_text")?,
            hlt_text: take_text(roles, "HLT_text")?,
            pt_text: take_text(roles, "PT_text")?,
            concept_text: take_text(roles, "concept_text")?,
        };
        Ok(if meddra == Meddra::default() {
            None
        } else {
            Some(meddra)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnosis {
    pub icd9: Option<ArcStr>,
    pub name: Option<ArcStr>,
    pub long_name: Option<ArcStr>,
    /// Extraction feeds annotate diagnoses with the MedDRA terms that produced them.
    pub meddra: Option<Meddra>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Medication {
    pub dosage: Option<ArcStr>,
    pub duration: Option<ArcStr>,
    pub indication: Option<ArcStr>,
    pub medication: Option<ArcStr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lab {
    pub test_name: Option<ArcStr>,
    pub test_status: Option<ArcStr>,
    pub test_value: Option<ArcStr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Procedure {
    pub icd9: Option<ArcStr>,
    pub name: Option<ArcStr>,
    pub targeted_organs: Vec<ArcStr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vital {
    pub location: Option<ArcStr>,
    /// "ALIVE" or "DEAD" in the extraction feeds.
    pub outcome: Option<ArcStr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientAttribute {
    pub attribute: Option<ArcStr>,
    pub value: Option<ArcStr>,
}

/// An OMOP `drug_exposure` row joined against the concept table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrugExposure {
    pub drug_concept_name: Option<ArcStr>,
    pub drug_concept_id: Option<ArcStr>,
    pub quantity: Option<ArcStr>,
    pub route: Option<ArcStr>,
}

/// The typed payload of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Diagnosis(Diagnosis),
    Medication(Medication),
    Lab(Lab),
    Procedure(Procedure),
    Vital(Vital),
    PatientAttribute(PatientAttribute),
    Meddra(Meddra),
    DrugExposure(DrugExposure),
    /// An event type we have no schema for. Roles are kept verbatim.
    Other(OtherEvent),
}

/// The payload of an event whose type has no schema.
///
/// Only built by [`EventKind::from_roles`] (or [`EventKind::other`]), so the tag is never one of
/// the known event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtherEvent {
    event_type: ArcStr,
    roles: BTreeMap<ArcStr, RoleValue>,
}

impl OtherEvent {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn roles(&self) -> &BTreeMap<ArcStr, RoleValue> {
        &self.roles
    }
}

/// Roles in the middle of being decoded.
pub(crate) type RawRoles = BTreeMap<String, RoleValue>;

impl EventKind {
    pub fn event_type(&self) -> EventType {
        use EventKind::*;
        match self {
            Diagnosis(_) => EventType::Diagnosis,
            Medication(_) => EventType::Medication,
            Lab(_) => EventType::Lab,
            Procedure(_) => EventType::Procedure,
            Vital(_) => EventType::Vital,
            PatientAttribute(_) => EventType::PatientAttribute,
            Meddra(_) => EventType::Meddra,
            DrugExposure(_) => EventType::DrugExposure,
            Other(other) => EventType::Other(other.event_type.clone()),
        }
    }

    /// Look a role up by name. Roles that are unset, or that this kind doesn't have, are `None`.
    pub fn role(&self, name: &str) -> Option<RoleRef<'_>> {
        use EventKind::*;
        let text = match self {
            Diagnosis(d) => match name {
                "diagnosis_icd9" => d.icd9.as_ref(),
                "diagnosis_name" => d.name.as_ref(),
                "diagnosis_long_name" => d.long_name.as_ref(),
                _ => d.meddra.as_ref().and_then(|m| m.role(name)),
            },
            Medication(m) => match name {
                "dosage" => m.dosage.as_ref(),
                "duration" => m.duration.as_ref(),
                "indication" => m.indication.as_ref(),
                "medication" => m.medication.as_ref(),
                _ => None,
            },
            Lab(l) => match name {
                "test_name" => l.test_name.as_ref(),
                "test_status" => l.test_status.as_ref(),
                "test_value" => l.test_value.as_ref(),
                _ => None,
            },
            Procedure(p) => match name {
                "procedure_icd9" => p.icd9.as_ref(),
                "procedure_name" => p.name.as_ref(),
                "targeted_organs" if !p.targeted_organs.is_empty() => {
                    return Some(RoleRef::Many(&p.targeted_organs))
                }
                _ => None,
            },
            Vital(v) => match name {
                "location" => v.location.as_ref(),
                "vital_outcome" => v.outcome.as_ref(),
                _ => None,
            },
            PatientAttribute(p) => match name {
                "attribute" => p.attribute.as_ref(),
                "attribute_value" => p.value.as_ref(),
                _ => None,
            },
            Meddra(m) => m.role(name),
            DrugExposure(d) => match name {
                "drug_concept_name" => d.drug_concept_name.as_ref(),
                "drug_concept_id" => d.drug_concept_id.as_ref(),
                "quantity" => d.quantity.as_ref(),
                "route" => d.route.as_ref(),
                _ => None,
            },
            Other(other) => return other.roles.get(name).map(RoleValue::as_ref),
        };
        text.map(|s| RoleRef::One(s))
    }

    /// Flatten into the `roles` object of the persisted format. Unset roles are left out.
    pub fn to_roles(&self) -> BTreeMap<ArcStr, RoleValue> {
        use EventKind::*;
        let mut out = BTreeMap::new();
        let mut put = |name: &str, value: &Option<ArcStr>| {
            if let Some(value) = value {
                out.insert(ArcStr::from(name), RoleValue::Text(value.clone()));
            }
        };
        match self {
            Diagnosis(d) => {
                put("diagnosis_icd9", &d.icd9);
                put("diagnosis_name", &d.name);
                put("diagnosis_long_name", &d.long_name);
                if let Some(m) = &d.meddra {
                    for (name, value) in m.fields() {
                        put(name, value);
                    }
                }
            }
            Medication(m) => {
                put("dosage", &m.dosage);
                put("duration", &m.duration);
                put("indication", &m.indication);
                put("medication", &m.medication);
            }
            Lab(l) => {
                put("test_name", &l.test_name);
                put("test_status", &l.test_status);
                put("test_value", &l.test_value);
            }
            Procedure(p) => {
                put("procedure_icd9", &p.icd9);
                put("procedure_name", &p.name);
                if !p.targeted_organs.is_empty() {
                    out.insert(
                        "targeted_organs".into(),
                        RoleValue::List(p.targeted_organs.clone()),
                    );
                }
            }
            Vital(v) => {
                put("location", &v.location);
                put("vital_outcome", &v.outcome);
            }
            PatientAttribute(p) => {
                put("attribute", &p.attribute);
                put("attribute_value", &p.value);
            }
            Meddra(m) => {
                for (name, value) in m.fields() {
                    put(name, value);
                }
            }
            DrugExposure(d) => {
                put("drug_concept_name", &d.drug_concept_name);
                put("drug_concept_id", &d.drug_concept_id);
                put("quantity", &d.quantity);
                put("route", &d.route);
            }
            Other(other) => return other.roles.clone(),
        }
        out
    }

    /// Rebuild a typed event from its tag and flat roles.
    ///
    /// Fails if a known event type carries a role outside its vocabulary, or a list where a
    /// single value is expected.
    pub fn from_roles(event_type: &str, mut roles: RawRoles) -> Result<Self> {
        use EventKind::*;
        let kind = match EventType::from(event_type) {
            EventType::Diagnosis => Diagnosis(self::Diagnosis {
                icd9: take_text(&mut roles, "diagnosis_icd9")?,
                name: take_text(&mut roles, "diagnosis_name")?,
                long_name: take_text(&mut roles, "diagnosis_long_name")?,
                meddra: self::Meddra::take(&mut roles)?,
            }),
            EventType::Medication => Medication(self::Medication {
                dosage: take_text(&mut roles, "dosage")?,
                duration: take_text(&mut roles, "duration")?,
                indication: take_text(&mut roles, "indication")?,
                medication: take_text(&mut roles, "medication")?,
            }),
            EventType::Lab => Lab(self::Lab {
                test_name: take_text(&mut roles, "test_name")?,
                test_status: take_text(&mut roles, "test_status")?,
                test_value: take_text(&mut roles, "test_value")?,
            }),
            EventType::Procedure => Procedure(self::Procedure {
                icd9: take_text(&mut roles, "procedure_icd9")?,
                name: take_text(&mut roles, "procedure_name")?,
                targeted_organs: match roles.remove("targeted_organs") {
                    None => vec![],
                    Some(RoleValue::List(list)) => list,
                    Some(RoleValue::Text(one)) => vec![one],
                },
            }),
            EventType::Vital => Vital(self::Vital {
                location: take_text(&mut roles, "location")?,
                outcome: take_text(&mut roles, "vital_outcome")?,
            }),
            EventType::PatientAttribute => PatientAttribute(self::PatientAttribute {
                attribute: take_text(&mut roles, "attribute")?,
                value: take_text(&mut roles, "attribute_value")?,
            }),
            EventType::Meddra => Meddra(self::Meddra::take(&mut roles)?.unwrap_or_default()),
            EventType::DrugExposure => DrugExposure(self::DrugExposure {
                drug_concept_name: take_text(&mut roles, "drug_concept_name")?,
                drug_concept_id: take_text(&mut roles, "drug_concept_id")?,
                quantity: take_text(&mut roles, "quantity")?,
                route: take_text(&mut roles, "route")?,
            }),
            EventType::Other(event_type) => {
                return Ok(Other(OtherEvent {
                    event_type,
                    roles: roles
                        .into_iter()
                        .map(|(k, v)| (ArcStr::from(k), v))
                        .collect(),
                }))
            }
        };
        ensure!(
            roles.is_empty(),
            "unexpected roles {:?} for event type \"{}\"",
            roles.keys().collect::<Vec<_>>(),
            event_type
        );
        Ok(kind)
    }

    /// Build an event from a tag and role pairs. Known tags give their typed variant, and fail
    /// the same way [`from_roles`](Self::from_roles) does.
    pub fn other<K: Into<String>>(
        event_type: &str,
        roles: impl IntoIterator<Item = (K, RoleValue)>,
    ) -> Result<Self> {
        let roles: RawRoles = roles.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self::from_roles(event_type, roles)
    }

    /// Iterate over `(role name, value)` pairs that are set.
    pub fn iter_roles(&self) -> impl Iterator<Item = (ArcStr, RoleValue)> {
        self.to_roles().into_iter()
    }
}

fn take_text(roles: &mut RawRoles, name: &str) -> Result<Option<ArcStr>> {
    match roles.remove(name) {
        None => Ok(None),
        Some(RoleValue::Text(s)) if s.is_empty() => Ok(None),
        Some(RoleValue::Text(s)) => Ok(Some(s)),
        Some(RoleValue::List(_)) => bail!("role \"{}\" should be a single value", name),
    }
}

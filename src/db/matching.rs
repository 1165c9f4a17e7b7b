//! Finding the patients whose events mention a term.
use super::PatientDb;
use crate::{ArcStr, EntityId, EventType};
use qu::ick_use::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Which roles to look at, per event type.
pub type EventTypeRoles = BTreeMap<EventType, BTreeSet<ArcStr>>;

/// One event role that held a term.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Match {
    pub patient_id: ArcStr,
    pub visit_id: ArcStr,
    /// The store-assigned ID of the event, since the source `event_id` is optional.
    pub event: EntityId,
    pub event_id: Option<ArcStr>,
    pub event_type: EventType,
    pub role: ArcStr,
    pub term: ArcStr,
}

impl PatientDb {
    /// Every attached event of a type in `roles` whose listed role equals `term`, ignoring case.
    ///
    /// Returns a store (named after the term) holding each matching patient once, with their
    /// full history, and the set of matches. List-valued roles match if any element does.
    pub fn match_patients(&self, term: &str, roles: &EventTypeRoles) -> (PatientDb, BTreeSet<Match>) {
        let term_lower = term.to_lowercase();
        let term: ArcStr = term.into();
        let mut matches = BTreeSet::new();
        let mut patients = BTreeSet::new();

        for (patient_entity, patient) in self.patients() {
            for (_, visit) in self.visits_of(patient) {
                for (event_entity, event) in self.events_of(visit) {
                    let event_type = event.event_type();
                    let Some(wanted) = roles.get(&event_type) else {
                        continue;
                    };
                    for role in wanted {
                        let Some(value) = event.role(role) else {
                            continue;
                        };
                        if value.matches_lowercase(&term_lower) {
                            patients.insert(patient_entity);
                            matches.insert(Match {
                                patient_id: patient.patient_id.clone(),
                                visit_id: visit.visit_id.clone(),
                                event: event_entity,
                                event_id: event.event_id.clone(),
                                event_type: event_type.clone(),
                                role: role.clone(),
                                term: term.clone(),
                            });
                        }
                    }
                }
            }
        }
        event!(
            Level::DEBUG,
            "\"{}\" matched {} events in {} patients",
            term,
            matches.len(),
            patients.len()
        );
        (self.select_patients(term, patients), matches)
    }

    /// [`match_patients`](Self::match_patients) for each term, with the results unioned.
    pub fn match_terms<I, S>(&self, terms: I, roles: &EventTypeRoles) -> (PatientDb, BTreeSet<Match>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names = vec![];
        let mut patients = BTreeSet::new();
        let mut matches = BTreeSet::new();
        for term in terms {
            let (db, term_matches) = self.match_patients(term.as_ref(), roles);
            names.push(term.as_ref().to_owned());
            patients.extend(db.patients().map(|(id, _)| id));
            matches.extend(term_matches);
        }
        (self.select_patients(names.join("|"), patients), matches)
    }
}

/// Roles to look at for each event type, with every type sharing `roles`.
pub fn same_roles<'a>(
    event_types: impl IntoIterator<Item = &'a EventType>,
    roles: &BTreeSet<ArcStr>,
) -> EventTypeRoles {
    event_types
        .into_iter()
        .map(|ty| (ty.clone(), roles.clone()))
        .collect()
}

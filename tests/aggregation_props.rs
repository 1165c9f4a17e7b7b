//! Consistency of counting and partitioning over generated stores.

use chrono::NaiveDate;
use patient_db::{
    roles::Diagnosis, ArcStr, EntityLevel, Event, EventKind, EventType, Frequency, PatientDb,
};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};

const NAMES: &[&str] = &["Depression", "Anxiety", "Insomnia", "Asthma"];

/// (patient, visit, month, diagnosis name)
fn rows() -> impl Strategy<Value = Vec<(u8, u8, u32, usize)>> {
    prop::collection::vec((0u8..6, 0u8..3, 1u32..=12, 0..NAMES.len()), 0..60)
}

fn build(rows: &[(u8, u8, u32, usize)]) -> PatientDb {
    let mut db = PatientDb::new("generated");
    for &(patient, visit, month, name) in rows {
        let kind = EventKind::Diagnosis(Diagnosis {
            name: Some(NAMES[name].into()),
            ..Default::default()
        });
        let date = NaiveDate::from_ymd_opt(2020, month, 1).unwrap();
        db.add_event(
            Event::new(format!("p{}", patient), format!("v{}", visit), date, kind),
            None,
        );
    }
    db.attach_events_to_visits();
    db
}

fn name_roles() -> BTreeSet<ArcStr> {
    ["diagnosis_name"].into_iter().map(ArcStr::from).collect()
}

proptest! {
    #[test]
    fn patient_count_is_distinct_patients(rows in rows()) {
        let db = build(&rows);
        let counters = db.event_counters(&[EventType::Diagnosis], &name_roles());

        let mut patients: HashMap<&str, HashSet<u8>> = HashMap::new();
        let mut events: HashMap<&str, usize> = HashMap::new();
        for &(patient, _, _, name) in &rows {
            patients.entry(NAMES[name]).or_default().insert(patient);
            *events.entry(NAMES[name]).or_default() += 1;
        }
        for name in NAMES {
            let expected = patients.get(name).map_or(0, HashSet::len);
            let by_patient = counters.get(EntityLevel::Patient, "diagnosis_name").unwrap();
            let by_visit = counters.get(EntityLevel::Visit, "diagnosis_name").unwrap();
            let by_event = counters.get(EntityLevel::Event, "diagnosis_name").unwrap();
            prop_assert_eq!(by_patient.get(name), expected);
            prop_assert_eq!(by_event.get(name), events.get(name).copied().unwrap_or(0));
            prop_assert!(by_patient.get(name) <= by_visit.get(name));
            prop_assert!(by_visit.get(name) <= by_event.get(name));
        }
    }

    #[test]
    fn parallel_equals_sequential(rows in rows(), k in 1usize..5) {
        let db = build(&rows);
        let roles = name_roles();
        let sequential = db.event_counters(&[EventType::Diagnosis], &roles);
        let parallel = db.par_event_counters(&[EventType::Diagnosis], &roles);
        for level in EntityLevel::ALL {
            let a = sequential.get(level, "diagnosis_name").unwrap();
            let b = parallel.get(level, "diagnosis_name").unwrap();
            prop_assert_eq!(a.most_common(k), b.most_common(k));
        }
        prop_assert_eq!(sequential, parallel);
    }

    #[test]
    fn periods_partition_the_store(rows in rows()) {
        let db = build(&rows);
        for frequency in [Frequency::Month, Frequency::Quarter, Frequency::Year] {
            let periods = db.agg_time(frequency);
            let visits: usize = periods.values().map(PatientDb::num_visits).sum();
            let events: usize = periods.values().map(PatientDb::num_events).sum();
            prop_assert_eq!(visits, db.num_visits());
            prop_assert_eq!(events, db.num_events());
            for (period, part) in &periods {
                prop_assert_eq!(part.name(), period.as_str());
                for (_, visit) in part.visits() {
                    prop_assert_eq!(&frequency.key(visit.date), period);
                }
            }
        }
    }
}

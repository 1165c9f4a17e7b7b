//! Loading and dumping the line-delimited JSON format.
use super::PatientDb;
use crate::{
    record::{Entity, EventRecord},
    util::{check_extension, path_exists},
    ArcStr,
};
use qu::ick_use::*;
use std::{
    collections::HashSet,
    fmt, fs,
    io::{self, BufRead, Write},
    path::Path,
};

/// What happened during a load.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub lines: usize,
    pub patients: usize,
    pub visits: usize,
    pub events: usize,
    /// Lines that were not valid JSON, or not a valid record. These are skipped.
    pub malformed: usize,
}

impl fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "read {} lines: {} patients, {} visits, {} events, {} malformed lines skipped",
            self.lines, self.patients, self.visits, self.events, self.malformed
        )
    }
}

/// What happened during a dump.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DumpSummary {
    /// Patients considered.
    pub keys: usize,
    pub dumped: usize,
    /// Patients and staged events that could not be encoded.
    pub failed: usize,
    /// Patients left out because they had no events.
    pub skipped_empty: usize,
    /// Staged events, written as standalone event lines.
    pub staged: usize,
}

impl fmt::Display for DumpSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} patients: {} dumped, {} failed, {} skipped without events; {} staged events",
            self.keys, self.dumped, self.failed, self.skipped_empty, self.staged
        )
    }
}

impl PatientDb {
    /// Create a store named `name` and fill it from the file at `path`.
    pub fn from_file(
        name: impl Into<ArcStr>,
        path: impl AsRef<Path>,
    ) -> Result<(Self, LoadSummary)> {
        let mut db = Self::new(name);
        let summary = db.load(path)?;
        Ok((db, summary))
    }

    /// Add every record in the file at `path` to this store.
    ///
    /// Only an unreadable file (or the wrong extension) is an error. Malformed lines are logged,
    /// counted and skipped. Standalone event lines are staged, not attached.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<LoadSummary> {
        fn inner(db: &mut PatientDb, path: &Path) -> Result<LoadSummary> {
            let reader = io::BufReader::new(fs::File::open(path)?);
            db.load_from_reader(reader)
        }
        let path = path.as_ref();
        check_extension(path, "jsonl")?;

        event!(Level::INFO, "loading \"{}\"", path.display());
        let summary = inner(self, path)
            .with_context(|| format!("unable to load data from \"{}\"", path.display()))?;
        event!(Level::INFO, "{}", summary);
        Ok(summary)
    }

    /// Like `load`, but from any reader. Lines are decoded one at a time.
    pub fn load_from_reader(&mut self, mut reader: impl BufRead) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            summary.lines += 1;
            let decoded = std::str::from_utf8(&buf)
                .map_err(Error::from)
                .and_then(|line| {
                    let line = line.trim();
                    if line.is_empty() {
                        Ok(None)
                    } else {
                        Entity::decode(line).map(Some)
                    }
                });
            match decoded {
                Ok(None) => (),
                Ok(Some(Entity::Patient(record))) => {
                    summary.patients += 1;
                    summary.visits += record.visits.len();
                    summary.events += record.num_events();
                    self.add_patient(record, None);
                }
                Ok(Some(Entity::Visit(record))) => {
                    summary.visits += 1;
                    summary.events += record.events.len();
                    self.add_visit(record, None);
                }
                Ok(Some(Entity::Event(record))) => {
                    summary.events += 1;
                    self.add_event(record, None);
                }
                Err(error) => {
                    summary.malformed += 1;
                    event!(
                        Level::WARN,
                        "skipping malformed line {}: {:#}",
                        summary.lines,
                        error
                    );
                }
            }
        }
        Ok(summary)
    }

    /// Write one line per patient to `path`, in ascending entity ID order.
    ///
    /// With `must_have_events`, patients without any attached event are left out. A patient that
    /// fails to encode is logged and counted; the rest of the dump goes ahead.
    pub fn dump(&self, path: impl AsRef<Path>, must_have_events: bool) -> Result<DumpSummary> {
        fn inner(db: &PatientDb, path: &Path, must_have_events: bool) -> Result<DumpSummary> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("could not create parent")?;
            }
            // not `create_new`, overwriting is allowed
            if path_exists(path)? {
                event!(
                    Level::WARN,
                    "overwriting existing file at \"{}\"",
                    path.display()
                );
            }
            let mut out = io::BufWriter::new(fs::File::create(path)?);
            let summary = db.dump_to_writer(&mut out, must_have_events)?;
            out.flush()?;
            Ok(summary)
        }
        let path = path.as_ref();
        check_extension(path, "jsonl")?;

        let summary = inner(self, path, must_have_events)
            .with_context(|| format!("unable to save data to \"{}\"", path.display()))?;
        event!(
            Level::INFO,
            "dumped \"{}\" to \"{}\": {}",
            self.name,
            path.display(),
            summary
        );
        Ok(summary)
    }

    /// Like `dump`, but to any writer.
    ///
    /// Patients come first. Staged events follow as standalone event lines, in staging order,
    /// so a load stages them again.
    pub fn dump_to_writer(
        &self,
        mut out: impl Write,
        must_have_events: bool,
    ) -> Result<DumpSummary> {
        let mut summary = DumpSummary::default();
        let staged_owners: HashSet<&str> = self
            .staged_events()
            .map(|(_, event)| &*event.patient_id)
            .collect();
        for (id, patient) in self.patients.iter() {
            summary.keys += 1;
            let has_events = staged_owners.contains(&*patient.patient_id)
                || self.visits_of(patient).any(|(_, v)| !v.event_ids().is_empty());
            if must_have_events && !has_events {
                summary.skipped_empty += 1;
                continue;
            }
            match self.patient_record(*id, patient, |_| true).encode() {
                Ok(line) => {
                    writeln!(out, "{}", line)?;
                    summary.dumped += 1;
                }
                Err(error) => {
                    summary.failed += 1;
                    event!(
                        Level::WARN,
                        "could not encode patient {} ({}): {:#}",
                        id,
                        patient.patient_id,
                        error
                    );
                }
            }
        }
        for (id, event) in self.staged_events() {
            let record = EventRecord {
                entity_id: Some(id),
                event: event.clone(),
            };
            match record.encode() {
                Ok(line) => {
                    writeln!(out, "{}", line)?;
                    summary.staged += 1;
                }
                Err(error) => {
                    summary.failed += 1;
                    event!(
                        Level::WARN,
                        "could not encode staged event {} (patient {}): {:#}",
                        id,
                        event.patient_id,
                        error
                    );
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        db::test::{date, diagnosis},
        EntityId, Event, Patient, Visit,
    };

    #[test]
    fn malformed_lines_are_counted() {
        let input = concat!(
            r#"{"__type__": "__Patient__", "patient_id": "1"}"#,
            "\n",
            "{not json\n",
            "\n",
            r#"{"__type__": "__Visit__", "visit_id": "a", "patient_id": "2", "date": "2020-01-01"}"#,
            "\n",
            r#"{"__type__": "__Event__", "visit_id": "a", "patient_id": "2", "chartdate": "2020-01-01", "event_type": "VitalEvent", "roles": {"vital_outcome": "ALIVE"}}"#,
            "\n",
            r#"{"__type__": "__Visit__", "visit_id": "b", "patient_id": "2"}"#,
        );
        let mut db = PatientDb::new("test");
        let summary = db.load_from_reader(input.as_bytes()).unwrap();
        assert_eq!(summary.lines, 6);
        assert_eq!(summary.malformed, 2);
        assert_eq!(summary.patients, 1);
        assert_eq!(summary.visits, 1);
        assert_eq!(summary.events, 1);
        assert_eq!(db.num_patients(), 2);
        assert_eq!(db.num_staged_events(), 1);
        db.attach_events_to_visits();
        assert_eq!(db.find_visit("2", "a").unwrap().1.event_ids().len(), 1);
    }

    #[test]
    fn dump_order_and_empty_filter() {
        let mut db = PatientDb::new("test");
        db.add_patient(Patient::new("b"), Some(EntityId(10)));
        db.add_patient(Patient::new("a"), Some(EntityId(2)));
        db.add_event(Event::new("b", "v", date(2020, 1, 1), diagnosis("Cough")), None);
        db.attach_events_to_visits();

        let mut out = Vec::new();
        let summary = db.dump_to_writer(&mut out, false).unwrap();
        assert_eq!(summary.dumped, 2);
        let text = String::from_utf8(out).unwrap();
        let ids: Vec<_> = text
            .lines()
            .map(|line| match Entity::decode(line).unwrap() {
                Entity::Patient(p) => p.entity_id.unwrap(),
                _ => panic!("expected patients only"),
            })
            .collect();
        assert_eq!(ids, [EntityId(2), EntityId(10)]);

        let mut out = Vec::new();
        let summary = db.dump_to_writer(&mut out, true).unwrap();
        assert_eq!(summary.keys, 2);
        assert_eq!(summary.dumped, 1);
        assert_eq!(summary.skipped_empty, 1);
    }

    #[test]
    fn wrong_extension_is_fatal() {
        let mut db = PatientDb::new("test");
        assert!(db.load("patients.json").is_err());
        assert!(db.dump("patients.csv", false).is_err());
    }

    #[test]
    fn reload_keeps_entity_ids() {
        let mut db = PatientDb::new("test");
        db.add_visit(Visit::new("1", "v", date(2020, 1, 1)), Some(EntityId(5)));
        let mut out = Vec::new();
        db.dump_to_writer(&mut out, false).unwrap();

        let mut copy = PatientDb::new("copy");
        copy.load_from_reader(&out[..]).unwrap();
        assert_eq!(copy.find_visit("1", "v").unwrap().0, EntityId(5));
        // new visits don't collide with loaded ones
        let (id, _) = copy.add_visit(Visit::new("1", "w", date(2020, 1, 2)), None);
        assert_eq!(id, EntityId(6));
    }

    fn dumped(db: &PatientDb) -> Vec<u8> {
        let mut out = Vec::new();
        db.dump_to_writer(&mut out, false).unwrap();
        out
    }

    fn one_patient(patient_id: &str, diagnosis_name: &str) -> PatientDb {
        let mut db = PatientDb::new(patient_id);
        db.add_event(
            Event::new(patient_id, "v", date(2020, 1, 1), diagnosis(diagnosis_name)),
            None,
        );
        db.attach_events_to_visits();
        db
    }

    #[test]
    fn two_dumps_share_a_store() {
        // both stores put their only patient, visit and event at ID 0
        let alice = dumped(&one_patient("alice", "Flu"));
        let bob = dumped(&one_patient("bob", "Cough"));

        let mut db = PatientDb::new("both");
        db.load_from_reader(&alice[..]).unwrap();
        let summary = db.load_from_reader(&bob[..]).unwrap();
        assert_eq!(summary.malformed, 0);
        assert_eq!(db.num_patients(), 2);
        assert_eq!(db.num_visits(), 2);
        assert_eq!(db.num_events(), 2);
        assert_eq!(db.find_patient("alice").unwrap().0, EntityId(0));
        assert_eq!(db.find_patient("bob").unwrap().0, EntityId(1));
        let (_, visit) = db.find_visit("alice", "v").unwrap();
        assert_eq!(visit.event_ids().len(), 1);
        let (_, visit) = db.find_visit("bob", "v").unwrap();
        let (_, event) = db.events_of(visit).next().unwrap();
        assert_eq!(event.role("diagnosis_name").unwrap().values().collect::<Vec<_>>(), ["Cough"]);

        // the same patient again still replaces
        db.load_from_reader(&alice[..]).unwrap();
        assert_eq!(db.num_patients(), 2);
        assert_eq!(db.num_events(), 2);
        assert_eq!(db.find_patient("alice").unwrap().0, EntityId(0));
    }

    #[test]
    fn top_entity_id_gets_a_fresh_one() {
        let input = concat!(
            r#"{"__type__": "__Patient__", "entity_id": "18446744073709551615", "patient_id": "1"}"#,
            "\n",
            r#"{"__type__": "__Visit__", "entity_id": 18446744073709551615, "visit_id": "a", "patient_id": "1", "date": "2020-01-01"}"#,
            "\n",
            r#"{"__type__": "__Event__", "entity_id": "18446744073709551615", "visit_id": "a", "patient_id": "1", "chartdate": "2020-01-01", "event_type": "VitalEvent", "roles": {"vital_outcome": "ALIVE"}}"#,
        );
        let mut db = PatientDb::new("test");
        let summary = db.load_from_reader(input.as_bytes()).unwrap();
        assert_eq!(summary.malformed, 0);
        assert_eq!(db.find_patient("1").unwrap().0, EntityId(0));
        assert_eq!(db.find_visit("1", "a").unwrap().0, EntityId(0));
        assert_eq!(db.staged_events().next().unwrap().0, EntityId(0));
        let (id, _) = db.add_patient(Patient::new("2"), None);
        assert_eq!(id, EntityId(1));
    }

    #[test]
    fn staged_events_survive_a_dump() {
        let mut db = PatientDb::new("test");
        db.add_patient(Patient::new("1"), None);
        db.add_patient(Patient::new("2"), None);
        db.add_event(Event::dated("1", date(2020, 2, 3), diagnosis("Flu")), None);
        assert!(db.has_events(db.find_patient("1").unwrap().1));
        assert_eq!(db.select_non_empty_patients(["1", "2"]), [ArcStr::from("1")]);

        let mut out = Vec::new();
        let summary = db.dump_to_writer(&mut out, true).unwrap();
        assert_eq!(summary.dumped, 1);
        assert_eq!(summary.skipped_empty, 1);
        assert_eq!(summary.staged, 1);
        assert_eq!(summary.failed, 0);

        let mut copy = PatientDb::new("copy");
        copy.load_from_reader(&out[..]).unwrap();
        assert_eq!(copy.num_patients(), 1);
        assert_eq!(copy.num_events(), 1);
        assert_eq!(copy.num_staged_events(), 1);
        assert_eq!(dumped(&copy), out);

        copy.attach_events_to_visits();
        assert_eq!(copy.find_visit("1", "2020-02-03").unwrap().1.event_ids().len(), 1);
    }
}

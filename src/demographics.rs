//! Demographic backfill, derived ages, and splits/distributions over demographic attributes.
use crate::{
    range::{RangeSet, RangeSetCountsWithMissing},
    util::{check_extension, optional_string},
    ArcStr, Demographics, EntityId, PatientDb, ADULT_AGE,
};
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, path::Path};

/// A row of a person table (OMOP `person` layout).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DemographicRow {
    #[serde(alias = "patient_id")]
    pub person_id: ArcStr,
    #[serde(default)]
    pub year_of_birth: Option<i32>,
    #[serde(default)]
    pub month_of_birth: Option<u32>,
    #[serde(default)]
    pub day_of_birth: Option<u32>,
    #[serde(default, deserialize_with = "optional_string")]
    pub gender: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    pub race: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    pub ethnicity: Option<ArcStr>,
}

impl DemographicRow {
    /// Missing month or day default to the first.
    pub fn date_of_birth(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(
            self.year_of_birth?,
            self.month_of_birth.unwrap_or(1),
            self.day_of_birth.unwrap_or(1),
        )
    }

    /// Read a CSV person table. Rows that don't parse are logged and counted, not returned.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<(Vec<Self>, usize)> {
        fn inner(path: &Path) -> Result<(Vec<DemographicRow>, usize)> {
            let mut rows = vec![];
            let mut malformed = 0;
            let reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .trim(csv::Trim::All)
                .from_path(path)?;
            for (idx, row) in reader.into_deserialize::<DemographicRow>().enumerate() {
                match row {
                    Ok(row) => rows.push(row),
                    // io errors mean the file itself is bad
                    Err(e) if e.is_io_error() => return Err(e.into()),
                    Err(e) => {
                        malformed += 1;
                        event!(Level::WARN, "skipping row {}: {}", idx + 1, e);
                    }
                }
            }
            Ok((rows, malformed))
        }
        let path = path.as_ref();
        check_extension(path, "csv")?;
        inner(path).with_context(|| format!("while loading \"{}\"", path.display()))
    }
}

/// What happened during a backfill.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BackfillSummary {
    pub found: usize,
    pub not_found: usize,
}

impl fmt::Display for BackfillSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} rows matched a patient, {} did not",
            self.found, self.not_found
        )
    }
}

impl PatientDb {
    /// Merge date of birth, gender, race and ethnicity from `rows` into the matching patients.
    ///
    /// Values present in a row replace the stored ones; missing values leave them alone. Rows
    /// for unknown patients are counted and otherwise ignored.
    pub fn add_demographics(
        &mut self,
        rows: impl IntoIterator<Item = DemographicRow>,
    ) -> BackfillSummary {
        let mut summary = BackfillSummary::default();
        for row in rows {
            let Some((id, _)) = self.find_patient(&row.person_id) else {
                summary.not_found += 1;
                continue;
            };
            let date_of_birth = row.date_of_birth();
            let Some(demographics) = self.demographics_mut(id) else {
                summary.not_found += 1;
                continue;
            };
            summary.found += 1;
            if date_of_birth.is_some() {
                demographics.date_of_birth = date_of_birth;
            }
            if row.gender.is_some() {
                demographics.gender = row.gender;
            }
            if row.race.is_some() {
                demographics.race = row.race;
            }
            if row.ethnicity.is_some() {
                demographics.ethnicity = row.ethnicity;
            }
        }
        if summary.not_found > 0 {
            event!(
                Level::DEBUG,
                "{} demographic rows had no patient in \"{}\"",
                summary.not_found,
                self.name()
            );
        }
        event!(Level::INFO, "backfill: {}", summary);
        summary
    }

    /// Set `age` (in whole years at `compare_date`) and `adult` for every patient with a date of
    /// birth. Returns the youngest and oldest age assigned.
    ///
    /// A date of birth after `compare_date` is logged and the age left unset.
    pub fn calculate_patient_ages(&mut self, compare_date: NaiveDate) -> Option<(u32, u32)> {
        let mut range: Option<(u32, u32)> = None;
        for patient in self.patients_mut() {
            let Some(age) = patient.demographics.age_at(compare_date) else {
                continue;
            };
            let Ok(age) = u32::try_from(age) else {
                event!(
                    Level::WARN,
                    "patient {} has a negative age ({}) at {}",
                    patient.patient_id,
                    age,
                    compare_date
                );
                patient.demographics.age = None;
                continue;
            };
            patient.demographics.age = Some(age);
            patient.demographics.adult = age >= ADULT_AGE;
            range = Some(match range {
                None => (age, age),
                Some((min, max)) => (min.min(age), max.max(age)),
            });
        }
        range
    }

    /// Refresh `adult` from `age` for every patient that has an age.
    pub fn calculate_patient_is_adult(&mut self) {
        for patient in self.patients_mut() {
            if let Some(age) = patient.demographics.age {
                patient.demographics.adult = age >= ADULT_AGE;
            }
        }
    }

    pub fn bucket_ages(&self, ranges: &RangeSet<u32>) -> RangeSetCountsWithMissing<u32> {
        ranges.bucket_values_with_missing(self.patients().map(|(_, p)| p.demographics.age))
    }

    /// Age buckets per gender. Patients without a gender are under `None`.
    pub fn age_gender_distribution(
        &self,
        ranges: &RangeSet<u32>,
    ) -> BTreeMap<Option<ArcStr>, RangeSetCountsWithMissing<u32>> {
        let mut ages: BTreeMap<Option<ArcStr>, Vec<Option<u32>>> = BTreeMap::new();
        for (_, patient) in self.patients() {
            ages.entry(patient.demographics.gender.clone())
                .or_default()
                .push(patient.demographics.age);
        }
        ages.into_iter()
            .map(|(gender, ages)| (gender, ranges.bucket_values_with_missing(ages)))
            .collect()
    }

    pub fn genders(&self) -> BTreeMap<Option<ArcStr>, usize> {
        self.count_by(|d| &d.gender)
    }

    pub fn races(&self) -> BTreeMap<Option<ArcStr>, usize> {
        self.count_by(|d| &d.race)
    }

    pub fn ethnicities(&self) -> BTreeMap<Option<ArcStr>, usize> {
        self.count_by(|d| &d.ethnicity)
    }

    pub fn split_by_gender(&self) -> BTreeMap<Option<ArcStr>, PatientDb> {
        self.split_by(|d| &d.gender)
    }

    pub fn split_by_race(&self) -> BTreeMap<Option<ArcStr>, PatientDb> {
        self.split_by(|d| &d.race)
    }

    pub fn split_by_ethnicity(&self) -> BTreeMap<Option<ArcStr>, PatientDb> {
        self.split_by(|d| &d.ethnicity)
    }

    fn count_by(
        &self,
        attribute: impl Fn(&Demographics) -> &Option<ArcStr>,
    ) -> BTreeMap<Option<ArcStr>, usize> {
        let mut counts = BTreeMap::new();
        for (_, patient) in self.patients() {
            *counts
                .entry(attribute(&patient.demographics).clone())
                .or_insert(0) += 1;
        }
        counts
    }

    /// One store per distinct value of `attribute`, holding the patients with that value.
    fn split_by(
        &self,
        attribute: impl Fn(&Demographics) -> &Option<ArcStr>,
    ) -> BTreeMap<Option<ArcStr>, PatientDb> {
        let mut groups: BTreeMap<Option<ArcStr>, Vec<EntityId>> = BTreeMap::new();
        for (id, patient) in self.patients() {
            groups
                .entry(attribute(&patient.demographics).clone())
                .or_default()
                .push(id);
        }
        groups
            .into_iter()
            .map(|(value, ids)| {
                let name = format!(
                    "{}:{}",
                    self.name(),
                    value.as_deref().unwrap_or("unknown")
                );
                let db = self.select_patients(name, ids);
                (value, db)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Patient, Visit};
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(id: &str, year: Option<i32>, gender: Option<&str>) -> DemographicRow {
        DemographicRow {
            person_id: id.into(),
            year_of_birth: year,
            month_of_birth: Some(6),
            day_of_birth: Some(1),
            gender: gender.map(Into::into),
            race: None,
            ethnicity: None,
        }
    }

    fn db() -> PatientDb {
        let mut db = PatientDb::new("cohort");
        db.generate_patients_from_ids(["1", "2", "3", "4"]);
        db.add_visit(Visit::new("1", "a", date(2020, 1, 1)), None);
        db.add_demographics([
            row("1", Some(1950), Some("F")),
            row("2", Some(2010), Some("M")),
            row("3", Some(2030), None),
            row("99", Some(1980), Some("F")),
        ]);
        db
    }

    #[test]
    fn backfill() {
        let mut db = PatientDb::new("cohort");
        db.add_patient(
            Patient::new("1").with_demographics(Demographics {
                race: Some("White".into()),
                ..Default::default()
            }),
            None,
        );
        let summary = db.add_demographics([row("1", Some(1950), Some("F")), row("2", None, None)]);
        assert_eq!(summary, BackfillSummary { found: 1, not_found: 1 });
        assert_eq!(db.num_patients(), 1);
        let (_, patient) = db.find_patient("1").unwrap();
        assert_eq!(patient.demographics.date_of_birth, Some(date(1950, 6, 1)));
        assert_eq!(patient.demographics.gender.as_deref(), Some("F"));
        // not in the row, so kept
        assert_eq!(patient.demographics.race.as_deref(), Some("White"));
    }

    #[test]
    fn ages() {
        let mut db = db();
        let range = db.calculate_patient_ages(date(2020, 6, 1));
        assert_eq!(range, Some((10, 70)));
        let age = |id: &str| db.find_patient(id).unwrap().1.demographics.clone();
        assert_eq!(age("1").age, Some(70));
        assert!(age("1").adult);
        assert_eq!(age("2").age, Some(10));
        assert!(!age("2").adult);
        // born after the compare date
        assert_eq!(age("3").age, None);
        assert_eq!(age("4").age, None);
    }

    #[test]
    fn distributions_and_splits() {
        let mut db = db();
        db.calculate_patient_ages(date(2020, 6, 1));
        let buckets = db.bucket_ages(&RangeSet::default_ages());
        assert_eq!(buckets.missing(), 2);
        assert_eq!(buckets.counts().total(), 2);

        let by_gender = db.age_gender_distribution(&RangeSet::default_ages());
        assert_eq!(by_gender.len(), 3);
        assert_eq!(by_gender[&None::<ArcStr>].missing(), 2);

        let genders = db.genders();
        assert_eq!(genders[&Some(ArcStr::from("F"))], 1);
        assert_eq!(genders[&None::<ArcStr>], 2);

        let split = db.split_by_gender();
        let total: usize = split.values().map(PatientDb::num_patients).sum();
        assert_eq!(total, db.num_patients());
        let women = &split[&Some(ArcStr::from("F"))];
        assert_eq!(women.name(), "cohort:F");
        assert_eq!(women.num_visits(), 1);
        assert_eq!(db.races().len(), 1);
        assert_eq!(db.split_by_ethnicity().len(), 1);
    }

    #[test]
    fn csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("person.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "person_id,year_of_birth,month_of_birth,day_of_birth,gender,race,ethnicity\n\
             1,1950,2,3,F,null,\n\
             2,,,,M,Asian,Not Hispanic\n\
             3,not-a-year,,,,,"
        )
        .unwrap();
        let (rows, malformed) = DemographicRow::load_csv(&path).unwrap();
        assert_eq!(malformed, 1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date_of_birth(), Some(date(1950, 2, 3)));
        assert_eq!(rows[0].race, None);
        assert_eq!(rows[0].ethnicity, None);
        assert_eq!(rows[1].date_of_birth(), None);
        assert_eq!(rows[1].ethnicity.as_deref(), Some("Not Hispanic"));
        assert!(DemographicRow::load_csv(dir.path().join("person.tsv")).is_err());
    }
}

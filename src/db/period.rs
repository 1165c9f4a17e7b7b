//! Splitting a store by visit date.
use super::PatientDb;
use chrono::{Datelike, NaiveDate};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

/// How finely to split by date.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Month,
    Quarter,
    Year,
}

impl Frequency {
    /// The period `date` falls in: `YYYY-MM`, `YYYY-Qn` or `YYYY`.
    pub fn key(self, date: NaiveDate) -> String {
        match self {
            Frequency::Month => format!("{:04}-{:02}", date.year(), date.month()),
            Frequency::Quarter => format!("{:04}-Q{}", date.year(), date.month0() / 3 + 1),
            Frequency::Year => format!("{:04}", date.year()),
        }
    }
}

impl FromStr for Frequency {
    type Err = Error;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(match input.trim().to_ascii_uppercase().as_str() {
            "M" | "MONTH" => Frequency::Month,
            "Q" | "QUARTER" => Frequency::Quarter,
            "Y" | "YEAR" => Frequency::Year,
            _ => bail!("unknown frequency \"{}\" (expected one of M, Q, Y)", input),
        })
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Frequency::Month => "M",
            Frequency::Quarter => "Q",
            Frequency::Year => "Y",
        })
    }
}

impl PatientDb {
    /// The distinct dates of all visits.
    pub fn visit_dates(&self) -> BTreeSet<NaiveDate> {
        self.visits.values().map(|v| v.date).collect()
    }

    /// The earliest and latest visit date.
    pub fn visit_date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        let dates = self.visit_dates();
        Some((*dates.first()?, *dates.last()?))
    }

    /// Keep the visits whose date matches every component given. Patients keep their
    /// demographics and lose the visits that don't match; patients with no matching visit are
    /// left out.
    pub fn select_date(
        &self,
        name: impl Into<crate::ArcStr>,
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
    ) -> PatientDb {
        self.select_visits(name, |visit| {
            year.map_or(true, |y| visit.date.year() == y)
                && month.map_or(true, |m| visit.date.month() == m)
                && day.map_or(true, |d| visit.date.day() == d)
        })
    }

    /// One store per period that has at least one visit, keyed (and named) by the period.
    ///
    /// Every visit ends up in exactly one of the stores, with its events and entity IDs
    /// unchanged. The source store is not modified.
    pub fn agg_time(&self, frequency: Frequency) -> BTreeMap<String, PatientDb> {
        let periods: BTreeSet<String> = self
            .visit_dates()
            .into_iter()
            .map(|date| frequency.key(date))
            .collect();
        event!(
            Level::DEBUG,
            "splitting \"{}\" into {} periods",
            self.name,
            periods.len()
        );
        periods
            .into_iter()
            .map(|period| {
                let db = self.select_visits(period.clone(), |visit| {
                    frequency.key(visit.date) == period
                });
                (period, db)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        db::test::{date, diagnosis},
        Demographics, EntityId, Event, Patient, Visit,
    };

    fn db() -> PatientDb {
        let mut db = PatientDb::new("test");
        db.add_patient(
            Patient::new("1").with_demographics(Demographics {
                gender: Some("F".into()),
                ..Default::default()
            }),
            None,
        );
        for (patient, visit, d) in [
            ("1", "a", date(2020, 1, 5)),
            ("1", "b", date(2020, 1, 20)),
            ("1", "c", date(2020, 4, 2)),
            ("2", "d", date(2021, 1, 5)),
        ] {
            db.add_visit(Visit::new(patient, visit, d), None);
        }
        db.add_event(Event::new("1", "a", date(2020, 1, 5), diagnosis("Flu")), None);
        db.attach_events_to_visits();
        db
    }

    #[test]
    fn frequency_keys() {
        let d = date(2020, 11, 3);
        assert_eq!(Frequency::Month.key(d), "2020-11");
        assert_eq!(Frequency::Quarter.key(d), "2020-Q4");
        assert_eq!(Frequency::Year.key(d), "2020");
        assert_eq!("m".parse::<Frequency>().unwrap(), Frequency::Month);
        assert!("W".parse::<Frequency>().is_err());
    }

    #[test]
    fn months_partition_visits() {
        let db = db();
        let months = db.agg_time(Frequency::Month);
        assert_eq!(
            months.keys().map(String::as_str).collect::<Vec<_>>(),
            ["2020-01", "2020-04", "2021-01"]
        );
        let jan = &months["2020-01"];
        assert_eq!(jan.name(), "2020-01");
        assert_eq!(jan.num_patients(), 1);
        assert_eq!(jan.num_visits(), 2);
        assert_eq!(jan.num_events(), 1);
        // demographics survive
        let (_, patient) = jan.find_patient("1").unwrap();
        assert_eq!(patient.demographics.gender.as_deref(), Some("F"));

        let mut all: Vec<EntityId> = months
            .values()
            .flat_map(|db| db.visits().map(|(id, _)| id).collect::<Vec<_>>())
            .collect();
        all.sort();
        let expected: Vec<EntityId> = db.visits().map(|(id, _)| id).collect();
        assert_eq!(all, expected);
        assert_eq!(db.num_visits(), 4);
    }

    #[test]
    fn quarters_and_years() {
        let db = db();
        assert_eq!(db.agg_time(Frequency::Quarter).len(), 3);
        let years = db.agg_time(Frequency::Year);
        assert_eq!(years["2020"].num_visits(), 3);
        assert_eq!(years["2021"].num_patients(), 1);
    }

    #[test]
    fn select_by_components() {
        let db = db();
        assert_eq!(db.select_date("x", Some(2020), None, None).num_visits(), 3);
        assert_eq!(db.select_date("x", None, Some(1), Some(5)).num_visits(), 2);
        assert!(db.select_date("x", Some(1999), None, None).is_empty());
        assert_eq!(
            db.visit_date_range(),
            Some((date(2020, 1, 5), date(2021, 1, 5)))
        );
    }
}

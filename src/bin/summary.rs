use chrono::NaiveDate;
use clap::Parser;
use patient_db::{header, ArcStr, PatientDb, RangeSet, ResultExt};
use qu::ick_use::*;
use std::{collections::BTreeMap, path::PathBuf};
use term_data_table::{Cell, Row, Table};

#[derive(Parser)]
struct Opt {
    /// The graph dump to summarise (`.jsonl`)
    input: PathBuf,
    /// Recalculate ages at this date (YYYY-MM-DD) instead of using the stored ones
    #[clap(long)]
    compare_date: Option<NaiveDate>,
    /// Lower bounds of the age bands
    #[clap(long, value_delimiter = ',', default_values_t = vec![0, 18, 40, 60, 80])]
    age_bands: Vec<u32>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let name = opt
        .input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "patients".into());
    let (mut db, load_summary) = PatientDb::from_file(name, &opt.input)?;
    db.attach_events_to_visits();

    header("Data stats");
    println!("{}", load_summary);
    println!("{}", db.stats());
    if let Some((first, last)) = db.visit_date_range() {
        println!("visits from {} to {}", first, last);
    }
    if db.num_events() == 0 {
        println!("no events, nothing more to report");
        return Ok(());
    }

    if let Some(date) = opt.compare_date {
        match db.calculate_patient_ages(date) {
            Some((min, max)) => println!("ages at {}: {} to {}", date, min, max),
            None => println!("no patient has a date of birth"),
        }
    }

    let total = db.num_patients();
    header("Genders");
    println!("{}", count_table("Gender", &db.genders(), total));
    header("Races");
    println!("{}", count_table("Race", &db.races(), total));
    header("Ethnicities");
    println!("{}", count_table("Ethnicity", &db.ethnicities(), total));

    header("Ages");
    // fall back to the default bands
    let bands = RangeSet::from_bounds(&opt.age_bands)
        .print_error()
        .unwrap_or_else(|_| RangeSet::default_ages());
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from("Age"))
            .with_cell(Cell::from("Count"))
            .with_cell(Cell::from("Percentage")),
    );
    for (label, count) in db.bucket_ages(&bands).for_display() {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(label))
                .with_cell(Cell::from(count.to_string()))
                .with_cell(Cell::from(percent(count, total))),
        );
    }
    println!("{}", table);

    header("Ages by gender");
    for (gender, counts) in db.age_gender_distribution(&bands) {
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from(gender.as_deref().unwrap_or("unknown").to_string()))
                .with_cell(Cell::from("Count")),
        );
        for (label, count) in counts.for_display() {
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(label))
                    .with_cell(Cell::from(count.to_string())),
            );
        }
        println!("{}", table);
    }
    Ok(())
}

fn count_table(
    title: &str,
    counts: &BTreeMap<Option<ArcStr>, usize>,
    total: usize,
) -> Table<'static> {
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from(title.to_string()))
            .with_cell(Cell::from("Count"))
            .with_cell(Cell::from("Percentage")),
    );
    for (label, count) in counts {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(label.as_deref().unwrap_or("unknown").to_string()))
                .with_cell(Cell::from(count.to_string()))
                .with_cell(Cell::from(percent(*count, total))),
        );
    }
    table
}

fn percent(count: usize, total: usize) -> String {
    if total == 0 {
        return "-".into();
    }
    format!("{:.1}%", count as f64 / total as f64 * 100.)
}

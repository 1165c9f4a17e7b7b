use chrono::{NaiveDate, Utc};
use clap::Parser;
use patient_db::{check_extension, header, DemographicRow, PatientDb};
use qu::ick_use::*;
use std::{fs, path::PathBuf};

#[derive(Parser)]
struct Opt {
    /// The graph dump to read (`.jsonl`)
    input: PathBuf,
    /// The person table (`.csv`)
    demographics: PathBuf,
    /// Where to write the updated dump (`.jsonl`)
    output: PathBuf,
    /// Compute ages at this date (YYYY-MM-DD). Defaults to today.
    #[clap(long)]
    compare_date: Option<NaiveDate>,
    /// Leave out patients without events
    #[clap(long)]
    must_have_events: bool,
    /// A file of patient ids, one per line. Patients missing from the dump are created.
    #[clap(long)]
    ids: Option<PathBuf>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    check_extension(&opt.input, "jsonl")?;
    check_extension(&opt.demographics, "csv")?;
    check_extension(&opt.output, "jsonl")?;
    let compare_date = opt
        .compare_date
        .unwrap_or_else(|| Utc::now().date_naive());

    let (mut db, load_summary) = PatientDb::from_file("backfill", &opt.input)?;
    let attached = db.attach_events_to_visits();
    event!(Level::DEBUG, "attached {} events", attached);
    if db.num_events() == 0 {
        println!("no events in \"{}\", nothing to do", opt.input.display());
        return Ok(());
    }

    if let Some(path) = &opt.ids {
        let ids = fs::read_to_string(path)
            .with_context(|| format!("unable to load data from \"{}\"", path.display()))?;
        let ids: Vec<&str> = ids
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let non_empty = db.select_non_empty_patients(&ids);
        println!(
            "{} of {} listed patients have events",
            non_empty.len(),
            ids.len()
        );
        let created = db.generate_patients_from_ids(&ids);
        println!("created {} patients from the id list", created);
    }

    let (rows, malformed) = DemographicRow::load_csv(&opt.demographics)?;
    if malformed > 0 {
        event!(Level::WARN, "{} demographic rows skipped", malformed);
    }
    let backfill = db.add_demographics(rows);
    let ages = db.calculate_patient_ages(compare_date);

    let dump_summary = db.dump(&opt.output, opt.must_have_events)?;

    header("Backfill");
    println!("load: {}", load_summary);
    println!("demographics: {}", backfill);
    match ages {
        Some((min, max)) => println!("ages at {}: {} to {}", compare_date, min, max),
        None => println!("no patient has a date of birth"),
    }
    println!("dump: {}", dump_summary);
    Ok(())
}

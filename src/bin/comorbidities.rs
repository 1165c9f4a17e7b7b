use clap::Parser;
use patient_db::{
    check_extension, event_roles, header, roles::DIAGNOSIS_ROLES, same_roles, top_k, ArcStr,
    EntityLevel, EventType, Frequency, PatientDb, TopK,
};
use qu::ick_use::*;
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{self, Write},
    path::PathBuf,
};
use term_data_table::{Cell, Row, Table};

const DEFAULT_TERMS: &[&str] = &["depression", "anxiety", "insomnia", "distress"];

#[derive(Parser)]
struct Opt {
    /// The graph dump to search (`.jsonl`)
    input: PathBuf,
    /// A diagnosis to look for. Can be repeated. Defaults to common mental-health terms.
    #[clap(short, long = "term")]
    terms: Vec<String>,
    /// How many values to list per role
    #[clap(short, default_value_t = 10)]
    k: usize,
    /// Repeat the report per period (M, Q or Y)
    #[clap(long)]
    freq: Option<Frequency>,
    /// Write the top-k lists here (`.jsonl`, one line per period)
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Write the matched patients here (`.jsonl`)
    #[clap(long)]
    matched: Option<PathBuf>,
    /// Count on all cores
    #[clap(long)]
    parallel: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    period: &'a str,
    patients: usize,
    top_k: TopK,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    for path in opt.output.iter().chain(opt.matched.iter()) {
        check_extension(path, "jsonl")?;
    }
    let terms: Vec<String> = if opt.terms.is_empty() {
        DEFAULT_TERMS.iter().map(|s| s.to_string()).collect()
    } else {
        opt.terms.clone()
    };

    let (mut db, load_summary) = PatientDb::from_file("all", &opt.input)?;
    db.attach_events_to_visits();
    event!(Level::INFO, "{}", load_summary);
    if db.num_events() == 0 {
        println!("no events in \"{}\"", opt.input.display());
        return Ok(());
    }

    let match_roles = same_roles(&[EventType::Diagnosis], &role_set(&["diagnosis_name"]));
    let (cohort, matches) = db.match_terms(&terms, &match_roles);

    header("Matches");
    let mut by_term: BTreeMap<&str, (BTreeSet<&str>, usize)> = BTreeMap::new();
    for m in &matches {
        let entry = by_term.entry(&*m.term).or_default();
        entry.0.insert(&*m.patient_id);
        entry.1 += 1;
    }
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from("Term"))
            .with_cell(Cell::from("Patients"))
            .with_cell(Cell::from("Events")),
    );
    for term in &terms {
        let (patients, events) = by_term
            .get(term.as_str())
            .map(|(p, e)| (p.len(), *e))
            .unwrap_or((0, 0));
        table.add_row(
            Row::new()
                .with_cell(Cell::from(term.clone()))
                .with_cell(Cell::from(patients.to_string()))
                .with_cell(Cell::from(events.to_string())),
        );
    }
    println!("{}", table);
    println!("{} patients matched at least one term", cohort.num_patients());

    if cohort.is_empty() {
        return Ok(());
    }
    if let Some(path) = &opt.matched {
        let summary = cohort.dump(path, true)?;
        println!("matched patients: {}", summary);
    }

    let periods: Vec<(String, PatientDb)> = match opt.freq {
        Some(freq) => cohort.agg_time(freq).into_iter().collect(),
        None => vec![("all".to_string(), cohort)],
    };

    let event_types = [EventType::Diagnosis];
    let roles = event_roles(&event_types, true);
    let mut event_type_roles = BTreeMap::new();
    event_type_roles.insert(EventType::Diagnosis, roles.clone());

    let mut out = match &opt.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Some(io::BufWriter::new(fs::File::create(path).with_context(
                || format!("unable to save data to \"{}\"", path.display()),
            )?))
        }
        None => None,
    };

    for (period, db) in &periods {
        let counters = if opt.parallel {
            db.par_event_counters(&event_types, &roles)
        } else {
            db.event_counters(&event_types, &roles)
        };
        let top = top_k(&counters, &EntityLevel::ALL, &event_type_roles, opt.k);

        header(&format!("{} ({} patients)", period, db.num_patients()));
        print_top_k(&top);

        if let Some(out) = &mut out {
            let report = Report {
                period,
                patients: db.num_patients(),
                top_k: top,
            };
            serde_json::to_writer(&mut *out, &report)?;
            writeln!(out)?;
        }
    }
    if let Some(mut out) = out {
        out.flush()?;
    }
    Ok(())
}

fn role_set(names: &[&str]) -> BTreeSet<ArcStr> {
    names.iter().map(|name| ArcStr::from(*name)).collect()
}

fn is_diagnosis_role(role: &str) -> bool {
    DIAGNOSIS_ROLES.iter().any(|r| *r == role)
}

fn print_top_k(top: &TopK) {
    for (level, by_type) in top {
        for (event_type, by_role) in by_type {
            // diagnosis roles first, then the MedDRA ones
            let ordered = by_role
                .iter()
                .filter(|(role, values)| !values.is_empty() && is_diagnosis_role(role));
            let rest = by_role
                .iter()
                .filter(|(role, values)| !values.is_empty() && !is_diagnosis_role(role));
            for (role, values) in ordered.chain(rest) {
                println!("{} / {} / {}", level, event_type, role);
                let mut table = Table::new().with_row(
                    Row::new()
                        .with_cell(Cell::from("Value"))
                        .with_cell(Cell::from(format!("{}s", level))),
                );
                for (value, count) in values {
                    table.add_row(
                        Row::new()
                            .with_cell(Cell::from(value.to_string()))
                            .with_cell(Cell::from(count.to_string())),
                    );
                }
                println!("{}", table);
            }
        }
    }
}

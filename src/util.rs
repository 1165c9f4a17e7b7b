use crate::ArcStr;
use chrono::{NaiveDate, NaiveDateTime};
use qu::ick_use::*;
use serde::{Deserialize, Deserializer, Serializer};
use std::{fs, io, path::Path};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn check_extension(path: &Path, ext: &str) -> Result<()> {
    ensure!(
        matches!(path.extension(), Some(p) if p == ext),
        "filename \"{}\" should end with `.{}`",
        path.display(),
        ext
    );
    Ok(())
}

/// Parse a date, accepting either a bare date (`2020-01-31`) or a timestamp
/// (`2020-01-31 12:00:00`, `2020-01-31T12:00:00.000`). Any time part is dropped.
pub fn parse_date(input: &str) -> Result<NaiveDate> {
    let input = input.trim();
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(date);
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(datetime.date());
        }
    }
    Err(format_err!("cannot parse \"{}\" as a date", input))
}

// Helpers for serde to parse fields with quirks.

/// Parse a date using [`parse_date`].
pub fn lenient_date<'de, D>(d: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let s: String = Deserialize::deserialize(d)?;
    parse_date(&s).map_err(|e| Error::custom(format!("{}", e)))
}

/// Like `lenient_date`, but maps null, "" and "null" to `None`.
pub fn opt_lenient_date<'de, D>(d: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let s: Option<String> = Deserialize::deserialize(d)?;
    match s {
        None => Ok(None),
        Some(s) if s.is_empty() || s.eq_ignore_ascii_case("null") => Ok(None),
        Some(s) => parse_date(&s)
            .map(Some)
            .map_err(|e| Error::custom(format!("{}", e))),
    }
}

pub fn opt_date_serialize<S>(date: &Option<NaiveDate>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match date {
        Some(date) => s.collect_str(&date.format("%Y-%m-%d")),
        None => s.serialize_none(),
    }
}

pub fn date_serialize<S>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.collect_str(&date.format("%Y-%m-%d"))
}

/// Parse a string, but map null and "null" to `None` (in addition to the default "" -> None
/// mapping)
pub fn optional_string<'de, D>(d: D) -> Result<Option<ArcStr>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(d)?;
    Ok(s.filter(|s| !(s.eq_ignore_ascii_case("null") || s.is_empty()))
        .map(Into::into))
}

// error printing helper.
//
pub trait ResultExt {
    fn print_error(self) -> Self;
}

impl<T> ResultExt for Result<T, anyhow::Error> {
    fn print_error(self) -> Self {
        match self {
            Ok(v) => Ok(v),
            Err(error) => {
                println!("error: {}", error);
                let mut err: &dyn std::error::Error = error.as_ref();
                while let Some(cause) = err.source() {
                    println!("caused by: {}", cause);
                    err = cause;
                }
                Err(error)
            }
        }
    }
}

pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}

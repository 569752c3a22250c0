//! Recipient records and where they come from.
//!
//! The publisher only needs an ordered sequence of [`Record`]s. How they are
//! stored is up to the [`RecordSource`]. The appointments sheet has the columns
//! `Name`, `Phone` and `AppointmentDateTime`; [`CsvFileSource`] reads it as
//! exported, [`JsonFileSource`] reads the same rows as a JSON array.
//!
//! `AppointmentDateTime` is either RFC 3339 or a naive `YYYY-MM-DD HH:MM[:SS]`
//! timestamp, which is taken in the local time zone of the producer.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use tracing_error::SpanTrace;

/// One recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub contact: String,
    pub target_time: DateTime<Utc>,
}

/// Produces the records of one batch run, in a stable order.
pub trait RecordSource {
    fn records(&self) -> Result<Vec<Record>, RecordSourceError>;
}

impl RecordSource for Vec<Record> {
    fn records(&self) -> Result<Vec<Record>, RecordSourceError> {
        Ok(self.clone())
    }
}

/// Pick the source for `path` by its extension: `.json` files are read as a
/// JSON array, everything else as CSV.
pub fn file_source(path: impl AsRef<Path>) -> Box<dyn RecordSource + Send + Sync> {
    let path = path.as_ref();
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        Box::new(JsonFileSource::new(path))
    } else {
        Box::new(CsvFileSource::new(path))
    }
}

/// Reads records from a CSV file with a header row.
#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RecordSource for CsvFileSource {
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    fn records(&self) -> Result<Vec<Record>, RecordSourceError> {
        let file = std::fs::File::open(&self.path)?;
        let records = parse_csv(file)?;
        tracing::debug!(count = records.len(), "Records loaded");
        Ok(records)
    }
}

/// Reads records from a JSON array file.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RecordSource for JsonFileSource {
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    fn records(&self) -> Result<Vec<Record>, RecordSourceError> {
        let raw = std::fs::read_to_string(&self.path)?;
        let records = parse_records(&raw)?;
        tracing::debug!(count = records.len(), "Records loaded");
        Ok(records)
    }
}

#[derive(Deserialize)]
struct Row {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Phone")]
    phone: String,
    #[serde(rename = "AppointmentDateTime", deserialize_with = "appointment_time")]
    appointment: DateTime<Utc>,
}

impl From<Row> for Record {
    fn from(row: Row) -> Self {
        Record {
            name: row.name,
            contact: row.phone,
            target_time: row.appointment,
        }
    }
}

const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// RFC 3339 first, then the naive formats in local time. Local times that
/// fall into a DST gap do not exist and are rejected.
fn parse_appointment(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|time| time.with_timezone(&Utc))
}

fn appointment_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_appointment(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("invalid appointment time `{raw}`"))
    })
}

fn parse_records(raw: &str) -> Result<Vec<Record>, serde_json::Error> {
    let rows: Vec<Row> = serde_json::from_str(raw)?;
    Ok(rows.into_iter().map(Record::from).collect())
}

fn parse_csv(reader: impl std::io::Read) -> Result<Vec<Record>, csv::Error> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader)
        .deserialize::<Row>()
        .map(|row| row.map(Record::from))
        .collect()
}

/// Error returned when a record source cannot produce its records.
#[derive(Debug)]
pub struct RecordSourceError {
    context: SpanTrace,
    kind: RecordSourceErrorKind,
}

/// Record source error kinds.
#[derive(Debug)]
pub enum RecordSourceErrorKind {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Csv(csv::Error),
}

impl RecordSourceError {
    pub fn kind(&self) -> &RecordSourceErrorKind {
        &self.kind
    }

    fn new(kind: RecordSourceErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }
}

impl std::fmt::Display for RecordSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RecordSourceErrorKind::Io(err) => writeln!(f, "Cannot read records: {err}"),
            RecordSourceErrorKind::Parse(err) => writeln!(f, "Malformed records: {err}"),
            RecordSourceErrorKind::Csv(err) => writeln!(f, "Malformed CSV records: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RecordSourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RecordSourceErrorKind::Io(err) => Some(err),
            RecordSourceErrorKind::Parse(err) => Some(err),
            RecordSourceErrorKind::Csv(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for RecordSourceError {
    fn from(err: std::io::Error) -> Self {
        Self::new(RecordSourceErrorKind::Io(err))
    }
}

impl From<serde_json::Error> for RecordSourceError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(RecordSourceErrorKind::Parse(err))
    }
}

impl From<csv::Error> for RecordSourceError {
    fn from(err: csv::Error) -> Self {
        Self::new(RecordSourceErrorKind::Csv(err))
    }
}

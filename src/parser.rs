use crate::config::RowPolicy;
use crate::error::{AppError, Result};
use crate::models::{default_channels, MeasurementChannel, ReadingRow};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Formats tried for the device clock once its offset has been removed.
const SENSOR_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// How a CSV export is laid out and how strictly it is read.
#[derive(Debug, Clone)]
pub struct CsvFormat {
    pub delimiter: u8,
    pub server_time_format: String,
    /// Always discard the second row as a units row.
    pub skip_units_row: bool,
    pub on_malformed_row: RowPolicy,
    /// Fraction of malformed data rows above which the file is rejected.
    pub max_failure_rate: f64,
    pub channels: Vec<MeasurementChannel>,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            delimiter: b';',
            server_time_format: "%Y-%m-%d %H:%M:%S".to_string(),
            skip_units_row: false,
            on_malformed_row: RowPolicy::Skip,
            max_failure_rate: 0.10,
            channels: default_channels(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub total_rows: usize,
    pub parsed_successfully: usize,
    pub parse_failures: usize,
    pub empty_rows: usize,
    pub units_row_skipped: bool,
    pub failure_rate: f64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalize(&mut self) {
        let non_empty = self.total_rows - self.empty_rows;
        self.failure_rate = if non_empty > 0 {
            self.parse_failures as f64 / non_empty as f64
        } else {
            0.0
        };
    }

    pub fn exceeds_threshold(&self, threshold: f64) -> bool {
        self.failure_rate > threshold
    }
}

/// Position of each configured channel in the header row.
#[derive(Debug)]
struct ColumnMap {
    channels: Vec<(usize, String)>,
}

pub struct CsvNormalizer {
    format: CsvFormat,
}

impl CsvNormalizer {
    pub fn new(format: CsvFormat) -> Self {
        Self { format }
    }

    /// Read and normalize a CSV export from disk
    pub fn normalize<P: AsRef<Path>>(&self, path: P) -> Result<(Vec<ReadingRow>, ParseStats)> {
        let content = std::fs::read_to_string(path.as_ref())?;
        self.normalize_str(&content)
    }

    /// Normalize CSV content into reading rows with parse statistics
    ///
    /// The first record is the header. A units row directly below it is
    /// discarded when `skip_units_row` is set or when it is recognisably one.
    pub fn normalize_str(&self, content: &str) -> Result<(Vec<ReadingRow>, ParseStats)> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.format.delimiter)
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let mut records = reader.records();

        let header = match records.next() {
            Some(record) => record?,
            None => {
                return Err(AppError::SchemaMismatch(
                    "CSV file has no header row".to_string(),
                ))
            }
        };
        let columns = self.map_columns(&header)?;

        let mut rows = Vec::new();
        let mut stats = ParseStats::new();

        for (index, record) in records.enumerate() {
            let record = record?;
            let line = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(index + 2);

            if index == 0 && (self.format.skip_units_row || self.is_units_row(&record, &columns)) {
                debug!("Discarding units row at line {}", line);
                stats.units_row_skipped = true;
                continue;
            }

            stats.total_rows += 1;

            if record.iter().all(str::is_empty) {
                stats.empty_rows += 1;
                continue;
            }

            match self.parse_row(&record, line, &columns) {
                Ok(row) => {
                    rows.push(row);
                    stats.parsed_successfully += 1;
                }
                Err(e) => {
                    if self.format.on_malformed_row == RowPolicy::Abort {
                        return Err(e);
                    }
                    stats.parse_failures += 1;
                    warn!(
                        "Skipping row (failure {}/{}): {}",
                        stats.parse_failures,
                        stats.total_rows - stats.empty_rows,
                        e
                    );
                }
            }
        }

        stats.finalize();

        if stats.exceeds_threshold(self.format.max_failure_rate) {
            return Err(AppError::MalformedFile(format!(
                "malformed row rate {:.1}% exceeds threshold {:.1}%: {} failures out of {} non-empty rows",
                stats.failure_rate * 100.0,
                self.format.max_failure_rate * 100.0,
                stats.parse_failures,
                stats.total_rows - stats.empty_rows
            )));
        }

        if rows.is_empty() && stats.parse_failures > 0 {
            return Err(AppError::MalformedFile(
                "no rows successfully parsed from non-empty file".to_string(),
            ));
        }

        Ok((rows, stats))
    }

    fn map_columns(&self, header: &csv::StringRecord) -> Result<ColumnMap> {
        let names: Vec<&str> = header
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim())
            .collect();

        if names.len() < 2 {
            return Err(AppError::SchemaMismatch(format!(
                "expected server time and sensor time columns, found {} column(s)",
                names.len()
            )));
        }

        let mut channels = Vec::new();
        let mut missing = Vec::new();

        for channel in &self.format.channels {
            match names
                .iter()
                .skip(2)
                .position(|name| channel.matches_header(name))
            {
                Some(offset) => channels.push((offset + 2, channel.column.clone())),
                None => missing.push(channel.key.as_str()),
            }
        }

        if !missing.is_empty() {
            return Err(AppError::SchemaMismatch(format!(
                "missing channel column(s) {}; header has [{}]",
                missing.join(", "),
                names.join(", ")
            )));
        }

        for (index, name) in names.iter().enumerate().skip(2) {
            if !channels.iter().any(|(i, _)| *i == index) {
                debug!("Ignoring unconfigured column '{}'", name);
            }
        }

        Ok(ColumnMap { channels })
    }

    /// A units row has no timestamp in the first column and no numbers in
    /// any channel column, e.g. `;;ppm;°C;%`.
    fn is_units_row(&self, record: &csv::StringRecord, columns: &ColumnMap) -> bool {
        let server_cell = record.get(0).unwrap_or("");
        if parse_server_time(server_cell, &self.format.server_time_format).is_some() {
            return false;
        }
        columns
            .channels
            .iter()
            .all(|(index, _)| parse_value(record.get(*index).unwrap_or("")).is_none())
    }

    fn parse_row(
        &self,
        record: &csv::StringRecord,
        line: usize,
        columns: &ColumnMap,
    ) -> Result<ReadingRow> {
        let malformed = |column: &str, value: &str| AppError::MalformedRow {
            line,
            column: column.to_string(),
            value: value.to_string(),
        };

        let server_raw = record.get(0).unwrap_or("");
        let server_time = parse_server_time(server_raw, &self.format.server_time_format)
            .ok_or_else(|| malformed("server_time", server_raw))?;

        let sensor_raw = record.get(1).unwrap_or("");
        let sensor_time =
            parse_sensor_time(sensor_raw).ok_or_else(|| malformed("sensor_time", sensor_raw))?;

        let mut values = BTreeMap::new();
        for (index, column) in &columns.channels {
            let raw = record.get(*index).unwrap_or("");
            let value = parse_value(raw).ok_or_else(|| malformed(column.as_str(), raw))?;
            values.insert(column.clone(), value);
        }

        Ok(ReadingRow {
            line,
            server_time,
            sensor_time,
            values,
        })
    }
}

fn parse_server_time(raw: &str, format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), format).ok()
}

/// Parse the device timestamp after removing any UTC offset suffix.
fn parse_sensor_time(raw: &str) -> Option<NaiveDateTime> {
    let stripped = strip_offset(raw);
    SENSOR_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(stripped, format).ok())
}

/// Drop a trailing `+hh:mm`, `-hh:mm` or `Z` from a timestamp.
///
/// Only the time part is searched so the dashes of the date survive.
fn strip_offset(raw: &str) -> &str {
    let raw = raw.trim();
    let Some(separator) = raw.rfind([' ', 'T']) else {
        return raw;
    };
    let time_start = separator + 1;
    match raw[time_start..].find(['+', '-', 'Z']) {
        Some(0) => raw[..separator].trim_end(),
        Some(pos) => raw[..time_start + pos].trim_end(),
        None => raw,
    }
}

fn parse_value(raw: &str) -> Option<f64> {
    let value = raw.trim().parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

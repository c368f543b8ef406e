use crate::error::{AppError, Result};
use crate::models::{default_channels, EntityId, MeasurementChannel};
use crate::parser::CsvFormat;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: Option<UploadConfig>,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub base_url: String,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_numeric")]
    pub timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("sta-sync/{}", env!("CARGO_PKG_VERSION"))
}

impl ServerConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout_seconds: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Custom deserializer that handles numbers given either as numbers or strings
///
/// Accepts:
/// - `timeout_seconds: 30` (number)
/// - `timeout_seconds: "30"` (string that parses to number)
/// - `latitude: ${STATION_LAT}` (env var substituted to either)
fn deserialize_numeric<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumericValue<T> {
        Number(T),
        String(String),
    }

    match NumericValue::<T>::deserialize(deserializer)? {
        NumericValue::Number(n) => Ok(n),
        NumericValue::String(s) => s
            .trim()
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Invalid number '{}': {}", s, e))),
    }
}

/// How the normalizer treats a row whose values cannot be coerced.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RowPolicy {
    /// Log and drop the row, rejecting the file only past `max_failure_rate`.
    #[default]
    Skip,
    /// Fail the whole file on the first bad row.
    Abort,
}

/// Which CSV timestamp stamps uploaded observations.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    #[default]
    Sensor,
    Server,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Path or glob pattern of the CSV export(s).
    pub csv_path: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_server_time_format")]
    pub server_time_format: String,
    #[serde(default)]
    pub on_malformed_row: RowPolicy,
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    #[serde(default)]
    pub timestamp_source: TimestampSource,
    #[serde(default)]
    pub phenomenon_time_as_interval: bool,
    pub location: LocationConfig,
    #[serde(default)]
    pub options: UploadOptions,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default = "default_channels")]
    pub channels: Vec<MeasurementChannel>,
}

fn default_delimiter() -> char {
    ';'
}

fn default_server_time_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}

fn default_max_failure_rate() -> f64 {
    0.10
}

impl UploadConfig {
    pub fn csv_format(&self) -> CsvFormat {
        CsvFormat {
            delimiter: self.delimiter as u8,
            server_time_format: self.server_time_format.clone(),
            skip_units_row: self.options.skip_units_row,
            on_malformed_row: self.on_malformed_row,
            max_failure_rate: self.max_failure_rate,
            channels: self.channels.clone(),
        }
    }
}

/// Static position of the station whose CSV is uploaded.
#[derive(Debug, Deserialize, Clone)]
pub struct LocationConfig {
    pub name: String,
    #[serde(deserialize_with = "deserialize_numeric")]
    pub latitude: f64,
    #[serde(deserialize_with = "deserialize_numeric")]
    pub longitude: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    #[serde(default)]
    pub skip_units_row: bool,
    #[serde(default = "default_true")]
    pub attach_feature_of_interest: bool,
    #[serde(default = "default_true")]
    pub cache_entities_across_rows: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            skip_units_row: false,
            attach_feature_of_interest: true,
            cache_entities_across_rows: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    #[serde(default = "default_sensor_name")]
    pub name: String,
    #[serde(default = "default_sensor_description")]
    pub description: String,
    #[serde(default = "default_sensor_encoding")]
    pub encoding_type: String,
    #[serde(default = "default_sensor_metadata")]
    pub metadata: String,
}

fn default_sensor_name() -> String {
    "Generic Environmental Sensor".to_string()
}

fn default_sensor_description() -> String {
    "Multi-parameter sensor for CO2, Temperature, and Humidity".to_string()
}

fn default_sensor_encoding() -> String {
    "application/pdf".to_string()
}

fn default_sensor_metadata() -> String {
    "https://example.com/sensor_specification.pdf".to_string()
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: default_sensor_name(),
            description: default_sensor_description(),
            encoding_type: default_sensor_encoding(),
            metadata: default_sensor_metadata(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default)]
    pub thing_ids: Vec<EntityId>,
    #[serde(default = "default_fetch_output")]
    pub output_path: String,
}

fn default_fetch_output() -> String {
    "observations_data.json".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            thing_ids: Vec::new(),
            output_path: default_fetch_output(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_export_output")]
    pub output_path: String,
}

fn default_export_output() -> String {
    "sensor_locations.json".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_path: default_export_output(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse, expand `${VAR}` references and validate a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Valid http(s) server URL
    /// - Positive request timeout
    /// - Coordinates within WGS84 ranges
    /// - Channel keys and columns unique across all channels, none reserved
    fn validate(&self) -> Result<()> {
        match url::Url::parse(&self.server.base_url) {
            Ok(parsed) => {
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(AppError::Config(format!(
                        "Server base_url must use http or https, got: {}",
                        parsed.scheme()
                    )));
                }
            }
            Err(e) => {
                return Err(AppError::Config(format!(
                    "Invalid server base_url '{}': {}",
                    self.server.base_url, e
                )));
            }
        }

        if self.server.timeout_seconds == 0 {
            return Err(AppError::Config(
                "Server timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.server.timeout_seconds > 300 {
            tracing::warn!(
                "Request timeout of {} seconds is very long, an unreachable server will stall the run",
                self.server.timeout_seconds
            );
        }

        if let Some(upload) = &self.upload {
            upload.validate()?;
        }

        if self.fetch.output_path.is_empty() || self.export.output_path.is_empty() {
            return Err(AppError::Config("Output paths cannot be empty".to_string()));
        }

        Ok(())
    }
}

impl UploadConfig {
    fn validate(&self) -> Result<()> {
        if self.csv_path.is_empty() {
            return Err(AppError::Config("Upload csv_path cannot be empty".to_string()));
        }

        if !self.delimiter.is_ascii() {
            return Err(AppError::Config(format!(
                "CSV delimiter '{}' must be a single ASCII character",
                self.delimiter
            )));
        }

        if !(0.0..=1.0).contains(&self.max_failure_rate) {
            return Err(AppError::Config(format!(
                "max_failure_rate {} must be between 0.0 and 1.0",
                self.max_failure_rate
            )));
        }

        if self.location.name.trim().is_empty() {
            return Err(AppError::Config("Location name cannot be empty".to_string()));
        }

        if !(-90.0..=90.0).contains(&self.location.latitude) {
            return Err(AppError::Config(format!(
                "Latitude {} out of valid range (-90..90)",
                self.location.latitude
            )));
        }

        if !(-180.0..=180.0).contains(&self.location.longitude) {
            return Err(AppError::Config(format!(
                "Longitude {} out of valid range (-180..180)",
                self.location.longitude
            )));
        }

        if self.channels.is_empty() {
            return Err(AppError::Config(
                "At least one measurement channel must be configured".to_string(),
            ));
        }

        // Headers match a channel by key or column, so both share one namespace
        let mut names = HashSet::new();
        for channel in &self.channels {
            if channel.column == "server_time" || channel.column == "sensor_time" {
                return Err(AppError::Config(format!(
                    "Channel column '{}' is reserved for timestamps",
                    channel.column
                )));
            }

            let key = channel.key.trim().to_lowercase();
            let column = channel.column.trim().to_lowercase();
            if !names.insert(key.clone()) {
                return Err(AppError::Config(format!(
                    "Duplicate channel key '{}' (already used as a key or column)",
                    channel.key
                )));
            }
            if column != key && !names.insert(column) {
                return Err(AppError::Config(format!(
                    "Duplicate channel column '{}' (already used as a key or column)",
                    channel.column
                )));
            }
        }

        Ok(())
    }
}

/// Replace `${VAR}` references outside of comment lines
fn expand_env_vars(content: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid substitution pattern: {}", e)))?;

    let mut missing_vars: Vec<String> = Vec::new();
    let mut lines = Vec::new();

    for line in content.lines() {
        if line.trim_start().starts_with('#') {
            lines.push(line.to_string());
            continue;
        }

        let mut expanded = line.to_string();
        for cap in re.captures_iter(line) {
            let var_name = &cap[1];
            match std::env::var(var_name) {
                Ok(value) => {
                    expanded = expanded.replace(&cap[0], &value);
                }
                Err(_) => {
                    if !missing_vars.iter().any(|v| v == var_name) {
                        missing_vars.push(var_name.to_string());
                    }
                }
            }
        }
        lines.push(expanded);
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    let mut result = lines.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    Ok(result)
}

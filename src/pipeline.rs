use crate::client::StaClient;
use crate::config::{Config, UploadConfig};
use crate::error::{AppError, Result};
use crate::exporter::MapExporter;
use crate::fetcher::ObservationFetcher;
use crate::models::{EntityId, ExportReport, FetchReport, ReadingRow, UploadReport};
use crate::parser::CsvNormalizer;
use crate::resolver::EntityResolver;
use crate::uploader::{ObservationTiming, ObservationUploader};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// The upload, fetch and map-export workflows over one configured server.
pub struct Pipeline {
    config: Config,
    client: StaClient,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        let client = StaClient::new(&config.server)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Normalize the configured CSV export(s) and upload every reading
    ///
    /// CSV problems abort the run before anything is sent. Sensor, Thing and
    /// FeatureOfInterest failures abort too since no observation could be
    /// linked; per-channel and per-observation failures land in the report.
    pub async fn run_upload(&self, csv_override: Option<&str>) -> Result<UploadReport> {
        let upload = self.config.upload.as_ref().ok_or_else(|| {
            AppError::Config("No 'upload' section in configuration".to_string())
        })?;

        let pattern = csv_override.unwrap_or(upload.csv_path.as_str());
        let rows = self.load_rows(upload, pattern)?;

        if rows.is_empty() {
            warn!("No readings found in {}, nothing to upload", pattern);
            return Ok(UploadReport::default());
        }

        let options = upload.options;
        info!(
            "Uploading {} readings for '{}' (feature of interest: {}, entity cache: {})",
            rows.len(),
            upload.location.name,
            options.attach_feature_of_interest,
            options.cache_entities_across_rows
        );

        let mut resolver = EntityResolver::new(&self.client, options.cache_entities_across_rows);
        let sensor = resolver.resolve_sensor(&upload.sensor).await?;
        let thing = resolver.resolve_thing(&upload.location).await?;
        let feature_of_interest = if options.attach_feature_of_interest {
            Some(resolver.resolve_feature_of_interest(&upload.location).await?)
        } else {
            None
        };

        let uploader = ObservationUploader::new(
            &self.client,
            ObservationTiming {
                source: upload.timestamp_source,
                phenomenon_as_interval: upload.phenomenon_time_as_interval,
            },
        );

        let report = if options.cache_entities_across_rows {
            let resolution = resolver
                .resolve_channels(&upload.channels, &upload.location, &thing, &sensor)
                .await;
            let mut report = uploader
                .upload(&rows, &resolution.datastreams, feature_of_interest.as_ref())
                .await;
            report.unresolved_channels = resolution.unresolved;
            report
        } else {
            let mut report = UploadReport::default();
            for (index, row) in rows.iter().enumerate() {
                let resolution = resolver
                    .resolve_channels(&upload.channels, &upload.location, &thing, &sensor)
                    .await;
                let mut row_report = UploadReport {
                    unresolved_channels: resolution.unresolved,
                    ..UploadReport::default()
                };
                uploader
                    .upload_row(
                        index,
                        row,
                        &resolution.datastreams,
                        feature_of_interest.as_ref(),
                        &mut row_report,
                    )
                    .await;
                report.merge(row_report);
            }
            report
        };

        for unresolved in &report.unresolved_channels {
            error!(
                "Channel '{}' was not uploaded: {}",
                unresolved.channel, unresolved.reason
            );
        }
        info!(
            "Upload complete: {} succeeded, {} failed, {} channel(s) unresolved",
            report.succeeded,
            report.failed.len(),
            report.unresolved_channels.len()
        );

        Ok(report)
    }

    fn load_rows(&self, upload: &UploadConfig, pattern: &str) -> Result<Vec<ReadingRow>> {
        let normalizer = CsvNormalizer::new(upload.csv_format());
        let mut rows = Vec::new();

        for path in resolve_csv_paths(pattern)? {
            let (file_rows, stats) = normalizer.normalize(&path).map_err(|e| {
                error!("Failed to process CSV {}: {}", path.display(), e);
                e
            })?;

            info!(
                "Parsed {}: {} rows, {} successful, {} failures{}",
                path.display(),
                stats.total_rows,
                stats.parsed_successfully,
                stats.parse_failures,
                if stats.units_row_skipped {
                    " (units row skipped)"
                } else {
                    ""
                }
            );
            rows.extend(file_rows);
        }

        Ok(rows)
    }

    /// Fetch all observations of the given Things and write them as JSON
    pub async fn run_fetch(&self, thing_ids: &[EntityId], output: &Path) -> Result<FetchReport> {
        if thing_ids.is_empty() {
            return Err(AppError::Config(
                "No Thing ids given; set fetch.thing_ids or pass --thing-id".to_string(),
            ));
        }

        let report = ObservationFetcher::new(&self.client)
            .fetch_for_things(thing_ids)
            .await;

        write_json(output, &report.observations)?;
        info!(
            "Saved {} observations to {}",
            report.observations.len(),
            output.display()
        );

        Ok(report)
    }

    /// Export every located Thing with its latest readings as JSON
    pub async fn run_export(&self, output: &Path) -> Result<ExportReport> {
        let report = MapExporter::new(&self.client).export_locations().await?;

        write_json(output, &report.summaries)?;
        info!(
            "Exported {} sensor locations to {}",
            report.summaries.len(),
            output.display()
        );

        Ok(report)
    }
}

/// Expand a CSV path or glob pattern into the files to upload, sorted
pub fn resolve_csv_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let literal = Path::new(pattern);
    if literal.is_file() {
        return Ok(vec![literal.to_path_buf()]);
    }

    let entries = glob::glob(pattern)
        .map_err(|e| AppError::Config(format!("Invalid CSV path pattern '{}': {}", pattern, e)))?;

    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => paths.push(path),
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable path: {}", e),
        }
    }

    if paths.is_empty() {
        return Err(AppError::Config(format!(
            "No CSV files match '{}'",
            pattern
        )));
    }

    paths.sort();
    Ok(paths)
}

/// Write `value` as pretty-printed JSON with four-space indentation
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
    value.serialize(&mut serializer)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

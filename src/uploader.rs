use crate::client::StaClient;
use crate::config::TimestampSource;
use crate::models::{
    EntityId, EntityRef, IdRef, NewObservation, ReadingRow, UploadFailure, UploadReport,
};
use chrono::{NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

const OBSERVATIONS: &str = "Observations";

/// Which row timestamp stamps an observation and how phenomenon time is written.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObservationTiming {
    pub source: TimestampSource,
    /// Write phenomenon time as the degenerate interval `t/t` instead of `t`.
    pub phenomenon_as_interval: bool,
}

pub struct ObservationUploader<'a> {
    client: &'a StaClient,
    timing: ObservationTiming,
}

impl<'a> ObservationUploader<'a> {
    pub fn new(client: &'a StaClient, timing: ObservationTiming) -> Self {
        Self { client, timing }
    }

    /// Upload one observation per (row, channel) pair
    ///
    /// Failures are logged and recorded; every pair is attempted.
    pub async fn upload(
        &self,
        rows: &[ReadingRow],
        datastreams: &BTreeMap<String, EntityId>,
        feature_of_interest: Option<&EntityRef>,
    ) -> UploadReport {
        let mut report = UploadReport::default();

        for (index, row) in rows.iter().enumerate() {
            self.upload_row(index, row, datastreams, feature_of_interest, &mut report)
                .await;
        }

        info!(
            "Uploaded {} of {} observations ({} failed)",
            report.succeeded,
            report.attempted(),
            report.failed.len()
        );
        report
    }

    /// Upload every channel of a single row into `report`
    pub async fn upload_row(
        &self,
        row_index: usize,
        row: &ReadingRow,
        datastreams: &BTreeMap<String, EntityId>,
        feature_of_interest: Option<&EntityRef>,
        report: &mut UploadReport,
    ) {
        for (channel, datastream) in datastreams {
            let Some(value) = row.values.get(channel) else {
                error!(
                    "Row {} (line {}) has no value for channel {}",
                    row_index, row.line, channel
                );
                report.failed.push(UploadFailure {
                    row_index,
                    channel: channel.clone(),
                    reason: "no value for channel".to_string(),
                });
                continue;
            };

            let observation = self.build_observation(row, *value, datastream, feature_of_interest);

            match self.client.create(OBSERVATIONS, &observation).await {
                Ok(id) => {
                    debug!("Created {} observation {} for row {}", channel, id, row_index);
                    report.succeeded += 1;
                }
                Err(e) => {
                    error!(
                        "Failed to upload {} observation for row {} (line {}): {}",
                        channel, row_index, row.line, e
                    );
                    report.failed.push(UploadFailure {
                        row_index,
                        channel: channel.clone(),
                        reason: e.reason(),
                    });
                }
            }
        }
    }

    pub fn build_observation(
        &self,
        row: &ReadingRow,
        value: f64,
        datastream: &EntityId,
        feature_of_interest: Option<&EntityRef>,
    ) -> NewObservation {
        let timestamp = match self.timing.source {
            TimestampSource::Sensor => row.sensor_time,
            TimestampSource::Server => row.server_time,
        };
        let instant = format_instant(&timestamp);
        let phenomenon_time = if self.timing.phenomenon_as_interval {
            format!("{}/{}", instant, instant)
        } else {
            instant.clone()
        };

        NewObservation {
            result: value,
            phenomenon_time,
            result_time: instant,
            datastream: IdRef::from(datastream),
            feature_of_interest: feature_of_interest.map(|foi| IdRef::from(&foi.id)),
        }
    }
}

/// ISO-8601 instant for a naive CSV timestamp, read as UTC.
pub fn format_instant(timestamp: &NaiveDateTime) -> String {
    Utc.from_utc_datetime(timestamp)
        .to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

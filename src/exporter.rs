use crate::client::{entity_path, StaClient};
use crate::error::Result;
use crate::models::{
    Datastream, EntityId, EntityKind, ExportReport, FetchFailure, LatestObservation,
    ObservationRecord, SensorLocationSummary, Thing,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub struct MapExporter<'a> {
    client: &'a StaClient,
}

impl<'a> MapExporter<'a> {
    pub fn new(client: &'a StaClient) -> Self {
        Self { client }
    }

    /// One summary per (Thing, Location) pair that carries point coordinates,
    /// each with the Thing's latest value per Datastream
    ///
    /// Failed latest-value lookups still export the location; they are listed
    /// in `ExportReport::failures` so a missing reading is not mistaken for an
    /// empty Datastream.
    pub async fn export_locations(&self) -> Result<ExportReport> {
        let things: Vec<Thing> = self
            .client
            .list_all(EntityKind::Thing.collection(), &[("$expand", "Locations")])
            .await?;

        let mut report = ExportReport::default();

        for thing in things {
            let points: Vec<_> = thing.locations.iter().filter_map(|l| l.point()).collect();
            if points.is_empty() {
                debug!("Thing {} has no usable location, skipping", thing.id);
                continue;
            }

            let latest = match self
                .latest_observations(&thing.id, &mut report.failures)
                .await
            {
                Ok(latest) => latest,
                Err(e) => {
                    warn!("Failed to fetch latest observations for Thing {}: {}", thing.id, e);
                    report.failures.push(FetchFailure {
                        scope: format!("Thing {}", thing.id),
                        reason: e.reason(),
                    });
                    BTreeMap::new()
                }
            };

            for point in points {
                report.summaries.push(SensorLocationSummary {
                    thing_id: thing.id.clone(),
                    thing_name: thing
                        .name
                        .clone()
                        .unwrap_or_else(|| "Unnamed Sensor".to_string()),
                    description: thing
                        .description
                        .clone()
                        .unwrap_or_else(|| "No description".to_string()),
                    latitude: point.latitude,
                    longitude: point.longitude,
                    latest_observations: latest.clone(),
                });
            }
        }

        debug!(
            "Built {} location summaries ({} failed lookups)",
            report.summaries.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Most recent observation of each Datastream of a Thing, keyed by
    /// Datastream name. Datastreams without observations are left out; those
    /// whose lookup failed are appended to `failures`.
    pub async fn latest_observations(
        &self,
        thing_id: &EntityId,
        failures: &mut Vec<FetchFailure>,
    ) -> Result<BTreeMap<String, LatestObservation>> {
        let path = entity_path(EntityKind::Thing, thing_id, "Datastreams");
        let datastreams: Vec<Datastream> = self.client.list_all(&path, &[]).await?;

        let mut latest = BTreeMap::new();
        for datastream in datastreams {
            let path = entity_path(EntityKind::Datastream, &datastream.id, "Observations");
            let page = self
                .client
                .list::<ObservationRecord>(
                    &path,
                    &[("$orderby", "phenomenonTime desc"), ("$top", "1")],
                )
                .await;

            match page {
                Ok(page) => {
                    if let Some(observation) = page.value.into_iter().next() {
                        let name = datastream
                            .name
                            .unwrap_or_else(|| "Unknown Measurement".to_string());
                        latest.insert(
                            name,
                            LatestObservation {
                                value: observation.result,
                                time: observation.phenomenon_time,
                            },
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to fetch latest observation for Datastream {}: {}",
                        datastream.id, e
                    );
                    failures.push(FetchFailure {
                        scope: format!("Datastream {}", datastream.id),
                        reason: e.reason(),
                    });
                }
            }
        }

        Ok(latest)
    }
}

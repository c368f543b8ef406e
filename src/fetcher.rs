use crate::client::{entity_path, StaClient};
use crate::error::Result;
use crate::models::{Datastream, EntityId, EntityKind, FetchFailure, FetchReport};
use tracing::{error, info};

/// Reads stored observations back out of the server, Thing by Thing.
pub struct ObservationFetcher<'a> {
    client: &'a StaClient,
}

impl<'a> ObservationFetcher<'a> {
    pub fn new(client: &'a StaClient) -> Self {
        Self { client }
    }

    pub async fn fetch_datastreams(&self, thing_id: &EntityId) -> Result<Vec<Datastream>> {
        let path = entity_path(EntityKind::Thing, thing_id, "Datastreams");
        let datastreams = self.client.list_all(&path, &[]).await?;
        info!(
            "Fetched {} datastreams for Thing {}",
            datastreams.len(),
            thing_id
        );
        Ok(datastreams)
    }

    /// Every observation of one Datastream, in server page order
    pub async fn fetch_observations(
        &self,
        datastream_id: &EntityId,
    ) -> Result<Vec<serde_json::Value>> {
        let path = entity_path(EntityKind::Datastream, datastream_id, "Observations");
        let observations: Vec<serde_json::Value> = self.client.list_all(&path, &[]).await?;
        info!(
            "Fetched {} observations for Datastream {}",
            observations.len(),
            datastream_id
        );
        Ok(observations)
    }

    /// Collect observations of all Datastreams of the given Things
    ///
    /// Records keep discovery order (Thing, then Datastream, then page). A
    /// failing Thing or Datastream contributes nothing and is listed in
    /// `FetchReport::failures` so it can be told apart from an empty branch.
    pub async fn fetch_for_things(&self, thing_ids: &[EntityId]) -> FetchReport {
        let mut report = FetchReport::default();

        for thing_id in thing_ids {
            let datastreams = match self.fetch_datastreams(thing_id).await {
                Ok(datastreams) => datastreams,
                Err(e) => {
                    error!("Failed to fetch Datastreams for Thing {}: {}", thing_id, e);
                    report.failures.push(FetchFailure {
                        scope: format!("Thing {}", thing_id),
                        reason: e.reason(),
                    });
                    continue;
                }
            };

            for datastream in datastreams {
                match self.fetch_observations(&datastream.id).await {
                    Ok(observations) => report.observations.extend(observations),
                    Err(e) => {
                        error!(
                            "Failed to fetch Observations for Datastream {}: {}",
                            datastream.id, e
                        );
                        report.failures.push(FetchFailure {
                            scope: format!("Datastream {}", datastream.id),
                            reason: e.reason(),
                        });
                    }
                }
            }
        }

        info!(
            "Fetched {} observations from {} Things ({} failed branches)",
            report.observations.len(),
            thing_ids.len(),
            report.failures.len()
        );
        report
    }
}

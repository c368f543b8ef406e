use crate::client::{odata_literal, StaClient};
use crate::config::{LocationConfig, SensorConfig};
use crate::error::{AppError, Result};
use crate::models::{
    EntityId, EntityKind, EntityRef, EntityStub, GeoJsonFeature, GeoJsonPoint, IdRef,
    MeasurementChannel, NewDatastream, NewFeatureOfInterest, NewLocation, NewObservedProperty,
    NewSensor, NewThing, UnitOfMeasurement, UnresolvedChannel,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

const GEOJSON_ENCODING: &str = "application/geo+json";
const OM_MEASUREMENT: &str = "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_Measurement";

/// Exact-match lookup used before creating an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lookup {
    pub name: String,
    pub thing: Option<EntityId>,
}

impl Lookup {
    pub fn by_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            thing: None,
        }
    }

    /// Restrict the match to entities linked to one Thing.
    pub fn within_thing(mut self, thing: &EntityId) -> Self {
        self.thing = Some(thing.clone());
        self
    }

    pub fn filter(&self) -> String {
        let mut filter = format!("name eq {}", odata_literal(&self.name));
        if let Some(thing) = &self.thing {
            let key = match thing {
                EntityId::Number(n) => n.to_string(),
                EntityId::Text(s) => odata_literal(s),
            };
            filter.push_str(&format!(" and Thing/@iot.id eq {}", key));
        }
        filter
    }
}

/// Datastreams resolved for an upload, plus the channels that could not be.
#[derive(Debug, Default)]
pub struct ChannelResolution {
    /// Channel column → Datastream id.
    pub datastreams: BTreeMap<String, EntityId>,
    pub unresolved: Vec<UnresolvedChannel>,
}

/// Find-or-create reconciliation of STA entities by name.
///
/// Relies on server-side name uniqueness: two runs racing against the same
/// server can both miss the lookup and create duplicates.
pub struct EntityResolver<'a> {
    client: &'a StaClient,
    cache: HashMap<(EntityKind, Lookup), EntityId>,
    use_cache: bool,
}

impl<'a> EntityResolver<'a> {
    pub fn new(client: &'a StaClient, use_cache: bool) -> Self {
        Self {
            client,
            cache: HashMap::new(),
            use_cache,
        }
    }

    /// Return the id of the first entity matching `lookup`, creating it from
    /// `payload` when none exists.
    pub async fn resolve_or_create<P: Serialize>(
        &mut self,
        kind: EntityKind,
        lookup: &Lookup,
        payload: &P,
    ) -> Result<EntityRef> {
        let cache_key = (kind, lookup.clone());
        if self.use_cache {
            if let Some(id) = self.cache.get(&cache_key) {
                return Ok(EntityRef {
                    kind,
                    id: id.clone(),
                });
            }
        }

        let failed = |reason: String| AppError::EntityCreationFailed {
            kind,
            name: lookup.name.clone(),
            reason,
        };

        let filter = lookup.filter();
        let existing = self
            .client
            .list::<EntityStub>(kind.collection(), &[("$filter", filter.as_str()), ("$top", "1")])
            .await
            .map_err(|e| failed(format!("lookup failed: {}", e.reason())))?;

        let id = match existing.value.into_iter().next() {
            Some(stub) => {
                info!("Existing {} '{}' found with ID: {}", kind, lookup.name, stub.id);
                stub.id
            }
            None => {
                let id = self
                    .client
                    .create(kind.collection(), payload)
                    .await
                    .map_err(|e| failed(e.reason()))?;
                info!("Created new {} '{}' with ID: {}", kind, lookup.name, id);
                id
            }
        };

        if self.use_cache {
            self.cache.insert(cache_key, id.clone());
        }

        Ok(EntityRef { kind, id })
    }

    pub async fn resolve_sensor(&mut self, sensor: &SensorConfig) -> Result<EntityRef> {
        let payload = NewSensor {
            name: sensor.name.clone(),
            description: sensor.description.clone(),
            encoding_type: sensor.encoding_type.clone(),
            metadata: sensor.metadata.clone(),
        };
        self.resolve_or_create(EntityKind::Sensor, &Lookup::by_name(&sensor.name), &payload)
            .await
    }

    /// The station Thing, created with its Location inline so it shows up in
    /// `Things?$expand=Locations`.
    pub async fn resolve_thing(&mut self, location: &LocationConfig) -> Result<EntityRef> {
        let name = thing_name(location);
        let mut properties = BTreeMap::new();
        properties.insert(
            "application".to_string(),
            "Environmental Monitoring".to_string(),
        );
        properties.insert(
            "deployment_date".to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
        properties.insert("location_name".to_string(), location.name.clone());

        let payload = NewThing {
            name: name.clone(),
            description: format!("Environmental monitoring station at {}", location.name),
            properties,
            locations: vec![NewLocation {
                name: location.name.clone(),
                description: format!("Monitoring location at {}", location.name),
                encoding_type: GEOJSON_ENCODING.to_string(),
                location: GeoJsonPoint::new(location.latitude, location.longitude),
            }],
        };
        self.resolve_or_create(EntityKind::Thing, &Lookup::by_name(&name), &payload)
            .await
    }

    pub async fn resolve_observed_property(
        &mut self,
        channel: &MeasurementChannel,
    ) -> Result<EntityRef> {
        let payload = NewObservedProperty {
            name: channel.key.clone(),
            description: channel
                .description
                .clone()
                .unwrap_or_else(|| format!("Measuring {}", channel.key)),
            definition: channel.property_definition.clone(),
        };
        self.resolve_or_create(
            EntityKind::ObservedProperty,
            &Lookup::by_name(&channel.key),
            &payload,
        )
        .await
    }

    pub async fn resolve_feature_of_interest(
        &mut self,
        location: &LocationConfig,
    ) -> Result<EntityRef> {
        let name = format!("Location - {}", location.name);
        let mut properties = BTreeMap::new();
        properties.insert("name".to_string(), name.clone());

        let payload = NewFeatureOfInterest {
            name: name.clone(),
            description: format!("Monitoring location at {}", location.name),
            encoding_type: GEOJSON_ENCODING.to_string(),
            feature: GeoJsonFeature {
                kind: "Feature",
                geometry: GeoJsonPoint::new(location.latitude, location.longitude),
                properties,
            },
        };
        self.resolve_or_create(EntityKind::FeatureOfInterest, &Lookup::by_name(&name), &payload)
            .await
    }

    /// Datastream binding one channel to the station. Needs all three
    /// upstream references, so it only runs once they are resolved.
    pub async fn resolve_datastream(
        &mut self,
        channel: &MeasurementChannel,
        location: &LocationConfig,
        thing: &EntityRef,
        observed_property: &EntityRef,
        sensor: &EntityRef,
    ) -> Result<EntityRef> {
        let name = format!("{} Datastream - {}", channel.key, location.name);
        let payload = NewDatastream {
            name: name.clone(),
            description: format!("Measures {} at {}", channel.key, location.name),
            unit_of_measurement: UnitOfMeasurement {
                name: channel.unit_name.clone(),
                symbol: channel.unit_symbol.clone(),
                definition: channel.unit_definition.clone(),
            },
            observation_type: OM_MEASUREMENT.to_string(),
            thing: IdRef::from(&thing.id),
            observed_property: IdRef::from(&observed_property.id),
            sensor: IdRef::from(&sensor.id),
        };
        let lookup = Lookup::by_name(&name).within_thing(&thing.id);
        self.resolve_or_create(EntityKind::Datastream, &lookup, &payload)
            .await
    }

    /// Resolve ObservedProperty and Datastream for every channel.
    ///
    /// A failing channel is recorded and skipped; the others still resolve.
    pub async fn resolve_channels(
        &mut self,
        channels: &[MeasurementChannel],
        location: &LocationConfig,
        thing: &EntityRef,
        sensor: &EntityRef,
    ) -> ChannelResolution {
        let mut resolution = ChannelResolution::default();

        for channel in channels {
            let outcome = match self.resolve_observed_property(channel).await {
                Ok(observed_property) => {
                    self.resolve_datastream(channel, location, thing, &observed_property, sensor)
                        .await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(datastream) => {
                    resolution
                        .datastreams
                        .insert(channel.column.clone(), datastream.id);
                }
                Err(e) => {
                    warn!("Skipping channel '{}': {}", channel.key, e);
                    resolution.unresolved.push(UnresolvedChannel {
                        channel: channel.column.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        resolution
    }
}

pub fn thing_name(location: &LocationConfig) -> String {
    format!("Environmental Station - {}", location.name)
}

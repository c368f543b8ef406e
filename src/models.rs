use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The STA entity kinds this client reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Sensor,
    Thing,
    ObservedProperty,
    FeatureOfInterest,
    Datastream,
}

impl EntityKind {
    /// Entity set name used in request paths.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Sensor => "Sensors",
            EntityKind::Thing => "Things",
            EntityKind::ObservedProperty => "ObservedProperties",
            EntityKind::FeatureOfInterest => "FeaturesOfInterest",
            EntityKind::Datastream => "Datastreams",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Sensor => "Sensor",
            EntityKind::Thing => "Thing",
            EntityKind::ObservedProperty => "ObservedProperty",
            EntityKind::FeatureOfInterest => "FeatureOfInterest",
            EntityKind::Datastream => "Datastream",
        };
        f.write_str(s)
    }
}

/// Server-assigned `@iot.id`. FROST hands out integers by default but can be
/// configured for string ids, so both are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Number(i64),
    Text(String),
}

impl EntityId {
    /// Key as it appears inside an entity path, e.g. `42` or `'abc'`.
    pub fn path_key(&self) -> String {
        match self {
            EntityId::Number(n) => n.to_string(),
            EntityId::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// Parse the key out of an entity URL such as `.../Things(42)` or `.../Things('a')`.
    pub fn from_entity_url(url: &str) -> Option<Self> {
        let open = url.rfind('(')?;
        let close = url[open..].find(')')? + open;
        let key = &url[open + 1..close];
        if key.len() >= 2 && key.starts_with('\'') && key.ends_with('\'') {
            return Some(EntityId::Text(key[1..key.len() - 1].replace("''", "'")));
        }
        key.parse().ok()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Number(n) => write!(f, "{}", n),
            EntityId::Text(s) => f.write_str(s),
        }
    }
}

impl FromStr for EntityId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().parse::<i64>() {
            Ok(n) => EntityId::Number(n),
            Err(_) => EntityId::Text(s.trim().to_string()),
        })
    }
}

impl From<i64> for EntityId {
    fn from(n: i64) -> Self {
        EntityId::Number(n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

/// `{"@iot.id": ...}` link used inside payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdRef {
    #[serde(rename = "@iot.id")]
    pub id: EntityId,
}

impl From<&EntityId> for IdRef {
    fn from(id: &EntityId) -> Self {
        Self { id: id.clone() }
    }
}

/// One physical quantity tracked by the station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementChannel {
    /// Header text in the CSV, also the ObservedProperty name.
    pub key: String,
    /// Canonical column name after normalization.
    pub column: String,
    pub unit_name: String,
    pub unit_symbol: String,
    pub unit_definition: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_property_definition")]
    pub property_definition: String,
}

fn default_property_definition() -> String {
    "http://example.org/property_definition".to_string()
}

impl MeasurementChannel {
    pub fn new(
        key: &str,
        column: &str,
        unit_name: &str,
        unit_symbol: &str,
        unit_definition: &str,
    ) -> Self {
        Self {
            key: key.to_string(),
            column: column.to_string(),
            unit_name: unit_name.to_string(),
            unit_symbol: unit_symbol.to_string(),
            unit_definition: unit_definition.to_string(),
            description: None,
            property_definition: default_property_definition(),
        }
    }

    /// Whether a CSV header cell names this channel.
    pub fn matches_header(&self, header: &str) -> bool {
        let header = header.trim();
        header.eq_ignore_ascii_case(&self.key) || header.eq_ignore_ascii_case(&self.column)
    }
}

/// CO2, temperature and humidity as exported by the CO2 monitor.
pub fn default_channels() -> Vec<MeasurementChannel> {
    vec![
        MeasurementChannel::new(
            "CO2 concentration",
            "co2",
            "parts per million",
            "ppm",
            "http://www.qudt.org/qudt/owl/1.0.0/unit/Instances.html#PartsPerMillion",
        ),
        MeasurementChannel::new(
            "Temperature",
            "temperature",
            "degree Celsius",
            "°C",
            "http://www.qudt.org/qudt/owl/1.0.0/unit/Instances.html#DegreeCelsius",
        ),
        MeasurementChannel::new(
            "Humidity",
            "humidity",
            "percent",
            "%",
            "http://www.qudt.org/qudt/owl/1.0.0/unit/Instances.html#Percent",
        ),
    ]
}

/// One normalized CSV data row.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingRow {
    /// 1-based line in the source file.
    pub line: usize,
    pub server_time: NaiveDateTime,
    pub sensor_time: NaiveDateTime,
    /// Keyed by channel column name.
    pub values: BTreeMap<String, f64>,
}

/// List response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Collection<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@iot.nextLink", default)]
    pub next_link: Option<String>,
}

/// Minimal view of any entity: just its id.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityStub {
    #[serde(rename = "@iot.id")]
    pub id: EntityId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Datastream {
    #[serde(rename = "@iot.id")]
    pub id: EntityId,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thing {
    #[serde(rename = "@iot.id")]
    pub id: EntityId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "Locations", default)]
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub location: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Point coordinates of this location, if it carries a usable geometry.
    ///
    /// GeoJSON stores `[longitude, latitude]`; the result names them explicitly.
    /// A Feature is read through its `geometry` member.
    pub fn point(&self) -> Option<GeoPoint> {
        let location = self.location.as_ref()?;
        let geometry = location.get("geometry").unwrap_or(location);
        let coordinates = geometry.get("coordinates")?.as_array()?;
        match coordinates.as_slice() {
            [longitude, latitude, ..] => Some(GeoPoint {
                latitude: latitude.as_f64()?,
                longitude: longitude.as_f64()?,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationRecord {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(rename = "phenomenonTime", default)]
    pub phenomenon_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitOfMeasurement {
    pub name: String,
    pub symbol: String,
    pub definition: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeoJsonPoint {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub coordinates: [f64; 2],
}

impl GeoJsonPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            kind: "Point",
            coordinates: [longitude, latitude],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeoJsonFeature {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub geometry: GeoJsonPoint,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewSensor {
    pub name: String,
    pub description: String,
    #[serde(rename = "encodingType")]
    pub encoding_type: String,
    pub metadata: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewLocation {
    pub name: String,
    pub description: String,
    #[serde(rename = "encodingType")]
    pub encoding_type: String,
    pub location: GeoJsonPoint,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewThing {
    pub name: String,
    pub description: String,
    pub properties: BTreeMap<String, String>,
    #[serde(rename = "Locations", skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<NewLocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewObservedProperty {
    pub name: String,
    pub description: String,
    pub definition: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewFeatureOfInterest {
    pub name: String,
    pub description: String,
    #[serde(rename = "encodingType")]
    pub encoding_type: String,
    pub feature: GeoJsonFeature,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewDatastream {
    pub name: String,
    pub description: String,
    #[serde(rename = "unitOfMeasurement")]
    pub unit_of_measurement: UnitOfMeasurement,
    #[serde(rename = "observationType")]
    pub observation_type: String,
    #[serde(rename = "Thing")]
    pub thing: IdRef,
    #[serde(rename = "ObservedProperty")]
    pub observed_property: IdRef,
    #[serde(rename = "Sensor")]
    pub sensor: IdRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewObservation {
    pub result: f64,
    #[serde(rename = "phenomenonTime")]
    pub phenomenon_time: String,
    #[serde(rename = "resultTime")]
    pub result_time: String,
    #[serde(rename = "Datastream")]
    pub datastream: IdRef,
    #[serde(rename = "FeatureOfInterest", skip_serializing_if = "Option::is_none")]
    pub feature_of_interest: Option<IdRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestObservation {
    pub value: serde_json::Value,
    pub time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorLocationSummary {
    pub thing_id: EntityId,
    pub thing_name: String,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    pub latest_observations: BTreeMap<String, LatestObservation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadFailure {
    pub row_index: usize,
    pub channel: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedChannel {
    pub channel: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub succeeded: usize,
    pub failed: Vec<UploadFailure>,
    pub unresolved_channels: Vec<UnresolvedChannel>,
}

impl UploadReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty() || !self.unresolved_channels.is_empty()
    }

    pub fn merge(&mut self, other: UploadReport) {
        self.succeeded += other.succeeded;
        self.failed.extend(other.failed);
        for unresolved in other.unresolved_channels {
            if !self.unresolved_channels.contains(&unresolved) {
                self.unresolved_channels.push(unresolved);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    /// Which branch failed, e.g. `Thing 3` or `Datastream 12`.
    pub scope: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub observations: Vec<serde_json::Value>,
    pub failures: Vec<FetchFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub summaries: Vec<SensorLocationSummary>,
    pub failures: Vec<FetchFailure>,
}

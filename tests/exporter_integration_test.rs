use serde_json::json;
use sta_sync::client::StaClient;
use sta_sync::config::ServerConfig;
use sta_sync::exporter::MapExporter;
use sta_sync::models::EntityId;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> StaClient {
    StaClient::new(&ServerConfig::new(&format!("{}/v1.1", server.uri())))
        .expect("Failed to create client")
}

async fn mount_things(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1.1/Things"))
        .and(query_param("$expand", "Locations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {
                    "@iot.id": 1,
                    "name": "Environmental Station - Room A1",
                    "description": "Environmental monitoring station at Room A1",
                    "Locations": [
                        { "location": { "type": "Point", "coordinates": [9.19, 48.79] } }
                    ]
                },
                {
                    "@iot.id": 2,
                    "name": "Spare Station",
                    "Locations": []
                },
                {
                    "@iot.id": 3,
                    "Locations": [{
                        "location": {
                            "type": "Feature",
                            "geometry": { "type": "Point", "coordinates": [13.4, 52.5] }
                        }
                    }]
                }
            ]
        })))
        .expect(1)
        .mount(server)
        .await;
}

/// Located Things are exported with lat/lon taken from GeoJSON [lon, lat]
#[tokio::test]
async fn test_export_locations_reads_coordinates_and_latest_values() {
    let server = MockServer::start().await;
    mount_things(&server).await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Things(1)/Datastreams"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "@iot.id": 10, "name": "CO2 concentration Datastream - Room A1" },
                { "@iot.id": 11, "name": "Temperature Datastream - Room A1" }
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Datastreams(10)/Observations"))
        .and(query_param("$orderby", "phenomenonTime desc"))
        .and(query_param("$top", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{ "@iot.id": 500, "result": 415.0, "phenomenonTime": "2024-01-01T10:01:05Z" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Datastreams(11)/Observations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
        .mount(&server)
        .await;

    // Things without a location are never asked for their Datastreams
    Mock::given(method("GET"))
        .and(path("/v1.1/Things(2)/Datastreams"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Things(3)/Datastreams"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let report = MapExporter::new(&client)
        .export_locations()
        .await
        .expect("Export should succeed");
    let summaries = &report.summaries;

    assert_eq!(summaries.len(), 2);

    let station = &summaries[0];
    assert_eq!(station.thing_id, EntityId::Number(1));
    assert_eq!(station.thing_name, "Environmental Station - Room A1");
    assert_eq!(station.latitude, 48.79);
    assert_eq!(station.longitude, 9.19);
    assert_eq!(station.latest_observations.len(), 1);

    let co2 = &station.latest_observations["CO2 concentration Datastream - Room A1"];
    assert_eq!(co2.value, json!(415.0));
    assert_eq!(co2.time.as_deref(), Some("2024-01-01T10:01:05Z"));

    // Failing latest-value lookup still exports the location, with defaults
    let unnamed = &summaries[1];
    assert_eq!(unnamed.thing_name, "Unnamed Sensor");
    assert_eq!(unnamed.description, "No description");
    assert_eq!(unnamed.latitude, 52.5);
    assert_eq!(unnamed.longitude, 13.4);
    assert!(unnamed.latest_observations.is_empty());

    // An empty Datastream is not a failure, the unreachable Thing is
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].scope, "Thing 3");
    assert!(report.failures[0].reason.contains("500"));
}

/// A failed latest-value lookup for one Datastream is reported while the
/// other Datastreams of the Thing are still exported
#[tokio::test]
async fn test_export_locations_reports_failed_datastream_lookup() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Things"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{
                "@iot.id": 1,
                "name": "Environmental Station - Room A1",
                "Locations": [
                    { "location": { "type": "Point", "coordinates": [9.19, 48.79] } }
                ]
            }]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Things(1)/Datastreams"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                { "@iot.id": 10, "name": "CO2 concentration Datastream - Room A1" },
                { "@iot.id": 11, "name": "Temperature Datastream - Room A1" }
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Datastreams(10)/Observations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{ "@iot.id": 500, "result": 415.0, "phenomenonTime": "2024-01-01T10:01:05Z" }]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Datastreams(11)/Observations"))
        .respond_with(ResponseTemplate::new(500).set_body_string("query timeout"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let report = MapExporter::new(&client)
        .export_locations()
        .await
        .expect("Export should succeed");

    assert_eq!(report.summaries.len(), 1);
    let latest = &report.summaries[0].latest_observations;
    assert_eq!(latest.len(), 1);
    assert!(latest.contains_key("CO2 concentration Datastream - Room A1"));

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].scope, "Datastream 11");
    assert!(report.failures[0].reason.contains("query timeout"));
}

/// An unreachable Things listing fails the export
#[tokio::test]
async fn test_export_locations_propagates_listing_failure() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/Things"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = MapExporter::new(&client).export_locations().await;

    tokio_test::assert_err!(result);
}

use serde_json::json;
use sta_sync::client::StaClient;
use sta_sync::config::{ServerConfig, TimestampSource};
use sta_sync::models::{EntityId, EntityKind, EntityRef, ReadingRow};
use sta_sync::parser::{CsvFormat, CsvNormalizer};
use sta_sync::uploader::{ObservationTiming, ObservationUploader};
use std::collections::BTreeMap;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CSV: &str = "Server time;Sensor time;CO2 concentration;Temperature;Humidity\n\
                   ;;ppm;°C;%\n\
                   2024-01-01 10:00:00;2024-01-01 10:00:05+02:00;412.5;21.3;45.0\n\
                   2024-01-01 10:01:00;2024-01-01 10:01:05+02:00;415.0;21.4;44.8\n";

fn rows() -> Vec<ReadingRow> {
    let (rows, _) = CsvNormalizer::new(CsvFormat::default())
        .normalize_str(CSV)
        .expect("Fixture CSV should parse");
    rows
}

fn datastreams() -> BTreeMap<String, EntityId> {
    BTreeMap::from([
        ("co2".to_string(), EntityId::Number(1)),
        ("temperature".to_string(), EntityId::Number(2)),
        ("humidity".to_string(), EntityId::Number(3)),
    ])
}

fn client_for(server: &MockServer) -> StaClient {
    StaClient::new(&ServerConfig::new(&format!("{}/v1.1", server.uri())))
        .expect("Failed to create client")
}

/// Two rows of three channels give six observations
#[tokio::test]
async fn test_upload_posts_one_observation_per_row_and_channel() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1.1/Observations"))
        .and(body_partial_json(json!({
            "result": 412.5,
            "phenomenonTime": "2024-01-01T10:00:05Z",
            "resultTime": "2024-01-01T10:00:05Z",
            "Datastream": { "@iot.id": 1 },
            "FeatureOfInterest": { "@iot.id": 9 }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "@iot.id": 100 })))
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1.1/Observations"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "@iot.id": 101 })))
        .expect(5)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let uploader = ObservationUploader::new(&client, ObservationTiming::default());
    let foi = EntityRef {
        kind: EntityKind::FeatureOfInterest,
        id: EntityId::Number(9),
    };

    let report = uploader.upload(&rows(), &datastreams(), Some(&foi)).await;

    assert_eq!(report.succeeded, 6);
    assert!(report.failed.is_empty());
    assert!(!report.has_failures());
}

/// A rejected observation is reported with its row and channel while the
/// rest of the run carries on
#[tokio::test]
async fn test_upload_continues_past_failed_observation() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1.1/Observations"))
        .and(body_partial_json(json!({
            "phenomenonTime": "2024-01-01T10:01:05Z",
            "Datastream": { "@iot.id": 2 }
        })))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad result"))
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1.1/Observations"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "@iot.id": 1 })))
        .expect(5)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let uploader = ObservationUploader::new(&client, ObservationTiming::default());

    let report = uploader.upload(&rows(), &datastreams(), None).await;

    assert_eq!(report.succeeded, 5);
    assert_eq!(report.attempted(), 6);
    assert_eq!(report.failed.len(), 1);

    let failure = &report.failed[0];
    assert_eq!(failure.row_index, 1);
    assert_eq!(failure.channel, "temperature");
    assert!(failure.reason.contains("400"));
    assert!(report.has_failures());
}

/// Server time stamps the observation when configured
#[tokio::test]
async fn test_upload_with_server_timestamps() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1.1/Observations"))
        .and(body_partial_json(json!({
            "phenomenonTime": "2024-01-01T10:00:00Z/2024-01-01T10:00:00Z",
            "resultTime": "2024-01-01T10:00:00Z"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "@iot.id": 1 })))
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let timing = ObservationTiming {
        source: TimestampSource::Server,
        phenomenon_as_interval: true,
    };
    let uploader = ObservationUploader::new(&client, timing);

    let rows = rows();
    let report = uploader.upload(&rows[..1], &datastreams(), None).await;

    assert_eq!(report.succeeded, 3);
}

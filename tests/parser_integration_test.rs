use sta_sync::config::Config;
use sta_sync::error::AppError;
use sta_sync::parser::{CsvFormat, CsvNormalizer};
use std::io::Write;

const HEADER: &str = "Server time;Sensor time;CO2 concentration;Temperature;Humidity";

fn export_with_bad_rows(total: usize, bad: usize) -> String {
    let mut content = format!("{}\n;;ppm;°C;%\n", HEADER);
    for i in 0..total {
        let co2 = if i < bad { "n/a".to_string() } else { format!("{}.5", 400 + i) };
        content.push_str(&format!(
            "2024-01-01 10:{:02}:00;2024-01-01 10:{:02}:05+02:00;{};21.3;45.0\n",
            i, i, co2
        ));
    }
    content
}

/// Device export on disk with a units row, read the way upload does
#[test]
fn test_normalize_file_with_units_row() {
    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    write!(
        file,
        "\u{feff}Server time;Sensor time;CO2 concentration;Temperature;Humidity\n\
         ;;ppm;°C;%\n\
         2024-01-01 10:00:00;2024-01-01 10:00:05+02:00;412.5;21.3;45.0\n\
         \n\
         2024-01-01 10:01:00;2024-01-01T10:01:05Z;415.0;21.4;44.8\n"
    )
    .unwrap();

    let normalizer = CsvNormalizer::new(CsvFormat::default());
    let (rows, stats) = normalizer.normalize(file.path()).expect("Parse failed");

    assert_eq!(rows.len(), 2);
    assert!(stats.units_row_skipped);
    assert_eq!(stats.parsed_successfully, 2);
    assert_eq!(stats.parse_failures, 0);

    let first = &rows[0];
    assert_eq!(
        first.server_time.format("%Y-%m-%d %H:%M:%S").to_string(),
        "2024-01-01 10:00:00"
    );
    assert_eq!(
        first.sensor_time.format("%Y-%m-%d %H:%M:%S").to_string(),
        "2024-01-01 10:00:05"
    );
    assert_eq!(first.values["co2"], 412.5);
    assert_eq!(first.values["temperature"], 21.3);
    assert_eq!(first.values["humidity"], 45.0);
    assert_eq!(first.line, 3);
}

/// Skipped rows are tolerated up to the failure threshold
#[test]
fn test_skip_policy_within_threshold() {
    let content = export_with_bad_rows(10, 1);
    let (rows, stats) = CsvNormalizer::new(CsvFormat::default())
        .normalize_str(&content)
        .expect("One bad row in ten is within the default threshold");

    assert_eq!(rows.len(), 9);
    assert_eq!(stats.parse_failures, 1);
    assert!((stats.failure_rate - 0.1).abs() < f64::EPSILON);
}

#[test]
fn test_skip_policy_rejects_file_above_threshold() {
    let content = export_with_bad_rows(10, 2);
    let result = CsvNormalizer::new(CsvFormat::default()).normalize_str(&content);

    match result.unwrap_err() {
        AppError::MalformedFile(msg) => assert!(msg.contains("exceeds threshold")),
        e => panic!("Expected MalformedFile error, got: {:?}", e),
    }
}

#[test]
fn test_abort_policy_reports_first_bad_cell() {
    let content = export_with_bad_rows(10, 1);
    let format = CsvFormat {
        on_malformed_row: sta_sync::config::RowPolicy::Abort,
        ..CsvFormat::default()
    };

    match CsvNormalizer::new(format).normalize_str(&content).unwrap_err() {
        AppError::MalformedRow { line, column, value } => {
            assert_eq!(line, 3);
            assert_eq!(column, "co2");
            assert_eq!(value, "n/a");
        }
        e => panic!("Expected MalformedRow error, got: {:?}", e),
    }
}

/// Only a header row is a valid, empty export
#[test]
fn test_header_only_file_yields_no_rows() {
    let (rows, stats) = CsvNormalizer::new(CsvFormat::default())
        .normalize_str(&format!("{}\n", HEADER))
        .expect("Header-only file should parse");

    assert!(rows.is_empty());
    assert_eq!(stats.total_rows, 0);
}

/// Delimiter, time format and channels all come from the upload config
#[test]
fn test_format_from_upload_config() {
    let config = Config::from_yaml(
        r#"
server:
  base_url: http://localhost:8080/FROST-Server/v1.1
upload:
  csv_path: data.csv
  delimiter: ","
  server_time_format: "%d.%m.%Y %H:%M"
  location:
    name: Lab
    latitude: 52.5
    longitude: 13.4
  channels:
    - key: PM2.5
      column: pm25
      unit_name: microgram per cubic meter
      unit_symbol: "µg/m³"
      unit_definition: http://example.org/ugm3
"#,
    )
    .expect("Config should be valid");

    let upload = config.upload.expect("upload section");
    let normalizer = CsvNormalizer::new(upload.csv_format());
    let (rows, _) = normalizer
        .normalize_str("Server time,Sensor time,PM2.5\n01.01.2024 10:00,2024-01-01 10:00:05,12.5\n")
        .expect("Parse failed");

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values["pm25"], 12.5);
    assert_eq!(
        rows[0].server_time.format("%Y-%m-%d %H:%M").to_string(),
        "2024-01-01 10:00"
    );
}

use sta_sync::config::Config;
use sta_sync::models::EntityId;

const SHIPPED_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/config.yaml");

/// The config file shipped with the crate loads once STA_BASE_URL is set
#[test]
fn test_shipped_config_loads_with_base_url_from_env() {
    std::env::set_var("STA_BASE_URL", "http://localhost:8080/FROST-Server/v1.1");

    let config = Config::load(SHIPPED_CONFIG).expect("Shipped config should load");

    assert_eq!(config.server.base_url, "http://localhost:8080/FROST-Server/v1.1");
    assert_eq!(config.server.timeout_seconds, 30);

    let upload = config.upload.expect("Shipped config has an upload section");
    assert_eq!(upload.location.name, "Room A1");
    assert_eq!(upload.delimiter, ';');
    assert_eq!(upload.channels.len(), 3);

    assert_eq!(config.fetch.thing_ids.len(), 10);
    assert_eq!(config.fetch.thing_ids[0], EntityId::Number(1));
    assert_eq!(config.export.output_path, "sensor_locations.json");
}

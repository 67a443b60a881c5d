use std::io::Write;

use dimse::{QueryLevel, RetrieveMode};
use pacs_proxy::config::{Config, ConfigError};

fn load_config_from_str(toml: &str) -> Result<Config, ConfigError> {
    Config::from_toml(toml)
}

#[test]
fn test_full_config_from_file() {
    let toml = r#"
        [proxy]
        id = "gateway-1"
        log_level = "debug"

        [logging]
        log_to_file = true
        log_file_path = "/var/log/pacs/proxy.log"

        [network.http]
        bind_address = "127.0.0.1"
        bind_port = 8080

        [dimse]
        retrieve_mode = "move"
        start_listener = true
        verbose = true
        timeout_secs = 120

        [dimse.source]
        ae_title = "GATEWAY"
        host = "0.0.0.0"
        port = 8888

        [dimse.target]
        ae_title = "ARCHIVE"
        host = "pacs.example.org"
        port = 104

        [retrieval]
        storage_path = "/var/lib/pacs"
        keep_cache_minutes = 30
        max_associations = 8
        fetch_level = "IMAGE"
        sweep_interval_secs = 300
    "#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(toml.as_bytes()).unwrap();

    let config = Config::from_file(file.path()).expect("Configuration should load");
    assert_eq!(config.proxy.log_level, "debug");
    assert!(config.logging.log_to_file);
    assert_eq!(config.bind_address(), "127.0.0.1:8080");
    assert_eq!(config.dimse.retrieve_mode, RetrieveMode::Move);
    assert!(config.dimse.start_listener);
    assert_eq!(config.dimse.target.port, 104);
    assert_eq!(config.retrieval.fetch_level, QueryLevel::Image);
    assert_eq!(config.retrieval.max_associations, 8);
    assert_eq!(
        config.retrieval.sweep_interval(),
        Some(std::time::Duration::from_secs(300))
    );
    assert_eq!(
        config.retrieval.cache_db_path(),
        std::path::PathBuf::from("/var/lib/pacs/persist/cache.redb")
    );
}

#[test]
fn test_missing_file_is_io_error() {
    let result = Config::from_file(std::path::Path::new("/nonexistent/pacs_proxy.toml"));
    assert!(matches!(result, Err(ConfigError::Io { .. })));
}

#[test]
fn test_missing_proxy_section_fails_to_parse() {
    let toml = r#"
        [retrieval]
        storage_path = "./data"
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_zero_port_is_rejected() {
    let toml = r#"
        [proxy]
        id = "gateway-1"

        [dimse.source]
        ae_title = "GATEWAY"
        host = "0.0.0.0"
        port = 0

        [dimse.target]
        ae_title = "ARCHIVE"
        host = "pacs.example.org"
        port = 104
    "#;

    match load_config_from_str(toml) {
        Err(ConfigError::InvalidDimse(e)) => assert!(e.to_string().contains("Port")),
        other => panic!("Expected InvalidDimse, got {:?}", other),
    }
}

#[test]
fn test_zero_sweep_interval_is_rejected() {
    let toml = r#"
        [proxy]
        id = "gateway-1"

        [retrieval]
        sweep_interval_secs = 0
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidRetrieval(_))
    ));
}

#[test]
fn test_negative_cache_minutes_are_allowed() {
    let toml = r#"
        [proxy]
        id = "gateway-1"

        [retrieval]
        keep_cache_minutes = -1
    "#;

    let config = load_config_from_str(toml).expect("never-cache mode is valid");
    assert_eq!(config.retrieval.keep_cache_minutes, -1);
}

#[test]
fn test_oversized_cache_minutes_are_rejected() {
    let toml = r#"
        [proxy]
        id = "gateway-1"

        [retrieval]
        keep_cache_minutes = 1000000000000
    "#;

    match load_config_from_str(toml) {
        Err(ConfigError::InvalidRetrieval(msg)) => assert!(msg.contains("keep_cache_minutes")),
        other => panic!("Expected InvalidRetrieval, got {:?}", other),
    }
}

//! Integration tests for cadence-config: file round-trips and error paths.

use cadence_config::{ConfigError, DriverConfig, ServerConfig};
use cadence_core::ParamValue;
use tempfile::TempDir;

#[test]
fn save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("cadenced.toml");
    let config = ServerConfig {
        name: "studio".to_string(),
        loopback: 2,
        module_dirs: vec![dir.path().join("drivers")],
        driver: DriverConfig::new("cpal")
            .with_param("device", ParamValue::Str("USB Audio".to_string()))
            .with_param("period", ParamValue::Int(256)),
        ..ServerConfig::default()
    };
    config.save(&path).unwrap();
    assert!(path.exists());

    let loaded = ServerConfig::load_validated(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn missing_file_is_read_error() {
    let dir = TempDir::new().unwrap();
    let err = ServerConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::ReadFile { .. }));
}

#[test]
fn malformed_toml_is_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "name = [").unwrap();
    let err = ServerConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::TomlParse(_)));
}

#[test]
fn invalid_values_rejected_on_validated_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cadenced.toml");
    std::fs::write(&path, "timeout_ms = 0\n").unwrap();
    let err = ServerConfig::load_validated(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

//! 配置加载测试

use flare_discovery::{DatacenterMode, Registry, RegistryConfig, RegistryError};
use std::io::Write;
use std::time::Duration;

#[test]
fn test_load_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
address = "consul.service:8500"
token = "acl-token"
health_check = false
health_check_interval = 5
datacenter_mode = "multi"
tags = ["team=core", "env=prod"]
watcher_create_timeout_ms = 1500

[[service_checks]]
check_id = "http-health"
http = "http://127.0.0.1:8080/health"
interval = "15s"
"#
    )
    .expect("write");

    let config = RegistryConfig::load_from_file(file.path()).expect("load");
    assert_eq!(config.token.as_deref(), Some("acl-token"));
    assert!(!config.health_check);
    assert!(config.heartbeat);
    assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
    assert_eq!(config.datacenter_mode, DatacenterMode::Multi);
    assert_eq!(config.tags, vec!["team=core".to_string(), "env=prod".to_string()]);
    assert_eq!(config.watcher_create_timeout(), Some(Duration::from_millis(1500)));
    assert_eq!(config.service_checks.len(), 1);
    assert_eq!(config.service_checks[0].check_id.as_deref(), Some("http-health"));
    // 未配置的字段使用默认值
    assert_eq!(config.wait_time, 55);
    assert_eq!(config.resolve_interval(), Duration::from_secs(1));
}

#[test]
fn test_load_rejects_invalid_files() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "heartbeat = true\nhealth_check_interval = 0").expect("write");
    let err = RegistryConfig::load_from_file(file.path()).expect_err("zero interval");
    assert!(matches!(err, RegistryError::Config(_)));

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "datacenter_mode = \"everywhere\"").expect("write");
    assert!(RegistryConfig::load_from_file(file.path()).is_err());

    let missing = RegistryConfig::load_from_file("/nonexistent/flare/registry.toml");
    assert!(matches!(missing, Err(RegistryError::Config(_))));
}

#[tokio::test]
async fn test_connect_validates_config() {
    let err = Registry::connect(RegistryConfig::default().with_address(""))
        .err()
        .expect("empty address");
    assert!(matches!(err, RegistryError::Config(_)));

    let registry = Registry::connect(RegistryConfig::default()).expect("default config");
    assert_eq!(registry.config().address, "http://127.0.0.1:8500");
    assert!(registry.watched_services().is_empty());
}

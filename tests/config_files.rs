use esxi_mcp_server::{ConfigError, LogFormat, ServerConfig};

use std::io::Write;
use tempfile::NamedTempFile;

fn file_with(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn yaml_file_loads() {
    let file = file_with(
        ".yaml",
        r#"
vcenter_host: vc.lab.local
vcenter_user: administrator@vsphere.local
vcenter_password: secret
insecure: true
datacenter: DC1
datastore: fast-ssd
log_format: json
coordination:
  task_timeout_secs: 600
"#,
    );
    let config = ServerConfig::load_with(Some(file.path()), no_env).unwrap();
    assert_eq!(config.vcenter_host, "vc.lab.local");
    assert!(config.insecure);
    assert_eq!(config.log_format, LogFormat::Json);
    assert_eq!(config.placement().datastore.as_deref(), Some("fast-ssd"));
    assert_eq!(config.coordination.task_timeout_secs, 600);
    assert_eq!(config.coordination.task_poll_interval_ms, 1000);
}

#[test]
fn json_file_with_environment_override() {
    let file = file_with(
        ".json",
        r#"{"vcenter_host": "10.0.0.5", "vcenter_user": "root", "vcenter_password": "pw", "api_key": "from-file"}"#,
    );
    let config = ServerConfig::load_with(Some(file.path()), |var: &str| {
        (var == "MCP_API_KEY").then(|| "from-env".to_string())
    })
    .unwrap();
    assert_eq!(config.api_key.as_deref(), Some("from-env"));
    assert_eq!(config.vsphere().port, 443);
}

#[test]
fn malformed_file_is_a_parse_error() {
    let file = file_with(".json", "{ vcenter_host: ");
    let err = ServerConfig::load_with(Some(file.path()), no_env).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ServerConfig::load_with(Some(&dir.path().join("absent.yml")), no_env).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

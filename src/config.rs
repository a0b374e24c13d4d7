//! Server configuration: a JSON or YAML file, then environment overrides.

use esxi_vsphere::types::{CoordinationConfig, VsphereConfig, VsphereConfigSafe};
use esxi_vsphere::PlacementDefaults;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, message: String },
    Env { var: &'static str, message: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "cannot read {}: {source}", path.display()),
            Self::Parse { path, message } => write!(f, "cannot parse {}: {message}", path.display()),
            Self::Env { var, message } => write!(f, "invalid {var}: {message}"),
            Self::Invalid(message) => write!(f, "invalid configuration: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub vcenter_host: String,
    #[serde(default = "ServerConfig::default_port")]
    pub vcenter_port: u16,
    #[serde(default)]
    pub vcenter_user: String,
    #[serde(default)]
    pub vcenter_password: String,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "ServerConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub datastore: Option<String>,
    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "ServerConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "ServerConfig::default_http_addr")]
    pub http_addr: String,

    #[serde(default)]
    pub coordination: CoordinationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            vcenter_host: String::new(),
            vcenter_port: Self::default_port(),
            vcenter_user: String::new(),
            vcenter_password: String::new(),
            insecure: false,
            request_timeout_secs: Self::default_request_timeout_secs(),
            datacenter: None,
            cluster: None,
            datastore: None,
            network: None,
            api_key: None,
            log_file: None,
            log_level: Self::default_log_level(),
            log_format: LogFormat::default(),
            http_addr: Self::default_http_addr(),
            coordination: CoordinationConfig::default(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.safe(), f)
    }
}

impl ServerConfig {
    pub fn default_port() -> u16 { 443 }
    pub fn default_request_timeout_secs() -> u64 { 30 }
    pub fn default_log_level() -> String { "info".into() }
    pub fn default_http_addr() -> String { "0.0.0.0:8080".into() }

    /// Load `path` (if any), apply process environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |var| std::env::var(var).ok())
    }

    /// As [`ServerConfig::load`] with an injectable environment.
    pub fn load_with(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// `.yaml` / `.yml` files are YAML, anything else JSON.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
            Some("yaml" | "yml")
        );
        let parsed = if is_yaml {
            serde_yaml::from_str(&text).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&text).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse { path: path.to_path_buf(), message })
    }

    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let set = |var: &str| env(var).filter(|v| !v.is_empty());

        if let Some(v) = set("VCENTER_HOST") {
            self.vcenter_host = v;
        }
        if let Some(v) = set("VCENTER_USER") {
            self.vcenter_user = v;
        }
        if let Some(v) = set("VCENTER_PASSWORD") {
            self.vcenter_password = v;
        }
        if let Some(v) = set("VCENTER_PORT") {
            self.vcenter_port = v
                .parse()
                .map_err(|e| ConfigError::Env { var: "VCENTER_PORT", message: format!("{v:?}: {e}") })?;
        }
        if let Some(v) = set("VCENTER_DATACENTER") {
            self.datacenter = Some(v);
        }
        if let Some(v) = set("VCENTER_CLUSTER") {
            self.cluster = Some(v);
        }
        if let Some(v) = set("VCENTER_DATASTORE") {
            self.datastore = Some(v);
        }
        if let Some(v) = set("VCENTER_NETWORK") {
            self.network = Some(v);
        }
        if let Some(v) = set("VCENTER_INSECURE") {
            self.insecure = parse_flag(&v)
                .ok_or_else(|| ConfigError::Env { var: "VCENTER_INSECURE", message: format!("{v:?} is not a boolean") })?;
        }
        if let Some(v) = set("MCP_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = set("MCP_LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = set("MCP_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = set("MCP_HTTP_ADDR") {
            self.http_addr = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, name) in [
            (&self.vcenter_host, "vcenter_host"),
            (&self.vcenter_user, "vcenter_user"),
            (&self.vcenter_password, "vcenter_password"),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{name} is required")));
            }
        }
        self.coordination.validate().map_err(ConfigError::Invalid)
    }

    pub fn vsphere(&self) -> VsphereConfig {
        VsphereConfig {
            host: self.vcenter_host.clone(),
            port: self.vcenter_port,
            username: self.vcenter_user.clone(),
            password: self.vcenter_password.clone(),
            insecure: self.insecure,
            timeout_secs: self.request_timeout_secs,
        }
    }

    pub fn placement(&self) -> PlacementDefaults {
        PlacementDefaults {
            datacenter: self.datacenter.clone(),
            cluster: self.cluster.clone(),
            datastore: self.datastore.clone(),
            network: self.network.clone(),
        }
    }

    pub fn safe(&self) -> ServerConfigSafe {
        ServerConfigSafe {
            vcenter: VsphereConfigSafe::from(&self.vsphere()),
            placement: self.placement(),
            api_key_configured: self.api_key.as_deref().is_some_and(|k| !k.is_empty()),
            log_file: self.log_file.clone(),
            log_level: self.log_level.clone(),
            log_format: self.log_format,
            http_addr: self.http_addr.clone(),
            coordination: self.coordination.clone(),
        }
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration without secrets, for logs.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfigSafe {
    pub vcenter: VsphereConfigSafe,
    pub placement: PlacementDefaults,
    pub api_key_configured: bool,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub http_addr: String,
    pub coordination: CoordinationConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn environment_alone_is_enough() {
        let config = ServerConfig::load_with(
            None,
            env(&[("VCENTER_HOST", "vc.lab"), ("VCENTER_USER", "admin"), ("VCENTER_PASSWORD", "pw")]),
        )
        .unwrap();
        assert_eq!(config.vcenter_port, 443);
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.coordination.task_timeout_secs, 300);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let err = ServerConfig::load_with(None, env(&[("VCENTER_HOST", "vc.lab")])).unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: vcenter_user is required");
    }

    #[test]
    fn bad_port_names_the_variable() {
        let mut config = ServerConfig::default();
        let err = config.apply_env(env(&[("VCENTER_PORT", "https")])).unwrap_err();
        assert!(err.to_string().starts_with("invalid VCENTER_PORT"));
    }

    #[test]
    fn insecure_flag_accepts_common_spellings() {
        let mut config = ServerConfig::default();
        config.apply_env(env(&[("VCENTER_INSECURE", "Yes")])).unwrap();
        assert!(config.insecure);
        assert!(config.apply_env(env(&[("VCENTER_INSECURE", "maybe")])).is_err());
    }

    #[test]
    fn debug_output_has_no_secrets() {
        let config = ServerConfig {
            vcenter_password: "hunter2".into(),
            api_key: Some("k3y".into()),
            ..ServerConfig::default()
        };
        let shown = format!("{config:?}");
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("k3y"));
        assert!(shown.contains("api_key_configured: true"));
    }

    #[test]
    fn zero_poll_interval_fails_validation() {
        let mut config = ServerConfig {
            vcenter_host: "h".into(),
            vcenter_user: "u".into(),
            vcenter_password: "p".into(),
            ..ServerConfig::default()
        };
        config.coordination.task_poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

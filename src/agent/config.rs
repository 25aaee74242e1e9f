use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{Result, SetupError};

pub const CONFIG_FILE_NAME: &str = "agent.yaml";
pub const BACKEND_ADDRESS_PLACEHOLDER: &str = "{{backend_address}}";
pub const RUN_DIR_PLACEHOLDER: &str = "{{run_dir}}";

/// Values substituted into config text before it is written out.
#[derive(Debug, Clone)]
pub struct ConfigVars {
    pub backend_address: SocketAddr,
    pub run_dir: PathBuf,
}

impl ConfigVars {
    /// Replaces the known placeholders; everything else is left untouched.
    pub fn render(&self, text: &str) -> String {
        text.replace(BACKEND_ADDRESS_PLACEHOLDER, &self.backend_address.to_string())
            .replace(RUN_DIR_PLACEHOLDER, &self.run_dir.to_string_lossy())
    }
}

/// Writes rendered config text to `<run_dir>/agent.yaml` and returns the path.
pub async fn materialize(text: &str, vars: &ConfigVars) -> Result<PathBuf> {
    let path = vars.run_dir.join(CONFIG_FILE_NAME);
    tokio::fs::write(&path, vars.render(text))
        .await
        .map_err(|source| SetupError::ConfigWrite {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

/// Structured agent config, for tests that want to build or edit one rather
/// than hand it over as text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// `host:port` the agent pushes framed datapoints to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub monitors: Vec<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AgentConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml).map_err(|e| SetupError::ConfigParse(e.to_string()))?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self).map_err(|e| SetupError::ConfigParse(e.to_string()))?)
    }

    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::new()
    }

    /// Monitor `type` strings in declaration order. Entries without a string
    /// `type` are skipped.
    pub fn monitor_types(&self) -> Vec<&str> {
        self.monitors
            .iter()
            .filter_map(|m| m.get("type").and_then(Value::as_str))
            .collect()
    }

    /// Points the agent at `addr` unless the config already names an ingest
    /// address.
    #[must_use]
    pub fn with_backend_address(mut self, addr: SocketAddr) -> Self {
        if self.ingest_address.is_none() {
            self.ingest_address = Some(addr.to_string());
        }
        self
    }

    #[must_use]
    pub fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.interval_seconds = Some(seconds);
        self
    }
}

#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    monitors: Vec<Value>,
    interval_seconds: Option<u64>,
    extra: BTreeMap<String, Value>,
}

impl AgentConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn monitor(self, monitor_type: &str) -> Self {
        self.monitor_with(monitor_type, Mapping::new())
    }

    pub fn monitor_with(mut self, monitor_type: &str, options: Mapping) -> Self {
        let mut monitor = Mapping::new();
        monitor.insert(
            Value::String("type".to_string()),
            Value::String(monitor_type.to_string()),
        );
        for (key, value) in options {
            monitor.insert(key, value);
        }
        self.monitors.push(Value::Mapping(monitor));
        self
    }

    pub fn interval_seconds(mut self, seconds: u64) -> Self {
        self.interval_seconds = Some(seconds);
        self
    }

    pub fn option(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> AgentConfig {
        AgentConfig {
            ingest_address: None,
            interval_seconds: self.interval_seconds,
            monitors: self.monitors,
            extra: self.extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(dir: &Path) -> ConfigVars {
        ConfigVars {
            backend_address: "127.0.0.1:4080".parse().unwrap(),
            run_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn materialize_substitutes_placeholders_only() {
        let dir = tempfile::tempdir().unwrap();
        let text = "ingestAddress: {{backend_address}}\nmonitors:\n  - type: collectd/disk\n    persistencePath: {{run_dir}}/state\n";

        let path = materialize(text, &vars(dir.path())).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();

        assert_eq!(path, dir.path().join(CONFIG_FILE_NAME));
        assert!(written.starts_with("ingestAddress: 127.0.0.1:4080\n"));
        assert!(written.contains(&format!("persistencePath: {}/state", dir.path().display())));
        assert!(written.contains("  - type: collectd/disk\n"));
    }

    #[tokio::test]
    async fn text_without_placeholders_is_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let text = "\n    monitors:\n      - type: collectd/cpu\n    ";

        let path = materialize(text, &vars(dir.path())).await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), text);
    }

    #[tokio::test]
    async fn unwritable_run_dir_is_a_setup_error() {
        let missing = vars(Path::new("/nonexistent/agent-tester"));
        let err = materialize("monitors: []", &missing).await.unwrap_err();
        assert!(err.is_setup());
    }

    #[test]
    fn parses_monitor_types_and_keeps_unknown_keys() {
        let config = AgentConfig::from_yaml_str(
            "hostname: test-host\nmonitors:\n  - type: collectd/signalfx-metadata\n    procFSPath: /proc\n  - type: collectd/cpu\n",
        )
        .unwrap();

        assert_eq!(
            config.monitor_types(),
            ["collectd/signalfx-metadata", "collectd/cpu"]
        );
        assert_eq!(config.extra["hostname"], Value::String("test-host".into()));
    }

    #[test]
    fn backend_address_does_not_override_explicit_one() {
        let backend: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let explicit = AgentConfig::from_yaml_str("ingestAddress: elsewhere:1\nmonitors: []")
            .unwrap()
            .with_backend_address(backend);
        assert_eq!(explicit.ingest_address.as_deref(), Some("elsewhere:1"));

        let injected = AgentConfig::builder()
            .monitor("collectd/disk")
            .build()
            .with_backend_address(backend);
        assert_eq!(injected.ingest_address.as_deref(), Some("127.0.0.1:9"));
        assert!(injected.to_yaml().unwrap().contains("ingestAddress: 127.0.0.1:9"));
        assert!(!injected.to_yaml().unwrap().contains("http://"));
    }

    #[test]
    fn builder_round_trips_through_yaml() {
        let mut options = Mapping::new();
        options.insert("etcPath".into(), "/etc".into());
        let config = AgentConfig::builder()
            .monitor_with("collectd/signalfx-metadata", options)
            .interval_seconds(3)
            .build();

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("intervalSeconds: 3"));

        let parsed = AgentConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.monitor_types(), ["collectd/signalfx-metadata"]);
        assert_eq!(
            parsed.monitors[0].get("etcPath").and_then(Value::as_str),
            Some("/etc")
        );
    }

    #[test]
    fn non_mapping_config_is_rejected() {
        assert!(AgentConfig::from_yaml_str("- just\n- a list\n").unwrap_err().is_setup());
    }
}

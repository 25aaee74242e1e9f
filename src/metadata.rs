//! Expected metric and dimension names, read from the agent's self-describe
//! document.
//!
//! The document lists every monitor type with the metrics and dimensions it
//! is documented to emit:
//!
//! ```json
//! {"Monitors": [{"monitorType": "collectd/disk",
//!                "metrics": {"disk_ops.read": {"type": "cumulative", "default": true}},
//!                "dimensions": {"disk": {"description": "..."}}}]}
//! ```
//!
//! Older documents use lists of `{"name": ...}` objects instead of maps;
//! both forms are accepted.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, SetupError};
use crate::settings::HarnessSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct SelfDescribe {
    #[serde(rename = "Monitors", default)]
    monitors: Vec<MonitorDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct MonitorDoc {
    #[serde(rename = "monitorType")]
    monitor_type: String,
    // Monitors without metrics or dimensions carry `null` here.
    #[serde(default)]
    metrics: Option<Entries>,
    #[serde(default)]
    dimensions: Option<Entries>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EntryDoc {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    default: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Entries {
    Keyed(BTreeMap<String, Option<EntryDoc>>),
    Listed(Vec<EntryDoc>),
}

impl Entries {
    fn names(entries: Option<&Self>, only_default: bool) -> HashSet<String> {
        match entries {
            None => HashSet::new(),
            Some(Entries::Keyed(map)) => map
                .iter()
                .filter(|(_, doc)| !only_default || doc.as_ref().is_some_and(|d| d.default))
                .map(|(name, _)| name.clone())
                .collect(),
            Some(Entries::Listed(list)) => list
                .iter()
                .filter(|doc| !only_default || doc.default)
                .filter_map(|doc| doc.name.clone())
                .collect(),
        }
    }
}

impl SelfDescribe {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| read_error(path, e))?;
        serde_json::from_str(&content).map_err(|e| read_error(path, e).into())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| read_error(Path::new("<inline>"), e).into())
    }

    pub fn monitor_types(&self) -> impl Iterator<Item = &str> {
        self.monitors.iter().map(|m| m.monitor_type.as_str())
    }

    fn monitor(&self, monitor_type: &str) -> Result<&MonitorDoc> {
        self.monitors
            .iter()
            .find(|m| m.monitor_type == monitor_type)
            .ok_or_else(|| SetupError::MonitorMetadataNotFound(monitor_type.to_string()).into())
    }

    pub fn expected_metrics(&self, monitor_type: &str) -> Result<HashSet<String>> {
        Ok(Entries::names(self.monitor(monitor_type)?.metrics.as_ref(), false))
    }

    pub fn expected_dims(&self, monitor_type: &str) -> Result<HashSet<String>> {
        Ok(Entries::names(self.monitor(monitor_type)?.dimensions.as_ref(), false))
    }

    /// Metrics the monitor sends without any extra configuration.
    pub fn default_metrics(&self, monitor_type: &str) -> Result<HashSet<String>> {
        Ok(Entries::names(self.monitor(monitor_type)?.metrics.as_ref(), true))
    }
}

fn read_error(path: &Path, err: impl std::fmt::Display) -> SetupError {
    SetupError::MetadataRead {
        path: PathBuf::from(path),
        message: err.to_string(),
    }
}

/// Expected metric names for `monitor_type`, from the self-describe file named
/// by the environment.
pub fn get_monitor_metrics_from_selfdescribe(monitor_type: &str) -> Result<HashSet<String>> {
    get_monitor_metrics_from_selfdescribe_at(HarnessSettings::from_env().selfdescribe_path(), monitor_type)
}

/// Expected dimension names for `monitor_type`, from the self-describe file
/// named by the environment.
pub fn get_monitor_dims_from_selfdescribe(monitor_type: &str) -> Result<HashSet<String>> {
    get_monitor_dims_from_selfdescribe_at(HarnessSettings::from_env().selfdescribe_path(), monitor_type)
}

pub fn get_monitor_metrics_from_selfdescribe_at(
    path: impl AsRef<Path>,
    monitor_type: &str,
) -> Result<HashSet<String>> {
    SelfDescribe::load(path)?.expected_metrics(monitor_type)
}

pub fn get_monitor_dims_from_selfdescribe_at(
    path: impl AsRef<Path>,
    monitor_type: &str,
) -> Result<HashSet<String>> {
    SelfDescribe::load(path)?.expected_dims(monitor_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const DOC: &str = r#"{
        "Monitors": [
            {
                "monitorType": "collectd/disk",
                "metrics": {
                    "disk_ops.read": {"type": "cumulative", "default": true},
                    "disk_time.write": {"type": "cumulative", "default": false},
                    "pending_operations": null
                },
                "dimensions": {"disk": {"description": "device name"}, "plugin": null}
            },
            {
                "monitorType": "collectd/cpu",
                "metrics": [{"name": "cpu.utilization", "default": true}, {"name": "cpu.idle"}],
                "dimensions": [{"name": "cpu"}]
            },
            {"monitorType": "collectd/signalfx-metadata"},
            {"monitorType": "internal-metrics", "metrics": null, "dimensions": null}
        ]
    }"#;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn keyed_metrics_and_dims() {
        let doc = SelfDescribe::from_json_str(DOC).unwrap();
        assert_eq!(
            doc.expected_metrics("collectd/disk").unwrap(),
            set(&["disk_ops.read", "disk_time.write", "pending_operations"])
        );
        assert_eq!(doc.expected_dims("collectd/disk").unwrap(), set(&["disk", "plugin"]));
        assert_eq!(doc.default_metrics("collectd/disk").unwrap(), set(&["disk_ops.read"]));
    }

    #[test]
    fn listed_metrics_and_dims() {
        let doc = SelfDescribe::from_json_str(DOC).unwrap();
        assert_eq!(
            doc.expected_metrics("collectd/cpu").unwrap(),
            set(&["cpu.utilization", "cpu.idle"])
        );
        assert_eq!(doc.expected_dims("collectd/cpu").unwrap(), set(&["cpu"]));
        assert_eq!(doc.default_metrics("collectd/cpu").unwrap(), set(&["cpu.utilization"]));
    }

    #[test]
    fn monitor_without_entries_has_empty_sets() {
        let doc = SelfDescribe::from_json_str(DOC).unwrap();
        assert!(doc.expected_metrics("collectd/signalfx-metadata").unwrap().is_empty());
        assert_eq!(doc.monitor_types().count(), 4);
    }

    #[test]
    fn null_entries_read_as_empty_sets() {
        let doc = SelfDescribe::from_json_str(DOC).unwrap();
        assert!(doc.expected_metrics("internal-metrics").unwrap().is_empty());
        assert!(doc.expected_dims("internal-metrics").unwrap().is_empty());
        assert!(doc.default_metrics("internal-metrics").unwrap().is_empty());

        let mixed = SelfDescribe::from_json_str(
            r#"{"Monitors":[{"monitorType":"collectd/disk","metrics":{"disk_ops.read":{"default":true}},"dimensions":null}]}"#,
        )
        .unwrap();
        assert_eq!(mixed.expected_metrics("collectd/disk").unwrap(), set(&["disk_ops.read"]));
        assert!(mixed.expected_dims("collectd/disk").unwrap().is_empty());
    }

    #[test]
    fn unknown_monitor_is_a_setup_error() {
        let doc = SelfDescribe::from_json_str(DOC).unwrap();
        let err = doc.expected_metrics("collectd/nope").unwrap_err();
        assert!(matches!(
            err,
            Error::Setup(SetupError::MonitorMetadataNotFound(ref t)) if t == "collectd/nope"
        ));
    }

    #[test]
    fn unreadable_file_is_a_setup_error() {
        let err = SelfDescribe::load("/nonexistent/selfdescribe.json").unwrap_err();
        assert!(err.is_setup());
    }

    #[test]
    fn path_helpers_read_one_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selfdescribe.json");
        std::fs::write(&path, DOC).unwrap();

        assert_eq!(
            get_monitor_dims_from_selfdescribe_at(&path, "collectd/cpu").unwrap(),
            set(&["cpu"])
        );
        assert!(
            get_monitor_metrics_from_selfdescribe_at(&path, "internal-metrics")
                .unwrap()
                .is_empty()
        );
        assert!(
            get_monitor_metrics_from_selfdescribe_at(&path, "collectd/nope")
                .unwrap_err()
                .is_setup()
        );
    }
}

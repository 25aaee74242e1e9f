use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::container::{AgentImage, ContainerAgent};
use crate::agent::local::{DEFAULT_ADDRESS_VAR, DEFAULT_CONFIG_FLAG, LocalAgent};
use crate::agent::AgentLauncher;

pub const AGENT_BIN_VAR: &str = "AGENT_BIN";
pub const AGENT_IMAGE_VAR: &str = "AGENT_IMAGE";
pub const SELFDESCRIBE_VAR: &str = "AGENT_SELFDESCRIBE_JSON";
pub const GRACE_SECS_VAR: &str = "AGENT_GRACE_SECS";
pub const CONFIG_FLAG_VAR: &str = "AGENT_CONFIG_FLAG";
pub const ADDRESS_VAR_VAR: &str = "AGENT_ADDRESS_VAR";

const DEFAULT_AGENT_BIN: &str = "signalfx-agent";
const DEFAULT_SELFDESCRIBE: &str = "selfdescribe.json";
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Where the agent and its metadata live, and how long it gets to shut down.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    agent_bin: PathBuf,
    agent_image: Option<String>,
    selfdescribe_path: PathBuf,
    grace_period: Duration,
    config_flag: String,
    address_var: String,
    agent_env: Vec<(String, String)>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            agent_bin: PathBuf::from(DEFAULT_AGENT_BIN),
            agent_image: None,
            selfdescribe_path: PathBuf::from(DEFAULT_SELFDESCRIBE),
            grace_period: DEFAULT_GRACE_PERIOD,
            config_flag: DEFAULT_CONFIG_FLAG.to_string(),
            address_var: DEFAULT_ADDRESS_VAR.to_string(),
            agent_env: Vec::new(),
        }
    }
}

impl HarnessSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; unset or empty keys keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Self::default();

        if let Some(bin) = get(AGENT_BIN_VAR) {
            settings.agent_bin = PathBuf::from(bin);
        }
        settings.agent_image = get(AGENT_IMAGE_VAR);
        if let Some(path) = get(SELFDESCRIBE_VAR) {
            settings.selfdescribe_path = PathBuf::from(path);
        }
        if let Some(secs) = get(GRACE_SECS_VAR).and_then(|s| s.trim().parse::<f64>().ok())
            && secs.is_finite()
            && secs >= 0.0
        {
            settings.grace_period = Duration::from_secs_f64(secs);
        }
        if let Some(flag) = get(CONFIG_FLAG_VAR) {
            settings.config_flag = flag;
        }
        if let Some(var) = get(ADDRESS_VAR_VAR) {
            settings.address_var = var;
        }

        settings
    }

    #[must_use]
    pub fn agent_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_bin = path.into();
        self
    }

    #[must_use]
    pub fn agent_image(mut self, reference: impl Into<String>) -> Self {
        self.agent_image = Some(reference.into());
        self
    }

    #[must_use]
    pub fn selfdescribe(mut self, path: impl Into<PathBuf>) -> Self {
        self.selfdescribe_path = path.into();
        self
    }

    #[must_use]
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Extra environment for the agent, in local and container mode alike.
    #[must_use]
    pub fn agent_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.agent_env.push((key.into(), value.into()));
        self
    }

    pub fn selfdescribe_path(&self) -> &Path {
        &self.selfdescribe_path
    }

    pub fn grace(&self) -> Duration {
        self.grace_period
    }

    /// A container launcher when an image is configured, otherwise a local
    /// one.
    pub fn launcher(&self) -> AgentLauncher {
        match &self.agent_image {
            Some(reference) => self
                .agent_env
                .iter()
                .fold(
                    ContainerAgent::new(AgentImage::parse(reference)).address_var(&self.address_var),
                    |agent, (key, value)| agent.env_var(key, value),
                )
                .into(),
            None => self
                .agent_env
                .iter()
                .fold(
                    LocalAgent::new(&self.agent_bin)
                        .config_flag(&self.config_flag)
                        .address_var(&self.address_var),
                    |agent, (key, value)| agent.env_var(key, value),
                )
                .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_a_local_agent() {
        let settings = HarnessSettings::from_lookup(lookup(&[]));
        assert_eq!(settings.grace(), DEFAULT_GRACE_PERIOD);
        assert_eq!(settings.selfdescribe_path(), Path::new(DEFAULT_SELFDESCRIBE));
        match settings.launcher() {
            AgentLauncher::Local(agent) => assert_eq!(agent.binary(), Path::new(DEFAULT_AGENT_BIN)),
            other => panic!("expected a local launcher, got {other:?}"),
        }
    }

    #[test]
    fn image_selects_container_mode() {
        let settings = HarnessSettings::from_lookup(lookup(&[
            (AGENT_IMAGE_VAR, "quay.io/signalfx/signalfx-agent:5.1.0"),
            (GRACE_SECS_VAR, "2.5"),
        ]));
        assert!(settings.launcher().is_container());
        assert_eq!(settings.grace(), Duration::from_millis(2500));
    }

    #[test]
    fn agent_env_reaches_the_launcher() {
        let settings = HarnessSettings::default().agent_env(SELFDESCRIBE_VAR, "/tmp/sd.json");
        match settings.launcher() {
            AgentLauncher::Local(agent) => assert!(format!("{agent:?}").contains("/tmp/sd.json")),
            other => panic!("expected a local launcher, got {other:?}"),
        }
    }

    #[test]
    fn blank_and_invalid_values_keep_defaults() {
        let settings = HarnessSettings::from_lookup(lookup(&[
            (AGENT_BIN_VAR, "  "),
            (GRACE_SECS_VAR, "soon"),
        ]));
        assert_eq!(settings.grace(), DEFAULT_GRACE_PERIOD);
        assert!(!settings.launcher().is_container());
    }
}

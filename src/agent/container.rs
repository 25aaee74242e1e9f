use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::{InspectContainerOptions, StopContainerOptionsBuilder};
use testcontainers::core::WaitFor;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, Image, ImageExt};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::local::DEFAULT_ADDRESS_VAR;
use super::output::{OutputLog, spawn_drain};
use super::{AgentExit, AgentProcess};
use crate::error::{Error, Result, SetupError};

pub const DEFAULT_AGENT_IMAGE: &str = "quay.io/signalfx/signalfx-agent";
pub const CONTAINER_CONFIG_PATH: &str = "/etc/signalfx/agent.yaml";
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const SIGKILL_EXIT_CODE: i64 = 137;

#[derive(Debug, Clone)]
pub struct AgentImage {
    name: String,
    tag: String,
    ready_message: Option<String>,
}

impl AgentImage {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            ready_message: None,
        }
    }

    /// Parses `name[:tag]`, defaulting the tag to `latest`.
    pub fn parse(reference: &str) -> Self {
        match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => Self::new(name, tag),
            _ => Self::new(reference, "latest"),
        }
    }

    /// Startup is considered done once this text appears on stderr.
    #[must_use]
    pub fn ready_message(mut self, message: impl Into<String>) -> Self {
        self.ready_message = Some(message.into());
        self
    }
}

impl Default for AgentImage {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_IMAGE, "latest")
    }
}

impl Image for AgentImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        match &self.ready_message {
            Some(message) => vec![WaitFor::message_on_stderr(message.as_str())],
            None => vec![WaitFor::Nothing],
        }
    }
}

/// Runs the agent image on the host network with the config copied in.
#[derive(Debug, Clone)]
pub struct ContainerAgent {
    image: AgentImage,
    config_path: String,
    address_var: String,
    env_vars: Vec<(String, String)>,
    startup_timeout: Duration,
}

impl ContainerAgent {
    pub fn new(image: AgentImage) -> Self {
        Self {
            image,
            config_path: CONTAINER_CONFIG_PATH.to_string(),
            address_var: DEFAULT_ADDRESS_VAR.to_string(),
            env_vars: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Where the config lands inside the container.
    #[must_use]
    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = path.into();
        self
    }

    #[must_use]
    pub fn address_var(mut self, name: impl Into<String>) -> Self {
        self.address_var = name.into();
        self
    }

    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub async fn start(
        &self,
        config_path: &Path,
        backend_addr: SocketAddr,
    ) -> Result<ContainerAgentProcess> {
        let config = tokio::fs::read(config_path).await.map_err(|e| {
            SetupError::AgentStart(format!("cannot read config {}: {e}", config_path.display()))
        })?;

        let mut request = self
            .image
            .clone()
            .with_copy_to(self.config_path.clone(), config)
            .with_env_var(&self.address_var, backend_addr.to_string())
            .with_startup_timeout(self.startup_timeout)
            .with_network("host");

        for (key, value) in &self.env_vars {
            request = request.with_env_var(key, value);
        }

        let container = request
            .start()
            .await
            .map_err(|e| SetupError::AgentStart(format!("{}: {e}", self.image.name)))?;
        let container_id = container.id().to_string();
        let docker = Docker::connect_with_local_defaults()?;

        let output = OutputLog::new();
        let drains = vec![
            spawn_drain(container.stdout(true), output.clone(), "stdout"),
            spawn_drain(container.stderr(true), output.clone(), "stderr"),
        ];

        info!(container = %container_id, image = %self.image.name, "agent container started");

        Ok(ContainerAgentProcess {
            container: Some(container),
            container_id,
            docker,
            output,
            drains,
            exit: None,
        })
    }
}

pub struct ContainerAgentProcess {
    container: Option<ContainerAsync<AgentImage>>,
    container_id: String,
    docker: Docker,
    output: OutputLog,
    drains: Vec<JoinHandle<()>>,
    exit: Option<AgentExit>,
}

impl ContainerAgentProcess {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn exit_code(&self) -> Option<i64> {
        match self
            .docker
            .inspect_container(&self.container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect.state.and_then(|state| state.exit_code),
            Err(err) => {
                warn!(container = %self.container_id, error = %err, "failed to inspect agent container");
                None
            }
        }
    }
}

#[async_trait]
impl AgentProcess for ContainerAgentProcess {
    fn id(&self) -> String {
        format!("container {}", self.container_id)
    }

    fn output(&self) -> &OutputLog {
        &self.output
    }

    async fn stop(&mut self, grace: Duration) -> Result<AgentExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        // Docker sends SIGTERM, then SIGKILL once `t` seconds have passed.
        let options = StopContainerOptionsBuilder::default()
            .t(stop_timeout_secs(grace))
            .build();
        if let Err(err) = self.docker.stop_container(&self.container_id, Some(options)).await {
            warn!(container = %self.container_id, error = %err, "failed to stop agent container");
        }

        let code = self.exit_code().await;
        for drain in self.drains.drain(..) {
            drain.abort();
        }

        if let Some(container) = self.container.take() {
            container
                .rm()
                .await
                .map_err(|e| Error::Teardown(format!("failed to remove {}: {e}", self.container_id)))?;
        }

        let exit = AgentExit {
            code: code.map(|c| c as i32),
            signal: None,
            forced: code == Some(SIGKILL_EXIT_CODE),
        };
        info!(container = %self.container_id, code = ?exit.code, forced = exit.forced, "agent container stopped");
        self.exit = Some(exit);
        Ok(exit)
    }
}

/// Docker takes whole seconds; at least one so SIGTERM gets a chance.
fn stop_timeout_secs(grace: Duration) -> i32 {
    i32::try_from(grace.as_secs().max(1)).unwrap_or(i32::MAX)
}

impl Drop for ContainerAgentProcess {
    fn drop(&mut self) {
        for drain in &self.drains {
            drain.abort();
        }
    }
}

pub mod config;
pub mod container;
pub mod local;
pub mod output;

use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use config::{AgentConfig, AgentConfigBuilder, ConfigVars};
pub use container::{AgentImage, ContainerAgent, ContainerAgentProcess};
pub use local::{LocalAgent, LocalAgentProcess};
pub use output::OutputLog;

/// How the agent ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The agent outlived the grace period and had to be killed.
    pub forced: bool,
}

impl AgentExit {
    pub(crate) fn from_status(status: ExitStatus, forced: bool) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            forced,
        }
    }
}

/// A running agent, however it was launched.
#[async_trait]
pub trait AgentProcess: Send {
    fn id(&self) -> String;

    /// Output accumulated so far. Never blocks.
    fn output(&self) -> &OutputLog;

    /// Asks the agent to exit, kills it after `grace`, and reaps it. Calling
    /// it again returns the first result.
    async fn stop(&mut self, grace: Duration) -> Result<AgentExit>;
}

#[derive(Debug, Clone)]
pub enum AgentLauncher {
    Local(LocalAgent),
    Container(ContainerAgent),
}

impl AgentLauncher {
    pub async fn start(
        &self,
        config_path: &Path,
        backend_addr: SocketAddr,
    ) -> Result<Box<dyn AgentProcess>> {
        let process: Box<dyn AgentProcess> = match self {
            AgentLauncher::Local(agent) => Box::new(agent.start(config_path, backend_addr).await?),
            AgentLauncher::Container(agent) => {
                Box::new(agent.start(config_path, backend_addr).await?)
            }
        };
        Ok(process)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, AgentLauncher::Container(_))
    }
}

impl From<LocalAgent> for AgentLauncher {
    fn from(agent: LocalAgent) -> Self {
        AgentLauncher::Local(agent)
    }
}

impl From<ContainerAgent> for AgentLauncher {
    fn from(agent: ContainerAgent) -> Self {
        AgentLauncher::Container(agent)
    }
}

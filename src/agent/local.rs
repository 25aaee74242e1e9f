use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::output::{OutputLog, spawn_drain};
use super::{AgentExit, AgentProcess};
use crate::error::{Error, Result, SetupError};

pub const DEFAULT_CONFIG_FLAG: &str = "-config";
pub const DEFAULT_ADDRESS_VAR: &str = "AGENT_INGEST_ADDRESS";
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs the agent as a child of the test process.
#[derive(Debug, Clone)]
pub struct LocalAgent {
    binary: PathBuf,
    config_flag: String,
    address_var: String,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
}

impl LocalAgent {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_flag: DEFAULT_CONFIG_FLAG.to_string(),
            address_var: DEFAULT_ADDRESS_VAR.to_string(),
            args: Vec::new(),
            env_vars: Vec::new(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    #[must_use]
    pub fn config_flag(mut self, flag: impl Into<String>) -> Self {
        self.config_flag = flag.into();
        self
    }

    /// Environment variable through which the backend address is passed.
    #[must_use]
    pub fn address_var(mut self, name: impl Into<String>) -> Self {
        self.address_var = name.into();
        self
    }

    /// Extra argument, placed before the config flag.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub async fn start(
        &self,
        config_path: &Path,
        backend_addr: SocketAddr,
    ) -> Result<LocalAgentProcess> {
        if !config_path.is_file() {
            return Err(SetupError::AgentStart(format!(
                "config file {} does not exist",
                config_path.display()
            ))
            .into());
        }

        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .arg(&self.config_flag)
            .arg(config_path)
            .env(&self.address_var, backend_addr.to_string())
            .envs(self.env_vars.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = config_path.parent() {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| match err.kind() {
            ErrorKind::NotFound => SetupError::BinaryNotFound(self.binary.clone()),
            _ => SetupError::AgentStart(format!("{}: {err}", self.binary.display())),
        })?;

        let pid = child
            .id()
            .ok_or_else(|| SetupError::AgentStart("agent exited before it could be tracked".into()))?;

        let output = OutputLog::new();
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, output.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, output.clone(), "stderr"));
        }

        info!(pid, binary = %self.binary.display(), "agent started");

        Ok(LocalAgentProcess {
            child,
            pid,
            output,
            drains,
            exit: None,
        })
    }
}

pub struct LocalAgentProcess {
    child: Child,
    pid: u32,
    output: OutputLog,
    drains: Vec<JoinHandle<()>>,
    exit: Option<AgentExit>,
}

impl LocalAgentProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(&self) {
        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pid = self.pid, error = %err, "failed to send SIGTERM"),
        }
    }

    async fn finish_drains(&mut self) {
        for mut drain in self.drains.drain(..) {
            // A grandchild can keep the pipe open after the agent is gone.
            if tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_err() {
                drain.abort();
            }
        }
    }
}

#[async_trait]
impl AgentProcess for LocalAgentProcess {
    fn id(&self) -> String {
        format!("pid {}", self.pid)
    }

    fn output(&self) -> &OutputLog {
        &self.output
    }

    async fn stop(&mut self, grace: Duration) -> Result<AgentExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        let exit = if let Some(status) = self.child.try_wait()? {
            debug!(pid = self.pid, %status, "agent had already exited");
            AgentExit::from_status(status, false)
        } else {
            self.terminate();
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => AgentExit::from_status(status?, false),
                Err(_) => {
                    warn!(pid = self.pid, ?grace, "agent ignored SIGTERM, killing");
                    self.child
                        .kill()
                        .await
                        .map_err(|e| Error::Teardown(format!("failed to kill pid {}: {e}", self.pid)))?;
                    AgentExit::from_status(self.child.wait().await?, true)
                }
            }
        };

        self.finish_drains().await;
        info!(pid = self.pid, code = ?exit.code, signal = ?exit.signal, forced = exit.forced, "agent stopped");
        self.exit = Some(exit);
        Ok(exit)
    }
}

impl Drop for LocalAgentProcess {
    fn drop(&mut self) {
        for drain in &self.drains {
            drain.abort();
        }
    }
}

//! A fake backend and an agent wired to it, torn down together.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::config::{self, AgentConfig, ConfigVars};
use crate::agent::{AgentExit, AgentLauncher, AgentProcess, OutputLog};
use crate::backend::{DataPoint, FakeBackend};
use crate::error::{Error, Result, SetupError};
use crate::settings::HarnessSettings;

const DIAGNOSTIC_METRIC_NAMES: usize = 20;

#[derive(Debug, Clone)]
enum ConfigSource {
    Text(String),
    Structured(AgentConfig),
}

pub struct SessionBuilder {
    source: ConfigSource,
    settings: HarnessSettings,
    launcher: Option<AgentLauncher>,
    grace_period: Option<Duration>,
    backend_host: IpAddr,
    backend_port: u16,
    temp_root: Option<PathBuf>,
}

impl SessionBuilder {
    /// A session for config text, written out as-is apart from placeholder
    /// substitution.
    pub fn new(config: impl Into<String>) -> Self {
        Self::with_source(ConfigSource::Text(config.into()))
    }

    /// A session for a structured config; `ingestAddress` is pointed at the
    /// fake backend unless already set.
    pub fn structured(config: AgentConfig) -> Self {
        Self::with_source(ConfigSource::Structured(config))
    }

    fn with_source(source: ConfigSource) -> Self {
        Self {
            source,
            settings: HarnessSettings::from_env(),
            launcher: None,
            grace_period: None,
            backend_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            backend_port: 0,
            temp_root: None,
        }
    }

    #[must_use]
    pub fn settings(mut self, settings: HarnessSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Overrides the launcher the settings would pick.
    #[must_use]
    pub fn launcher(mut self, launcher: impl Into<AgentLauncher>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    #[must_use]
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    #[must_use]
    pub fn backend_host(mut self, host: IpAddr) -> Self {
        self.backend_host = host;
        self
    }

    /// Fixed backend port; the default of 0 picks an ephemeral one.
    #[must_use]
    pub fn backend_port(mut self, port: u16) -> Self {
        self.backend_port = port;
        self
    }

    /// Directory the run directory is created in, instead of the system
    /// temp dir.
    #[must_use]
    pub fn temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    pub async fn start(self) -> Result<AgentSession> {
        let id = format!("agent-session-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let prefix = format!("{id}-");
        let mut dir_builder = tempfile::Builder::new();
        dir_builder.prefix(&prefix);
        let run_dir = match &self.temp_root {
            Some(root) => dir_builder.tempdir_in(root),
            None => dir_builder.tempdir(),
        }
        .map_err(SetupError::TempDir)?;

        let backend = FakeBackend::builder()
            .host(self.backend_host)
            .port(self.backend_port)
            .start()
            .await?;

        let launcher = self
            .launcher
            .clone()
            .unwrap_or_else(|| self.settings.launcher());
        let grace = self.grace_period.unwrap_or_else(|| self.settings.grace());

        let started = async {
            let text = match &self.source {
                ConfigSource::Text(text) => text.clone(),
                ConfigSource::Structured(structured) => structured
                    .clone()
                    .with_backend_address(backend.addr())
                    .to_yaml()?,
            };
            let vars = ConfigVars {
                backend_address: backend.addr(),
                run_dir: run_dir.path().to_path_buf(),
            };
            let config_path = config::materialize(&text, &vars).await?;
            let process = launcher.start(&config_path, backend.addr()).await?;
            Ok::<_, Error>((config_path, process))
        }
        .await;

        let (config_path, process) = match started {
            Ok(started) => started,
            Err(err) => {
                warn!(session = %id, error = %err, "agent session setup failed");
                if let Err(stop_err) = backend.stop().await {
                    warn!(session = %id, error = %stop_err, "failed to stop backend after setup failure");
                }
                return Err(err);
            }
        };

        let process_id = process.id();
        info!(session = %id, backend = %backend.addr(), agent = %process_id, "agent session started");

        Ok(AgentSession {
            id,
            output: process.output().clone(),
            backend,
            process: Mutex::new(process),
            process_id,
            run_dir_path: run_dir.path().to_path_buf(),
            run_dir: Some(run_dir),
            config_path,
            grace,
            torn_down: false,
        })
    }

    /// Starts a session, runs `body` against it, and tears the session down
    /// whether `body` returns or panics. A panic in `body` is resumed after
    /// teardown.
    pub async fn run<F, T>(self, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a AgentSession) -> BoxFuture<'a, T>,
    {
        let mut session = self.start().await?;
        let outcome = AssertUnwindSafe(body(&session)).catch_unwind().await;

        if let Err(err) = session.teardown().await {
            warn!(session = %session.id, error = %err, "session teardown failed");
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Starts the agent on `config` using settings from the environment. Call
/// [`AgentSession::shutdown`] when done.
pub async fn run_agent(config: impl Into<String>) -> Result<AgentSession> {
    run_agent_with(HarnessSettings::from_env(), config).await
}

pub async fn run_agent_with(
    settings: HarnessSettings,
    config: impl Into<String>,
) -> Result<AgentSession> {
    SessionBuilder::new(config).settings(settings).start().await
}

/// Scoped form of [`run_agent`].
pub async fn with_agent<F, T>(config: impl Into<String>, body: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a AgentSession) -> BoxFuture<'a, T>,
{
    with_agent_using(HarnessSettings::from_env(), config, body).await
}

/// Scoped form of [`run_agent_with`].
pub async fn with_agent_using<F, T>(
    settings: HarnessSettings,
    config: impl Into<String>,
    body: F,
) -> Result<T>
where
    F: for<'a> FnOnce(&'a AgentSession) -> BoxFuture<'a, T>,
{
    SessionBuilder::new(config).settings(settings).run(body).await
}

pub struct AgentSession {
    id: String,
    backend: FakeBackend,
    output: OutputLog,
    process: Mutex<Box<dyn AgentProcess>>,
    process_id: String,
    run_dir: Option<TempDir>,
    run_dir_path: PathBuf,
    config_path: PathBuf,
    grace: Duration,
    torn_down: bool,
}

impl AgentSession {
    pub fn builder(config: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &FakeBackend {
        &self.backend
    }

    pub fn output(&self) -> &OutputLog {
        &self.output
    }

    /// Everything the agent has printed so far.
    pub fn get_output(&self) -> String {
        self.output.contents()
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub async fn process(&self) -> MutexGuard<'_, Box<dyn AgentProcess>> {
        self.process.lock().await
    }

    /// The backend, output accessor and process handle, in that order.
    pub fn parts(&self) -> (&FakeBackend, &OutputLog, &Mutex<Box<dyn AgentProcess>>) {
        (&self.backend, &self.output, &self.process)
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir_path
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn snapshot(&self) -> Vec<DataPoint> {
        self.backend.snapshot()
    }

    pub async fn wait_until(
        &self,
        predicate: impl FnMut(&[DataPoint]) -> bool,
        timeout: Duration,
    ) -> bool {
        self.backend.wait_until(predicate, timeout).await
    }

    /// Summary of what the backend received plus the agent output, for
    /// failure messages.
    pub fn diagnostics(&self) -> String {
        let names: BTreeSet<String> = self
            .backend
            .buffer()
            .with_points(|points| points.iter().map(|p| p.metric.clone()).collect());

        let mut report = format!(
            "session {} ({}): {} datapoints received",
            self.id,
            self.process_id,
            self.backend.len()
        );
        if !names.is_empty() {
            let shown: Vec<&str> = names
                .iter()
                .take(DIAGNOSTIC_METRIC_NAMES)
                .map(String::as_str)
                .collect();
            let _ = write!(report, ", metrics seen: {}", shown.join(", "));
            if names.len() > DIAGNOSTIC_METRIC_NAMES {
                let _ = write!(report, " (+{} more)", names.len() - DIAGNOSTIC_METRIC_NAMES);
            }
        }
        let _ = write!(report, "\n--- agent output ---\n{}", self.output.contents());
        report
    }

    /// Stops the agent, then the backend, then removes the run directory.
    pub async fn shutdown(mut self) -> Result<AgentExit> {
        self.teardown().await
    }

    async fn teardown(&mut self) -> Result<AgentExit> {
        self.torn_down = true;

        let agent = self.process.get_mut().stop(self.grace).await;
        if let Err(err) = &agent {
            warn!(session = %self.id, error = %err, "failed to stop agent");
        }

        let backend = self.backend.stop().await;
        if let Err(err) = &backend {
            warn!(session = %self.id, error = %err, "failed to stop backend");
        }
        self.backend.buffer().discard();

        let run_dir = match self.run_dir.take().map(TempDir::close) {
            Some(Err(err)) => {
                warn!(session = %self.id, error = %err, "failed to remove run directory");
                Err(Error::Teardown(format!(
                    "failed to remove {}: {err}",
                    self.run_dir_path.display()
                )))
            }
            _ => Ok(()),
        };

        debug!(session = %self.id, output = %self.output.contents(), "agent output");
        info!(session = %self.id, "agent session torn down");

        let exit = agent?;
        backend?;
        run_dir?;
        Ok(exit)
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        if !self.torn_down {
            // The process handle kills the agent on drop, the backend aborts
            // its tasks and the run directory removes itself.
            warn!(session = %self.id, "agent session dropped without shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::agent::LocalAgent;
    use crate::assert::tcp_socket_open;

    fn sleeping_agent() -> LocalAgent {
        LocalAgent::new("sh")
            .arg("-c")
            .arg("echo agent ready; exec sleep 30")
            .arg("stub")
    }

    fn builder(config: &str) -> SessionBuilder {
        SessionBuilder::new(config)
            .settings(HarnessSettings::default())
            .launcher(sleeping_agent())
            .grace_period(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn placeholders_are_substituted_in_materialized_config() {
        let session = builder("ingest: {{backend_address}}\nstate: {{run_dir}}/state\n")
            .start()
            .await
            .unwrap();

        let written = std::fs::read_to_string(session.config_path()).unwrap();
        assert_eq!(
            written,
            format!(
                "ingest: {}\nstate: {}/state\n",
                session.backend().addr(),
                session.run_dir().display()
            )
        );
        assert!(session.id().starts_with("agent-session-"));
        assert!(session.config_path().starts_with(session.run_dir()));

        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn diagnostics_list_metrics_and_output() {
        let session = builder("monitors: []\n").start().await.unwrap();
        session.backend().ingest(vec![
            DataPoint::new("disk_ops.read", 1_i64),
            DataPoint::new("cpu.idle", 2_i64),
        ]);
        assert!(
            crate::wait::wait_for(|| session.get_output().contains("agent ready"), Duration::from_secs(5))
                .await
        );

        let report = session.diagnostics();
        assert!(report.contains("2 datapoints received"));
        assert!(report.contains("metrics seen: cpu.idle, disk_ops.read"));
        assert!(report.contains("agent ready"));

        let exit = session.shutdown().await.unwrap();
        assert!(!exit.forced);
        assert_eq!(exit.signal, Some(15));
    }

    #[tokio::test]
    async fn failed_agent_start_stops_backend_and_removes_run_dir() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let root = tempfile::tempdir().unwrap();

        let err = SessionBuilder::new("monitors: []\n")
            .settings(HarnessSettings::default())
            .launcher(LocalAgent::new("/nonexistent/agent"))
            .backend_port(port)
            .temp_root(root.path())
            .start()
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::Setup(SetupError::BinaryNotFound(_))));
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        assert!(!tcp_socket_open(addr).await);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn backend_binds_requested_port_and_run_dir_lands_in_root() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let root = tempfile::tempdir().unwrap();

        let session = builder("monitors: []\n")
            .backend_port(port)
            .temp_root(root.path())
            .start()
            .await
            .unwrap();
        assert_eq!(session.backend().addr().port(), port);
        assert!(session.run_dir().starts_with(root.path()));
        assert!(
            session
                .run_dir()
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(session.id()))
        );

        session.shutdown().await.unwrap();
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}

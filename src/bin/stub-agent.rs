//! Minimal stand-in for the monitoring agent, used by the integration tests.
//!
//! Reads the config passed with `-config`, then once per `intervalSeconds`
//! pushes one datapoint per configured monitor to the config's
//! `ingestAddress`, or to `AGENT_INGEST_ADDRESS` when the config has none.
//! Metric and dimension names come from the self-describe document named by
//! `AGENT_SELFDESCRIBE_JSON` when it is set.
//!
//! Monitor option `logError: true` makes the monitor log an error line on
//! every tick. Top-level `ignoreTerm: true` makes the agent ignore SIGTERM.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agent_tester::agent::AgentConfig;
use agent_tester::agent::local::{DEFAULT_ADDRESS_VAR, DEFAULT_CONFIG_FLAG};
use agent_tester::backend::DataPoint;
use agent_tester::backend::wire::BackendClient;
use agent_tester::metadata::SelfDescribe;
use agent_tester::settings::SELFDESCRIBE_VAR;
use serde_yaml::Value;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_INTERVAL_SECS: u64 = 1;

struct StubMonitor {
    monitor_type: String,
    metric: String,
    dimension: Option<String>,
    log_error: bool,
}

impl StubMonitor {
    fn from_config(entry: &Value, metadata: Option<&SelfDescribe>) -> Option<Self> {
        let monitor_type = entry.get("type")?.as_str()?.to_string();
        let first = |names: Option<HashSet<String>>| {
            names.and_then(|names| names.into_iter().min())
        };

        let metric = first(metadata.and_then(|m| m.expected_metrics(&monitor_type).ok()))
            .unwrap_or_else(|| format!("{monitor_type}.up"));
        let dimension = first(metadata.and_then(|m| m.expected_dims(&monitor_type).ok()));
        let log_error = entry
            .get("logError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Some(Self {
            monitor_type,
            metric,
            dimension,
            log_error,
        })
    }

    fn datapoint(&self, tick: u64) -> DataPoint {
        let plugin = self
            .monitor_type
            .rsplit('/')
            .next()
            .unwrap_or(&self.monitor_type);
        let mut point = DataPoint::new(&self.metric, tick as i64).with_dimension("plugin", plugin);
        if let Some(dim) = &self.dimension {
            point = point.with_dimension(dim, "stub");
        }
        point
    }
}

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == DEFAULT_CONFIG_FLAG {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let path = config_path().ok_or("usage: stub-agent -config <path>")?;
    let config = AgentConfig::from_yaml_file(&path)?;
    let addr: SocketAddr = match &config.ingest_address {
        Some(addr) => addr.parse()?,
        None => std::env::var(DEFAULT_ADDRESS_VAR)?.parse()?,
    };
    let metadata = match std::env::var(SELFDESCRIBE_VAR) {
        Ok(doc) => Some(SelfDescribe::load(doc)?),
        Err(_) => None,
    };

    let monitors: Vec<StubMonitor> = config
        .monitors
        .iter()
        .filter_map(|entry| StubMonitor::from_config(entry, metadata.as_ref()))
        .collect();
    let ignore_term = config
        .extra
        .get("ignoreTerm")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let interval = Duration::from_secs(config.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECS));

    info!(config = %path.display(), backend = %addr, monitors = monitors.len(), "stub agent started");

    let mut terminate = signal(SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(interval);
    let mut client: Option<BackendClient> = None;
    let mut tick = 0u64;

    loop {
        tokio::select! {
            _ = terminate.recv() => {
                if ignore_term {
                    warn!("ignoring SIGTERM");
                    continue;
                }
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = ticker.tick() => {
                tick += 1;
                for monitor in monitors.iter().filter(|m| m.log_error) {
                    error!(monitor = %monitor.monitor_type, "monitor failed to collect");
                }
                if monitors.is_empty() {
                    continue;
                }

                if client.is_none() {
                    match BackendClient::connect(addr).await {
                        Ok(connected) => client = Some(connected),
                        Err(reason) => {
                            warn!(%reason, "backend unavailable, will retry");
                            continue;
                        }
                    }
                }

                let batch: Vec<DataPoint> = monitors.iter().map(|m| m.datapoint(tick)).collect();
                if let Some(connected) = client.as_mut()
                    && let Err(reason) = connected.send(&batch).await
                {
                    warn!(%reason, "send failed, reconnecting");
                    client = None;
                }
            }
        }
    }

    if let Some(connected) = client {
        let _ = connected.close().await;
    }
    Ok(())
}

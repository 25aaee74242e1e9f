pub mod buffer;
pub mod wire;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result, SetupError, WireError};
use crate::wait;

pub use buffer::BackendBuffer;
pub use wire::{DataPoint, MetricType, MetricValue};

const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Shared {
    buffer: BackendBuffer,
    connections: AtomicU64,
    rejected: AtomicU64,
}

impl Shared {
    fn reject(&self, peer: SocketAddr, err: &WireError) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(%peer, error = %err, "dropping connection after bad frame");
    }
}

#[derive(Debug)]
pub struct FakeBackendBuilder {
    host: IpAddr,
    port: u16,
    max_frame_len: usize,
}

impl Default for FakeBackendBuilder {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST,
            port: 0,
            max_frame_len: wire::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl FakeBackendBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Fixed port; the default of 0 picks an ephemeral one.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub async fn start(self) -> Result<FakeBackend> {
        let bind_addr = SocketAddr::new(self.host, self.port);
        let listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|source| SetupError::BackendBind {
                    addr: bind_addr.to_string(),
                    source,
                })?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            buffer: BackendBuffer::new(),
            connections: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            self.max_frame_len,
        ));
        info!(%addr, "fake backend listening");

        Ok(FakeBackend {
            addr,
            shared,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }
}

/// In-memory stand-in for the ingest service the agent pushes datapoints to.
#[derive(Debug)]
pub struct FakeBackend {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl FakeBackend {
    pub fn builder() -> FakeBackendBuilder {
        FakeBackendBuilder::new()
    }

    pub async fn start() -> Result<Self> {
        Self::builder().start().await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn buffer(&self) -> &BackendBuffer {
        &self.shared.buffer
    }

    pub fn ingest(&self, batch: Vec<DataPoint>) {
        self.shared.buffer.append(batch);
    }

    pub fn snapshot(&self) -> Vec<DataPoint> {
        self.shared.buffer.snapshot()
    }

    pub fn len(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.buffer.is_empty()
    }

    pub fn connections_accepted(&self) -> u64 {
        self.shared.connections.load(Ordering::Relaxed)
    }

    pub fn frames_rejected(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Polls the received datapoints until `predicate` holds or `timeout`
    /// elapses.
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&[DataPoint]) -> bool,
        timeout: Duration,
    ) -> bool {
        let buffer = &self.shared.buffer;
        wait::wait_for(|| buffer.with_points(&mut predicate), timeout).await
    }

    pub async fn wait_for_datapoints(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(|points| points.len() >= count, timeout).await
    }

    /// Closes the listener and cancels every connection handler. Safe to call
    /// more than once.
    pub async fn stop(&self) -> Result<()> {
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(task) = task else {
            return Ok(());
        };

        task.abort();
        match task.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => return Err(Error::Teardown(format!("backend accept loop failed: {err}"))),
        }

        info!(addr = %self.addr, received = self.len(), "fake backend stopped");
        Ok(())
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        let task = self
            .accept_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, max_frame_len: usize) {
    // Dropping the set when this task is aborted cancels every handler.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    shared.connections.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, "accepted connection");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&shared),
                        max_frame_len,
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    max_frame_len: usize,
) {
    loop {
        let payload = match wire::read_frame(&mut stream, max_frame_len).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(%peer, "connection closed");
                return;
            }
            Err(err) => {
                shared.reject(peer, &err);
                return;
            }
        };

        match wire::decode_payload(&payload, wire::now_millis()) {
            Ok(points) => {
                trace!(%peer, count = points.len(), "received datapoints");
                shared.buffer.append(points);
            }
            Err(err) => {
                shared.reject(peer, &err);
                return;
            }
        }
    }
}

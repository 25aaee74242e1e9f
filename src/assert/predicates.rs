//! Side-effect-free checks over backend snapshots and agent output, meant to
//! be polled with [`crate::wait`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::backend::DataPoint;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// True if any point has a metric name in `metrics` or any dimension key in
/// `dims`. Dimension values are not consulted.
pub fn has_any_metric_or_dim(
    points: &[DataPoint],
    metrics: &HashSet<String>,
    dims: &HashSet<String>,
) -> bool {
    points.iter().any(|p| {
        metrics.contains(&p.metric) || p.dimensions.keys().any(|key| dims.contains(key))
    })
}

/// Case-sensitive substring check; lowercase `text` first for a
/// case-insensitive one.
pub fn has_log_message(text: &str, message: &str) -> bool {
    !text.is_empty() && text.contains(message)
}

pub fn has_datapoint_with_metric_name(points: &[DataPoint], metric: &str) -> bool {
    points.iter().any(|p| p.metric == metric)
}

pub fn has_datapoint_with_dim(points: &[DataPoint], key: &str, value: &str) -> bool {
    points
        .iter()
        .any(|p| p.dimensions.get(key).is_some_and(|v| v == value))
}

/// True if a single point carries every one of `dims`.
pub fn has_datapoint_with_all_dims(points: &[DataPoint], dims: &[(&str, &str)]) -> bool {
    points.iter().any(|p| carries_all(p, dims))
}

/// True if a point named `metric` carries every one of `dims`.
pub fn has_datapoint(points: &[DataPoint], metric: &str, dims: &[(&str, &str)]) -> bool {
    points
        .iter()
        .any(|p| p.metric == metric && carries_all(p, dims))
}

fn carries_all(point: &DataPoint, dims: &[(&str, &str)]) -> bool {
    dims.iter()
        .all(|(k, v)| point.dimensions.get(*k).is_some_and(|actual| actual == v))
}

/// True if something accepts TCP connections on `addr`.
pub async fn tcp_socket_open(addr: SocketAddr) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

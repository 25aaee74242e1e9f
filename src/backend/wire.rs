//! Framing used between the agent and the fake backend.
//!
//! A frame is a 4-byte big-endian payload length followed by a JSON payload.
//! The payload is either `{"datapoints": [...]}` or a bare array of
//! datapoints. Datapoints without a timestamp are stamped on receipt.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::WireError;

pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;
const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Float(v) => v,
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Gauge,
    Counter,
    CumulativeCounter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub metric: String,
    pub value: MetricValue,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<MetricType>,
}

impl DataPoint {
    pub fn new(metric: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        Self {
            metric: metric.into(),
            value: value.into(),
            dimensions: BTreeMap::new(),
            timestamp_ms: now_millis(),
            metric_type: None,
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_type(mut self, metric_type: MetricType) -> Self {
        self.metric_type = Some(metric_type);
        self
    }

    #[must_use]
    pub fn with_timestamp_ms(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

#[derive(Deserialize)]
struct RawDataPoint {
    metric: String,
    value: MetricValue,
    #[serde(default)]
    dimensions: BTreeMap<String, String>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    metric_type: Option<MetricType>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Batch { datapoints: Vec<RawDataPoint> },
    Bare(Vec<RawDataPoint>),
}

#[derive(Serialize)]
struct BatchRef<'a> {
    datapoints: &'a [DataPoint],
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Decodes one frame payload. The whole payload must decode before any point
/// is returned.
pub fn decode_payload(payload: &[u8], received_at_ms: u64) -> Result<Vec<DataPoint>, WireError> {
    let raw = match serde_json::from_slice::<Payload>(payload)? {
        Payload::Batch { datapoints } => datapoints,
        Payload::Bare(points) => points,
    };

    Ok(raw
        .into_iter()
        .map(|p| DataPoint {
            metric: p.metric,
            value: p.value,
            dimensions: p.dimensions,
            timestamp_ms: p.timestamp.unwrap_or(received_at_ms),
            metric_type: p.metric_type,
        })
        .collect())
}

pub fn encode_frame(points: &[DataPoint]) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(&BatchRef { datapoints: points })?;
    Ok(frame_bytes(&payload))
}

pub fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reads one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>, WireError> {
    let mut len_buf = [0u8; LEN_PREFIX];
    let mut read = 0;
    while read < LEN_PREFIX {
        let n = r.read(&mut len_buf[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(WireError::Truncated {
                read,
                expected: LEN_PREFIX,
            });
        }
        read += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(WireError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = r.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(WireError::Truncated {
                read: filled,
                expected: len,
            });
        }
        filled += n;
    }

    Ok(Some(payload))
}

/// Agent-side sender for the framed protocol.
pub struct BackendClient {
    stream: TcpStream,
}

impl BackendClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, points: &[DataPoint]) -> Result<(), WireError> {
        let frame = encode_frame(points)?;
        self.send_raw(&frame).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), WireError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

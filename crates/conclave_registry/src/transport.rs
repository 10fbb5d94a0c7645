//! Push transport from the registry to members.
//!
//! The registry only needs one capability from the network: deliver a batch
//! of events to a member's address and learn whether it arrived. The wire
//! format lives entirely behind [`PushTransport`].

use async_trait::async_trait;
use conclave_core::EventTime;
use conclave_log::Event;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Timeout
    #[error("Push timeout after {0}ms")]
    Timeout(u64),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The member answered but did not accept the batch
    #[error("Push rejected by member")]
    Rejected,
}

/// Events pushed to one member in one delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Pool the events belong to
    pub pool: String,
    /// Contiguous run of events
    pub events: Vec<Event>,
    /// Oldest time the registry still holds
    pub floor: EventTime,
}

impl EventBatch {
    /// Create a batch
    #[must_use]
    pub fn new(pool: impl Into<String>, events: Vec<Event>, floor: EventTime) -> Self {
        Self {
            pool: pool.into(),
            events,
            floor,
        }
    }

    /// Time of the last event in the batch
    #[must_use]
    pub fn last_time(&self) -> Option<EventTime> {
        self.events.last().map(|e| e.time)
    }

    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch carries no events
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Delivers event batches to members
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Push `batch` to the member listening on `address`
    async fn push(&self, address: &str, batch: &EventBatch) -> Result<(), TransportError>;
}

/// Acknowledgment byte a member sends after accepting a batch
pub const PUSH_ACK: u8 = 0x01;

/// TCP push transport
///
/// Frames each batch as a big-endian `u32` length followed by the JSON
/// encoding, then waits for a single [`PUSH_ACK`] byte.
#[derive(Debug, Clone)]
pub struct TcpPushTransport {
    timeout: Duration,
}

impl TcpPushTransport {
    /// Create a transport whose connect-send-ack round trip is bounded by `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn deliver(address: &str, frame: &[u8]) -> Result<(), TransportError> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream
            .write_all(frame)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let ack = stream
            .read_u8()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        if ack != PUSH_ACK {
            return Err(TransportError::Rejected);
        }
        Ok(())
    }
}

impl Default for TcpPushTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Length-prefix a JSON encoded batch
///
/// # Errors
///
/// Returns [`TransportError::Serialization`] if the batch cannot be encoded
/// or is larger than a frame can describe
pub fn encode_frame(batch: &EventBatch) -> Result<Vec<u8>, TransportError> {
    let body = serde_json::to_vec(batch).map_err(|e| TransportError::Serialization(e.to_string()))?;
    let len = u32::try_from(body.len())
        .map_err(|_| TransportError::Serialization("batch too large".to_string()))?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[async_trait]
impl PushTransport for TcpPushTransport {
    async fn push(&self, address: &str, batch: &EventBatch) -> Result<(), TransportError> {
        let frame = encode_frame(batch)?;
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        tokio::time::timeout(self.timeout, Self::deliver(address, &frame))
            .await
            .map_err(|_| TransportError::Timeout(timeout_ms))?
    }
}

//! Sidechannel bus interface.
//!
//! The bus is a channel-addressed, append-only, locally tailable event log
//! with a publish RPC. This module only defines the surface the core
//! consumes; transports live elsewhere and tests plug in fakes.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;

/// Per-trade swap channels are named `swap:<id>`.
pub const SWAP_CHANNEL_PREFIX: &str = "swap:";

/// One entry of the bus log tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub seq: u64,
    /// Bus-assigned receive timestamp, milliseconds.
    pub ts: u64,
    pub channel: String,
    pub kind: String,
    pub trade_id: String,
    /// The published envelope as JSON.
    pub message: Value,
}

#[derive(Debug, Clone, Default)]
pub struct LogTail {
    pub events: Vec<BusEvent>,
    pub latest_seq: u64,
}

#[derive(Debug, Clone)]
pub struct BusInfo {
    /// Lowercase hex32 public key of the local bus peer.
    pub peer: String,
}

#[async_trait]
pub trait BusClient: Send + Sync {
    async fn subscribe(&self, channels: &[String]) -> Result<()>;
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<()>;
    async fn log_read(&self, since_seq: u64, limit: usize) -> Result<LogTail>;
    async fn info(&self) -> Result<BusInfo>;
    async fn join(&self, channel: &str) -> Result<()>;
    async fn leave(&self, channel: &str) -> Result<()>;
}

/// Channel names are `^[A-Za-z0-9_:.-]{1,128}$`.
pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'.' | b'-'))
}

//! Centralized configuration for the mesh protocol.
//!
//! Wire constants (chunk size) are fixed. Timing and retry tunables have
//! defaults here and can be overridden per deployment through
//! [`MeshConfig`], which is read from the `[mesh]` table of the TOML config.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Maximum payload carried by one `file-chunk` message (16 KiB).
///
/// Applies uniformly to every transfer; both ends must agree on it.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Chunks emitted per outbound pump step before yielding back to the event
/// loop, so keep-alives and inbound traffic interleave with bulk sends.
pub const CHUNKS_PER_PUMP: usize = 16;

// ── Connection / Liveness ────────────────────────────────────────────────────

/// Bound on waiting for a new connection's open event.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keep-alive probe interval per open connection.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Interval of the health check sweep over all connections.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

// ── Auto-reconnect ──────────────────────────────────────────────────────────

/// Reconnect attempts after a connection degrades, before giving up.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 3;

/// Delay before the first reconnect attempt; doubles with each attempt made.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ── WebRTC ───────────────────────────────────────────────────────────────────

/// Label of the single data channel each mesh connection uses.
pub const DATA_CHANNEL_LABEL: &str = "meshdrop";

/// Bound on gathering local ICE candidates before an offer/answer is sent.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// STUN server used when none is configured.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Runtime-tunable subset of the constants above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    #[serde(with = "secs")]
    pub keep_alive_interval: Duration,
    #[serde(with = "secs")]
    pub health_check_interval: Duration,
    pub reconnect_max_attempts: u32,
    #[serde(with = "secs")]
    pub reconnect_delay: Duration,
    /// Announce the whole local library to a peer when its channel opens.
    pub announce_on_connect: bool,
    /// Route a download through the peer the metadata came from when the
    /// transport cannot reach the holder at all.
    pub relay_fallback: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            health_check_interval: HEALTH_CHECK_INTERVAL,
            reconnect_max_attempts: RECONNECT_MAX_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
            announce_on_connect: true,
            relay_fallback: true,
        }
    }
}

/// Durations are written as fractional seconds in TOML.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

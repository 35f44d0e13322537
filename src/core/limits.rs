//! Broker safety limits (normative defaults).
//!
//! Values are intentionally explicit about their units.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub max_append_chunk_bytes: usize,
    /// Soft per-chunk budget for append clients. Two elapsed budgets
    /// without a chunk abort the append.
    pub append_chunk_timeout_ms: u64,
    pub read_chunk_bytes: usize,
    pub connect_timeout_ms: u64,
    pub max_connections: usize,
    pub persist_retry_ms: u64,

    pub max_cbor_map_entries: usize,
    pub max_cbor_text_len: usize,
    pub max_cbor_bytes_len: usize,
    pub max_route_members: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_append_chunk_bytes: 4 * 1024 * 1024,
            append_chunk_timeout_ms: 1_000,
            read_chunk_bytes: 128 * 1024,
            connect_timeout_ms: 5_000,
            max_connections: 256,
            persist_retry_ms: 5_000,

            max_cbor_map_entries: 64,
            max_cbor_text_len: 4_096,
            max_cbor_bytes_len: 16 * 1024 * 1024,
            max_route_members: 16,
        }
    }
}

//! Parsing of shard node names and payloads.
//!
//! Shard nodes are named by their decimal index and carry either a
//! `host:port` payload or the vacant sentinel `"0"`. All functions here are
//! pure and reject anything ambiguous instead of guessing.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::ShardIndex;

/// Payload meaning "this shard currently has no live endpoint".
pub const VACANT_SENTINEL: &str = "0";

// host is a bracketed IPv6 literal or anything without colons/whitespace
static ENDPOINT_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(?:\[([0-9A-Fa-f:.]+)\]|([^\s:\[\]]+)):(\d+)$"));

/// Errors that can occur while parsing a shard payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Failed to compile regex: {0}")]
    RegexCompilation(String),

    #[error("Payload is not valid UTF-8")]
    NotUtf8,

    #[error("Expected host:port, got {0:?}")]
    Format(String),

    #[error("Invalid port {0:?}")]
    InvalidPort(String),
}

/// Parsed content of a shard node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardPayload {
    /// The shard is served at `host:port`.
    Endpoint { host: String, port: u16 },
    /// The shard has no live endpoint.
    Vacant,
}

impl ShardPayload {
    /// Parse a raw node payload.
    ///
    /// # Example
    /// ```
    /// use shard_keeper::membership::payload::ShardPayload;
    ///
    /// let payload = ShardPayload::parse(b"10.0.0.1:6379").unwrap();
    /// assert_eq!(
    ///     payload,
    ///     ShardPayload::Endpoint { host: "10.0.0.1".to_string(), port: 6379 }
    /// );
    /// assert_eq!(ShardPayload::parse(b"0").unwrap(), ShardPayload::Vacant);
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(data).map_err(|_| PayloadError::NotUtf8)?;
        let text = text.trim();

        if text == VACANT_SENTINEL {
            return Ok(ShardPayload::Vacant);
        }

        let endpoint_regex = ENDPOINT_PATTERN
            .as_ref()
            .map_err(|e| PayloadError::RegexCompilation(e.to_string()))?;

        let caps = endpoint_regex
            .captures(text)
            .ok_or_else(|| PayloadError::Format(text.to_string()))?;

        let host = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| PayloadError::Format(text.to_string()))?;

        let port_str = caps
            .get(3)
            .map(|m| m.as_str())
            .ok_or_else(|| PayloadError::Format(text.to_string()))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| PayloadError::InvalidPort(port_str.to_string()))?;
        if port == 0 {
            return Err(PayloadError::InvalidPort(port_str.to_string()));
        }

        Ok(ShardPayload::Endpoint { host, port })
    }
}

/// Parse a shard node name into its index.
///
/// Only canonical decimal names are accepted (`"0"`, `"12"`); `"012"` or
/// `"+1"` would alias another shard and are rejected.
pub fn parse_shard_index(name: &str) -> Option<ShardIndex> {
    let canonical = !name.is_empty()
        && name.bytes().all(|b| b.is_ascii_digit())
        && (name == "0" || !name.starts_with('0'));
    if !canonical {
        return None;
    }
    name.parse().ok()
}

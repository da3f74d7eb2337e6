//! Core types shared across the protocol

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Random identity of one execution context (tab/window).
///
/// Generated once per context and used only as a provenance tag on storage
/// mirror broadcasts — never as preview identity. A collision merely
/// weakens the self-echo guard, so a random token is sufficient; this is
/// not a security credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    /// Generate a fresh random tab identity (32 hex chars).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable externally-addressable identity of a preview, derived from the
/// subdomain label preceding the sandbox-hosting suffix in its URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreviewId(String);

impl PreviewId {
    /// Derive a preview identity from a base URL of the shape
    /// `https://{previewId}.{suffix}`.
    ///
    /// Returns `None` when the URL does not match the expected pattern.
    /// Malformed URLs are expected during sandbox cold-start, so "no
    /// identity" is a normal outcome, not an error.
    pub fn from_base_url(base_url: &str, host_suffix: &str) -> Option<Self> {
        let rest = base_url
            .strip_prefix("https://")
            .or_else(|| base_url.strip_prefix("http://"))?;
        let host = rest.split(['/', '?', '#']).next()?;
        let host = host.split(':').next()?;
        let label = host
            .strip_suffix(host_suffix)
            .and_then(|h| h.strip_suffix('.'))?;
        if label.is_empty() || label.contains('.') {
            return None;
        }
        Some(Self(label.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreviewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PreviewId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One currently-known sandbox port and its preview endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewInfo {
    pub port: u16,
    pub ready: bool,
    pub base_url: String,
}

impl PreviewInfo {
    /// Derive this preview's identity from its base URL, if parsable.
    pub fn preview_id(&self, host_suffix: &str) -> Option<PreviewId> {
        PreviewId::from_base_url(&self.base_url, host_suffix)
    }
}

/// Sandbox lifecycle events consumed by the synchronizer.
///
/// The subsystem treats these as an externally supplied event stream; it
/// never originates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortEvent {
    PortOpened { port: u16, url: String },
    PortClosed { port: u16 },
    ServerReady { port: u16, url: String },
}

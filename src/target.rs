//! Relay target resolution.
//!
//! Every session relays to exactly one TCP endpoint, chosen before any
//! per-connection state exists. The endpoint is either a fixed address from
//! the configuration or one decoded from the WebSocket URL path:
//!
//! ```text
//! ws://relay:8080/<base64("pool.example.com:3333")>
//! ```
//!
//! A target that fails to decode or validate never reaches the relay core;
//! the server closes the session with the matching [`CloseReason`].

use std::fmt;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::relay::CloseReason;

/// Resolved TCP endpoint for one session.
///
/// Construction trims and validates the host (non-empty) and port (`1..=65535`), so
/// a `Target` value is always connectable in principle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    /// Create a target from a host and port.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::EmptyHost`] or [`TargetError::InvalidPort`].
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, TargetError> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(TargetError::EmptyHost);
        }
        if port == 0 {
            return Err(TargetError::InvalidPort(port.to_string()));
        }
        Ok(Self { host, port })
    }

    /// Parse `host:port` (IPv6 hosts in brackets: `[::1]:3333`).
    ///
    /// # Errors
    ///
    /// Returns an error if the port is missing or out of range, or the
    /// host is empty.
    pub fn parse(addr: &str) -> Result<Self, TargetError> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(TargetError::Empty);
        }

        let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or(TargetError::MissingPort)?;
            let port = tail.strip_prefix(':').ok_or(TargetError::MissingPort)?;
            (host, port)
        } else {
            addr.rsplit_once(':').ok_or(TargetError::MissingPort)?
        };

        // Parse wide so "70000" reports as out of range rather than garbage
        let port = port
            .parse::<u32>()
            .ok()
            .filter(|p| (1..=u32::from(u16::MAX)).contains(p))
            .ok_or_else(|| TargetError::InvalidPort(port.to_string()))?;

        Self::new(host, port as u16)
    }

    /// Decode a base64 `host:port` string.
    ///
    /// Standard and URL-safe alphabets are accepted, with or without
    /// padding (including `%3D` escaped padding).
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Encoding`] if the input is not base64 or not
    /// UTF-8, otherwise any error from [`Target::parse`].
    pub fn decode(encoded: &str) -> Result<Self, TargetError> {
        let trimmed = encoded
            .trim()
            .replace("%3D", "")
            .replace("%3d", "");
        let trimmed = trimmed.trim_end_matches('=');
        if trimmed.is_empty() {
            return Err(TargetError::Empty);
        }

        let bytes = STANDARD_NO_PAD
            .decode(trimmed)
            .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
            .map_err(|e| TargetError::Encoding(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|e| TargetError::Encoding(e.to_string()))?;

        Self::parse(&text)
    }

    /// Encode as the URL path segment clients use to select this target.
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_string())
    }

    /// Host name or address literal.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Reasons a session's target cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// No address supplied.
    Empty,
    /// Address is not valid base64 / UTF-8.
    Encoding(String),
    /// No `:port` suffix.
    MissingPort,
    /// Port outside `1..=65535` or not a number.
    InvalidPort(String),
    /// Host part is empty.
    EmptyHost,
    /// Target matches the configured block list.
    Forbidden(String),
}

impl TargetError {
    /// Close reason reported to the WebSocket peer.
    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Forbidden(_) => CloseReason::ForbiddenTarget,
            _ => CloseReason::InvalidAddress,
        }
    }
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty target address"),
            Self::Encoding(msg) => write!(f, "Invalid target encoding: {msg}"),
            Self::MissingPort => write!(f, "Target address has no port"),
            Self::InvalidPort(port) => write!(f, "Invalid target port: {port}"),
            Self::EmptyHost => write!(f, "Target address has no host"),
            Self::Forbidden(target) => write!(f, "Forbidden target: {target}"),
        }
    }
}

impl std::error::Error for TargetError {}

/// Block list applied to decoded targets.
#[derive(Debug, Clone, Default)]
pub struct TargetPolicy {
    blocked_hosts: Vec<String>,
    blocked_ports: Vec<u16>,
}

impl TargetPolicy {
    /// Create a policy from host and port block lists.
    ///
    /// Host comparison is case-insensitive and exact.
    #[must_use]
    pub fn new(blocked_hosts: &[String], blocked_ports: &[u16]) -> Self {
        Self {
            blocked_hosts: blocked_hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
            blocked_ports: blocked_ports.to_vec(),
        }
    }

    /// Check a target against the block lists.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Forbidden`] if host or port is blocked.
    pub fn check(&self, target: &Target) -> Result<(), TargetError> {
        let host = target.host().to_ascii_lowercase();
        if self.blocked_hosts.contains(&host) || self.blocked_ports.contains(&target.port()) {
            return Err(TargetError::Forbidden(target.to_string()));
        }
        Ok(())
    }
}

/// Picks the target for each new session.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    fixed: Option<Target>,
    policy: TargetPolicy,
}

impl TargetResolver {
    /// Always relay to `target`, ignoring the request path.
    #[must_use]
    pub fn fixed(target: Target) -> Self {
        Self {
            fixed: Some(target),
            policy: TargetPolicy::default(),
        }
    }

    /// Decode the target from each request path, subject to `policy`.
    #[must_use]
    pub fn encoded(policy: TargetPolicy) -> Self {
        Self {
            fixed: None,
            policy,
        }
    }

    /// Whether targets come from the request path.
    #[must_use]
    pub fn is_encoded(&self) -> bool {
        self.fixed.is_none()
    }

    /// Resolve the target for a request path such as `/cG9vbDozMzMz?x=1`.
    ///
    /// # Errors
    ///
    /// Returns a [`TargetError`] if the path does not carry a valid,
    /// permitted target.
    pub fn resolve(&self, path: &str) -> Result<Target, TargetError> {
        if let Some(target) = &self.fixed {
            return Ok(target.clone());
        }

        let path = path.split(['?', '#']).next().unwrap_or_default();
        let encoded = path.strip_prefix('/').unwrap_or(path);
        let target = Target::decode(encoded)?;
        self.policy.check(&target)?;
        Ok(target)
    }
}

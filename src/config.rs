//! Configuration loading and validation.
//!
//! Configuration is resolved once at startup, in order:
//!
//! 1. Defaults from [`crate::constants`]
//! 2. JSON file passed with `--config`
//! 3. `WSRELAY_*` environment variables
//! 4. Command-line flags (applied by `main`)
//!
//! The validated [`Config`] is immutable afterwards. Each connection receives
//! the [`RelayLimits`] slice by value.

// Rust guideline compliant 2026-02

use std::path::Path;
use std::time::Duration;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::target::{Target, TargetPolicy, TargetResolver};

/// Configuration for the relay server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Socket address to listen on.
    pub listen: String,
    /// Fixed relay target (`host:port`). `None` decodes the target from
    /// each request path.
    pub target: Option<String>,
    /// Hosts refused in encoded-target mode.
    pub blocked_hosts: Vec<String>,
    /// Ports refused in encoded-target mode.
    pub blocked_ports: Vec<u16>,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    /// Pending queue and write backlog bound per connection.
    pub max_queue_size: usize,
    /// Largest accepted inbound message in bytes.
    pub max_payload_length: usize,
    /// TCP connect deadline in milliseconds.
    pub connect_timeout_ms: u64,
    /// Idle window in seconds; 0 disables the idle timeout.
    pub idle_timeout_secs: u64,
    /// Backpressure re-check interval in milliseconds.
    pub backpressure_cooldown_ms: u64,
    /// Buffered TCP bytes at which the stream reports saturation.
    pub stream_high_water: usize,
    /// Buffered TCP bytes at which a saturated stream reports drain.
    pub stream_low_water: usize,
    /// Buffered WebSocket bytes at which TCP reads pause.
    pub frame_high_water: usize,
    /// Buffered WebSocket bytes at which a saturated session reports drain.
    pub frame_low_water: usize,
    /// Deadline for a complete HTTP request head, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Body of the plain-text status response.
    pub status_text: String,
    /// Companion process kept running alongside the relay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helper: Option<HelperConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: constants::DEFAULT_LISTEN.to_string(),
            target: Some(constants::DEFAULT_TARGET.to_string()),
            blocked_hosts: Vec::new(),
            blocked_ports: Vec::new(),
            max_connections: constants::MAX_CONNECTIONS,
            max_queue_size: constants::MAX_QUEUE_SIZE,
            max_payload_length: constants::MAX_PAYLOAD_LENGTH,
            connect_timeout_ms: constants::CONNECT_TIMEOUT.as_millis() as u64,
            idle_timeout_secs: constants::IDLE_TIMEOUT.as_secs(),
            backpressure_cooldown_ms: constants::BACKPRESSURE_COOLDOWN.as_millis() as u64,
            stream_high_water: constants::STREAM_HIGH_WATER,
            stream_low_water: constants::STREAM_LOW_WATER,
            frame_high_water: constants::FRAME_HIGH_WATER,
            frame_low_water: constants::FRAME_LOW_WATER,
            handshake_timeout_ms: constants::HANDSHAKE_TIMEOUT.as_millis() as u64,
            status_text: constants::STATUS_TEXT.to_string(),
            helper: None,
        }
    }
}

/// Companion process settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HelperConfig {
    /// Executable to run.
    pub program: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Seconds to wait before restarting after an exit.
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
}

fn default_restart_delay_secs() -> u64 {
    constants::HELPER_RESTART_DELAY.as_secs()
}

impl HelperConfig {
    /// Helper running `program` with default restart delay.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            restart_delay_secs: default_restart_delay_secs(),
        }
    }

    /// Restart delay as a [`Duration`].
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

/// Per-connection limits, copied into every [`Connection`](crate::relay::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Pending queue capacity and write backlog bound.
    pub max_queue_size: usize,
    /// Largest accepted inbound payload.
    pub max_payload_length: usize,
    /// TCP connect deadline.
    pub connect_timeout: Duration,
    /// Idle window, if enabled.
    pub idle_timeout: Option<Duration>,
    /// Backpressure re-check interval.
    pub backpressure_cooldown: Duration,
    /// Stream saturation threshold.
    pub stream_high_water: usize,
    /// Stream drain threshold.
    pub stream_low_water: usize,
    /// Frame buffer threshold that pauses TCP reads.
    pub frame_high_water: usize,
    /// Frame buffer drain threshold.
    pub frame_low_water: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_queue_size: constants::MAX_QUEUE_SIZE,
            max_payload_length: constants::MAX_PAYLOAD_LENGTH,
            connect_timeout: constants::CONNECT_TIMEOUT,
            idle_timeout: Some(constants::IDLE_TIMEOUT),
            backpressure_cooldown: constants::BACKPRESSURE_COOLDOWN,
            stream_high_water: constants::STREAM_HIGH_WATER,
            stream_low_water: constants::STREAM_LOW_WATER,
            frame_high_water: constants::FRAME_HIGH_WATER,
            frame_low_water: constants::FRAME_LOW_WATER,
        }
    }
}

impl Config {
    /// Load configuration from `path` (or defaults), then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `WSRELAY_*` overrides using `lookup` to read variables.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("WSRELAY_LISTEN") {
            self.listen = listen;
        }

        // Empty string switches to encoded-path targets
        if let Some(target) = lookup("WSRELAY_TARGET") {
            self.target = if target.trim().is_empty() { None } else { Some(target) };
        }

        override_number(&lookup, "WSRELAY_MAX_QUEUE_SIZE", &mut self.max_queue_size);
        override_number(&lookup, "WSRELAY_MAX_PAYLOAD_LENGTH", &mut self.max_payload_length);
        override_number(&lookup, "WSRELAY_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms);
        override_number(&lookup, "WSRELAY_IDLE_TIMEOUT_SECS", &mut self.idle_timeout_secs);
        override_number(&lookup, "WSRELAY_MAX_CONNECTIONS", &mut self.max_connections);
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.listen))?;

        if let Some(target) = &self.target {
            Target::parse(target).with_context(|| format!("Invalid target: {target}"))?;
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("max_queue_size must be greater than zero");
        }
        if self.max_payload_length == 0 {
            anyhow::bail!("max_payload_length must be greater than zero");
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be greater than zero");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }
        if self.stream_low_water >= self.stream_high_water {
            anyhow::bail!(
                "stream_low_water ({}) must be below stream_high_water ({})",
                self.stream_low_water,
                self.stream_high_water
            );
        }
        if self.frame_low_water >= self.frame_high_water {
            anyhow::bail!(
                "frame_low_water ({}) must be below frame_high_water ({})",
                self.frame_low_water,
                self.frame_high_water
            );
        }
        if let Some(helper) = &self.helper {
            if helper.program.trim().is_empty() {
                anyhow::bail!("helper.program must not be empty");
            }
        }
        Ok(())
    }

    /// Limits handed to each connection.
    pub fn relay_limits(&self) -> RelayLimits {
        RelayLimits {
            max_queue_size: self.max_queue_size,
            max_payload_length: self.max_payload_length,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs)),
            backpressure_cooldown: Duration::from_millis(self.backpressure_cooldown_ms),
            stream_high_water: self.stream_high_water,
            stream_low_water: self.stream_low_water,
            frame_high_water: self.frame_high_water,
            frame_low_water: self.frame_low_water,
        }
    }

    /// Build the target resolver for new sessions.
    pub fn target_resolver(&self) -> Result<TargetResolver> {
        match &self.target {
            Some(target) => {
                let target = Target::parse(target).with_context(|| format!("Invalid target: {target}"))?;
                Ok(TargetResolver::fixed(target))
            }
            None => Ok(TargetResolver::encoded(TargetPolicy::new(
                &self.blocked_hosts,
                &self.blocked_ports,
            ))),
        }
    }

    /// HTTP request head deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("[Config] Ignoring {}={:?}: not a number", key, raw),
        }
    }
}

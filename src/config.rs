//! Configuration management for the dpmux middlebox
//!
//! Both processes of a middlebox read the same YAML file; each uses the top
//! level, the `shaper` section and its own process section.

use crate::driver::{DriverIntervals, PeerRole, ShapedOptions, UnshapedOptions};
use crate::error::{ConfigError, LayoutError};
use crate::shaper::{Fairness, NoiseParams, PacingStrategy, ShaperTiming};
use crate::constants::{DEFAULT_QUEUE_CAPACITY, MAX_READ_CHUNK};
use crate::shm::{default_shm_dir, ShmLayout};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

/// Differential-privacy noise and pacing of the shaped transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaperConfig {
    /// Noise standard deviation relative to the sensitivity
    #[serde(default = "default_noise_multiplier")]
    pub noise_multiplier: f64,
    /// Sensitivity of the backlog query in bytes
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    /// Lower clamp of a decision in bytes
    #[serde(default = "default_min_decision")]
    pub min_decision: u64,
    /// Upper clamp of a decision in bytes
    #[serde(default = "default_max_decision")]
    pub max_decision: u64,
    /// Interval between noisy decisions in microseconds
    #[serde(default = "default_decision_interval_us")]
    pub decision_interval_us: u64,
    /// Interval between sending ticks in microseconds
    #[serde(default = "default_sending_interval_us")]
    pub sending_interval_us: u64,
    /// BURST or UNIFORM
    #[serde(default = "default_strategy")]
    pub strategy: PacingStrategy,
    /// IN_ORDER, ROUND_ROBIN or EQUAL_SHARE
    #[serde(default)]
    pub fairness: Fairness,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            noise_multiplier: default_noise_multiplier(),
            sensitivity: default_sensitivity(),
            min_decision: default_min_decision(),
            max_decision: default_max_decision(),
            decision_interval_us: default_decision_interval_us(),
            sending_interval_us: default_sending_interval_us(),
            strategy: default_strategy(),
            fairness: Fairness::default(),
        }
    }
}

impl ShaperConfig {
    pub fn noise(&self) -> NoiseParams {
        NoiseParams {
            noise_multiplier: self.noise_multiplier,
            sensitivity: self.sensitivity,
            min_decision: self.min_decision,
            max_decision: self.max_decision,
        }
    }

    pub fn timing(&self) -> Result<ShaperTiming, ConfigError> {
        ShaperTiming::new(
            Duration::from_micros(self.decision_interval_us),
            Duration::from_micros(self.sending_interval_us),
            self.strategy,
        )
    }
}

/// Unshaped process: the ordinary TCP side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnshapedConfig {
    /// Listen address for client flows (initiator only)
    #[serde(default = "default_unshaped_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_unshaped_bind_port")]
    pub bind_port: u16,
    /// Server announced for accepted flows, as host:port
    #[serde(default = "default_destination")]
    pub destination: String,
    /// Queue drain interval in microseconds
    #[serde(default = "default_check_queues_interval_us")]
    pub check_queues_interval_us: u64,
    #[serde(default = "default_signal_poll_interval_us")]
    pub signal_poll_interval_us: u64,
    /// Retry delay when a flow queue is full, in microseconds
    #[serde(default = "default_backoff_us")]
    pub backoff_us: u64,
}

impl Default for UnshapedConfig {
    fn default() -> Self {
        Self {
            bind_address: default_unshaped_bind_address(),
            bind_port: default_unshaped_bind_port(),
            destination: default_destination(),
            check_queues_interval_us: default_check_queues_interval_us(),
            signal_poll_interval_us: default_signal_poll_interval_us(),
            backoff_us: default_backoff_us(),
        }
    }
}

/// Shaped process: the QUIC link to the peer middlebox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapedConfig {
    /// Peer to dial (initiator only)
    #[serde(default = "default_peer_address")]
    pub peer_address: String,
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// Local UDP address; the responder listens here
    #[serde(default = "default_shaped_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_shaped_bind_port")]
    pub bind_port: u16,
    /// Server certificate (PEM), generated when absent
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// Server private key (PEM), generated when absent
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Certificate the initiator trusts for the peer
    #[serde(default = "default_cert_path")]
    pub ca_cert_path: PathBuf,
    /// Name the initiator expects in the peer's certificate
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Concurrent flow streams the responder accepts
    #[serde(default = "default_max_streams")]
    pub max_streams: u32,
    #[serde(default = "default_signal_poll_interval_us")]
    pub signal_poll_interval_us: u64,
    /// Housekeeping interval in microseconds
    #[serde(default = "default_service_interval_us")]
    pub service_interval_us: u64,
    /// How long an unidentified stream may wait for its announcement
    #[serde(default = "default_association_window_ms")]
    pub association_window_ms: u64,
    #[serde(default = "default_backoff_us")]
    pub backoff_us: u64,
}

impl Default for ShapedConfig {
    fn default() -> Self {
        Self {
            peer_address: default_peer_address(),
            peer_port: default_peer_port(),
            bind_address: default_shaped_bind_address(),
            bind_port: default_shaped_bind_port(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_cert_path: default_cert_path(),
            server_name: default_server_name(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_streams: default_max_streams(),
            signal_poll_interval_us: default_signal_poll_interval_us(),
            service_interval_us: default_service_interval_us(),
            association_window_ms: default_association_window_ms(),
            backoff_us: default_backoff_us(),
        }
    }
}

/// Middlebox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Names the shared region; both processes must agree
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// INITIATOR or RESPONDER
    #[serde(default = "default_role")]
    pub role: PeerRole,
    /// Concurrent flows (queue pairs besides the dummy pair)
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,
    /// Byte capacity of every flow ring
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Directory holding the shared region file, defaults to /dev/shm
    /// or the system temp dir
    #[serde(default)]
    pub shm_dir: Option<PathBuf>,
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path to logging theme configuration file
    #[serde(default = "default_log_theme_path")]
    pub log_theme_path: String,
    #[serde(default = "default_log_to_file")]
    pub log_to_file: bool,
    /// Path to log file (used when log_to_file is true)
    #[serde(default = "default_log_file_path")]
    pub log_file_path: Option<String>,
    #[serde(default)]
    pub shaper: ShaperConfig,
    #[serde(default)]
    pub unshaped: UnshapedConfig,
    #[serde(default)]
    pub shaped: ShapedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            role: default_role(),
            max_flows: default_max_flows(),
            queue_capacity: default_queue_capacity(),
            shm_dir: None,
            log_level: default_log_level(),
            log_theme_path: default_log_theme_path(),
            log_to_file: default_log_to_file(),
            log_file_path: default_log_file_path(),
            shaper: ShaperConfig::default(),
            unshaped: UnshapedConfig::default(),
            shaped: ShapedConfig::default(),
        }
    }
}

fn default_app_name() -> String {
    "dpmux".to_string()
}

fn default_role() -> PeerRole {
    PeerRole::Initiator
}

fn default_max_flows() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_theme_path() -> String {
    "config/logging_theme.yml".to_string()
}

fn default_log_to_file() -> bool {
    false
}

fn default_log_file_path() -> Option<String> {
    None
}

fn default_noise_multiplier() -> f64 {
    1.0
}

fn default_sensitivity() -> f64 {
    1500.0
}

fn default_min_decision() -> u64 {
    0
}

fn default_max_decision() -> u64 {
    1_000_000
}

fn default_decision_interval_us() -> u64 {
    100_000
}

fn default_sending_interval_us() -> u64 {
    10_000
}

fn default_strategy() -> PacingStrategy {
    PacingStrategy::Uniform
}

fn default_unshaped_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_unshaped_bind_port() -> u16 {
    5000
}

fn default_destination() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_check_queues_interval_us() -> u64 {
    1_000
}

fn default_signal_poll_interval_us() -> u64 {
    1_000
}

fn default_service_interval_us() -> u64 {
    10_000
}

fn default_backoff_us() -> u64 {
    1_000
}

fn default_peer_address() -> String {
    "127.0.0.1".to_string()
}

fn default_peer_port() -> u16 {
    4433
}

fn default_shaped_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_shaped_bind_port() -> u16 {
    0
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("certs/peer.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("certs/peer.key")
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_max_streams() -> u32 {
    default_max_flows() as u32
}

fn default_association_window_ms() -> u64 {
    5_000
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                let config: Config = serde_yaml::from_str(&contents)
                    .map_err(|e| anyhow::anyhow!("Failed to parse YAML configuration: {}", e))?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Configuration file not found at '{}', using default configuration", path.as_ref().display());
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read configuration file '{}': {}",
                path.as_ref().display(),
                e
            )),
        }
    }

    /// Save configuration to a YAML file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).await?;
        Ok(())
    }

    /// Validate configuration fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.log_level.to_uppercase().as_str()) {
            return Err(invalid(format!("invalid log level: {}", self.log_level)));
        }
        if self.log_to_file && self.log_file_path.as_ref().is_some_and(|p| p.trim().is_empty()) {
            return Err(invalid("log file path cannot be empty when log_to_file is true"));
        }
        if self.app_name.is_empty() || self.app_name.contains('/') {
            return Err(invalid(format!("app_name '{}' cannot name a shared region", self.app_name)));
        }

        // Flow count, ring sizes and their product
        self.layout().map_err(|e| invalid(e.to_string()))?;

        self.shaper.noise().validate()?;
        self.shaper.timing()?;

        if self.unshaped.check_queues_interval_us == 0 || self.unshaped.signal_poll_interval_us == 0 {
            return Err(invalid("unshaped intervals must be greater than 0"));
        }
        if self.shaped.signal_poll_interval_us == 0 || self.shaped.service_interval_us == 0 {
            return Err(invalid("shaped intervals must be greater than 0"));
        }
        if self.unshaped.backoff_us == 0 || self.shaped.backoff_us == 0 {
            return Err(invalid("backoff must be greater than 0"));
        }
        if self.shaped.association_window_ms == 0 {
            return Err(invalid("association window must be greater than 0"));
        }
        if self.shaped.idle_timeout_ms == 0 {
            return Err(invalid("QUIC idle timeout must be greater than 0"));
        }
        if self.shaped.max_streams == 0 {
            return Err(invalid("max_streams must be greater than 0"));
        }

        match self.role {
            PeerRole::Initiator => {
                if self.unshaped.bind_port == 0 {
                    return Err(invalid("unshaped bind port must be between 1 and 65535"));
                }
                if self.shaped.peer_port == 0 {
                    return Err(invalid("peer port must be between 1 and 65535"));
                }
                if self.shaped.server_name.trim().is_empty() {
                    return Err(invalid("server_name is required to dial the peer"));
                }
                match self.unshaped.destination.rsplit_once(':') {
                    Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                    _ => {
                        return Err(invalid(format!(
                            "destination '{}' must be host:port",
                            self.unshaped.destination
                        )))
                    }
                }
            }
            PeerRole::Responder => {
                if self.shaped.bind_port == 0 {
                    return Err(invalid("shaped bind port must be between 1 and 65535"));
                }
            }
        }

        Ok(())
    }

    pub fn layout(&self) -> Result<ShmLayout, LayoutError> {
        ShmLayout::new(self.max_flows, self.queue_capacity)
    }

    /// Directory of the shared region file
    pub fn shm_dir(&self) -> PathBuf {
        self.shm_dir.clone().unwrap_or_else(default_shm_dir)
    }

    /// Largest read handed to the core in one piece
    pub fn read_chunk(&self) -> usize {
        MAX_READ_CHUNK.min(self.queue_capacity.saturating_sub(1)).max(1)
    }

    pub fn shaped_options(&self) -> ShapedOptions {
        ShapedOptions {
            peer_role: self.role,
            fairness: self.shaper.fairness,
            association_window: Duration::from_millis(self.shaped.association_window_ms),
        }
    }

    pub fn unshaped_options(&self) -> UnshapedOptions {
        UnshapedOptions {
            peer_role: self.role,
            destination: self.unshaped.destination.clone(),
        }
    }

    pub fn shaped_intervals(&self) -> DriverIntervals {
        DriverIntervals {
            signal_poll: Duration::from_micros(self.shaped.signal_poll_interval_us),
            service: Duration::from_micros(self.shaped.service_interval_us),
        }
    }

    pub fn unshaped_intervals(&self) -> DriverIntervals {
        DriverIntervals {
            signal_poll: Duration::from_micros(self.unshaped.signal_poll_interval_us),
            service: Duration::from_micros(self.unshaped.check_queues_interval_us),
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

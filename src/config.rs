//! Adapter configuration
//!
//! Identity, resource budgets and timing of one adapter instance. The
//! defaults reproduce the reference device profile; every value can be
//! overridden from a TOML file or `ENIP_*` environment variables.
//!
//! A `Config` is validated once and then shared immutably by all
//! components, so several independently configured adapters can live in
//! one process.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionClass;
use crate::error::{AdapterError, Result};

/// Encapsulation protocol version supported by RegisterSession
pub const ENCAPSULATION_PROTOCOL_VERSION: u16 = 1;

/// Largest connection size a plain Forward_Open can request
pub const MAX_FORWARD_OPEN_SIZE: u16 = 511;

/// Smallest reply buffer able to hold a Forward_Open reply
pub const MIN_REPLY_BUFFER_SIZE: usize = 64;

/// Root configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device identity
    pub identity: IdentityConfig,

    /// Connection budgets and admission bounds
    pub connections: ConnectionLimits,

    /// Message buffer sizes and counts
    pub buffers: BufferConfig,

    /// Encapsulation session settings
    pub sessions: SessionConfig,

    /// Timer settings
    pub timing: TimingConfig,

    /// Run/idle header policy for cyclic data
    pub io: IoConfig,

    /// Assembly instances with special meaning in connection paths
    pub assemblies: AssemblyConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Identity of the device, reported by the Identity object and checked
/// against electronic keys
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub major_revision: u8,
    pub minor_revision: u8,
    pub serial_number: u32,
    pub device_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            vendor_id: 1,
            device_type: 12,
            product_code: 65001,
            major_revision: 1,
            minor_revision: 2,
            serial_number: 0,
            device_name: "amphibius goodie".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionLimits {
    /// Generic explicit (class 3) connections
    pub explicit: usize,

    /// Exclusive-owner I/O connections
    pub exclusive_owner: usize,

    /// Input-only I/O connections
    pub input_only: usize,

    /// Input-only consumers sharing one connection path
    pub input_only_per_path: usize,

    /// Listen-only I/O connections
    pub listen_only: usize,

    /// Listen-only consumers sharing one connection path
    pub listen_only_per_path: usize,

    /// Smallest accepted RPI (microseconds), 0 means one timer tick
    pub min_rpi_us: u32,

    /// Largest accepted RPI (microseconds)
    pub max_rpi_us: u32,

    /// Watchdog applied until the first packet arrives (milliseconds)
    pub initial_timeout_ms: u64,

    /// Upper 16 bits of generated connection IDs; random when unset
    pub incarnation_id: Option<u16>,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            explicit: 6,
            exclusive_owner: 5,
            input_only: 5,
            input_only_per_path: 3,
            listen_only: 5,
            listen_only_per_path: 3,
            min_rpi_us: 0,
            max_rpi_us: 10_000_000,
            initial_timeout_ms: 10_000,
            incarnation_id: None,
        }
    }
}

impl ConnectionLimits {
    /// Capacity of one connection class
    pub fn capacity(&self, class: ConnectionClass) -> usize {
        match class {
            ConnectionClass::ExclusiveOwner => self.exclusive_owner,
            ConnectionClass::InputOnly => self.input_only,
            ConnectionClass::ListenOnly => self.listen_only,
            ConnectionClass::Explicit => self.explicit,
        }
    }

    /// Consumers allowed on one path, `None` for classes without a sub-limit
    pub fn per_path_capacity(&self, class: ConnectionClass) -> Option<usize> {
        match class {
            ConnectionClass::InputOnly => Some(self.input_only_per_path),
            ConnectionClass::ListenOnly => Some(self.listen_only_per_path),
            _ => None,
        }
    }

    pub fn total(&self) -> usize {
        self.explicit + self.exclusive_owner + self.input_only + self.listen_only
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes available for reply data and produced data
    pub reply_buffer_size: usize,

    /// Bytes available for one received frame
    pub ethernet_buffer_size: usize,

    /// Outstanding reply buffers
    pub reply_buffers: usize,

    /// Outstanding production buffers
    pub produce_buffers: usize,

    /// Outstanding receive buffers
    pub receive_buffers: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            reply_buffer_size: 1000,
            ethernet_buffer_size: 1200,
            reply_buffers: 1,
            produce_buffers: 1,
            receive_buffers: 1,
        }
    }
}

/// What happens to connections when their session goes away
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Close every connection opened through the session
    #[default]
    CloseConnections,
    /// Keep the connections running without an owner until they time out
    Detach,
}

impl std::fmt::Display for TeardownPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownPolicy::CloseConnections => write!(f, "close_connections"),
            TeardownPolicy::Detach => write!(f, "detach"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Concurrent encapsulation sessions
    pub max_sessions: usize,

    /// Idle time before a session is evicted (seconds, 0 disables)
    pub idle_timeout_secs: u64,

    /// Encapsulation protocol version accepted by RegisterSession
    pub protocol_version: u16,

    /// Connection handling on session teardown
    pub teardown_policy: TeardownPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 20,
            idle_timeout_secs: 120,
            protocol_version: ENCAPSULATION_PROTOCOL_VERSION,
            teardown_policy: TeardownPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Timer tick period (microseconds)
    pub tick_us: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { tick_us: 10_000 }
    }
}

impl TimingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_micros(u64::from(self.tick_us))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Consumed (O->T) data starts with a 32-bit run/idle header
    pub consumed_has_run_idle_header: bool,

    /// Produced (T->O) data starts with a 32-bit run/idle header
    pub produced_has_run_idle_header: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            consumed_has_run_idle_header: true,
            produced_has_run_idle_header: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// O->T heartbeat instance selecting an input-only connection
    pub heartbeat_input_only: u32,

    /// O->T heartbeat instance selecting a listen-only connection
    pub heartbeat_listen_only: u32,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            heartbeat_input_only: 152,
            heartbeat_listen_only: 153,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Include the module target in log lines
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AdapterError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| AdapterError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize configuration to a TOML string
    pub fn to_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AdapterError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_string()?;
        std::fs::write(path.as_ref(), content).map_err(|e| {
            AdapterError::Config(format!("Failed to write config file: {}", e))
        })
    }

    /// Apply environment variable overrides.
    ///
    /// Supported variables:
    /// - ENIP_LOG_LEVEL
    /// - ENIP_MAX_SESSIONS, ENIP_SESSION_IDLE_TIMEOUT_SECS
    /// - ENIP_TEARDOWN_POLICY (close_connections, detach)
    /// - ENIP_TICK_US
    /// - ENIP_INCARNATION_ID
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ENIP_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env_parse("ENIP_MAX_SESSIONS") {
            self.sessions.max_sessions = v;
        }
        if let Some(v) = env_parse("ENIP_SESSION_IDLE_TIMEOUT_SECS") {
            self.sessions.idle_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("ENIP_TEARDOWN_POLICY") {
            match v.as_str() {
                "close_connections" => self.sessions.teardown_policy = TeardownPolicy::CloseConnections,
                "detach" => self.sessions.teardown_policy = TeardownPolicy::Detach,
                other => tracing::warn!("Ignoring unknown ENIP_TEARDOWN_POLICY {:?}", other),
            }
        }
        if let Some(v) = env_parse("ENIP_TICK_US") {
            self.timing.tick_us = v;
        }
        if let Some(v) = env_parse("ENIP_INCARNATION_ID") {
            self.connections.incarnation_id = Some(v);
        }
    }

    /// Check the budgets for consistency
    pub fn validate(&self) -> Result<()> {
        let c = &self.connections;
        let fail = |msg: String| Err(AdapterError::Config(msg));

        if self.timing.tick_us == 0 {
            return fail("timing.tick_us must be non-zero".into());
        }
        if self.sessions.max_sessions == 0 {
            return fail("sessions.max_sessions must be non-zero".into());
        }
        if self.sessions.max_sessions > u32::MAX as usize - 1 {
            return fail("sessions.max_sessions does not fit a session handle".into());
        }
        if c.total() == 0 {
            return fail("at least one connection class needs capacity".into());
        }
        // Each connection holds at most two IDs from the 16-bit counter
        if c.total() >= usize::from(u16::MAX) / 2 {
            return fail(format!(
                "connection budget {} exceeds the connection ID space",
                c.total()
            ));
        }
        for class in [ConnectionClass::InputOnly, ConnectionClass::ListenOnly] {
            if let Some(per_path) = c.per_path_capacity(class) {
                if c.capacity(class) > 0 && per_path == 0 {
                    return fail(format!("{} per-path capacity must be non-zero", class));
                }
                if per_path > c.capacity(class) {
                    return fail(format!(
                        "{} per-path capacity {} exceeds class capacity {}",
                        class,
                        per_path,
                        c.capacity(class)
                    ));
                }
            }
        }
        if c.max_rpi_us < self.min_rpi_us() {
            return fail(format!(
                "connections.max_rpi_us {} is below the minimum RPI {}",
                c.max_rpi_us,
                self.min_rpi_us()
            ));
        }
        let b = &self.buffers;
        if b.reply_buffer_size < MIN_REPLY_BUFFER_SIZE {
            return fail(format!(
                "buffers.reply_buffer_size must be at least {}",
                MIN_REPLY_BUFFER_SIZE
            ));
        }
        if b.ethernet_buffer_size < b.reply_buffer_size {
            return fail("buffers.ethernet_buffer_size must hold a full reply".into());
        }
        if b.reply_buffers == 0 || b.produce_buffers == 0 || b.receive_buffers == 0 {
            return fail("every buffer purpose needs at least one buffer".into());
        }
        if self.assemblies.heartbeat_input_only == self.assemblies.heartbeat_listen_only {
            return fail("input-only and listen-only heartbeat instances must differ".into());
        }
        Ok(())
    }

    /// Effective minimum RPI; never below one timer tick
    pub fn min_rpi_us(&self) -> u32 {
        self.connections.min_rpi_us.max(self.timing.tick_us)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_reference_profile() {
        let config = Config::default();
        assert_eq!(config.identity.vendor_id, 1);
        assert_eq!(config.identity.device_type, 12);
        assert_eq!(config.identity.product_code, 65001);
        assert_eq!(config.identity.device_name, "amphibius goodie");
        assert_eq!(config.connections.explicit, 6);
        assert_eq!(config.connections.exclusive_owner, 5);
        assert_eq!(config.connections.input_only_per_path, 3);
        assert_eq!(config.buffers.reply_buffer_size, 1000);
        assert_eq!(config.buffers.ethernet_buffer_size, 1200);
        assert_eq!(config.sessions.max_sessions, 20);
        assert_eq!(config.timing.tick(), Duration::from_millis(10));
        assert!(config.io.consumed_has_run_idle_header);
        assert!(!config.io.produced_has_run_idle_header);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = config.to_string().unwrap();
        let parsed = Config::from_str(&toml_str).unwrap();
        assert_eq!(parsed.identity, config.identity);
        assert_eq!(parsed.sessions.teardown_policy, TeardownPolicy::CloseConnections);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed = Config::from_str(
            r#"
            [connections]
            exclusive_owner = 2

            [sessions]
            teardown_policy = "detach"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.connections.exclusive_owner, 2);
        assert_eq!(parsed.connections.input_only, 5);
        assert_eq!(parsed.sessions.teardown_policy, TeardownPolicy::Detach);
        assert_eq!(parsed.identity.product_code, 65001);
    }

    #[test]
    fn test_validate_rejects_inconsistent_budgets() {
        let mut config = Config::default();
        config.connections.input_only_per_path = 9;
        assert!(matches!(config.validate(), Err(AdapterError::Config(_))));

        let mut config = Config::default();
        config.timing.tick_us = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.buffers.produce_buffers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.assemblies.heartbeat_listen_only = config.assemblies.heartbeat_input_only;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connections.explicit = 40_000;
        assert!(matches!(config.validate(), Err(AdapterError::Config(_))));
    }

    #[test]
    fn test_min_rpi_never_below_tick() {
        let mut config = Config::default();
        config.connections.min_rpi_us = 1_000;
        assert_eq!(config.min_rpi_us(), 10_000);
        config.connections.min_rpi_us = 50_000;
        assert_eq!(config.min_rpi_us(), 50_000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.toml");

        let mut config = Config::default();
        config.connections.exclusive_owner = 2;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.connections.exclusive_owner, 2);
    }
}

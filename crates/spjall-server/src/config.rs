//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (`SPJALL_HOST`, `SPJALL_PORT`, `APP_URL`)
//! - TOML configuration file, searched in the usual places or given
//!   with `--config <path>`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spjall_core::{HubConfig, RouterConfig};
use spjall_transport::TcpConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Connection timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Admin HTTP endpoints.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Invite links.
    #[serde(default)]
    pub invites: InvitesConfig,

    /// Accounts loaded into the in-memory store at startup.
    #[serde(default)]
    pub users: Vec<SeedUser>,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum frame payload in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum chat message length in characters.
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    /// History page size when the client sends none.
    #[serde(default = "default_history_limit")]
    pub default_history_limit: i64,

    /// Largest history page.
    #[serde(default = "default_max_history_limit")]
    pub max_history_limit: i64,

    /// Outbound writes queued per connection before it is dropped.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Transport events queued for the event loop.
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

/// Timeout configuration. All values are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Time allowed to complete the upgrade.
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,

    /// Time allowed between upgrade and a successful `auth`.
    #[serde(default = "default_auth_ms")]
    pub auth_ms: u64,

    /// Close connections that sent nothing for this long; 0 disables.
    #[serde(default)]
    pub idle_ms: u64,

    /// Deadline for a single socket write.
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,

    /// How often timeouts are checked.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Admin endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_admin_host")]
    pub host: String,

    #[serde(default = "default_admin_port")]
    pub port: u16,
}

/// Invite link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitesConfig {
    /// Base of redemption URLs, `<base_url>/join/<code>`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

/// A user account created at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub nickname: String,
    pub token: String,
}

// Default value functions
fn default_host() -> String {
    std::env::var("SPJALL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("SPJALL_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_base_url() -> String {
    std::env::var("APP_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_message_chars() -> usize {
    4000
}

fn default_history_limit() -> i64 {
    50
}

fn default_max_history_limit() -> i64 {
    100
}

fn default_outbound_queue() -> usize {
    256
}

fn default_event_queue() -> usize {
    1024
}

fn default_handshake_ms() -> u64 {
    10_000
}

fn default_auth_ms() -> u64 {
    30_000
}

fn default_write_ms() -> u64 {
    10_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8081
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            metrics: MetricsConfig::default(),
            admin: AdminConfig::default(),
            invites: InvitesConfig::default(),
            users: Vec::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            max_message_chars: default_max_message_chars(),
            default_history_limit: default_history_limit(),
            max_history_limit: default_max_history_limit(),
            outbound_queue: default_outbound_queue(),
            event_queue: default_event_queue(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            handshake_ms: default_handshake_ms(),
            auth_ms: default_auth_ms(),
            idle_ms: 0,
            write_ms: default_write_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_admin_host(),
            port: default_admin_port(),
        }
    }
}

impl Default for InvitesConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, a default path, or
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the explicit file is missing, or if a config
    /// file exists but cannot be parsed.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
            return Self::from_file(expanded);
        }

        let config_paths = [
            "spjall.toml",
            "/etc/spjall/spjall.toml",
            "~/.config/spjall/spjall.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.host, self.port)
    }

    /// Get the admin endpoint address.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.admin.host, self.admin.port)
    }

    /// Hub settings derived from limits and timeouts.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.limits.max_connections,
            max_payload: self.limits.max_frame_size,
            handshake_timeout: Duration::from_millis(self.timeouts.handshake_ms),
            auth_timeout: Duration::from_millis(self.timeouts.auth_ms),
            idle_timeout: (self.timeouts.idle_ms > 0)
                .then(|| Duration::from_millis(self.timeouts.idle_ms)),
            router: RouterConfig {
                max_content_chars: self.limits.max_message_chars,
                default_history_limit: self.limits.default_history_limit,
                max_history_limit: self.limits.max_history_limit,
            },
        }
    }

    /// Socket task settings.
    #[must_use]
    pub fn tcp_config(&self) -> TcpConfig {
        TcpConfig {
            outbound_capacity: self.limits.outbound_queue,
            write_timeout: Duration::from_millis(self.timeouts.write_ms),
            ..TcpConfig::default()
        }
    }

    /// Interval between timeout sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.sweep_interval_ms.max(1))
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid listen address {host}:{port}"))
}

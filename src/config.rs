use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Relay configuration, loaded from environment variables
// ---------------------------------------------------------------------------

/// Relay server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `RELAY_`. Defaults are suitable for local development.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    // ── Network ─────────────────────────────────────────────────────────
    pub bind_host: String,
    pub port: u16,

    // ── TLS ─────────────────────────────────────────────────────────────
    /// Terminate TLS inside the binary (falls back to HTTP if the PEM files
    /// are missing).
    pub tls_enabled: bool,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,

    // ── Privacy / hardening ─────────────────────────────────────────────
    /// Redirect plain-HTTP page requests to HTTPS.
    pub force_https: bool,
    /// Mask session ids in logs and add privacy headers to responses.
    pub ip_masking: bool,
    /// Only forward offer/answer/ICE between members of the same room.
    pub enforce_membership: bool,

    // ── CORS ─────────────────────────────────────────────────────────────
    pub allowed_origins: String,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log: LogSettings,
}

impl RelayConfig {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let port = env_parse("RELAY_PORT", 3001u16);
        let config = RelayConfig {
            bind_host: env_or("RELAY_BIND_HOST", "0.0.0.0"),
            port,
            tls_enabled: env_bool("RELAY_ENABLE_TLS", false),
            tls_cert_path: PathBuf::from(env_or("RELAY_TLS_CERT_PATH", "ssl/cert.pem")),
            tls_key_path: PathBuf::from(env_or("RELAY_TLS_KEY_PATH", "ssl/key.pem")),
            force_https: env_bool("RELAY_FORCE_HTTPS", false),
            ip_masking: env_bool("RELAY_IP_MASKING", false),
            enforce_membership: env_bool("RELAY_ENFORCE_MEMBERSHIP", false),
            allowed_origins: env_or("RELAY_ALLOWED_ORIGINS", "*"),
            log: LogSettings::from_env(),
        };

        config
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// TLS is only served when requested *and* both PEM files exist.
    pub fn tls_material_present(&self) -> bool {
        self.tls_cert_path.exists() && self.tls_key_path.exists()
    }

    /// Print the effective configuration. Call once tracing is installed.
    pub fn log_summary(&self) {
        info!("──── Relay Configuration ────");
        info!("  bind_addr          : {}", self.bind_addr());
        info!("  tls_enabled        : {}", self.tls_enabled);
        if self.tls_enabled {
            info!("  tls_cert_path      : {}", self.tls_cert_path.display());
            info!("  tls_key_path       : {}", self.tls_key_path.display());
        }
        info!("  force_https        : {}", self.force_https);
        info!("  ip_masking         : {}", self.ip_masking);
        info!("  enforce_membership : {}", self.enforce_membership);
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level          : {}", self.log.level);
        info!("  log_format         : {}", self.log.format.as_str());
        info!("─────────────────────────────");
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            bind_host: "0.0.0.0".into(),
            port: 3001,
            tls_enabled: false,
            tls_cert_path: PathBuf::from("ssl/cert.pem"),
            tls_key_path: PathBuf::from("ssl/key.pem"),
            force_https: false,
            ip_masking: false,
            enforce_membership: false,
            allowed_origins: "*".into(),
            log: LogSettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines with file and line numbers.
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

impl LogFormat {
    /// `production` deployments log JSON; every other environment name is
    /// treated as development.
    pub fn for_environment(env: &str) -> Self {
        if env.trim().eq_ignore_ascii_case("production") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

/// Shared by both binaries: `RELAY_LOG_LEVEL` and `RELAY_ENV`.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn from_env() -> Self {
        LogSettings {
            level: env_or("RELAY_LOG_LEVEL", "info"),
            format: LogFormat::for_environment(&env_or("RELAY_ENV", "development")),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: "info".into(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_STUN_URLS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Settings consumed by the call-side components (transport, negotiation,
/// capture).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL (`http(s)://` or `ws(s)://`).
    pub signaling_url: String,
    pub stun_urls: Vec<String>,
    /// Reconnection attempts after a transport loss before giving up.
    pub reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Optional bound on reaching `connected`; `None` waits for the
    /// transport's own failure signal.
    pub peer_connect_timeout: Option<Duration>,
    pub audio_device: Option<PathBuf>,
    pub video_device: Option<PathBuf>,
    /// Informational user id sent with `join-room`.
    pub user_id: Option<String>,
    pub log: LogSettings,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let timeout_secs = env_parse("RELAY_PEER_CONNECT_TIMEOUT_SECS", 0u64);

        ClientConfig {
            signaling_url: env_or("RELAY_SIGNALING_URL", "http://localhost:3001"),
            stun_urls: env_csv("RELAY_STUN_URLS", &DEFAULT_STUN_URLS),
            reconnect_attempts: env_parse("RELAY_RECONNECT_ATTEMPTS", 5u32),
            reconnect_delay: Duration::from_millis(env_parse("RELAY_RECONNECT_DELAY_MS", 1000u64)),
            peer_connect_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            audio_device: std::env::var("RELAY_AUDIO_DEVICE").ok().map(PathBuf::from),
            video_device: std::env::var("RELAY_VIDEO_DEVICE").ok().map(PathBuf::from),
            user_id: std::env::var("RELAY_USER_ID").ok().filter(|s| !s.is_empty()),
            log: LogSettings::from_env(),
        }
    }

    /// Print the effective configuration. Call once tracing is installed.
    pub fn log_summary(&self) {
        info!(
            signaling_url = %self.signaling_url,
            stun_servers = self.stun_urls.len(),
            reconnect_attempts = self.reconnect_attempts,
            reconnect_delay_ms = self.reconnect_delay.as_millis() as u64,
            connect_timeout_secs = self.peer_connect_timeout.map_or(0, |t| t.as_secs()),
            "client configuration"
        );
        if self.stun_urls.is_empty() {
            warn!("No STUN servers configured; peers behind NAT may fail to connect");
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            signaling_url: "http://localhost:3001".into(),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            peer_connect_timeout: None,
            audio_device: None,
            video_device: None,
            user_id: None,
            log: LogSettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => parse_bool(&v),
        Err(_) => default,
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_csv(key: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => split_csv(&v),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

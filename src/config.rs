use anyhow::{Context, Result};
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub sip_bind_ip: String,
    pub sip_port: u16,
    pub listener: ListenerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let sip_bind_ip =
            std::env::var("SIP_BIND_IP").unwrap_or_else(|_| "0.0.0.0".to_string());
        let sip_port = match std::env::var("SIP_PORT") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("SIP_PORT is not a valid port: {:?}", v))?,
            Err(_) => 5060,
        };

        Ok(Self {
            sip_bind_ip,
            sip_port,
            listener: ListenerConfig::from_env(),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.sip_bind_ip, self.sip_port)
    }
}

/// Tunables of the TCP/UDP listener.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// How long a branch suppresses retransmissions of the same request.
    pub branch_retention: Duration,
    /// Period of the background sweep over remembered branches.
    pub branch_sweep_interval: Duration,
    /// Idle limit for accepted TCP connections; `None` keeps them open.
    pub tcp_idle: Option<Duration>,
    /// UDP pool size at which a capacity warning is logged (and every multiple of it).
    pub udp_pool_warn: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            branch_retention: Duration::from_secs(30),
            branch_sweep_interval: Duration::from_secs(10),
            tcp_idle: None,
            udp_pool_warn: 10_000,
        }
    }
}

impl ListenerConfig {
    pub fn from_env() -> Self {
        // Env: SIP_BRANCH_RETENTION_MS / SIP_BRANCH_SWEEP_MS / SIP_TCP_IDLE_TIMEOUT_MS / SIP_UDP_POOL_WARN
        let defaults = Self::default();
        Self {
            branch_retention: env_duration_ms("SIP_BRANCH_RETENTION_MS")
                .unwrap_or(defaults.branch_retention),
            branch_sweep_interval: env_duration_ms("SIP_BRANCH_SWEEP_MS")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.branch_sweep_interval),
            tcp_idle: env_duration_ms("SIP_TCP_IDLE_TIMEOUT_MS").filter(|d| !d.is_zero()),
            udp_pool_warn: std::env::var("SIP_UDP_POOL_WARN")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.udp_pool_warn),
        }
    }
}

fn env_duration_ms(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl LoggingConfig {
    fn from_env() -> Self {
        let format = match std::env::var("LOG_FORMAT").ok().as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        Self { format }
    }
}

static LOGGING: OnceLock<LoggingConfig> = OnceLock::new();

pub fn logging_config() -> &'static LoggingConfig {
    LOGGING.get_or_init(LoggingConfig::from_env)
}

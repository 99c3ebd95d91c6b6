use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::remote::ExecutorConfig;
use crate::waiter::PollSettings;

const DEFAULT_HTTP_PORT: u16 = 3000;
const DEFAULT_TORRSERVER_URL: &str = "http://localhost:8090";
const DEFAULT_METADATA_MAX_ATTEMPTS: u32 = 60;
const DEFAULT_METADATA_ATTEMPT_DELAY_MS: u64 = 1_000;
const DEFAULT_METADATA_SETTLE_MS: u64 = 500;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_RESPONSE_MAX_BYTES: usize = 5 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Config {
    // Web
    pub http_addr: Option<SocketAddr>,
    pub http_port: u16,
    pub static_dir: PathBuf,

    // TorrServer
    pub torrserver_url: String,
    pub torrserver_username: String,
    pub torrserver_password: String,
    pub request_timeout_ms: u64,
    pub response_max_bytes: usize,

    // Metadata wait
    pub metadata_max_attempts: u32,
    pub metadata_attempt_delay_ms: u64,
    pub metadata_settle_ms: u64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> anyhow::Result<Self> {
        let http_addr = parse_http_addr(env_opt_string("HTTP_ADDR"))?;
        let http_port = nonzero_or(env_u16("HTTP_PORT", DEFAULT_HTTP_PORT), DEFAULT_HTTP_PORT);
        let static_dir = PathBuf::from(env_string("STATIC_DIR", "public"));

        let torrserver_url = env_string("TORRSERVER_URL", DEFAULT_TORRSERVER_URL)
            .trim_end_matches('/')
            .to_string();
        if !torrserver_url.starts_with("http://") && !torrserver_url.starts_with("https://") {
            anyhow::bail!("TORRSERVER_URL must be an http(s) URL, got {torrserver_url:?}");
        }
        let torrserver_username = env_string("TORRSERVER_USERNAME", "");
        let torrserver_password = env_string("TORRSERVER_PASSWORD", "");
        let request_timeout_ms = env_u64("TORRSERVER_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS);
        let response_max_bytes = nonzero_or(
            env_usize("TORRSERVER_RESPONSE_MAX_BYTES", DEFAULT_RESPONSE_MAX_BYTES),
            DEFAULT_RESPONSE_MAX_BYTES,
        );

        let metadata_max_attempts = nonzero_or(
            env_u32("TORRSERVER_METADATA_MAX_ATTEMPTS", DEFAULT_METADATA_MAX_ATTEMPTS),
            DEFAULT_METADATA_MAX_ATTEMPTS,
        );
        let metadata_attempt_delay_ms = nonzero_or(
            env_u64("TORRSERVER_METADATA_ATTEMPT_DELAY", DEFAULT_METADATA_ATTEMPT_DELAY_MS),
            DEFAULT_METADATA_ATTEMPT_DELAY_MS,
        );
        let metadata_settle_ms = env_u64("TORRSERVER_METADATA_SETTLE_MS", DEFAULT_METADATA_SETTLE_MS);

        Ok(Self {
            http_addr,
            http_port,
            static_dir,

            torrserver_url,
            torrserver_username,
            torrserver_password,
            request_timeout_ms,
            response_max_bytes,

            metadata_max_attempts,
            metadata_attempt_delay_ms,
            metadata_settle_ms,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.http_addr
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.http_port)))
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            base_url: self.torrserver_url.clone(),
            username: self.torrserver_username.clone(),
            password: self.torrserver_password.clone(),
            deadline: (self.request_timeout_ms > 0)
                .then(|| Duration::from_millis(self.request_timeout_ms)),
            max_body_bytes: self.response_max_bytes,
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            max_attempts: self.metadata_max_attempts,
            interval: Duration::from_millis(self.metadata_attempt_delay_ms),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.metadata_settle_ms)
    }

    pub fn banner(&self) {
        let authentication =
            if self.torrserver_username.is_empty() && self.torrserver_password.is_empty() {
                "disabled"
            } else {
                "enabled"
            };
        tracing::info!("Lampa Tracks FFprobe API Server");
        tracing::info!(
            port = self.http_port,
            torrserver = %self.torrserver_url,
            authentication,
            max_wait_secs = max_wait_secs(self.metadata_max_attempts, self.metadata_attempt_delay_ms),
            "config"
        );
    }
}

/// Upper bound of a metadata wait with the given settings, in whole seconds.
pub fn max_wait_secs(max_attempts: u32, attempt_delay_ms: u64) -> u64 {
    (u64::from(max_attempts) * attempt_delay_ms + 500) / 1_000
}

fn parse_http_addr(raw: Option<String>) -> anyhow::Result<Option<SocketAddr>> {
    raw.map(|s| SocketAddr::from_str(&s).with_context(|| format!("parse HTTP_ADDR {s:?}")))
        .transpose()
}

fn nonzero_or<T: PartialEq + Default>(value: T, default: T) -> T {
    if value == T::default() { default } else { value }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

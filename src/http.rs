use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

const USER_AGENT: &str = concat!("product-discovery/", env!("CARGO_PKG_VERSION"));

/// Client-wide limits. Image downloads put a tighter per-request timeout on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(15),
            connect: Duration::from_secs(5),
        }
    }
}

impl HttpTimeouts {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request: secs_env("HTTP_TIMEOUT_SECS").unwrap_or(defaults.request),
            connect: secs_env("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(defaults.connect),
        }
    }
}

static TIMEOUTS: Lazy<HttpTimeouts> = Lazy::new(HttpTimeouts::from_env);

/// Client for the catalog, image and vision calls, using the process-wide timeouts.
pub fn build_client() -> Client {
    client_with(*TIMEOUTS)
}

pub fn client_with(timeouts: HttpTimeouts) -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeouts.request)
        .connect_timeout(timeouts.connect)
        .build()
        .unwrap_or_else(|err| {
            warn!(target = "discovery.http", error = %err, "client_builder_failed");
            Client::new()
        })
}

fn secs_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

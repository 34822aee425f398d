use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("logistics-watch/", env!("CARGO_PKG_VERSION"));

fn secs_from_env(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Shared outbound client for the marketplace, PostgREST and chat APIs.
pub fn build_client() -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(secs_from_env("HTTP_TIMEOUT_SECS", 30))
        .connect_timeout(secs_from_env("HTTP_CONNECT_TIMEOUT_SECS", 5))
        .build()
        .unwrap_or_else(|_| Client::new())
}

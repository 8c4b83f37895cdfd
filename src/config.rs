use clap::Parser;
use std::time::Duration;

/// Controller settings. Every field can come from a flag or from the environment.
#[derive(Parser, Clone, Debug)]
pub struct Config {
    #[clap(long, env = "BAOTA_URL", default_value = "http://127.0.0.1:8888", help = "Panel base URL")]
    pub baota_url: String,

    #[clap(long, env = "BAOTA_API_KEY", hide_env_values = true, help = "Panel API key used to sign requests")]
    pub baota_api_key: String,

    #[clap(long, env = "DDNS_HOST", default_value = "home.example.com", help = "Upstream host the proxies point at")]
    pub ddns_host: String,

    #[clap(
        long,
        env = "DEFAULT_PORT",
        default_value = "38333",
        help = "Upstream port when an Ingress carries no ddns-port annotation"
    )]
    pub default_port: String,

    #[clap(
        long = "sync-interval",
        env = "SYNC_INTERVAL_SEC",
        default_value = "30",
        value_parser = parse_seconds,
        help = "Seconds to wait between two reconciliation passes"
    )]
    pub sync_interval: Duration,

    #[clap(
        long,
        env = "DEEP_CHECK_EVERY",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Enumerate panel sites (and propagate panel-side deletions) on the first and every N-th pass"
    )]
    pub deep_check_every: u64,
}

impl Config {
    /// Upstream URL for an Ingress, honouring a non-empty port override.
    pub fn upstream_for(&self, port_override: Option<&str>) -> String {
        let port = match port_override {
            Some(port) if !port.is_empty() => port,
            _ => self.default_port.as_str(),
        };
        format!("http://{}:{}", self.ddns_host, port)
    }
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|err| format!("expected a whole number of seconds: {err}"))
}

/// Pauses inserted around panel writes. The panel rewrites files and reloads its front proxy
/// after each change, so writes are spaced out instead of fired back to back.
#[derive(Clone, Copy, Debug)]
pub struct Timings {
    /// Between AddSite and CreateProxy.
    pub debounce: Duration,
    /// How long a failure message stays visible in the progress cache.
    pub failure_linger: Duration,
    /// After a successful proxy write, before the next target.
    pub reload_cooldown: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1500),
            failure_linger: Duration::from_secs(2),
            reload_cooldown: Duration::from_secs(3),
        }
    }
}

impl Timings {
    pub fn none() -> Self {
        Self {
            debounce: Duration::ZERO,
            failure_linger: Duration::ZERO,
            reload_cooldown: Duration::ZERO,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        baota_url: "http://127.0.0.1:8888".to_string(),
        baota_api_key: "secret".to_string(),
        ddns_host: "home.example.com".to_string(),
        default_port: "38333".to_string(),
        sync_interval: Duration::from_secs(30),
        deep_check_every: 10,
    }
}

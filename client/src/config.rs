//! Discovery and connection settings resolved from the environment.
//!
//! Every knob has a default that works on a typical LAN; environment
//! variables exist so testers and unusual setups can pin things down
//! without rebuilding. `HOST` is special: its mere presence switches the
//! client from broadcast discovery to a fixed address.

use log::warn;
use shared::{DEFAULT_DISCOVERY_PORT, DEFAULT_SERVER_PORT};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How long one listening pass waits for a beacon.
const PASS_TIMEOUT_SECS: u64 = 10;
/// Gap between listening passes.
const RETRY_INTERVAL_SECS: u64 = 2;
/// Searching budget before the localhost fallback may fire.
const FORCE_TIMEOUT_SECS: u64 = 20;
/// Consecutive UDP ports covered by the discovery listeners.
const PORT_SPAN: u16 = 4;

#[derive(Debug, Clone)]
pub struct Config {
    /// First UDP port the discovery listeners bind.
    pub discovery_port: u16,
    /// How many consecutive ports the listeners cover.
    pub port_span: u16,
    /// How long one listening pass waits before giving up.
    pub pass_timeout: Duration,
    /// Pause between listening passes.
    pub retry_interval: Duration,
    /// How long a search may run before the fallback fires.
    pub force_timeout: Duration,
    /// Whether falling back to localhost is permitted at all.
    pub localhost_fallback: bool,
    /// Fixed server address taken from `HOST`/`SERVER_PORT`.
    pub env_override: Option<(String, u16)>,
    /// Port assumed by the localhost fallback.
    pub default_server_port: u16,
}

impl Config {
    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Self {
        let default_server_port = env_value("SERVER_PORT", DEFAULT_SERVER_PORT);
        let env_override = env::var("HOST")
            .ok()
            .filter(|host| !host.is_empty())
            .map(|host| (host, default_server_port));

        Self {
            discovery_port: env_value("DISCOVERY_PORT", DEFAULT_DISCOVERY_PORT),
            port_span: env_value("DISCOVERY_PORT_SPAN", PORT_SPAN).max(1),
            pass_timeout: Duration::from_secs(PASS_TIMEOUT_SECS),
            retry_interval: Duration::from_secs(env_value(
                "DISCOVERY_RETRY_INTERVAL",
                RETRY_INTERVAL_SECS,
            )),
            force_timeout: Duration::from_secs(env_value(
                "DISCOVERY_FORCE_TIMEOUT",
                FORCE_TIMEOUT_SECS,
            )),
            localhost_fallback: env_truthy("LOCALHOST_FALLBACK", true),
            env_override,
            default_server_port,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            port_span: PORT_SPAN,
            pass_timeout: Duration::from_secs(PASS_TIMEOUT_SECS),
            retry_interval: Duration::from_secs(RETRY_INTERVAL_SECS),
            force_timeout: Duration::from_secs(FORCE_TIMEOUT_SECS),
            localhost_fallback: true,
            env_override: None,
            default_server_port: DEFAULT_SERVER_PORT,
        }
    }
}

fn env_value<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {} value '{}'", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_truthy(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => raw.to_lowercase() == "true",
        Err(_) => default,
    }
}

use std::env;
use std::time::Duration;

use log::warn;

const DEFAULT_PORT: u16 = 2052;
const DEFAULT_ROOM_EXPIRY_SECS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Clone, Debug)]
pub struct TlsPaths {
    pub cert_path: String,
    pub key_path: String,
}

/// Runtime configuration read from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Inactivity window after which the sweeper reclaims a room.
    pub room_expiry: Duration,
    pub sweep_interval: Duration,
    /// Endpoint of the external AI analysis collaborator, if configured.
    pub analysis_url: Option<String>,
    pub tls: Option<TlsPaths>,
}

impl Config {
    pub fn from_env() -> Self {
        let port = parse_var("PORT", DEFAULT_PORT);
        let room_expiry =
            Duration::from_secs(parse_var("ROOM_EXPIRY_SECS", DEFAULT_ROOM_EXPIRY_SECS));
        let sweep_interval =
            Duration::from_secs(parse_var("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS));
        let analysis_url = env::var("ANALYSIS_URL").ok().filter(|v| !v.is_empty());

        let tls = match (env::var("TLS_CERT_PATH"), env::var("TLS_KEY_PATH")) {
            (Ok(cert_path), Ok(key_path)) => Some(TlsPaths { cert_path, key_path }),
            _ => None,
        };

        Config {
            port,
            room_expiry,
            sweep_interval,
            analysis_url,
            tls,
        }
    }
}

fn parse_var<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {}={}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

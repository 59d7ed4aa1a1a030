use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 8080;

/// Reactor and socket tunables.
#[derive(Serialize, Deserialize, Clone)]
pub struct Server {
    pub address: String,
    pub max_clients: usize,
    pub max_events: usize,
    pub poll_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    pub stats_interval_secs: u64,
}

/// Per connection admission and congestion tunables.
#[derive(Serialize, Deserialize, Clone)]
pub struct Limits {
    pub rate_window_secs: u64,
    pub max_msgs_per_window: u32,
    pub max_queue_depth: u32,
    pub slow_start_threshold: u32,
    pub idle_timeout_secs: u64,
    pub throttle_idle_secs: u64,
}

/// Detector tunables.
#[derive(Serialize, Deserialize, Clone)]
pub struct Detection {
    pub flow_cache_size: usize,
    pub flow_timeout_secs: u64,
    pub history_size: usize,
    pub learning_rate: f64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub server: Server,
    pub limits: Limits,
    pub detection: Detection,
}

impl Default for GatewayConfig {
    fn default() -> GatewayConfig {
        GatewayConfig {
            server: Server {
                address: format!("0.0.0.0:{}", DEFAULT_PORT),
                max_clients: 10_000,
                max_events: 1000,
                poll_timeout_ms: 1000,
                sweep_interval_secs: 30,
                stats_interval_secs: 60,
            },
            limits: Limits {
                rate_window_secs: 1,
                max_msgs_per_window: 100,
                max_queue_depth: 1000,
                slow_start_threshold: 64,
                idle_timeout_secs: 60,
                throttle_idle_secs: 5,
            },
            detection: Detection {
                flow_cache_size: 1024,
                flow_timeout_secs: 300,
                history_size: 1000,
                learning_rate: 0.1,
            },
        }
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> GatewayConfig {
        serdeconv::from_toml_file(path).expect("Error loading gateway configuration file")
    }

    /// Loads the configuration from the supplied path, falling back to the
    /// defaults when no path is given.
    pub fn load_or_default(path: Option<&str>) -> GatewayConfig {
        match path {
            Some(path) => Self::load(path),
            _ => GatewayConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();

        assert_eq!(config.server.address, "0.0.0.0:8080");
        assert_eq!(config.server.max_clients, 10_000);
        assert_eq!(config.limits.max_msgs_per_window, 100);
        assert_eq!(config.limits.slow_start_threshold, 64);
        assert_eq!(config.detection.flow_cache_size, 1024);
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = GatewayConfig::load_or_default(None);

        assert_eq!(config.limits.max_queue_depth, 1000);
    }

    #[test]
    fn test_round_trip_toml() {
        let config = GatewayConfig::default();
        let raw = serdeconv::to_toml_string(&config).unwrap();
        let parsed: GatewayConfig = serdeconv::from_toml_str(&raw).unwrap();

        assert_eq!(parsed.server.address, config.server.address);
        assert_eq!(parsed.detection.history_size, config.detection.history_size);
    }
}

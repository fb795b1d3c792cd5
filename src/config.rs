use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::broker::BrokerConfig;
use crate::buffer::BufferConfig;
use crate::constants::{
    DEFAULT_AVERAGE_WINDOW, DEFAULT_FLUSH_THRESHOLD, DEFAULT_HISTORY_SIZE,
    DEFAULT_MEASUREMENT_NOISE, DEFAULT_PROCESS_NOISE, DEFAULT_REFERENCE_LAT,
    DEFAULT_REFERENCE_LON, DEFAULT_RELAY_QUEUE, SESSION_QUEUE_CAPACITY, WELCOME_MESSAGE,
};
use crate::filter::{FilterMode, FilterParams};
use crate::geodesy::{ReferenceError, ReferencePoint};

/// LOCUS relay configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address for WebSocket clients and the HTTP endpoints.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Also accept line-delimited JSON clients over raw TCP on this address (repeatable).
    #[arg(long, value_name = "ADDR")]
    pub tcp_listen: Vec<SocketAddr>,

    /// Latitude of the local origin.
    #[arg(long, default_value_t = DEFAULT_REFERENCE_LAT, allow_negative_numbers = true)]
    pub reference_lat: f64,

    /// Longitude of the local origin.
    #[arg(long, default_value_t = DEFAULT_REFERENCE_LON, allow_negative_numbers = true)]
    pub reference_lon: f64,

    /// Smoothing applied to GPS fixes after projection.
    #[arg(long, value_enum, default_value_t = FilterMode::Kalman)]
    pub filter_mode: FilterMode,

    /// Kalman process noise (Q).
    #[arg(long, default_value_t = DEFAULT_PROCESS_NOISE)]
    pub process_noise: f64,

    /// Kalman measurement noise (R).
    #[arg(long, default_value_t = DEFAULT_MEASUREMENT_NOISE)]
    pub measurement_noise: f64,

    /// Moving-average window, in positions.
    #[arg(long, default_value_t = DEFAULT_AVERAGE_WINDOW)]
    pub average_window: usize,

    /// Buffered records that force a flush to storage.
    #[arg(long, default_value_t = DEFAULT_FLUSH_THRESHOLD)]
    pub flush_threshold: usize,

    /// Periodic flush interval in seconds.
    #[arg(long, default_value_t = 5)]
    pub flush_interval_secs: u64,

    /// Heartbeat probe interval in seconds.
    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Published records kept in memory for /locations.
    #[arg(long, default_value_t = DEFAULT_HISTORY_SIZE)]
    pub history_size: usize,

    /// Persist records to this JSON-lines file. In-memory storage when unset.
    #[arg(long, env = "LOCUS_STORE_FILE", value_name = "FILE")]
    pub store_file: Option<PathBuf>,

    /// Forward every record to this URL with an HTTP POST.
    #[arg(long, env = "MAIN_BACKEND_URL", value_name = "URL")]
    pub backend_url: Option<String>,

    /// Records waiting for the backend before new ones are dropped.
    #[arg(long, default_value_t = DEFAULT_RELAY_QUEUE)]
    pub relay_queue: usize,

    /// Seconds allowed for draining and closing connections on shutdown.
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Text of the welcome frame sent to every new client.
    #[arg(long, default_value = WELCOME_MESSAGE)]
    pub welcome_message: String,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    pub fn reference(&self) -> Result<ReferencePoint, ReferenceError> {
        ReferencePoint::new(self.reference_lat, self.reference_lon)
    }

    pub fn filter_params(&self) -> FilterParams {
        FilterParams {
            mode: self.filter_mode,
            process_noise: self.process_noise,
            measurement_noise: self.measurement_noise,
            average_window: at_least_one("average-window", self.average_window as u64) as usize,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Component configuration; zero sizes and intervals are raised to 1
    pub fn broker_config(&self) -> Result<BrokerConfig, ReferenceError> {
        Ok(BrokerConfig {
            filter: self.filter_params(),
            reference: self.reference()?,
            buffer: BufferConfig {
                threshold: at_least_one("flush-threshold", self.flush_threshold as u64) as usize,
                flush_interval: Duration::from_secs(at_least_one(
                    "flush-interval-secs",
                    self.flush_interval_secs,
                )),
            },
            heartbeat_interval: Duration::from_secs(at_least_one(
                "heartbeat-interval-secs",
                self.heartbeat_interval_secs,
            )),
            history_size: at_least_one("history-size", self.history_size as u64) as usize,
            welcome_message: self.welcome_message.clone(),
            shutdown_grace: self.shutdown_grace(),
            queue_capacity: SESSION_QUEUE_CAPACITY,
            relay_queue: at_least_one("relay-queue", self.relay_queue as u64) as usize,
        })
    }
}

fn at_least_one(name: &str, value: u64) -> u64 {
    if value == 0 {
        warn!("--{} must be at least 1, using 1", name);
        1
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["locus-relay"]).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert!(config.tcp_listen.is_empty());

        let broker = config.broker_config().unwrap();
        assert_eq!(broker.filter, FilterParams::default());
        assert_eq!(broker.reference, ReferencePoint::default());
        assert_eq!(broker.buffer, BufferConfig::default());
        assert_eq!(broker.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(broker.history_size, 100);
        assert_eq!(broker.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides_and_clamping() {
        let config = Config::try_parse_from([
            "locus-relay",
            "--filter-mode",
            "hybrid",
            "--flush-threshold",
            "0",
            "--average-window",
            "5",
            "--tcp-listen",
            "127.0.0.1:9000",
            "--tcp-listen",
            "127.0.0.1:9001",
        ])
        .unwrap();
        assert_eq!(config.tcp_listen.len(), 2);

        let broker = config.broker_config().unwrap();
        assert_eq!(broker.filter.mode, FilterMode::Hybrid);
        assert_eq!(broker.filter.average_window, 5);
        assert_eq!(broker.buffer.threshold, 1);
    }

    #[test]
    fn test_invalid_reference_rejected() {
        let config = Config::try_parse_from(["locus-relay", "--reference-lat", "-95.0"]).unwrap();
        assert!(matches!(config.broker_config(), Err(ReferenceError::Latitude(_))));
    }
}

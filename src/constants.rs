// Shared defaults for the relay (filter tuning, buffering, liveness, projection)

use std::time::Duration;

// --- Signal filter ---

/// Kalman process noise (Q) applied on every prediction step.
pub const DEFAULT_PROCESS_NOISE: f64 = 0.001;

/// Kalman measurement noise (R).
pub const DEFAULT_MEASUREMENT_NOISE: f64 = 0.05;

/// Initial Kalman estimate for every axis.
pub const INITIAL_ESTIMATE: f64 = 0.0;

/// Initial Kalman error covariance for every axis.
pub const INITIAL_COVARIANCE: f64 = 1.0;

/// Moving-average window length (positions).
pub const DEFAULT_AVERAGE_WINDOW: usize = 3;

// --- Projection ---

/// Metres per degree of latitude, mapped onto Z. Negative: north is -Z.
pub const LAT_TO_Z: f64 = -111_000.0;

/// Metres per degree of longitude at the deployment latitude (~37.5°N), mapped onto X.
pub const LON_TO_X: f64 = 88_800.0;

/// Default local origin (latitude, degrees).
pub const DEFAULT_REFERENCE_LAT: f64 = 37.563517;

/// Default local origin (longitude, degrees).
pub const DEFAULT_REFERENCE_LON: f64 = 127.079571;

/// Mean Earth radius for haversine distances (m).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

// --- Accuracy classes (metres, inclusive upper bounds) ---

pub const ACCURACY_EXCELLENT_M: f64 = 5.0;
pub const ACCURACY_GOOD_M: f64 = 10.0;
pub const ACCURACY_FAIR_M: f64 = 20.0;

// --- Write buffer ---

/// Buffered records that force an immediate flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 50;

/// Periodic flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Records the JSON-lines store keeps in memory from the end of its file.
pub const STORE_TAIL_RECORDS: usize = 500;

/// Bytes read per step when scanning a JSON-lines file backwards.
pub const STORE_TAIL_CHUNK: u64 = 8 * 1024;

// --- Sessions ---

/// Longest line accepted from a TCP client (bytes, excluding the newline).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Heartbeat probe interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound frames queued per session before broadcasts to it are skipped.
pub const SESSION_QUEUE_CAPACITY: usize = 256;

/// Published records kept in memory for `/locations`.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Records returned by `/locations` when no limit is given.
pub const DEFAULT_LOCATIONS_LIMIT: usize = 50;

/// Records queued for the downstream relay before new ones are dropped.
pub const DEFAULT_RELAY_QUEUE: usize = 256;

/// Time allowed for transports to close after the shutdown notice.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const WELCOME_MESSAGE: &str = "Connected to LOCUS tracker relay.";
pub const SHUTDOWN_MESSAGE: &str = "Server is shutting down.";

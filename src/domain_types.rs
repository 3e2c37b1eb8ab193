//! Domain types shared across the broker, agent, and GUI core
//!
//! Strongly-typed values for identifiers and tunables to prevent primitive
//! obsession. Validation bounds encode the operational limits; defaults match
//! the documented protocol constants.

use nutype::nutype;
use uuid::Uuid;

/// Broker-assigned connection identifier
///
/// Monotonic within a broker process; never reused while the process lives.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Gets the raw id
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Broker-assigned identifier pairing a forwarded command with its result
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new random correlation ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Free-form label naming the desktop session an agent runs in
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct UserSession(String);

/// Symbolic name of a dispatchable command
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct CommandName(String);

/// Bound on a per-connection outbound frame queue
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65_536),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 256
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Interval between client heartbeats, in seconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 300),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct HeartbeatIntervalSecs(u64);

impl HeartbeatIntervalSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Cadence of the broker's liveness sweep, in seconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 15
)]
pub struct LivenessSweepSecs(u64);

impl LivenessSweepSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Idle time after which a connection is declared dead, in seconds
#[nutype(
    validate(greater_or_equal = 5, less_or_equal = 3_600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60
)]
pub struct DeadTimeoutSecs(u64);

impl DeadTimeoutSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Deadline applied to a forwarded or dispatched command, in seconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3_600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct CommandTimeoutSecs(u64);

impl CommandTimeoutSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Initial reconnect backoff delay, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 60_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1_000
)]
pub struct BackoffInitialMs(u64);

impl BackoffInitialMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Ceiling on the reconnect backoff delay, in milliseconds
#[nutype(
    validate(greater_or_equal = 1_000, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct BackoffCapMs(u64);

impl BackoffCapMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Fraction of the backoff delay randomized on each retry
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 0.5),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.2
)]
pub struct BackoffJitterRatio(f64);

impl BackoffJitterRatio {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Per-character pacing for synthetic keystrokes, in milliseconds
#[nutype(
    validate(less_or_equal = 1_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct KeystrokeDelayMs(u64);

impl KeystrokeDelayMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Delay after focusing a target before typing, in milliseconds
#[nutype(
    validate(less_or_equal = 5_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 300
)]
pub struct FocusSettleMs(u64);

impl FocusSettleMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Depth bound for accessibility-tree walks
///
/// Zero is legal and yields a single node carrying a depth marker.
#[nutype(
    validate(less_or_equal = 64),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 15
)]
pub struct MaxTreeDepth(usize);

impl MaxTreeDepth {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Cap on remembered coordinates per application signature
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct PositionMemoryCap(usize);

impl PositionMemoryCap {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Consecutive validation failures before a remembered point is evicted
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 20),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct StaleFailureLimit(u32);

impl StaleFailureLimit {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Capacity of the agent's in-process log ring buffer
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct LogBufferCapacity(usize);

impl LogBufferCapacity {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Cadence of health-monitor sampling, in seconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 300),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct HealthSampleSecs(u64);

impl HealthSampleSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Number of samples in the health monitor's rolling window
#[nutype(
    validate(greater_or_equal = 2, less_or_equal = 720),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 12
)]
pub struct HealthWindowSamples(usize);

impl HealthWindowSamples {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum agent restarts inside the watchdog window
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct RestartBudget(u32);

impl RestartBudget {
    /// Gets the value as usize for comparisons against a restart log
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner() as usize
    }
}

/// Window over which watchdog restarts are counted, in seconds
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 86_400),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 300
)]
pub struct RestartWindowSecs(u64);

impl RestartWindowSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Debounce applied to plugin-directory change notifications, in milliseconds
#[nutype(
    validate(greater_or_equal = 50, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 500
)]
pub struct WatchDebounceMs(u64);

impl WatchDebounceMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Cadence of position-memory snapshots to disk, in seconds
#[nutype(
    validate(greater_or_equal = 5, less_or_equal = 3_600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60
)]
pub struct SnapshotIntervalSecs(u64);

impl SnapshotIntervalSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Worker slots in one dispatcher concurrency class
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 64),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 4
)]
pub struct PoolSize(usize);

impl PoolSize {
    /// Gets the value as usize for semaphore construction
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_preserve_ordering() {
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        assert!(a < b);
        assert_eq!(a.as_u64(), 1);
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }

    #[test]
    fn user_session_rejects_empty_and_trims() {
        assert!(UserSession::try_new("  ").is_err());
        let s = UserSession::try_new("  wjchk ").unwrap();
        assert_eq!(s.as_ref(), "wjchk");
    }

    #[test]
    fn defaults_match_protocol_constants() {
        assert_eq!(QueueCapacity::default().as_usize(), 256);
        assert_eq!(HeartbeatIntervalSecs::default().into_inner(), 10);
        assert_eq!(LivenessSweepSecs::default().into_inner(), 15);
        assert_eq!(DeadTimeoutSecs::default().into_inner(), 60);
        assert_eq!(CommandTimeoutSecs::default().as_u64(), 30);
        assert_eq!(MaxTreeDepth::default().as_usize(), 15);
        assert_eq!(PositionMemoryCap::default().as_usize(), 10);
        assert_eq!(StaleFailureLimit::default().as_u32(), 3);
        assert_eq!(LogBufferCapacity::default().as_usize(), 10_000);
        assert_eq!(RestartBudget::default().as_usize(), 5);
        assert_eq!(WatchDebounceMs::default().into_inner(), 500);
    }

    #[test]
    fn zero_depth_is_a_legal_bound() {
        assert!(MaxTreeDepth::try_new(0).is_ok());
        assert!(MaxTreeDepth::try_new(65).is_err());
    }

    #[test]
    fn jitter_ratio_bounds() {
        assert!(BackoffJitterRatio::try_new(0.2).is_ok());
        assert!(BackoffJitterRatio::try_new(0.9).is_err());
        assert!(BackoffJitterRatio::try_new(f64::NAN).is_err());
    }
}

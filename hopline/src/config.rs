use std::time::Duration;

/// Configuration for a [`Loop`](crate::Loop) and the connections it drives.
#[derive(Clone)]
pub struct Config {
    /// How often the loop wakes when no timer is due sooner. Also bounds the
    /// poll timeout, so this is the coarsest granularity at which scheduled
    /// events fire. Set smaller for tests that use sub-second timers.
    pub precision: Duration,
    /// When set, measure wall time spent inside each callback and log a
    /// warning when one exceeds [`slow_callback`](Config::slow_callback).
    pub debug: bool,
    /// Threshold for the debug-mode slow-callback warning.
    pub slow_callback: Duration,
    /// Maximum readiness events drained per poll call.
    pub max_events: usize,
    /// Bytes read per `read()` call on a readable connection.
    pub read_chunk_size: usize,
    /// Outgoing queue size above which a connection emits `pause(true)`.
    pub write_high_water: usize,
    /// Outgoing queue size below which a paused writer emits `pause(false)`.
    pub write_low_water: usize,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on all connections (accepted and outbound).
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            precision: Duration::from_millis(500),
            debug: false,
            slow_callback: Duration::from_millis(200),
            max_events: 64,
            read_chunk_size: 16 * 1024,
            write_high_water: 64 * 1024,
            write_low_water: 16 * 1024,
            backlog: 1024,
            tcp_nodelay: true,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.precision.is_zero() {
            return Err(crate::error::Error::Config(
                "precision must be non-zero".into(),
            ));
        }
        if self.max_events == 0 {
            return Err(crate::error::Error::Config(
                "max_events must be > 0".into(),
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(crate::error::Error::Config(
                "read_chunk_size must be > 0".into(),
            ));
        }
        if self.write_low_water >= self.write_high_water {
            return Err(crate::error::Error::Config(
                "write_low_water must be below write_high_water".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use hopline::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .precision(Duration::from_millis(10))
///     .read_chunk_size(4096)
///     .write_water_marks(32 * 1024, 8 * 1024)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduling precision.
    pub fn precision(mut self, precision: Duration) -> Self {
        self.config.precision = precision;
        self
    }

    /// Enable or disable debug mode (slow-callback diagnostics).
    pub fn debug(mut self, enable: bool) -> Self {
        self.config.debug = enable;
        self
    }

    /// Set the slow-callback warning threshold used in debug mode.
    pub fn slow_callback(mut self, threshold: Duration) -> Self {
        self.config.slow_callback = threshold;
        self
    }

    /// Set the maximum readiness events drained per poll call.
    pub fn max_events(mut self, n: usize) -> Self {
        self.config.max_events = n;
        self
    }

    /// Set the per-read chunk size for connections.
    pub fn read_chunk_size(mut self, n: usize) -> Self {
        self.config.read_chunk_size = n;
        self
    }

    /// Set the outgoing-queue high and low water marks, in bytes.
    pub fn write_water_marks(mut self, high: usize, low: usize) -> Self {
        self.config.write_high_water = high;
        self.config.write_low_water = low;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY on connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

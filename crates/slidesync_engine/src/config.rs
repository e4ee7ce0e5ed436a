//! Configuration for the upload engine.

use std::time::Duration;

/// Configuration for the engine and its scheduler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of jobs uploading at once.
    pub max_concurrent_transfers: usize,
    /// Retry behavior for transient failures.
    pub retry: RetryConfig,
    /// Bandwidth monitoring and chunk size adaptation.
    pub bandwidth: BandwidthConfig,
    /// Per-chunk retransmit limit within a single attempt.
    pub max_chunk_retransmits: u32,
}

impl EngineConfig {
    /// Sets the maximum number of concurrent transfers.
    pub fn with_max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the bandwidth configuration.
    pub fn with_bandwidth(mut self, bandwidth: BandwidthConfig) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Sets the per-chunk retransmit limit.
    pub fn with_max_chunk_retransmits(mut self, max: u32) -> Self {
        self.max_chunk_retransmits = max;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 2,
            retry: RetryConfig::default(),
            bandwidth: BandwidthConfig::default(),
            max_chunk_retransmits: 2,
        }
    }
}

/// Configuration for job-level retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts before the job fails terminally.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// Grows geometrically from `initial_delay` and saturates at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }
        let factor = self.backoff_multiplier.powi((attempt - 1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            backoff_multiplier: 2.0,
        }
    }
}

/// Configuration for bandwidth estimation and tier selection.
#[derive(Debug, Clone)]
pub struct BandwidthConfig {
    /// Smoothing factor for the exponential moving average, in `(0, 1]`.
    pub ewma_alpha: f64,
    /// Consecutive samples required in a new tier before switching.
    pub hysteresis_samples: u32,
    /// Fractional margin a sample must clear a boundary by to count.
    pub hysteresis_margin: f64,
}

impl BandwidthConfig {
    /// Sets the EWMA smoothing factor.
    pub fn with_ewma_alpha(mut self, alpha: f64) -> Self {
        self.ewma_alpha = alpha.clamp(f64::MIN_POSITIVE, 1.0);
        self
    }

    /// Sets the number of consecutive out-of-tier samples required.
    pub fn with_hysteresis_samples(mut self, samples: u32) -> Self {
        self.hysteresis_samples = samples.max(1);
        self
    }

    /// Sets the boundary margin.
    pub fn with_hysteresis_margin(mut self, margin: f64) -> Self {
        self.hysteresis_margin = margin.max(0.0);
        self
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.3,
            hysteresis_samples: 2,
            hysteresis_margin: 0.2,
        }
    }
}

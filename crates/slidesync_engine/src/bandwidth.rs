//! Bandwidth estimation and adaptive chunk size selection.
//!
//! Throughput observed during real chunk transfers (or explicit probes)
//! feeds an exponential moving average. The smoothed estimate maps onto a
//! chunk size tier, with hysteresis so a single noisy sample near a tier
//! boundary cannot flap the chunk size back and forth. Samples also carry
//! a connectivity flag; an offline sample marks the link down and the
//! scheduler stops dispatching fresh work until it comes back.

use crate::clock::{Clock, SystemClock};
use crate::config::BandwidthConfig;
use crate::error::EngineResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Chunk size tiers keyed to link quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSizeTier {
    /// Below 1 Mbps: 5 MiB chunks keep retransmits cheap.
    Small,
    /// 1 to 10 Mbps: 25 MiB chunks.
    Medium,
    /// Above 10 Mbps: 100 MiB chunks amortize per-chunk overhead.
    Large,
}

impl ChunkSizeTier {
    /// The chunk size for this tier, in bytes.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        match self {
            Self::Small => 5 * MIB,
            Self::Medium => 25 * MIB,
            Self::Large => 100 * MIB,
        }
    }

    /// The tier a raw throughput estimate falls in.
    #[must_use]
    pub fn for_mbps(mbps: f64) -> Self {
        if mbps < 1.0 {
            Self::Small
        } else if mbps <= 10.0 {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

/// One connectivity observation: measured throughput, when it was taken,
/// and whether the remote was reachable at all.
#[derive(Debug, Clone, Copy)]
pub struct BandwidthSample {
    /// Observed throughput in bytes per second; zero when offline.
    pub bytes_per_sec: f64,
    /// Milliseconds timestamp from the engine clock.
    pub taken_at_ms: u64,
    /// Whether the remote was reachable when the sample was taken.
    pub online: bool,
}

impl BandwidthSample {
    /// A sample from a successful measurement.
    #[must_use]
    pub fn measured(bytes_per_sec: f64, taken_at_ms: u64) -> Self {
        Self {
            bytes_per_sec,
            taken_at_ms,
            online: true,
        }
    }

    /// A sample recording that the remote was unreachable.
    #[must_use]
    pub fn offline(taken_at_ms: u64) -> Self {
        Self {
            bytes_per_sec: 0.0,
            taken_at_ms,
            online: false,
        }
    }

    /// A sample from a throughput figure in megabits per second.
    #[must_use]
    pub fn from_mbps(mbps: f64, taken_at_ms: u64) -> Self {
        Self::measured(mbps * 1_000_000.0 / 8.0, taken_at_ms)
    }

    /// Derives a sample from a completed transfer.
    ///
    /// Returns `None` if the elapsed time is zero.
    #[must_use]
    pub fn from_transfer(bytes: u64, elapsed: Duration, taken_at_ms: u64) -> Option<Self> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(Self::measured(bytes as f64 / secs, taken_at_ms))
    }

    /// The sample's throughput in megabits per second.
    #[must_use]
    pub fn mbps(&self) -> f64 {
        self.bytes_per_sec * 8.0 / 1_000_000.0
    }
}

/// Source of explicit connectivity measurements.
///
/// Implementations typically move a small calibration payload against the
/// remote, reporting an offline sample when it cannot be reached. Probes
/// matter when no transfer has run recently enough for the passive
/// estimate to be trusted, and they are the way a parked engine notices
/// the link coming back.
pub trait BandwidthProbe: Send + Sync {
    /// Measures current throughput and reachability.
    fn probe(&self) -> EngineResult<BandwidthSample>;
}

/// A probe returning pre-scripted samples, for tests.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    samples: Mutex<VecDeque<BandwidthSample>>,
}

impl ScriptedProbe {
    /// Creates a probe that yields the given samples in order; once they
    /// run out it keeps repeating the last one.
    pub fn new(samples: impl IntoIterator<Item = BandwidthSample>) -> Self {
        Self {
            samples: Mutex::new(samples.into_iter().collect()),
        }
    }
}

impl BandwidthProbe for ScriptedProbe {
    fn probe(&self) -> EngineResult<BandwidthSample> {
        let mut samples = self.samples.lock();
        if samples.len() > 1 {
            if let Some(sample) = samples.pop_front() {
                return Ok(sample);
            }
        }
        samples
            .front()
            .copied()
            .ok_or_else(|| crate::error::EngineError::transport_fatal("probe script empty"))
    }
}

struct MonitorState {
    estimate_mbps: Option<f64>,
    tier: ChunkSizeTier,
    online: bool,
    last_sample_at_ms: Option<u64>,
    // Candidate tier and how many consecutive samples have backed it.
    pending: Option<(ChunkSizeTier, u32)>,
}

/// Tracks a smoothed throughput estimate, connectivity, and the current
/// chunk size tier.
///
/// The estimate is never persisted: after a restart it starts unknown and
/// the tier resets to [`ChunkSizeTier::Medium`], since a network measured
/// yesterday says little about today's. Connectivity starts optimistic;
/// the first failed transfer or offline probe flips it.
pub struct BandwidthMonitor {
    config: BandwidthConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
}

impl BandwidthMonitor {
    /// Creates a monitor with no estimate, starting at the medium tier.
    #[must_use]
    pub fn new(config: BandwidthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Creates a monitor stamping samples from an explicit clock.
    #[must_use]
    pub fn with_clock(config: BandwidthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(MonitorState {
                estimate_mbps: None,
                tier: ChunkSizeTier::Medium,
                online: true,
                last_sample_at_ms: None,
                pending: None,
            }),
        }
    }

    /// Folds one observation into the estimate and updates the tier.
    ///
    /// An offline sample marks the link down without disturbing the
    /// throughput estimate: the last measured speed is still the best
    /// guess for when the link returns.
    pub fn record(&self, sample: BandwidthSample) {
        let mut state = self.state.lock();
        state.last_sample_at_ms = Some(sample.taken_at_ms);

        if !sample.online {
            if state.online {
                tracing::warn!("remote unreachable, holding dispatch");
            }
            state.online = false;
            state.pending = None;
            return;
        }
        if !state.online {
            tracing::info!("remote reachable again");
        }
        state.online = true;

        let mbps = sample.mbps();
        state.estimate_mbps = Some(match state.estimate_mbps {
            None => mbps,
            Some(prev) => self.config.ewma_alpha * mbps + (1.0 - self.config.ewma_alpha) * prev,
        });

        let current = state.tier;
        match self.decisive_tier(current, mbps) {
            Some(candidate) => {
                let count = match state.pending {
                    Some((pending, count)) if pending == candidate => count + 1,
                    _ => 1,
                };
                if count >= self.config.hysteresis_samples {
                    tracing::info!(
                        from = ?current,
                        to = ?candidate,
                        mbps,
                        "chunk size tier changed"
                    );
                    state.tier = candidate;
                    state.pending = None;
                } else {
                    state.pending = Some((candidate, count));
                }
            }
            // Samples inside the current tier (or not clearing the margin)
            // reset any pending switch.
            None => state.pending = None,
        }
    }

    /// Runs a probe and folds its result into the estimate.
    pub fn record_probe(&self, probe: &dyn BandwidthProbe) -> EngineResult<BandwidthSample> {
        let sample = probe.probe()?;
        self.record(sample);
        Ok(sample)
    }

    /// Derives and records a sample from a completed transfer.
    pub fn record_transfer(&self, bytes: u64, elapsed: Duration) {
        if let Some(sample) = BandwidthSample::from_transfer(bytes, elapsed, self.clock.now_ms()) {
            self.record(sample);
        }
    }

    /// Records a throughput figure in Mbps, stamped by the engine clock.
    pub fn record_mbps(&self, mbps: f64) {
        self.record(BandwidthSample::from_mbps(mbps, self.clock.now_ms()));
    }

    /// Records that the remote is unreachable.
    pub fn record_offline(&self) {
        self.record(BandwidthSample::offline(self.clock.now_ms()));
    }

    /// Marks the link up without recording a throughput figure.
    pub fn note_online(&self) {
        let mut state = self.state.lock();
        if !state.online {
            tracing::info!("remote reachable again");
        }
        state.online = true;
    }

    /// The current smoothed estimate, if any samples have arrived.
    #[must_use]
    pub fn estimate_mbps(&self) -> Option<f64> {
        self.state.lock().estimate_mbps
    }

    /// Whether the remote was reachable as of the latest sample.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    /// When the latest sample was taken, in engine clock milliseconds.
    #[must_use]
    pub fn last_sample_at_ms(&self) -> Option<u64> {
        self.state.lock().last_sample_at_ms
    }

    /// The chunk size tier in effect.
    #[must_use]
    pub fn tier(&self) -> ChunkSizeTier {
        self.state.lock().tier
    }

    /// A sample only argues for a switch if its tier differs from the
    /// current one and it clears the boundary by the configured margin.
    fn decisive_tier(&self, current: ChunkSizeTier, mbps: f64) -> Option<ChunkSizeTier> {
        let candidate = ChunkSizeTier::for_mbps(mbps);
        if candidate == current {
            return None;
        }
        let margin = self.config.hysteresis_margin;
        let cleared = match (current, candidate) {
            // Downward moves must undershoot the lower boundary.
            (ChunkSizeTier::Medium, ChunkSizeTier::Small) => mbps < 1.0 * (1.0 - margin),
            (ChunkSizeTier::Large, ChunkSizeTier::Medium) => mbps < 10.0 * (1.0 - margin),
            (ChunkSizeTier::Large, ChunkSizeTier::Small) => mbps < 1.0 * (1.0 - margin),
            // Upward moves must overshoot the upper boundary.
            (ChunkSizeTier::Small, ChunkSizeTier::Medium) => mbps > 1.0 * (1.0 + margin),
            (ChunkSizeTier::Medium, ChunkSizeTier::Large) => mbps > 10.0 * (1.0 + margin),
            (ChunkSizeTier::Small, ChunkSizeTier::Large) => mbps > 10.0 * (1.0 + margin),
            _ => false,
        };
        cleared.then_some(candidate)
    }
}

impl std::fmt::Debug for BandwidthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BandwidthMonitor")
            .field("estimate_mbps", &state.estimate_mbps)
            .field("tier", &state.tier)
            .field("online", &state.online)
            .finish_non_exhaustive()
    }
}

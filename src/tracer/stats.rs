use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// What happened to a record taken off the delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Outcome {
    /// A point was built and accepted by the sink.
    Written = 0,
    /// The record did not match the configured layout.
    DecodeFailed = 1,
    /// Point construction was rejected.
    NormalizeFailed = 2,
    /// The sink write failed.
    WriteFailed = 3,
}

const OUTCOME_CARDINALITY: usize = 4;

impl Outcome {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::DecodeFailed => "decode",
            Self::NormalizeFailed => "normalize",
            Self::WriteFailed => "write",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Written),
            1 => Some(Self::DecodeFailed),
            2 => Some(Self::NormalizeFailed),
            3 => Some(Self::WriteFailed),
            _ => None,
        }
    }

    /// True for the outcomes that drop the record.
    pub const fn is_drop(self) -> bool {
        !matches!(self, Self::Written)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free per-outcome counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention. `totals()` reads
/// the lifetime counts, which are never reset.
pub struct PumpStats {
    window: [AtomicU64; OUTCOME_CARDINALITY],
    lifetime: [AtomicU64; OUTCOME_CARDINALITY],
}

impl PumpStats {
    /// Create a new zeroed PumpStats.
    pub fn new() -> Self {
        Self {
            window: std::array::from_fn(|_| AtomicU64::new(0)),
            lifetime: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given outcome by one.
    pub fn record(&self, outcome: Outcome) {
        let i = outcome as usize;
        if let Some(counter) = self.window.get(i) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(counter) = self.lifetime.get(i) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset the window counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(Outcome, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.window.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(outcome) = Outcome::from_u8(i as u8) {
                    result.push((outcome, v));
                }
            }
        }

        result
    }

    /// Lifetime count for one outcome.
    pub fn total(&self, outcome: Outcome) -> u64 {
        self.lifetime
            .get(outcome as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Lifetime count of records taken off the channel.
    pub fn processed(&self) -> u64 {
        self.lifetime
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for PumpStats {
    fn default() -> Self {
        Self::new()
    }
}

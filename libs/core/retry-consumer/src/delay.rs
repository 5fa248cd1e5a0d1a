//! Redelivery delay tiers
//!
//! Maps a retry attempt number to the delay a re-submitted message waits
//! before it becomes visible again.

use crate::error::ConsumerError;
use std::time::Duration;

/// Default tiers: 1 min, 10 min, 30 min, 1 h, 2 h.
pub const DEFAULT_DELAY_TIERS_MS: [u64; 5] = [60_000, 600_000, 1_800_000, 3_600_000, 7_200_000];

/// Default delay for attempts past the last tier: 2 h.
pub const DEFAULT_FALLBACK_DELAY_MS: u64 = 7_200_000;

/// Attempt → delay mapping.
///
/// Attempts are 1-based. Tiers are strictly increasing and non-zero, and the
/// fallback is never below the last tier, so the mapping is monotonic over
/// every attempt number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayTable {
    tiers: Vec<u64>,
    fallback_ms: u64,
}

impl DelayTable {
    /// Build a table, validating the ordering invariants.
    pub fn new(tiers: Vec<u64>, fallback_ms: u64) -> Result<Self, ConsumerError> {
        if fallback_ms == 0 {
            return Err(ConsumerError::Config(
                "fallback delay must be greater than zero".to_string(),
            ));
        }
        if tiers.first() == Some(&0) {
            return Err(ConsumerError::Config(
                "delay tiers must be greater than zero".to_string(),
            ));
        }
        if let Some(pair) = tiers.windows(2).find(|w| w[0] >= w[1]) {
            return Err(ConsumerError::Config(format!(
                "delay tiers must be strictly increasing ({} >= {})",
                pair[0], pair[1]
            )));
        }
        if let Some(&last) = tiers.last()
            && fallback_ms < last
        {
            return Err(ConsumerError::Config(format!(
                "fallback delay {} is below the last tier {}",
                fallback_ms, last
            )));
        }

        Ok(Self { tiers, fallback_ms })
    }

    /// Parse a comma-separated list of millisecond tiers, e.g.
    /// `"60000,600000,1800000"`. The fallback defaults to the last tier.
    pub fn parse(tiers: &str, fallback_ms: Option<u64>) -> Result<Self, ConsumerError> {
        let tiers = tiers
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<u64>().map_err(|e| {
                    ConsumerError::Config(format!("invalid delay tier '{}': {}", t, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fallback = fallback_ms
            .or_else(|| tiers.last().copied())
            .unwrap_or(DEFAULT_FALLBACK_DELAY_MS);

        Self::new(tiers, fallback)
    }

    /// Delay in milliseconds for a 1-based retry attempt.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let index = attempt.max(1) as usize - 1;
        self.tiers.get(index).copied().unwrap_or(self.fallback_ms)
    }

    /// Same as [`delay_for`](Self::delay_for) as a `Duration`.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_for(attempt))
    }

    pub fn tiers(&self) -> &[u64] {
        &self.tiers
    }

    pub fn fallback_ms(&self) -> u64 {
        self.fallback_ms
    }
}

impl Default for DelayTable {
    fn default() -> Self {
        Self {
            tiers: DEFAULT_DELAY_TIERS_MS.to_vec(),
            fallback_ms: DEFAULT_FALLBACK_DELAY_MS,
        }
    }
}

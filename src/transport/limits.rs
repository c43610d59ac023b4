//! Write-buffer watermarks.

use crate::error::TransportError;

/// High-water mark used when neither limit is given.
pub const DEFAULT_HIGH_WATER: usize = 64 * 1024;

/// Flow-control thresholds for the write buffer.
///
/// The protocol is paused once the buffer grows above `high` and resumed
/// once it drains to `low` or below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBufferLimits {
    pub high: usize,
    pub low: usize,
}

impl WriteBufferLimits {
    /// Derive a consistent pair from optional limits.
    ///
    /// A missing `high` is four times `low` (or [`DEFAULT_HIGH_WATER`]); a
    /// missing `low` is a quarter of `high`.
    pub fn new(high: Option<usize>, low: Option<usize>) -> Result<Self, TransportError> {
        let high = match (high, low) {
            (Some(high), _) => high,
            (None, Some(low)) => low.saturating_mul(4),
            (None, None) => DEFAULT_HIGH_WATER,
        };
        let low = low.unwrap_or(high / 4);
        if high < low {
            return Err(TransportError::InvalidWriteBufferLimits { high, low });
        }
        Ok(Self { high, low })
    }

    pub(crate) fn should_pause(&self, buffered: usize) -> bool {
        buffered > self.high
    }

    pub(crate) fn should_resume(&self, buffered: usize) -> bool {
        buffered <= self.low
    }
}

impl Default for WriteBufferLimits {
    fn default() -> Self {
        Self {
            high: DEFAULT_HIGH_WATER,
            low: DEFAULT_HIGH_WATER / 4,
        }
    }
}

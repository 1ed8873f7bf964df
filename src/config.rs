//! Runtime-configurable tuning parameters for weft.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `WEFT_`) or by constructing a custom `WeftConfig`.

use crate::types::BufferKind;

/// Tuning parameters for the per-queue scheduling core.
#[derive(Debug, Clone)]
pub struct WeftConfig {
    /// Credit slots in the scale-up staging pool (per queue).
    pub scaleup_credits: usize,

    /// Credit slots in the scale-out staging pool (per queue).
    pub scaleout_credits: usize,

    /// Credit slots in the reduction staging pool (per queue).
    pub reduction_credits: usize,

    /// Maximum number of cached graph templates per queue. Shapes beyond
    /// this bound evict the least recently used template.
    pub graph_cache_capacity: usize,

    /// Capacity of the host-to-device completion ring. Must be a power
    /// of two.
    pub completion_ring_capacity: usize,

    /// Byte stride between consecutive staging-buffer slots.
    pub staging_stride: u64,
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            scaleup_credits: 8,
            scaleout_credits: 16,
            reduction_credits: 4,
            graph_cache_capacity: 128,
            completion_ring_capacity: 256,
            staging_stride: 512 * 1024, // 512 KiB slots
        }
    }
}

impl WeftConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `WEFT_SCALEUP_CREDITS`
    /// - `WEFT_SCALEOUT_CREDITS`
    /// - `WEFT_REDUCTION_CREDITS`
    /// - `WEFT_GRAPH_CACHE_CAPACITY`
    /// - `WEFT_COMPLETION_RING_CAPACITY`
    /// - `WEFT_STAGING_STRIDE`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("WEFT_SCALEUP_CREDITS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.scaleup_credits = n;
            }
        }
        if let Ok(v) = std::env::var("WEFT_SCALEOUT_CREDITS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.scaleout_credits = n;
            }
        }
        if let Ok(v) = std::env::var("WEFT_REDUCTION_CREDITS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.reduction_credits = n;
            }
        }
        if let Ok(v) = std::env::var("WEFT_GRAPH_CACHE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.graph_cache_capacity = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("WEFT_COMPLETION_RING_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                if n.is_power_of_two() {
                    cfg.completion_ring_capacity = n;
                } else {
                    tracing::warn!(
                        requested = n,
                        "WEFT_COMPLETION_RING_CAPACITY is not a power of two, ignoring"
                    );
                }
            }
        }
        if let Ok(v) = std::env::var("WEFT_STAGING_STRIDE") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.staging_stride = n;
            }
        }

        cfg
    }

    /// Configured pool size for one buffer kind.
    pub fn credits_for(&self, kind: BufferKind) -> usize {
        match kind {
            BufferKind::ScaleUpStaging => self.scaleup_credits,
            BufferKind::ScaleOutStaging => self.scaleout_credits,
            BufferKind::ReductionStaging => self.reduction_credits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = WeftConfig::default();
        assert_eq!(cfg.scaleup_credits, 8);
        assert_eq!(cfg.scaleout_credits, 16);
        assert_eq!(cfg.reduction_credits, 4);
        assert!(cfg.completion_ring_capacity.is_power_of_two());
    }

    #[test]
    fn test_credits_for_kind() {
        let cfg = WeftConfig::default();
        assert_eq!(cfg.credits_for(BufferKind::ScaleUpStaging), 8);
        assert_eq!(cfg.credits_for(BufferKind::ScaleOutStaging), 16);
        assert_eq!(cfg.credits_for(BufferKind::ReductionStaging), 4);
    }
}

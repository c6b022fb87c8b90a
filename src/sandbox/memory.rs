//! Linear memory growth policy for `emscripten_resize_heap`

use serde::{Deserialize, Serialize};

pub const WASM_PAGE_SIZE: u64 = 65536;

/// 2 GiB, the largest heap a wasm32 emscripten build can address with signed pointers
pub const DEFAULT_MEMORY_CEILING: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthPolicy {
    /// Hard upper bound in bytes
    pub ceiling: u64,
    /// Multiplier applied to the current size so repeated small requests grow geometrically
    pub factor: f64,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_MEMORY_CEILING,
            factor: DEFAULT_GROWTH_FACTOR,
        }
    }
}

impl GrowthPolicy {
    pub fn new(ceiling: u64, factor: f64) -> Self {
        Self { ceiling, factor }
    }

    /// New heap size in bytes, or `None` when `requested` cannot be satisfied.
    ///
    /// The result is page aligned, at least `requested`, and never above the ceiling.
    #[must_use]
    pub fn plan(&self, current: u64, requested: u64) -> Option<u64> {
        let ceiling = self.ceiling - self.ceiling % WASM_PAGE_SIZE;
        if requested > ceiling {
            return None;
        }
        if requested <= current {
            return Some(current);
        }

        let factor = if self.factor.is_finite() && self.factor > 1.0 {
            self.factor
        } else {
            1.0
        };
        let scaled = (current as f64 * factor) as u64;
        let target = align_up(requested.max(scaled)).min(ceiling);
        Some(target.max(align_up(requested)))
    }

    /// Number of pages to add to go from `current` to the planned size
    #[must_use]
    pub fn pages_to_add(&self, current: u64, requested: u64) -> Option<u32> {
        let target = self.plan(current, requested)?;
        let delta = target.saturating_sub(current).div_ceil(WASM_PAGE_SIZE);
        u32::try_from(delta).ok()
    }
}

fn align_up(bytes: u64) -> u64 {
    bytes.div_ceil(WASM_PAGE_SIZE) * WASM_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn grows_by_factor_when_request_is_small() {
        let policy = GrowthPolicy::default();
        let planned = policy.plan(16 * MIB, 16 * MIB + 1).unwrap();
        assert_eq!(planned, 24 * MIB);
        assert_eq!(planned % WASM_PAGE_SIZE, 0);
    }

    #[test]
    fn large_request_wins_over_factor() {
        let policy = GrowthPolicy::default();
        let planned = policy.plan(16 * MIB, 100 * MIB + 3).unwrap();
        assert!(planned >= 100 * MIB + 3);
        assert_eq!(planned % WASM_PAGE_SIZE, 0);
    }

    #[test]
    fn capped_at_ceiling() {
        let policy = GrowthPolicy::new(64 * MIB, 1.5);
        assert_eq!(policy.plan(60 * MIB, 61 * MIB), Some(64 * MIB));
        assert_eq!(policy.plan(60 * MIB, 64 * MIB), Some(64 * MIB));
    }

    #[test]
    fn refuses_above_ceiling() {
        let policy = GrowthPolicy::default();
        assert_eq!(policy.plan(MIB, DEFAULT_MEMORY_CEILING + 1), None);
        assert_eq!(policy.pages_to_add(MIB, DEFAULT_MEMORY_CEILING + 1), None);
    }

    #[test]
    fn pages_to_add_matches_plan() {
        let policy = GrowthPolicy::default();
        let current = 16 * MIB;
        let pages = policy.pages_to_add(current, current + 1).unwrap();
        assert_eq!(current + u64::from(pages) * WASM_PAGE_SIZE, 24 * MIB);
        assert_eq!(policy.pages_to_add(current, current - 1), Some(0));
    }
}

use std::collections::HashSet;

use crate::config::GrowthMode;
use crate::types::MoldSpot;

/// Offsets the terrain seed so spawn and growth draw from a different stream
/// than the map generator.
pub(super) fn simulation_seed(seed: u32) -> u32 {
    seed ^ 0x9e37_79b9
}

/// Number of spread attempts a spot gets per growth pass.
pub(super) fn growth_attempts(mode: GrowthMode, size: u32) -> u32 {
    let size = size.max(1);
    match mode {
        GrowthMode::Batched => size.div_ceil(8).min(3),
        GrowthMode::Full => size.div_ceil(5),
    }
}

/// Keeps the first spot per coordinate.
pub(super) fn dedupe_spots(spots: impl Iterator<Item = MoldSpot>) -> Vec<MoldSpot> {
    let mut seen = HashSet::new();
    spots
        .filter(|spot| seen.insert((spot.x, spot.y)))
        .collect()
}

use super::utils::growth_attempts;
use super::*;
use crate::config::GrowthMode;
use crate::constants::{GROWTH_BATCH_LIMIT, GROWTH_CHANCE_PER_DIFFICULTY, GROWTH_RATE_INHERITANCE};

impl MoldEngine {
    /// One diffusion pass. Each chosen spot gets a few attempts to infect a
    /// random open neighbour; children inherit a compounded growth rate.
    /// Returns how many cells were newly infected.
    pub fn grow_mold(&mut self) -> usize {
        if self.state.game_over || self.state.mold_spots.is_empty() {
            return 0;
        }

        let chance = GROWTH_CHANCE_PER_DIFFICULTY * self.state.difficulty;
        let mode = self.config.growth_mode;
        let mut spread = 0;

        for index in self.pick_growing_spots() {
            let attempts = growth_attempts(mode, self.state.mold_spots[index].size);
            for _ in 0..attempts {
                if !self.rng.bool(chance) {
                    continue;
                }
                let (x, y) = (
                    self.state.mold_spots[index].x,
                    self.state.mold_spots[index].y,
                );
                let open: Vec<(i32, i32)> = self
                    .open_neighbors(mode, x, y)
                    .into_iter()
                    .filter(|&(nx, ny)| !self.state.grid.is(nx, ny, TerrainCell::Mold))
                    .collect();
                if open.is_empty() {
                    continue;
                }
                let (nx, ny) = open[self.rng.pick_index(open.len())];

                let parent = &mut self.state.mold_spots[index];
                parent.size += 1;
                let child = MoldSpot {
                    x: nx,
                    y: ny,
                    size: 1,
                    growth_rate: parent.growth_rate * GROWTH_RATE_INHERITANCE,
                };
                self.state.grid.set(nx, ny, TerrainCell::Mold);
                self.state.mold_spots.push(child);
                self.events.push(EngineEvent::MoldSpread {
                    from: (x, y),
                    x: nx,
                    y: ny,
                });
                spread += 1;
            }
        }

        if spread > 0 {
            debug!(spread, total = self.state.mold_spots.len(), "mold grew");
            self.maybe_check_game_over();
        }
        spread
    }

    /// Indices of the spots that grow this pass. Children created during the
    /// pass never grow in it.
    fn pick_growing_spots(&mut self) -> Vec<usize> {
        let count = self.state.mold_spots.len();
        match self.config.growth_mode {
            GrowthMode::Full => (0..count).collect(),
            GrowthMode::Batched if count <= GROWTH_BATCH_LIMIT => (0..count).collect(),
            GrowthMode::Batched => (0..GROWTH_BATCH_LIMIT)
                .map(|_| self.rng.pick_index(count))
                .collect(),
        }
    }

    fn open_neighbors(&self, mode: GrowthMode, x: i32, y: i32) -> Vec<(i32, i32)> {
        match mode {
            GrowthMode::Batched => self.state.grid.neighbors4(x, y),
            GrowthMode::Full => self.state.grid.neighbors8(x, y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DifficultyCurve, SimulationConfig};

    fn engine_with(mode: GrowthMode, width: i32, height: i32) -> MoldEngine {
        let mut config = SimulationConfig::default()
            .with_size(width, height)
            .with_curve(DifficultyCurve::Remote);
        config.growth_mode = mode;
        MoldEngine::new(config, 21)
    }

    #[test]
    fn children_compound_growth_rate_and_parent_grows() {
        let mut engine = engine_with(GrowthMode::Batched, 9, 9);
        engine.replace_mold_spots(vec![MoldSpot::seed(4, 4)]);
        engine.apply_remote_difficulty(4.0);

        let mut spread = 0;
        for _ in 0..5 {
            spread += engine.grow_mold();
        }
        assert!(spread > 0);
        let state = engine.state();
        let root = state
            .mold_spots
            .iter()
            .find(|spot| (spot.x, spot.y) == (4, 4))
            .expect("root spot survives");
        assert!(root.size > 1);
        for spot in &state.mold_spots {
            if (spot.x, spot.y) != (4, 4) {
                assert!(spot.growth_rate >= GROWTH_RATE_INHERITANCE - 1e-9);
            }
        }
        assert!(state.audit().is_empty());
    }

    #[test]
    fn batched_growth_is_four_connected() {
        let mut engine = engine_with(GrowthMode::Batched, 9, 9);
        engine.replace_mold_spots(vec![MoldSpot::seed(4, 4)]);
        engine.apply_remote_difficulty(4.0);
        engine.grow_mold();
        for spot in &engine.state().mold_spots {
            if (spot.x, spot.y) != (4, 4) {
                assert_eq!((spot.x - 4).abs() + (spot.y - 4).abs(), 1);
            }
        }
    }

    #[test]
    fn growth_may_overtake_houses_and_roads() {
        for mode in [GrowthMode::Batched, GrowthMode::Full] {
            let mut engine = engine_with(mode, 3, 3);
            engine.state.grid = Grid::new(3, 3, TerrainCell::House);
            engine.state.grid.set(1, 0, TerrainCell::Road);
            engine.state.original_grid = engine.state.grid.clone();
            engine.replace_mold_spots(vec![MoldSpot::seed(1, 1)]);
            engine.apply_remote_difficulty(4.0);
            for _ in 0..20 {
                engine.grow_mold();
            }
            assert!(engine.state().mold_spots.len() > 1, "{mode:?} never spread");
            assert!(engine.state().audit().is_empty());
        }
    }

    #[test]
    fn fully_surrounded_spot_does_not_spread() {
        let mut engine = engine_with(GrowthMode::Full, 3, 3);
        let spots: Vec<MoldSpot> = (0..9).map(|i| MoldSpot::seed(i % 3, i / 3)).collect();
        engine.replace_mold_spots(spots);
        engine.apply_remote_difficulty(4.0);
        assert_eq!(engine.grow_mold(), 0);
    }

    #[test]
    fn large_colonies_grow_in_bounded_batches() {
        let mut engine = engine_with(GrowthMode::Batched, 50, 50);
        let spots: Vec<MoldSpot> = (0..400)
            .map(|i| MoldSpot::seed((i % 20) * 2, (i / 20) * 2))
            .collect();
        engine.replace_mold_spots(spots);
        engine.apply_remote_difficulty(4.0);
        let spread = engine.grow_mold();
        assert!(spread > 0);
        assert!(spread <= GROWTH_BATCH_LIMIT * 3);
    }
}

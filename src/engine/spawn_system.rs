use super::*;
use crate::config::DifficultyCurve;
use crate::constants::{MIN_RATE_MS, RATE_STEP_MS, SPAWNS_PER_DIFFICULTY_STEP, SPAWN_ATTEMPTS};

impl MoldEngine {
    /// Seeds a new size-1 spot on a random non-mold cell. Gives up silently
    /// after a bounded number of picks.
    pub fn spawn_mold(&mut self) -> Option<(i32, i32)> {
        if self.state.game_over || self.state.grid.cell_count() == 0 {
            return None;
        }

        let width = self.state.grid.width();
        let height = self.state.grid.height();
        let mut target = None;
        for _ in 0..SPAWN_ATTEMPTS {
            let x = self.rng.int(0, width - 1);
            let y = self.rng.int(0, height - 1);
            if !self.state.grid.is(x, y, TerrainCell::Mold) {
                target = Some((x, y));
                break;
            }
        }
        let (x, y) = target?;

        self.state.grid.set(x, y, TerrainCell::Mold);
        self.state.mold_spots.push(MoldSpot::seed(x, y));
        self.spawn_count += 1;
        self.events.push(EngineEvent::MoldSpawned { x, y });

        if self.config.difficulty_curve == DifficultyCurve::SpawnCount
            && self.spawn_count % SPAWNS_PER_DIFFICULTY_STEP == 0
        {
            self.state.spawn_rate_ms = step_rate(self.state.spawn_rate_ms);
            self.state.growth_rate_ms = step_rate(self.state.growth_rate_ms);
            self.set_difficulty(self.state.difficulty + 1.0);
        }

        self.maybe_check_game_over();
        Some((x, y))
    }
}

fn step_rate(rate_ms: u64) -> u64 {
    rate_ms.saturating_sub(RATE_STEP_MS).max(MIN_RATE_MS)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::SimulationConfig;

    #[test]
    fn every_fifth_spawn_steps_difficulty() {
        let mut engine = MoldEngine::new(SimulationConfig::default().with_size(20, 20), 3);
        for _ in 0..4 {
            engine.spawn_mold();
        }
        assert_eq!(engine.state().difficulty, 1.0);
        engine.spawn_mold();
        assert_eq!(engine.state().difficulty, 2.0);
        assert_eq!(engine.state().spawn_rate_ms, 4_500);
        assert_eq!(engine.state().growth_rate_ms, 7_500);

        for _ in 0..100 {
            engine.spawn_mold();
        }
        assert_eq!(engine.state().spawn_rate_ms, MIN_RATE_MS);
        assert_eq!(engine.state().growth_rate_ms, MIN_RATE_MS);
    }

    #[test]
    fn spawn_never_lands_on_existing_mold() {
        let mut engine = MoldEngine::new(SimulationConfig::default().with_size(4, 4), 1);
        let mut seen = HashSet::new();
        for _ in 0..12 {
            if let Some(cell) = engine.spawn_mold() {
                assert!(seen.insert(cell), "spawned twice on {cell:?}");
            }
        }
        assert_eq!(engine.state().mold_spots.len(), seen.len());
    }

    #[test]
    fn spawn_on_saturated_grid_is_a_noop() {
        let mut engine = MoldEngine::new(SimulationConfig::default().with_size(3, 3), 1);
        let spots: Vec<MoldSpot> = (0..9).map(|i| MoldSpot::seed(i % 3, i / 3)).collect();
        engine.replace_mold_spots(spots);
        let before = engine.state().clone();
        assert!(engine.spawn_mold().is_none());
        assert_eq!(engine.state(), &before);
    }

    #[test]
    fn player_curve_does_not_step_on_spawns() {
        let config = SimulationConfig::default()
            .with_size(20, 20)
            .with_curve(DifficultyCurve::PlayerCount);
        let mut engine = MoldEngine::new(config, 3);
        for _ in 0..10 {
            engine.spawn_mold();
        }
        assert_eq!(engine.state().difficulty, 1.0);
    }
}

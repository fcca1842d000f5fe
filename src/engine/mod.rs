use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DifficultyCurve, SimulationConfig};
use crate::constants::{
    get_mesh_difficulty, get_rate_for_difficulty, get_rate_for_player_count,
    GAME_OVER_CHECK_EVERY, GAME_OVER_HARD_RATIO, GAME_OVER_MIN_CLEAN_FRACTION,
    GAME_OVER_SAMPLES, GAME_OVER_SAMPLE_RATIO,
};
use crate::protocol::GameStatePayload;
use crate::rng::Rng;
use crate::terrain::generate_terrain;
use crate::types::{Grid, MoldSpot, TerrainCell};

mod growth_system;
mod spawn_system;
mod utils;

use self::utils::{dedupe_spots, simulation_seed};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    MoldSpawned {
        x: i32,
        y: i32,
    },
    MoldSpread {
        from: (i32, i32),
        x: i32,
        y: i32,
    },
    MoldRemoved {
        x: i32,
        y: i32,
        by: Option<String>,
    },
    DifficultyChanged {
        difficulty: f64,
    },
    GameOver {
        #[serde(rename = "moldCount")]
        mold_count: usize,
    },
}

/// Everything the simulation mutates. Mirrors replace it wholesale from
/// incoming state; only the authority mutates it through [`MoldEngine`].
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationState {
    pub seed: u32,
    pub grid: Grid,
    pub original_grid: Grid,
    pub mold_spots: Vec<MoldSpot>,
    pub defeated_count: u64,
    pub difficulty: f64,
    pub spawn_rate_ms: u64,
    pub growth_rate_ms: u64,
    pub game_over: bool,
}

impl SimulationState {
    /// Lists every broken invariant: the grid/spot bijection, duplicate
    /// spots, mold in the baseline, and mismatched grid sizes.
    pub fn audit(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.grid.width() != self.original_grid.width()
            || self.grid.height() != self.original_grid.height()
        {
            problems.push(format!(
                "grid is {}x{} but baseline is {}x{}",
                self.grid.width(),
                self.grid.height(),
                self.original_grid.width(),
                self.original_grid.height()
            ));
        }

        let baseline_mold = self.original_grid.count(TerrainCell::Mold);
        if baseline_mold > 0 {
            problems.push(format!("baseline contains {baseline_mold} mold cells"));
        }

        let mut seen = HashSet::new();
        for spot in &self.mold_spots {
            if !seen.insert((spot.x, spot.y)) {
                problems.push(format!("duplicate spot at ({},{})", spot.x, spot.y));
            }
            if !self.grid.is(spot.x, spot.y, TerrainCell::Mold) {
                problems.push(format!("spot at ({},{}) over a clean cell", spot.x, spot.y));
            }
            if spot.size < 1 || spot.growth_rate < 1.0 {
                problems.push(format!(
                    "spot at ({},{}) has size {} growth rate {}",
                    spot.x, spot.y, spot.size, spot.growth_rate
                ));
            }
        }

        for (x, y, cell) in self.grid.iter() {
            if cell == TerrainCell::Mold && !seen.contains(&(x, y)) {
                problems.push(format!("mold cell ({x},{y}) has no spot"));
            }
        }

        if self.difficulty < 1.0 {
            problems.push(format!("difficulty {} below 1", self.difficulty));
        }

        problems
    }

    pub fn mold_count(&self) -> usize {
        self.mold_spots.len()
    }

    /// The compact per-tick broadcast. The baseline is left out since it
    /// never changes after generation.
    pub fn to_broadcast(&self) -> GameStatePayload {
        GameStatePayload {
            grid: Some(self.grid.clone()),
            mold_spots: Some(self.mold_spots.clone()),
            defeated_count: Some(self.defeated_count),
            difficulty: Some(self.difficulty),
            game_over: Some(self.game_over),
            ..GameStatePayload::default()
        }
    }

    /// Everything a newly joined participant needs, baseline included.
    pub fn to_full_sync(&self) -> GameStatePayload {
        GameStatePayload {
            original_grid: Some(self.original_grid.clone()),
            seed: Some(self.seed),
            ..self.to_broadcast()
        }
    }
}

#[derive(Clone, Debug)]
pub struct MoldEngine {
    config: SimulationConfig,
    state: SimulationState,
    rng: Rng,
    player_count: usize,
    spawn_count: u64,
    events: Vec<EngineEvent>,
}

impl MoldEngine {
    pub fn new(config: SimulationConfig, seed: u32) -> Self {
        let state = Self::fresh_state(&config, seed);
        let mut engine = Self {
            config,
            state,
            rng: Rng::new(simulation_seed(seed)),
            player_count: 1,
            spawn_count: 0,
            events: Vec::new(),
        };
        engine.apply_curve_for_roster();
        engine
    }

    fn fresh_state(config: &SimulationConfig, seed: u32) -> SimulationState {
        let terrain = generate_terrain(config.width, config.height, seed);
        SimulationState {
            seed,
            grid: terrain.grid,
            original_grid: terrain.original,
            mold_spots: Vec::new(),
            defeated_count: 0,
            difficulty: 1.0,
            spawn_rate_ms: config.initial_spawn_rate_ms,
            growth_rate_ms: config.initial_growth_rate_ms,
            game_over: false,
        }
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn seed(&self) -> u32 {
        self.state.seed
    }

    pub fn player_count(&self) -> usize {
        self.player_count
    }

    pub fn spawn_count(&self) -> u64 {
        self.spawn_count
    }

    pub fn is_game_over(&self) -> bool {
        self.state.game_over
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Regenerates terrain from `seed`, clears every spot and counter, and
    /// resets the rates for the current roster.
    pub fn restart(&mut self, seed: u32) {
        self.state = Self::fresh_state(&self.config, seed);
        self.rng = Rng::new(simulation_seed(seed));
        self.spawn_count = 0;
        self.apply_curve_for_roster();
        info!(seed, "simulation restarted");
    }

    /// Cleanses `(x, y)`. Returns false when the cell is not mold, is out of
    /// range, or the game is already over.
    pub fn remove_mold(&mut self, x: i32, y: i32, by: Option<&str>) -> bool {
        if self.state.game_over || !self.state.grid.is(x, y, TerrainCell::Mold) {
            return false;
        }

        let restored = self
            .state
            .original_grid
            .get(x, y)
            .unwrap_or(TerrainCell::Grass);
        self.state.grid.set(x, y, restored);
        if let Some(index) = self
            .state
            .mold_spots
            .iter()
            .position(|spot| spot.x == x && spot.y == y)
        {
            self.state.mold_spots.remove(index);
        }
        self.state.defeated_count += 1;
        self.events.push(EngineEvent::MoldRemoved {
            x,
            y,
            by: by.map(str::to_string),
        });
        debug!(x, y, by = ?by, defeated = self.state.defeated_count, "mold removed");
        true
    }

    /// Declares game over at 90% coverage, or between 70% and 90% when a
    /// random sample finds fewer than 5% clean cells. Never reverts.
    pub fn check_game_over(&mut self) -> bool {
        if self.state.game_over {
            return true;
        }
        let total = self.state.grid.cell_count();
        if total == 0 {
            return false;
        }

        let mold = self.state.mold_spots.len();
        let ratio = mold as f64 / total as f64;
        let over = if ratio >= GAME_OVER_HARD_RATIO {
            true
        } else if ratio >= GAME_OVER_SAMPLE_RATIO {
            let clean = (0..GAME_OVER_SAMPLES)
                .filter(|_| {
                    let x = self.rng.int(0, self.state.grid.width() - 1);
                    let y = self.rng.int(0, self.state.grid.height() - 1);
                    !self.state.grid.is(x, y, TerrainCell::Mold)
                })
                .count();
            (clean as f64 / GAME_OVER_SAMPLES as f64) < GAME_OVER_MIN_CLEAN_FRACTION
        } else {
            false
        };

        if over {
            self.state.game_over = true;
            self.events.push(EngineEvent::GameOver { mold_count: mold });
            info!(mold, total, "game over");
        }
        over
    }

    pub(crate) fn maybe_check_game_over(&mut self) {
        let count = self.state.mold_spots.len();
        let total = self.state.grid.cell_count();
        if count == 0 || total == 0 {
            return;
        }
        let in_band = count as f64 >= total as f64 * GAME_OVER_SAMPLE_RATIO;
        if count % GAME_OVER_CHECK_EVERY == 0 || in_band {
            self.check_game_over();
        }
    }

    /// Records the roster size and, on the player-driven curve, recomputes
    /// difficulty and both intervals.
    pub fn apply_player_count(&mut self, player_count: usize) {
        self.player_count = player_count.max(1);
        self.apply_curve_for_roster();
    }

    fn apply_curve_for_roster(&mut self) {
        if self.config.difficulty_curve != DifficultyCurve::PlayerCount {
            return;
        }
        let difficulty = get_mesh_difficulty(self.player_count);
        self.state.spawn_rate_ms =
            get_rate_for_player_count(self.config.initial_spawn_rate_ms, self.player_count);
        self.state.growth_rate_ms =
            get_rate_for_player_count(self.config.initial_growth_rate_ms, self.player_count);
        self.set_difficulty(difficulty);
    }

    /// Adopts a difficulty chosen elsewhere and derives the intervals from it.
    pub fn apply_remote_difficulty(&mut self, difficulty: f64) {
        if !difficulty.is_finite() {
            warn!(difficulty, "ignoring non-finite difficulty");
            return;
        }
        let difficulty = difficulty.max(1.0);
        self.state.spawn_rate_ms =
            get_rate_for_difficulty(self.config.initial_spawn_rate_ms, difficulty);
        self.state.growth_rate_ms =
            get_rate_for_difficulty(self.config.initial_growth_rate_ms, difficulty);
        self.set_difficulty(difficulty);
    }

    fn set_difficulty(&mut self, difficulty: f64) {
        if (self.state.difficulty - difficulty).abs() < f64::EPSILON {
            return;
        }
        self.state.difficulty = difficulty;
        self.events
            .push(EngineEvent::DifficultyChanged { difficulty });
        info!(
            difficulty,
            spawn_rate_ms = self.state.spawn_rate_ms,
            growth_rate_ms = self.state.growth_rate_ms,
            "difficulty changed"
        );
    }

    /// Swaps in a new spot list and rebuilds the mold overlay from it.
    /// Spots outside the grid are dropped and duplicates collapse to the
    /// first occurrence. Returns the coordinates that were mold before and
    /// are clean now.
    pub fn replace_mold_spots(&mut self, spots: Vec<MoldSpot>) -> Vec<(i32, i32)> {
        let grid = &self.state.grid;
        let incoming = dedupe_spots(
            spots
                .into_iter()
                .filter(|spot| grid.in_bounds(spot.x, spot.y)),
        );
        let keep: HashSet<(i32, i32)> = incoming.iter().map(|spot| (spot.x, spot.y)).collect();
        let removed: Vec<(i32, i32)> = self
            .state
            .mold_spots
            .iter()
            .map(|spot| (spot.x, spot.y))
            .filter(|coord| !keep.contains(coord))
            .collect();

        self.state.mold_spots = incoming;
        self.rebuild_overlay_from_spots();
        removed
    }

    /// Inserts one spot unless its cell is already mold or out of range.
    pub fn insert_spot(&mut self, spot: MoldSpot) -> bool {
        if !self.state.grid.in_bounds(spot.x, spot.y)
            || self.state.grid.is(spot.x, spot.y, TerrainCell::Mold)
        {
            return false;
        }
        self.state.grid.set(spot.x, spot.y, TerrainCell::Mold);
        self.state.mold_spots.push(spot);
        true
    }

    fn rebuild_overlay_from_spots(&mut self) {
        let spots: HashSet<(i32, i32)> = self
            .state
            .mold_spots
            .iter()
            .map(|spot| (spot.x, spot.y))
            .collect();
        let stale: Vec<(i32, i32)> = self
            .state
            .grid
            .iter()
            .filter(|(x, y, cell)| *cell == TerrainCell::Mold && !spots.contains(&(*x, *y)))
            .map(|(x, y, _)| (x, y))
            .collect();
        for (x, y) in stale {
            let restored = self
                .state
                .original_grid
                .get(x, y)
                .unwrap_or(TerrainCell::Grass);
            self.state.grid.set(x, y, restored);
        }
        for &(x, y) in &spots {
            self.state.grid.set(x, y, TerrainCell::Mold);
        }
    }

    /// Makes the spot list follow the grid: spots over clean cells go, and
    /// mold cells without a spot get one, taking metadata from `hints` when a
    /// matching coordinate exists.
    fn rebuild_spots_from_grid(&mut self, hints: &[MoldSpot]) {
        let grid = &self.state.grid;
        let mut spots: Vec<MoldSpot> = dedupe_spots(
            self.state
                .mold_spots
                .drain(..)
                .filter(|spot| grid.is(spot.x, spot.y, TerrainCell::Mold)),
        );
        let mut known: HashSet<(i32, i32)> = spots.iter().map(|spot| (spot.x, spot.y)).collect();
        for (x, y, cell) in grid.iter() {
            if cell != TerrainCell::Mold || known.contains(&(x, y)) {
                continue;
            }
            let spot = hints
                .iter()
                .find(|hint| hint.x == x && hint.y == y)
                .cloned()
                .unwrap_or_else(|| MoldSpot::seed(x, y));
            known.insert((x, y));
            spots.push(spot);
        }
        self.state.mold_spots = spots;
    }

    /// Mirrors state received from the authority. The baseline is only
    /// accepted when mold-free and the same size as the grid, and a new seed
    /// regenerates terrain locally. Spot lists go through
    /// [`crate::sync::should_replace_spots`]. Returns cells cleansed remotely.
    pub fn apply_remote_state(&mut self, payload: &GameStatePayload) -> Vec<(i32, i32)> {
        let mut removed = Vec::new();

        if let Some(seed) = payload.seed {
            if seed != self.state.seed && payload.grid.is_none() {
                info!(seed, "regenerating terrain from remote seed");
                let terrain = generate_terrain(self.config.width, self.config.height, seed);
                self.state.seed = seed;
                self.state.grid = terrain.grid;
                self.state.original_grid = terrain.original;
                self.state.mold_spots.clear();
            } else {
                self.state.seed = seed;
            }
        }

        if let Some(original) = &payload.original_grid {
            if original.count(TerrainCell::Mold) > 0 {
                warn!("ignoring baseline grid that contains mold");
            } else {
                self.state.original_grid = original.clone();
            }
        }

        let grid_applied = match &payload.grid {
            Some(grid)
                if grid.width() == self.state.original_grid.width()
                    && grid.height() == self.state.original_grid.height() =>
            {
                self.state.grid = grid.clone();
                true
            }
            Some(grid) => {
                warn!(
                    width = grid.width(),
                    height = grid.height(),
                    "ignoring grid whose size does not match the baseline"
                );
                false
            }
            None => false,
        };

        let incoming = payload.mold_spots.as_deref();
        if let Some(spots) = incoming {
            if crate::sync::should_replace_spots(&self.state.mold_spots, spots) {
                removed = self.replace_mold_spots(spots.to_vec());
            }
        }
        if grid_applied {
            let before: HashSet<(i32, i32)> = self
                .state
                .mold_spots
                .iter()
                .map(|spot| (spot.x, spot.y))
                .collect();
            self.rebuild_spots_from_grid(incoming.unwrap_or_default());
            let after: HashSet<(i32, i32)> = self
                .state
                .mold_spots
                .iter()
                .map(|spot| (spot.x, spot.y))
                .collect();
            for coord in before.difference(&after) {
                if !removed.contains(coord) {
                    removed.push(*coord);
                }
            }
        }

        if let Some(defeated) = payload.defeated_count {
            self.state.defeated_count = defeated;
        }
        if let Some(player_count) = payload.player_count {
            self.player_count = player_count.max(1);
        }
        if let Some(difficulty) = payload.difficulty {
            self.apply_remote_difficulty(difficulty);
        }
        if let Some(game_over) = payload.game_over {
            if game_over && !self.state.game_over {
                info!("game over received from authority");
            }
            self.state.game_over = game_over;
        }

        removed
    }
}

use std::path::PathBuf;

use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::constants::{
    GRID_HEIGHT, GRID_WIDTH, INITIAL_MOLD_GROWTH_RATE_MS, INITIAL_MOLD_SPAWN_RATE_MS,
    RELAY_SEED_RANGE,
};

const DEFAULT_RELAY_PORT: u16 = 3000;

/// How `grow_mold` picks spots and neighbours.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthMode {
    /// At most 100 sampled spots, `min(3, ceil(size / 8))` attempts, 4-neighbours.
    #[default]
    Batched,
    /// Every spot, `ceil(size / 5)` attempts, 8-neighbours.
    Full,
}

impl GrowthMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "batched" => Some(Self::Batched),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// What drives difficulty and the spawn/growth intervals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyCurve {
    /// Every fifth spawn raises difficulty by one.
    #[default]
    SpawnCount,
    /// Difficulty follows the roster size (peer mesh).
    PlayerCount,
    /// Difficulty is dictated by the relay.
    Remote,
}

impl DifficultyCurve {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "spawn_count" => Some(Self::SpawnCount),
            "player_count" => Some(Self::PlayerCount),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub width: i32,
    pub height: i32,
    pub initial_spawn_rate_ms: u64,
    pub initial_growth_rate_ms: u64,
    pub growth_mode: GrowthMode,
    pub difficulty_curve: DifficultyCurve,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: GRID_WIDTH,
            height: GRID_HEIGHT,
            initial_spawn_rate_ms: INITIAL_MOLD_SPAWN_RATE_MS,
            initial_growth_rate_ms: INITIAL_MOLD_GROWTH_RATE_MS,
            growth_mode: GrowthMode::default(),
            difficulty_curve: DifficultyCurve::default(),
        }
    }
}

impl SimulationConfig {
    pub fn with_curve(mut self, difficulty_curve: DifficultyCurve) -> Self {
        self.difficulty_curve = difficulty_curve;
        self
    }

    pub fn with_size(mut self, width: i32, height: i32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub port: u16,
    pub seed: u32,
    pub static_dir: Option<PathBuf>,
}

impl RelayConfig {
    /// Reads `PORT`, `RELAY_SEED` and `STATIC_DIR`. A missing or unparsable
    /// seed is replaced by a random one.
    pub fn load() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_RELAY_PORT);
        let seed = std::env::var("RELAY_SEED")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or_else(random_relay_seed);

        Self {
            port,
            seed,
            static_dir: resolve_static_dir(),
        }
    }

    pub fn with_overrides(mut self, port: Option<u16>, seed: Option<u32>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(seed) = seed {
            self.seed = seed;
        }
        self
    }
}

pub fn random_relay_seed() -> u32 {
    rand::rng().random_range(0..RELAY_SEED_RANGE)
}

fn resolve_static_dir() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var("STATIC_DIR") {
        let path = PathBuf::from(raw);
        if path.join("index.html").is_file() {
            return Some(path);
        }
    }

    let candidates = [PathBuf::from("public"), PathBuf::from("dist")];
    candidates
        .into_iter()
        .find(|path| path.join("index.html").is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulation_config_fills_missing_fields_from_defaults() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{"width":10,"growth_mode":"full"}"#).unwrap();
        assert_eq!(config.width, 10);
        assert_eq!(config.height, GRID_HEIGHT);
        assert_eq!(config.growth_mode, GrowthMode::Full);
        assert_eq!(config.difficulty_curve, DifficultyCurve::SpawnCount);
        assert_eq!(config.initial_spawn_rate_ms, INITIAL_MOLD_SPAWN_RATE_MS);
    }

    #[test]
    fn variant_names_parse() {
        assert_eq!(GrowthMode::parse("full"), Some(GrowthMode::Full));
        assert_eq!(DifficultyCurve::parse("player_count"), Some(DifficultyCurve::PlayerCount));
        assert_eq!(DifficultyCurve::parse("PlayerCount"), None);
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let config = RelayConfig {
            port: 3000,
            seed: 5,
            static_dir: None,
        }
        .with_overrides(Some(4000), None);
        assert_eq!(config.port, 4000);
        assert_eq!(config.seed, 5);
    }

    #[test]
    fn random_seed_stays_in_range() {
        for _ in 0..1_000 {
            assert!(random_relay_seed() < RELAY_SEED_RANGE);
        }
    }
}

pub const GRID_WIDTH: i32 = 25;
pub const GRID_HEIGHT: i32 = 400;
/// Largest side a grid accepts. Keeps `width * height` and row-major
/// indices inside `i32`.
pub const MAX_GRID_SIDE: i32 = 2048;

pub const TARGET_FPS: u64 = 30;
pub const FRAME_MS: u64 = 1000 / TARGET_FPS;

pub const INITIAL_MOLD_SPAWN_RATE_MS: u64 = 5_000;
pub const INITIAL_MOLD_GROWTH_RATE_MS: u64 = 8_000;
pub const MIN_RATE_MS: u64 = 1_000;
pub const RATE_STEP_MS: u64 = 500;

pub const SPAWN_ATTEMPTS: usize = 100;
pub const SPAWNS_PER_DIFFICULTY_STEP: u64 = 5;

pub const GROWTH_BATCH_LIMIT: usize = 100;
pub const GROWTH_CHANCE_PER_DIFFICULTY: f64 = 0.3;
pub const GROWTH_RATE_INHERITANCE: f64 = 1.1;

pub const GAME_OVER_CHECK_EVERY: usize = 50;
pub const GAME_OVER_HARD_RATIO: f64 = 0.9;
pub const GAME_OVER_SAMPLE_RATIO: f64 = 0.7;
pub const GAME_OVER_SAMPLES: usize = 100;
pub const GAME_OVER_MIN_CLEAN_FRACTION: f64 = 0.05;

pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const RECONNECT_BACKOFF_FACTOR: f64 = 1.5;

pub const MAX_RELAY_DIFFICULTY: f64 = 5.0;
pub const RELAY_SEED_RANGE: u32 = 1_000_000;

/// Difficulty used by the peer mesh: half a level per extra player.
pub fn get_mesh_difficulty(player_count: usize) -> f64 {
    let extra = player_count.saturating_sub(1) as f64;
    (1.0 + extra * 0.5).floor().max(1.0)
}

/// Difficulty used by the relay: a fifth of a level per extra player, capped.
pub fn get_relay_difficulty(player_count: usize) -> f64 {
    let extra = player_count.saturating_sub(1) as f64;
    (1.0 + extra * 0.2).min(MAX_RELAY_DIFFICULTY)
}

pub fn get_rate_for_player_count(initial_ms: u64, player_count: usize) -> u64 {
    let reduction = RATE_STEP_MS.saturating_mul(player_count.saturating_sub(1) as u64);
    initial_ms.saturating_sub(reduction).max(MIN_RATE_MS)
}

pub fn get_rate_for_difficulty(initial_ms: u64, difficulty: f64) -> u64 {
    let reduction = ((difficulty - 1.0).max(0.0) * RATE_STEP_MS as f64).round() as u64;
    initial_ms.saturating_sub(reduction).max(MIN_RATE_MS)
}

pub fn get_reconnect_delay_ms(attempts: u32) -> u64 {
    let delay = RECONNECT_BASE_DELAY_MS as f64 * RECONNECT_BACKOFF_FACTOR.powi(attempts.min(64) as i32);
    if !delay.is_finite() {
        return RECONNECT_MAX_DELAY_MS;
    }
    (delay as u64).min(RECONNECT_MAX_DELAY_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_difficulty_is_monotonic_and_at_least_one() {
        let mut previous = 0.0;
        for players in 0..40 {
            let difficulty = get_mesh_difficulty(players);
            assert!(difficulty >= 1.0);
            assert!(difficulty >= previous);
            previous = difficulty;
        }
        assert_eq!(get_mesh_difficulty(1), 1.0);
        assert_eq!(get_mesh_difficulty(2), 1.0);
        assert_eq!(get_mesh_difficulty(3), 2.0);
        assert_eq!(get_mesh_difficulty(5), 3.0);
    }

    #[test]
    fn relay_difficulty_is_monotonic_and_capped() {
        let mut previous = 0.0;
        for players in 1..60 {
            let difficulty = get_relay_difficulty(players);
            assert!(difficulty >= previous);
            assert!(difficulty <= MAX_RELAY_DIFFICULTY);
            previous = difficulty;
        }
        assert!((get_relay_difficulty(3) - 1.4).abs() < 1e-9);
        assert_eq!(get_relay_difficulty(100), MAX_RELAY_DIFFICULTY);
    }

    #[test]
    fn rates_never_drop_below_floor() {
        for players in 0..50 {
            assert!(get_rate_for_player_count(INITIAL_MOLD_SPAWN_RATE_MS, players) >= MIN_RATE_MS);
            assert!(get_rate_for_player_count(INITIAL_MOLD_GROWTH_RATE_MS, players) >= MIN_RATE_MS);
        }
        for tenth in 0..200 {
            let difficulty = tenth as f64 / 10.0;
            assert!(get_rate_for_difficulty(INITIAL_MOLD_SPAWN_RATE_MS, difficulty) >= MIN_RATE_MS);
        }
        assert_eq!(get_rate_for_player_count(INITIAL_MOLD_SPAWN_RATE_MS, 2), 4_500);
        assert_eq!(get_rate_for_difficulty(INITIAL_MOLD_GROWTH_RATE_MS, 1.4), 7_800);
    }

    #[test]
    fn reconnect_delay_backs_off_and_caps() {
        assert_eq!(get_reconnect_delay_ms(0), 1_000);
        assert_eq!(get_reconnect_delay_ms(1), 1_500);
        assert_eq!(get_reconnect_delay_ms(2), 2_250);
        assert_eq!(get_reconnect_delay_ms(20), RECONNECT_MAX_DELAY_MS);
        assert_eq!(get_reconnect_delay_ms(u32::MAX), RECONNECT_MAX_DELAY_MS);
    }
}

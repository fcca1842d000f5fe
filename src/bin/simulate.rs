use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use mold_defense_server::config::{DifficultyCurve, GrowthMode, SimulationConfig};
use mold_defense_server::constants::{FRAME_MS, GRID_HEIGHT, GRID_WIDTH, MIN_RATE_MS};
use mold_defense_server::engine::{EngineEvent, MoldEngine, SimulationState};
use mold_defense_server::rng::Rng;
use mold_defense_server::scheduler::{ManualClock, TickScheduler};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

/// Each simulated player cleanses one random mold cell this often.
const CLEAN_INTERVAL_MS: u64 = 1_200;
const CLEANER_SEED_SALT: u32 = 0x5f37_59df;
const MINUTE_MS: u64 = 60_000;

/// Plays headless games against the contamination simulator and reports how
/// far the mold got. Exits 1 when any simulation invariant broke.
#[derive(Parser, Debug)]
#[command(name = "simulate", version)]
struct Cli {
    /// Run one custom scenario instead of the built-in set.
    #[arg(long)]
    single: bool,
    /// Simulated cleaners.
    #[arg(long)]
    players: Option<usize>,
    #[arg(long)]
    minutes: Option<u64>,
    /// spawn_count, player_count or remote
    #[arg(long)]
    curve: Option<String>,
    /// batched or full
    #[arg(long)]
    growth: Option<String>,
    #[arg(long)]
    width: Option<i32>,
    #[arg(long)]
    height: Option<i32>,
    #[arg(long)]
    seed: Option<u32>,
    /// Writes a JSON contamination report here.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Debug)]
struct Scenario {
    name: String,
    players: usize,
    minutes: u64,
    seed: u32,
    config: SimulationConfig,
}

/// How a game ended: the mold overran the map, or the cleaners held it
/// until time ran out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum Outcome {
    Overrun {
        #[serde(rename = "atMs")]
        at_ms: u64,
    },
    Held,
}

/// One broken simulation invariant, stamped with simulated time.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Violation {
    at_ms: u64,
    problem: String,
}

/// The stdout line for one scenario.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContaminationRun {
    scenario: String,
    seed: u32,
    players: usize,
    growth_mode: GrowthMode,
    difficulty_curve: DifficultyCurve,
    #[serde(flatten)]
    outcome: Outcome,
    survived_ms: u64,
    spawned: u64,
    spread: u64,
    removed: u64,
    peak_mold: usize,
    /// Share of cells that were mold at the peak.
    peak_coverage: f64,
    final_mold: usize,
    final_difficulty: f64,
    /// Mold count at the end of each full simulated minute.
    mold_by_minute: Vec<usize>,
    violations: Vec<Violation>,
}

impl ContaminationRun {
    fn overran(&self) -> bool {
        matches!(self.outcome, Outcome::Overrun { .. })
    }
}

/// Totals across every scenario of one invocation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContaminationReport {
    generated_at: String,
    held: usize,
    overrun: usize,
    cells_cleansed: u64,
    worst_peak_coverage: f64,
    /// Problem text mapped to how often it was seen.
    broken_invariants: BTreeMap<String, usize>,
    runs: Vec<ContaminationRun>,
}

impl ContaminationReport {
    fn new(generated_at: DateTime<Utc>, runs: Vec<ContaminationRun>) -> Self {
        let overrun = runs.iter().filter(|run| run.overran()).count();
        let mut broken_invariants = BTreeMap::new();
        for violation in runs.iter().flat_map(|run| &run.violations) {
            *broken_invariants
                .entry(violation.problem.clone())
                .or_insert(0) += 1;
        }
        Self {
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            held: runs.len() - overrun,
            overrun,
            cells_cleansed: runs.iter().map(|run| run.removed).sum(),
            worst_peak_coverage: runs
                .iter()
                .map(|run| run.peak_coverage)
                .fold(0.0, f64::max),
            broken_invariants,
            runs,
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let mut runs = Vec::new();
    for scenario in resolve_scenarios(&cli) {
        info!(
            scenario = %scenario.name,
            seed = scenario.seed,
            players = scenario.players,
            minutes = scenario.minutes,
            growth = ?scenario.config.growth_mode,
            curve = ?scenario.config.difficulty_curve,
            "scenario started"
        );
        let run = run_scenario(&scenario);
        for violation in &run.violations {
            warn!(
                scenario = %scenario.name,
                at_ms = violation.at_ms,
                problem = %violation.problem,
                "invariant broken"
            );
        }
        info!(
            scenario = %scenario.name,
            outcome = ?run.outcome,
            peak_mold = run.peak_mold,
            removed = run.removed,
            "scenario finished"
        );

        match serde_json::to_string(&run) {
            Ok(line) => println!("{line}"),
            Err(err) => error!(scenario = %scenario.name, error = %err, "failed to encode result"),
        }
        runs.push(run);
    }

    let report = ContaminationReport::new(Utc::now(), runs);
    info!(
        held = report.held,
        overrun = report.overrun,
        cleansed = report.cells_cleansed,
        broken = report.broken_invariants.len(),
        "run finished"
    );

    if let Some(path) = cli.report.as_ref() {
        let written = serde_json::to_string_pretty(&report)
            .map_err(std::io::Error::other)
            .and_then(|text| std::fs::write(path, text));
        if let Err(err) = written {
            error!(path = %path.display(), error = %err, "failed to write report");
            std::process::exit(2);
        }
        info!(path = %path.display(), "report written");
    }

    if !report.broken_invariants.is_empty() {
        std::process::exit(1);
    }
}

/// Results go to stdout, so logs go to stderr.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Runs one game on a simulated clock, with `players` cleaners removing
/// mold at a fixed pace, until game over or the time limit.
fn run_scenario(scenario: &Scenario) -> ContaminationRun {
    let clock = ManualClock::new(0);
    let mut scheduler = TickScheduler::new(clock.clone());
    let mut engine = MoldEngine::new(scenario.config.clone(), scenario.seed);
    engine.apply_player_count(scenario.players);
    let mut cleaner = Rng::new(scenario.seed ^ CLEANER_SEED_SALT);
    let cells = engine.state().grid.cell_count().max(1);

    let limit_ms = scenario.minutes * MINUTE_MS;
    let clean_every = (CLEAN_INTERVAL_MS / scenario.players.max(1) as u64).max(1);
    let mut next_clean_ms = clean_every;

    let mut spawned = 0u64;
    let mut spread = 0u64;
    let mut removed = 0u64;
    let mut peak_mold = 0usize;
    let mut mold_by_minute = Vec::new();
    let mut violations = Vec::new();
    let mut previous = engine.state().clone();

    let mut elapsed_ms = 0u64;
    while elapsed_ms < limit_ms && !engine.is_game_over() {
        clock.advance(FRAME_MS);
        elapsed_ms += FRAME_MS;

        let state = engine.state();
        let due = scheduler.poll(state.spawn_rate_ms, state.growth_rate_ms);
        if due.spawn {
            engine.spawn_mold();
        }
        if due.growth {
            engine.grow_mold();
        }
        if elapsed_ms >= next_clean_ms {
            next_clean_ms += clean_every;
            let spots = &engine.state().mold_spots;
            if !spots.is_empty() {
                let target = &spots[cleaner.pick_index(spots.len())];
                let (x, y) = (target.x, target.y);
                engine.remove_mold(x, y, Some("sim"));
            }
        }
        if elapsed_ms / MINUTE_MS > mold_by_minute.len() as u64 {
            mold_by_minute.push(engine.state().mold_count());
        }

        let events = engine.take_events();
        if events.is_empty() {
            continue;
        }
        for event in &events {
            match event {
                EngineEvent::MoldSpawned { .. } => spawned += 1,
                EngineEvent::MoldSpread { .. } => spread += 1,
                EngineEvent::MoldRemoved { .. } => removed += 1,
                _ => {}
            }
        }

        let state = engine.state();
        peak_mold = peak_mold.max(state.mold_count());
        violations.extend(
            state_violations(&previous, state)
                .into_iter()
                .map(|problem| Violation {
                    at_ms: elapsed_ms,
                    problem,
                }),
        );
        previous = state.clone();
    }

    let state = engine.state();
    ContaminationRun {
        scenario: scenario.name.clone(),
        seed: scenario.seed,
        players: scenario.players,
        growth_mode: scenario.config.growth_mode,
        difficulty_curve: scenario.config.difficulty_curve,
        outcome: if state.game_over {
            Outcome::Overrun { at_ms: elapsed_ms }
        } else {
            Outcome::Held
        },
        survived_ms: elapsed_ms,
        spawned,
        spread,
        removed,
        peak_mold,
        peak_coverage: peak_mold as f64 / cells as f64,
        final_mold: state.mold_count(),
        final_difficulty: state.difficulty,
        mold_by_minute,
        violations,
    }
}

/// The state audit plus the step-to-step rules: rates stay above the floor,
/// difficulty and the defeated count never fall, game over never reverts.
fn state_violations(previous: &SimulationState, state: &SimulationState) -> Vec<String> {
    let mut problems = state.audit();
    if state.spawn_rate_ms < MIN_RATE_MS || state.growth_rate_ms < MIN_RATE_MS {
        problems.push(format!(
            "rate below floor: spawn {} growth {}",
            state.spawn_rate_ms, state.growth_rate_ms
        ));
    }
    if state.difficulty < previous.difficulty {
        problems.push(format!(
            "difficulty dropped from {} to {}",
            previous.difficulty, state.difficulty
        ));
    }
    if previous.game_over && !state.game_over {
        problems.push("game over reverted".to_string());
    }
    if state.defeated_count < previous.defeated_count {
        problems.push("defeated count went backwards".to_string());
    }
    problems
}

fn resolve_scenarios(cli: &Cli) -> Vec<Scenario> {
    let seed = cli
        .seed
        .unwrap_or_else(|| Utc::now().timestamp_millis() as u32);
    let base = SimulationConfig::default().with_size(
        cli.width.unwrap_or(GRID_WIDTH).max(1),
        cli.height.unwrap_or(GRID_HEIGHT).max(1),
    );

    let custom = cli.single
        || cli.players.is_some()
        || cli.minutes.is_some()
        || cli.curve.is_some()
        || cli.growth.is_some();
    if custom {
        let players = cli.players.unwrap_or(1).clamp(1, 32);
        let config = SimulationConfig {
            growth_mode: cli
                .growth
                .as_deref()
                .and_then(GrowthMode::parse)
                .unwrap_or_default(),
            difficulty_curve: cli
                .curve
                .as_deref()
                .and_then(DifficultyCurve::parse)
                .unwrap_or_default(),
            ..base
        };
        return vec![Scenario {
            name: format!("custom-p{players}"),
            players,
            minutes: cli.minutes.unwrap_or(3).clamp(1, 30),
            seed,
            config,
        }];
    }

    vec![
        Scenario {
            name: "solo-spawn-curve".to_string(),
            players: 1,
            minutes: 3,
            seed,
            config: base.clone(),
        },
        Scenario {
            name: "mesh-four-players".to_string(),
            players: 4,
            minutes: 5,
            seed: seed.wrapping_add(1),
            config: base.clone().with_curve(DifficultyCurve::PlayerCount),
        },
        Scenario {
            name: "full-growth".to_string(),
            players: 2,
            minutes: 3,
            seed: seed.wrapping_add(2),
            config: SimulationConfig {
                growth_mode: GrowthMode::Full,
                ..base
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn small_scenario(players: usize, growth_mode: GrowthMode) -> Scenario {
        Scenario {
            name: "small".to_string(),
            players,
            minutes: 2,
            seed: 42,
            config: SimulationConfig {
                growth_mode,
                ..SimulationConfig::default().with_size(10, 20)
            },
        }
    }

    fn finished_run(outcome: Outcome, removed: u64, peak_coverage: f64) -> ContaminationRun {
        ContaminationRun {
            scenario: "fixture".to_string(),
            seed: 1,
            players: 1,
            growth_mode: GrowthMode::Batched,
            difficulty_curve: DifficultyCurve::SpawnCount,
            outcome,
            survived_ms: 60_000,
            spawned: 0,
            spread: 0,
            removed,
            peak_mold: 0,
            peak_coverage,
            final_mold: 0,
            final_difficulty: 1.0,
            mold_by_minute: Vec::new(),
            violations: Vec::new(),
        }
    }

    #[test]
    fn runs_are_reproducible_and_clean() {
        let first = run_scenario(&small_scenario(1, GrowthMode::Batched));
        let second = run_scenario(&small_scenario(1, GrowthMode::Batched));
        assert_eq!(first, second);
        assert!(first.violations.is_empty(), "{:?}", first.violations);
        assert!(first.spawned > 0);
        assert!(first.peak_coverage > 0.0 && first.peak_coverage <= 1.0);
    }

    #[test]
    fn full_growth_mode_stays_consistent() {
        let run = run_scenario(&small_scenario(3, GrowthMode::Full));
        assert!(run.violations.is_empty(), "{:?}", run.violations);
        assert!(run.removed > 0);
        assert!(run.survived_ms <= 2 * MINUTE_MS + FRAME_MS);
    }

    #[test]
    fn one_mold_sample_per_full_minute() {
        let run = run_scenario(&small_scenario(2, GrowthMode::Batched));
        assert_eq!(run.mold_by_minute.len() as u64, run.survived_ms / MINUTE_MS);
        assert!(run.mold_by_minute.iter().all(|&mold| mold <= run.peak_mold));
        if !run.overran() {
            assert_eq!(run.outcome, Outcome::Held);
            assert_eq!(run.mold_by_minute.len(), 2);
        }
    }

    #[test]
    fn reverted_game_over_is_a_violation() {
        let engine = MoldEngine::new(SimulationConfig::default().with_size(5, 5), 1);
        let mut previous = engine.state().clone();
        previous.game_over = true;
        let problems = state_violations(&previous, engine.state());
        assert!(problems.contains(&"game over reverted".to_string()));
    }

    #[test]
    fn report_tallies_outcomes_and_invariants() {
        let mut broken = finished_run(Outcome::Overrun { at_ms: 30_000 }, 4, 0.92);
        broken.violations = vec![
            Violation {
                at_ms: 10,
                problem: "game over reverted".to_string(),
            },
            Violation {
                at_ms: 20,
                problem: "game over reverted".to_string(),
            },
        ];
        let runs = vec![finished_run(Outcome::Held, 6, 0.4), broken];
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();

        let report = ContaminationReport::new(at, runs);
        assert_eq!(report.generated_at, "2026-01-02T03:04:05.000Z");
        assert_eq!((report.held, report.overrun), (1, 1));
        assert_eq!(report.cells_cleansed, 10);
        assert!((report.worst_peak_coverage - 0.92).abs() < 1e-9);
        assert_eq!(
            report.broken_invariants,
            BTreeMap::from([("game over reverted".to_string(), 2)])
        );
    }

    #[test]
    fn result_line_flattens_outcome() {
        let line = serde_json::to_value(finished_run(Outcome::Overrun { at_ms: 900 }, 0, 0.0))
            .unwrap();
        assert_eq!(line["outcome"], "overrun");
        assert_eq!(line["atMs"], 900);
        assert_eq!(line["survivedMs"], 60_000);
        assert!(line["violations"].as_array().unwrap().is_empty());
    }
}

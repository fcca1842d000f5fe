use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::rng::Rng;
use crate::types::{Grid, TerrainCell};

const VILLAGE_CENTER_ATTEMPTS: usize = 50;
const HOUSE_PLACEMENT_ATTEMPTS: usize = 100;
const SAND_CHANCE: f64 = 0.9;
const PATH_ROAD_CHANCE: f64 = 0.85;
const PATH_JITTER: f64 = 2.0;

#[derive(Clone, Copy, Debug)]
pub struct ClusterSpec {
    pub terrain: TerrainCell,
    pub count: usize,
    pub max_size: usize,
    pub min_size: usize,
}

impl ClusterSpec {
    const fn new(terrain: TerrainCell, count: usize, max_size: usize, min_size: usize) -> Self {
        Self {
            terrain,
            count,
            max_size,
            min_size,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TerrainOptions {
    pub clusters: Vec<ClusterSpec>,
    pub villages: usize,
    pub paths: usize,
}

impl Default for TerrainOptions {
    fn default() -> Self {
        Self {
            clusters: vec![
                // lakes
                ClusterSpec::new(TerrainCell::Water, 4, 35, 20),
                // ponds
                ClusterSpec::new(TerrainCell::Water, 7, 12, 6),
                // forests
                ClusterSpec::new(TerrainCell::Tree, 5, 40, 25),
                ClusterSpec::new(TerrainCell::Tree, 8, 18, 10),
                ClusterSpec::new(TerrainCell::Tree, 12, 8, 4),
                // rock formations
                ClusterSpec::new(TerrainCell::Rock, 10, 7, 3),
            ],
            villages: 5,
            paths: 3,
        }
    }
}

/// Generated map: the live grid plus the mold-free baseline used to restore
/// cleansed cells.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Terrain {
    pub seed: u32,
    pub grid: Grid,
    pub original: Grid,
}

pub fn generate_terrain(width: i32, height: i32, seed: u32) -> Terrain {
    generate_terrain_with(width, height, seed, &TerrainOptions::default())
}

pub fn generate_terrain_with(
    width: i32,
    height: i32,
    seed: u32,
    options: &TerrainOptions,
) -> Terrain {
    let mut rng = Rng::new(seed);
    let mut grid = Grid::new(width, height, TerrainCell::Grass);

    if grid.cell_count() > 0 {
        for cluster in &options.clusters {
            stamp_clusters(&mut grid, cluster, &mut rng);
        }
        add_sand_borders(&mut grid, &mut rng);
        for _ in 0..options.villages {
            build_village(&mut grid, &mut rng);
        }
        for _ in 0..options.paths {
            build_cross_map_path(&mut grid, &mut rng);
        }
    }

    Terrain {
        seed,
        original: grid.clone(),
        grid,
    }
}

fn stamp_clusters(grid: &mut Grid, cluster: &ClusterSpec, rng: &mut Rng) {
    let acceptance = match cluster.terrain {
        TerrainCell::Water => 0.9,
        TerrainCell::Tree => 0.85,
        _ => 0.75,
    };

    for _ in 0..cluster.count {
        let start = (
            rng.int(0, grid.width() - 1),
            rng.int(0, grid.height() - 1),
        );
        let target = rng.int(cluster.min_size as i32, cluster.max_size as i32).max(1) as usize;

        let mut frontier = vec![start];
        let mut placed = HashSet::new();
        placed.insert(start);

        while !frontier.is_empty() && placed.len() < target {
            let (x, y) = frontier.remove(rng.pick_index(frontier.len()));
            grid.set(x, y, cluster.terrain);

            for neighbor in grid.neighbors8(x, y) {
                if !placed.contains(&neighbor) && rng.bool(acceptance) {
                    frontier.push(neighbor);
                    placed.insert(neighbor);
                }
            }
        }
    }
}

fn add_sand_borders(grid: &mut Grid, rng: &mut Rng) {
    let mut candidates = Vec::new();
    for y in 0..grid.height() {
        for x in 0..grid.width() {
            if !grid.is(x, y, TerrainCell::Water) {
                continue;
            }
            for (nx, ny) in grid.neighbors8(x, y) {
                let cell = grid.get(nx, ny);
                if cell != Some(TerrainCell::Water)
                    && cell != Some(TerrainCell::Sand)
                    && rng.bool(SAND_CHANCE)
                {
                    candidates.push((nx, ny));
                }
            }
        }
    }

    for (x, y) in candidates {
        if matches!(
            grid.get(x, y),
            Some(TerrainCell::Water | TerrainCell::House | TerrainCell::Road)
        ) {
            continue;
        }
        grid.set(x, y, TerrainCell::Sand);
    }
}

fn build_village(grid: &mut Grid, rng: &mut Rng) {
    // villages keep a 4-cell margin from every edge
    if grid.width() <= 8 || grid.height() <= 8 {
        return;
    }

    let mut center = (0, 0);
    for _ in 0..VILLAGE_CENTER_ATTEMPTS {
        center = (
            rng.int(4, grid.width() - 5),
            rng.int(4, grid.height() - 5),
        );
        if grid.is(center.0, center.1, TerrainCell::Grass) {
            break;
        }
    }

    let house_count = rng.int(7, 12) as usize;
    let radius = house_count as i32 / 2 + 2;
    lay_village_roads(grid, center, radius, rng);
    place_houses(grid, center, house_count, radius, rng);
}

fn lay_village_roads(grid: &mut Grid, (cx, cy): (i32, i32), radius: i32, rng: &mut Rng) {
    let horizontal = rng.bool(0.5);

    for offset in -radius..=radius {
        if horizontal {
            grid.set(cx + offset, cy, TerrainCell::Road);
        } else {
            grid.set(cx, cy + offset, TerrainCell::Road);
        }
    }

    let stub_count = rng.int(2, 3);
    let mut stubs = Vec::new();
    for _ in 0..stub_count {
        let along = rng.int(-radius, radius - 1);
        let anchor = if horizontal { cx + along } else { cy + along };
        let limit = if horizontal { grid.width() } else { grid.height() };
        if anchor >= 0 && anchor < limit {
            stubs.push(anchor);
        }
    }

    for anchor in stubs {
        let length = rng.int(2, 4);
        let direction = if rng.bool(0.5) { -1 } else { 1 };
        for step in 1..=length {
            if horizontal {
                grid.set(anchor, cy + step * direction, TerrainCell::Road);
            } else {
                grid.set(cx + step * direction, anchor, TerrainCell::Road);
            }
        }
    }
}

fn place_houses(
    grid: &mut Grid,
    (cx, cy): (i32, i32),
    house_count: usize,
    radius: i32,
    rng: &mut Rng,
) {
    let mut remaining = house_count;
    let mut attempts = 0;

    while remaining > 0 && attempts < HOUSE_PLACEMENT_ATTEMPTS {
        attempts += 1;
        let x = cx + rng.int(-radius, radius);
        let y = cy + rng.int(-radius, radius);

        let Some(cell) = grid.get(x, y) else {
            continue;
        };
        if matches!(
            cell,
            TerrainCell::Road | TerrainCell::Water | TerrainCell::House
        ) {
            continue;
        }
        if !is_adjacent_to_road(grid, x, y) {
            continue;
        }
        grid.set(x, y, TerrainCell::House);
        remaining -= 1;
    }
}

fn is_adjacent_to_road(grid: &Grid, x: i32, y: i32) -> bool {
    grid.neighbors4(x, y)
        .into_iter()
        .any(|(nx, ny)| grid.is(nx, ny, TerrainCell::Road))
}

fn build_cross_map_path(grid: &mut Grid, rng: &mut Rng) {
    let (width, height) = (grid.width(), grid.height());
    let start = if rng.bool(0.5) {
        let x = if rng.bool(0.5) { 1 } else { width - 2 };
        (x, rng.int(0, height - 1))
    } else {
        let y = if rng.bool(0.5) { 1 } else { height - 2 };
        (rng.int(0, width - 1), y)
    };
    let end = (width - start.0 - 1, height - start.1 - 1);

    if !grid.in_bounds(start.0, start.1) || !grid.in_bounds(end.0, end.1) {
        return;
    }

    let Some(path) = find_path(grid, start, end, rng) else {
        return;
    };

    // path runs from end back to start; the start cell is handled last
    for &(x, y) in path.iter().take(path.len().saturating_sub(1)) {
        if is_pathable_ground(grid, x, y) && rng.bool(PATH_ROAD_CHANCE) {
            grid.set(x, y, TerrainCell::Road);
        }
    }
    if is_pathable_ground(grid, start.0, start.1) {
        grid.set(start.0, start.1, TerrainCell::Road);
    }
}

fn is_pathable_ground(grid: &Grid, x: i32, y: i32) -> bool {
    matches!(grid.get(x, y), Some(TerrainCell::Grass | TerrainCell::Sand))
}

fn is_impassable(grid: &Grid, x: i32, y: i32) -> bool {
    matches!(grid.get(x, y), Some(TerrainCell::Water | TerrainCell::Rock))
}

fn manhattan((ax, ay): (i32, i32), (bx, by): (i32, i32)) -> i32 {
    (ax - bx).abs() + (ay - by).abs()
}

#[derive(Clone, Copy, Debug)]
struct OpenEntry {
    f: f64,
    order: u64,
    cell: (i32, i32),
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f
            .total_cmp(&other.f)
            .then_with(|| self.order.cmp(&other.order))
    }
}

/// A* over the 4-connected grid with Water and Rock impassable. Newly
/// discovered nodes get a random jitter on their f-score so paths wander.
/// Returns the path from `end` back to `start`, both included.
fn find_path(
    grid: &Grid,
    start: (i32, i32),
    end: (i32, i32),
    rng: &mut Rng,
) -> Option<Vec<(i32, i32)>> {
    let mut open = BinaryHeap::new();
    let mut g_score: HashMap<(i32, i32), i32> = HashMap::new();
    let mut h_score: HashMap<(i32, i32), i32> = HashMap::new();
    let mut came_from: HashMap<(i32, i32), (i32, i32)> = HashMap::new();
    let mut closed = HashSet::new();
    let mut order = 0u64;

    let h = manhattan(start, end);
    g_score.insert(start, 0);
    h_score.insert(start, h);
    open.push(Reverse(OpenEntry {
        f: h as f64,
        order,
        cell: start,
    }));

    while let Some(Reverse(entry)) = open.pop() {
        let current = entry.cell;
        if closed.contains(&current) {
            continue;
        }
        if current == end {
            let mut path = vec![current];
            let mut cursor = current;
            while cursor != start {
                cursor = *came_from.get(&cursor)?;
                path.push(cursor);
            }
            return Some(path);
        }
        closed.insert(current);

        let current_g = g_score.get(&current).copied().unwrap_or(0);
        for neighbor in grid.neighbors4(current.0, current.1) {
            if closed.contains(&neighbor) || is_impassable(grid, neighbor.0, neighbor.1) {
                continue;
            }
            let tentative = current_g + 1;
            order += 1;
            match g_score.get(&neighbor).copied() {
                None => {
                    let h = manhattan(neighbor, end);
                    let jitter = rng.next_f64() * PATH_JITTER;
                    g_score.insert(neighbor, tentative);
                    h_score.insert(neighbor, h);
                    came_from.insert(neighbor, current);
                    open.push(Reverse(OpenEntry {
                        f: (tentative + h) as f64 + jitter,
                        order,
                        cell: neighbor,
                    }));
                }
                Some(existing) if tentative < existing => {
                    let h = h_score.get(&neighbor).copied().unwrap_or(0);
                    g_score.insert(neighbor, tentative);
                    came_from.insert(neighbor, current);
                    open.push(Reverse(OpenEntry {
                        f: (tentative + h) as f64,
                        order,
                        cell: neighbor,
                    }));
                }
                Some(_) => {}
            }
        }
    }

    None
}

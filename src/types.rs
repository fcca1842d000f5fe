use serde::{Deserialize, Serialize};

use crate::constants::MAX_GRID_SIDE;
use crate::error::GridError;

/// Terrain kinds. Encoded on the wire as their numeric code so a full grid
/// stays a compact array of small integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TerrainCell {
    Grass,
    Tree,
    Water,
    Sand,
    Rock,
    Mold,
    House,
    Road,
}

impl From<TerrainCell> for u8 {
    fn from(cell: TerrainCell) -> Self {
        match cell {
            TerrainCell::Grass => 0,
            TerrainCell::Tree => 1,
            TerrainCell::Water => 2,
            TerrainCell::Sand => 3,
            TerrainCell::Rock => 4,
            TerrainCell::Mold => 5,
            TerrainCell::House => 6,
            TerrainCell::Road => 7,
        }
    }
}

impl TryFrom<u8> for TerrainCell {
    type Error = GridError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Grass),
            1 => Ok(Self::Tree),
            2 => Ok(Self::Water),
            3 => Ok(Self::Sand),
            4 => Ok(Self::Rock),
            5 => Ok(Self::Mold),
            6 => Ok(Self::House),
            7 => Ok(Self::Road),
            other => Err(GridError::UnknownTerrain(other)),
        }
    }
}

/// Row-major `width × height` terrain grid. Serialized as an array of rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<Vec<TerrainCell>>", try_from = "Vec<Vec<TerrainCell>>")]
pub struct Grid {
    width: i32,
    height: i32,
    cells: Vec<TerrainCell>,
}

impl Grid {
    /// Sides are clamped to `0..=MAX_GRID_SIDE`.
    pub fn new(width: i32, height: i32, fill: TerrainCell) -> Self {
        let width = width.clamp(0, MAX_GRID_SIDE);
        let height = height.clamp(0, MAX_GRID_SIDE);
        Self {
            width,
            height,
            cells: vec![fill; width as usize * height as usize],
        }
    }

    fn index(&self, x: i32, y: i32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    pub fn get(&self, x: i32, y: i32) -> Option<TerrainCell> {
        if !self.in_bounds(x, y) {
            return None;
        }
        self.cells.get(self.index(x, y)).copied()
    }

    pub fn is(&self, x: i32, y: i32, cell: TerrainCell) -> bool {
        self.get(x, y) == Some(cell)
    }

    /// Writes `cell` at `(x, y)`. Out-of-range writes are ignored.
    pub fn set(&mut self, x: i32, y: i32, cell: TerrainCell) -> bool {
        if !self.in_bounds(x, y) {
            return false;
        }
        let index = self.index(x, y);
        self.cells[index] = cell;
        true
    }

    pub fn count(&self, cell: TerrainCell) -> usize {
        self.cells.iter().filter(|c| **c == cell).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, i32, TerrainCell)> + '_ {
        let width = self.width.max(1);
        self.cells
            .iter()
            .enumerate()
            .map(move |(index, cell)| (index as i32 % width, index as i32 / width, *cell))
    }

    /// In-bounds orthogonal neighbours, in left, right, up, down order.
    pub fn neighbors4(&self, x: i32, y: i32) -> Vec<(i32, i32)> {
        [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)]
            .into_iter()
            .filter(|&(nx, ny)| self.in_bounds(nx, ny))
            .collect()
    }

    /// In-bounds neighbours including diagonals, row by row.
    pub fn neighbors8(&self, x: i32, y: i32) -> Vec<(i32, i32)> {
        let mut out = Vec::with_capacity(8);
        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                if self.in_bounds(x + dx, y + dy) {
                    out.push((x + dx, y + dy));
                }
            }
        }
        out
    }
}

impl From<Grid> for Vec<Vec<TerrainCell>> {
    fn from(grid: Grid) -> Self {
        if grid.width == 0 {
            return vec![Vec::new(); grid.height as usize];
        }
        grid.cells
            .chunks(grid.width as usize)
            .map(|row| row.to_vec())
            .collect()
    }
}

impl TryFrom<Vec<Vec<TerrainCell>>> for Grid {
    type Error = GridError;

    fn try_from(rows: Vec<Vec<TerrainCell>>) -> Result<Self, Self::Error> {
        let expected = rows.first().map(Vec::len).unwrap_or(0);
        let height = rows.len();
        let max = MAX_GRID_SIDE as usize;
        if expected > max || height > max {
            return Err(GridError::TooLarge {
                width: expected,
                height,
                max: MAX_GRID_SIDE,
            });
        }
        let mut cells = Vec::with_capacity(expected * height);
        for (row_index, row) in rows.into_iter().enumerate() {
            if row.len() != expected {
                return Err(GridError::RaggedRow {
                    row: row_index,
                    found: row.len(),
                    expected,
                });
            }
            cells.extend(row);
        }
        Ok(Self {
            width: expected as i32,
            height: height as i32,
            cells,
        })
    }
}

/// One infected cell plus its growth metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoldSpot {
    pub x: i32,
    pub y: i32,
    #[serde(default = "default_spot_size")]
    pub size: u32,
    #[serde(rename = "growthRate", default = "default_growth_rate")]
    pub growth_rate: f64,
}

impl MoldSpot {
    pub fn seed(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            size: 1,
            growth_rate: 1.0,
        }
    }
}

fn default_spot_size() -> u32 {
    1
}

fn default_growth_rate() -> f64 {
    1.0
}

/// Descriptor attached by the relay to a rebroadcast so other clients can
/// show who cleansed what.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlayerAction {
    RemoveMold { player: String, x: i32, y: i32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Follower,
    Relayed,
}

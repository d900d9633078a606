//! Grid placement and tile-adjacency primitives shared across the tileweld workspace.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

/// Errors emitted by the tile store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GridError {
    /// The object is already anchored and must be unanchored first.
    #[error("object already anchored at {0}")]
    AlreadyAnchored(TileCoord),
}

/// Opaque handle identifying one grid in the host's world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridId(pub u64);

/// Integer tile coordinates on a grid. The y axis grows northward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i32,
    pub y: i32,
}

impl TileCoord {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Coordinate shifted by the given deltas.
    #[must_use]
    pub const fn translated(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }

    /// Coordinate of the adjacent tile in the given compass direction.
    #[must_use]
    pub const fn step(self, dir: Direction) -> Self {
        let (dx, dy) = dir.offset();
        self.translated(dx, dy)
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// The eight compass directions used for tile adjacency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    /// The four cardinal directions.
    pub const CARDINAL: [Self; 4] = [Self::North, Self::South, Self::East, Self::West];

    /// The four diagonal directions.
    pub const DIAGONAL: [Self; 4] = [
        Self::NorthEast,
        Self::SouthEast,
        Self::SouthWest,
        Self::NorthWest,
    ];

    /// All eight directions, clockwise from north.
    pub const ALL: [Self; 8] = [
        Self::North,
        Self::NorthEast,
        Self::East,
        Self::SouthEast,
        Self::South,
        Self::SouthWest,
        Self::West,
        Self::NorthWest,
    ];

    /// Tile offset for this direction.
    #[must_use]
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Self::North => (0, 1),
            Self::NorthEast => (1, 1),
            Self::East => (1, 0),
            Self::SouthEast => (1, -1),
            Self::South => (0, -1),
            Self::SouthWest => (-1, -1),
            Self::West => (-1, 0),
            Self::NorthWest => (-1, 1),
        }
    }
}

/// Facing snapped to the nearest of the four cardinal directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CardinalFacing {
    #[default]
    South,
    East,
    North,
    West,
}

impl CardinalFacing {
    /// Quarter-turn index: South = 0, East = 1, North = 2, West = 3.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::South => 0,
            Self::East => 1,
            Self::North => 2,
            Self::West => 3,
        }
    }

    const fn from_index(index: usize) -> Self {
        match index % 4 {
            0 => Self::South,
            1 => Self::East,
            2 => Self::North,
            _ => Self::West,
        }
    }
}

/// Continuous facing angle in radians. Zero faces south; positive turns counter-clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Facing(f32);

impl Facing {
    pub const SOUTH: Self = Self(0.0);
    pub const EAST: Self = Self(std::f32::consts::FRAC_PI_2);
    pub const NORTH: Self = Self(std::f32::consts::PI);
    pub const WEST: Self = Self(3.0 * std::f32::consts::FRAC_PI_2);

    #[must_use]
    pub const fn new(radians: f32) -> Self {
        Self(radians)
    }

    #[must_use]
    pub const fn radians(self) -> f32 {
        self.0
    }

    /// Snap to the nearest cardinal direction.
    #[must_use]
    pub fn snap_cardinal(self) -> CardinalFacing {
        if self.0.is_nan() {
            return CardinalFacing::South;
        }
        let quarter = (self.0 / std::f32::consts::FRAC_PI_2).round().rem_euclid(4.0);
        CardinalFacing::from_index(quarter as usize)
    }

    /// Rotate an integer tile offset by the full continuous angle, rounding
    /// back to the nearest integer offset.
    #[must_use]
    pub fn rotate_offset(self, dx: i32, dy: i32) -> (i32, i32) {
        let (sin, cos) = self.0.sin_cos();
        let x = dx as f32 * cos - dy as f32 * sin;
        let y = dx as f32 * sin + dy as f32 * cos;
        (x.round() as i32, y.round() as i32)
    }
}

/// Bucketed tile → anchored-object store.
///
/// Reference spatial backing for hosts and tests: each tile maps to the short
/// list of objects anchored there, with a reverse map for constant-time
/// placement lookups. One `TileGrid` models one grid; hosts keep one per
/// [`GridId`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileGrid<K: Eq + Hash + Copy> {
    buckets: HashMap<TileCoord, SmallVec<[K; 2]>>,
    anchors: HashMap<K, TileCoord>,
}

impl<K: Eq + Hash + Copy> TileGrid<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            anchors: HashMap::new(),
        }
    }

    /// Anchor an object to a tile. Fails when the object is already anchored.
    pub fn anchor(&mut self, key: K, tile: TileCoord) -> Result<(), GridError> {
        if let Some(&occupied) = self.anchors.get(&key) {
            return Err(GridError::AlreadyAnchored(occupied));
        }
        self.buckets.entry(tile).or_default().push(key);
        self.anchors.insert(key, tile);
        Ok(())
    }

    /// Detach an object, returning the tile it occupied.
    pub fn unanchor(&mut self, key: K) -> Option<TileCoord> {
        let tile = self.anchors.remove(&key)?;
        if let Some(bucket) = self.buckets.get_mut(&tile) {
            bucket.retain(|k| *k != key);
            if bucket.is_empty() {
                self.buckets.remove(&tile);
            }
        }
        Some(tile)
    }

    /// Tile the object is anchored to, if any.
    #[must_use]
    pub fn tile_of(&self, key: K) -> Option<TileCoord> {
        self.anchors.get(&key).copied()
    }

    /// Objects anchored at the given tile.
    #[must_use]
    pub fn objects_at(&self, tile: TileCoord) -> &[K] {
        self.buckets.get(&tile).map(|b| b.as_slice()).unwrap_or(&[])
    }

    /// Visit every object anchored at the given tile.
    pub fn for_each_at(&self, tile: TileCoord, visit: &mut dyn FnMut(K)) {
        for key in self.objects_at(tile) {
            visit(*key);
        }
    }

    /// Number of anchored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Drop every anchor.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.anchors.clear();
    }
}

impl<K: Eq + Hash + Copy> Default for TileGrid<K> {
    fn default() -> Self {
        Self::new()
    }
}

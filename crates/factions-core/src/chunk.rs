//! World tile coordinates.
//!
//! The core treats a chunk as an opaque `(world, x, z)` key. The only spatial
//! knowledge it has is edge adjacency (used by the claim adjacency rule) and
//! the block-to-chunk conversion for home locations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Edge length of a chunk in blocks.
pub const CHUNK_SIZE: i32 = 16;

// ---------------------------------------------------------------------------
// ChunkKey
// ---------------------------------------------------------------------------

/// A claimable tile: world name plus chunk coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub world: String,
    pub x: i32,
    pub z: i32,
}

impl ChunkKey {
    pub fn new(world: impl Into<String>, x: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            x,
            z,
        }
    }

    /// The chunk one step away in `dir`, in the same world. `None` past the
    /// edge of the coordinate range.
    pub fn offset(&self, dir: Direction) -> Option<ChunkKey> {
        let (dx, dz) = dir.offset();
        Some(ChunkKey::new(
            self.world.clone(),
            self.x.checked_add(dx)?,
            self.z.checked_add(dz)?,
        ))
    }

    /// The edge-sharing neighbours (no diagonals). Chunks on the edge of the
    /// coordinate range have fewer than four.
    pub fn neighbors_4(&self) -> impl Iterator<Item = ChunkKey> + '_ {
        Direction::all()
            .into_iter()
            .filter_map(move |dir| self.offset(dir))
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{},{}", self.world, self.x, self.z)
    }
}

/// Cardinal directions on the chunk grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    East,
    South,
    West,
}

impl Direction {
    pub fn all() -> [Direction; 4] {
        [
            Direction::North,
            Direction::East,
            Direction::South,
            Direction::West,
        ]
    }

    /// `(dx, dz)` offset for this direction.
    pub fn offset(&self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::East => (1, 0),
            Direction::South => (0, 1),
            Direction::West => (-1, 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// A precise position in a world, used for faction homes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub yaw: f32,
    #[serde(default)]
    pub pitch: f32,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    /// The chunk containing this location.
    pub fn chunk(&self) -> ChunkKey {
        ChunkKey::new(
            self.world.clone(),
            (self.x.floor() as i32).div_euclid(CHUNK_SIZE),
            (self.z.floor() as i32).div_euclid(CHUNK_SIZE),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbors_share_an_edge() {
        let origin = ChunkKey::new("world", -3, 7);
        let mut neighbors: Vec<_> = origin.neighbors_4().map(|n| (n.x, n.z)).collect();
        neighbors.sort();
        assert_eq!(neighbors, vec![(-4, 7), (-3, 6), (-3, 8), (-2, 7)]);
        assert!(origin.neighbors_4().all(|n| n.world == "world"));
    }

    #[test]
    fn neighbors_stop_at_the_coordinate_edge() {
        let corner = ChunkKey::new("world", i32::MAX, i32::MIN);
        let neighbors: Vec<_> = corner.neighbors_4().map(|n| (n.x, n.z)).collect();
        assert_eq!(
            neighbors,
            vec![(i32::MAX, i32::MIN + 1), (i32::MAX - 1, i32::MIN)]
        );
        assert_eq!(corner.offset(Direction::East), None);
        assert_eq!(corner.offset(Direction::North), None);
    }

    #[test]
    fn location_chunk_floors_negative_coordinates() {
        assert_eq!(
            Location::new("world", 15.9, 64.0, 0.0).chunk(),
            ChunkKey::new("world", 0, 0)
        );
        assert_eq!(
            Location::new("world", -0.5, 64.0, -16.0).chunk(),
            ChunkKey::new("world", -1, -1)
        );
        assert_eq!(
            Location::new("world", -17.0, 64.0, 32.0).chunk(),
            ChunkKey::new("world", -2, 2)
        );
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(ChunkKey::new("world", 1, -2).to_string(), "world@1,-2");
    }
}

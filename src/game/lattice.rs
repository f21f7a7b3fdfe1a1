//! Chunk lattice
//!
//! Links chunks into a grid, resolves world positions to chunks and tiles, and
//! precomputes the neighbour sets that broadcasting and pathfinding walk.
//!
//! Chunk coordinates use the same layer shift as tile addressing inside a
//! chunk, so a position resolves to exactly one chunk slot or to nothing.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, trace};

use super::chunk::{Chunk, ChunkDimensions, ChunkId};
use super::creature::{CreatureId, CreatureKind, Occupancy};
use super::pathfinder::{PathMode, Pathfinder};
use super::position::Position;
use super::tile::Tile;
use crate::error::GameError;

/// World extent in tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldSize {
    pub width: u16,
    pub height: u16,
    pub depth: u16,
}

impl WorldSize {
    pub const fn new(width: u16, height: u16, depth: u16) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }
}

/// The grid of chunks that makes up the world
#[derive(Debug)]
pub struct Lattice {
    size: WorldSize,
    dimensions: ChunkDimensions,
    /// Number of chunk columns
    chunks_x: u32,
    /// Number of chunk rows
    chunks_y: u32,
    /// Number of chunk depths
    chunks_z: u32,
    chunks: HashMap<ChunkId, Chunk>,
}

impl Lattice {
    /// Create an empty lattice
    pub fn new(size: WorldSize, dimensions: ChunkDimensions) -> Self {
        let chunks_x = u32::from(size.width).div_ceil(u32::from(dimensions.width.max(1)));
        let chunks_y = u32::from(size.height).div_ceil(u32::from(dimensions.height.max(1)));
        let chunks_z = u32::from(size.depth).div_ceil(u32::from(dimensions.depth.max(1)));

        debug!(
            width = size.width,
            height = size.height,
            depth = size.depth,
            chunks_x,
            chunks_y,
            chunks_z,
            "Created chunk lattice"
        );

        Self {
            size,
            dimensions,
            chunks_x,
            chunks_y,
            chunks_z,
            chunks: HashMap::new(),
        }
    }

    #[inline]
    pub fn size(&self) -> WorldSize {
        self.size
    }

    #[inline]
    pub fn dimensions(&self) -> ChunkDimensions {
        self.dimensions
    }

    /// Check if a position is inside the world
    pub fn within_bounds(&self, position: &Position) -> bool {
        position.x < self.size.width && position.y < self.size.height && position.z < self.size.depth
    }

    // ============ Addressing ============

    /// Chunk coordinates of a world position
    ///
    /// `None` when the layer shift pushes the position off the lattice.
    pub fn chunk_position(&self, position: &Position) -> Option<Position> {
        let dims = self.dimensions;
        let layer = i32::from(position.z % dims.depth);

        let x = (i32::from(position.x) - layer).div_euclid(i32::from(dims.width));
        let y = (i32::from(position.y) - layer).div_euclid(i32::from(dims.height));
        let z = i32::from(position.z / dims.depth);

        if x < 0 || y < 0 {
            return None;
        }

        let chunk = Position::new(u16::try_from(x).ok()?, u16::try_from(y).ok()?, u16::try_from(z).ok()?);
        self.chunk_in_lattice(&chunk).then_some(chunk)
    }

    fn chunk_in_lattice(&self, chunk: &Position) -> bool {
        u32::from(chunk.x) < self.chunks_x
            && u32::from(chunk.y) < self.chunks_y
            && u32::from(chunk.z) < self.chunks_z
    }

    /// Identifier of the chunk at chunk coordinates
    pub fn chunk_id(&self, chunk: &Position) -> ChunkId {
        u32::from(chunk.x)
            + u32::from(chunk.y) * self.chunks_x
            + u32::from(chunk.z) * self.chunks_x * self.chunks_y
    }

    // ============ Chunks ============

    /// Create the chunk at chunk coordinates, or return the existing one
    pub fn create_chunk(&mut self, chunk: Position) -> Option<&mut Chunk> {
        if !self.chunk_in_lattice(&chunk) {
            return None;
        }

        let id = self.chunk_id(&chunk);
        let dimensions = self.dimensions;
        Some(
            self.chunks
                .entry(id)
                .or_insert_with(|| Chunk::new(id, chunk, dimensions)),
        )
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(&id)
    }

    /// Chunk containing a world position
    pub fn chunk_at(&self, position: &Position) -> Option<&Chunk> {
        let chunk = self.chunk_position(position)?;
        self.chunks.get(&self.chunk_id(&chunk))
    }

    pub fn chunk_at_mut(&mut self, position: &Position) -> Option<&mut Chunk> {
        let chunk = self.chunk_position(position)?;
        let id = self.chunk_id(&chunk);
        self.chunks.get_mut(&id)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.chunks.values()
    }

    /// Number of chunks created so far
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    // ============ Tiles ============

    /// Create a tile, creating its chunk on demand
    pub fn create_tile(&mut self, position: Position, id: u16) -> Option<&mut Tile> {
        if !self.within_bounds(&position) {
            return None;
        }

        let chunk = self.chunk_position(&position)?;
        Some(self.create_chunk(chunk)?.create_tile(position, id))
    }

    pub fn tile(&self, position: &Position) -> Option<&Tile> {
        self.chunk_at(position)?.tile(position)
    }

    pub fn tile_mut(&mut self, position: &Position) -> Option<&mut Tile> {
        self.chunk_at_mut(position)?.tile_mut(position)
    }

    /// Fill a `width` by `height` rectangle starting at `origin` with ground
    ///
    /// Links references afterwards so the area is immediately walkable.
    pub fn generate_flat(&mut self, origin: Position, width: u16, height: u16, ground: u16) -> usize {
        let mut created = 0;

        for y in origin.y..origin.y.saturating_add(height) {
            for x in origin.x..origin.x.saturating_add(width) {
                if self.create_tile(Position::new(x, y, origin.z), ground).is_some() {
                    created += 1;
                }
            }
        }

        self.set_references();
        debug!(origin = %origin, width, height, created, "Generated flat area");
        created
    }

    // ============ References ============

    /// Link chunk neighbour sets and compute every tile's neighbour list
    pub fn set_references(&mut self) {
        let chunk_links: Vec<(ChunkId, Vec<ChunkId>)> = self
            .chunks
            .values()
            .map(|chunk| (chunk.id(), self.chunk_neighbours(&chunk.position())))
            .collect();

        for (id, neighbours) in chunk_links {
            if let Some(chunk) = self.chunks.get_mut(&id) {
                chunk.set_neighbours(neighbours);
            }
        }

        let tile_links: Vec<(Position, Vec<Position>)> = self
            .chunks
            .values()
            .flat_map(|chunk| chunk.tiles())
            .map(|tile| (tile.position(), self.tile_neighbours(&tile.position())))
            .collect();

        let count = tile_links.len();
        for (position, neighbours) in tile_links {
            if let Some(tile) = self.tile_mut(&position) {
                tile.set_neighbours(neighbours);
            }
        }

        debug!(chunks = self.chunks.len(), tiles = count, "Linked lattice references");
    }

    /// Existing chunks around chunk coordinates, self first
    fn chunk_neighbours(&self, chunk: &Position) -> Vec<ChunkId> {
        chunk
            .surrounding()
            .into_iter()
            .flatten()
            .filter(|c| self.chunk_in_lattice(c))
            .map(|c| self.chunk_id(&c))
            .filter(|id| self.chunks.contains_key(id))
            .collect()
    }

    /// Walkable tiles around a tile, self first; empty for blocking tiles
    fn tile_neighbours(&self, position: &Position) -> Vec<Position> {
        match self.tile(position) {
            Some(tile) if !tile.is_block_solid() => position
                .surrounding()
                .into_iter()
                .flatten()
                .filter(|p| self.tile(p).is_some_and(|t| !t.is_block_solid()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Recompute the neighbour list of one tile after it changed
    ///
    /// With `recurse`, the surrounding tiles are refreshed too, since whether
    /// they can step onto this tile may have changed.
    pub fn refresh_tile_neighbours(&mut self, position: &Position, recurse: bool) {
        let targets: Vec<Position> = if recurse {
            position.surrounding().into_iter().flatten().collect()
        } else {
            vec![*position]
        };

        for target in targets {
            let neighbours = self.tile_neighbours(&target);
            if let Some(tile) = self.tile_mut(&target) {
                tile.set_neighbours(neighbours);
            }
        }
    }

    // ============ Interest ============

    /// Chunks whose players can see a position
    pub fn spectating_chunks(&self, position: &Position) -> &[ChunkId] {
        self.chunk_at(position).map(|c| c.neighbours()).unwrap_or(&[])
    }

    /// Union of the neighbour sets of every chunk containing a player
    pub fn active_chunks<I>(&self, players: I) -> BTreeSet<ChunkId>
    where
        I: IntoIterator<Item = Position>,
    {
        players
            .into_iter()
            .flat_map(|position| self.spectating_chunks(&position).iter().copied())
            .collect()
    }

    // ============ Creatures ============

    /// Put a creature on a tile and into the tile's chunk
    pub fn place_creature(
        &mut self,
        id: CreatureId,
        kind: CreatureKind,
        position: &Position,
    ) -> Result<(), GameError> {
        let invalid = || GameError::InvalidLocation {
            x: position.x,
            y: position.y,
            z: position.z,
        };

        let chunk = self.chunk_at_mut(position).ok_or_else(invalid)?;
        let tile = chunk.tile_mut(position).ok_or_else(invalid)?;
        tile.add_creature(id);
        chunk.add_creature(id, kind);

        trace!(creature = id, position = %position, "Placed creature");
        Ok(())
    }

    /// Take a creature off a tile and out of the tile's chunk
    pub fn remove_creature(&mut self, id: CreatureId, kind: CreatureKind, position: &Position) -> bool {
        let Some(chunk) = self.chunk_at_mut(position) else {
            return false;
        };

        let on_tile = chunk
            .tile_mut(position)
            .is_some_and(|tile| tile.remove_creature(id));
        let in_chunk = chunk.remove_creature(id, kind);

        on_tile || in_chunk
    }

    /// First neighbour of `position` (self first) the creature may stand on
    ///
    /// Players never land on no-logout tiles.
    pub fn find_available_tile<O>(&self, creature: &O, position: &Position) -> Option<Position>
    where
        O: Occupancy + ?Sized,
    {
        let tile = self.tile(position)?;

        tile.neighbours()
            .iter()
            .filter_map(|p| self.tile(p))
            .filter(|t| !(creature.is_player() && t.is_no_logout_zone()))
            .find(|t| !creature.is_tile_occupied(t))
            .map(|t| t.position())
    }

    /// Path for a creature from `from` to `to`
    ///
    /// Returns the steps in reverse (the next step is last), or an empty path
    /// when there is nothing to walk or no route exists.
    pub fn find_path<O>(
        &self,
        pathfinder: &mut Pathfinder,
        creature: &O,
        from: &Position,
        to: &Position,
        mode: PathMode,
    ) -> Vec<Position>
    where
        O: Occupancy + ?Sized,
    {
        if from == to || !from.is_same_floor(to) {
            return Vec::new();
        }

        if mode == PathMode::Adjacent && from.besides(to) {
            return Vec::new();
        }

        let (Some(_), Some(target)) = (self.tile(from), self.tile(to)) else {
            return Vec::new();
        };

        if mode == PathMode::Exact && creature.is_tile_occupied(target) {
            return Vec::new();
        }

        // Target and every tile around it closed to this creature
        let enclosed = target
            .neighbours()
            .iter()
            .filter_map(|p| self.tile(p))
            .all(|t| creature.is_tile_occupied(t));
        if target.neighbours().is_empty() || enclosed {
            return Vec::new();
        }

        pathfinder.search(self, creature, from, to, mode)
    }
}

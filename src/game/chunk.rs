//! Chunks
//!
//! A chunk is a fixed-size cubic region of the world. It owns the tiles that
//! fall inside it and the membership of creatures standing on them, and keeps a
//! precomputed list of neighbouring chunks (itself included) that broadcasts
//! fan out to.
//!
//! Tiles on deeper layers are shifted by the layer index on both horizontal
//! axes, so that stairs leading one floor up and one tile diagonal stay in the
//! same visual column.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use tracing::trace;

use super::creature::{Creature, CreatureId, CreatureKind};
use super::lattice::Lattice;
use super::position::Position;
use super::tile::Tile;
use crate::error::ProtocolError;
use crate::protocol::packets::{ChunkPacket, CreatureStatePacket, OutgoingPacket};

/// Unique chunk identifier
pub type ChunkId = u32;

/// Delivery seam for broadcasts
///
/// Chunks know which players are inside them; an audience knows how to reach
/// a player and which floor they are on.
pub trait Audience {
    /// Queue a packet for a player
    fn deliver(&mut self, player: CreatureId, packet: &Bytes);

    /// Floor the player is currently on
    fn floor(&self, player: CreatureId) -> Option<u16>;
}

/// Size of a chunk in tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDimensions {
    pub width: u16,
    pub height: u16,
    pub depth: u16,
}

impl ChunkDimensions {
    pub const fn new(width: u16, height: u16, depth: u16) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Tiles in one layer
    pub fn layer_size(&self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }
}

impl Default for ChunkDimensions {
    fn default() -> Self {
        Self::new(8, 8, 8)
    }
}

/// One layer's tile slots, allocated on first use
type Layer = Vec<Option<Tile>>;

/// A cubic region of the world
#[derive(Debug)]
pub struct Chunk {
    id: ChunkId,
    /// Position in chunk coordinates
    position: Position,
    dimensions: ChunkDimensions,
    layers: Vec<Option<Layer>>,
    players: BTreeSet<CreatureId>,
    monsters: BTreeSet<CreatureId>,
    npcs: BTreeSet<CreatureId>,
    /// Self and surrounding chunks on the same depth
    neighbours: Vec<ChunkId>,
}

impl Chunk {
    /// Create an empty chunk at `position` (in chunk coordinates)
    pub fn new(id: ChunkId, position: Position, dimensions: ChunkDimensions) -> Self {
        Self {
            id,
            position,
            dimensions,
            layers: (0..dimensions.depth).map(|_| None).collect(),
            players: BTreeSet::new(),
            monsters: BTreeSet::new(),
            npcs: BTreeSet::new(),
            neighbours: vec![id],
        }
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Position in chunk coordinates
    #[inline]
    pub fn position(&self) -> Position {
        self.position
    }

    #[inline]
    pub fn dimensions(&self) -> ChunkDimensions {
        self.dimensions
    }

    // ============ Tiles ============

    /// Layer and slot of a world position inside this chunk
    fn tile_index(&self, position: &Position) -> (usize, usize) {
        let layer = position.z % self.dimensions.depth;
        let shift = i32::from(layer);

        let x = (i32::from(position.x) - shift).rem_euclid(i32::from(self.dimensions.width));
        let y = (i32::from(position.y) - shift).rem_euclid(i32::from(self.dimensions.height));

        (
            usize::from(layer),
            x as usize + y as usize * usize::from(self.dimensions.width),
        )
    }

    /// Create (or replace) the tile at a world position
    pub fn create_tile(&mut self, position: Position, id: u16) -> &mut Tile {
        let (layer, index) = self.tile_index(&position);
        let size = self.dimensions.layer_size();

        let slots = self.layers[layer].get_or_insert_with(|| vec![None; size]);
        slots[index].insert(Tile::new(id, position))
    }

    /// Tile at a world position, `None` for void
    pub fn tile(&self, position: &Position) -> Option<&Tile> {
        let (layer, index) = self.tile_index(position);
        self.layers[layer].as_ref()?.get(index)?.as_ref()
    }

    pub fn tile_mut(&mut self, position: &Position) -> Option<&mut Tile> {
        let (layer, index) = self.tile_index(position);
        self.layers[layer].as_mut()?.get_mut(index)?.as_mut()
    }

    /// Layers in order; `None` for layers never allocated
    pub fn layers(&self) -> impl Iterator<Item = Option<&[Option<Tile>]>> + '_ {
        self.layers.iter().map(|layer| layer.as_deref())
    }

    /// Every existing tile
    pub fn tiles(&self) -> impl Iterator<Item = &Tile> + '_ {
        self.layers.iter().flatten().flatten().flatten()
    }

    pub(crate) fn tiles_mut(&mut self) -> impl Iterator<Item = &mut Tile> + '_ {
        self.layers.iter_mut().flatten().flatten().flatten()
    }

    // ============ Membership ============

    fn members_mut(&mut self, kind: CreatureKind) -> &mut BTreeSet<CreatureId> {
        match kind {
            CreatureKind::Player => &mut self.players,
            CreatureKind::Monster => &mut self.monsters,
            CreatureKind::Npc => &mut self.npcs,
        }
    }

    /// Add a creature; false if it was already a member
    pub fn add_creature(&mut self, id: CreatureId, kind: CreatureKind) -> bool {
        self.members_mut(kind).insert(id)
    }

    /// Remove a creature; false if it was not a member
    pub fn remove_creature(&mut self, id: CreatureId, kind: CreatureKind) -> bool {
        self.members_mut(kind).remove(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = CreatureId> + '_ {
        self.players.iter().copied()
    }

    pub fn monsters(&self) -> impl Iterator<Item = CreatureId> + '_ {
        self.monsters.iter().copied()
    }

    pub fn npcs(&self) -> impl Iterator<Item = CreatureId> + '_ {
        self.npcs.iter().copied()
    }

    /// Check if any player is inside the chunk
    pub fn has_players(&self) -> bool {
        !self.players.is_empty()
    }

    // ============ Neighbours ============

    /// Chunks a broadcast from here reaches, self included
    pub fn neighbours(&self) -> &[ChunkId] {
        &self.neighbours
    }

    pub(crate) fn set_neighbours(&mut self, neighbours: Vec<ChunkId>) {
        self.neighbours = neighbours;
    }

    /// Neighbours of `other` that are not neighbours of this chunk
    ///
    /// After a step from this chunk into `other`, these are the chunks that
    /// just came into view.
    pub fn difference(&self, other: &Chunk) -> Vec<ChunkId> {
        other
            .neighbours
            .iter()
            .copied()
            .filter(|id| !self.neighbours.contains(id))
            .collect()
    }

    // ============ Broadcasting ============

    /// Send a packet to every player in every neighbouring chunk
    pub fn broadcast<A: Audience>(&self, lattice: &Lattice, packet: &Bytes, audience: &mut A) {
        for chunk in self.neighbours.iter().filter_map(|id| lattice.chunk(*id)) {
            chunk.internal_broadcast(packet, audience);
        }
    }

    /// Like `broadcast`, restricted to players standing on `floor`
    pub fn broadcast_floor<A: Audience>(
        &self,
        lattice: &Lattice,
        floor: u16,
        packet: &Bytes,
        audience: &mut A,
    ) {
        for chunk in self.neighbours.iter().filter_map(|id| lattice.chunk(*id)) {
            chunk.internal_broadcast_floor(floor, packet, audience);
        }
    }

    /// Send a packet to the players inside this chunk only
    pub fn internal_broadcast<A: Audience>(&self, packet: &Bytes, audience: &mut A) {
        for player in &self.players {
            audience.deliver(*player, packet);
        }
    }

    fn internal_broadcast_floor<A: Audience>(&self, floor: u16, packet: &Bytes, audience: &mut A) {
        for player in &self.players {
            if audience.floor(*player) == Some(floor) {
                audience.deliver(*player, packet);
            }
        }
    }

    /// Introduce this chunk to a joining player
    ///
    /// Sends the chunk's tiles, then the state of every other player, every
    /// NPC and every monster inside it. The joining player's own state is not
    /// included.
    pub fn serialize<A: Audience>(
        &self,
        joining: CreatureId,
        creatures: &HashMap<CreatureId, Creature>,
        audience: &mut A,
    ) -> Result<(), ProtocolError> {
        audience.deliver(joining, &ChunkPacket::new(self).encode()?);

        let others = self
            .players
            .iter()
            .filter(|id| **id != joining)
            .chain(self.npcs.iter())
            .chain(self.monsters.iter());

        for id in others {
            if let Some(creature) = creatures.get(id) {
                audience.deliver(joining, &CreatureStatePacket::new(creature).encode()?);
            }
        }

        trace!(chunk = self.id, player = joining, "Serialized chunk");
        Ok(())
    }
}

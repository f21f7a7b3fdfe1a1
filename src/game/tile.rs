//! Tiles
//!
//! A tile is one walkable (or blocking) square of the map. Tiles are owned by
//! the chunk they fall into and are identified by their world position.

use bitflags::bitflags;

use super::creature::CreatureId;
use super::position::Position;

/// Friction of plain ground
pub const DEFAULT_FRICTION: u16 = 150;

/// Most items a single tile can hold
pub const MAX_TILE_ITEMS: usize = 10;

bitflags! {
    /// Map flags attached to a tile
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct TileFlags: u8 {
        /// Nothing can ever stand here
        const BLOCK_SOLID = 0b0000_0001;
        /// No combat; monsters cannot enter
        const PROTECTION_ZONE = 0b0000_0010;
        /// Players cannot log out or log in here
        const NO_LOGOUT = 0b0000_0100;
    }
}

/// A stack of items lying on a tile or inside a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    /// Client item id
    pub id: u16,
    /// Stack count
    pub count: u8,
}

impl Item {
    /// Create a new item stack
    pub fn new(id: u16, count: u8) -> Self {
        Self { id, count }
    }

    /// Split `count` off the stack
    ///
    /// `None` unless `count` is non-zero and smaller than the stack.
    pub fn split(&mut self, count: u8) -> Option<Item> {
        if count == 0 || count >= self.count {
            return None;
        }
        self.count -= count;
        Some(Item::new(self.id, count))
    }
}

/// A single map square
#[derive(Debug, Clone)]
pub struct Tile {
    /// Ground sprite id
    id: u16,
    /// World position (also the tile's identity)
    position: Position,
    /// Map flags
    flags: TileFlags,
    /// Walking friction, used as the pathfinding edge cost
    friction: u16,
    /// Items on the tile, bottom first
    items: Vec<Item>,
    /// Walkable neighbours including self, filled in by the lattice
    neighbours: Vec<Position>,
    /// Creatures standing on the tile
    creatures: Vec<CreatureId>,
}

impl Tile {
    /// Create a plain ground tile
    pub fn new(id: u16, position: Position) -> Self {
        Self {
            id,
            position,
            flags: TileFlags::empty(),
            friction: DEFAULT_FRICTION,
            items: Vec::new(),
            neighbours: Vec::new(),
            creatures: Vec::new(),
        }
    }

    /// Ground sprite id
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// World position of the tile
    #[inline]
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn flags(&self) -> TileFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: TileFlags) {
        self.flags = flags;
    }

    pub fn is_block_solid(&self) -> bool {
        self.flags.contains(TileFlags::BLOCK_SOLID)
    }

    pub fn is_protection_zone(&self) -> bool {
        self.flags.contains(TileFlags::PROTECTION_ZONE)
    }

    pub fn is_no_logout_zone(&self) -> bool {
        self.flags.contains(TileFlags::NO_LOGOUT)
    }

    /// Walking friction
    #[inline]
    pub fn friction(&self) -> u16 {
        self.friction
    }

    pub fn set_friction(&mut self, friction: u16) {
        self.friction = friction;
    }

    /// Cost of stepping onto this tile from `from`
    ///
    /// Diagonal steps cost three times the friction.
    pub fn weight(&self, from: &Position) -> u32 {
        let friction = u32::from(self.friction);
        if self.position.is_diagonal(from) {
            3 * friction
        } else {
            friction
        }
    }

    /// Manhattan distance from this tile to a position
    pub fn distance_manhattan(&self, to: &Position) -> u32 {
        self.position.manhattan_distance(to)
    }

    /// Walkable neighbours (self first), empty for blocking tiles
    pub fn neighbours(&self) -> &[Position] {
        &self.neighbours
    }

    pub(crate) fn set_neighbours(&mut self, neighbours: Vec<Position>) {
        self.neighbours = neighbours;
    }

    /// Items on the tile, bottom first
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn item_mut(&mut self, index: usize) -> Option<&mut Item> {
        self.items.get_mut(index)
    }

    /// Check if another item fits on the tile
    pub fn has_room(&self) -> bool {
        self.items.len() < MAX_TILE_ITEMS
    }

    /// Put an item on top of the stack; false when the tile is full
    pub fn add_item(&mut self, item: Item) -> bool {
        if self.items.len() >= MAX_TILE_ITEMS {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Take the item at `index` off the tile
    pub fn remove_item(&mut self, index: usize) -> Option<Item> {
        if index < self.items.len() {
            Some(self.items.remove(index))
        } else {
            None
        }
    }

    /// Creatures standing on the tile
    pub fn creatures(&self) -> &[CreatureId] {
        &self.creatures
    }

    /// Check if any creature stands on the tile
    pub fn has_creatures(&self) -> bool {
        !self.creatures.is_empty()
    }

    pub(crate) fn add_creature(&mut self, id: CreatureId) {
        if !self.creatures.contains(&id) {
            self.creatures.push(id);
        }
    }

    pub(crate) fn remove_creature(&mut self, id: CreatureId) -> bool {
        match self.creatures.iter().position(|c| *c == id) {
            Some(index) => {
                self.creatures.remove(index);
                true
            }
            None => false,
        }
    }
}

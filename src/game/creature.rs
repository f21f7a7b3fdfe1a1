//! Creatures
//!
//! Players, NPCs and monsters share one struct; behaviour that differs per kind
//! (occupancy rules, think step) is dispatched on [`CreatureKind`].

use std::collections::BTreeMap;

use super::position::{Direction, Position};
use super::tile::{Item, Tile};

/// Unique creature identifier
pub type CreatureId = u32;

/// Default movement speed
pub const DEFAULT_SPEED: u16 = 220;

/// Slots in a freshly opened container
pub const DEFAULT_CONTAINER_SIZE: usize = 8;

/// Kind of creature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CreatureKind {
    Player = 0,
    Monster = 1,
    Npc = 2,
}

impl CreatureKind {
    /// Wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            CreatureKind::Player => "Player",
            CreatureKind::Monster => "Monster",
            CreatureKind::Npc => "NPC",
        }
    }
}

/// Outfit colours
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutfitDetails {
    pub head: u8,
    pub body: u8,
    pub legs: u8,
    pub feet: u8,
}

/// Creature appearance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outfit {
    /// Look type id
    pub id: u16,
    pub details: OutfitDetails,
    /// Mount look type (0 for none)
    pub mount: u16,
    pub mounted: bool,
    pub addon_one: bool,
    pub addon_two: bool,
}

impl Outfit {
    /// Outfit with a look type and default colours
    pub fn new(id: u16) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Decides whether a tile can be entered by a given creature
///
/// Pathfinding and placement consult this for every candidate tile, so it
/// must be cheap and side-effect free.
pub trait Occupancy {
    /// True when this creature may not stand on `tile`
    fn is_tile_occupied(&self, tile: &Tile) -> bool;

    /// Whether placement rules for players apply (no-logout tiles)
    fn is_player(&self) -> bool {
        false
    }
}

/// A player's open container
#[derive(Debug, Clone)]
pub struct Container {
    /// Container id as addressed by the client
    pub id: u32,
    slots: Vec<Option<Item>>,
}

impl Container {
    /// Create an empty container with `size` slots
    pub fn new(id: u32, size: usize) -> Self {
        Self {
            id,
            slots: vec![None; size],
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&Item> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Item> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Put an item into an empty slot
    pub fn put(&mut self, index: usize, item: Item) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(item);
                true
            }
            _ => false,
        }
    }

    /// Take the item out of a slot
    pub fn take(&mut self, index: usize) -> Option<Item> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// First empty slot
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }
}

/// A creature in the world
#[derive(Debug, Clone)]
pub struct Creature {
    pub id: CreatureId,
    pub kind: CreatureKind,
    pub name: String,
    pub position: Position,
    pub direction: Direction,
    pub outfit: Outfit,
    pub health: u32,
    pub health_max: u32,
    pub speed: u16,
    /// NPCs acting out a scene walk through other characters
    pub in_scene: bool,
    /// Creature a monster is chasing
    pub target: Option<CreatureId>,
    /// Open containers (players only)
    containers: BTreeMap<u32, Container>,
}

impl Creature {
    /// Create a creature of any kind
    pub fn new(id: CreatureId, kind: CreatureKind, name: impl Into<String>, position: Position) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            position,
            direction: Direction::South,
            outfit: Outfit::new(128),
            health: 100,
            health_max: 100,
            speed: DEFAULT_SPEED,
            in_scene: false,
            target: None,
            containers: BTreeMap::new(),
        }
    }

    pub fn player(id: CreatureId, name: impl Into<String>, position: Position) -> Self {
        Self::new(id, CreatureKind::Player, name, position)
    }

    pub fn monster(id: CreatureId, name: impl Into<String>, position: Position) -> Self {
        Self::new(id, CreatureKind::Monster, name, position)
    }

    pub fn npc(id: CreatureId, name: impl Into<String>, position: Position) -> Self {
        Self::new(id, CreatureKind::Npc, name, position)
    }

    /// Set the outfit
    pub fn with_outfit(mut self, outfit: Outfit) -> Self {
        self.outfit = outfit;
        self
    }

    /// Set the movement speed
    pub fn with_speed(mut self, speed: u16) -> Self {
        self.speed = speed;
        self
    }

    /// Open a container for this creature
    pub fn open_container(&mut self, container: Container) {
        self.containers.insert(container.id, container);
    }

    /// Close an open container
    pub fn close_container(&mut self, id: u32) -> Option<Container> {
        self.containers.remove(&id)
    }

    pub fn container(&self, id: u32) -> Option<&Container> {
        self.containers.get(&id)
    }

    pub fn container_mut(&mut self, id: u32) -> Option<&mut Container> {
        self.containers.get_mut(&id)
    }

    /// Ticks a single step onto ground with `friction` locks movement for
    ///
    /// Speed maps onto a logarithmic step speed (never below 1), the step time
    /// in milliseconds is `1000 * friction / step_speed`, rounded up to whole
    /// ticks.
    pub fn step_duration(&self, friction: u16, tick_ms: u64) -> u64 {
        const A: f64 = 857.36;
        const B: f64 = 261.29;
        const C: f64 = -4795.009;

        let step_speed = (A * (f64::from(self.speed) + B).ln() + C).round().max(1.0) as u64;
        let step_ms = 1000 * u64::from(friction) / step_speed;

        step_ms.div_ceil(tick_ms.max(1))
    }
}

impl Occupancy for Creature {
    fn is_tile_occupied(&self, tile: &Tile) -> bool {
        if tile.is_block_solid() {
            return true;
        }

        match self.kind {
            CreatureKind::Player => false,
            CreatureKind::Monster => tile.is_protection_zone() || tile.has_creatures(),
            CreatureKind::Npc => !self.in_scene && tile.has_creatures(),
        }
    }

    fn is_player(&self) -> bool {
        self.kind == CreatureKind::Player
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::tile::TileFlags;

    fn tile(flags: TileFlags, occupant: Option<CreatureId>) -> Tile {
        let mut tile = Tile::new(102, Position::new(3, 3, 7));
        tile.set_flags(flags);
        if let Some(id) = occupant {
            tile.add_creature(id);
        }
        tile
    }

    #[test]
    fn test_occupancy_per_kind() {
        let here = Position::new(1, 1, 7);
        let player = Creature::player(1, "Alice", here);
        let monster = Creature::monster(2, "Rat", here);
        let mut npc = Creature::npc(3, "Tom", here);

        let solid = tile(TileFlags::BLOCK_SOLID, None);
        let zone = tile(TileFlags::PROTECTION_ZONE, None);
        let crowded = tile(TileFlags::empty(), Some(9));

        for creature in [&player, &monster, &npc] {
            assert!(creature.is_tile_occupied(&solid));
        }

        assert!(!player.is_tile_occupied(&zone));
        assert!(monster.is_tile_occupied(&zone));
        assert!(!npc.is_tile_occupied(&zone));

        assert!(!player.is_tile_occupied(&crowded));
        assert!(monster.is_tile_occupied(&crowded));
        assert!(npc.is_tile_occupied(&crowded));

        npc.in_scene = true;
        assert!(!npc.is_tile_occupied(&crowded));

        assert!(player.is_player());
        assert!(!monster.is_player());
    }

    #[test]
    fn test_step_duration() {
        let creature = Creature::monster(1, "Rat", Position::new(1, 1, 7)).with_speed(220);

        // Step speed rounds to 500, so one step takes 300 ms
        assert_eq!(creature.step_duration(150, 50), 6);

        let slow = creature.clone().with_speed(0);
        assert!(slow.step_duration(150, 50) > 6);
    }

    #[test]
    fn test_container_slots() {
        let mut container = Container::new(64, 2);
        assert!(container.put(0, Item::new(2148, 10)));
        assert!(!container.put(0, Item::new(2148, 1)));
        assert!(!container.put(5, Item::new(2148, 1)));

        assert_eq!(container.free_slot(), Some(1));
        assert_eq!(container.take(0), Some(Item::new(2148, 10)));
        assert_eq!(container.take(0), None);
    }
}

//! Game module
//!
//! This module contains the core game logic for the Lattice server:
//! - Geometry (positions, directions, tiles)
//! - Spatial partitioning (chunks and the lattice that indexes them)
//! - Creatures and their movement rules
//! - Pathfinding
//! - The fixed-tick loop and the world it drives

pub mod chunk;
pub mod creature;
pub mod game_loop;
pub mod lattice;
pub mod pathfinder;
pub mod position;
pub mod tile;
pub mod world;

pub use chunk::{Chunk, ChunkDimensions, ChunkId};
pub use creature::{Creature, CreatureId, CreatureKind};
pub use game_loop::GameLoop;
pub use lattice::{Lattice, WorldSize};
pub use pathfinder::{PathMode, Pathfinder};
pub use position::{Direction, Position};
pub use tile::{Item, Tile, TileFlags};
pub use world::{World, WorldSettings};

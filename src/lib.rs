//! Lattice Game Server Library
//!
//! This library provides the core functionality for the Lattice game server:
//! a tick-driven tile world partitioned into chunks, with scheduled events,
//! pathfinding creatures and a framed TCP protocol.
//!
//! ## Modules
//!
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions
//! - `event` - Tick-based event scheduling
//! - `game` - Game world, chunks, creatures and pathfinding
//! - `net` - Framing, transport and session management
//! - `protocol` - Client and server packet definitions

pub mod config;
pub mod error;
pub mod event;
pub mod game;
pub mod net;
pub mod protocol;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{LatticeError, Result};
pub use game::World;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

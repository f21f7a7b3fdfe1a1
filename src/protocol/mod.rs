//! Protocol module
//!
//! Wire protocol for the Lattice server:
//! - Opcodes and outgoing (server to client) packets
//! - Incoming (client to server) packet decoding and move-target resolution

pub mod game;
pub mod packets;

pub use game::{ClientPacket, MoveTarget, ResolvedTarget, TargetResolver};
pub use packets::{ClientOpcode, OutgoingPacket, ServerOpcode};

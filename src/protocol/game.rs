//! Game protocol
//!
//! Decoding of client-to-server packets and resolution of drag-and-drop
//! addresses against live server state.

use bytes::Bytes;
use tracing::trace;

use super::packets::ClientOpcode;
use crate::error::ProtocolError;
use crate::game::position::{Direction, Position};
use crate::net::buffer::PacketReader;

/// Longest chat message accepted from a client
pub const MAX_MESSAGE_LENGTH: usize = 255;

/// Raw drag-and-drop address as sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveTarget {
    /// One of the player's open containers
    Container(u32),
    /// A map tile
    Tile(Position),
}

/// A move target checked against live state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedTarget {
    Container(u32),
    Tile(Position),
}

/// Live lookups a move target is resolved against
pub trait TargetResolver {
    /// True when the player has container `id` open
    fn has_container(&self, id: u32) -> bool;

    /// True when a tile exists at `position`
    fn has_tile(&self, position: &Position) -> bool;
}

impl MoveTarget {
    /// Resolve against live state; `None` when the target no longer exists
    pub fn resolve<R: TargetResolver + ?Sized>(&self, resolver: &R) -> Option<ResolvedTarget> {
        match *self {
            MoveTarget::Container(id) if resolver.has_container(id) => {
                Some(ResolvedTarget::Container(id))
            }
            MoveTarget::Tile(position) if resolver.has_tile(&position) => {
                Some(ResolvedTarget::Tile(position))
            }
            _ => None,
        }
    }
}

/// A decoded client packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    KeepAlive,
    /// Step one tile
    Walk(Direction),
    /// Drag an item from one place to another
    MoveItem {
        from: Option<MoveTarget>,
        from_index: u8,
        to: Option<MoveTarget>,
        to_index: u8,
        count: u8,
    },
    /// Chat message
    Say {
        kind: u8,
        loudness: u8,
        message: String,
    },
    Logout,
}

impl ClientPacket {
    /// Decode one frame (opcode first)
    ///
    /// Any malformed frame is an error; the caller closes the connection.
    pub fn decode(frame: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = PacketReader::new(frame);
        let opcode = ClientOpcode::try_from(reader.read_u8()?)?;

        trace!(opcode = ?opcode, length = reader.remaining(), "Decoding client packet");

        let packet = match opcode {
            ClientOpcode::KeepAlive => ClientPacket::KeepAlive,
            ClientOpcode::Walk => ClientPacket::Walk(Direction::try_from(reader.read_u8()?)?),
            ClientOpcode::MoveItem => ClientPacket::MoveItem {
                from: reader.read_move_target()?,
                from_index: reader.read_u8()?,
                to: reader.read_move_target()?,
                to_index: reader.read_u8()?,
                count: reader.read_u8()?,
            },
            ClientOpcode::Say => ClientPacket::Say {
                kind: reader.read_u8()?,
                loudness: reader.read_u8()?,
                message: reader.read_string8()?,
            },
            ClientOpcode::Logout => ClientPacket::Logout,
        };

        Ok(packet)
    }

    /// Name of the packet, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientPacket::KeepAlive => "KeepAlive",
            ClientPacket::Walk(_) => "Walk",
            ClientPacket::MoveItem { .. } => "MoveItem",
            ClientPacket::Say { .. } => "Say",
            ClientPacket::Logout => "Logout",
        }
    }
}

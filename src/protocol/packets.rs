//! Packet definitions module
//!
//! Opcodes and the server-to-client packets. Each outgoing packet knows its
//! exact payload size so the writer can preallocate; a packet that outgrows
//! its declared size fails to encode instead of going out truncated.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::game::chunk::Chunk;
use crate::game::creature::{Creature, CreatureId, CreatureKind};
use crate::game::position::Position;
use crate::game::tile::Item;
use crate::net::buffer::{encoded_string_len, PacketWriter, ITEM_SIZE, OUTFIT_SIZE, POSITION_SIZE};

/// Server to client opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOpcode {
    /// World dimensions and tick rate, sent on join
    ServerState = 0,
    /// Tiles of one chunk
    Chunk = 1,
    /// Full description of a creature
    CreatureState = 2,
    /// Creature left view
    CreatureForget = 3,
    /// Creature stepped to a new position
    CreatureMove = 4,
    /// Creature speech
    CreatureSay = 5,
    /// Visual effect on a tile
    MagicEffect = 6,
    /// Item put on a tile
    TileItemAdd = 7,
    /// Item taken off a tile
    TileItemRemove = 8,
    /// Item put into a container
    ContainerItemAdd = 9,
    /// Item taken out of a container
    ContainerItemRemove = 10,
    /// Action refused
    CancelMessage = 11,
}

impl ServerOpcode {
    /// Get the opcode value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Client to server opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOpcode {
    KeepAlive = 0,
    Walk = 1,
    MoveItem = 2,
    Say = 3,
    Logout = 4,
}

impl TryFrom<u8> for ClientOpcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ClientOpcode::KeepAlive),
            1 => Ok(ClientOpcode::Walk),
            2 => Ok(ClientOpcode::MoveItem),
            3 => Ok(ClientOpcode::Say),
            4 => Ok(ClientOpcode::Logout),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }
}

/// Outgoing packet trait
pub trait OutgoingPacket {
    /// The packet opcode
    const OPCODE: ServerOpcode;

    /// Exact payload size in bytes, opcode excluded
    fn payload_size(&self) -> usize;

    /// Write the payload
    fn write(&self, writer: &mut PacketWriter);

    /// Encode into a frozen buffer, failing on overflow
    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut writer = PacketWriter::new(Self::OPCODE.as_u8(), self.payload_size());
        self.write(&mut writer);
        writer.finish()
    }
}

/// World layout sent to a joining player
#[derive(Debug, Clone)]
pub struct ServerStatePacket {
    pub width: u16,
    pub height: u16,
    pub depth: u8,
    pub chunk_width: u8,
    pub chunk_height: u8,
    pub chunk_depth: u8,
    pub tick_ms: u8,
    pub version: String,
}

impl OutgoingPacket for ServerStatePacket {
    const OPCODE: ServerOpcode = ServerOpcode::ServerState;

    fn payload_size(&self) -> usize {
        9 + encoded_string_len(&self.version, 2)
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u16(self.width);
        writer.write_u16(self.height);
        writer.write_u8(self.depth);
        writer.write_u8(self.chunk_width);
        writer.write_u8(self.chunk_height);
        writer.write_u8(self.chunk_depth);
        writer.write_u8(self.tick_ms);
        writer.write_string16(&self.version);
    }
}

/// Every tile of a chunk, layer by layer
///
/// An unallocated layer is a single zero byte; an allocated one is a tile
/// count followed by each tile (missing tiles as four zero bytes).
#[derive(Debug, Clone, Copy)]
pub struct ChunkPacket<'a> {
    chunk: &'a Chunk,
}

impl<'a> ChunkPacket<'a> {
    pub fn new(chunk: &'a Chunk) -> Self {
        Self { chunk }
    }
}

impl OutgoingPacket for ChunkPacket<'_> {
    const OPCODE: ServerOpcode = ServerOpcode::Chunk;

    fn payload_size(&self) -> usize {
        let layers: usize = self
            .chunk
            .layers()
            .map(|layer| match layer {
                None => 1,
                Some(tiles) => {
                    1 + tiles
                        .iter()
                        .map(|tile| PacketWriter::tile_size(tile.as_ref()))
                        .sum::<usize>()
                }
            })
            .sum();

        4 + POSITION_SIZE + layers
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.chunk.id());
        writer.write_position(&self.chunk.position());

        for layer in self.chunk.layers() {
            match layer {
                None => writer.write_u8(0),
                Some(tiles) => {
                    writer.write_u8(tiles.len().min(u8::MAX as usize) as u8);
                    for tile in tiles {
                        writer.write_tile(tile.as_ref());
                    }
                }
            }
        }
    }
}

/// Everything a client needs to draw a creature
#[derive(Debug, Clone, Copy)]
pub struct CreatureStatePacket<'a> {
    creature: &'a Creature,
}

impl<'a> CreatureStatePacket<'a> {
    pub fn new(creature: &'a Creature) -> Self {
        Self { creature }
    }
}

impl OutgoingPacket for CreatureStatePacket<'_> {
    const OPCODE: ServerOpcode = ServerOpcode::CreatureState;

    fn payload_size(&self) -> usize {
        4 + 1 + POSITION_SIZE + 1 + OUTFIT_SIZE + 4 + 4 + 2 + 1
            + encoded_string_len(&self.creature.name, 2)
            + 1
    }

    fn write(&self, writer: &mut PacketWriter) {
        let creature = self.creature;

        writer.write_u32(creature.id);
        writer.write_creature_type(creature.kind);
        writer.write_position(&creature.position);
        writer.write_u8(creature.direction.as_u8());
        writer.write_outfit(&creature.outfit);
        writer.write_u32(creature.health);
        writer.write_u32(creature.health_max);
        writer.write_u16(creature.speed);
        writer.write_creature_type(creature.kind);
        writer.write_string16(&creature.name);
        // Conditions
        writer.write_u8(0);
    }
}

/// Tells a client to drop a creature it can no longer see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatureForgetPacket {
    pub id: CreatureId,
}

impl OutgoingPacket for CreatureForgetPacket {
    const OPCODE: ServerOpcode = ServerOpcode::CreatureForget;

    fn payload_size(&self) -> usize {
        4
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.id);
    }
}

/// A creature stepped onto `position`, animating over `duration` milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatureMovePacket {
    pub id: CreatureId,
    pub position: Position,
    pub duration: u16,
}

impl OutgoingPacket for CreatureMovePacket {
    const OPCODE: ServerOpcode = ServerOpcode::CreatureMove;

    fn payload_size(&self) -> usize {
        4 + POSITION_SIZE + 2
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.id);
        writer.write_position(&self.position);
        writer.write_u16(self.duration);
    }
}

/// Speech from a creature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatureSayPacket {
    pub id: CreatureId,
    pub kind: CreatureKind,
    pub message: String,
    pub color: u8,
}

impl OutgoingPacket for CreatureSayPacket {
    const OPCODE: ServerOpcode = ServerOpcode::CreatureSay;

    fn payload_size(&self) -> usize {
        4 + 1 + encoded_string_len(&self.message, 2) + 1
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.id);
        writer.write_creature_type(self.kind);
        writer.write_string16(&self.message);
        writer.write_u8(self.color);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicEffectPacket {
    pub position: Position,
    pub effect: u8,
}

impl OutgoingPacket for MagicEffectPacket {
    const OPCODE: ServerOpcode = ServerOpcode::MagicEffect;

    fn payload_size(&self) -> usize {
        POSITION_SIZE + 1
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_position(&self.position);
        writer.write_u8(self.effect);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileItemAddPacket {
    pub position: Position,
    pub item: Item,
    pub index: u8,
}

impl OutgoingPacket for TileItemAddPacket {
    const OPCODE: ServerOpcode = ServerOpcode::TileItemAdd;

    fn payload_size(&self) -> usize {
        ITEM_SIZE + POSITION_SIZE + 1
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_item(Some(&self.item));
        writer.write_position(&self.position);
        writer.write_u8(self.index);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileItemRemovePacket {
    pub position: Position,
    pub index: u8,
    pub count: u8,
}

impl OutgoingPacket for TileItemRemovePacket {
    const OPCODE: ServerOpcode = ServerOpcode::TileItemRemove;

    fn payload_size(&self) -> usize {
        POSITION_SIZE + 2
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_position(&self.position);
        writer.write_u8(self.index);
        writer.write_u8(self.count);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerItemAddPacket {
    pub container: u32,
    pub index: u8,
    pub item: Item,
}

impl OutgoingPacket for ContainerItemAddPacket {
    const OPCODE: ServerOpcode = ServerOpcode::ContainerItemAdd;

    fn payload_size(&self) -> usize {
        4 + 1 + ITEM_SIZE
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.container);
        writer.write_u8(self.index);
        writer.write_item(Some(&self.item));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerItemRemovePacket {
    pub container: u32,
    pub index: u8,
    pub count: u8,
}

impl OutgoingPacket for ContainerItemRemovePacket {
    const OPCODE: ServerOpcode = ServerOpcode::ContainerItemRemove;

    fn payload_size(&self) -> usize {
        4 + 2
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_u32(self.container);
        writer.write_u8(self.index);
        writer.write_u8(self.count);
    }
}

/// Red status-bar text explaining why an action was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelMessagePacket {
    pub message: String,
}

impl CancelMessagePacket {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl OutgoingPacket for CancelMessagePacket {
    const OPCODE: ServerOpcode = ServerOpcode::CancelMessage;

    fn payload_size(&self) -> usize {
        encoded_string_len(&self.message, 2)
    }

    fn write(&self, writer: &mut PacketWriter) {
        writer.write_string16(&self.message);
    }
}

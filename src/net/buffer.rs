//! Packet buffer implementation
//!
//! Provides the two halves of the wire codec:
//! - [`PacketWriter`]: preallocated, opcode-prefixed writer with a sticky
//!   overflow flag instead of panics
//! - [`PacketReader`]: strict sequential cursor where reading past the end is a
//!   protocol error
//!
//! All integers are little-endian. Strings are UTF-8 with a one or two byte
//! length prefix and are escaped on write.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::game::creature::{CreatureKind, Outfit, OutfitDetails};
use crate::game::position::Position;
use crate::game::tile::{Item, Tile};
use crate::protocol::game::MoveTarget;

/// Maximum packet size (64KB)
pub const MAX_PACKET_SIZE: usize = 65535;

/// Encoded size of a position
pub const POSITION_SIZE: usize = 6;

/// Encoded size of an outfit
pub const OUTFIT_SIZE: usize = 11;

/// Encoded size of an item
pub const ITEM_SIZE: usize = 3;

/// Escape markup characters and drop control characters other than newline
pub fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            '\n' => escaped.push('\n'),
            c if c.is_control() => {}
            c => escaped.push(c),
        }
    }

    escaped
}

/// Encoded size of a string written with a `prefix`-byte length
pub fn encoded_string_len(text: &str, prefix: usize) -> usize {
    let max = if prefix == 1 { 0xFF } else { 0xFFFF };
    prefix + escape_text(text).len().min(max)
}

/// Cut a string at the last character boundary within `max` bytes
fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Opcode-prefixed packet writer over a preallocated buffer
///
/// A write that does not fit is skipped and flips the overflow flag; the flag
/// never resets and every later write is skipped too, so the bytes written are
/// always a valid prefix of the intended packet.
#[derive(Debug, Clone)]
pub struct PacketWriter {
    opcode: u8,
    data: BytesMut,
    capacity: usize,
    in_bounds: bool,
}

impl PacketWriter {
    /// Create a writer for `opcode` with room for `length` payload bytes
    pub fn new(opcode: u8, length: usize) -> Self {
        let capacity = 1 + length;
        let mut data = BytesMut::with_capacity(capacity);
        data.put_u8(opcode);

        Self {
            opcode,
            data,
            capacity,
            in_bounds: true,
        }
    }

    // ============ Properties ============

    /// Opcode this packet was created with
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Bytes written so far, opcode included
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if only the opcode has been written
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }

    /// Total capacity, opcode included
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once any write exceeded the capacity
    #[inline]
    pub fn overflow(&self) -> bool {
        !self.in_bounds
    }

    /// The written part of the packet
    #[inline]
    pub fn buffer(&self) -> &[u8] {
        &self.data
    }

    /// Freeze the packet, failing if it overflowed
    pub fn finish(self) -> Result<Bytes, ProtocolError> {
        if self.overflow() {
            return Err(ProtocolError::Overflow {
                opcode: self.opcode,
                capacity: self.capacity,
            });
        }
        Ok(self.data.freeze())
    }

    /// Check for room and record an overflow if there is none
    fn can_write(&mut self, bytes: usize) -> bool {
        if !self.in_bounds {
            return false;
        }
        if self.data.len() + bytes > self.capacity {
            self.in_bounds = false;
            return false;
        }
        true
    }

    // ============ Primitive Writes ============

    pub fn write_u8(&mut self, value: u8) {
        if self.can_write(1) {
            self.data.put_u8(value);
        }
    }

    pub fn write_u16(&mut self, value: u16) {
        if self.can_write(2) {
            self.data.put_u16_le(value);
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        if self.can_write(4) {
            self.data.put_u32_le(value);
        }
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    /// Write `amount` zero bytes
    pub fn write_null(&mut self, amount: usize) {
        if self.can_write(amount) {
            self.data.put_bytes(0, amount);
        }
    }

    /// Write raw bytes without a length prefix
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.can_write(bytes.len()) {
            self.data.put_slice(bytes);
        }
    }

    // ============ Strings ============

    /// Write an escaped string with a one byte length prefix
    pub fn write_string8(&mut self, text: &str) {
        let escaped = escape_text(text);
        let body = truncate_utf8(&escaped, 0xFF);
        if self.can_write(1 + body.len()) {
            self.data.put_u8(body.len() as u8);
            self.data.put_slice(body.as_bytes());
        }
    }

    /// Write an escaped string with a two byte length prefix
    pub fn write_string16(&mut self, text: &str) {
        let escaped = escape_text(text);
        let body = truncate_utf8(&escaped, 0xFFFF);
        if self.can_write(2 + body.len()) {
            self.data.put_u16_le(body.len() as u16);
            self.data.put_slice(body.as_bytes());
        }
    }

    // ============ Game Types ============

    /// Write a position as three u16 fields
    pub fn write_position(&mut self, position: &Position) {
        if self.can_write(POSITION_SIZE) {
            self.data.put_u16_le(position.x);
            self.data.put_u16_le(position.y);
            self.data.put_u16_le(position.z);
        }
    }

    /// Write an item as id and count, or three zero bytes for none
    pub fn write_item(&mut self, item: Option<&Item>) {
        match item {
            Some(item) => {
                self.write_u16(item.id);
                self.write_u8(item.count);
            }
            None => self.write_null(ITEM_SIZE),
        }
    }

    /// Write a tile: ground id, zone flags, then its items; four zero bytes
    /// stand in for a missing tile
    pub fn write_tile(&mut self, tile: Option<&Tile>) {
        let Some(tile) = tile else {
            self.write_null(4);
            return;
        };

        self.write_u16(tile.id());
        self.write_u8(tile.flags().bits());

        let items = tile.items();
        self.write_u8(items.len().min(u8::MAX as usize) as u8);
        for item in items.iter().take(u8::MAX as usize) {
            self.write_item(Some(item));
        }
    }

    /// Encoded size of a tile as written by `write_tile`
    pub fn tile_size(tile: Option<&Tile>) -> usize {
        match tile {
            Some(tile) => 4 + ITEM_SIZE * tile.items().len().min(u8::MAX as usize),
            None => 4,
        }
    }

    pub fn write_outfit(&mut self, outfit: &Outfit) {
        self.write_u16(outfit.id);
        self.write_u8(outfit.details.head);
        self.write_u8(outfit.details.body);
        self.write_u8(outfit.details.legs);
        self.write_u8(outfit.details.feet);
        self.write_u16(outfit.mount);
        self.write_bool(outfit.mounted);
        self.write_bool(outfit.addon_one);
        self.write_bool(outfit.addon_two);
    }

    pub fn write_creature_type(&mut self, kind: CreatureKind) {
        self.write_u8(kind.as_u8());
    }
}

/// Strict sequential reader over a received packet
#[derive(Debug, Clone)]
pub struct PacketReader {
    data: Bytes,
    position: usize,
}

impl PacketReader {
    /// Wrap a received frame
    pub fn new(data: Bytes) -> Self {
        Self { data, position: 0 }
    }

    // ============ Properties ============

    /// Current cursor offset
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the cursor to an absolute offset
    pub fn seek(&mut self, offset: usize) {
        self.position = offset.min(self.data.len());
    }

    /// Bytes left to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Check if anything is left to read
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.position < self.data.len()
    }

    /// Take the next `needed` bytes or fail without moving the cursor
    fn take(&mut self, needed: usize) -> Result<&[u8], ProtocolError> {
        if self.remaining() < needed {
            return Err(ProtocolError::UnexpectedEof {
                offset: self.position,
                needed,
                remaining: self.remaining(),
            });
        }
        let start = self.position;
        self.position += needed;
        Ok(&self.data[start..start + needed])
    }

    // ============ Primitive Reads ============

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let mut bytes = self.take(1)?;
        Ok(bytes.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let mut bytes = self.take(2)?;
        Ok(bytes.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let mut bytes = self.take(4)?;
        Ok(bytes.get_u32_le())
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? == 1)
    }

    // ============ Strings ============

    /// Read a string with a one byte length prefix
    pub fn read_string8(&mut self) -> Result<String, ProtocolError> {
        let length = self.read_u8()? as usize;
        self.read_utf8(length)
    }

    /// Read a string with a two byte length prefix
    pub fn read_string16(&mut self) -> Result<String, ProtocolError> {
        let length = self.read_u16()? as usize;
        self.read_utf8(length)
    }

    fn read_utf8(&mut self, length: usize) -> Result<String, ProtocolError> {
        let bytes = self.take(length)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidStringEncoding)
    }

    // ============ Game Types ============

    pub fn read_position(&mut self) -> Result<Position, ProtocolError> {
        Ok(Position::new(
            self.read_u16()?,
            self.read_u16()?,
            self.read_u16()?,
        ))
    }

    pub fn read_outfit(&mut self) -> Result<Outfit, ProtocolError> {
        Ok(Outfit {
            id: self.read_u16()?,
            details: OutfitDetails {
                head: self.read_u8()?,
                body: self.read_u8()?,
                legs: self.read_u8()?,
                feet: self.read_u8()?,
            },
            mount: self.read_u16()?,
            mounted: self.read_bool()?,
            addon_one: self.read_bool()?,
            addon_two: self.read_bool()?,
        })
    }

    /// Read a drag-and-drop address
    ///
    /// Discriminator `0` is a container (a reserved u16 followed by the u32
    /// container id), `1` is a map position. Unknown discriminators read as
    /// `None`.
    pub fn read_move_target(&mut self) -> Result<Option<MoveTarget>, ProtocolError> {
        match self.read_u8()? {
            0 => {
                let _reserved = self.read_u16()?;
                Ok(Some(MoveTarget::Container(self.read_u32()?)))
            }
            1 => Ok(Some(MoveTarget::Tile(self.read_position()?))),
            _ => Ok(None),
        }
    }
}

impl From<&[u8]> for PacketReader {
    fn from(slice: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_basic_read_write() {
        let mut writer = PacketWriter::new(7, 7);
        writer.write_u8(42);
        writer.write_u16(0x1234);
        writer.write_u32(987_654);

        assert!(!writer.overflow());
        let bytes = writer.finish().unwrap();
        assert_eq!(&bytes[..3], &[7, 42, 0x34]);

        let mut reader = PacketReader::new(bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u8().unwrap(), 42);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 987_654);
        assert!(!reader.is_readable());
    }

    #[test]
    fn test_overflow_is_sticky_and_silent() {
        let mut writer = PacketWriter::new(1, 3);
        writer.write_u16(0xAAAA);
        writer.write_u16(0xBBBB);

        assert!(writer.overflow());
        assert_eq!(writer.buffer(), &[1, 0xAA, 0xAA]);

        // Would fit, but the packet is already broken
        writer.write_u8(0xCC);
        assert_eq!(writer.len(), 3);

        assert_eq!(
            writer.finish().unwrap_err(),
            ProtocolError::Overflow {
                opcode: 1,
                capacity: 4
            }
        );
    }

    #[test]
    fn test_exact_fit_does_not_overflow() {
        let mut writer = PacketWriter::new(9, POSITION_SIZE + 1);
        writer.write_position(&Position::new(1, 2, 3));
        writer.write_bool(true);

        assert!(!writer.overflow());
        assert_eq!(writer.buffer().len(), writer.capacity());
    }

    #[test]
    fn test_read_past_end() {
        let mut reader = PacketReader::from(&[1u8, 2, 3][..]);
        assert_eq!(reader.read_u16().unwrap(), 0x0201);

        assert_eq!(
            reader.read_u32().unwrap_err(),
            ProtocolError::UnexpectedEof {
                offset: 2,
                needed: 4,
                remaining: 1
            }
        );
        // The failed read did not move the cursor
        assert_eq!(reader.read_u8().unwrap(), 3);
    }

    #[test]
    fn test_strings_are_escaped() {
        let mut writer = PacketWriter::new(0, 64);
        writer.write_string8("<b>hi</b>");
        writer.write_string16("a & b\u{7}\nc");

        let mut reader = PacketReader::new(writer.finish().unwrap());
        reader.seek(1);
        assert_eq!(reader.read_string8().unwrap(), "&lt;b&gt;hi&lt;/b&gt;");
        assert_eq!(reader.read_string16().unwrap(), "a &amp; b\nc");
    }

    #[test]
    fn test_string8_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let mut writer = PacketWriter::new(0, 512);
        writer.write_string8(&long);

        let mut reader = PacketReader::new(writer.finish().unwrap());
        reader.seek(1);
        let read = reader.read_string8().unwrap();
        assert_eq!(read.len(), 254);
        assert_eq!(encoded_string_len(&long, 1), 256);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut reader = PacketReader::from(&[2u8, 0xFF, 0xFE][..]);
        assert_eq!(
            reader.read_string8().unwrap_err(),
            ProtocolError::InvalidStringEncoding
        );
    }

    #[test]
    fn test_tile_and_outfit() {
        let mut tile = Tile::new(102, Position::new(1, 1, 7));
        tile.add_item(Item::new(2148, 5));

        let outfit = Outfit {
            id: 130,
            details: OutfitDetails {
                head: 1,
                body: 2,
                legs: 3,
                feet: 4,
            },
            mount: 368,
            mounted: true,
            addon_one: false,
            addon_two: true,
        };

        let size = PacketWriter::tile_size(Some(&tile)) + PacketWriter::tile_size(None) + OUTFIT_SIZE;
        let mut writer = PacketWriter::new(0, size);
        writer.write_tile(Some(&tile));
        writer.write_tile(None);
        writer.write_outfit(&outfit);
        assert!(!writer.overflow());
        assert_eq!(writer.len(), size + 1);

        let mut reader = PacketReader::new(writer.finish().unwrap());
        reader.seek(1);
        assert_eq!(reader.read_u16().unwrap(), 102);
        assert_eq!(reader.read_u8().unwrap(), 0);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_u16().unwrap(), 2148);
        assert_eq!(reader.read_u8().unwrap(), 5);
        assert_eq!(reader.read_u32().unwrap(), 0);
        assert_eq!(reader.read_outfit().unwrap(), outfit);
    }

    #[test]
    fn test_move_target() {
        let mut writer = PacketWriter::new(0, 32);
        writer.write_u8(0);
        writer.write_u16(0xFFFF);
        writer.write_u32(64);
        writer.write_u8(1);
        writer.write_position(&Position::new(10, 20, 7));
        writer.write_u8(9);

        let mut reader = PacketReader::new(writer.finish().unwrap());
        reader.seek(1);
        assert_eq!(reader.read_move_target().unwrap(), Some(MoveTarget::Container(64)));
        assert_eq!(
            reader.read_move_target().unwrap(),
            Some(MoveTarget::Tile(Position::new(10, 20, 7)))
        );
        assert_eq!(reader.read_move_target().unwrap(), None);
    }

    proptest! {
        #[test]
        fn prop_position_round_trip(x in any::<u16>(), y in any::<u16>(), z in any::<u16>()) {
            let mut writer = PacketWriter::new(0, POSITION_SIZE);
            writer.write_position(&Position::new(x, y, z));

            let mut reader = PacketReader::new(writer.finish().unwrap());
            reader.seek(1);
            prop_assert_eq!(reader.read_position().unwrap(), Position::new(x, y, z));
        }
    }
}

//! Error handling module
//!
//! Defines custom error types for the Lattice server.

use std::io;

use thiserror::Error;

/// Main error type for the Lattice server
#[derive(Error, Debug)]
pub enum LatticeError {
    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Scheduling errors
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Game logic errors
    #[error("Game error: {0}")]
    Game(#[from] GameError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Protocol-specific errors
///
/// Every variant is connection-fatal: the session that produced it is closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid opcode: {0}")]
    InvalidOpcode(u8),

    #[error("Read past end of packet: needed {needed} bytes at offset {offset}, {remaining} remaining")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("Packet overflow: opcode {opcode} exceeded capacity of {capacity} bytes")]
    Overflow { opcode: u8, capacity: usize },

    #[error("Invalid string encoding")]
    InvalidStringEncoding,

    #[error("Invalid direction: {0}")]
    InvalidDirection(u8),
}

/// Network-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),
}

/// Scheduling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Cannot schedule an event with negative delay {0}")]
    NegativeDelay(i64),
}

/// Game logic errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    #[error("Creature not found: {0}")]
    CreatureNotFound(u32),

    #[error("Creature already in world: {0}")]
    CreatureExists(u32),

    #[error("Invalid location: ({x}, {y}, {z})")]
    InvalidLocation { x: u16, y: u16, z: u16 },

    #[error("Tile occupied: ({x}, {y}, {z})")]
    TileOccupied { x: u16, y: u16, z: u16 },

    #[error("Session not found for creature {0}")]
    SessionNotFound(u32),

    #[error("Invalid item move: {0}")]
    InvalidMove(String),
}

/// Result type alias for Lattice operations
pub type Result<T> = std::result::Result<T, LatticeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidOpcode(42);
        assert_eq!(err.to_string(), "Invalid opcode: 42");

        let err = ProtocolError::UnexpectedEof {
            offset: 3,
            needed: 2,
            remaining: 1,
        };
        assert_eq!(
            err.to_string(),
            "Read past end of packet: needed 2 bytes at offset 3, 1 remaining"
        );

        let err = ScheduleError::NegativeDelay(-4);
        assert_eq!(
            err.to_string(),
            "Cannot schedule an event with negative delay -4"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: LatticeError = GameError::CreatureNotFound(7).into();
        assert!(matches!(err, LatticeError::Game(GameError::CreatureNotFound(7))));
        assert_eq!(err.to_string(), "Game error: Creature not found: 7");

        let err: LatticeError = ProtocolError::InvalidOpcode(9).into();
        assert!(matches!(err, LatticeError::Protocol(_)));
    }
}

//! Networking module
//!
//! This module handles all network-related functionality for the Lattice server:
//! - Packet buffers (framing cursors for reading and writing)
//! - TCP transport with length-prefixed frames
//! - Session management
//! - Connection lifecycle

pub mod buffer;
pub mod session;
pub mod transport;

pub use buffer::{PacketReader, PacketWriter};
pub use session::{Session, SessionHandle, SessionManager, SessionState};
pub use transport::Listener;

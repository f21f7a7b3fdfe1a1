//! Event scheduling
//!
//! Tick-based scheduler and the binary heap backing it.

pub mod event;
pub mod heap;
pub mod queue;

pub use event::{Callback, EventHandle, EventState, Tick};
pub use heap::{BinaryHeap, Scored};
pub use queue::EventQueue;

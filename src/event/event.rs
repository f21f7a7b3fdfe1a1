//! Scheduled events
//!
//! An event is a callback bound to the tick it should fire on. The callback
//! slot is owned by the event and emptied on any terminal transition, so a
//! cancelled event stops keeping whatever it captured alive immediately.

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use super::heap::Scored;

/// Simulation time unit
pub type Tick = u64;

/// Deferred callback run against a context when its event fires
pub type Callback<C> = Box<dyn FnOnce(&mut C)>;

/// Lifecycle of a scheduled event
pub enum EventState<C> {
    /// Waiting in the queue, callback still owned
    Pending(Callback<C>),
    /// Cancelled before firing; the callback has been dropped
    Cancelled,
    /// Popped from the queue and handed to the scheduler
    Fired,
}

impl<C> EventState<C> {
    /// Name of the state, for logging
    pub fn name(&self) -> &'static str {
        match self {
            EventState::Pending(_) => "Pending",
            EventState::Cancelled => "Cancelled",
            EventState::Fired => "Fired",
        }
    }
}

/// A callback tagged with the tick it is due on
pub struct Event<C> {
    due: Tick,
    state: RefCell<EventState<C>>,
}

impl<C> Event<C> {
    fn new(due: Tick, callback: Callback<C>) -> Self {
        Self {
            due,
            state: RefCell::new(EventState::Pending(callback)),
        }
    }

    /// Take the callback out of a pending event, marking it fired
    fn take_callback(&self) -> Option<Callback<C>> {
        let mut state = self.state.borrow_mut();
        match mem::replace(&mut *state, EventState::Fired) {
            EventState::Pending(callback) => Some(callback),
            other => {
                *state = other;
                None
            }
        }
    }
}

/// Shared handle to a scheduled event
///
/// Handles are cheap to clone. The queue holds one; whoever scheduled the event
/// may hold others to cancel it later.
pub struct EventHandle<C>(Rc<Event<C>>);

impl<C> EventHandle<C> {
    pub(crate) fn new(due: Tick, callback: Callback<C>) -> Self {
        Self(Rc::new(Event::new(due, callback)))
    }

    /// The tick this event fires on
    #[inline]
    pub fn due_tick(&self) -> Tick {
        self.0.due
    }

    /// Ticks left before the event fires (zero once due)
    pub fn remaining_ticks(&self, now: Tick) -> Tick {
        self.0.due.saturating_sub(now)
    }

    /// Cancel the event, dropping its callback
    ///
    /// Returns false when the event had already fired or been cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.0.state.borrow_mut();
        if !matches!(*state, EventState::Pending(_)) {
            return false;
        }
        *state = EventState::Cancelled;
        true
    }

    /// Check if the event was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.0.state.borrow(), EventState::Cancelled)
    }

    /// Check if the event is still waiting to fire
    pub fn is_pending(&self) -> bool {
        matches!(*self.0.state.borrow(), EventState::Pending(_))
    }

    /// Check if the event has fired
    pub fn is_fired(&self) -> bool {
        matches!(*self.0.state.borrow(), EventState::Fired)
    }

    /// Name of the current state
    pub fn state_name(&self) -> &'static str {
        self.0.state.borrow().name()
    }

    pub(crate) fn take_callback(&self) -> Option<Callback<C>> {
        self.0.take_callback()
    }

    pub(crate) fn ptr_key(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl<C> Clone for EventHandle<C> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<C> PartialEq for EventHandle<C> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<C> Eq for EventHandle<C> {}

impl<C> Scored for EventHandle<C> {
    type Key = usize;

    fn score(&self) -> u64 {
        self.0.due
    }

    fn key(&self) -> usize {
        self.ptr_key()
    }
}

impl<C> fmt::Debug for EventHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandle")
            .field("due", &self.0.due)
            .field("state", &self.state_name())
            .finish()
    }
}

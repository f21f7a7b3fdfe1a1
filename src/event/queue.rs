//! Event scheduler
//!
//! Priority queue of delayed callbacks ordered by due tick. Cooldowns, movement
//! locks and condition timers are all represented as events here rather than as
//! anything that blocks.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use tracing::{error, trace, warn};

use super::event::{Callback, EventHandle, Tick};
use super::heap::{BinaryHeap, Scored};
use crate::error::ScheduleError;

/// Scheduler of delayed, cancelable callbacks run against a context `C`
pub struct EventQueue<C> {
    heap: BinaryHeap<EventHandle<C>>,
    /// Tick the queue was last advanced to
    now: Tick,
    /// Wall time of one tick, used to convert milliseconds to ticks
    tick_interval: Duration,
    /// Events fired since the last `events_handled` call
    handled: u64,
}

impl<C> EventQueue<C> {
    /// Create an empty queue for a loop running at `tick_interval`
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(256),
            now: 0,
            tick_interval,
            handled: 0,
        }
    }

    /// The tick the queue was last advanced to
    #[inline]
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Number of queued events (cancelled ones included until popped)
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if nothing is queued
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Advance the queue clock without draining
    pub fn advance_to(&mut self, tick: Tick) {
        if tick > self.now {
            self.now = tick;
        }
    }

    /// Schedule a callback `delay` ticks from now
    ///
    /// A delay of zero is promoted to one tick: nothing scheduled now can fire
    /// during the tick that is currently being processed.
    pub fn schedule<F>(&mut self, delay: i64, callback: F) -> Result<EventHandle<C>, ScheduleError>
    where
        F: FnOnce(&mut C) + 'static,
    {
        if delay < 0 {
            warn!(delay, now = self.now, "Rejected event with negative delay");
            return Err(ScheduleError::NegativeDelay(delay));
        }

        let future = delay.max(1) as u64;
        let handle = EventHandle::new(self.now + future, Box::new(callback) as Callback<C>);

        self.heap.push(handle.clone());
        trace!(due = handle.due_tick(), now = self.now, "Scheduled event");

        Ok(handle)
    }

    /// Schedule a callback approximately `milliseconds` from now
    pub fn schedule_ms<F>(
        &mut self,
        milliseconds: u64,
        callback: F,
    ) -> Result<EventHandle<C>, ScheduleError>
    where
        F: FnOnce(&mut C) + 'static,
    {
        let ticks = self.ms_to_ticks(milliseconds);
        self.schedule(ticks as i64, callback)
    }

    /// Schedule a callback approximately `seconds` from now
    pub fn schedule_secs<F>(
        &mut self,
        seconds: u64,
        callback: F,
    ) -> Result<EventHandle<C>, ScheduleError>
    where
        F: FnOnce(&mut C) + 'static,
    {
        self.schedule_ms(seconds.saturating_mul(1000), callback)
    }

    /// Convert a wall-clock duration to whole ticks (rounded down)
    pub fn ms_to_ticks(&self, milliseconds: u64) -> u64 {
        let interval = (self.tick_interval.as_millis() as u64).max(1);
        milliseconds / interval
    }

    /// Cancel an event; safe to call after it fired or was already cancelled
    pub fn cancel(&self, handle: &EventHandle<C>) -> bool {
        handle.cancel()
    }

    /// Cancel an event and take it out of the heap right away
    ///
    /// This is a linear scan; plain `cancel` is cheaper and the cancelled entry
    /// is discarded when it reaches the head of the queue.
    pub fn remove(&mut self, handle: &EventHandle<C>) -> bool {
        handle.cancel();
        self.heap.remove(&handle.key()).is_some()
    }

    /// Pop the next callback due at or before `current`
    ///
    /// Cancelled entries are discarded on the way. Each event is out of the
    /// queue before its callback is returned, so a callback that reschedules
    /// itself lands on a later tick.
    pub fn pop_due(&mut self, current: Tick) -> Option<Callback<C>> {
        self.advance_to(current);

        loop {
            if self.heap.has_executed_until(current) {
                return None;
            }

            let next = self.heap.pop()?;

            if let Some(callback) = next.take_callback() {
                self.handled += 1;
                return Some(callback);
            }
        }
    }

    /// Run every pending event due at or before `current` against `context`
    ///
    /// Returns the number of callbacks that ran to completion.
    pub fn tick(&mut self, current: Tick, context: &mut C) -> usize {
        let mut completed = 0;

        while let Some(callback) = self.pop_due(current) {
            if fire(callback, context, current) {
                completed += 1;
            }
        }

        completed
    }

    /// Events fired since the previous call; resets the counter
    pub fn events_handled(&mut self) -> u64 {
        std::mem::take(&mut self.handled)
    }
}

impl<C> std::fmt::Debug for EventQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("now", &self.now)
            .field("queued", &self.heap.len())
            .field("tick_interval", &self.tick_interval)
            .finish()
    }
}

/// Invoke a callback, containing any panic so the rest of the drain proceeds
pub fn fire<C>(callback: Callback<C>, context: &mut C, tick: Tick) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(move || callback(context))) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                tick,
                reason = %panic_message(payload.as_ref()),
                "Scheduled event panicked"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Log {
        fired: Vec<&'static str>,
    }

    fn queue() -> EventQueue<Log> {
        EventQueue::new(Duration::from_millis(50))
    }

    #[test]
    fn test_scenario_five_three_three() {
        let mut events = queue();
        let mut log = Log::default();

        events.schedule(5, |l: &mut Log| l.fired.push("five")).unwrap();
        events.schedule(3, |l: &mut Log| l.fired.push("three-a")).unwrap();
        events.schedule(3, |l: &mut Log| l.fired.push("three-b")).unwrap();

        for tick in 1..=2 {
            assert_eq!(events.tick(tick, &mut log), 0);
        }

        assert_eq!(events.tick(3, &mut log), 2);
        let mut fired = log.fired.clone();
        fired.sort_unstable();
        assert_eq!(fired, vec!["three-a", "three-b"]);

        assert_eq!(events.tick(4, &mut log), 0);
        assert_eq!(events.tick(5, &mut log), 1);
        assert_eq!(log.fired.len(), 3);
        assert_eq!(log.fired[2], "five");
        assert!(events.is_empty());
        assert_eq!(events.events_handled(), 3);
        assert_eq!(events.events_handled(), 0);
    }

    #[test]
    fn test_zero_delay_fires_next_tick() {
        let mut events = queue();
        let mut log = Log::default();
        events.advance_to(7);

        let handle = events.schedule(0, |l: &mut Log| l.fired.push("zero")).unwrap();
        assert_eq!(handle.due_tick(), 8);

        assert_eq!(events.tick(7, &mut log), 0);
        assert_eq!(events.tick(8, &mut log), 1);
        assert_eq!(log.fired, vec!["zero"]);
    }

    #[test]
    fn test_negative_delay_rejected() {
        let mut events = queue();
        let result = events.schedule(-1, |_: &mut Log| {});
        assert_eq!(result.unwrap_err(), ScheduleError::NegativeDelay(-1));
        assert!(events.is_empty());
    }

    #[test]
    fn test_cancel_before_and_after_firing() {
        let mut events = queue();
        let mut log = Log::default();

        let cancelled = events.schedule(1, |l: &mut Log| l.fired.push("cancelled")).unwrap();
        let kept = events.schedule(1, |l: &mut Log| l.fired.push("kept")).unwrap();

        assert!(events.cancel(&cancelled));
        assert!(!events.cancel(&cancelled));

        events.tick(1, &mut log);
        assert_eq!(log.fired, vec!["kept"]);
        assert!(kept.is_fired());
        assert!(!events.cancel(&kept));
    }

    #[test]
    fn test_remove_takes_event_out_of_heap() {
        let mut events = queue();
        let mut log = Log::default();

        let handle = events.schedule(4, |l: &mut Log| l.fired.push("removed")).unwrap();
        events.schedule(2, |l: &mut Log| l.fired.push("kept")).unwrap();

        assert!(events.remove(&handle));
        assert_eq!(events.len(), 1);
        assert!(!events.remove(&handle));

        events.tick(10, &mut log);
        assert_eq!(log.fired, vec!["kept"]);
    }

    #[test]
    fn test_self_rescheduling_does_not_loop() {
        struct Ctx {
            runs: u32,
            pending: Vec<u32>,
        }

        let mut events: EventQueue<Ctx> = EventQueue::new(Duration::from_millis(50));
        let mut ctx = Ctx {
            runs: 0,
            pending: Vec::new(),
        };

        events
            .schedule(1, |c: &mut Ctx| {
                c.runs += 1;
                c.pending.push(c.runs);
            })
            .unwrap();

        // Drain one at a time so the callback could reschedule through the queue
        while let Some(callback) = events.pop_due(1) {
            fire(callback, &mut ctx, 1);
            events.schedule(0, |c: &mut Ctx| c.runs += 1).unwrap();
        }

        assert_eq!(ctx.runs, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(events.tick(2, &mut ctx), 1);
        assert_eq!(ctx.runs, 2);
    }

    #[test]
    fn test_panicking_callback_does_not_abort_drain() {
        let mut events = queue();
        let mut log = Log::default();

        events.schedule(1, |_: &mut Log| panic!("boom")).unwrap();
        events.schedule(1, |l: &mut Log| l.fired.push("after")).unwrap();
        events.schedule(1, |l: &mut Log| l.fired.push("also")).unwrap();

        assert_eq!(events.tick(1, &mut log), 2);
        assert_eq!(log.fired.len(), 2);
        assert!(events.is_empty());
    }

    #[test]
    fn test_schedule_ms_converts_to_ticks() {
        let mut events = queue();

        let handle = events.schedule_ms(1000, |_: &mut Log| {}).unwrap();
        assert_eq!(handle.due_tick(), 20);

        // Shorter than one tick still waits for the next tick
        let handle = events.schedule_ms(10, |_: &mut Log| {}).unwrap();
        assert_eq!(handle.due_tick(), 1);

        let handle = events.schedule_secs(2, |_: &mut Log| {}).unwrap();
        assert_eq!(handle.due_tick(), 40);
    }

    #[test]
    fn test_single_drain_runs_in_due_order() {
        let mut events = queue();
        let mut log = Log::default();

        events.schedule(7, |l: &mut Log| l.fired.push("seven")).unwrap();
        events.schedule(2, |l: &mut Log| l.fired.push("two")).unwrap();
        events.schedule(5, |l: &mut Log| l.fired.push("five")).unwrap();

        assert_eq!(events.tick(10, &mut log), 3);
        assert_eq!(log.fired, vec!["two", "five", "seven"]);
    }

    #[derive(Debug, Clone)]
    enum QueueOp {
        Schedule(i64),
        Cancel(usize),
        Remove(usize),
    }

    fn queue_op() -> impl Strategy<Value = QueueOp> {
        prop_oneof![
            3 => (0i64..40).prop_map(QueueOp::Schedule),
            1 => (0usize..64).prop_map(QueueOp::Cancel),
            1 => (0usize..64).prop_map(QueueOp::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_drain_fires_due_events_once_in_order(
            ops in prop::collection::vec(queue_op(), 1..100),
            until in 0u64..50,
        ) {
            let mut events: EventQueue<Vec<(usize, Tick)>> = EventQueue::new(Duration::from_millis(50));
            let mut handles = Vec::new();
            let mut live = Vec::new();

            for op in ops {
                match op {
                    QueueOp::Schedule(delay) => {
                        let index = handles.len();
                        let due = delay.max(1) as Tick;
                        let handle = events
                            .schedule(delay, move |fired: &mut Vec<(usize, Tick)>| fired.push((index, due)))
                            .unwrap();
                        prop_assert_eq!(handle.due_tick(), due);
                        handles.push(handle);
                        live.push(true);
                    }
                    QueueOp::Cancel(i) => {
                        if handles.is_empty() {
                            continue;
                        }
                        let i = i % handles.len();
                        events.cancel(&handles[i]);
                        live[i] = false;
                    }
                    QueueOp::Remove(i) => {
                        if handles.is_empty() {
                            continue;
                        }
                        let i = i % handles.len();
                        events.remove(&handles[i]);
                        live[i] = false;
                    }
                }
            }

            let mut fired = Vec::new();
            events.tick(until, &mut fired);

            prop_assert!(fired.windows(2).all(|pair| pair[0].1 <= pair[1].1));

            let mut indices: Vec<usize> = fired.iter().map(|(index, _)| *index).collect();
            indices.sort_unstable();
            let expected: Vec<usize> = (0..handles.len())
                .filter(|i| live[*i] && handles[*i].due_tick() <= until)
                .collect();
            prop_assert_eq!(indices, expected);

            for (i, handle) in handles.iter().enumerate() {
                prop_assert_eq!(handle.is_pending(), live[i] && handle.due_tick() > until);
            }
        }
    }
}

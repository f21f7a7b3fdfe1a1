//! Fixed-tick game loop
//!
//! Maps wall time onto ticks:
//! - The tick counter advances exactly once per iteration
//! - Drift tracks how late an iteration started against the nominal schedule,
//!   kept below one interval (whole intervals of lateness are dropped, never
//!   replayed as extra ticks)
//! - The sleep before the next iteration pays drift and execution time back
//! - Shutdown is cooperative: an iteration in progress always completes

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::event::Tick;

/// Snapshot of loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub tick: Tick,
    pub drift: Duration,
    /// Mean time spent inside the tick callback
    pub average_execution: Duration,
}

/// Drives a callback once per tick interval
#[derive(Debug)]
pub struct GameLoop {
    interval: Duration,
    /// Ticks between diagnostics lines (0 disables them)
    log_interval: u64,
    tick: Tick,
    drift: Duration,
    /// Nominal start of the current iteration
    ideal: Option<Instant>,
    /// Actual start of the current iteration
    started: Option<Instant>,
    execution_total: Duration,
    /// Execution time since the last diagnostics line
    window_total: Duration,
    window_ticks: u64,
}

impl GameLoop {
    pub fn new(interval: Duration, log_interval: u64) -> Self {
        Self {
            interval,
            log_interval,
            tick: 0,
            drift: Duration::ZERO,
            ideal: None,
            started: None,
            execution_total: Duration::ZERO,
            window_total: Duration::ZERO,
            window_ticks: 0,
        }
    }

    /// Number of completed or running iterations
    #[inline]
    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    #[inline]
    pub fn drift(&self) -> Duration {
        self.drift
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True on every `n`th tick
    pub fn tick_modulus(&self, n: u64) -> bool {
        n != 0 && self.tick % n == 0
    }

    pub fn stats(&self) -> LoopStats {
        let average_execution = match u32::try_from(self.tick) {
            Ok(0) => Duration::ZERO,
            Ok(ticks) => self.execution_total / ticks,
            Err(_) => Duration::from_nanos(
                u64::try_from(self.execution_total.as_nanos() / u128::from(self.tick)).unwrap_or(u64::MAX),
            ),
        };

        LoopStats {
            tick: self.tick,
            drift: self.drift,
            average_execution,
        }
    }

    /// Start an iteration at wall time `now`; returns the new tick
    pub fn begin_iteration(&mut self, now: Instant) -> Tick {
        self.tick += 1;
        self.started = Some(now);

        let Some(previous) = self.ideal else {
            self.ideal = Some(now);
            self.drift = Duration::ZERO;
            return self.tick;
        };

        let ideal = previous + self.interval;
        if now < ideal {
            // Woke early: resynchronise on the actual start
            self.ideal = Some(now);
            self.drift = Duration::ZERO;
            return self.tick;
        }

        let late = (now - ideal).as_nanos();
        let interval = self.interval.as_nanos().max(1);
        self.drift = Duration::from_nanos(u64::try_from(late % interval).unwrap_or(0));
        self.ideal = Some(now - self.drift);

        self.tick
    }

    /// Finish the current iteration at wall time `now`; returns the sleep
    /// before the next one
    pub fn finish_iteration(&mut self, now: Instant) -> Duration {
        let execution = self
            .started
            .take()
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();

        self.execution_total += execution;
        self.window_total += execution;
        self.window_ticks += 1;

        if self.tick_modulus(self.log_interval) {
            let average = self.window_total / u32::try_from(self.window_ticks).unwrap_or(u32::MAX);
            info!(
                tick = self.tick,
                drift_ms = self.drift.as_millis() as u64,
                average_execution_us = average.as_micros() as u64,
                "Game loop diagnostics"
            );
            self.window_total = Duration::ZERO;
            self.window_ticks = 0;
        }

        self.interval.saturating_sub(self.drift + execution)
    }

    /// Run until a shutdown signal arrives
    ///
    /// `step` is called synchronously once per tick.
    pub async fn run<F>(&mut self, shutdown: &mut broadcast::Receiver<()>, mut step: F)
    where
        F: FnMut(Tick),
    {
        info!(interval_ms = self.interval.as_millis() as u64, "Game loop started");

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            let tick = self.begin_iteration(Instant::now());
            step(tick);
            let wait = self.finish_iteration(Instant::now());

            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.recv() => {
                    debug!(tick, "Shutdown signal received");
                    break;
                }
            }
        }

        info!(total_ticks = self.tick, "Game loop stopped");
    }
}

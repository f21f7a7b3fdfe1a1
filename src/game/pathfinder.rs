//! A* pathfinding over lattice tiles
//!
//! Search state lives in a side table keyed by tile position that only exists
//! for the duration of one search; tiles themselves carry no search state, so
//! an aborted or exhausted search can never leak into the next one.

use std::collections::HashMap;
use std::mem;

use tracing::trace;

use super::creature::Occupancy;
use super::lattice::Lattice;
use super::position::Position;
use crate::event::{BinaryHeap, Scored};

/// Friction the heuristic assumes per tile
pub const AVERAGE_FRICTION: u32 = 130;

/// Default search window (half-width, half-height) around start and goal
pub const DEFAULT_WINDOW: (u16, u16) = (11, 8);

/// Where a search is allowed to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PathMode {
    /// Stop on any walkable tile next to the target
    Adjacent = 0,
    /// Stop on the target itself
    Exact = 1,
}

/// Search counters since the last `stats` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathStats {
    pub iterations: u64,
    pub requests: u64,
}

/// Per-search state of one tile
#[derive(Debug, Clone, Copy)]
struct PathNode {
    parent: Option<Position>,
    closed: bool,
    visited: bool,
    /// Cost from the start (g)
    cost: u32,
    /// Estimated cost to the goal (h)
    heuristic: u32,
}

/// Entry in the open set
#[derive(Debug, Clone, Copy)]
struct OpenNode {
    position: Position,
    score: u64,
}

impl Scored for OpenNode {
    type Key = Position;

    fn score(&self) -> u64 {
        self.score
    }

    fn key(&self) -> Position {
        self.position
    }
}

/// Reusable A* search
#[derive(Debug)]
pub struct Pathfinder {
    nodes: HashMap<Position, PathNode>,
    open: BinaryHeap<OpenNode>,
    window: (u16, u16),
    friction: u32,
    stats: PathStats,
}

impl Default for Pathfinder {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, AVERAGE_FRICTION)
    }
}

impl Pathfinder {
    /// Create a pathfinder with a search window and heuristic friction
    pub fn new(window: (u16, u16), friction: u32) -> Self {
        Self {
            nodes: HashMap::new(),
            open: BinaryHeap::with_capacity(64),
            window,
            friction,
            stats: PathStats::default(),
        }
    }

    /// Counters since the previous call; resets them
    pub fn stats(&mut self) -> PathStats {
        mem::take(&mut self.stats)
    }

    /// Nodes still held from a search (zero between searches)
    pub fn residual(&self) -> usize {
        self.nodes.len() + self.open.len()
    }

    /// Find a path from `from` to `to`
    ///
    /// The result is reversed: index 0 is the final tile and the next step is
    /// at the end, so callers pop steps off the back. The start tile is not
    /// included. Empty when the goal cannot be reached.
    pub fn search<O>(
        &mut self,
        lattice: &Lattice,
        creature: &O,
        from: &Position,
        to: &Position,
        mode: PathMode,
    ) -> Vec<Position>
    where
        O: Occupancy + ?Sized,
    {
        self.stats.requests += 1;

        let path = self.run(lattice, creature, from, to, mode);

        self.nodes.clear();
        self.open.clear();

        trace!(from = %from, to = %to, mode = ?mode, steps = path.len(), "Path search finished");
        path
    }

    fn run<O>(
        &mut self,
        lattice: &Lattice,
        creature: &O,
        from: &Position,
        to: &Position,
        mode: PathMode,
    ) -> Vec<Position>
    where
        O: Occupancy + ?Sized,
    {
        let Some(goal) = lattice.tile(to) else {
            return Vec::new();
        };
        let (window_x, window_y) = self.window;

        let start = self.enable(from, to);
        start.visited = true;
        let score = u64::from(start.heuristic);
        self.open.push(OpenNode {
            position: *from,
            score,
        });

        while let Some(OpenNode { position: current, .. }) = self.open.pop() {
            self.stats.iterations += 1;

            let reached = match mode {
                PathMode::Exact => current == *to,
                PathMode::Adjacent => current != *to && goal.neighbours().contains(&current),
            };
            if reached {
                return self.path_to(current);
            }

            let cost = {
                let node = self.enable(&current, to);
                node.closed = true;
                node.cost
            };

            let Some(tile) = lattice.tile(&current) else {
                continue;
            };

            for neighbour in tile.neighbours() {
                if *neighbour == current || (mode == PathMode::Adjacent && neighbour == to) {
                    continue;
                }

                let node = self.enable(neighbour, to);
                if node.closed {
                    continue;
                }

                if !from.is_visible(neighbour, window_x, window_y)
                    || !to.is_visible(neighbour, window_x, window_y)
                {
                    node.closed = true;
                    continue;
                }

                let next = match lattice.tile(neighbour) {
                    Some(next) if !creature.is_tile_occupied(next) => next,
                    _ => {
                        node.closed = true;
                        continue;
                    }
                };

                let cost = cost + next.weight(&current);
                if node.visited && cost >= node.cost {
                    continue;
                }

                let queued = node.visited;
                node.visited = true;
                node.parent = Some(current);
                node.cost = cost;

                let open = OpenNode {
                    position: *neighbour,
                    score: u64::from(cost) + u64::from(node.heuristic),
                };

                if queued {
                    self.open.rescore(open);
                } else {
                    self.open.push(open);
                }
            }
        }

        Vec::new()
    }

    /// Side-table entry for a tile, created on first touch
    fn enable(&mut self, position: &Position, to: &Position) -> &mut PathNode {
        let heuristic = self.friction * position.manhattan_distance(to);

        self.nodes.entry(*position).or_insert(PathNode {
            parent: None,
            closed: false,
            visited: false,
            cost: 0,
            heuristic,
        })
    }

    /// Walk parents back from `end`, excluding the start
    fn path_to(&self, end: Position) -> Vec<Position> {
        let mut path = Vec::new();
        let mut cursor = end;

        while let Some(parent) = self.nodes.get(&cursor).and_then(|n| n.parent) {
            path.push(cursor);
            cursor = parent;
        }

        path
    }
}

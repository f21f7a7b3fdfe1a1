//! World positions and directions
//!
//! Positions are unsigned tile coordinates. Every step helper returns `None`
//! when the result would leave the 16-bit coordinate space, so callers never
//! have to reason about wrap-around.

use std::fmt;

use crate::error::ProtocolError;

/// Facing / stepping direction as sent on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Direction {
    #[default]
    North = 0,
    East = 1,
    South = 2,
    West = 3,
    NorthWest = 4,
    NorthEast = 5,
    SouthEast = 6,
    SouthWest = 7,
}

impl Direction {
    /// All eight directions in wire order
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
        Direction::NorthWest,
        Direction::NorthEast,
        Direction::SouthEast,
        Direction::SouthWest,
    ];

    /// Get the wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Unit vector `(dx, dy)` for this direction
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::East => (1, 0),
            Direction::South => (0, 1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
            Direction::NorthEast => (1, -1),
            Direction::SouthEast => (1, 1),
            Direction::SouthWest => (-1, 1),
        }
    }

    /// Check if this is a diagonal direction
    pub fn is_diagonal(self) -> bool {
        let (dx, dy) = self.delta();
        dx != 0 && dy != 0
    }
}

impl TryFrom<u8> for Direction {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Direction::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::InvalidDirection(value))
    }
}

/// A tile coordinate in the world
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    /// X coordinate (west to east)
    pub x: u16,
    /// Y coordinate (north to south)
    pub y: u16,
    /// Floor
    pub z: u16,
}

impl Position {
    /// Create a new position
    pub const fn new(x: u16, y: u16, z: u16) -> Self {
        Self { x, y, z }
    }

    /// Translate by a signed vector, `None` if any axis leaves the u16 range
    pub fn offset(&self, dx: i32, dy: i32, dz: i32) -> Option<Position> {
        let x = u16::try_from(i32::from(self.x) + dx).ok()?;
        let y = u16::try_from(i32::from(self.y) + dy).ok()?;
        let z = u16::try_from(i32::from(self.z) + dz).ok()?;
        Some(Position::new(x, y, z))
    }

    pub fn north(&self) -> Option<Position> {
        self.offset(0, -1, 0)
    }

    pub fn east(&self) -> Option<Position> {
        self.offset(1, 0, 0)
    }

    pub fn south(&self) -> Option<Position> {
        self.offset(0, 1, 0)
    }

    pub fn west(&self) -> Option<Position> {
        self.offset(-1, 0, 0)
    }

    pub fn northwest(&self) -> Option<Position> {
        self.offset(-1, -1, 0)
    }

    pub fn northeast(&self) -> Option<Position> {
        self.offset(1, -1, 0)
    }

    pub fn southeast(&self) -> Option<Position> {
        self.offset(1, 1, 0)
    }

    pub fn southwest(&self) -> Option<Position> {
        self.offset(-1, 1, 0)
    }

    pub fn up(&self) -> Option<Position> {
        self.offset(0, 0, 1)
    }

    pub fn down(&self) -> Option<Position> {
        self.offset(0, 0, -1)
    }

    /// Position one step in `direction`
    pub fn step(&self, direction: Direction) -> Option<Position> {
        let (dx, dy) = direction.delta();
        self.offset(dx, dy, 0)
    }

    /// Self followed by the eight surrounding positions
    ///
    /// The order is fixed (self, W, N, E, S, NW, SW, NE, SE) since tile and
    /// chunk neighbour lists are built from it.
    pub fn surrounding(&self) -> [Option<Position>; 9] {
        [
            Some(*self),
            self.west(),
            self.north(),
            self.east(),
            self.south(),
            self.northwest(),
            self.southwest(),
            self.northeast(),
            self.southeast(),
        ]
    }

    /// Check if both positions share a floor
    #[inline]
    pub fn is_same_floor(&self, other: &Position) -> bool {
        self.z == other.z
    }

    /// Manhattan distance on the horizontal plane
    pub fn manhattan_distance(&self, other: &Position) -> u32 {
        u32::from(self.x.abs_diff(other.x)) + u32::from(self.y.abs_diff(other.y))
    }

    /// Chebyshev distance on the horizontal plane
    pub fn chebyshev_distance(&self, other: &Position) -> u16 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// True when `other` is this position or one of its eight neighbours on
    /// the same floor
    pub fn besides(&self, other: &Position) -> bool {
        self.is_same_floor(other) && self.chebyshev_distance(other) <= 1
    }

    /// True when `other` is exactly one diagonal step away
    pub fn is_diagonal(&self, other: &Position) -> bool {
        self.x.abs_diff(other.x) == 1 && self.y.abs_diff(other.y) == 1
    }

    /// True when `other` lies strictly inside an `x` by `y` half-window
    pub fn is_visible(&self, other: &Position, x: u16, y: u16) -> bool {
        self.x.abs_diff(other.x) < x && self.y.abs_diff(other.y) < y
    }

    /// Direction to face when looking at `other`
    ///
    /// Mostly-horizontal offsets face east or west, everything else faces
    /// north or south.
    pub fn facing(&self, other: &Position) -> Direction {
        let dx = i32::from(other.x) - i32::from(self.x);
        let dy = i32::from(other.y) - i32::from(self.y);

        if dx.abs() > dy.abs() {
            if dx > 0 {
                Direction::East
            } else {
                Direction::West
            }
        } else if dy < 0 {
            Direction::North
        } else {
            Direction::South
        }
    }

    /// Direction of a single step from here to an adjacent `other`
    pub fn step_direction(&self, other: &Position) -> Option<Direction> {
        let dx = (i32::from(other.x) - i32::from(self.x)).signum();
        let dy = (i32::from(other.y) - i32::from(self.y)).signum();
        Direction::ALL.into_iter().find(|d| d.delta() == (dx, dy))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surrounding_order() {
        let p = Position::new(10, 10, 7);
        let around: Vec<Position> = p.surrounding().into_iter().flatten().collect();

        assert_eq!(
            around,
            vec![
                Position::new(10, 10, 7),
                Position::new(9, 10, 7),
                Position::new(10, 9, 7),
                Position::new(11, 10, 7),
                Position::new(10, 11, 7),
                Position::new(9, 9, 7),
                Position::new(9, 11, 7),
                Position::new(11, 9, 7),
                Position::new(11, 11, 7),
            ]
        );
    }

    #[test]
    fn test_edges_return_none() {
        let origin = Position::new(0, 0, 0);
        assert_eq!(origin.west(), None);
        assert_eq!(origin.north(), None);
        assert_eq!(origin.down(), None);
        assert_eq!(origin.surrounding().iter().flatten().count(), 4);

        let corner = Position::new(u16::MAX, u16::MAX, 0);
        assert_eq!(corner.east(), None);
        assert_eq!(corner.southeast(), None);
    }

    #[test]
    fn test_besides_and_distance() {
        let a = Position::new(5, 5, 7);

        assert!(a.besides(&a));
        assert!(a.besides(&Position::new(6, 6, 7)));
        assert!(!a.besides(&Position::new(7, 5, 7)));
        assert!(!a.besides(&Position::new(5, 5, 6)));

        assert_eq!(a.manhattan_distance(&Position::new(8, 1, 7)), 7);
        assert!(a.is_diagonal(&Position::new(4, 6, 7)));
        assert!(!a.is_diagonal(&Position::new(4, 5, 7)));
    }

    #[test]
    fn test_visibility_window() {
        let a = Position::new(100, 100, 7);

        assert!(a.is_visible(&Position::new(110, 107, 7), 11, 8));
        assert!(!a.is_visible(&Position::new(111, 100, 7), 11, 8));
        assert!(!a.is_visible(&Position::new(100, 92, 7), 11, 8));
    }

    #[test]
    fn test_direction_conversion() {
        for direction in Direction::ALL {
            assert_eq!(Direction::try_from(direction.as_u8()), Ok(direction));
        }
        assert_eq!(
            Direction::try_from(8),
            Err(ProtocolError::InvalidDirection(8))
        );
        assert!(Direction::SouthWest.is_diagonal());
        assert!(!Direction::East.is_diagonal());
    }

    #[test]
    fn test_step_and_facing() {
        let a = Position::new(10, 10, 7);

        assert_eq!(a.step(Direction::NorthEast), Some(Position::new(11, 9, 7)));
        assert_eq!(a.step_direction(&Position::new(9, 11, 7)), Some(Direction::SouthWest));
        assert_eq!(a.step_direction(&a), None);
        assert_eq!(a.facing(&Position::new(15, 11, 7)), Direction::East);
        assert_eq!(a.facing(&Position::new(10, 4, 7)), Direction::North);
    }
}

//! # Position grid
//!
//! Turns an axis configuration `(min, max, divisions)` into the ordered list of
//! stop positions the axis visits during a scan.
//!
//! The step between stops is truncated to a whole number of motor steps and is
//! never re-normalised, so the last stop can fall short of `max` by up to
//! `divisions - 2` steps:
//!
//! ```rust
//! use scant_rs::motion::compute_positions;
//! assert_eq!(compute_positions(0, 100, 5).as_slice(), &[0, 25, 50, 75, 100]);
//! assert_eq!(compute_positions(0, 10, 4).as_slice(), &[0, 3, 6, 9]);
//! ```

use serde::Serialize;

/// Immutable, ordered stop positions for one axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PositionSequence {
    positions: Vec<i32>,
}

impl PositionSequence {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, division: usize) -> Option<i32> {
        self.positions.get(division).copied()
    }

    pub fn first(&self) -> Option<i32> {
        self.positions.first().copied()
    }

    pub fn last(&self) -> Option<i32> {
        self.positions.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.positions.iter().copied()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.positions
    }
}

impl From<PositionSequence> for Vec<i32> {
    fn from(sequence: PositionSequence) -> Self {
        sequence.positions
    }
}

/// Computes the stop positions between `min` and `max`.
///
/// Returns an empty sequence when `max <= min`; callers treat that as "cannot
/// scan". Fewer than two divisions always yields the two-point scan
/// `[min, max]`.
pub fn compute_positions(min: i32, max: i32, divisions: u32) -> PositionSequence {
    if max <= min {
        return PositionSequence::default();
    }
    if divisions < 2 {
        return PositionSequence { positions: vec![min, max] };
    }

    let span = i64::from(max) - i64::from(min);
    let step = span / (i64::from(divisions) - 1);
    let positions = (0..i64::from(divisions))
        .map(|i| (i64::from(min) + i * step) as i32)
        .collect();
    PositionSequence { positions }
}

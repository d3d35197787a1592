//! Uniform random stream over a half-open interval with movable bounds.
//!
//! [`StreamShuffler`] emits every integer in `[lower, upper)` exactly once
//! per pass, in uniform pseudorandom order. The upper bound may grow and the
//! lower bound may advance while a pass is in progress: values already
//! yielded stay consumed, values newly in range join the current pass, and
//! values that slid below the lower bound are silently skipped when drawn.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Lazy Fisher–Yates over a sparse swap map.
///
/// Positions span `[pass_lower, remaining_upper)` in the coordinate system
/// fixed at the last [`reset`](Self::reset); `swaps` materialises only the
/// slots disturbed by previous draws, so memory stays proportional to the
/// number of draws in the current pass, not to the interval width.
pub struct StreamShuffler {
    /// Current value-space lower bound; values below it are filtered out.
    lower: u64,
    /// Current value-space upper bound.
    upper: u64,
    /// Position-space origin, fixed for the lifetime of a pass.
    pass_lower: u64,
    /// Exclusive end of the not-yet-consumed position region.
    remaining_upper: u64,
    swaps: HashMap<u64, u64>,
    rng: SmallRng,
}

impl StreamShuffler {
    /// Creates an empty shuffler; call [`reset`](Self::reset) to give it an
    /// interval.
    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_entropy())
    }

    /// Creates a shuffler with an explicit RNG (deterministic in tests).
    pub fn with_rng(rng: SmallRng) -> Self {
        Self {
            lower: 0,
            upper: 0,
            pass_lower: 0,
            remaining_upper: 0,
            swaps: HashMap::new(),
            rng,
        }
    }

    /// Discards all iteration state and starts a fresh pass over
    /// `[lower, upper)`.
    pub fn reset(&mut self, lower: u64, upper: u64) {
        debug_assert!(lower <= upper);
        self.lower = lower;
        self.upper = upper;
        self.pass_lower = lower;
        self.remaining_upper = upper;
        self.swaps.clear();
    }

    /// Advances the lower bound without discarding iteration state. Values
    /// below the new bound are skipped when next drawn.
    pub fn set_lower_bound(&mut self, lower: u64) {
        self.lower = lower;
    }

    /// Grows the upper bound without discarding iteration state. The new
    /// values become eligible for the current pass.
    pub fn set_upper_bound(&mut self, upper: u64) {
        // Fresh values are appended to the unconsumed position region; a
        // draw is uniform over that whole region, so placement at the end
        // does not bias selection.
        for value in self.upper..upper {
            if self.remaining_upper != value {
                self.swaps.insert(self.remaining_upper, value);
            }
            self.remaining_upper += 1;
        }
        self.upper = upper;
    }

    /// Returns the next index of the pass, or `None` once the pass is
    /// exhausted.
    pub fn next(&mut self) -> Option<u64> {
        while self.remaining_upper > self.pass_lower {
            let position = self.rng.gen_range(self.pass_lower..self.remaining_upper);
            let value = self.resolve(position);
            let last_position = self.remaining_upper - 1;
            let last_value = self.resolve(last_position);
            if position != last_position {
                if last_value == position {
                    self.swaps.remove(&position);
                } else {
                    self.swaps.insert(position, last_value);
                }
            }
            self.swaps.remove(&last_position);
            self.remaining_upper = last_position;

            if value >= self.lower && value < self.upper {
                return Some(value);
            }
            // Value slid out of range since it was scheduled; consume it
            // silently and keep drawing.
        }
        None
    }

    /// Current lower bound.
    pub fn lower_bound(&self) -> u64 {
        self.lower
    }

    /// Current upper bound.
    pub fn upper_bound(&self) -> u64 {
        self.upper
    }

    fn resolve(&self, position: u64) -> u64 {
        self.swaps.get(&position).copied().unwrap_or(position)
    }
}

impl Default for StreamShuffler {
    fn default() -> Self {
        Self::new()
    }
}

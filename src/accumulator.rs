//! The accumulator abstraction: how partial derivatives collect at an
//! output port as backpropagation visits every downstream consumer.
//!
//! An output port's Jacobian is built incrementally, one contribution per
//! consumer, by one of two strategies:
//!
//! - [`Accumulator::Unbounded`] sums contributions into a single dense
//!   Jacobian matrix. Memory is `O(outputs * inputs)` regardless of chain
//!   depth, and no contribution is ever discarded.
//! - [`Accumulator::Truncated`] keeps a list of `(Jacobian, remaining_depth)`
//!   pairs. Each pass through [`Accumulator::tick_descent`] decrements every
//!   remaining depth and drops any pair that has reached zero, bounding
//!   truncated backpropagation-through-time to a fixed window.
//!
//! A single backward pass seeds one kind at the sink and never mixes kinds;
//! every accumulator produced downstream by `mul_left`/`mul_right`/`merge`
//! inherits the kind of its operands.

use crate::matrix::Mat;
use thiserror::Error;

/// Errors raised while combining or scaling accumulators.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AccumulatorError {
    /// Two operands that should have matched shapes did not.
    #[error("accumulator shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Shape (rows, cols) required by the operation.
        expected: (usize, usize),
        /// Shape (rows, cols) actually supplied.
        got: (usize, usize),
    },
    /// A truncated accumulator was constructed with exactly one of
    /// `(seed, depth)` present; both or neither are required.
    #[error("truncated accumulator requires both a seed Jacobian and a depth, or neither")]
    UnderspecifiedInit,
}

/// The result of retrieving an accumulated Jacobian: either a concrete
/// matrix, or the neutral zero of the additive group (no contribution has
/// arrived, or every contribution has expired).
#[derive(Debug, Clone, PartialEq)]
pub enum Jacobian {
    /// No contribution is present.
    Zero,
    /// A concrete accumulated Jacobian.
    Value(Mat),
}

impl Jacobian {
    /// Materializes the zero case as an actual `rows x cols` zero matrix.
    pub fn into_mat(self, rows: usize, cols: usize) -> Mat {
        match self {
            Jacobian::Zero => Mat::zeros(rows, cols),
            Jacobian::Value(m) => m,
        }
    }

    /// True if this is the zero sentinel.
    pub fn is_zero(&self) -> bool {
        matches!(self, Jacobian::Zero)
    }
}

#[derive(Debug, Clone, Default)]
struct UnboundedAcc {
    mat: Option<Mat>,
}

impl UnboundedAcc {
    fn empty() -> Self {
        Self { mat: None }
    }

    fn seed(m: Mat) -> Self {
        Self { mat: Some(m) }
    }

    fn add(self, other: Self) -> Result<Self, AccumulatorError> {
        match (self.mat, other.mat) {
            (None, b) => Ok(Self { mat: b }),
            (a, None) => Ok(Self { mat: a }),
            (Some(a), Some(b)) => {
                if a.shape() != b.shape() {
                    return Err(AccumulatorError::ShapeMismatch {
                        expected: a.shape(),
                        got: b.shape(),
                    });
                }
                Ok(Self { mat: Some(a + b) })
            }
        }
    }

    fn mul_left(&self, a: &Mat) -> Result<Self, AccumulatorError> {
        match &self.mat {
            None => Ok(Self::empty()),
            Some(m) => {
                if a.ncols() != m.nrows() {
                    return Err(AccumulatorError::ShapeMismatch {
                        expected: (a.ncols(), m.ncols()),
                        got: m.shape(),
                    });
                }
                Ok(Self { mat: Some(a * m) })
            }
        }
    }

    fn mul_right(&self, a: &Mat) -> Result<Self, AccumulatorError> {
        match &self.mat {
            None => Ok(Self::empty()),
            Some(m) => {
                if m.ncols() != a.nrows() {
                    return Err(AccumulatorError::ShapeMismatch {
                        expected: (m.nrows(), a.nrows()),
                        got: a.shape(),
                    });
                }
                Ok(Self { mat: Some(m * a) })
            }
        }
    }

    fn retrieve(&self) -> Jacobian {
        match &self.mat {
            None => Jacobian::Zero,
            Some(m) => Jacobian::Value(m.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TruncatedAcc {
    entries: Vec<(Mat, u32)>,
}

impl TruncatedAcc {
    fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    fn try_new(seed: Option<Mat>, depth: Option<u32>) -> Result<Self, AccumulatorError> {
        match (seed, depth) {
            (None, None) => Ok(Self::empty()),
            (Some(m), Some(d)) => Ok(Self {
                entries: if d == 0 { Vec::new() } else { vec![(m, d)] },
            }),
            _ => Err(AccumulatorError::UnderspecifiedInit),
        }
    }

    fn add(self, other: Self) -> Self {
        let mut entries = self.entries;
        entries.extend(other.entries);
        Self { entries }
    }

    fn mul_left(&self, a: &Mat) -> Result<Self, AccumulatorError> {
        let mut out = Vec::with_capacity(self.entries.len());
        for (m, d) in &self.entries {
            if a.ncols() != m.nrows() {
                return Err(AccumulatorError::ShapeMismatch {
                    expected: (a.ncols(), m.ncols()),
                    got: m.shape(),
                });
            }
            out.push((a * m, *d));
        }
        Ok(Self { entries: out })
    }

    fn mul_right(&self, a: &Mat) -> Result<Self, AccumulatorError> {
        let mut out = Vec::with_capacity(self.entries.len());
        for (m, d) in &self.entries {
            if m.ncols() != a.nrows() {
                return Err(AccumulatorError::ShapeMismatch {
                    expected: (m.nrows(), a.nrows()),
                    got: a.shape(),
                });
            }
            out.push((m * a, *d));
        }
        Ok(Self { entries: out })
    }

    /// Decrements every entry's remaining depth by one and drops entries
    /// that have run out of depth. Called once per hop as a contribution
    /// travels upstream.
    fn tick_descent(&mut self) {
        for (_, d) in self.entries.iter_mut() {
            *d = d.saturating_sub(1);
        }
        self.entries.retain(|(_, d)| *d > 0);
    }

    fn retrieve(&self) -> Jacobian {
        let mut iter = self.entries.iter();
        let Some((first, _)) = iter.next() else {
            return Jacobian::Zero;
        };
        let mut acc = first.clone();
        for (m, _) in iter {
            acc += m;
        }
        Jacobian::Value(acc)
    }
}

/// A partial Jacobian accumulated at an output port during backpropagation.
#[derive(Debug, Clone)]
pub enum Accumulator {
    /// Single dense-matrix accumulation, no depth limit.
    Unbounded(UnboundedAcc),
    /// Depth-limited accumulation: a list of `(Jacobian, remaining depth)`.
    Truncated(TruncatedAcc),
}

impl Accumulator {
    /// An unbounded accumulator seeded with an initial Jacobian (typically
    /// the identity, at the sink that starts a backward pass).
    pub fn unbounded_seed(m: Mat) -> Self {
        Accumulator::Unbounded(UnboundedAcc::seed(m))
    }

    /// A truncated accumulator seeded with an initial Jacobian and a
    /// maximum remaining depth.
    pub fn truncated_seed(m: Mat, depth: u32) -> Result<Self, AccumulatorError> {
        Ok(Accumulator::Truncated(TruncatedAcc::try_new(
            Some(m),
            Some(depth),
        )?))
    }

    /// An accumulator of the same kind as `self`, holding no contribution.
    pub fn empty_like(&self) -> Self {
        match self {
            Accumulator::Unbounded(_) => Accumulator::Unbounded(UnboundedAcc::empty()),
            Accumulator::Truncated(_) => Accumulator::Truncated(TruncatedAcc::empty()),
        }
    }

    /// Combines two accumulators of the same kind. Mixing kinds within one
    /// backward pass is a programming error, not a recoverable condition:
    /// every accumulator in a pass is seeded once at the sink and the kind
    /// never changes as it flows through `mul_left`/`mul_right`/`merge`.
    pub fn merge(self, other: Self) -> Result<Self, AccumulatorError> {
        match (self, other) {
            (Accumulator::Unbounded(a), Accumulator::Unbounded(b)) => {
                Ok(Accumulator::Unbounded(a.add(b)?))
            }
            (Accumulator::Truncated(a), Accumulator::Truncated(b)) => {
                Ok(Accumulator::Truncated(a.add(b)))
            }
            _ => panic!("accumulator kind mismatch within a single backward pass"),
        }
    }

    /// Left-multiplies every contribution by `a` (used when chaining a
    /// Jacobian `a = dOut/dThisOut` across a port boundary).
    pub fn mul_left(&self, a: &Mat) -> Result<Self, AccumulatorError> {
        match self {
            Accumulator::Unbounded(u) => Ok(Accumulator::Unbounded(u.mul_left(a)?)),
            Accumulator::Truncated(t) => Ok(Accumulator::Truncated(t.mul_left(a)?)),
        }
    }

    /// Right-multiplies every contribution by `a`.
    pub fn mul_right(&self, a: &Mat) -> Result<Self, AccumulatorError> {
        match self {
            Accumulator::Unbounded(u) => Ok(Accumulator::Unbounded(u.mul_right(a)?)),
            Accumulator::Truncated(t) => Ok(Accumulator::Truncated(t.mul_right(a)?)),
        }
    }

    /// Advances truncated accumulators by one hop of remaining depth; a
    /// no-op for unbounded accumulators.
    pub fn tick_descent(&mut self) {
        if let Accumulator::Truncated(t) = self {
            t.tick_descent();
        }
    }

    /// Reads out the accumulated Jacobian, or the zero sentinel if nothing
    /// has arrived (or every truncated contribution has expired).
    pub fn retrieve(&self) -> Jacobian {
        match self {
            Accumulator::Unbounded(u) => u.retrieve(),
            Accumulator::Truncated(t) => t.retrieve(),
        }
    }
}

/// How a backward pass seeds the identity Jacobian at the sink where it
/// starts: with no truncation (the accumulator keeps every contribution
/// for the life of the pass) or bounded to a maximum number of upstream
/// hops. Threading this as an explicit enum — rather than a sentinel
/// negative `max_depth` — keeps "no truncation" from being representable
/// only by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationPolicy {
    /// Every contribution is kept for the whole backward pass.
    Unbounded,
    /// Contributions are dropped once they have traveled `max_depth` hops
    /// upstream of the sink.
    Truncated {
        /// Maximum number of hops a contribution survives.
        max_depth: u32,
    },
}

impl TruncationPolicy {
    /// Builds the seed accumulator for a backward pass starting with
    /// Jacobian `identity` (typically the identity matrix matching the
    /// sink's input shape).
    pub fn seed(&self, identity: Mat) -> Accumulator {
        match self {
            TruncationPolicy::Unbounded => Accumulator::unbounded_seed(identity),
            TruncationPolicy::Truncated { max_depth } => {
                Accumulator::truncated_seed(identity, *max_depth)
                    .expect("seed and depth are always both present")
            }
        }
    }
}

/// Sums a list of optional accumulators, skipping absent ones. Used by
/// modules with several output ports (e.g. the Kalman update) whose input
/// gradient is the sum of contributions arriving via each output.
pub fn sum_accumulators(accs: impl IntoIterator<Item = Option<Accumulator>>) -> Option<Accumulator> {
    let mut out: Option<Accumulator> = None;
    for acc in accs.into_iter().flatten() {
        out = Some(match out {
            None => acc,
            Some(existing) => existing
                .merge(acc)
                .expect("sum_accumulators: mismatched accumulator kinds"),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::scalar;

    #[test]
    fn unbounded_accumulates_by_sum() {
        let a = Accumulator::unbounded_seed(scalar(2.0));
        let b = Accumulator::unbounded_seed(scalar(3.0));
        let sum = a.merge(b).unwrap();
        assert_eq!(sum.retrieve(), Jacobian::Value(scalar(5.0)));
    }

    #[test]
    fn truncated_drops_expired_entries() {
        let mut acc = Accumulator::truncated_seed(scalar(1.0), 1).unwrap();
        acc.tick_descent();
        assert_eq!(acc.retrieve(), Jacobian::Zero);
    }

    #[test]
    fn truncated_keeps_entries_within_depth() {
        let mut acc = Accumulator::truncated_seed(scalar(1.0), 2).unwrap();
        acc.tick_descent();
        assert_eq!(acc.retrieve(), Jacobian::Value(scalar(1.0)));
    }

    #[test]
    fn empty_accumulator_retrieves_zero() {
        let acc = Accumulator::Unbounded(UnboundedAcc::empty());
        assert_eq!(acc.retrieve(), Jacobian::Zero);
    }

    #[test]
    fn underspecified_truncated_init_is_rejected() {
        let err = TruncatedAcc::try_new(Some(scalar(1.0)), None).unwrap_err();
        assert_eq!(err, AccumulatorError::UnderspecifiedInit);
    }

    #[test]
    fn sum_accumulators_skips_none() {
        let a = Accumulator::unbounded_seed(scalar(1.0));
        let summed = sum_accumulators(vec![None, Some(a), None]).unwrap();
        assert_eq!(summed.retrieve(), Jacobian::Value(scalar(1.0)));
    }
}

//! Dense real matrix primitives shared by the accumulator algebra and the
//! standard module library.
//!
//! Every value flowing through the graph — scalar, vector, or matrix — is
//! represented uniformly as a [`Mat`], an `N x M` dense `f64` matrix (a
//! scalar is `1x1`, a column vector is `Nx1`), letting every standard
//! module share one value type instead of juggling scalar/vector/matrix
//! special cases.
//!
//! `vec(_)` flattening throughout this crate is **column-major**, which is
//! also `nalgebra::DMatrix`'s native storage order: `flatten`/`unflatten`
//! below are therefore just reinterpretations of the same backing buffer.

use nalgebra::DMatrix;
use thiserror::Error;

/// A dense real matrix. Scalars and vectors are represented as `1x1` and
/// `Nx1` matrices respectively.
pub type Mat = DMatrix<f64>;

/// Errors raised by matrix primitives.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MatrixError {
    /// A binary operation received operands whose shapes are incompatible.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Shape (rows, cols) required by the operation.
        expected: (usize, usize),
        /// Shape (rows, cols) actually supplied.
        got: (usize, usize),
    },
    /// A Cholesky factorization was requested of a matrix that is not
    /// symmetric positive-definite.
    #[error("matrix is not symmetric positive-definite")]
    NonSpd,
    /// An operation that requires a square matrix received a non-square one.
    #[error("expected a square matrix, got {0:?}")]
    NotSquare((usize, usize)),
}

/// Wraps a value in a `1x1` matrix.
pub fn scalar(x: f64) -> Mat {
    Mat::from_element(1, 1, x)
}

/// Builds an `Nx1` column vector from a slice.
pub fn vector(xs: &[f64]) -> Mat {
    Mat::from_column_slice(xs.len(), 1, xs)
}

/// Column-major flattening: `vec(M)` stacks the columns of `M` into a single
/// column vector. Since `nalgebra::DMatrix` already stores its data
/// column-major, this is a reshape, not a data-reordering copy.
pub fn flatten(m: &Mat) -> Mat {
    Mat::from_column_slice(m.nrows() * m.ncols(), 1, m.as_slice())
}

/// Inverse of [`flatten`]: reinterprets an `(rows*cols)x1` column vector as
/// an `rows x cols` matrix, column-major.
pub fn unflatten(v: &Mat, rows: usize, cols: usize) -> Result<Mat, MatrixError> {
    if v.ncols() != 1 || v.nrows() != rows * cols {
        return Err(MatrixError::ShapeMismatch {
            expected: (rows * cols, 1),
            got: (v.nrows(), v.ncols()),
        });
    }
    Ok(Mat::from_column_slice(rows, cols, v.as_slice()))
}

/// Kronecker product `A ⊗ B`.
pub fn kron(a: &Mat, b: &Mat) -> Mat {
    a.kronecker(b)
}

/// The `mn x mn` commutation matrix `T_{m,n}` such that
/// `T_{m,n} * vec(A) = vec(A^T)` for any `m x n` matrix `A`.
///
/// Built by direct construction from the defining permutation: `A[i,j]`
/// sits at row `i + j*m` of `vec(A)` and at row `j + i*n` of `vec(A^T)`,
/// so `T_{m,n}` has a single 1 in each row at
/// `(j + i*n, i + j*m)`.
pub fn commutation(m: usize, n: usize) -> Mat {
    let mut t = Mat::zeros(m * n, m * n);
    for i in 0..m {
        for j in 0..n {
            t[(j + i * n, i + j * m)] = 1.0;
        }
    }
    t
}

/// A Cholesky factorization `A = L * L^T` with solve/log-det helpers used
/// throughout the Kalman and cost modules.
pub struct CholeskyFactor {
    l: Mat,
}

impl CholeskyFactor {
    /// Factorizes a symmetric positive-definite matrix.
    pub fn of(a: &Mat) -> Result<Self, MatrixError> {
        if a.nrows() != a.ncols() {
            return Err(MatrixError::NotSquare((a.nrows(), a.ncols())));
        }
        let chol = nalgebra::linalg::Cholesky::new(a.clone()).ok_or(MatrixError::NonSpd)?;
        Ok(Self { l: chol.l() })
    }

    /// The lower-triangular factor `L`.
    pub fn l(&self) -> &Mat {
        &self.l
    }

    /// Solves `A * X = B` for `X`, i.e. a left solve against the factored
    /// matrix.
    pub fn solve(&self, b: &Mat) -> Result<Mat, MatrixError> {
        if b.nrows() != self.l.nrows() {
            return Err(MatrixError::ShapeMismatch {
                expected: (self.l.nrows(), b.ncols()),
                got: (b.nrows(), b.ncols()),
            });
        }
        let chol = nalgebra::linalg::Cholesky::new_unchecked(self.l.clone());
        Ok(chol.solve(b))
    }

    /// Solves `X * A = B` for `X`, a right solve against the factored
    /// matrix, via the transpose trick `X = (A^T \ B^T)^T` applied to the
    /// (symmetric) factored matrix.
    pub fn solve_right(&self, b: &Mat) -> Result<Mat, MatrixError> {
        if b.ncols() != self.l.nrows() {
            return Err(MatrixError::ShapeMismatch {
                expected: (b.nrows(), self.l.nrows()),
                got: (b.nrows(), b.ncols()),
            });
        }
        let bt = b.transpose();
        let xt = self.solve(&bt)?;
        Ok(xt.transpose())
    }

    /// `log(det(A))`, computed stably from the Cholesky factor as
    /// `2 * sum(log(diag(L)))`.
    pub fn logdet(&self) -> f64 {
        2.0 * self.l.diagonal().iter().map(|d| d.ln()).sum::<f64>()
    }

    /// The inverse of the factored matrix, `A^{-1} = L^{-T} L^{-1}`.
    pub fn inverse(&self) -> Mat {
        let chol = nalgebra::linalg::Cholesky::new_unchecked(self.l.clone());
        chol.inverse()
    }
}

/// Embeds a column vector as the diagonal of a square matrix.
pub fn diag_embed(v: &Mat) -> Mat {
    Mat::from_diagonal(&v.column(0).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn flatten_unflatten_roundtrip() {
        let m = Mat::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let v = flatten(&m);
        assert_eq!(v.nrows(), 6);
        let back = unflatten(&v, 2, 3).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn commutation_matches_transpose() {
        let m = Mat::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = commutation(2, 3);
        let lhs = t * flatten(&m);
        let rhs = flatten(&m.transpose());
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn cholesky_solve_matches_inverse() {
        let a = Mat::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let c = CholeskyFactor::of(&a).unwrap();
        let b = Mat::identity(2, 2);
        let solved = c.solve(&b).unwrap();
        let inv = c.inverse();
        assert_abs_diff_eq!(solved, inv, epsilon = 1e-9);
    }

    #[test]
    fn solve_right_matches_left_solve_via_transpose() {
        let a = Mat::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let c = CholeskyFactor::of(&a).unwrap();
        let b = Mat::from_row_slice(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let x = c.solve_right(&b).unwrap();
        let check = &x * &a;
        assert_abs_diff_eq!(check, b, epsilon = 1e-9);
    }

    #[test]
    fn non_spd_is_rejected() {
        let a = Mat::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(CholeskyFactor::of(&a), Err(MatrixError::NonSpd)));
    }
}

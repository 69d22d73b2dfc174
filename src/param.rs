//! Constant positive-semidefinite covariance parameterization: composes
//! [`ExponentialModule`](crate::modules::math::ExponentialModule) and
//! [`CholeskyReshapeModule`](crate::modules::reshape::CholeskyReshapeModule)
//! over two raw constant leaves so gradient descent on an unconstrained
//! parameter vector always yields a valid SPD covariance.
//!
//! A diagonal-log leaf run through `Exponential` keeps the Cholesky
//! diagonal positive, and a strict-lower leaf feeds straight into the
//! reshape; the two are packed as one `theta` vector, `(log_d, l)`
//! concatenated.

use thiserror::Error;

use crate::chain::{ChainError, ChainSource, ParamSource};
use crate::graph::{Graph, GraphError, ModuleId, OutputRef};
use crate::matrix::{vector, CholeskyFactor, Mat, MatrixError};
use crate::modules::basic::{add_constant, ConstantHandle};
use crate::modules::math::{add_exponential, ExponentialHandle};
use crate::modules::reshape::{add_cholesky_reshape, CholeskyReshapeHandle, CholeskyReshapeModule};
use crate::scheduler::{run_foreprop, run_invalidate};

/// Errors raised building a [`ConstantPsd`] source.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParamError {
    /// The initial covariance failed to Cholesky-factorize.
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    /// Graph wiring failed assembling the parameterization.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A constant SPD covariance parameterized by an unconstrained vector
/// `theta = (log_d, l)`: `d = exp(log_d)` supplies the Cholesky diagonal,
/// `l` the strict lower triangle, and the output is `L * L^T`.
pub struct ConstantPsd {
    d_source: ConstantHandle,
    d_exp: ExponentialHandle,
    l_source: ConstantHandle,
    psd: CholeskyReshapeHandle,
    n: usize,
}

impl ConstantPsd {
    /// Factorizes `init` (must be SPD) and builds the parameterization so
    /// that its initial forward value reproduces `init`.
    pub fn new(graph: &mut Graph, init: &Mat) -> Result<Self, ParamError> {
        let n = init.nrows();
        let chol = CholeskyFactor::of(init)?;
        let l = chol.l();

        let log_d: Vec<f64> = (0..n).map(|j| l[(j, j)].ln()).collect();
        let mut l_vals = Vec::with_capacity(CholeskyReshapeModule::strict_lower_len(n));
        for j in 0..n {
            for i in (j + 1)..n {
                l_vals.push(l[(i, j)]);
            }
        }

        let d_source = add_constant(graph, vector(&log_d));
        let d_exp = add_exponential(graph);
        graph.link(d_exp.input(), d_source.out())?;

        let l_source = add_constant(graph, vector(&l_vals));
        let psd = add_cholesky_reshape(graph, n);
        graph.link(psd.d(), d_exp.out())?;
        graph.link(psd.l(), l_source.out())?;

        Ok(Self { d_source, d_exp, l_source, psd, n })
    }

    /// The two independent leaf roots (`log_d` and `l`) that must both be
    /// driven for a forward pass or invalidation to reach the output.
    fn roots(&self) -> [ModuleId; 2] {
        [self.d_source.0, self.l_source.0]
    }
}

impl ChainSource for ConstantPsd {
    fn out(&self) -> OutputRef {
        self.psd.out()
    }

    fn foreprop(&self, graph: &mut Graph) -> Result<(), GraphError> {
        for root in self.roots() {
            run_foreprop(graph, root)?;
        }
        Ok(())
    }

    fn invalidate(&self, graph: &mut Graph) {
        for root in self.roots() {
            run_invalidate(graph, root);
        }
    }
}

impl ParamSource for ConstantPsd {
    fn theta(&self, graph: &mut Graph) -> Vec<f64> {
        let mut theta = self.d_source.value(graph).as_slice().to_vec();
        theta.extend_from_slice(self.l_source.value(graph).as_slice());
        theta
    }

    fn set_theta(&self, graph: &mut Graph, theta: &[f64]) -> Result<(), ChainError> {
        let n_d = self.n;
        let n_l = CholeskyReshapeModule::strict_lower_len(self.n);
        if theta.len() != n_d + n_l {
            return Err(ChainError::ParamDimensionMismatch {
                expected: n_d + n_l,
                got: theta.len(),
            });
        }
        self.d_source.set_value(graph, vector(&theta[..n_d]));
        self.l_source.set_value(graph, vector(&theta[n_d..]));
        Ok(())
    }

    fn backprop_value(&self, graph: &Graph) -> Vec<f64> {
        let n_l = CholeskyReshapeModule::strict_lower_len(self.n);
        let d_grad = graph.backprop_value(self.d_source.out()).into_mat(self.n, 1);
        let l_grad = graph.backprop_value(self.l_source.out()).into_mat(n_l, 1);
        let mut out = d_grad.as_slice().to_vec();
        out.extend_from_slice(l_grad.as_slice());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reproduces_the_initial_covariance_on_first_foreprop() {
        let mut g = Graph::new();
        let init = Mat::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let psd = ConstantPsd::new(&mut g, &init).unwrap();
        run_foreprop(&mut g, psd.d_source.0).unwrap();
        run_foreprop(&mut g, psd.l_source.0).unwrap();
        let out = g.output_value(psd.out()).unwrap();
        assert_abs_diff_eq!(*out, init, epsilon = 1e-9);
    }

    #[test]
    fn theta_round_trips_through_set_theta() {
        let mut g = Graph::new();
        let init = Mat::identity(3, 3);
        let psd = ConstantPsd::new(&mut g, &init).unwrap();
        let original = psd.theta(&mut g);
        let mut shifted = original.clone();
        for v in shifted.iter_mut() {
            *v += 0.1;
        }
        psd.set_theta(&mut g, &shifted).unwrap();
        let read_back = psd.theta(&mut g);
        assert_abs_diff_eq!(vector(&read_back), vector(&shifted), epsilon = 1e-12);
    }

    #[test]
    fn rejects_non_spd_initial_covariance() {
        let mut g = Graph::new();
        let bad = Mat::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(ConstantPsd::new(&mut g, &bad), Err(ParamError::Matrix(MatrixError::NonSpd))));
    }
}

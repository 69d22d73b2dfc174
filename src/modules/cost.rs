//! Gaussian log-likelihood: the terminal cost module most chains
//! backpropagate from.

use crate::graph::{Graph, GraphError, InputRef, ModuleCore, ModuleId, ModuleImpl, OutputRef};
use crate::matrix::{flatten, kron, scalar, CholeskyFactor, Mat};

const X: usize = 0;
const S: usize = 1;
const OUT: usize = 0;

/// The log-density of `x ~ N(0, S)`:
/// `ell = -0.5 * (xᵀ S⁻¹ x + log det(S) + n log(2π))`.
///
/// Both Cholesky-stable intermediates (the solve `S⁻¹x` and `log det(S)`)
/// are produced by [`CholeskyFactor`] rather than an explicit inverse and
/// determinant, matching the numerically stable routines the standard
/// module library is expected to use throughout.
pub struct LogLikelihoodModule {
    core: ModuleCore,
}

impl LogLikelihoodModule {
    /// Builds a log-likelihood module.
    pub fn new() -> Box<dyn ModuleImpl> {
        Box::new(Self { core: ModuleCore::new(2, 1) })
    }
}

impl ModuleImpl for LogLikelihoodModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "log_likelihood"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let x = graph.input_value(InputRef { module: id, index: X }).unwrap().clone();
        let s = graph.input_value(InputRef { module: id, index: S }).unwrap().clone();
        let chol = CholeskyFactor::of(&s)?;
        let sx = chol.solve(&x)?;
        let quad = (x.transpose() * &sx)[(0, 0)];
        let n = x.nrows() as f64;
        let ell = -0.5 * (quad + chol.logdet() + n * (2.0 * std::f64::consts::PI).ln());
        Ok(graph.emit(OutputRef { module: id, index: OUT }, scalar(ell)))
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let out_ref = OutputRef { module: id, index: OUT };
        let Some(acc) = graph.accumulator_of(out_ref).cloned() else {
            return Ok(Vec::new());
        };
        let x = graph.input_value(InputRef { module: id, index: X }).unwrap().clone();
        let s = graph.input_value(InputRef { module: id, index: S }).unwrap().clone();
        let chol = CholeskyFactor::of(&s)?;
        let sinv = chol.inverse();

        // d ell / dx = -xᵀ S⁻¹
        let dx_jac = -(x.transpose() * &sinv);

        // d ell / d vec(S) = 0.5 vec(xxᵀ)ᵀ (S⁻ᵀ ⊗ S⁻¹) - 0.5 vec(S⁻ᵀ)ᵀ
        let xxt = &x * x.transpose();
        let sinv_t = sinv.transpose();
        let quad_term = flatten(&xxt).transpose() * kron(&sinv_t, &sinv);
        let logdet_term = flatten(&sinv_t).transpose();
        let ds_jac = 0.5 * quad_term - 0.5 * logdet_term;

        let mut ready = Vec::new();
        let dx_acc = acc.mul_right(&dx_jac)?;
        ready.extend(graph.accept_backprop(InputRef { module: id, index: X }, dx_acc)?);
        let ds_acc = acc.mul_right(&ds_jac)?;
        ready.extend(graph.accept_backprop(InputRef { module: id, index: S }, ds_acc)?);
        Ok(ready)
    }
}

/// A typed handle to a [`LogLikelihoodModule`].
#[derive(Copy, Clone, Debug)]
pub struct LogLikelihoodHandle(pub ModuleId);

impl LogLikelihoodHandle {
    /// The residual input.
    pub fn x(&self) -> InputRef {
        InputRef { module: self.0, index: X }
    }
    /// The covariance input.
    pub fn s(&self) -> InputRef {
        InputRef { module: self.0, index: S }
    }
    /// The scalar log-likelihood output.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: OUT }
    }
}

/// Adds a [`LogLikelihoodModule`] to `graph`.
pub fn add_log_likelihood(graph: &mut Graph) -> LogLikelihoodHandle {
    LogLikelihoodHandle(graph.add_module(LogLikelihoodModule::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::TruncationPolicy;
    use crate::matrix::vector;
    use crate::modules::basic::{add_constant, add_sink};
    use crate::scheduler::{run_backprop, run_foreprop};
    use approx::assert_abs_diff_eq;

    #[test]
    fn standard_normal_1d_matches_closed_form() {
        let mut g = Graph::new();
        let x = add_constant(&mut g, vector(&[0.5]));
        let s = add_constant(&mut g, vector(&[1.0]));
        let ll = add_log_likelihood(&mut g);
        g.link(ll.x(), x.out()).unwrap();
        g.link(ll.s(), s.out()).unwrap();
        run_foreprop(&mut g, x.0).unwrap();
        run_foreprop(&mut g, s.0).unwrap();
        let out = g.output_value(ll.out()).unwrap()[(0, 0)];
        let expected = -0.5 * (0.25 + 0.0 + (2.0 * std::f64::consts::PI).ln());
        assert_abs_diff_eq!(out, expected, epsilon = 1e-9);
    }

    #[test]
    fn backprop_matches_finite_difference_on_s() {
        let eval = |s00: f64| -> f64 {
            let mut g = Graph::new();
            let x = add_constant(&mut g, vector(&[0.5, -0.2]));
            let s = add_constant(&mut g, Mat::from_row_slice(2, 2, &[s00, 0.1, 0.1, 0.8]));
            let ll = add_log_likelihood(&mut g);
            g.link(ll.x(), x.out()).unwrap();
            g.link(ll.s(), s.out()).unwrap();
            run_foreprop(&mut g, x.0).unwrap();
            run_foreprop(&mut g, s.0).unwrap();
            g.output_value(ll.out()).unwrap()[(0, 0)]
        };

        let mut g = Graph::new();
        let x = add_constant(&mut g, vector(&[0.5, -0.2]));
        let s = add_constant(&mut g, Mat::from_row_slice(2, 2, &[1.5, 0.1, 0.1, 0.8]));
        let ll = add_log_likelihood(&mut g);
        g.link(ll.x(), x.out()).unwrap();
        g.link(ll.s(), s.out()).unwrap();
        run_foreprop(&mut g, x.0).unwrap();
        run_foreprop(&mut g, s.0).unwrap();

        let sink = add_sink(&mut g);
        g.link(sink.input(), ll.out()).unwrap();
        sink.set_backprop_value(&mut g, TruncationPolicy::Unbounded.seed(scalar(1.0)));
        run_backprop(&mut g, sink.0).unwrap();
        let ds = g.accumulator_of(s.out()).unwrap().retrieve().into_mat(1, 4);

        let eps = 1e-6;
        let fd = (eval(1.5 + eps) - eval(1.5 - eps)) / (2.0 * eps);
        assert_abs_diff_eq!(ds[(0, 0)], fd, epsilon = 1e-4);
    }
}

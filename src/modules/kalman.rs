//! Kalman filter predict/update modules: the two modules a chain of
//! filtering steps is built from.
//!
//! Both modules cache the quantities their own forward pass derives that
//! backprop also needs (the Cholesky factor of the innovation/process
//! covariance, the gain `K`) as module-private fields outside
//! [`crate::graph::ModuleCore`]. [`ModuleImpl::reset_custom_state`] clears
//! them on invalidate so a stale cache can never leak into a later pass.

use crate::accumulator::sum_accumulators;
use crate::graph::{Graph, GraphError, InputRef, ModuleCore, ModuleId, ModuleImpl, OutputRef};
use crate::matrix::{commutation, kron, CholeskyFactor, Mat};

const X_IN: usize = 0;
const P_IN: usize = 1;
const Q_IN: usize = 2;
const X_OUT: usize = 0;
const P_OUT: usize = 1;

/// `x' = A x`, `P' = A P Aᵀ + Q`. The per-input Jacobians are pure
/// Kronecker identities in `A`; `P` and `Q` never influence `x'`, so no
/// accumulator is chained back from `x_out` to `P_in`/`Q_in` at all —
/// those partials are zero and are omitted by not chaining, rather than
/// chained through an explicit zero matrix.
pub struct PredictModule {
    core: ModuleCore,
    a: Mat,
}

impl PredictModule {
    /// Builds a predict module with transition matrix `a` (`n x n`).
    pub fn new(a: Mat) -> Box<dyn ModuleImpl> {
        Box::new(Self {
            core: ModuleCore::new(3, 2),
            a,
        })
    }

    fn set_a_raw(&mut self, a: Mat) {
        self.a = a;
    }
}

impl ModuleImpl for PredictModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "kalman_predict"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let x = graph.input_value(InputRef { module: id, index: X_IN }).unwrap().clone();
        let p = graph.input_value(InputRef { module: id, index: P_IN }).unwrap().clone();
        let q = graph.input_value(InputRef { module: id, index: Q_IN }).unwrap().clone();

        let next_x = &self.a * x;
        let next_p = &self.a * p * self.a.transpose() + q;

        let mut ready = graph.emit(OutputRef { module: id, index: X_OUT }, next_x);
        ready.extend(graph.emit(OutputRef { module: id, index: P_OUT }, next_p));
        Ok(ready)
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let x_out = OutputRef { module: id, index: X_OUT };
        let p_out = OutputRef { module: id, index: P_OUT };

        let mut ready = Vec::new();
        if let Some(acc) = graph.chain_backprop(x_out, Some(&self.a))? {
            ready.extend(graph.accept_backprop(InputRef { module: id, index: X_IN }, acc)?);
        }

        let aa = kron(&self.a, &self.a);
        if let Some(acc) = graph.chain_backprop(p_out, Some(&aa))? {
            ready.extend(graph.accept_backprop(InputRef { module: id, index: P_IN }, acc)?);
        }
        if let Some(acc) = graph.chain_backprop(p_out, None)? {
            ready.extend(graph.accept_backprop(InputRef { module: id, index: Q_IN }, acc)?);
        }
        Ok(ready)
    }
}

/// A typed handle to a [`PredictModule`].
#[derive(Copy, Clone, Debug)]
pub struct PredictHandle(pub ModuleId);

impl PredictHandle {
    /// State-mean input.
    pub fn x_in(&self) -> InputRef {
        InputRef { module: self.0, index: X_IN }
    }
    /// State-covariance input.
    pub fn p_in(&self) -> InputRef {
        InputRef { module: self.0, index: P_IN }
    }
    /// Transition-covariance input.
    pub fn q_in(&self) -> InputRef {
        InputRef { module: self.0, index: Q_IN }
    }
    /// Post-prediction state-mean output.
    pub fn x_out(&self) -> OutputRef {
        OutputRef { module: self.0, index: X_OUT }
    }
    /// Post-prediction state-covariance output.
    pub fn p_out(&self) -> OutputRef {
        OutputRef { module: self.0, index: P_OUT }
    }

    /// Replaces the transition matrix and invalidates the module so the
    /// change takes effect on the next forward pass.
    pub fn set_a(&self, graph: &mut Graph, a: Mat) {
        graph
            .downcast_mut::<PredictModule>(self.0)
            .expect("handle does not point at a PredictModule")
            .set_a_raw(a);
        graph.dispatch_invalidate(self.0);
    }
}

/// Adds a [`PredictModule`] with transition matrix `a` to `graph`.
pub fn add_predict(graph: &mut Graph, a: Mat) -> PredictHandle {
    PredictHandle(graph.add_module(PredictModule::new(a)))
}

const U_X_IN: usize = 0;
const U_P_IN: usize = 1;
const U_R_IN: usize = 2;
const U_X_OUT: usize = 0;
const U_P_OUT: usize = 1;
const U_V_OUT: usize = 2;
const U_S_OUT: usize = 3;

/// A Kalman filter update (correction) step against observation `y` via
/// observation matrix `C`.
///
/// Publishes four outputs (`x_out`, `P_out`, `v_out`, `S_out`) and
/// tolerates any of them being unwired: [`crate::graph::OutputPortState`]'s
/// default `backprop_ready` is vacuously true for a port with zero
/// consumers, so a chain that only cares about `x_out`/`P_out` (dropping
/// the innovation terms) still lets this module complete its backward
/// pass.
pub struct UpdateModule {
    core: ModuleCore,
    y: Mat,
    c: Mat,
    /// Cholesky factor of `S`, cached between `foreprop` and `backprop`.
    s_chol: Option<CholeskyFactor>,
    /// Kalman gain, cached between `foreprop` and `backprop`.
    k_gain: Option<Mat>,
}

impl UpdateModule {
    /// Builds an update module against observation `y` via observation
    /// matrix `c`.
    pub fn new(y: Mat, c: Mat) -> Box<dyn ModuleImpl> {
        Box::new(Self {
            core: ModuleCore::new(3, 4),
            y,
            c,
            s_chol: None,
            k_gain: None,
        })
    }

    fn set_y_raw(&mut self, y: Mat) {
        self.y = y;
    }

    fn set_c_raw(&mut self, c: Mat) {
        self.c = c;
    }
}

impl ModuleImpl for UpdateModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "kalman_update"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn reset_custom_state(&mut self) {
        self.s_chol = None;
        self.k_gain = None;
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let x = graph.input_value(InputRef { module: id, index: U_X_IN }).unwrap().clone();
        let p = graph.input_value(InputRef { module: id, index: U_P_IN }).unwrap().clone();
        let r = graph.input_value(InputRef { module: id, index: U_R_IN }).unwrap().clone();

        let v = &self.y - &self.c * &x;
        let s = &self.c * &p * self.c.transpose() + r;
        let s_chol = CholeskyFactor::of(&s)?;
        let k = s_chol.solve_right(&(&p * self.c.transpose()))?;

        let next_x = &x + &k * &v;
        let next_p = &p - &k * &self.c * &p;

        self.s_chol = Some(s_chol);
        self.k_gain = Some(k);

        let mut ready = graph.emit(OutputRef { module: id, index: U_X_OUT }, next_x);
        ready.extend(graph.emit(OutputRef { module: id, index: U_P_OUT }, next_p));
        ready.extend(graph.emit(OutputRef { module: id, index: U_V_OUT }, v));
        ready.extend(graph.emit(OutputRef { module: id, index: U_S_OUT }, s));
        Ok(ready)
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let x_out = OutputRef { module: id, index: U_X_OUT };
        let p_out = OutputRef { module: id, index: U_P_OUT };
        let v_out = OutputRef { module: id, index: U_V_OUT };
        let s_out = OutputRef { module: id, index: U_S_OUT };

        let x = graph.input_value(InputRef { module: id, index: U_X_IN }).unwrap().clone();
        let n = x.nrows();
        let s_chol = self
            .s_chol
            .as_ref()
            .expect("kalman update backprop requires a preceding foreprop");
        let k = self
            .k_gain
            .as_ref()
            .expect("kalman update backprop requires a preceding foreprop")
            .clone();
        let v = graph.output_value(v_out).unwrap().clone();
        let kc = &k * &self.c;
        let eye_n = Mat::identity(n, n);

        // --- x_out: contributes to x_in, P_in, R_in ---
        let dxout_dxin = &eye_n - &kc;
        let dxin_from_x = graph.chain_backprop(x_out, Some(&dxout_dxin))?;

        let u = s_chol.solve(&v)?;
        let ctu = self.c.transpose() * &u;
        let dxout_dpin = kron(&ctu.transpose(), &eye_n) - kron(&ctu.transpose(), &kc);
        let dpin_from_x = graph.chain_backprop(x_out, Some(&dxout_dpin))?;

        let dxout_dr = -kron(&u.transpose(), &k);
        let dr_from_x = graph.chain_backprop(x_out, Some(&dxout_dr))?;

        // --- P_out: contributes to P_in, R_in ---
        let nn = n * n;
        let ii = Mat::identity(nn, nn);
        let t = commutation(n, n);
        let dpout_dpin = &ii - (&ii + &t) * kron(&eye_n, &kc) + kron(&kc, &kc);
        let dpin_from_p = graph.chain_backprop(p_out, Some(&dpout_dpin))?;

        let dpout_dr = kron(&k, &k);
        let dr_from_p = graph.chain_backprop(p_out, Some(&dpout_dr))?;

        // --- v_out: contributes to x_in only ---
        let dvout_dxin = -self.c.clone();
        let dxin_from_v = graph.chain_backprop(v_out, Some(&dvout_dxin))?;

        // --- S_out: contributes to P_in, R_in ---
        let dsout_dpin = kron(&self.c, &self.c);
        let dpin_from_s = graph.chain_backprop(s_out, Some(&dsout_dpin))?;
        let dr_from_s = graph.chain_backprop(s_out, None)?;

        let mut ready = Vec::new();
        if let Some(acc) = sum_accumulators([dxin_from_x, dxin_from_v]) {
            ready.extend(graph.accept_backprop(InputRef { module: id, index: U_X_IN }, acc)?);
        }
        if let Some(acc) = sum_accumulators([dpin_from_x, dpin_from_p, dpin_from_s]) {
            ready.extend(graph.accept_backprop(InputRef { module: id, index: U_P_IN }, acc)?);
        }
        if let Some(acc) = sum_accumulators([dr_from_x, dr_from_p, dr_from_s]) {
            ready.extend(graph.accept_backprop(InputRef { module: id, index: U_R_IN }, acc)?);
        }
        Ok(ready)
    }
}

/// A typed handle to an [`UpdateModule`].
#[derive(Copy, Clone, Debug)]
pub struct UpdateHandle(pub ModuleId);

impl UpdateHandle {
    /// Pre-update state-mean input.
    pub fn x_in(&self) -> InputRef {
        InputRef { module: self.0, index: U_X_IN }
    }
    /// Pre-update state-covariance input.
    pub fn p_in(&self) -> InputRef {
        InputRef { module: self.0, index: U_P_IN }
    }
    /// Observation-covariance input.
    pub fn r_in(&self) -> InputRef {
        InputRef { module: self.0, index: U_R_IN }
    }
    /// Post-update state-mean output.
    pub fn x_out(&self) -> OutputRef {
        OutputRef { module: self.0, index: U_X_OUT }
    }
    /// Post-update state-covariance output.
    pub fn p_out(&self) -> OutputRef {
        OutputRef { module: self.0, index: U_P_OUT }
    }
    /// Innovation output.
    pub fn v_out(&self) -> OutputRef {
        OutputRef { module: self.0, index: U_V_OUT }
    }
    /// Innovation-covariance output.
    pub fn s_out(&self) -> OutputRef {
        OutputRef { module: self.0, index: U_S_OUT }
    }

    /// Replaces the observation and invalidates the module.
    pub fn set_y(&self, graph: &mut Graph, y: Mat) {
        graph
            .downcast_mut::<UpdateModule>(self.0)
            .expect("handle does not point at an UpdateModule")
            .set_y_raw(y);
        graph.dispatch_invalidate(self.0);
    }

    /// Replaces the observation matrix and invalidates the module.
    pub fn set_c(&self, graph: &mut Graph, c: Mat) {
        graph
            .downcast_mut::<UpdateModule>(self.0)
            .expect("handle does not point at an UpdateModule")
            .set_c_raw(c);
        graph.dispatch_invalidate(self.0);
    }
}

/// Adds an [`UpdateModule`] observing `y` through `c` to `graph`.
pub fn add_update(graph: &mut Graph, y: Mat, c: Mat) -> UpdateHandle {
    UpdateHandle(graph.add_module(UpdateModule::new(y, c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::TruncationPolicy;
    use crate::matrix::vector;
    use crate::modules::basic::{add_constant, add_sink};
    use crate::scheduler::{run_backprop, run_foreprop};

    fn seed_leaf(g: &mut Graph, m: crate::modules::basic::ConstantHandle) {
        run_foreprop(g, m.0).unwrap();
    }

    #[test]
    fn predict_one_step_matches_closed_form() {
        let mut g = Graph::new();
        let a = Mat::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]);
        let x = add_constant(&mut g, vector(&[0.0, 0.0]));
        let p = add_constant(&mut g, Mat::identity(2, 2));
        let q = add_constant(&mut g, Mat::identity(2, 2) * 0.1);
        let predict = add_predict(&mut g, a.clone());
        g.link(predict.x_in(), x.out()).unwrap();
        g.link(predict.p_in(), p.out()).unwrap();
        g.link(predict.q_in(), q.out()).unwrap();
        seed_leaf(&mut g, x);
        seed_leaf(&mut g, p);
        seed_leaf(&mut g, q);

        let x_out = g.output_value(predict.x_out()).unwrap();
        assert!((x_out[(0, 0)]).abs() < 1e-12);
        assert!((x_out[(1, 0)]).abs() < 1e-12);

        let p_out = g.output_value(predict.p_out()).unwrap();
        assert!((p_out[(0, 0)] - 2.1).abs() < 1e-12);
        assert!((p_out[(0, 1)] - 1.0).abs() < 1e-12);
        assert!((p_out[(1, 0)] - 1.0).abs() < 1e-12);
        assert!((p_out[(1, 1)] - 1.1).abs() < 1e-12);

        let sink = add_sink(&mut g);
        g.link(sink.input(), predict.x_out()).unwrap();
        sink.set_backprop_value(&mut g, TruncationPolicy::Unbounded.seed(Mat::identity(2, 2)));
        run_backprop(&mut g, sink.0).unwrap();
        let dx = g.accumulator_of(x.out()).unwrap().retrieve().into_mat(2, 2);
        assert_eq!(dx, a);
    }

    #[test]
    fn update_reduces_covariance_along_observed_axis() {
        let mut g = Graph::new();
        let c = Mat::from_row_slice(1, 2, &[1.0, 0.0]);
        let x = add_constant(&mut g, vector(&[0.0, 0.0]));
        let p = add_constant(&mut g, Mat::identity(2, 2));
        let r = add_constant(&mut g, Mat::identity(1, 1) * 0.01);
        let update = add_update(&mut g, vector(&[1.0]), c);
        g.link(update.x_in(), x.out()).unwrap();
        g.link(update.p_in(), p.out()).unwrap();
        g.link(update.r_in(), r.out()).unwrap();
        seed_leaf(&mut g, x);
        seed_leaf(&mut g, p);
        seed_leaf(&mut g, r);

        let p_out = g.output_value(update.p_out()).unwrap();
        assert!(p_out[(0, 0)] < 1.0);
        assert!((p_out[(1, 1)] - 1.0).abs() < 1e-9);

        let x_out = g.output_value(update.x_out()).unwrap();
        assert!(x_out[(0, 0)] > 0.0 && x_out[(0, 0)] < 1.0);
    }

    #[test]
    fn update_backprop_matches_finite_difference_on_x() {
        let eval = |x0: f64| -> f64 {
            let mut g = Graph::new();
            let c = Mat::from_row_slice(1, 2, &[1.0, 0.0]);
            let x = add_constant(&mut g, vector(&[x0, 0.0]));
            let p = add_constant(&mut g, Mat::identity(2, 2));
            let r = add_constant(&mut g, Mat::identity(1, 1) * 0.05);
            let update = add_update(&mut g, vector(&[1.0]), c);
            g.link(update.x_in(), x.out()).unwrap();
            g.link(update.p_in(), p.out()).unwrap();
            g.link(update.r_in(), r.out()).unwrap();
            seed_leaf(&mut g, x);
            seed_leaf(&mut g, p);
            seed_leaf(&mut g, r);
            g.output_value(update.x_out()).unwrap()[(0, 0)]
        };

        let mut g = Graph::new();
        let c = Mat::from_row_slice(1, 2, &[1.0, 0.0]);
        let x = add_constant(&mut g, vector(&[0.3, 0.0]));
        let p = add_constant(&mut g, Mat::identity(2, 2));
        let r = add_constant(&mut g, Mat::identity(1, 1) * 0.05);
        let update = add_update(&mut g, vector(&[1.0]), c);
        g.link(update.x_in(), x.out()).unwrap();
        g.link(update.p_in(), p.out()).unwrap();
        g.link(update.r_in(), r.out()).unwrap();
        seed_leaf(&mut g, x);
        seed_leaf(&mut g, p);
        seed_leaf(&mut g, r);

        let sink = add_sink(&mut g);
        g.link(sink.input(), update.x_out()).unwrap();
        sink.set_backprop_value(&mut g, TruncationPolicy::Unbounded.seed(vector(&[1.0, 0.0]).transpose()));
        run_backprop(&mut g, sink.0).unwrap();
        let dx = g.accumulator_of(x.out()).unwrap().retrieve().into_mat(1, 2);

        let eps = 1e-6;
        let fd = (eval(0.3 + eps) - eval(0.3 - eps)) / (2.0 * eps);
        assert!((dx[(0, 0)] - fd).abs() < 1e-4);
    }
}

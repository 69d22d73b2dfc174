//! Variable-arity reduction modules: mean and weighted sum over a
//! configurable number of same-shaped inputs.
//!
//! Readiness here reuses [`crate::graph::ModuleCore`]'s default
//! "every input holds a value" scan rather than threading a parallel
//! arrival counter: arity is bounded by chain length in practice, so the
//! scan costs nothing worth avoiding, and a second source of truth for
//! readiness is a bug waiting to happen.

use crate::graph::{Graph, GraphError, InputRef, ModuleCore, ModuleId, ModuleImpl, OutputRef};
use crate::matrix::Mat;

const OUT: usize = 0;

/// `out = mean(inputs)`. Every per-input Jacobian is `(1/n) * I`.
pub struct MeanModule {
    core: ModuleCore,
    arity: usize,
}

impl MeanModule {
    /// Builds a mean module over `arity` same-shaped inputs. `arity` may
    /// be zero — a chain façade builds its reducer before any step has
    /// been appended and grows it with [`MeanHandle::create_input`] as
    /// steps are added.
    pub fn new(arity: usize) -> Box<dyn ModuleImpl> {
        Box::new(Self {
            core: ModuleCore::new(arity, 1),
            arity,
        })
    }

    /// Grows the input list by one port, returning its index. Lets a
    /// caller that doesn't know the final arity up front (e.g. a chain
    /// façade appending one step's log-likelihood at a time) wire new
    /// terms in without reconstructing the module.
    fn create_input(&mut self) -> usize {
        self.arity += 1;
        self.core.push_input()
    }
}

impl ModuleImpl for MeanModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "mean"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let mut sum: Option<Mat> = None;
        for i in 0..self.arity {
            let v = graph.input_value(InputRef { module: id, index: i }).unwrap().clone();
            sum = Some(match sum {
                None => v,
                Some(acc) => acc + v,
            });
        }
        let out = sum.unwrap() / self.arity as f64;
        Ok(graph.emit(OutputRef { module: id, index: OUT }, out))
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let out_ref = OutputRef { module: id, index: OUT };
        let Some(acc) = graph.accumulator_of(out_ref).cloned() else {
            return Ok(Vec::new());
        };
        let scale = 1.0 / self.arity as f64;
        let mut ready = Vec::new();
        for i in 0..self.arity {
            let dim = acc_out_dim(&acc);
            let scaled = acc.mul_right(&(Mat::identity(dim, dim) * scale))?;
            ready.extend(graph.accept_backprop(InputRef { module: id, index: i }, scaled)?);
        }
        Ok(ready)
    }
}

fn acc_out_dim(acc: &crate::accumulator::Accumulator) -> usize {
    match acc.retrieve() {
        crate::accumulator::Jacobian::Zero => 0,
        crate::accumulator::Jacobian::Value(m) => m.ncols(),
    }
}

/// A typed handle to a [`MeanModule`].
#[derive(Copy, Clone, Debug)]
pub struct MeanHandle(pub ModuleId);

impl MeanHandle {
    /// The `i`th input port.
    pub fn input(&self, i: usize) -> InputRef {
        InputRef { module: self.0, index: i }
    }
    /// The module's output.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: OUT }
    }
    /// Grows the reducer by one more input port and returns it, for
    /// callers that append terms one at a time (e.g. a chain façade
    /// feeding one log-likelihood per step).
    pub fn create_input(&self, graph: &mut Graph) -> InputRef {
        let idx = graph
            .downcast_mut::<MeanModule>(self.0)
            .expect("handle does not point at a MeanModule")
            .create_input();
        InputRef { module: self.0, index: idx }
    }
}

/// Adds a [`MeanModule`] over `arity` inputs to `graph`.
pub fn add_mean(graph: &mut Graph, arity: usize) -> MeanHandle {
    MeanHandle(graph.add_module(MeanModule::new(arity)))
}

/// `out = (sum_i w_i * x_i) / W` where `W = sum_i w_i`, over `k` (value,
/// weight) pairs. Unlike [`MeanModule`], the weights are themselves
/// inputs — ports `2*i` and `2*i+1` hold the `i`th value and weight —
/// so a chain can learn how much to trust each term.
///
/// Gradients: `d out / d x_i = w_i / W` and `d out / d w_i = (x_i - out) / W`.
pub struct WeightedSumModule {
    core: ModuleCore,
    k: usize,
    /// `W` from the most recent forward pass, needed by backprop.
    denom: Option<f64>,
}

fn value_port(i: usize) -> usize {
    2 * i
}
fn weight_port(i: usize) -> usize {
    2 * i + 1
}

impl WeightedSumModule {
    /// Builds a weighted-sum module over `k` (value, weight) pairs.
    pub fn new(k: usize) -> Box<dyn ModuleImpl> {
        assert!(k > 0, "weighted sum requires at least one pair");
        Box::new(Self {
            core: ModuleCore::new(2 * k, 1),
            k,
            denom: None,
        })
    }

    /// Grows the input list by one (value, weight) pair, returning their
    /// indices.
    fn create_pair(&mut self) -> (usize, usize) {
        self.k += 1;
        let value_idx = self.core.push_input();
        let weight_idx = self.core.push_input();
        (value_idx, weight_idx)
    }
}

impl ModuleImpl for WeightedSumModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "weighted_sum"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let mut numer: Option<Mat> = None;
        let mut denom = 0.0f64;
        for i in 0..self.k {
            let x = graph
                .input_value(InputRef { module: id, index: value_port(i) })
                .unwrap()
                .clone();
            let w = graph
                .input_value(InputRef { module: id, index: weight_port(i) })
                .unwrap()[(0, 0)];
            let scaled = x * w;
            numer = Some(match numer {
                None => scaled,
                Some(acc) => acc + scaled,
            });
            denom += w;
        }
        self.denom = Some(denom);
        let out = numer.unwrap() / denom;
        Ok(graph.emit(OutputRef { module: id, index: OUT }, out))
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let out_ref = OutputRef { module: id, index: OUT };
        let Some(acc) = graph.accumulator_of(out_ref).cloned() else {
            return Ok(Vec::new());
        };
        let out_value = graph.output_value(out_ref).unwrap().clone();
        let w = self.denom.expect("backprop requires a forward pass first");
        let dim = acc_out_dim(&acc);
        let mut ready = Vec::new();
        for i in 0..self.k {
            let x_i = graph
                .input_value(InputRef { module: id, index: value_port(i) })
                .unwrap()
                .clone();
            let w_i = graph
                .input_value(InputRef { module: id, index: weight_port(i) })
                .unwrap()[(0, 0)];

            // d out / d x_i = (w_i / W) * I
            let dx_jac = Mat::identity(dim, dim) * (w_i / w);
            let dx_acc = acc.mul_right(&dx_jac)?;
            ready.extend(graph.accept_backprop(InputRef { module: id, index: value_port(i) }, dx_acc)?);

            // d out / d w_i = (x_i - out) / W, a column vector matching out's shape
            let dw_jac = (x_i - &out_value) / w;
            let dw_acc = acc.mul_right(&dw_jac)?;
            ready.extend(graph.accept_backprop(InputRef { module: id, index: weight_port(i) }, dw_acc)?);
        }
        Ok(ready)
    }
}

/// A typed handle to a [`WeightedSumModule`].
#[derive(Copy, Clone, Debug)]
pub struct WeightedSumHandle(pub ModuleId);

impl WeightedSumHandle {
    /// The `i`th value input port.
    pub fn value(&self, i: usize) -> InputRef {
        InputRef { module: self.0, index: value_port(i) }
    }
    /// The `i`th weight input port.
    pub fn weight(&self, i: usize) -> InputRef {
        InputRef { module: self.0, index: weight_port(i) }
    }
    /// The module's output.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: OUT }
    }

    /// Grows the reducer by one more (value, weight) pair and returns
    /// their ports, for callers that append terms one at a time.
    pub fn create_pair(&self, graph: &mut Graph) -> (InputRef, InputRef) {
        let (value_idx, weight_idx) = graph
            .downcast_mut::<WeightedSumModule>(self.0)
            .expect("handle does not point at a WeightedSumModule")
            .create_pair();
        (
            InputRef { module: self.0, index: value_idx },
            InputRef { module: self.0, index: weight_idx },
        )
    }
}

/// Adds a [`WeightedSumModule`] over `k` (value, weight) pairs to `graph`.
pub fn add_weighted_sum(graph: &mut Graph, k: usize) -> WeightedSumHandle {
    WeightedSumHandle(graph.add_module(WeightedSumModule::new(k)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::scalar;
    use crate::modules::basic::add_constant;
    use crate::scheduler::run_foreprop;

    #[test]
    fn mean_averages_inputs() {
        let mut g = Graph::new();
        let a = add_constant(&mut g, scalar(2.0));
        let b = add_constant(&mut g, scalar(4.0));
        let c = add_constant(&mut g, scalar(9.0));
        let mean = add_mean(&mut g, 3);
        g.link(mean.input(0), a.out()).unwrap();
        g.link(mean.input(1), b.out()).unwrap();
        g.link(mean.input(2), c.out()).unwrap();
        run_foreprop(&mut g, a.0).unwrap();
        run_foreprop(&mut g, b.0).unwrap();
        run_foreprop(&mut g, c.0).unwrap();
        assert_eq!(g.output_value(mean.out()), Some(&scalar(5.0)));
    }

    #[test]
    fn weighted_sum_normalizes_by_total_weight() {
        let mut g = Graph::new();
        let x0 = add_constant(&mut g, scalar(1.0));
        let w0 = add_constant(&mut g, scalar(3.0));
        let x1 = add_constant(&mut g, scalar(2.0));
        let w1 = add_constant(&mut g, scalar(5.0));
        let ws = add_weighted_sum(&mut g, 2);
        g.link(ws.value(0), x0.out()).unwrap();
        g.link(ws.weight(0), w0.out()).unwrap();
        g.link(ws.value(1), x1.out()).unwrap();
        g.link(ws.weight(1), w1.out()).unwrap();
        run_foreprop(&mut g, x0.0).unwrap();
        run_foreprop(&mut g, w0.0).unwrap();
        run_foreprop(&mut g, x1.0).unwrap();
        run_foreprop(&mut g, w1.0).unwrap();
        // (1*3 + 2*5) / 8 = 13/8
        let expected = 13.0 / 8.0;
        assert!((g.output_value(ws.out()).unwrap()[(0, 0)] - expected).abs() < 1e-12);
    }

    #[test]
    fn weighted_sum_backprop_matches_closed_form_gradients() {
        use crate::accumulator::TruncationPolicy;
        use crate::scheduler::run_backprop;

        let mut g = Graph::new();
        let x0 = add_constant(&mut g, scalar(1.0));
        let w0 = add_constant(&mut g, scalar(3.0));
        let x1 = add_constant(&mut g, scalar(2.0));
        let w1 = add_constant(&mut g, scalar(5.0));
        let ws = add_weighted_sum(&mut g, 2);
        g.link(ws.value(0), x0.out()).unwrap();
        g.link(ws.weight(0), w0.out()).unwrap();
        g.link(ws.value(1), x1.out()).unwrap();
        g.link(ws.weight(1), w1.out()).unwrap();
        run_foreprop(&mut g, x0.0).unwrap();
        run_foreprop(&mut g, w0.0).unwrap();
        run_foreprop(&mut g, x1.0).unwrap();
        run_foreprop(&mut g, w1.0).unwrap();

        let sink = crate::modules::basic::add_sink(&mut g);
        g.link(sink.input(), ws.out()).unwrap();
        sink.set_backprop_value(&mut g, TruncationPolicy::Unbounded.seed(scalar(1.0)));
        run_backprop(&mut g, sink.0).unwrap();

        let w_total = 8.0;
        let out = 13.0 / 8.0;
        let dx0 = g.accumulator_of(x0.out()).unwrap().retrieve().into_mat(1, 1);
        assert!((dx0[(0, 0)] - 3.0 / w_total).abs() < 1e-12);
        let dw0 = g.accumulator_of(w0.out()).unwrap().retrieve().into_mat(1, 1);
        assert!((dw0[(0, 0)] - (1.0 - out) / w_total).abs() < 1e-12);
        let dx1 = g.accumulator_of(x1.out()).unwrap().retrieve().into_mat(1, 1);
        assert!((dx1[(0, 0)] - 5.0 / w_total).abs() < 1e-12);
        let dw1 = g.accumulator_of(w1.out()).unwrap().retrieve().into_mat(1, 1);
        assert!((dw1[(0, 0)] - (2.0 - out) / w_total).abs() < 1e-12);
    }
}

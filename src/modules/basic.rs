//! Leaf and terminal modules: sources that hold a fixed value, and the
//! sink that starts a backward pass.

use crate::accumulator::Accumulator;
use crate::graph::{Graph, GraphError, InputRef, ModuleCore, ModuleId, ModuleImpl, OutputRef};
use crate::matrix::Mat;

/// A zero-input module that emits a fixed value every forward pass.
/// Mutating its value via [`ConstantModule::set_value`] re-invalidates
/// the module so the new value is re-emitted on the next `foreprop`.
pub struct ConstantModule {
    core: ModuleCore,
    value: Mat,
}

impl ConstantModule {
    /// Builds a constant module holding `value`.
    pub fn new(value: Mat) -> Box<dyn ModuleImpl> {
        Box::new(Self {
            core: ModuleCore::new(0, 1),
            value,
        })
    }

    /// Replaces the held value. Callers must invalidate the owning graph
    /// afterward (see [`ConstantHandle::set_value`]) for the change to
    /// take effect downstream.
    pub fn set_value_raw(&mut self, value: Mat) {
        self.value = value;
    }

    /// The value currently held, independent of whether it has
    /// propagated to the output port on the current pass.
    pub fn value(&self) -> &Mat {
        &self.value
    }
}

impl ModuleImpl for ConstantModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "constant"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        Ok(graph.emit(OutputRef { module: id, index: 0 }, self.value.clone()))
    }
    fn backprop(&mut self, _graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        Ok(vec![])
    }
}

/// A typed handle to a [`ConstantModule`] placed in a graph.
#[derive(Copy, Clone, Debug)]
pub struct ConstantHandle(pub ModuleId);

impl ConstantHandle {
    /// The module's single output port.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: 0 }
    }

    /// Replaces the held value and invalidates the module so the change
    /// propagates on the next forward pass.
    pub fn set_value(&self, graph: &mut Graph, value: Mat) {
        graph
            .downcast_mut::<ConstantModule>(self.0)
            .expect("handle does not point at a ConstantModule")
            .set_value_raw(value);
        graph.dispatch_invalidate(self.0);
    }

    /// The value currently held, independent of whether it has
    /// propagated to the output port on the current pass.
    pub fn value(&self, graph: &mut Graph) -> Mat {
        graph
            .downcast_mut::<ConstantModule>(self.0)
            .expect("handle does not point at a ConstantModule")
            .value()
            .clone()
    }
}

/// Adds a constant module to `graph` and returns its handle.
pub fn add_constant(graph: &mut Graph, value: Mat) -> ConstantHandle {
    ConstantHandle(graph.add_module(ConstantModule::new(value)))
}

/// A single-input, zero-output terminal module. `foreprop` is a
/// documented no-op: a sink has no outputs to ready, so the scheduler
/// never dispatches it during a forward pass. `backprop` is the entry
/// point of a backward pass: it holds an externally set accumulator
/// (`do_dx`, set via [`SinkHandle::set_backprop_value`]) and, once set,
/// pushes a copy of it upstream across its single link every time
/// backprop runs.
pub struct SinkModule {
    core: ModuleCore,
    seed: Option<Accumulator>,
}

impl SinkModule {
    /// Builds a sink with no seed set. Call
    /// [`SinkHandle::set_backprop_value`] before driving a backward pass.
    pub fn new() -> Box<dyn ModuleImpl> {
        Box::new(Self {
            core: ModuleCore::new(1, 0),
            seed: None,
        })
    }

    fn set_seed(&mut self, seed: Accumulator) {
        self.seed = Some(seed);
    }
}

impl ModuleImpl for SinkModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "sink"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, _graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        Ok(Vec::new())
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let input = InputRef { module: id, index: 0 };
        let seed = self
            .seed
            .clone()
            .expect("sink backprop requires set_backprop_value to be called first");
        graph.accept_backprop(input, seed)
    }
}

/// A typed handle to a [`SinkModule`] placed in a graph.
#[derive(Copy, Clone, Debug)]
pub struct SinkHandle(pub ModuleId);

impl SinkHandle {
    /// The module's single input port.
    pub fn input(&self) -> InputRef {
        InputRef { module: self.0, index: 0 }
    }

    /// The read-only forward value currently held at the sink, once a
    /// forward pass has reached it.
    pub fn value<'a>(&self, graph: &'a Graph) -> Option<&'a Mat> {
        graph.input_value(self.input())
    }

    /// Sets the accumulator that the next `backprop` dispatch will push
    /// upstream. Callers typically build this from a
    /// [`crate::accumulator::TruncationPolicy`] sized to match the sink's
    /// input before driving the backward pass.
    pub fn set_backprop_value(&self, graph: &mut Graph, seed: Accumulator) {
        graph
            .downcast_mut::<SinkModule>(self.0)
            .expect("handle does not point at a SinkModule")
            .set_seed(seed);
    }
}

/// Adds a sink module to `graph` and returns its handle.
pub fn add_sink(graph: &mut Graph) -> SinkHandle {
    SinkHandle(graph.add_module(SinkModule::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::TruncationPolicy;
    use crate::matrix::scalar;
    use crate::scheduler::{run_backprop, run_foreprop};

    #[test]
    fn constant_emits_its_value() {
        let mut g = Graph::new();
        let c = add_constant(&mut g, scalar(7.0));
        run_foreprop(&mut g, c.0).unwrap();
        assert_eq!(g.output_value(c.out()), Some(&scalar(7.0)));
    }

    #[test]
    fn set_value_reinvalidates_and_reemits() {
        let mut g = Graph::new();
        let c = add_constant(&mut g, scalar(1.0));
        run_foreprop(&mut g, c.0).unwrap();
        c.set_value(&mut g, scalar(2.0));
        assert!(g.output_value(c.out()).is_none());
        run_foreprop(&mut g, c.0).unwrap();
        assert_eq!(g.output_value(c.out()), Some(&scalar(2.0)));
    }

    #[test]
    fn sink_seeds_identity_backprop() {
        let mut g = Graph::new();
        let c = add_constant(&mut g, scalar(3.0));
        let s = add_sink(&mut g);
        g.link(s.input(), c.out()).unwrap();
        run_foreprop(&mut g, c.0).unwrap();
        s.set_backprop_value(&mut g, TruncationPolicy::Unbounded.seed(scalar(1.0)));
        run_backprop(&mut g, s.0).unwrap();
        let acc = g.accumulator_of(c.out()).unwrap();
        assert_eq!(acc.retrieve(), crate::accumulator::Jacobian::Value(scalar(1.0)));
    }
}

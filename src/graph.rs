//! The module/port graph core: the arena that owns every module in a
//! computation graph, the typed port addresses that link them, and the
//! generic dispatch that drives a single module through foreprop,
//! backprop, or invalidate.
//!
//! A graph with cyclic references (ports point back at their owning
//! module; modules own their ports) does not fit naturally behind Rust's
//! borrow checker as a tree of owned values. We resolve it the way an
//! arena-backed graph resolves it everywhere else in the ecosystem: modules
//! live in one `Vec` inside [`Graph`], addressed by an opaque [`ModuleId`];
//! ports never hold a reference to anything, only the `(ModuleId, usize)`
//! address of the port across the link. Dispatching a module's own
//! `foreprop`/`backprop` (which needs simultaneous access to its own state
//! *and* to the graph, to push values into its downstream neighbors) is
//! handled by briefly removing the module from the arena for the duration
//! of the call — see [`Graph::dispatch_foreprop`].

use std::any::Any;
use std::fmt;

use thiserror::Error;
use tracing::trace;

use crate::accumulator::{Accumulator, AccumulatorError, Jacobian};
use crate::matrix::{Mat, MatrixError};

/// Opaque handle to a module living in a [`Graph`]'s arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(usize);

/// The address of one of a module's input ports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InputRef {
    /// Owning module.
    pub module: ModuleId,
    /// Index into that module's input port list.
    pub index: usize,
}

/// The address of one of a module's output ports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputRef {
    /// Owning module.
    pub module: ModuleId,
    /// Index into that module's output port list.
    pub index: usize,
}

/// Errors raised by graph wiring and traversal.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    /// A link or port access named a port that cannot hold the value kind
    /// required by the operation. Retained for API completeness — the
    /// typed [`Graph::link`] signature makes this variant statically
    /// unreachable in practice, since input and output ports are distinct
    /// Rust types.
    #[error("port kind mismatch")]
    WrongPortKind,
    /// A gradient was requested from an output port that has not received
    /// any backpropagated contribution.
    #[error("no accumulator present on output port {0:?}")]
    NullAccumulator(OutputRef),
    /// More backprop contributions arrived at a port than it has
    /// consumers.
    #[error("output port {port:?} received {arrivals} arrivals but has {consumers} consumers")]
    OverArrival {
        /// The offending port.
        port: OutputRef,
        /// Arrivals counted so far, including the one that overflowed.
        arrivals: usize,
        /// Declared number of consumers.
        consumers: usize,
    },
    /// An accumulator-level shape or construction error surfaced during
    /// graph traversal.
    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),
    /// A matrix primitive failed — most commonly a Cholesky factorization
    /// attempted on a non-SPD matrix, or a shape mismatch in a module's
    /// own forward/Jacobian computation.
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Per-port bookkeeping shared by every input port regardless of the
/// concrete module it belongs to.
#[derive(Default)]
pub struct InputPortState {
    value: Option<Mat>,
    source: Option<OutputRef>,
}

/// Per-port bookkeeping shared by every output port regardless of the
/// concrete module it belongs to.
#[derive(Default)]
pub struct OutputPortState {
    value: Option<Mat>,
    accumulator: Option<Accumulator>,
    arrivals: usize,
    consumers: Vec<InputRef>,
}

impl OutputPortState {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.accumulator.is_none() && self.arrivals == 0
    }

    fn backprop_ready(&self) -> bool {
        self.arrivals >= self.consumers.len()
    }
}

/// The fixed-size port lists every concrete module embeds, plus the arena
/// slot it was assigned when added to a [`Graph`]. Concrete modules
/// delegate their [`ModuleImpl::core`]/[`ModuleImpl::core_mut`] to a field
/// of this type, and use the default readiness/invalidate behavior it
/// provides unless their arity is dynamic (see `Mean`/`WeightedSum`, which
/// override readiness with an O(1) arrival counter instead of rescanning
/// every port).
pub struct ModuleCore {
    id: ModuleId,
    inputs: Vec<InputPortState>,
    outputs: Vec<OutputPortState>,
}

impl ModuleCore {
    /// Builds a core with `n_in` input ports and `n_out` output ports. The
    /// `id` is a placeholder until [`Graph::add_module`] assigns the real
    /// arena slot.
    pub fn new(n_in: usize, n_out: usize) -> Self {
        Self {
            id: ModuleId(usize::MAX),
            inputs: (0..n_in).map(|_| InputPortState::default()).collect(),
            outputs: (0..n_out).map(|_| OutputPortState::default()).collect(),
        }
    }

    /// This module's own id, once it has been placed in a graph.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Appends a new, empty input port and returns its index. Used by
    /// variable-arity modules (`Mean`, `WeightedSum`) to grow their input
    /// list on demand via `create_input()` rather than fixing arity at
    /// construction.
    pub fn push_input(&mut self) -> usize {
        self.inputs.push(InputPortState::default());
        self.inputs.len() - 1
    }

    fn foreprop_ready(&self) -> bool {
        self.inputs.iter().all(|p| p.value.is_some())
            && self.outputs.iter().any(|p| p.value.is_none())
    }

    fn backprop_ready(&self) -> bool {
        !self.outputs.is_empty() && self.outputs.iter().all(|p| p.backprop_ready())
    }

    fn is_invalid(&self) -> bool {
        self.inputs.iter().all(|p| p.value.is_none())
            && self.outputs.iter().all(|p| p.is_empty())
    }
}

/// The behavior every concrete module in the graph must implement.
///
/// Readiness and invalidation have default implementations driven purely
/// by [`ModuleCore`]'s port bookkeeping; `foreprop`/`backprop` are always
/// module-specific, since they carry the actual forward/Jacobian math.
pub trait ModuleImpl: Any {
    /// Shared port state.
    fn core(&self) -> &ModuleCore;
    /// Mutable access to shared port state.
    fn core_mut(&mut self) -> &mut ModuleCore;

    /// A human-readable name for tracing/debugging.
    fn name(&self) -> &'static str;

    /// Downcasting hook: lets a caller holding only a [`ModuleId`] reach a
    /// concrete module's own fields (e.g. a Kalman module's transition
    /// matrix setter) through the graph's `Box<dyn ModuleImpl>` storage.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Computes this module's outputs from its (already-ready) inputs and
    /// pushes each newly-produced value into the graph via
    /// [`Graph::emit`]. Returns the set of downstream modules that became
    /// foreprop-ready as a result. Fails if a numerical precondition of
    /// the forward computation itself is violated (e.g. a Cholesky
    /// factorization of a non-SPD matrix).
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError>;

    /// Computes this module's per-input Jacobians from its outputs'
    /// accumulators and pushes each one upstream via
    /// [`Graph::accept_backprop`]. Returns the set of upstream modules
    /// that became backprop-ready as a result.
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError>;

    /// True once every input holds a value and at least one output does
    /// not — i.e. there is forward work left to do.
    fn foreprop_ready(&self) -> bool {
        self.core().foreprop_ready()
    }

    /// True once every output has received as many backprop contributions
    /// as it has consumers.
    fn backprop_ready(&self) -> bool {
        self.core().backprop_ready()
    }

    /// True once every port is empty: the module holds no forward values
    /// and no backward accumulators.
    fn is_invalid(&self) -> bool {
        self.core().is_invalid()
    }

    /// Resets any module-specific state outside of `core()` (e.g. an
    /// arrival counter on a variable-arity reduction). A no-op by default.
    fn reset_custom_state(&mut self) {}
}

/// The arena of modules making up one computation graph, plus the wiring
/// between their ports.
#[derive(Default)]
pub struct Graph {
    modules: Vec<Option<Box<dyn ModuleImpl>>>,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self { modules: Vec::new() }
    }

    /// Adds a module to the arena, assigning it a fresh [`ModuleId`].
    pub fn add_module(&mut self, mut m: Box<dyn ModuleImpl>) -> ModuleId {
        let id = ModuleId(self.modules.len());
        m.core_mut().id = id;
        self.modules.push(Some(m));
        id
    }

    fn slot(&self, id: ModuleId) -> &dyn ModuleImpl {
        self.modules[id.0]
            .as_deref()
            .expect("module slot empty: accessed while temporarily taken for dispatch")
    }

    fn slot_mut(&mut self, id: ModuleId) -> &mut Box<dyn ModuleImpl> {
        self.modules[id.0]
            .as_mut()
            .expect("module slot empty: accessed while temporarily taken for dispatch")
    }

    /// Read-only access to a module by id.
    pub fn module(&self, id: ModuleId) -> &dyn ModuleImpl {
        self.slot(id)
    }

    /// The number of input ports currently declared on `id`. Reflects any
    /// growth from a variable-arity module's `create_input()`.
    pub fn input_count(&self, id: ModuleId) -> usize {
        self.slot(id).core().inputs.len()
    }

    /// Downcasts the module at `id` to a concrete type, for parameter
    /// setters that need to reach fields outside [`ModuleCore`] (e.g. a
    /// Kalman module's transition matrix).
    pub fn downcast_mut<T: ModuleImpl>(&mut self, id: ModuleId) -> Option<&mut T> {
        self.slot_mut(id).as_any_mut().downcast_mut::<T>()
    }

    /// Links an output port to an input port: downstream consumer
    /// registration plus upstream source registration, both directions at
    /// once (mirroring `link_ports` in the original graph core).
    ///
    /// Returns [`GraphError::WrongPortKind`] never in practice — kept for
    /// API parity with the rest of the error surface; callers cannot
    /// construct an `InputRef` pointing at an output slot or vice versa,
    /// since the two are distinct Rust types.
    pub fn link(&mut self, input: InputRef, output: OutputRef) -> Result<(), GraphError> {
        self.slot_mut(output.module).core_mut().outputs[output.index]
            .consumers
            .push(input);
        self.slot_mut(input.module).core_mut().inputs[input.index].source = Some(output);
        Ok(())
    }

    /// The upstream source feeding an input port, if linked.
    pub fn source_of(&self, input: InputRef) -> Option<OutputRef> {
        self.slot(input.module).core().inputs[input.index].source
    }

    /// The current value held by an input port.
    pub fn input_value(&self, input: InputRef) -> Option<&Mat> {
        self.slot(input.module).core().inputs[input.index].value.as_ref()
    }

    /// The current value held by an output port.
    pub fn output_value(&self, output: OutputRef) -> Option<&Mat> {
        self.slot(output.module).core().outputs[output.index].value.as_ref()
    }

    /// Directly sets an input port's value, bypassing the forward-link
    /// plumbing. Used to seed constant/leaf modules.
    pub fn set_input_value(&mut self, input: InputRef, v: Mat) {
        self.slot_mut(input.module).core_mut().inputs[input.index].value = Some(v);
    }

    /// Pushes a freshly-computed value out of `output`, writing it into
    /// the port itself and into every registered consumer's input slot.
    /// Returns every consumer module that became foreprop-ready as a
    /// result.
    pub fn emit(&mut self, output: OutputRef, v: Mat) -> Vec<ModuleId> {
        self.slot_mut(output.module).core_mut().outputs[output.index].value = Some(v.clone());
        let consumers = self.slot(output.module).core().outputs[output.index]
            .consumers
            .clone();
        let mut ready = Vec::new();
        for c in consumers {
            self.slot_mut(c.module).core_mut().inputs[c.index].value = Some(v.clone());
            if self.slot(c.module).foreprop_ready() {
                trace!(module = %c.module, "foreprop ready");
                ready.push(c.module);
            }
        }
        ready
    }

    /// Feeds a backpropagated accumulator into `output`'s contribution
    /// list, advancing it one hop (via [`Accumulator::tick_descent`]) and
    /// merging it with whatever has already arrived. Returns the owning
    /// module if this contribution completed it (every output now
    /// backprop-ready).
    pub fn receive_backprop(
        &mut self,
        output: OutputRef,
        mut acc: Accumulator,
    ) -> Result<Vec<ModuleId>, GraphError> {
        acc.tick_descent();
        let port = &mut self.slot_mut(output.module).core_mut().outputs[output.index];
        port.accumulator = Some(match port.accumulator.take() {
            None => acc,
            Some(existing) => existing.merge(acc)?,
        });
        port.arrivals += 1;
        if port.arrivals > port.consumers.len() {
            return Err(GraphError::OverArrival {
                port: output,
                arrivals: port.arrivals,
                consumers: port.consumers.len(),
            });
        }
        let module_ready = self.slot(output.module).backprop_ready();
        Ok(if module_ready {
            trace!(module = %output.module, "backprop ready");
            vec![output.module]
        } else {
            vec![]
        })
    }

    /// Reads the accumulator currently held at `output`, without
    /// consuming or resetting it.
    pub fn accumulator_of(&self, output: OutputRef) -> Option<&Accumulator> {
        self.slot(output.module).core().outputs[output.index].accumulator.as_ref()
    }

    /// The current accumulator's `retrieve()`, or the zero sentinel if no
    /// backprop contribution has arrived at `output` yet (§6: "Output
    /// ports expose `backprop_value`").
    pub fn backprop_value(&self, output: OutputRef) -> Jacobian {
        self.accumulator_of(output).map(Accumulator::retrieve).unwrap_or(Jacobian::Zero)
    }

    /// Builds the accumulator that should propagate one hop upstream
    /// across `output`'s link: a copy of the accumulator currently held
    /// there, optionally right-multiplied by a local Jacobian `dy_dx`
    /// (used when an output feeds into more than one algebraic role in
    /// the consuming module, e.g. a matrix product's two operands).
    pub fn chain_backprop(
        &self,
        output: OutputRef,
        dy_dx: Option<&Mat>,
    ) -> Result<Option<Accumulator>, GraphError> {
        let Some(acc) = self.accumulator_of(output) else {
            return Ok(None);
        };
        Ok(Some(match dy_dx {
            None => acc.clone(),
            Some(m) => acc.mul_right(m)?,
        }))
    }

    /// Sends an accumulator upstream across `input`'s link, if it is
    /// linked to a source; a no-op (returning no newly-ready modules)
    /// otherwise, matching a dangling input port's silent absorption of
    /// backpropagation.
    pub fn accept_backprop(
        &mut self,
        input: InputRef,
        acc: Accumulator,
    ) -> Result<Vec<ModuleId>, GraphError> {
        match self.source_of(input) {
            Some(output) => self.receive_backprop(output, acc),
            None => Ok(vec![]),
        }
    }

    fn invalidate_input(&mut self, input: InputRef) -> Vec<ModuleId> {
        let had_value = self.slot(input.module).core().inputs[input.index].value.is_some();
        if !had_value {
            return vec![];
        }
        self.slot_mut(input.module).core_mut().inputs[input.index].value = None;
        let mut ready = Vec::new();
        if !self.slot(input.module).is_invalid() {
            ready.push(input.module);
        }
        if let Some(src) = self.source_of(input) {
            ready.extend(self.invalidate_output(src));
        }
        ready
    }

    fn invalidate_output(&mut self, output: OutputRef) -> Vec<ModuleId> {
        let was_empty = self.slot(output.module).core().outputs[output.index].is_empty();
        if was_empty {
            return vec![];
        }
        let consumers = {
            let port = &mut self.slot_mut(output.module).core_mut().outputs[output.index];
            port.value = None;
            port.accumulator = None;
            port.arrivals = 0;
            std::mem::take(&mut port.consumers)
        };
        // consumers list must survive invalidation for future links; restore it.
        self.slot_mut(output.module).core_mut().outputs[output.index].consumers = consumers.clone();
        let mut ready = Vec::new();
        if !self.slot(output.module).is_invalid() {
            ready.push(output.module);
        }
        for c in consumers {
            ready.extend(self.invalidate_input(c));
        }
        ready
    }

    /// Invalidates every port of `id` (clearing forward values and
    /// backward accumulators) and propagates the invalidation to every
    /// directly linked neighbor. Returns the set of modules whose
    /// invalidation changed their own state — i.e. the next wave for an
    /// iterative invalidate traversal. A module that was already fully
    /// invalid is left untouched and reports no further work.
    pub fn dispatch_invalidate(&mut self, id: ModuleId) -> Vec<ModuleId> {
        if self.slot(id).is_invalid() {
            return vec![];
        }
        self.slot_mut(id).reset_custom_state();
        let n_in = self.slot(id).core().inputs.len();
        let n_out = self.slot(id).core().outputs.len();
        let mut ready = Vec::new();
        for i in 0..n_in {
            ready.extend(self.invalidate_input(InputRef { module: id, index: i }));
        }
        for i in 0..n_out {
            ready.extend(self.invalidate_output(OutputRef { module: id, index: i }));
        }
        ready
    }

    /// Dispatches one module's `foreprop`, temporarily removing it from
    /// the arena so its own `&mut self` and the graph's `&mut self` never
    /// alias.
    pub fn dispatch_foreprop(&mut self, id: ModuleId) -> Result<Vec<ModuleId>, GraphError> {
        let mut m = self.modules[id.0]
            .take()
            .expect("module slot empty: re-entrant dispatch on the same id");
        trace!(module = %id, name = m.name(), "foreprop dispatch");
        let res = m.foreprop(self);
        self.modules[id.0] = Some(m);
        res
    }

    /// Dispatches one module's `backprop`, with the same temporary-removal
    /// discipline as [`Graph::dispatch_foreprop`].
    pub fn dispatch_backprop(&mut self, id: ModuleId) -> Result<Vec<ModuleId>, GraphError> {
        let mut m = self.modules[id.0]
            .take()
            .expect("module slot empty: re-entrant dispatch on the same id");
        trace!(module = %id, name = m.name(), "backprop dispatch");
        let res = m.backprop(self);
        self.modules[id.0] = Some(m);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::scalar;

    struct Passthrough {
        core: ModuleCore,
    }

    impl Passthrough {
        fn new() -> Box<dyn ModuleImpl> {
            Box::new(Self {
                core: ModuleCore::new(1, 1),
            })
        }
    }

    impl ModuleImpl for Passthrough {
        fn core(&self) -> &ModuleCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }
        fn name(&self) -> &'static str {
            "passthrough"
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
        fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
            let id = self.core.id();
            let v = graph
                .input_value(InputRef { module: id, index: 0 })
                .cloned()
                .unwrap();
            Ok(graph.emit(OutputRef { module: id, index: 0 }, v))
        }
        fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
            let id = self.core.id();
            let out = OutputRef { module: id, index: 0 };
            let Some(acc) = graph.chain_backprop(out, None)? else {
                return Ok(vec![]);
            };
            graph.accept_backprop(InputRef { module: id, index: 0 }, acc)
        }
    }

    #[test]
    fn link_and_foreprop_propagates_value() {
        let mut g = Graph::new();
        let a = g.add_module(Passthrough::new());
        let b = g.add_module(Passthrough::new());
        g.link(
            InputRef { module: b, index: 0 },
            OutputRef { module: a, index: 0 },
        )
        .unwrap();
        g.set_input_value(InputRef { module: a, index: 0 }, scalar(4.0));
        let ready = g.dispatch_foreprop(a).unwrap();
        assert_eq!(ready, vec![b]);
        let ready = g.dispatch_foreprop(b).unwrap();
        assert!(ready.is_empty());
        assert_eq!(g.output_value(OutputRef { module: b, index: 0 }), Some(&scalar(4.0)));
    }

    #[test]
    fn invalidate_clears_downstream() {
        let mut g = Graph::new();
        let a = g.add_module(Passthrough::new());
        let b = g.add_module(Passthrough::new());
        g.link(
            InputRef { module: b, index: 0 },
            OutputRef { module: a, index: 0 },
        )
        .unwrap();
        g.set_input_value(InputRef { module: a, index: 0 }, scalar(1.0));
        g.dispatch_foreprop(a).unwrap();
        g.dispatch_foreprop(b).unwrap();
        assert!(g.output_value(OutputRef { module: b, index: 0 }).is_some());
        g.dispatch_invalidate(a);
        assert!(g.output_value(OutputRef { module: b, index: 0 }).is_none());
        assert!(g.input_value(InputRef { module: b, index: 0 }).is_none());
    }

    #[test]
    fn over_arrival_is_reported() {
        let mut g = Graph::new();
        let a = g.add_module(Passthrough::new());
        let out = OutputRef { module: a, index: 0 };
        // no consumers linked: a single arrival already exceeds consumers.len() == 0
        let err = g
            .receive_backprop(out, Accumulator::unbounded_seed(scalar(1.0)))
            .unwrap_err();
        assert!(matches!(err, GraphError::OverArrival { .. }));
    }
}

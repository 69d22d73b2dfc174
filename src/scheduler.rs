//! The iterative scheduler: drives foreprop, backprop, and invalidate
//! across a graph from a starting module, using a FIFO work queue instead
//! of recursion.
//!
//! A chain of Kalman steps can be arbitrarily long, and a naive recursive
//! traversal (follow every consumer/source as soon as it's discovered)
//! would grow the call stack with chain depth. Each of the three
//! operations below instead dequeues one ready module, dispatches it, and
//! enqueues whatever became ready as a result — the same queue-driven shape
//! regardless of which operation is running.

use tracing::debug;

use crate::graph::{Graph, GraphError, ModuleId};
use std::collections::VecDeque;

/// Runs forward propagation starting from `start`, and from every module
/// that becomes foreprop-ready as a result, until no module has any
/// forward work left, or a module's own forward computation fails (e.g. a
/// Cholesky factorization of a non-SPD matrix).
pub fn run_foreprop(graph: &mut Graph, start: ModuleId) -> Result<(), GraphError> {
    let mut queue = VecDeque::new();
    queue.push_back(start);
    let mut steps = 0usize;
    while let Some(id) = queue.pop_front() {
        let ready = graph.dispatch_foreprop(id)?;
        queue.extend(ready);
        steps += 1;
    }
    debug!(steps, "foreprop pass complete");
    Ok(())
}

/// Runs backpropagation starting from `start` (typically a sink or cost
/// module) until the frontier empties, or returns the first error raised
/// by any module along the way.
///
/// On error the traversal stops immediately; the graph is left with
/// whatever partial accumulators were written before the failing
/// dispatch — a consistent but incomplete state, exactly mirroring a
/// partial forward pass.
pub fn run_backprop(graph: &mut Graph, start: ModuleId) -> Result<(), GraphError> {
    let mut queue = VecDeque::new();
    queue.push_back(start);
    let mut steps = 0usize;
    while let Some(id) = queue.pop_front() {
        let ready = graph.dispatch_backprop(id)?;
        queue.extend(ready);
        steps += 1;
    }
    debug!(steps, "backprop pass complete");
    Ok(())
}

/// Runs invalidation starting from `start`, clearing every port reachable
/// from it and propagating until the frontier empties.
pub fn run_invalidate(graph: &mut Graph, start: ModuleId) {
    let mut queue = VecDeque::new();
    queue.push_back(start);
    let mut steps = 0usize;
    while let Some(id) = queue.pop_front() {
        let ready = graph.dispatch_invalidate(id);
        queue.extend(ready);
        steps += 1;
    }
    debug!(steps, "invalidate pass complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InputRef, ModuleCore, ModuleImpl, OutputRef};
    use crate::matrix::scalar;

    struct Double {
        core: ModuleCore,
    }

    impl Double {
        fn new() -> Box<dyn ModuleImpl> {
            Box::new(Self {
                core: ModuleCore::new(1, 1),
            })
        }
    }

    impl ModuleImpl for Double {
        fn core(&self) -> &ModuleCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }
        fn name(&self) -> &'static str {
            "double"
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
            Ok(graph.emit(OutputRef { module: id, index: 0 }, v * 2.0))
        }
        fn backprop(&mut self, _graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
            Ok(vec![])
        }
    }

    #[test]
    fn foreprop_runs_a_chain_to_completion() {
        let mut g = Graph::new();
        let a = g.add_module(Double::new());
        let b = g.add_module(Double::new());
        let c = g.add_module(Double::new());
        g.link(InputRef { module: b, index: 0 }, OutputRef { module: a, index: 0 }).unwrap();
        g.link(InputRef { module: c, index: 0 }, OutputRef { module: b, index: 0 }).unwrap();
        g.set_input_value(InputRef { module: a, index: 0 }, scalar(1.0));
        run_foreprop(&mut g, a).unwrap();
        assert_eq!(g.output_value(OutputRef { module: c, index: 0 }), Some(&scalar(8.0)));
    }
}

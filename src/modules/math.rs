//! Elementary arithmetic modules: addition, difference, matrix product,
//! and elementwise exponential.

use crate::graph::{Graph, GraphError, InputRef, ModuleCore, ModuleId, ModuleImpl, OutputRef};
use crate::matrix::{kron, Mat};

const LHS: usize = 0;
const RHS: usize = 1;
const OUT: usize = 0;

/// `out = a + b`. Both per-input Jacobians are the identity, so
/// backpropagation is a pure pass-through to each operand.
pub struct AdditionModule {
    core: ModuleCore,
}

impl AdditionModule {
    /// Builds an addition module.
    pub fn new() -> Box<dyn ModuleImpl> {
        Box::new(Self { core: ModuleCore::new(2, 1) })
    }
}

impl ModuleImpl for AdditionModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "addition"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let a = graph.input_value(InputRef { module: id, index: LHS }).unwrap().clone();
        let b = graph.input_value(InputRef { module: id, index: RHS }).unwrap().clone();
        Ok(graph.emit(OutputRef { module: id, index: OUT }, a + b))
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let out = OutputRef { module: id, index: OUT };
        let mut ready = Vec::new();
        if let Some(acc) = graph.chain_backprop(out, None)? {
            ready.extend(graph.accept_backprop(InputRef { module: id, index: LHS }, acc.clone())?);
            ready.extend(graph.accept_backprop(InputRef { module: id, index: RHS }, acc)?);
        }
        Ok(ready)
    }
}

/// A typed handle to an [`AdditionModule`].
#[derive(Copy, Clone, Debug)]
pub struct AdditionHandle(pub ModuleId);

impl AdditionHandle {
    /// The minuend-side input.
    pub fn lhs(&self) -> InputRef {
        InputRef { module: self.0, index: LHS }
    }
    /// The subtrahend-side input.
    pub fn rhs(&self) -> InputRef {
        InputRef { module: self.0, index: RHS }
    }
    /// The module's output.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: OUT }
    }
}

/// Adds an [`AdditionModule`] to `graph`.
pub fn add_addition(graph: &mut Graph) -> AdditionHandle {
    AdditionHandle(graph.add_module(AdditionModule::new()))
}

/// `out = a - b`. The Jacobian with respect to `a` is the identity; with
/// respect to `b` it is the negated identity.
pub struct DifferenceModule {
    core: ModuleCore,
}

impl DifferenceModule {
    /// Builds a difference module.
    pub fn new() -> Box<dyn ModuleImpl> {
        Box::new(Self { core: ModuleCore::new(2, 1) })
    }
}

impl ModuleImpl for DifferenceModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "difference"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let a = graph.input_value(InputRef { module: id, index: LHS }).unwrap().clone();
        let b = graph.input_value(InputRef { module: id, index: RHS }).unwrap().clone();
        Ok(graph.emit(OutputRef { module: id, index: OUT }, a - b))
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let out = OutputRef { module: id, index: OUT };
        let mut ready = Vec::new();
        if let Some(acc) = graph.chain_backprop(out, None)? {
            ready.extend(graph.accept_backprop(InputRef { module: id, index: LHS }, acc.clone())?);
            let n = acc_out_dim(&acc);
            let neg = acc.mul_right(&(-Mat::identity(n, n)))?;
            ready.extend(graph.accept_backprop(InputRef { module: id, index: RHS }, neg)?);
        }
        Ok(ready)
    }
}

// `Accumulator` does not expose its held Jacobian's column count (the
// output-port dimension it is indexed over) directly; negating it is done
// via `mul_right` against `-I`, sized from the retrieved Jacobian instead
// of threading a new accumulator method just for this one use site.
fn acc_out_dim(acc: &crate::accumulator::Accumulator) -> usize {
    match acc.retrieve() {
        crate::accumulator::Jacobian::Zero => 0,
        crate::accumulator::Jacobian::Value(m) => m.ncols(),
    }
}

/// A typed handle to a [`DifferenceModule`].
#[derive(Copy, Clone, Debug)]
pub struct DifferenceHandle(pub ModuleId);

impl DifferenceHandle {
    /// The minuend input.
    pub fn lhs(&self) -> InputRef {
        InputRef { module: self.0, index: LHS }
    }
    /// The subtrahend input.
    pub fn rhs(&self) -> InputRef {
        InputRef { module: self.0, index: RHS }
    }
    /// The module's output.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: OUT }
    }
}

/// Adds a [`DifferenceModule`] to `graph`.
pub fn add_difference(graph: &mut Graph) -> DifferenceHandle {
    DifferenceHandle(graph.add_module(DifferenceModule::new()))
}

/// `out = A * B`, dense matrix product. The per-input Jacobians follow the
/// standard Kronecker identities for `vec(A*B)`:
/// `d vec(out)/d vec(A) = Bᵀ ⊗ I_m` and `d vec(out)/d vec(B) = I_n ⊗ A`,
/// where `A` is `m x k` and `B` is `k x n`.
pub struct MatrixProductModule {
    core: ModuleCore,
}

impl MatrixProductModule {
    /// Builds a matrix product module.
    pub fn new() -> Box<dyn ModuleImpl> {
        Box::new(Self { core: ModuleCore::new(2, 1) })
    }
}

impl ModuleImpl for MatrixProductModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "matrix_product"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let a = graph.input_value(InputRef { module: id, index: LHS }).unwrap().clone();
        let b = graph.input_value(InputRef { module: id, index: RHS }).unwrap().clone();
        let out = &a * &b;
        Ok(graph.emit(OutputRef { module: id, index: OUT }, out))
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let out_ref = OutputRef { module: id, index: OUT };
        let Some(acc) = graph.accumulator_of(out_ref).cloned() else {
            return Ok(Vec::new());
        };
        let a = graph.input_value(InputRef { module: id, index: LHS }).unwrap().clone();
        let b = graph.input_value(InputRef { module: id, index: RHS }).unwrap().clone();
        let m = a.nrows();
        let n = b.ncols();

        let da = acc.mul_right(&kron(&b.transpose(), &Mat::identity(m, m)))?;
        let db = acc.mul_right(&kron(&Mat::identity(n, n), &a))?;

        let mut ready = Vec::new();
        ready.extend(graph.accept_backprop(InputRef { module: id, index: LHS }, da)?);
        ready.extend(graph.accept_backprop(InputRef { module: id, index: RHS }, db)?);
        Ok(ready)
    }
}

/// A typed handle to a [`MatrixProductModule`].
#[derive(Copy, Clone, Debug)]
pub struct MatrixProductHandle(pub ModuleId);

impl MatrixProductHandle {
    /// The left factor.
    pub fn lhs(&self) -> InputRef {
        InputRef { module: self.0, index: LHS }
    }
    /// The right factor.
    pub fn rhs(&self) -> InputRef {
        InputRef { module: self.0, index: RHS }
    }
    /// The module's output.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: OUT }
    }
}

/// Adds a [`MatrixProductModule`] to `graph`.
pub fn add_matrix_product(graph: &mut Graph) -> MatrixProductHandle {
    MatrixProductHandle(graph.add_module(MatrixProductModule::new()))
}

/// Elementwise `out = exp(x)`. The Jacobian is diagonal:
/// `d vec(out)/d vec(x) = diag(exp(x))`.
pub struct ExponentialModule {
    core: ModuleCore,
}

impl ExponentialModule {
    /// Builds an exponential module.
    pub fn new() -> Box<dyn ModuleImpl> {
        Box::new(Self { core: ModuleCore::new(1, 1) })
    }
}

impl ModuleImpl for ExponentialModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "exponential"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let x = graph.input_value(InputRef { module: id, index: 0 }).unwrap().clone();
        let out = x.map(f64::exp);
        Ok(graph.emit(OutputRef { module: id, index: OUT }, out))
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let out_ref = OutputRef { module: id, index: OUT };
        let exp_x = match graph.output_value(out_ref) {
            Some(v) => v.clone(),
            None => return Ok(Vec::new()),
        };
        let jac = Mat::from_diagonal(&exp_x.column(0).into_owned());
        if let Some(acc) = graph.chain_backprop(out_ref, Some(&jac))? {
            return graph.accept_backprop(InputRef { module: id, index: 0 }, acc);
        }
        Ok(Vec::new())
    }
}

/// A typed handle to an [`ExponentialModule`].
#[derive(Copy, Clone, Debug)]
pub struct ExponentialHandle(pub ModuleId);

impl ExponentialHandle {
    /// The module's input.
    pub fn input(&self) -> InputRef {
        InputRef { module: self.0, index: 0 }
    }
    /// The module's output.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: OUT }
    }
}

/// Adds an [`ExponentialModule`] to `graph`.
pub fn add_exponential(graph: &mut Graph) -> ExponentialHandle {
    ExponentialHandle(graph.add_module(ExponentialModule::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{scalar, vector};
    use crate::modules::basic::add_constant;
    use crate::scheduler::run_foreprop;

    #[test]
    fn addition_sums_inputs() {
        let mut g = Graph::new();
        let a = add_constant(&mut g, scalar(2.0));
        let b = add_constant(&mut g, scalar(3.0));
        let add = add_addition(&mut g);
        g.link(add.lhs(), a.out()).unwrap();
        g.link(add.rhs(), b.out()).unwrap();
        run_foreprop(&mut g, a.0).unwrap();
        run_foreprop(&mut g, b.0).unwrap();
        assert_eq!(g.output_value(add.out()), Some(&scalar(5.0)));
    }

    #[test]
    fn matrix_product_computes_forward_value() {
        let mut g = Graph::new();
        let a = add_constant(&mut g, Mat::from_row_slice(1, 2, &[1.0, 2.0]));
        let b = add_constant(&mut g, vector(&[3.0, 4.0]));
        let mp = add_matrix_product(&mut g);
        g.link(mp.lhs(), a.out()).unwrap();
        g.link(mp.rhs(), b.out()).unwrap();
        run_foreprop(&mut g, a.0).unwrap();
        run_foreprop(&mut g, b.0).unwrap();
        assert_eq!(g.output_value(mp.out()), Some(&scalar(11.0)));
    }

    #[test]
    fn exponential_matches_elementwise_exp() {
        let mut g = Graph::new();
        let x = add_constant(&mut g, vector(&[0.0, 1.0]));
        let e = add_exponential(&mut g);
        g.link(e.input(), x.out()).unwrap();
        run_foreprop(&mut g, x.0).unwrap();
        let out = g.output_value(e.out()).unwrap();
        assert!((out[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((out[(1, 0)] - std::f64::consts::E).abs() < 1e-12);
    }
}

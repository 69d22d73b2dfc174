//! Reshape modules: linear and structured maps from a packed parameter
//! vector into a full matrix.

use crate::graph::{Graph, GraphError, InputRef, ModuleCore, ModuleId, ModuleImpl, OutputRef};
use crate::matrix::{commutation, kron, Mat};

const OUT: usize = 0;

/// `out = diag(v)`: embeds an `n x 1` vector as the diagonal of an
/// `n x n` matrix. The Jacobian `d vec(out)/d v` is the `n^2 x n` selector
/// that places entry `j` of `v` at the `(j, j)` position of `out`.
pub struct DiagonalReshapeModule {
    core: ModuleCore,
    n: usize,
}

impl DiagonalReshapeModule {
    /// Builds a diagonal-reshape module for `n x 1` inputs.
    pub fn new(n: usize) -> Box<dyn ModuleImpl> {
        Box::new(Self {
            core: ModuleCore::new(1, 1),
            n,
        })
    }
}

fn diagonal_selector(n: usize) -> Mat {
    let mut s = Mat::zeros(n * n, n);
    for j in 0..n {
        s[(j + j * n, j)] = 1.0;
    }
    s
}

impl ModuleImpl for DiagonalReshapeModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "diagonal_reshape"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let v = graph.input_value(InputRef { module: id, index: 0 }).unwrap().clone();
        let out = Mat::from_diagonal(&v.column(0).into_owned());
        Ok(graph.emit(OutputRef { module: id, index: OUT }, out))
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let out_ref = OutputRef { module: id, index: OUT };
        let jac = diagonal_selector(self.n);
        if let Some(acc) = graph.chain_backprop(out_ref, Some(&jac))? {
            return graph.accept_backprop(InputRef { module: id, index: 0 }, acc);
        }
        Ok(Vec::new())
    }
}

/// A typed handle to a [`DiagonalReshapeModule`].
#[derive(Copy, Clone, Debug)]
pub struct DiagonalReshapeHandle(pub ModuleId);

impl DiagonalReshapeHandle {
    /// The packed-vector input.
    pub fn input(&self) -> InputRef {
        InputRef { module: self.0, index: 0 }
    }
    /// The diagonal matrix output.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: OUT }
    }
}

/// Adds a [`DiagonalReshapeModule`] to `graph`.
pub fn add_diagonal_reshape(graph: &mut Graph, n: usize) -> DiagonalReshapeHandle {
    DiagonalReshapeHandle(graph.add_module(DiagonalReshapeModule::new(n)))
}

const D_IN: usize = 0;
const L_IN: usize = 1;

/// Column-major indices of the strict lower triangle of an `n x n`
/// matrix, in the order the packed `l` input is expected to list them:
/// column 0's entries below the diagonal first, then column 1's, and
/// so on.
fn strict_lower_positions(n: usize) -> Vec<(usize, usize)> {
    let mut positions = Vec::with_capacity(n * (n.saturating_sub(1)) / 2);
    for j in 0..n {
        for i in (j + 1)..n {
            positions.push((i, j));
        }
    }
    positions
}

fn assemble_lower(d: &Mat, l: &Mat, n: usize) -> Mat {
    let mut out = Mat::zeros(n, n);
    for j in 0..n {
        out[(j, j)] = d[(j, 0)];
    }
    for (idx, (i, j)) in strict_lower_positions(n).into_iter().enumerate() {
        out[(i, j)] = l[(idx, 0)];
    }
    out
}

/// Assembles a lower-triangular `L` from a diagonal vector `d` (length
/// `n`) and a strict-lower vector `l` (length `n(n-1)/2`, column-major
/// within the strict lower triangle), and emits the symmetric
/// positive-definite matrix `out = L * Lᵀ`. Used together with
/// [`crate::modules::math::ExponentialModule`] (to keep `d` positive) to
/// parameterize a constant-PSD covariance from an unconstrained
/// parameter vector (see [`crate::param`]).
///
/// The Jacobian of `vec(L Lᵀ)` with respect to `vec(L)` is
/// `(L ⊗ I_n) + (I_n ⊗ L) T_{n,n}`, where `T` is the commutation matrix
/// (this is the product-rule expansion of `vec(L·Lᵀ)`: the first term
/// comes from perturbing the left factor, the second — routed through
/// `T` since it perturbs the right, transposed factor — from
/// perturbing the right). `d out/d d` and `d out/d l` are this Jacobian
/// restricted to the columns `vec(L)` devotes to the diagonal and
/// strict-lower entries respectively.
pub struct CholeskyReshapeModule {
    core: ModuleCore,
    n: usize,
}

impl CholeskyReshapeModule {
    /// Builds a Cholesky-reshape module producing an `n x n` output from
    /// a length-`n` diagonal input and a length-`n(n-1)/2` strict-lower
    /// input.
    pub fn new(n: usize) -> Box<dyn ModuleImpl> {
        Box::new(Self {
            core: ModuleCore::new(2, 1),
            n,
        })
    }

    /// The strict-lower input's required length.
    pub fn strict_lower_len(n: usize) -> usize {
        n * (n.saturating_sub(1)) / 2
    }
}

impl ModuleImpl for CholeskyReshapeModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }
    fn name(&self) -> &'static str {
        "cholesky_reshape"
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn foreprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let d = graph.input_value(InputRef { module: id, index: D_IN }).unwrap().clone();
        let l_in = graph.input_value(InputRef { module: id, index: L_IN }).unwrap().clone();
        let l = assemble_lower(&d, &l_in, self.n);
        let out = &l * l.transpose();
        Ok(graph.emit(OutputRef { module: id, index: OUT }, out))
    }
    fn backprop(&mut self, graph: &mut Graph) -> Result<Vec<ModuleId>, GraphError> {
        let id = self.core.id();
        let d_input = InputRef { module: id, index: D_IN };
        let l_input = InputRef { module: id, index: L_IN };
        let out_ref = OutputRef { module: id, index: OUT };
        let n = self.n;
        let d = graph.input_value(d_input).unwrap().clone();
        let l_in = graph.input_value(l_input).unwrap().clone();
        let l = assemble_lower(&d, &l_in, n);
        let eye = Mat::identity(n, n);
        let full = kron(&l, &eye) + kron(&eye, &l) * commutation(n, n);

        let diag_cols: Vec<usize> = (0..n).map(|j| j + j * n).collect();
        let lower_cols: Vec<usize> = strict_lower_positions(n).iter().map(|(i, j)| i + j * n).collect();

        let mut ready = Vec::new();
        let d_jac = full.select_columns(diag_cols.iter());
        if let Some(acc) = graph.chain_backprop(out_ref, Some(&d_jac))? {
            ready.extend(graph.accept_backprop(d_input, acc)?);
        }
        let l_jac = full.select_columns(lower_cols.iter());
        if let Some(acc) = graph.chain_backprop(out_ref, Some(&l_jac))? {
            ready.extend(graph.accept_backprop(l_input, acc)?);
        }
        Ok(ready)
    }
}

/// A typed handle to a [`CholeskyReshapeModule`].
#[derive(Copy, Clone, Debug)]
pub struct CholeskyReshapeHandle(pub ModuleId);

impl CholeskyReshapeHandle {
    /// The diagonal-vector input.
    pub fn d(&self) -> InputRef {
        InputRef { module: self.0, index: D_IN }
    }
    /// The strict-lower-vector input.
    pub fn l(&self) -> InputRef {
        InputRef { module: self.0, index: L_IN }
    }
    /// The SPD matrix output.
    pub fn out(&self) -> OutputRef {
        OutputRef { module: self.0, index: OUT }
    }
}

/// Adds a [`CholeskyReshapeModule`] to `graph`.
pub fn add_cholesky_reshape(graph: &mut Graph, n: usize) -> CholeskyReshapeHandle {
    CholeskyReshapeHandle(graph.add_module(CholeskyReshapeModule::new(n)))
}

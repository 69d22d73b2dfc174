//! Crate root: public surface and module map for a modular reverse-mode
//! automatic-differentiation engine specialized for Kalman-filter chains.
//!
//! This module is the single canonical entry point for downstream users.
//! It re-exports the pieces most callers need — the graph arena, the
//! scheduler entry points, the accumulator algebra, and the chain
//! assembly façade — so `use modprop::{Graph, TruncationPolicy, ...}`
//! covers the common path without reaching into submodules.
//!
//! ## Invariants
//!
//! - **Column-major layout.** Every `vec(_)` flattening and Kronecker
//!   identity in this crate assumes column-major matrix storage, which is
//!   also `nalgebra::DMatrix`'s native layout. Mixing conventions would
//!   silently corrupt every Jacobian; see [`matrix`] for the primitives
//!   that enforce this throughout.
//! - **No recursion.** The scheduler in [`scheduler`] drives every pass —
//!   forward, backward, invalidate — from an explicit FIFO queue, so a
//!   chain of arbitrary depth never grows the call stack.
//! - **Deep-copy accumulators.** Gradients flowing through [`accumulator`]
//!   are owned by value at each port; concurrent branches of the graph
//!   never alias each other's accumulated Jacobian.
//!
//! Any violation of these invariants surfaces as a typed error — never a
//! panic or silent corruption — via the `thiserror` enums defined next to
//! the code that raises them ([`matrix::MatrixError`],
//! [`accumulator::AccumulatorError`], [`graph::GraphError`],
//! [`chain::ChainError`], [`param::ParamError`]).

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Dense matrix primitives: `vec`/`unvec`, Kronecker products, the
/// commutation matrix, and Cholesky-based solves.
pub mod matrix;
/// The two accumulator variants (unbounded and depth-truncated) and
/// their merge/chain algebra.
pub mod accumulator;
/// The port/module arena: `Graph`, `ModuleImpl`, and the wiring/dispatch
/// primitives every module and the scheduler build on.
pub mod graph;
/// The FIFO-driven foreprop/backprop/invalidate scheduler.
pub mod scheduler;
/// The standard module library: leaves, arithmetic, reductions,
/// reshapes, the Kalman predict/update pair, and the log-likelihood cost.
pub mod modules;
/// Chain assembly façade: wires repeated Kalman steps into one
/// differentiable mean log-likelihood.
pub mod chain;
/// Constant-PSD covariance parameterization used to feed a chain's
/// shared process/observation noise sources.
pub mod param;

pub use crate::accumulator::{Accumulator, Jacobian, TruncationPolicy};
pub use crate::chain::{Chain, ChainError, ChainSource, ParamSource};
pub use crate::graph::{Graph, GraphError, InputRef, ModuleId, OutputRef};
pub use crate::matrix::{Mat, MatrixError};
pub use crate::param::{ConstantPsd, ParamError};

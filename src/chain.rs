//! Assembles repeated Kalman predict/update steps into a single
//! differentiable chain exposing one scalar: the mean per-step
//! observation log-likelihood, as a function of the shared transition
//! and observation noise covariances.
//!
//! Each call to [`Chain::add_predict`]/[`Chain::add_update`] appends a
//! step, wiring
//! `x_in`/`P_in` from the previous step's outputs and `Q_in`/`R_in` from
//! the shared covariance sources, and feeds the step's log-likelihood
//! into a shared [`MeanModule`](crate::modules::reduce::MeanModule)
//! terminated by a sink.

use thiserror::Error;

use crate::accumulator::TruncationPolicy;
use crate::graph::{Graph, GraphError, ModuleId, OutputRef};
use crate::matrix::{scalar, vector, Mat};
use crate::modules::basic::{add_sink, ConstantHandle, SinkHandle};
use crate::modules::cost::{add_log_likelihood, LogLikelihoodHandle};
use crate::modules::kalman::{add_predict, add_update, PredictHandle, UpdateHandle};
use crate::modules::reduce::{add_mean, MeanHandle};
use crate::scheduler::{run_backprop, run_foreprop, run_invalidate};

/// Errors raised assembling or driving a chain.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChainError {
    /// A graph wiring or traversal error surfaced while driving the chain.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// [`ParamSource::set_theta`] received a vector whose length doesn't
    /// match the source's own parameter count.
    #[error("theta dimension mismatch: expected {expected}, got {got}")]
    ParamDimensionMismatch {
        /// The source's own parameter count.
        expected: usize,
        /// Length of the vector actually supplied.
        got: usize,
    },
}

/// Anything that can serve as one of a chain's four roots (`x0`, `P0`,
/// `Q`, `R`): a single graph output, plus the means to drive a forward
/// pass or invalidation starting from whatever leaf module(s) feed it.
/// A plain [`ConstantHandle`] is the simplest implementation; a
/// [`crate::param::ConstantPsd`] composes several modules behind the
/// same interface.
pub trait ChainSource {
    /// The source's output port, linked into the chain.
    fn out(&self) -> OutputRef;
    /// Runs a forward pass starting at this source's own root(s).
    fn foreprop(&self, graph: &mut Graph) -> Result<(), GraphError>;
    /// Invalidates this source's own root(s).
    fn invalidate(&self, graph: &mut Graph);
}

/// A [`ChainSource`] that additionally exposes a packed, settable
/// parameter vector and the gradient the most recent backward pass
/// accumulated against it — the shape required of the chain's `Q_src`
/// and `R_src`.
pub trait ParamSource: ChainSource {
    /// The source's current packed parameter vector.
    fn theta(&self, graph: &mut Graph) -> Vec<f64>;
    /// Overwrites the packed parameter vector. Implementations invalidate
    /// the source so the change takes effect on the next forward pass.
    fn set_theta(&self, graph: &mut Graph, theta: &[f64]) -> Result<(), ChainError>;
    /// The gradient of the chain's objective with respect to this
    /// source's raw (pre-transform) parameter vector, after a backward
    /// pass. Zero (one per parameter) if no contribution has arrived.
    fn backprop_value(&self, graph: &Graph) -> Vec<f64>;
}

impl ChainSource for ConstantHandle {
    fn out(&self) -> OutputRef {
        ConstantHandle::out(self)
    }
    fn foreprop(&self, graph: &mut Graph) -> Result<(), GraphError> {
        run_foreprop(graph, self.0)
    }
    fn invalidate(&self, graph: &mut Graph) {
        run_invalidate(graph, self.0);
    }
}

/// A sequentially-assembled Kalman filter chain: `K` (Predict, Update)
/// pairs sharing one transition-noise and one observation-noise source,
/// reduced to a single mean log-likelihood.
pub struct Chain {
    x0: Box<dyn ChainSource>,
    p0: Box<dyn ChainSource>,
    q_src: Box<dyn ParamSource>,
    r_src: Box<dyn ParamSource>,
    mean: MeanHandle,
    sink: SinkHandle,
    predicts: Vec<PredictHandle>,
    updates: Vec<UpdateHandle>,
    likelihoods: Vec<LogLikelihoodHandle>,
    last_x: OutputRef,
    last_p: OutputRef,
}

impl Chain {
    /// Starts a new, empty chain rooted at the given initial state,
    /// initial covariance, and shared process/observation noise sources.
    pub fn new(
        graph: &mut Graph,
        x0: Box<dyn ChainSource>,
        p0: Box<dyn ChainSource>,
        q_src: Box<dyn ParamSource>,
        r_src: Box<dyn ParamSource>,
    ) -> Result<Self, ChainError> {
        let mean = add_mean(graph, 0);
        let sink = add_sink(graph);
        graph.link(sink.input(), mean.out())?;
        let last_x = x0.out();
        let last_p = p0.out();
        Ok(Self {
            x0,
            p0,
            q_src,
            r_src,
            mean,
            sink,
            predicts: Vec::new(),
            updates: Vec::new(),
            likelihoods: Vec::new(),
            last_x,
            last_p,
        })
    }

    /// Appends a Predict(`a`) step, wiring `x_in`/`P_in` from the
    /// previous step's outputs and `Q_in` from the shared source.
    pub fn add_predict(&mut self, graph: &mut Graph, a: Mat) -> Result<PredictHandle, ChainError> {
        let predict = add_predict(graph, a);
        graph.link(predict.x_in(), self.last_x)?;
        graph.link(predict.p_in(), self.last_p)?;
        graph.link(predict.q_in(), self.q_src.out())?;
        self.last_x = predict.x_out();
        self.last_p = predict.p_out();
        self.predicts.push(predict);
        Ok(predict)
    }

    /// Appends an Update(`c`, `y`) step, wiring `x_in`/`P_in` from the
    /// previous step's outputs and `R_in` from the shared source, and
    /// feeds its log-likelihood into the chain's mean reducer.
    pub fn add_update(
        &mut self,
        graph: &mut Graph,
        y: Mat,
        c: Mat,
    ) -> Result<(UpdateHandle, LogLikelihoodHandle), ChainError> {
        let update = add_update(graph, y, c);
        graph.link(update.x_in(), self.last_x)?;
        graph.link(update.p_in(), self.last_p)?;
        graph.link(update.r_in(), self.r_src.out())?;

        let ll = add_log_likelihood(graph);
        graph.link(ll.x(), update.v_out())?;
        graph.link(ll.s(), update.s_out())?;
        let mean_input = self.mean.create_input(graph);
        graph.link(mean_input, ll.out())?;

        self.last_x = update.x_out();
        self.last_p = update.p_out();
        self.updates.push(update);
        self.likelihoods.push(ll);
        Ok((update, ll))
    }

    /// Runs a forward pass over the four roots and returns the mean
    /// log-likelihood, or `None` if no update step has been added yet.
    pub fn foreprop(&mut self, graph: &mut Graph) -> Result<Option<Mat>, ChainError> {
        self.x0.foreprop(graph)?;
        self.p0.foreprop(graph)?;
        self.q_src.foreprop(graph)?;
        self.r_src.foreprop(graph)?;
        Ok(self.sink.value(graph).cloned())
    }

    /// Invalidates the four roots, clearing every downstream port.
    pub fn invalidate(&mut self, graph: &mut Graph) {
        self.x0.invalidate(graph);
        self.p0.invalidate(graph);
        self.q_src.invalidate(graph);
        self.r_src.invalidate(graph);
    }

    /// Seeds the sink with the scalar identity accumulator under `policy`
    /// and runs a backward pass, returning the concatenated gradient
    /// `[dQ_src/dtheta, dR_src/dtheta]`.
    pub fn backprop(&mut self, graph: &mut Graph, policy: TruncationPolicy) -> Result<Mat, ChainError> {
        let seed = policy.seed(scalar(1.0));
        self.sink.set_backprop_value(graph, seed);
        run_backprop(graph, self.sink.0)?;
        let mut combined = self.q_src.backprop_value(graph);
        combined.extend(self.r_src.backprop_value(graph));
        Ok(vector(&combined))
    }

    /// The chain's combined `(Q-params, R-params)` vector, concatenated
    /// in that order.
    pub fn theta(&self, graph: &mut Graph) -> Vec<f64> {
        let mut theta = self.q_src.theta(graph);
        theta.extend(self.r_src.theta(graph));
        theta
    }

    /// Splits `theta` into `(Q-params, R-params)` by the current sources'
    /// own lengths and writes each back, invalidating both sources.
    pub fn set_theta(&mut self, graph: &mut Graph, theta: &[f64]) -> Result<(), ChainError> {
        let n_q = self.q_src.theta(graph).len();
        let n_r = self.r_src.theta(graph).len();
        if n_q + n_r != theta.len() {
            return Err(ChainError::ParamDimensionMismatch {
                expected: n_q + n_r,
                got: theta.len(),
            });
        }
        self.q_src.set_theta(graph, &theta[..n_q])?;
        self.r_src.set_theta(graph, &theta[n_q..])?;
        Ok(())
    }

    /// The most recent mean log-likelihood, without re-running foreprop.
    pub fn mean_observation_likelihood(&self, graph: &Graph) -> Option<Mat> {
        self.sink.value(graph).cloned()
    }

    /// The latest step's posterior state estimate.
    pub fn latest_x(&self, graph: &Graph) -> Option<&Mat> {
        graph.output_value(self.last_x)
    }

    /// The latest step's posterior covariance estimate.
    pub fn latest_p(&self, graph: &Graph) -> Option<&Mat> {
        graph.output_value(self.last_p)
    }

    /// The chain's predict steps in construction order.
    pub fn predicts(&self) -> &[PredictHandle] {
        &self.predicts
    }

    /// The chain's update steps in construction order.
    pub fn updates(&self) -> &[UpdateHandle] {
        &self.updates
    }

    /// The module id of the chain's sink, for callers that want to drive
    /// the scheduler directly (e.g. in a custom finite-difference check).
    pub fn sink_id(&self) -> ModuleId {
        self.sink.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::basic::add_constant;
    use crate::param::ConstantPsd;

    fn small_chain(graph: &mut Graph) -> Chain {
        let x0 = Box::new(add_constant(graph, vector(&[0.0, 0.0])));
        let p0 = Box::new(add_constant(graph, Mat::identity(2, 2)));
        let q = Box::new(ConstantPsd::new(graph, &(Mat::identity(2, 2) * 0.1)).unwrap());
        let r = Box::new(ConstantPsd::new(graph, &(Mat::identity(2, 2) * 0.1)).unwrap());
        Chain::new(graph, x0, p0, q, r).unwrap()
    }

    #[test]
    fn two_step_chain_produces_a_scalar_likelihood() {
        let mut g = Graph::new();
        let mut chain = small_chain(&mut g);
        let a = Mat::identity(2, 2);
        let c = Mat::identity(2, 2);
        chain.add_predict(&mut g, a.clone()).unwrap();
        chain.add_update(&mut g, vector(&[1.0, 1.0]), c.clone()).unwrap();
        chain.add_predict(&mut g, a).unwrap();
        chain.add_update(&mut g, vector(&[1.1, 0.9]), c).unwrap();

        let ll = chain.foreprop(&mut g).unwrap().expect("two updates were added");
        assert_eq!(ll.nrows(), 1);
        assert_eq!(ll.ncols(), 1);
    }

    #[test]
    fn backprop_matches_theta_dimension() {
        let mut g = Graph::new();
        let mut chain = small_chain(&mut g);
        chain.add_predict(&mut g, Mat::identity(2, 2)).unwrap();
        chain
            .add_update(&mut g, vector(&[1.0, 1.0]), Mat::identity(2, 2))
            .unwrap();
        chain.foreprop(&mut g).unwrap();

        let grad = chain.backprop(&mut g, TruncationPolicy::Unbounded).unwrap();
        let theta = chain.theta(&mut g);
        assert_eq!(grad.nrows(), theta.len());
        assert_eq!(grad.ncols(), 1);
    }

    #[test]
    fn set_theta_rejects_wrong_length() {
        let mut g = Graph::new();
        let mut chain = small_chain(&mut g);
        let theta = chain.theta(&mut g);
        let bad = vec![0.0; theta.len() + 1];
        assert!(matches!(
            chain.set_theta(&mut g, &bad),
            Err(ChainError::ParamDimensionMismatch { .. })
        ));
    }
}

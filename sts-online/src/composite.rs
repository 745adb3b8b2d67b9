//! Tree log-likelihood composed of the engine's sequence likelihood and
//! auxiliary terms (priors, constraints) evaluated on the same tree.

use log::debug;
use sts_core::{Result, StsError};

use crate::backend::{CpuBackend, LikelihoodBackend};
use crate::config::OptimizerConfig;
use crate::engine::PartialLikelihoodEngine;
use crate::rates::RateDistribution;
use crate::subst_model::SubstitutionModel;
use crate::tree::{NodeId, PhyloTree};
use crate::tripod::{EngineTripod, TripodOptimizer};

/// A side-effect-free log-likelihood contribution of a whole tree.
pub trait TreeLogLikelihood: Send + Sync {
    fn log_likelihood(&self, tree: &PhyloTree) -> f64;
}

impl<F> TreeLogLikelihood for F
where
    F: Fn(&PhyloTree) -> f64 + Send + Sync,
{
    fn log_likelihood(&self, tree: &PhyloTree) -> f64 {
        self(tree)
    }
}

/// Independent prior over branch lengths: the sum of a per-branch log
/// density over every edge.
pub struct BranchLengthPrior {
    log_density: Box<dyn Fn(f64) -> f64 + Send + Sync>,
}

impl BranchLengthPrior {
    pub fn new<F>(log_density: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Self {
            log_density: Box::new(log_density),
        }
    }

    /// Exponential prior with the given rate.
    pub fn exponential(rate: f64) -> Result<Self> {
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(StsError::InvalidInput(format!(
                "exponential rate must be positive, got {}",
                rate
            )));
        }
        let ln_rate = rate.ln();
        Ok(Self::new(move |t| {
            if t < 0.0 {
                f64::NEG_INFINITY
            } else {
                ln_rate - rate * t
            }
        }))
    }
}

impl TreeLogLikelihood for BranchLengthPrior {
    fn log_likelihood(&self, tree: &PhyloTree) -> f64 {
        tree.edges()
            .into_iter()
            .filter_map(|edge| tree.branch_length(edge).ok())
            .map(|t| (self.log_density)(t))
            .sum()
    }
}

/// Engine likelihood plus an ordered list of auxiliary terms.
pub struct CompositeLikelihood<B: LikelihoodBackend = CpuBackend> {
    engine: PartialLikelihoodEngine<B>,
    terms: Vec<Box<dyn TreeLogLikelihood>>,
}

impl<B: LikelihoodBackend> CompositeLikelihood<B> {
    pub fn new(engine: PartialLikelihoodEngine<B>) -> Self {
        Self {
            engine,
            terms: Vec::new(),
        }
    }

    /// Append an auxiliary term.
    pub fn add<T: TreeLogLikelihood + 'static>(&mut self, term: T) {
        self.terms.push(Box::new(term));
    }

    pub fn n_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn engine(&self) -> &PartialLikelihoodEngine<B> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PartialLikelihoodEngine<B> {
        &mut self.engine
    }

    /// Load `model` and `rates` and evaluate `tree`.
    pub fn initialize(
        &mut self,
        model: &dyn SubstitutionModel,
        rates: &RateDistribution,
        tree: &PhyloTree,
    ) -> Result<f64> {
        self.engine.load_substitution_model(model)?;
        self.engine.load_rate_distribution(rates)?;
        self.log_likelihood(tree)
    }

    /// Sum of the auxiliary terms alone.
    pub fn auxiliary_log_likelihood(&self, tree: &PhyloTree) -> f64 {
        self.terms.iter().map(|t| t.log_likelihood(tree)).sum()
    }

    /// Engine log-likelihood plus every auxiliary term.
    pub fn log_likelihood(&mut self, tree: &PhyloTree) -> Result<f64> {
        let engine = self.engine.calculate_log_likelihood(tree)?;
        Ok(engine + self.auxiliary_log_likelihood(tree))
    }

    /// For every edge of the evaluated tree, the best over `pendant_lengths`
    /// of the log-likelihood of attaching `leaf` at the edge midpoint, plus
    /// the auxiliary terms of the evaluated tree.
    pub fn edge_log_likelihoods(
        &mut self,
        leaf: &str,
        pendant_lengths: &[f64],
    ) -> Result<Vec<(NodeId, f64)>> {
        if pendant_lengths.is_empty() {
            return Err(StsError::InvalidInput(
                "at least one pendant length is required".into(),
            ));
        }
        let leaf_buffer = self.engine.attachable_leaf(leaf)?;
        let auxiliary = match self.engine.tree() {
            Some(tree) => self.auxiliary_log_likelihood(tree),
            None => return Err(StsError::Initialization("no tree has been evaluated".into())),
        };
        let mids = self.engine.mid_edge_partials()?;
        let mut out = Vec::with_capacity(mids.len());
        for (edge, partials) in mids {
            let mut best = f64::NEG_INFINITY;
            for &pendant in pendant_lengths {
                best = best.max(self.engine.log_dot_leaf(&partials, leaf_buffer, pendant)?);
            }
            out.push((edge, best + auxiliary));
        }
        debug!("scored {} candidate edges for {}", out.len(), leaf);
        Ok(out)
    }

    /// Tripod optimizer for attaching `leaf` to `edge` of the evaluated tree.
    ///
    /// # Errors
    ///
    /// [`StsError::InsufficientBuffers`] unless two scratch slots are free.
    pub fn create_optimizer(
        &mut self,
        edge: NodeId,
        leaf: &str,
        config: &OptimizerConfig,
    ) -> Result<TripodOptimizer<EngineTripod<'_, B>>> {
        let tripod = EngineTripod::new(&mut self.engine, edge, leaf)?;
        let d = tripod.edge_length()?;
        TripodOptimizer::new(tripod, d, config.clone())
    }
}

//! Proposal of an attachment point and branch lengths for a new leaf.
//!
//! One [`AttachmentMove::propose`] call picks an edge of the particle's
//! tree, a distal offset along it and a pendant length, each drawn from a
//! distribution whose log density is recorded so the SMC layer can weight
//! the proposal.

use std::sync::Arc;

use log::{debug, warn};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::Normal;
use sts_core::{normalize_log_weights, Result, StsError};

use crate::backend::{CpuBackend, LikelihoodBackend};
use crate::composite::CompositeLikelihood;
use crate::config::{AttachmentConfig, EdgeSelection};
use crate::lcfit;
use crate::numeric::truncated_normal_ln_pdf;
use crate::rates::RateDistribution;
use crate::rejection::CurveFitRejectionSampler;
use crate::subst_model::SubstitutionModel;
use crate::tree::{NodeId, PhyloTree};

/// State of one particle as seen by the move.
#[derive(Clone)]
pub struct TreeParticle {
    pub tree: PhyloTree,
    pub model: Arc<dyn SubstitutionModel>,
    pub rates: RateDistribution,
}

/// Where and how a new leaf attaches, with the log density of each choice.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttachmentProposal {
    /// Child node of the chosen edge.
    pub edge: NodeId,
    pub edge_length: f64,
    pub edge_log_density: f64,
    pub distal_length: f64,
    pub distal_log_density: f64,
    pub pendant_length: f64,
    pub pendant_log_density: f64,
    pub ml_distal_length: f64,
    pub ml_pendant_length: f64,
}

impl AttachmentProposal {
    /// Log density of the whole proposal.
    pub fn log_proposal_density(&self) -> f64 {
        self.edge_log_density + self.distal_log_density + self.pendant_log_density
    }

    /// `tree` with `leaf` attached as proposed; returns the new tree and the
    /// new leaf's id.
    pub fn apply(&self, tree: &PhyloTree, leaf: &str) -> Result<(PhyloTree, NodeId)> {
        tree.attach_leaf(self.edge, self.distal_length, self.pendant_length, leaf)
    }
}

/// Running counts of proposals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MoveStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Attachment proposal kernel over one composite likelihood.
pub struct AttachmentMove<B: LikelihoodBackend = CpuBackend> {
    likelihood: CompositeLikelihood<B>,
    config: AttachmentConfig,
    stats: MoveStats,
}

impl<B: LikelihoodBackend> AttachmentMove<B> {
    pub fn new(likelihood: CompositeLikelihood<B>, config: AttachmentConfig) -> Self {
        Self {
            likelihood,
            config,
            stats: MoveStats::default(),
        }
    }

    pub fn config(&self) -> &AttachmentConfig {
        &self.config
    }

    pub fn stats(&self) -> MoveStats {
        self.stats
    }

    pub fn likelihood(&self) -> &CompositeLikelihood<B> {
        &self.likelihood
    }

    pub fn likelihood_mut(&mut self) -> &mut CompositeLikelihood<B> {
        &mut self.likelihood
    }

    /// Propose an attachment of `leaf` to the particle's tree.
    pub fn propose<R: Rng + ?Sized>(
        &mut self,
        leaf: &str,
        particle: &TreeParticle,
        rng: &mut R,
    ) -> Result<AttachmentProposal> {
        self.stats.attempted += 1;
        match self.try_propose(leaf, particle, rng) {
            Ok(proposal) => {
                self.stats.succeeded += 1;
                debug!(
                    "proposed {} on edge {}: distal {:.5}, pendant {:.5}, log density {:.4}",
                    leaf,
                    proposal.edge,
                    proposal.distal_length,
                    proposal.pendant_length,
                    proposal.log_proposal_density()
                );
                Ok(proposal)
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!("attachment proposal for {} failed: {}", leaf, e);
                Err(e)
            }
        }
    }

    fn try_propose<R: Rng + ?Sized>(
        &mut self,
        leaf: &str,
        particle: &TreeParticle,
        rng: &mut R,
    ) -> Result<AttachmentProposal> {
        let Self {
            likelihood, config, ..
        } = self;
        likelihood.initialize(particle.model.as_ref(), &particle.rates, &particle.tree)?;
        let (edge, edge_log_density) = select_edge(likelihood, config, leaf, rng)?;
        let edge_length = particle.tree.branch_length(edge)?;

        let mut optimizer = likelihood.create_optimizer(edge, leaf, &config.optimizer)?;
        let max_iters = config.optimizer.max_iters;
        let pendant_start = optimizer.optimize_pendant(0.5 * edge_length, edge_length, max_iters)?;
        let ml_distal = optimizer.optimize_distal(0.5 * edge_length, pendant_start, max_iters)?;
        let ml_pendant = optimizer.optimize_pendant(ml_distal, pendant_start, max_iters)?;

        let (distal_length, distal_log_density) = sample_distal(
            rng,
            edge_length,
            ml_distal,
            config.min_edge_length,
            config.distal_max_draws,
        )?;

        let fitted = lcfit::fit(
            |pendant| optimizer.log_likelihood(distal_length, pendant),
            &config.sampler,
        )?;
        let sampler = CurveFitRejectionSampler::new(fitted.model, &config.sampler)?;
        let (pendant_length, pendant_log_density) = sampler.sample(rng)?;

        Ok(AttachmentProposal {
            edge,
            edge_length,
            edge_log_density,
            distal_length,
            distal_log_density,
            pendant_length,
            pendant_log_density,
            ml_distal_length: ml_distal,
            ml_pendant_length: ml_pendant,
        })
    }
}

/// Choose the attachment edge; returns it with its log selection
/// probability.
fn select_edge<B: LikelihoodBackend, R: Rng + ?Sized>(
    likelihood: &mut CompositeLikelihood<B>,
    config: &AttachmentConfig,
    leaf: &str,
    rng: &mut R,
) -> Result<(NodeId, f64)> {
    match config.edge_selection {
        EdgeSelection::Uniform => {
            let edges = likelihood
                .engine()
                .tree()
                .map(|t| t.edges())
                .unwrap_or_default();
            if edges.is_empty() {
                return Err(StsError::InvalidInput("tree has no edges".into()));
            }
            let i = rng.gen_range(0..edges.len());
            Ok((edges[i], -(edges.len() as f64).ln()))
        }
        EdgeSelection::LikelihoodWeighted => {
            let scored =
                likelihood.edge_log_likelihoods(leaf, &config.preselection_pendant_lengths)?;
            let log_weights: Vec<f64> = scored.iter().map(|&(_, ll)| ll).collect();
            let log_probs = normalize_log_weights(&log_weights)?;
            let probs: Vec<f64> = log_probs.iter().map(|lp| lp.to_prob()).collect();
            let dist = WeightedIndex::new(&probs)
                .map_err(|e| StsError::InvalidInput(format!("edge weights: {}", e)))?;
            let i = dist.sample(rng);
            Ok((scored[i].0, log_probs[i].0))
        }
    }
}

/// Distal offset from `Normal(ml, d/4)` truncated to `[0, d]`, with its log
/// density. Edges shorter than `min_edge_length` attach at offset 0 with log
/// density 0.
fn sample_distal<R: Rng + ?Sized>(
    rng: &mut R,
    edge_length: f64,
    ml_distal: f64,
    min_edge_length: f64,
    max_draws: usize,
) -> Result<(f64, f64)> {
    if edge_length < min_edge_length {
        return Ok((0.0, 0.0));
    }
    let sd = 0.25 * edge_length;
    let normal = Normal::new(ml_distal, sd)
        .map_err(|e| StsError::InvalidInput(format!("distal proposal: {}", e)))?;
    for _ in 0..max_draws {
        let x = normal.sample(rng);
        if (0.0..=edge_length).contains(&x) {
            return Ok((x, truncated_normal_ln_pdf(x, ml_distal, sd, 0.0, edge_length)));
        }
    }
    Err(StsError::Convergence(format!(
        "no distal length in [0, {}] after {} draws",
        edge_length, max_draws
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Alignment;
    use crate::engine::tests::{five_taxon_tree, jc_engine, six_taxon_alignment};
    use crate::engine::PartialLikelihoodEngine;
    use crate::subst_model::Jc69Model;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn particle(tree: PhyloTree) -> TreeParticle {
        TreeParticle {
            tree,
            model: Arc::new(Jc69Model::new()),
            rates: RateDistribution::constant(),
        }
    }

    fn mover(selection: EdgeSelection) -> AttachmentMove {
        let config = AttachmentConfig {
            edge_selection: selection,
            ..AttachmentConfig::default()
        };
        AttachmentMove::new(CompositeLikelihood::new(jc_engine(&six_taxon_alignment())), config)
    }

    #[test]
    fn short_edge_attaches_at_zero() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(sample_distal(&mut rng, 1e-9, 0.0, 1e-8, 10).unwrap(), (0.0, 0.0));
        assert_eq!(sample_distal(&mut rng, 0.0, 0.0, 1e-8, 10).unwrap(), (0.0, 0.0));
    }

    #[test]
    fn distal_draws_stay_on_edge() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let (x, log_density) = sample_distal(&mut rng, 0.4, 0.35, 1e-8, 1000).unwrap();
            assert!((0.0..=0.4).contains(&x));
            let expected = truncated_normal_ln_pdf(x, 0.35, 0.1, 0.0, 0.4);
            assert!((log_density - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn proposal_is_well_formed() {
        let tree = five_taxon_tree();
        let mut mv = mover(EdgeSelection::LikelihoodWeighted);
        let mut rng = StdRng::seed_from_u64(2024);
        let proposal = mv.propose("F", &particle(tree.clone()), &mut rng).unwrap();

        assert!(tree.edges().contains(&proposal.edge));
        assert_eq!(proposal.edge_length, tree.branch_length(proposal.edge).unwrap());
        assert!((0.0..=proposal.edge_length).contains(&proposal.distal_length));
        assert!(proposal.pendant_length >= 0.0);
        assert!(proposal.edge_log_density <= 0.0);
        for v in [
            proposal.distal_log_density,
            proposal.pendant_log_density,
            proposal.log_proposal_density(),
        ] {
            assert!(v.is_finite());
        }
        assert!(
            (proposal.log_proposal_density()
                - (proposal.edge_log_density
                    + proposal.distal_log_density
                    + proposal.pendant_log_density))
                .abs()
                < 1e-12
        );

        let (attached, leaf) = proposal.apply(&tree, "F").unwrap();
        assert_eq!(attached.leaf_count(), 6);
        assert_eq!(attached.get_node(leaf).unwrap().name.as_deref(), Some("F"));
        assert!((attached.branch_length(leaf).unwrap() - proposal.pendant_length).abs() < 1e-15);

        assert_eq!(
            mv.stats(),
            MoveStats {
                attempted: 1,
                succeeded: 1,
                failed: 0
            }
        );
        assert_eq!(mv.likelihood().engine().free_buffer_count(), 3);
    }

    #[test]
    fn same_seed_same_proposal() {
        let tree = five_taxon_tree();
        let a = mover(EdgeSelection::LikelihoodWeighted)
            .propose("F", &particle(tree.clone()), &mut StdRng::seed_from_u64(9))
            .unwrap();
        let b = mover(EdgeSelection::LikelihoodWeighted)
            .propose("F", &particle(tree), &mut StdRng::seed_from_u64(9))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn uniform_selection_density() {
        let tree = five_taxon_tree();
        let mut mv = mover(EdgeSelection::Uniform);
        let mut rng = StdRng::seed_from_u64(5);
        let mut edges = Vec::new();
        for _ in 0..3 {
            let (edge, log_density) = {
                mv.likelihood_mut()
                    .initialize(&Jc69Model::new(), &RateDistribution::constant(), &tree)
                    .unwrap();
                let AttachmentMove { likelihood, config, .. } = &mut mv;
                select_edge(likelihood, config, "F", &mut rng).unwrap()
            };
            assert!((log_density + 8f64.ln()).abs() < 1e-12);
            edges.push(edge);
        }
        assert!(edges.iter().all(|e| tree.edges().contains(e)));
    }

    #[test]
    fn weighted_selection_prefers_likely_edges() {
        let tree = five_taxon_tree();
        let mut mv = mover(EdgeSelection::LikelihoodWeighted);
        mv.likelihood_mut()
            .initialize(&Jc69Model::new(), &RateDistribution::constant(), &tree)
            .unwrap();
        let scored = mv
            .likelihood_mut()
            .edge_log_likelihoods("F", &[0.0, 0.5])
            .unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let AttachmentMove { likelihood, config, .. } = &mut mv;
        let (edge, log_density) = select_edge(likelihood, config, "F", &mut rng).unwrap();
        let total = sts_core::log_sum_exp(&scored.iter().map(|s| s.1).collect::<Vec<_>>());
        let score = scored.iter().find(|s| s.0 == edge).unwrap().1;
        assert!((log_density - (score - total)).abs() < 1e-9);
    }

    #[test]
    fn failures_are_counted() {
        let tree = five_taxon_tree();
        let mut mv = mover(EdgeSelection::Uniform);
        let mut rng = StdRng::seed_from_u64(1);
        // A is already in the tree.
        assert!(mv.propose("A", &particle(tree.clone()), &mut rng).is_err());
        assert!(mv.propose("nope", &particle(tree), &mut rng).is_err());
        assert_eq!(
            mv.stats(),
            MoveStats {
                attempted: 2,
                succeeded: 0,
                failed: 2
            }
        );
        assert_eq!(mv.likelihood().engine().free_buffer_count(), 3);
    }

    #[test]
    fn flat_pendant_curve_fails_the_proposal() {
        // Two sites move the log-likelihood by at most 2·ln 4 in any
        // pendant length, so the sampling bounds cannot be found.
        let aln = Alignment::from_pairs(&[("A", "AC"), ("B", "AC"), ("C", "GT"), ("D", "AC")])
            .unwrap();
        let mut tree = PhyloTree::new();
        let ab = tree.add_child(0, None, Some(0.1)).unwrap();
        tree.add_child(0, Some("C".into()), Some(0.2)).unwrap();
        tree.add_child(ab, Some("A".into()), Some(0.05)).unwrap();
        tree.add_child(ab, Some("B".into()), Some(0.05)).unwrap();

        let rates = RateDistribution::constant();
        let engine = PartialLikelihoodEngine::new(&aln, &Jc69Model::new(), &rates).unwrap();
        let mut mv =
            AttachmentMove::new(CompositeLikelihood::new(engine), AttachmentConfig::default());
        let mut rng = StdRng::seed_from_u64(5);
        let result = mv.propose("D", &particle(tree), &mut rng);
        assert!(matches!(result, Err(StsError::Convergence(_))), "{:?}", result);
        assert_eq!(
            mv.stats(),
            MoveStats {
                attempted: 1,
                succeeded: 0,
                failed: 1
            }
        );
        assert_eq!(mv.likelihood().engine().free_buffer_count(), 3);
    }

    #[test]
    fn works_with_gamma_rates() {
        let aln = six_taxon_alignment();
        let model = Jc69Model::new();
        let rates = RateDistribution::discrete_gamma(1.0, 4).unwrap();
        let engine = PartialLikelihoodEngine::new(&aln, &model, &rates).unwrap();
        let mut mv =
            AttachmentMove::new(CompositeLikelihood::new(engine), AttachmentConfig::default());
        let p = TreeParticle {
            tree: five_taxon_tree(),
            model: Arc::new(model),
            rates,
        };
        let proposal = mv.propose("F", &p, &mut StdRng::seed_from_u64(8)).unwrap();
        assert!(proposal.log_proposal_density().is_finite());
    }
}

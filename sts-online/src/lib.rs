//! Online Bayesian phylogenetic placement: incremental tree likelihoods and
//! attachment proposals for new leaves.
//!
//! - **Likelihood engine**: cached Felsenstein pruning over a buffer pool in [`engine`]
//! - **Backends**: batched partials kernel trait and CPU implementation in [`backend`]
//! - **Composite likelihood**: engine plus prior terms in [`composite`]
//! - **Branch-length optimization**: tripod optimizer in [`tripod`]
//! - **Pendant sampling**: BSM curve fit and rejection sampler in [`lcfit`] and [`rejection`]
//! - **Attachment move**: full proposal with log density in [`attachment`]
//!
//! # Quick start
//!
//! ```
//! use sts_online::alignment::Alignment;
//! use sts_online::engine::PartialLikelihoodEngine;
//! use sts_online::rates::RateDistribution;
//! use sts_online::subst_model::Jc69Model;
//! use sts_online::tree::PhyloTree;
//!
//! let alignment = Alignment::from_pairs(&[("A", "ACGT"), ("B", "ACGA"), ("C", "TCGA")]).unwrap();
//!
//! let mut tree = PhyloTree::new();
//! let ab = tree.add_child(0, None, Some(0.1)).unwrap();
//! tree.add_child(0, Some("C".into()), Some(0.2)).unwrap();
//! tree.add_child(ab, Some("A".into()), Some(0.05)).unwrap();
//! tree.add_child(ab, Some("B".into()), Some(0.05)).unwrap();
//!
//! let model = Jc69Model::new();
//! let rates = RateDistribution::discrete_gamma(0.5, 4).unwrap();
//! let mut engine = PartialLikelihoodEngine::new(&alignment, &model, &rates).unwrap();
//! let ll = engine.initialize(&model, &rates, &tree).unwrap();
//! assert!(ll < 0.0);
//!
//! // Nothing changed: every partial comes from the cache.
//! assert_eq!(engine.calculate_log_likelihood(&tree).unwrap(), ll);
//! assert_eq!(engine.metrics().snapshot().operations_skipped, 4);
//! ```

pub mod alignment;
pub mod attachment;
pub mod backend;
pub mod composite;
pub mod config;
pub mod engine;
pub mod lcfit;
pub mod likelihood_vector;
pub mod metrics;
pub mod models;
pub mod numeric;
pub mod rates;
pub mod rejection;
pub mod subst_model;
pub mod tree;
pub mod tripod;

pub use alignment::Alignment;
pub use attachment::{AttachmentMove, AttachmentProposal, MoveStats, TreeParticle};
pub use backend::{BackendDims, CpuBackend, LikelihoodBackend, Operation};
pub use composite::{BranchLengthPrior, CompositeLikelihood, TreeLogLikelihood};
pub use config::{AttachmentConfig, EdgeSelection, EngineConfig, OptimizerConfig, SamplerConfig};
pub use engine::{AttachmentLocation, PartialLikelihoodEngine, ScaledPartials};
pub use lcfit::{BsmModel, FitResult};
pub use likelihood_vector::LikelihoodVector;
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use rates::RateDistribution;
pub use rejection::CurveFitRejectionSampler;
pub use subst_model::{
    EigenDecomposition, GtrModel, Hky85Model, Jc69Model, PoissonProteinModel, SubstitutionModel,
};
pub use tree::{Node, NodeId, PhyloTree};
pub use tripod::{AttachmentLikelihood, EngineTripod, TripodOptimizer};

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use sts_core::Summarizable;

    /// Add two leaves one after the other, the second onto the tree the
    /// first proposal produced.
    #[test]
    fn sequential_placement() {
        let alignment = Alignment::from_pairs(&[
            ("A", "ACGTACGTAACCGGTTAAGCTTAGC"),
            ("B", "ACGTACGAAACCGGTTAAGCTTAGA"),
            ("C", "ACTTACGTTACCGCTTAACCTTCGA"),
            ("D", "GCGTAAGTAACAGGTTCAGCTAAGA"),
            ("E", "ACGTACGTAACCGGTTAAGCTTAGG"),
        ])
        .unwrap();
        let model: Arc<dyn SubstitutionModel> = Arc::new(Hky85Model::new(2.0, [0.25; 4]).unwrap());
        let rates = RateDistribution::constant();

        let mut tree = PhyloTree::new();
        let ab = tree.add_child(0, None, Some(0.1)).unwrap();
        tree.add_child(0, Some("C".into()), Some(0.2)).unwrap();
        tree.add_child(ab, Some("A".into()), Some(0.05)).unwrap();
        tree.add_child(ab, Some("B".into()), Some(0.08)).unwrap();

        let engine = PartialLikelihoodEngine::new(&alignment, model.as_ref(), &rates).unwrap();
        let mut mv =
            AttachmentMove::new(CompositeLikelihood::new(engine), AttachmentConfig::default());
        let mut rng = StdRng::seed_from_u64(31);

        for leaf in ["D", "E"] {
            let particle = TreeParticle {
                tree: tree.clone(),
                model: Arc::clone(&model),
                rates: rates.clone(),
            };
            let proposal = mv.propose(leaf, &particle, &mut rng).unwrap();
            assert!(proposal.log_proposal_density().is_finite());
            tree = proposal.apply(&tree, leaf).unwrap().0;
        }
        assert_eq!(tree.leaf_count(), 5);
        assert!(["A", "B", "C", "D", "E"]
            .iter()
            .all(|name| tree.leaf_by_name(name).is_some()));
        assert!(tree.validate_bifurcating().is_ok());
        assert!(tree.summary().contains("5 leaves"));
        assert_eq!(mv.stats().succeeded, 2);

        let ll = mv.likelihood_mut().log_likelihood(&tree).unwrap();
        assert!(ll.is_finite());
    }
}

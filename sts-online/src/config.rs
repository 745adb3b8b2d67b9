//! Tunables for the engine, the tripod optimizer, the curve-fit sampler and
//! the attachment move.

/// Backend options for [`crate::engine::PartialLikelihoodEngine`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Rescale partials per site to avoid underflow on deep trees.
    pub rescaling: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { rescaling: true }
    }
}

/// One-dimensional branch-length optimizer settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OptimizerConfig {
    /// Absolute tolerance on the branch length.
    pub tolerance: f64,
    /// Likelihood evaluations per optimization, endpoints excluded.
    pub max_iters: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            max_iters: 10,
        }
    }
}

/// Curve fit and rejection sampler settings for pendant branch lengths.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SamplerConfig {
    /// Initial branch lengths evaluated before fitting.
    pub trial_lengths: Vec<f64>,
    /// Extra points evaluated while bracketing the maximum.
    pub max_extra_points: usize,
    /// Levenberg–Marquardt iterations.
    pub fit_max_iters: usize,
    /// Log units below the maximum that delimit the sampling interval.
    pub ll_threshold: f64,
    /// Upper end of the right bound search.
    pub max_length: f64,
    /// Root finder iterations per bound.
    pub root_max_iters: usize,
    /// Largest accepted quadrature error estimate.
    pub integration_tolerance: f64,
    /// Panels the adaptive quadrature may split into.
    pub integration_max_panels: usize,
    /// Rejection sampling attempts before giving up.
    pub max_draws: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            trial_lengths: vec![0.1, 0.15, 0.5],
            max_extra_points: 8,
            fit_max_iters: 200,
            ll_threshold: 10.0,
            max_length: 10.0,
            root_max_iters: 100,
            integration_tolerance: 1e-3,
            integration_max_panels: 200,
            max_draws: 100_000,
        }
    }
}

/// How the attachment edge is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EdgeSelection {
    /// Softmax over mid-edge attachment log-likelihoods.
    LikelihoodWeighted,
    /// Every edge equally likely.
    Uniform,
}

/// Settings of [`crate::attachment::AttachmentMove`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttachmentConfig {
    pub edge_selection: EdgeSelection,
    /// Pendant lengths tried at each edge midpoint when weighting edges.
    pub preselection_pendant_lengths: Vec<f64>,
    /// Edges shorter than this attach with distal length 0.
    pub min_edge_length: f64,
    /// Truncated-normal draws for the distal length before giving up.
    pub distal_max_draws: usize,
    pub optimizer: OptimizerConfig,
    pub sampler: SamplerConfig,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            edge_selection: EdgeSelection::LikelihoodWeighted,
            preselection_pendant_lengths: vec![0.0, 0.5],
            min_edge_length: 1e-8,
            distal_max_draws: 10_000,
            optimizer: OptimizerConfig::default(),
            sampler: SamplerConfig::default(),
        }
    }
}

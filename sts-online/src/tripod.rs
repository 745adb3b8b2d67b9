//! Branch-length optimization at a candidate attachment point.
//!
//! Attaching a leaf to an edge of length `d` creates a tripod: the distal
//! branch (from the edge's child node up to the new junction), the rest of
//! the edge above the junction, and the pendant branch to the new leaf.
//! [`TripodOptimizer`] maximizes the attachment log-likelihood over the
//! distal length in `[0, d]` and the pendant length in `[0, 2d]`, one
//! coordinate at a time.

use log::trace;
use sts_core::{Result, StsError};

use crate::backend::{CpuBackend, LikelihoodBackend};
use crate::config::OptimizerConfig;
use crate::engine::PartialLikelihoodEngine;
use crate::numeric::brent_minimize;
use crate::tree::NodeId;

/// Log-likelihood of the tree with the new leaf attached `distal` above the
/// edge's child node through a branch of length `pendant`.
pub trait AttachmentLikelihood {
    fn log_likelihood(&mut self, distal: f64, pendant: f64) -> Result<f64>;
}

impl<F> AttachmentLikelihood for F
where
    F: FnMut(f64, f64) -> Result<f64>,
{
    fn log_likelihood(&mut self, distal: f64, pendant: f64) -> Result<f64> {
        self(distal, pendant)
    }
}

/// Engine-backed attachment likelihood.
///
/// Holds two scratch slots of the engine (tripod partial and pendant
/// matrix) until dropped. The tripod partial is rebuilt only when the
/// distal length changes.
pub struct EngineTripod<'a, B: LikelihoodBackend = CpuBackend> {
    engine: &'a mut PartialLikelihoodEngine<B>,
    edge: NodeId,
    leaf_buffer: usize,
    slots: [usize; 2],
    /// Distal length and log scale of the partial in `slots[0]`.
    current: Option<(f64, f64)>,
}

impl<'a, B: LikelihoodBackend> EngineTripod<'a, B> {
    /// Bind to `edge` of the engine's evaluated tree, for attaching `leaf`.
    ///
    /// # Errors
    ///
    /// [`StsError::InsufficientBuffers`] when fewer than two scratch slots
    /// are free; [`StsError::InvalidInput`] for an unknown edge, an unknown
    /// leaf or a leaf already in the tree.
    pub fn new(
        engine: &'a mut PartialLikelihoodEngine<B>,
        edge: NodeId,
        leaf: &str,
    ) -> Result<Self> {
        let free = engine.free_buffer_count();
        if free < 2 {
            return Err(StsError::InsufficientBuffers {
                requested: 2,
                available: free,
            });
        }
        let leaf_buffer = engine.attachable_leaf(leaf)?;
        engine.edge_length(edge)?;
        let slots = engine.acquire_scratch_pair()?;
        Ok(Self {
            engine,
            edge,
            leaf_buffer,
            slots,
            current: None,
        })
    }

    pub fn edge(&self) -> NodeId {
        self.edge
    }

    /// Length of the bound edge.
    pub fn edge_length(&self) -> Result<f64> {
        self.engine.edge_length(self.edge)
    }
}

impl<B: LikelihoodBackend> AttachmentLikelihood for EngineTripod<'_, B> {
    fn log_likelihood(&mut self, distal: f64, pendant: f64) -> Result<f64> {
        let log_scale = match self.current {
            Some((d, scale)) if d == distal => scale,
            _ => {
                self.current = None;
                let scale = self
                    .engine
                    .attachment_partial(self.slots[0], self.edge, distal)?;
                self.current = Some((distal, scale));
                scale
            }
        };
        self.engine.attachment_log_likelihood(
            self.slots[0],
            self.slots[1],
            self.leaf_buffer,
            pendant,
            log_scale,
        )
    }
}

impl<B: LikelihoodBackend> Drop for EngineTripod<'_, B> {
    fn drop(&mut self) {
        for slot in self.slots {
            self.engine.release_scratch(slot);
        }
    }
}

/// Coordinate-wise maximizer of an [`AttachmentLikelihood`] on one edge.
pub struct TripodOptimizer<L: AttachmentLikelihood> {
    likelihood: L,
    edge_length: f64,
    config: OptimizerConfig,
}

impl<L: AttachmentLikelihood> TripodOptimizer<L> {
    pub fn new(likelihood: L, edge_length: f64, config: OptimizerConfig) -> Result<Self> {
        if !(edge_length >= 0.0 && edge_length.is_finite()) {
            return Err(StsError::InvalidInput(format!(
                "edge length must be finite and non-negative, got {}",
                edge_length
            )));
        }
        Ok(Self {
            likelihood,
            edge_length,
            config,
        })
    }

    pub fn edge_length(&self) -> f64 {
        self.edge_length
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn log_likelihood(&mut self, distal: f64, pendant: f64) -> Result<f64> {
        self.likelihood.log_likelihood(distal, pendant)
    }

    /// Distal length in `[0, d]` maximizing the likelihood at `pendant`.
    pub fn optimize_distal(&mut self, start: f64, pendant: f64, max_iters: usize) -> Result<f64> {
        let likelihood = &mut self.likelihood;
        let x = minimize(
            |distal| Ok(-likelihood.log_likelihood(distal, pendant)?),
            0.0,
            self.edge_length,
            start,
            self.config.tolerance,
            max_iters,
        )?;
        trace!("ml distal {:.6} at pendant {:.6}", x, pendant);
        Ok(x)
    }

    /// Pendant length in `[0, 2d]` maximizing the likelihood at `distal`.
    pub fn optimize_pendant(&mut self, distal: f64, start: f64, max_iters: usize) -> Result<f64> {
        let likelihood = &mut self.likelihood;
        let x = minimize(
            |pendant| Ok(-likelihood.log_likelihood(distal, pendant)?),
            0.0,
            2.0 * self.edge_length,
            start,
            self.config.tolerance,
            max_iters,
        )?;
        trace!("ml pendant {:.6} at distal {:.6}", x, distal);
        Ok(x)
    }

    pub fn into_inner(self) -> L {
        self.likelihood
    }
}

/// Minimize `f` on `[lo, hi]` from `start`.
///
/// Both endpoints are evaluated first. The start point walks halfway toward
/// the better endpoint until it beats it, at which point Brent's method
/// takes over with the remaining budget. Never returns a point worse than
/// both endpoints.
fn minimize<F>(mut f: F, lo: f64, hi: f64, start: f64, tol: f64, max_iters: usize) -> Result<f64>
where
    F: FnMut(f64) -> Result<f64>,
{
    if !(lo <= start && start <= hi) {
        return Err(StsError::InvalidInput(format!(
            "start {} outside [{}, {}]",
            start, lo, hi
        )));
    }
    let f_lo = f(lo)?;
    let f_hi = f(hi)?;
    let (min_x, min_y) = if f_lo <= f_hi { (lo, f_lo) } else { (hi, f_hi) };

    let mut x = start;
    if (x - min_x).abs() < tol {
        x = 0.5 * (lo + hi);
    }
    for iter in 0..max_iters {
        let y = f(x)?;
        if y < min_y {
            let best = brent_minimize(&mut f, lo, hi, x, y, tol, max_iters - iter - 1)?;
            return Ok(best.x);
        }
        if (x - min_x).abs() < tol {
            break;
        }
        x = 0.5 * (x + min_x);
    }
    Ok(min_x)
}

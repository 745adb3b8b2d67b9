//! Rejection sampling of pendant branch lengths from a fitted BSM curve.
//!
//! The target density is `f(t) / Z` with `f(t) = exp(l(t) − l(t̂))` on the
//! interval where the fitted curve stays within a threshold of its maximum,
//! and `Z` its integral there. Since `f ≤ 1`, candidates uniform on the
//! interval with uniform thresholds in `[0, 1]` give exact draws, and the
//! returned log density is exact for the distribution actually sampled.

use log::{debug, warn};
use rand::Rng;
use sts_core::{Result, StsError};

use crate::config::SamplerConfig;
use crate::lcfit::BsmModel;
use crate::numeric::{brent_root, integrate};

const ROOT_TOLERANCE: f64 = 1e-8;

/// Sampler over the high-likelihood region of a fitted BSM curve.
#[derive(Debug, Clone)]
pub struct CurveFitRejectionSampler {
    model: BsmModel,
    ml_length: f64,
    ml_log_likelihood: f64,
    lower: f64,
    upper: f64,
    log_normalizer: f64,
    max_draws: usize,
}

impl CurveFitRejectionSampler {
    /// Locate the sampling bounds and normalize the curve.
    ///
    /// # Errors
    ///
    /// [`StsError::Convergence`] when the curve does not fall
    /// `ll_threshold` below its maximum before `max_length`, or the
    /// quadrature error estimate exceeds `integration_tolerance`.
    pub fn new(model: BsmModel, config: &SamplerConfig) -> Result<Self> {
        let ml_length = model.ml_t();
        let ml_log_likelihood = model.log_likelihood(ml_length);
        let threshold = config.ll_threshold;
        let above = |t: f64| model.log_likelihood(t) - ml_log_likelihood + threshold;

        let lower = if ml_length <= 0.0 {
            0.0
        } else if above(0.0) >= 0.0 {
            warn!(
                "curve stays within {} of its maximum down to 0; using 0 as lower bound",
                threshold
            );
            0.0
        } else {
            brent_root(above, 0.0, ml_length, ROOT_TOLERANCE, config.root_max_iters)?
        };

        if !(config.max_length > ml_length) || above(config.max_length) >= 0.0 {
            return Err(StsError::Convergence(format!(
                "curve does not drop {} below its maximum at {:.4} before {}",
                threshold, ml_length, config.max_length
            )));
        }
        let upper = brent_root(
            above,
            ml_length,
            config.max_length,
            ROOT_TOLERANCE,
            config.root_max_iters,
        )?;

        let integral = integrate(
            |t| (model.log_likelihood(t) - ml_log_likelihood).exp(),
            lower,
            upper,
            config.integration_tolerance,
            config.integration_max_panels,
        );
        if integral.error > config.integration_tolerance || !(integral.value > 0.0) {
            return Err(StsError::Convergence(format!(
                "normalizing integral {} with error {} over [{}, {}]",
                integral.value, integral.error, lower, upper
            )));
        }
        debug!(
            "rejection sampler: ml {:.5}, bounds [{:.5}, {:.5}], mass {:.6}",
            ml_length, lower, upper, integral.value
        );
        Ok(Self {
            model,
            ml_length,
            ml_log_likelihood,
            lower,
            upper,
            log_normalizer: integral.value.ln(),
            max_draws: config.max_draws,
        })
    }

    pub fn model(&self) -> &BsmModel {
        &self.model
    }

    pub fn ml_length(&self) -> f64 {
        self.ml_length
    }

    /// Support of the sampled distribution.
    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    /// Log density of the sampled distribution at `t`; `-inf` outside the
    /// bounds.
    pub fn log_density(&self, t: f64) -> f64 {
        if t < self.lower || t > self.upper {
            return f64::NEG_INFINITY;
        }
        self.model.log_likelihood(t) - self.ml_log_likelihood - self.log_normalizer
    }

    /// Draw `(t, ln density(t))`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<(f64, f64)> {
        for _ in 0..self.max_draws {
            let t = rng.gen_range(self.lower..=self.upper);
            let y: f64 = rng.gen();
            let log_f = self.model.log_likelihood(t) - self.ml_log_likelihood;
            if y <= log_f.exp() {
                return Ok((t, log_f - self.log_normalizer));
            }
        }
        Err(StsError::Convergence(format!(
            "no sample accepted in {} draws",
            self.max_draws
        )))
    }
}

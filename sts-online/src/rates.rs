//! Among-site rate heterogeneity.

use sts_core::{Result, StsError};

use crate::numeric::gamma_quantile;

/// Discrete rate categories with their prior weights.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateDistribution {
    rates: Vec<f64>,
    weights: Vec<f64>,
}

impl RateDistribution {
    /// Explicit categories. Weights must be positive and sum to 1.
    pub fn new(rates: Vec<f64>, weights: Vec<f64>) -> Result<Self> {
        if rates.is_empty() || rates.len() != weights.len() {
            return Err(StsError::InvalidInput(format!(
                "need matching non-empty rates and weights, got {} and {}",
                rates.len(),
                weights.len()
            )));
        }
        if rates.iter().any(|&r| !(r >= 0.0 && r.is_finite())) {
            return Err(StsError::InvalidInput(
                "category rates must be finite and non-negative".into(),
            ));
        }
        if weights.iter().any(|&w| !(w > 0.0 && w.is_finite())) {
            return Err(StsError::InvalidInput(
                "category weights must be positive".into(),
            ));
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > 1e-9 {
            return Err(StsError::InvalidInput(format!(
                "category weights sum to {}, expected 1",
                total
            )));
        }
        Ok(Self { rates, weights })
    }

    /// A single category with rate 1.
    pub fn constant() -> Self {
        Self {
            rates: vec![1.0],
            weights: vec![1.0],
        }
    }

    /// Yang (1994) discrete gamma with `n_categories` equiprobable
    /// categories, each represented by its median, rescaled to mean 1.
    pub fn discrete_gamma(alpha: f64, n_categories: usize) -> Result<Self> {
        if !(alpha > 0.0 && alpha.is_finite()) {
            return Err(StsError::InvalidInput(format!(
                "gamma shape must be positive, got {}",
                alpha
            )));
        }
        if n_categories == 0 {
            return Err(StsError::InvalidInput(
                "need at least one rate category".into(),
            ));
        }
        if n_categories == 1 {
            return Ok(Self::constant());
        }
        let n = n_categories as f64;
        let mut rates = (0..n_categories)
            .map(|i| gamma_quantile(alpha, alpha, (2.0 * i as f64 + 1.0) / (2.0 * n)))
            .collect::<Result<Vec<f64>>>()?;
        let mean = rates.iter().sum::<f64>() / n;
        if !(mean > 0.0) {
            return Err(StsError::InvalidInput(format!(
                "gamma shape {} too small for {} categories",
                alpha, n_categories
            )));
        }
        for r in rates.iter_mut() {
            *r /= mean;
        }
        Ok(Self {
            rates,
            weights: vec![1.0 / n; n_categories],
        })
    }

    /// Number of categories.
    pub fn n_categories(&self) -> usize {
        self.rates.len()
    }

    /// Category rate multipliers.
    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    /// Category weights.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl Default for RateDistribution {
    fn default() -> Self {
        Self::constant()
    }
}

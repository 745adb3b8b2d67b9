//! Log-space probability helpers for numerically stable weighting.
//!
//! [`LogProb`] represents a probability as its natural logarithm. The free
//! functions [`log_sum_exp`] and [`normalize_log_weights`] turn a set of
//! unnormalized log weights (edge log-likelihoods, particle weights) into
//! log probabilities without overflow.

use crate::{Result, StsError};

/// A probability stored as its natural logarithm: `ln(p)`.
///
/// All values are ≤ 0, with 0.0 representing certainty and negative
/// infinity representing impossibility.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct LogProb(pub f64);

impl LogProb {
    /// Convert back to a raw probability.
    pub fn to_prob(self) -> f64 {
        self.0.exp()
    }
}

/// `ln(Σ exp(x_i))`, stable for large magnitudes.
///
/// Returns negative infinity for an empty slice or when every entry is
/// negative infinity. NaN entries propagate.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Normalize unnormalized log weights into log probabilities.
///
/// # Errors
///
/// Returns an error if the slice is empty, contains NaN or `+∞`, or every
/// weight is negative infinity (nothing to normalize against).
pub fn normalize_log_weights(log_weights: &[f64]) -> Result<Vec<LogProb>> {
    if log_weights.is_empty() {
        return Err(StsError::InvalidInput("no weights to normalize".into()));
    }
    if log_weights
        .iter()
        .any(|w| w.is_nan() || *w == f64::INFINITY)
    {
        return Err(StsError::InvalidInput(
            "log weights must not be NaN or +inf".into(),
        ));
    }
    let total = log_sum_exp(log_weights);
    if total == f64::NEG_INFINITY {
        return Err(StsError::InvalidInput(
            "all log weights are -inf".into(),
        ));
    }
    Ok(log_weights.iter().map(|&w| LogProb(w - total)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-10;

    #[test]
    fn log_sum_exp_handles_large_magnitudes() {
        let v = [-1000.0, -1000.0];
        assert!((log_sum_exp(&v) - (-1000.0 + 2.0_f64.ln())).abs() < TOL);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
        assert_eq!(
            log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn normalized_weights_sum_to_one() {
        let lp = normalize_log_weights(&[-3000.0, -3001.0, f64::NEG_INFINITY]).unwrap();
        let total: f64 = lp.iter().map(|p| p.to_prob()).sum();
        assert!((total - 1.0).abs() < TOL);
        assert_eq!(lp[2], LogProb(f64::NEG_INFINITY));
        assert!((lp[0].0 - lp[1].0 - 1.0).abs() < TOL);
    }

    #[test]
    fn normalize_rejects_degenerate_input() {
        assert!(normalize_log_weights(&[]).is_err());
        assert!(normalize_log_weights(&[f64::NEG_INFINITY]).is_err());
        assert!(normalize_log_weights(&[0.0, f64::NAN]).is_err());
    }
}

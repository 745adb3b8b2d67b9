//! Dense partial-likelihood vectors.
//!
//! A [`LikelihoodVector`] holds one value per (rate category, site, state),
//! row-major in that order. The shape is fixed at construction.

use std::ops::{Index, IndexMut};

use sts_core::{Result, StsError};

/// Partial likelihoods over `n_rates × n_sites × n_states`.
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodVector {
    n_rates: usize,
    n_sites: usize,
    n_states: usize,
    values: Vec<f64>,
}

impl LikelihoodVector {
    /// All-zero vector of the given shape.
    pub fn new(n_rates: usize, n_sites: usize, n_states: usize) -> Self {
        Self {
            n_rates,
            n_sites,
            n_states,
            values: vec![0.0; n_rates * n_sites * n_states],
        }
    }

    /// Wrap existing values.
    pub fn from_values(
        n_rates: usize,
        n_sites: usize,
        n_states: usize,
        values: Vec<f64>,
    ) -> Result<Self> {
        let expected = n_rates * n_sites * n_states;
        if values.len() != expected {
            return Err(StsError::InvalidInput(format!(
                "likelihood vector of shape {}x{}x{} needs {} values, got {}",
                n_rates,
                n_sites,
                n_states,
                expected,
                values.len()
            )));
        }
        Ok(Self {
            n_rates,
            n_sites,
            n_states,
            values,
        })
    }

    pub fn n_rates(&self) -> usize {
        self.n_rates
    }

    pub fn n_sites(&self) -> usize {
        self.n_sites
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// Total number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at (rate, site, state), or `None` out of range.
    pub fn get(&self, rate: usize, site: usize, state: usize) -> Option<f64> {
        if rate >= self.n_rates || site >= self.n_sites || state >= self.n_states {
            return None;
        }
        Some(self.values[self.offset(rate, site, state)])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.values
    }

    fn offset(&self, rate: usize, site: usize, state: usize) -> usize {
        (rate * self.n_sites + site) * self.n_states + state
    }

    fn check_shape(&self, other: &Self) -> Result<()> {
        if (self.n_rates, self.n_sites, self.n_states)
            != (other.n_rates, other.n_sites, other.n_states)
        {
            return Err(StsError::InvalidInput(format!(
                "shape mismatch: {}x{}x{} vs {}x{}x{}",
                self.n_rates,
                self.n_sites,
                self.n_states,
                other.n_rates,
                other.n_sites,
                other.n_states
            )));
        }
        Ok(())
    }

    /// `Σ_site ln(Σ_rate w_r Σ_state x·y)`.
    ///
    /// A site whose product vanishes contributes `-inf`.
    pub fn log_dot(&self, other: &Self, rate_weights: &[f64]) -> Result<f64> {
        self.weighted_log_dot(other, rate_weights, None)
    }

    /// [`Self::log_dot`] with equiprobable rate categories.
    pub fn log_dot_uniform(&self, other: &Self) -> Result<f64> {
        let weights = vec![1.0 / self.n_rates as f64; self.n_rates];
        self.log_dot(other, &weights)
    }

    /// `Σ_site ln(Σ_rate w_r Σ_state π_k x·y)`: the log-likelihood of joining
    /// two partials at a point whose state distribution is `freqs`.
    pub fn log_dot_with_frequencies(
        &self,
        other: &Self,
        rate_weights: &[f64],
        freqs: &[f64],
    ) -> Result<f64> {
        if freqs.len() != self.n_states {
            return Err(StsError::InvalidInput(format!(
                "expected {} state frequencies, got {}",
                self.n_states,
                freqs.len()
            )));
        }
        self.weighted_log_dot(other, rate_weights, Some(freqs))
    }

    fn weighted_log_dot(
        &self,
        other: &Self,
        rate_weights: &[f64],
        freqs: Option<&[f64]>,
    ) -> Result<f64> {
        self.check_shape(other)?;
        if rate_weights.len() != self.n_rates {
            return Err(StsError::InvalidInput(format!(
                "expected {} rate weights, got {}",
                self.n_rates,
                rate_weights.len()
            )));
        }
        let k = self.n_states;
        let mut total = 0.0;
        for site in 0..self.n_sites {
            let mut site_sum = 0.0;
            for (rate, &w) in rate_weights.iter().enumerate() {
                let off = self.offset(rate, site, 0);
                let x = &self.values[off..off + k];
                let y = &other.values[off..off + k];
                let dot: f64 = match freqs {
                    Some(pi) => x.iter().zip(y).zip(pi).map(|((a, b), p)| a * b * p).sum(),
                    None => x.iter().zip(y).map(|(a, b)| a * b).sum(),
                };
                site_sum += w * dot;
            }
            if !(site_sum > 0.0) {
                return Ok(f64::NEG_INFINITY);
            }
            total += site_sum.ln();
        }
        Ok(total)
    }
}

impl Index<(usize, usize, usize)> for LikelihoodVector {
    type Output = f64;

    fn index(&self, (rate, site, state): (usize, usize, usize)) -> &f64 {
        assert!(
            rate < self.n_rates && site < self.n_sites && state < self.n_states,
            "index ({}, {}, {}) out of range for {}x{}x{}",
            rate,
            site,
            state,
            self.n_rates,
            self.n_sites,
            self.n_states
        );
        &self.values[self.offset(rate, site, state)]
    }
}

impl IndexMut<(usize, usize, usize)> for LikelihoodVector {
    fn index_mut(&mut self, (rate, site, state): (usize, usize, usize)) -> &mut f64 {
        assert!(
            rate < self.n_rates && site < self.n_sites && state < self.n_states,
            "index ({}, {}, {}) out of range for {}x{}x{}",
            rate,
            site,
            state,
            self.n_rates,
            self.n_sites,
            self.n_states
        );
        let off = self.offset(rate, site, state);
        &mut self.values[off]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filled(n_rates: usize, n_sites: usize, values: &[f64]) -> LikelihoodVector {
        LikelihoodVector::from_values(n_rates, n_sites, 4, values.to_vec()).unwrap()
    }

    #[test]
    fn indexing_is_rate_site_state() {
        let mut v = LikelihoodVector::new(2, 3, 4);
        v[(1, 2, 3)] = 7.0;
        assert_eq!(v.as_slice()[(1 * 3 + 2) * 4 + 3], 7.0);
        assert_eq!(v.get(1, 2, 3), Some(7.0));
        assert_eq!(v.get(2, 0, 0), None);
        assert_eq!(v.len(), 24);
    }

    #[test]
    #[should_panic]
    fn index_out_of_range_panics() {
        let v = LikelihoodVector::new(1, 1, 4);
        let _ = v[(0, 1, 0)];
    }

    #[test]
    fn log_dot_hand_value() {
        // one rate, two sites
        let x = filled(1, 2, &[1.0, 0.0, 0.0, 0.0, 0.5, 0.5, 0.0, 0.0]);
        let y = filled(1, 2, &[0.25, 0.25, 0.25, 0.25, 1.0, 1.0, 1.0, 1.0]);
        let got = x.log_dot(&y, &[1.0]).unwrap();
        assert!((got - (0.25_f64.ln() + 1.0_f64.ln())).abs() < 1e-12);
        let with_pi = x
            .log_dot_with_frequencies(&y, &[1.0], &[0.1, 0.2, 0.3, 0.4])
            .unwrap();
        let expected = (0.1_f64 * 0.25).ln() + (0.5_f64 * 0.1 + 0.5 * 0.2).ln();
        assert!((with_pi - expected).abs() < 1e-12);
    }

    #[test]
    fn zero_site_gives_neg_infinity() {
        let x = filled(1, 1, &[1.0, 0.0, 0.0, 0.0]);
        let y = filled(1, 1, &[0.0, 1.0, 1.0, 1.0]);
        assert_eq!(x.log_dot(&y, &[1.0]).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn nan_site_gives_neg_infinity() {
        let x = filled(1, 2, &[0.25, 0.25, 0.25, 0.25, f64::NAN, 0.0, 0.0, 0.0]);
        let y = filled(1, 2, &[1.0; 8]);
        assert_eq!(x.log_dot(&y, &[1.0]).unwrap(), f64::NEG_INFINITY);
        assert_eq!(
            x.log_dot_with_frequencies(&y, &[1.0], &[0.25; 4]).unwrap(),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn mismatched_shapes_rejected() {
        let x = LikelihoodVector::new(1, 2, 4);
        let y = LikelihoodVector::new(1, 3, 4);
        assert!(x.log_dot(&y, &[1.0]).is_err());
        assert!(x.log_dot(&x, &[0.5, 0.5]).is_err());
        assert!(x.log_dot_with_frequencies(&x, &[1.0], &[1.0]).is_err());
        assert!(LikelihoodVector::from_values(1, 2, 4, vec![0.0; 7]).is_err());
    }

    #[test]
    fn uniform_matches_explicit_weights() {
        let x = filled(2, 1, &[0.1, 0.2, 0.3, 0.4, 0.4, 0.3, 0.2, 0.1]);
        let y = filled(2, 1, &[1.0, 0.5, 0.25, 0.125, 0.2, 0.2, 0.2, 0.2]);
        let a = x.log_dot_uniform(&y).unwrap();
        let b = x.log_dot(&y, &[0.5, 0.5]).unwrap();
        assert!((a - b).abs() < 1e-14);
    }

    proptest! {
        #[test]
        fn log_dot_symmetric(
            xs in proptest::collection::vec(0.01f64..1.0, 24),
            ys in proptest::collection::vec(0.01f64..1.0, 24),
        ) {
            let x = filled(2, 3, &xs);
            let y = filled(2, 3, &ys);
            let w = [0.3, 0.7];
            let a = x.log_dot(&y, &w).unwrap();
            let b = y.log_dot(&x, &w).unwrap();
            prop_assert!((a - b).abs() < 1e-12);
        }

        #[test]
        fn log_dot_linear_in_rate_weights(
            xs in proptest::collection::vec(0.01f64..1.0, 8),
            ys in proptest::collection::vec(0.01f64..1.0, 8),
            w0 in 0.05f64..1.0,
            w1 in 0.05f64..1.0,
            scale in 0.1f64..10.0,
        ) {
            // One site: exp(log_dot) is linear in the weights.
            let x = filled(2, 1, &xs);
            let y = filled(2, 1, &ys);
            let both = x.log_dot(&y, &[w0, w1]).unwrap().exp();
            let first = x.log_dot(&y, &[w0, 0.0]).unwrap().exp();
            let second = x.log_dot(&y, &[0.0, w1]).unwrap().exp();
            prop_assert!((both - first - second).abs() < 1e-12 * both.max(1.0));
            let scaled = x.log_dot(&y, &[scale * w0, scale * w1]).unwrap();
            prop_assert!((scaled - (both.ln() + scale.ln())).abs() < 1e-10);
        }
    }
}

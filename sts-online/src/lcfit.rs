//! Curve fitting of one-dimensional branch-length log-likelihoods.
//!
//! The fitted family is the binary symmetric model (BSM):
//!
//! ```text
//! l(t) = c·ln((1 + e^{-r(t+b)}) / 2) + m·ln((1 − e^{-r(t+b)}) / 2)
//! ```
//!
//! with `c > m > 0`, `r > 0` and `b > 0`. It has the shape of a pairwise
//! log-likelihood under a two-state symmetric process (`c` constant and `m`
//! mutated sites, rate `r`, offset `b`) and a closed-form maximizer, which
//! makes it a cheap stand-in for the real likelihood once fitted.

use log::{debug, trace};
use sts_core::{Result, StsError};

use crate::config::SamplerConfig;
use crate::numeric::solve_linear;

/// Parameters of a BSM curve.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BsmModel {
    pub c: f64,
    pub m: f64,
    pub r: f64,
    pub b: f64,
}

impl BsmModel {
    /// Starting point of every fit before rescaling.
    pub const DEFAULT_INIT: BsmModel = BsmModel {
        c: 1500.0,
        m: 1000.0,
        r: 1.0,
        b: 0.5,
    };

    pub fn new(c: f64, m: f64, r: f64, b: f64) -> Result<Self> {
        let model = Self { c, m, r, b };
        if !model.is_valid() {
            return Err(StsError::InvalidInput(format!(
                "invalid BSM parameters c={} m={} r={} b={}",
                c, m, r, b
            )));
        }
        Ok(model)
    }

    fn is_valid(&self) -> bool {
        [self.c, self.m, self.r, self.b].iter().all(|v| v.is_finite())
            && self.c > self.m
            && self.m > 0.0
            && self.r > 0.0
            && self.b > 0.0
    }

    pub fn log_likelihood(&self, t: f64) -> f64 {
        let e = (-self.r * (t + self.b)).exp();
        self.c * (0.5 * (1.0 + e)).ln() + self.m * (0.5 * (1.0 - e)).ln()
    }

    /// Maximizing branch length, clamped at 0.
    pub fn ml_t(&self) -> f64 {
        let t = ((self.c + self.m) / (self.c - self.m)).ln() / self.r - self.b;
        t.max(0.0)
    }

    pub fn ml_log_likelihood(&self) -> f64 {
        self.log_likelihood(self.ml_t())
    }

    /// Scale `c` and `m` so the curve passes through `(t, observed)`.
    ///
    /// Returns `self` unchanged when the ratio is not a positive number.
    pub fn rescaled(&self, t: f64, observed: f64) -> Self {
        let ratio = observed / self.log_likelihood(t);
        if !(ratio > 0.0 && ratio.is_finite()) {
            return *self;
        }
        Self {
            c: self.c * ratio,
            m: self.m * ratio,
            ..*self
        }
    }

    /// `(ln m, ln(c − m), ln r, ln b)`: every point maps to a valid model.
    fn to_params(self) -> [f64; 4] {
        [
            self.m.ln(),
            (self.c - self.m).ln(),
            self.r.ln(),
            self.b.ln(),
        ]
    }

    fn from_params(p: &[f64; 4]) -> Self {
        let m = p[0].exp();
        Self {
            c: m + p[1].exp(),
            m,
            r: p[2].exp(),
            b: p[3].exp(),
        }
    }
}

/// Outcome of [`fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub model: BsmModel,
    /// Every `(t, l(t))` evaluated, sorted by `t`.
    pub points: Vec<(f64, f64)>,
    pub iterations: usize,
    pub converged: bool,
}

/// Evaluate `f` at the configured trial lengths, extend until the maximum is
/// bracketed, and least-squares fit a BSM curve to the points.
///
/// `f` must return finite values at the lengths it is asked about.
pub fn fit<F>(mut f: F, config: &SamplerConfig) -> Result<FitResult>
where
    F: FnMut(f64) -> Result<f64>,
{
    if config.trial_lengths.is_empty() {
        return Err(StsError::InvalidInput("no trial lengths configured".into()));
    }
    let mut points = Vec::with_capacity(config.trial_lengths.len() + config.max_extra_points);
    for &t in &config.trial_lengths {
        points.push((t, eval_finite(&mut f, t)?));
    }
    sort_points(&mut points);

    let mut extra = 0;
    while extra < config.max_extra_points {
        let best = best_index(&points);
        let t = if best + 1 == points.len() {
            2.0 * points[best].0.max(1e-3)
        } else if best == 0 && points[0].0 > 0.0 && points.len() > 1 {
            points[0].0 / 10.0
        } else if points.len() < 4 {
            2.0 * points[points.len() - 1].0.max(1e-3)
        } else {
            break;
        };
        points.push((t, eval_finite(&mut f, t)?));
        sort_points(&mut points);
        extra += 1;
    }

    let (t_best, l_best) = points[best_index(&points)];
    let init = BsmModel::DEFAULT_INIT.rescaled(t_best, l_best);
    trace!("bsm fit: {} points, start {:?}", points.len(), init);
    let (model, iterations, converged) = levenberg_marquardt(init, &points, config.fit_max_iters);
    if !model.is_valid() {
        return Err(StsError::Convergence(format!(
            "curve fit produced invalid parameters {:?}",
            model
        )));
    }
    debug!(
        "bsm fit after {} iterations (converged: {}): c={:.3} m={:.3} r={:.4} b={:.4}, ml t={:.5}",
        iterations, converged, model.c, model.m, model.r, model.b, model.ml_t()
    );
    Ok(FitResult {
        model,
        points,
        iterations,
        converged,
    })
}

fn eval_finite<F: FnMut(f64) -> Result<f64>>(f: &mut F, t: f64) -> Result<f64> {
    let y = f(t)?;
    if !y.is_finite() {
        return Err(StsError::Convergence(format!(
            "log-likelihood at {} is not finite ({})",
            t, y
        )));
    }
    Ok(y)
}

fn sort_points(points: &mut Vec<(f64, f64)>) {
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    points.dedup_by(|a, b| a.0 == b.0);
}

fn best_index(points: &[(f64, f64)]) -> usize {
    points
        .iter()
        .enumerate()
        .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn residuals(model: &BsmModel, points: &[(f64, f64)]) -> Vec<f64> {
    points
        .iter()
        .map(|&(t, y)| model.log_likelihood(t) - y)
        .collect()
}

fn sum_squares(r: &[f64]) -> f64 {
    r.iter().map(|x| x * x).sum()
}

/// Levenberg–Marquardt on the log parameters with a central-difference
/// Jacobian. Returns the best model, iterations used and whether the
/// relative improvement fell below tolerance.
fn levenberg_marquardt(
    init: BsmModel,
    points: &[(f64, f64)],
    max_iters: usize,
) -> (BsmModel, usize, bool) {
    const STEP: f64 = 1e-6;
    const TOL: f64 = 1e-12;
    let mut params = init.to_params();
    let mut res = residuals(&init, points);
    let mut cost = sum_squares(&res);
    let mut lambda = 1e-3;

    for iter in 0..max_iters {
        let mut jac = vec![[0.0; 4]; points.len()];
        for j in 0..4 {
            let (mut up, mut down) = (params, params);
            up[j] += STEP;
            down[j] -= STEP;
            let (hi, lo) = (BsmModel::from_params(&up), BsmModel::from_params(&down));
            for (row, &(t, _)) in jac.iter_mut().zip(points) {
                row[j] = (hi.log_likelihood(t) - lo.log_likelihood(t)) / (2.0 * STEP);
            }
        }
        let mut jtj = vec![vec![0.0; 4]; 4];
        let mut jtr = vec![0.0; 4];
        for (row, &r) in jac.iter().zip(&res) {
            for a in 0..4 {
                jtr[a] += row[a] * r;
                for b in 0..4 {
                    jtj[a][b] += row[a] * row[b];
                }
            }
        }

        loop {
            let mut lhs = jtj.clone();
            for (a, row) in lhs.iter_mut().enumerate() {
                row[a] += lambda * (jtj[a][a] + 1e-12);
            }
            let rhs: Vec<f64> = jtr.iter().map(|g| -g).collect();
            let step = match solve_linear(lhs, rhs) {
                Some(step) => step,
                None => return (BsmModel::from_params(&params), iter, false),
            };
            let mut candidate = params;
            for (p, s) in candidate.iter_mut().zip(&step) {
                *p += s;
            }
            let model = BsmModel::from_params(&candidate);
            let new_res = residuals(&model, points);
            let new_cost = sum_squares(&new_res);
            if new_cost.is_finite() && new_cost < cost {
                let improvement = cost - new_cost;
                params = candidate;
                res = new_res;
                cost = new_cost;
                lambda = (lambda / 10.0).max(1e-12);
                if improvement <= TOL * (1.0 + cost) {
                    return (model, iter + 1, true);
                }
                break;
            }
            lambda *= 10.0;
            if lambda > 1e12 {
                // No descent direction left: at a minimum up to round-off.
                return (BsmModel::from_params(&params), iter + 1, true);
            }
        }
    }
    (BsmModel::from_params(&params), max_iters, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_form_maximum() {
        let model = BsmModel::new(1000.0, 300.0, 1.2, 0.1).unwrap();
        let t = model.ml_t();
        let expected = (1300.0f64 / 700.0).ln() / 1.2 - 0.1;
        assert!((t - expected).abs() < 1e-12);
        let h = 1e-5;
        let slope = (model.log_likelihood(t + h) - model.log_likelihood(t - h)) / (2.0 * h);
        assert!(slope.abs() < 1e-3);
        assert!(model.ml_log_likelihood() >= model.log_likelihood(0.2));
    }

    #[test]
    fn ml_clamped_at_zero() {
        let model = BsmModel::new(1000.0, 10.0, 1.0, 1.0).unwrap();
        assert_eq!(model.ml_t(), 0.0);
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(BsmModel::new(10.0, 20.0, 1.0, 0.1).is_err());
        assert!(BsmModel::new(10.0, 5.0, 0.0, 0.1).is_err());
        assert!(BsmModel::new(10.0, 5.0, 1.0, 0.0).is_err());
        assert!(BsmModel::new(f64::NAN, 5.0, 1.0, 0.1).is_err());
    }

    #[test]
    fn rescale_passes_through_point() {
        let scaled = BsmModel::DEFAULT_INIT.rescaled(0.3, -42.0);
        assert!((scaled.log_likelihood(0.3) + 42.0).abs() < 1e-9);
        assert_eq!(scaled.r, 1.0);
        assert_eq!(BsmModel::DEFAULT_INIT.rescaled(0.3, 5.0), BsmModel::DEFAULT_INIT);
    }

    #[test]
    fn parameter_map_round_trips() {
        let model = BsmModel::new(1000.0, 300.0, 1.2, 0.1).unwrap();
        let back = BsmModel::from_params(&model.to_params());
        assert!((back.c - model.c).abs() < 1e-9);
        assert!((back.m - model.m).abs() < 1e-9);
        assert!((back.r - model.r).abs() < 1e-12);
        assert!((back.b - model.b).abs() < 1e-12);
    }

    #[test]
    fn recovers_generating_curve() {
        let truth = BsmModel::new(1000.0, 300.0, 1.2, 0.1).unwrap();
        let mut calls = 0;
        let result = fit(
            |t| -> Result<f64> {
                calls += 1;
                Ok(truth.log_likelihood(t))
            },
            &SamplerConfig::default(),
        )
        .unwrap();
        assert!(result.points.len() >= 4);
        assert_eq!(calls, result.points.len());
        // maximum bracketed
        let best = best_index(&result.points);
        assert!(best > 0 && best + 1 < result.points.len());
        for &(t, y) in &result.points {
            assert!((result.model.log_likelihood(t) - y).abs() < 1e-3 * y.abs());
        }
        assert!((result.model.ml_t() - truth.ml_t()).abs() < 0.05);
    }

    #[test]
    fn brackets_maximum_near_zero() {
        let truth = BsmModel::new(1000.0, 10.0, 1.0, 0.05).unwrap();
        assert_eq!(truth.ml_t(), 0.0);
        let curve = |t: f64| -> Result<f64> { Ok(truth.log_likelihood(t)) };
        let result = fit(curve, &SamplerConfig::default()).unwrap();
        assert!(result.points[0].0 < 1e-3);
        assert!(result.model.ml_t() < 0.1);
    }

    #[test]
    fn non_finite_evaluation_is_an_error() {
        let result = fit(|_| -> Result<f64> { Ok(f64::NAN) }, &SamplerConfig::default());
        assert!(matches!(result, Err(StsError::Convergence(_))));
    }
}

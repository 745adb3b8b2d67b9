//! Scalar numerical routines used by the optimizer, the curve fit, the
//! rejection sampler and the rate distributions.
//!
//! Special functions: [`erf`], [`normal_cdf`], [`ln_gamma`], [`gammainc`],
//! [`gamma_quantile`], [`truncated_normal_ln_pdf`].
//!
//! One-dimensional solvers: [`brent_minimize`] (seeded from a known
//! interior point), [`brent_root`] (bracketed), [`integrate`] (adaptive
//! Gauss–Kronrod 7–15). Plus [`solve_linear`] for the small dense systems of
//! the curve fit.

use std::f64::consts::PI;

use sts_core::{Result, StsError};

// ── Special functions ─────────────────────────────────────────────────────

/// Error function via Abramowitz & Stegun 7.1.26 (|ε| ≤ 1.5e-7).
pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Standard normal CDF Φ(z).
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Natural log of the gamma function via the Lanczos approximation (g=7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Reflection formula: Γ(x) = π / (sin(πx) · Γ(1-x))
        let log_pi_over_sin = (PI / (PI * x).sin()).ln();
        log_pi_over_sin - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.99999999999980993_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

/// Regularized lower incomplete gamma function P(a, x) = γ(a, x) / Γ(a).
///
/// Uses the series expansion when x < a + 1 and the continued fraction
/// representation (computing Q = 1 - P) otherwise.
pub fn gammainc(a: f64, x: f64) -> Result<f64> {
    if !(a > 0.0) {
        return Err(StsError::InvalidInput("gammainc: a must be positive".into()));
    }
    if !(x >= 0.0) {
        return Err(StsError::InvalidInput(
            "gammainc: x must be non-negative".into(),
        ));
    }
    if x == 0.0 {
        return Ok(0.0);
    }
    if x < a + 1.0 {
        Ok(gammainc_series(a, x))
    } else {
        Ok(1.0 - gammainc_cf(a, x))
    }
}

fn gammainc_series(a: f64, x: f64) -> f64 {
    let ln_prefix = a * x.ln() - x - ln_gamma(a);
    let mut sum = 1.0 / a;
    let mut term = 1.0 / a;
    for n in 1..=500 {
        term *= x / (a + n as f64);
        sum += term;
        if term.abs() < sum.abs() * 1e-14 {
            break;
        }
    }
    sum * ln_prefix.exp()
}

/// Q(a, x) = 1 - P(a, x) via modified Lentz's method.
fn gammainc_cf(a: f64, x: f64) -> f64 {
    let tiny = 1e-300_f64;
    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    let mut b = x + 1.0 - a;
    let mut c = 1.0 / tiny;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=500 {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < tiny {
            d = tiny;
        }
        c = b + an / c;
        if c.abs() < tiny {
            c = tiny;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < 1e-14 {
            break;
        }
    }
    h * ln_prefix.exp()
}

/// Quantile of the Gamma(shape, rate) distribution at probability `p`.
///
/// Solved by bisection on [`gammainc`], which is monotone in `x`.
pub fn gamma_quantile(shape: f64, rate: f64, p: f64) -> Result<f64> {
    if !(shape > 0.0 && rate > 0.0) {
        return Err(StsError::InvalidInput(format!(
            "gamma_quantile: shape {} and rate {} must be positive",
            shape, rate
        )));
    }
    if !(p > 0.0 && p < 1.0) {
        return Err(StsError::InvalidInput(format!(
            "gamma_quantile: p = {} outside (0, 1)",
            p
        )));
    }
    let mut lo = 0.0;
    let mut hi = shape.max(1.0);
    while gammainc(shape, hi)? < p {
        hi *= 2.0;
        if hi > 1e12 {
            return Err(StsError::Convergence(
                "gamma_quantile: could not bracket quantile".into(),
            ));
        }
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if gammainc(shape, mid)? < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-14 * hi.max(1e-300) {
            break;
        }
    }
    Ok(0.5 * (lo + hi) / rate)
}

/// Log density of Normal(`mean`, `sd`) truncated to `[lo, hi]`.
///
/// Negative infinity outside the support.
pub fn truncated_normal_ln_pdf(x: f64, mean: f64, sd: f64, lo: f64, hi: f64) -> f64 {
    if x < lo || x > hi {
        return f64::NEG_INFINITY;
    }
    let z = (x - mean) / sd;
    let mass = normal_cdf((hi - mean) / sd) - normal_cdf((lo - mean) / sd);
    -0.5 * z * z - sd.ln() - 0.5 * (2.0 * PI).ln() - mass.ln()
}

// ── Minimization and root finding ─────────────────────────────────────────

/// Outcome of a one-dimensional minimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Minimum {
    /// Abscissa of the best point found.
    pub x: f64,
    /// Objective value at `x`.
    pub fx: f64,
    /// Objective evaluations spent.
    pub evaluations: usize,
}

const GOLDEN: f64 = 0.381_966_011_250_105_1;

/// Brent's minimizer on `[a, b]`, seeded with an interior point `x` whose
/// objective value `fx` is already known.
///
/// Stops when the bracket shrinks below `2·tol` around the current best or
/// after `max_evals` objective evaluations. The returned point is never worse
/// than the seed.
pub fn brent_minimize<F>(
    mut f: F,
    a: f64,
    b: f64,
    x: f64,
    fx: f64,
    tol: f64,
    max_evals: usize,
) -> Result<Minimum>
where
    F: FnMut(f64) -> Result<f64>,
{
    if !(a <= x && x <= b) {
        return Err(StsError::InvalidInput(format!(
            "brent_minimize: seed {} outside [{}, {}]",
            x, a, b
        )));
    }
    let (mut a, mut b) = (a, b);
    let (mut x, mut w, mut v) = (x, x, x);
    let (mut fx, mut fw, mut fv) = (fx, fx, fx);
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;
    let mut evaluations = 0;

    while evaluations < max_evals {
        let mid = 0.5 * (a + b);
        let tol1 = tol + f64::EPSILON.sqrt() * x.abs();
        let tol2 = 2.0 * tol1;
        if (x - mid).abs() <= tol2 - 0.5 * (b - a) {
            break;
        }

        let mut golden = true;
        if e.abs() > tol1 {
            // Parabolic fit through x, w, v.
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let e_prev = e;
            if p.abs() < (0.5 * q * e_prev).abs() && p > q * (a - x) && p < q * (b - x) {
                e = d;
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = if mid > x { tol1 } else { -tol1 };
                }
                golden = false;
            }
        }
        if golden {
            e = if x >= mid { a - x } else { b - x };
            d = GOLDEN * e;
        }

        let u = if d.abs() >= tol1 {
            x + d
        } else if d > 0.0 {
            x + tol1
        } else {
            x - tol1
        };
        let fu = f(u)?;
        evaluations += 1;

        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }

    Ok(Minimum { x, fx, evaluations })
}

/// Brent's bracketed root finder for `f` on `[a, b]`.
///
/// # Errors
///
/// [`StsError::Convergence`] if `f(a)` and `f(b)` have the same sign or the
/// iteration cap is reached before the bracket is narrower than `tol`.
pub fn brent_root<F>(mut f: F, a: f64, b: f64, tol: f64, max_iter: usize) -> Result<f64>
where
    F: FnMut(f64) -> f64,
{
    let (mut a, mut b) = (a, b);
    let mut fa = f(a);
    let mut fb = f(b);
    if fa == 0.0 {
        return Ok(a);
    }
    if fb == 0.0 {
        return Ok(b);
    }
    if !(fa * fb < 0.0) {
        return Err(StsError::Convergence(format!(
            "brent_root: [{}, {}] does not bracket a root (f = {}, {})",
            a, b, fa, fb
        )));
    }

    let (mut c, mut fc) = (a, fa);
    let mut d = b - a;
    let mut e = d;
    for _ in 0..max_iter {
        if fb * fc > 0.0 {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }
        let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * tol;
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb == 0.0 {
            return Ok(b);
        }
        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            // Inverse quadratic interpolation (secant when a == c).
            let s = fb / fa;
            let (mut p, mut q);
            if a == c {
                p = 2.0 * xm * s;
                q = 1.0 - s;
            } else {
                let qa = fa / fc;
                let r = fb / fc;
                p = s * (2.0 * xm * qa * (qa - r) - (b - a) * (r - 1.0));
                q = (qa - 1.0) * (r - 1.0) * (s - 1.0);
            }
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < min1.min(min2) {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }
        a = b;
        fa = fb;
        b += if d.abs() > tol1 {
            d
        } else if xm > 0.0 {
            tol1
        } else {
            -tol1
        };
        fb = f(b);
    }
    Err(StsError::Convergence(format!(
        "brent_root: no convergence after {} iterations",
        max_iter
    )))
}

// ── Quadrature ────────────────────────────────────────────────────────────

/// Kronrod abscissae on [-1, 1] (non-negative half, descending).
const XGK: [f64; 8] = [
    0.991_455_371_120_812_6,
    0.949_107_912_342_758_5,
    0.864_864_423_359_769_1,
    0.741_531_185_599_394_4,
    0.586_087_235_467_691_1,
    0.405_845_151_377_397_2,
    0.207_784_955_007_898_5,
    0.0,
];

const WGK: [f64; 8] = [
    0.022_935_322_010_529_22,
    0.063_092_092_629_978_55,
    0.104_790_010_322_250_18,
    0.140_653_259_715_525_92,
    0.169_004_726_639_267_9,
    0.190_350_578_064_785_4,
    0.204_432_940_075_298_9,
    0.209_482_141_084_727_83,
];

/// Gauss weights for the abscissae `XGK[1]`, `XGK[3]`, `XGK[5]`, `XGK[7]`.
const WG: [f64; 4] = [
    0.129_484_966_168_869_7,
    0.279_705_391_489_276_7,
    0.381_830_050_505_118_9,
    0.417_959_183_673_469_4,
];

/// Result of [`integrate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integral {
    pub value: f64,
    /// Sum of per-panel |Kronrod − Gauss| differences.
    pub error: f64,
}

fn gauss_kronrod_15<F: Fn(f64) -> f64>(f: &F, a: f64, b: f64) -> (f64, f64) {
    let center = 0.5 * (a + b);
    let half = 0.5 * (b - a);
    let fc = f(center);
    let mut kronrod = WGK[7] * fc;
    let mut gauss = WG[3] * fc;
    for (j, (&x, &w)) in XGK.iter().zip(WGK.iter()).take(7).enumerate() {
        let dx = half * x;
        let pair = f(center - dx) + f(center + dx);
        kronrod += w * pair;
        if j % 2 == 1 {
            gauss += WG[j / 2] * pair;
        }
    }
    (kronrod * half, ((kronrod - gauss) * half).abs())
}

/// Adaptive Gauss–Kronrod (7–15) integration of `f` over `[a, b]`.
///
/// Repeatedly bisects the panel with the largest error estimate until the
/// summed estimate drops to `tol` or `max_panels` is reached. The caller
/// decides whether the final [`Integral::error`] is acceptable.
pub fn integrate<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, tol: f64, max_panels: usize) -> Integral {
    if a == b {
        return Integral {
            value: 0.0,
            error: 0.0,
        };
    }
    let (value, error) = gauss_kronrod_15(&f, a, b);
    let mut panels = vec![(a, b, value, error)];
    loop {
        let error: f64 = panels.iter().map(|p| p.3).sum();
        if error <= tol || panels.len() >= max_panels {
            break;
        }
        let worst = panels
            .iter()
            .enumerate()
            .max_by(|x, y| x.1 .3.total_cmp(&y.1 .3))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let (lo, hi, _, _) = panels.swap_remove(worst);
        let mid = 0.5 * (lo + hi);
        let (v1, e1) = gauss_kronrod_15(&f, lo, mid);
        let (v2, e2) = gauss_kronrod_15(&f, mid, hi);
        panels.push((lo, mid, v1, e1));
        panels.push((mid, hi, v2, e2));
    }
    Integral {
        value: panels.iter().map(|p| p.2).sum(),
        error: panels.iter().map(|p| p.3).sum(),
    }
}

// ── Linear algebra ────────────────────────────────────────────────────────

/// Solve `A x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` when `A` is numerically singular.
pub fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    if a.len() != n || a.iter().any(|row| row.len() != n) {
        return None;
    }
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-300 || !a[pivot][col].is_finite() {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-10;

    #[test]
    fn erf_known_values() {
        assert!(erf(0.0).abs() < TOL);
        assert!((erf(1.0) - 0.8427007929).abs() < 1e-6);
        assert!((erf(-0.5) + erf(0.5)).abs() < TOL);
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-9);
        assert!((normal_cdf(1.959964) - 0.975).abs() < 1e-6);
    }

    #[test]
    fn ln_gamma_integers() {
        assert!(ln_gamma(1.0).abs() < TOL);
        assert!((ln_gamma(5.0) - 24.0_f64.ln()).abs() < TOL);
        assert!((ln_gamma(0.5) - 0.5 * PI.ln()).abs() < 1e-8);
    }

    #[test]
    fn gammainc_matches_closed_forms() {
        assert_eq!(gammainc(1.0, 0.0).unwrap(), 0.0);
        // P(1, x) = 1 - e^{-x}
        for &x in &[0.3, 2.0, 9.0] {
            assert!((gammainc(1.0, x).unwrap() - (1.0 - (-x as f64).exp())).abs() < 1e-10);
        }
        assert!((gammainc(2.0, 50.0).unwrap() - 1.0).abs() < 1e-10);
        assert!(gammainc(-1.0, 1.0).is_err());
        assert!(gammainc(1.0, -1.0).is_err());
    }

    #[test]
    fn gamma_quantile_inverts_cdf() {
        for &(shape, p) in &[(0.5, 0.125), (1.0, 0.5), (2.5, 0.9), (0.1, 0.375)] {
            let q = gamma_quantile(shape, shape, p).unwrap();
            let back = gammainc(shape, q * shape).unwrap();
            assert!((back - p).abs() < 1e-9, "shape {} p {}: {}", shape, p, back);
        }
        // Exponential median: ln 2
        assert!((gamma_quantile(1.0, 1.0, 0.5).unwrap() - 2.0_f64.ln()).abs() < 1e-10);
        assert!(gamma_quantile(1.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn truncated_normal_density_integrates_to_one() {
        let f = |x: f64| truncated_normal_ln_pdf(x, 0.3, 0.25, 0.0, 1.0).exp();
        let integral = integrate(f, 0.0, 1.0, 1e-10, 100);
        assert!((integral.value - 1.0).abs() < 1e-5);
        assert_eq!(
            truncated_normal_ln_pdf(1.5, 0.3, 0.25, 0.0, 1.0),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn brent_minimize_parabola() {
        let f = |x: f64| -> Result<f64> { Ok((x - 0.7) * (x - 0.7) + 1.0) };
        let f0 = f(0.2).unwrap();
        let min = brent_minimize(f, 0.0, 2.0, 0.2, f0, 1e-6, 100).unwrap();
        assert!((min.x - 0.7).abs() < 1e-5);
        assert!((min.fx - 1.0).abs() < 1e-9);
        assert!(min.evaluations <= 100);
    }

    #[test]
    fn brent_minimize_respects_budget() {
        let mut calls = 0;
        let f = |x: f64| -> Result<f64> {
            calls += 1;
            Ok((x - 3.0).abs())
        };
        let min = brent_minimize(f, 0.0, 10.0, 1.0, 2.0, 1e-12, 3).unwrap();
        assert_eq!(calls, 3);
        assert!(min.fx <= 2.0);
    }

    #[test]
    fn brent_minimize_propagates_errors() {
        let f = |_x: f64| -> Result<f64> { Err(StsError::Convergence("boom".into())) };
        assert!(brent_minimize(f, 0.0, 1.0, 0.5, 0.0, 1e-6, 10).is_err());
        let g = |x: f64| -> Result<f64> { Ok(x) };
        assert!(brent_minimize(g, 0.0, 1.0, 2.0, 2.0, 1e-6, 10).is_err());
    }

    #[test]
    fn brent_root_sqrt_two() {
        let root = brent_root(|x| x * x - 2.0, 0.0, 2.0, 1e-12, 100).unwrap();
        assert!((root - 2.0_f64.sqrt()).abs() < 1e-10);
        assert!(brent_root(|x| x * x + 1.0, -1.0, 1.0, 1e-12, 100).is_err());
    }

    #[test]
    fn integrate_smooth_functions() {
        let i = integrate(|x: f64| x.exp(), 0.0, 1.0, 1e-12, 50);
        assert!((i.value - (1.0_f64.exp() - 1.0)).abs() < 1e-12);
        let i = integrate(|x: f64| x.sin(), 0.0, PI, 1e-12, 50);
        assert!((i.value - 2.0).abs() < 1e-12);
        assert!(i.error <= 1e-12);
    }

    #[test]
    fn integrate_peaked_function_subdivides() {
        let f = |x: f64| (-(x - 1.0) * (x - 1.0) / 0.02).exp();
        let i = integrate(f, 0.0, 10.0, 1e-8, 200);
        let exact = (2.0 * PI).sqrt() * 0.1;
        assert!((i.value - exact).abs() < 1e-6, "{} vs {}", i.value, exact);
    }

    #[test]
    fn solve_linear_three_by_three() {
        let a = vec![
            vec![0.0, 2.0, 1.0],
            vec![1.0, -1.0, 0.0],
            vec![3.0, 0.0, 4.0],
        ];
        let b = vec![7.0, -1.0, 15.0];
        let x = solve_linear(a, b).unwrap();
        // x = (1, 2, 3)
        assert!((x[0] - 1.0).abs() < TOL);
        assert!((x[1] - 2.0).abs() < TOL);
        assert!((x[2] - 3.0).abs() < TOL);
        assert!(solve_linear(vec![vec![1.0, 2.0], vec![2.0, 4.0]], vec![1.0, 2.0]).is_none());
    }
}

//! Substitution model trait and the bundled nucleotide and protein models.
//!
//! Every model is time-reversible, so its rate matrix `Q` symmetrises as
//! `B = diag(√π) · Q · diag(1/√π)`. The default
//! [`SubstitutionModel::eigen_decomposition`] diagonalises `B` with Jacobi
//! rotations and maps the result back, giving the `Q = V · Λ · V⁻¹` form the
//! likelihood backend consumes.

use sts_core::{Result, StsError};

use crate::models::{self, AA_STATES, DNA_STATES};

/// Eigen system of a rate matrix, row-major `n × n`.
///
/// `Q = eigenvectors · diag(eigenvalues) · inverse_eigenvectors`.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenDecomposition {
    pub n_states: usize,
    pub eigenvalues: Vec<f64>,
    pub eigenvectors: Vec<f64>,
    pub inverse_eigenvectors: Vec<f64>,
}

impl EigenDecomposition {
    /// `P(t) = V · exp(Λt) · V⁻¹`, row-major, negative round-off clamped to 0.
    pub fn transition_matrix(&self, t: f64) -> Vec<f64> {
        let n = self.n_states;
        let exp_lt: Vec<f64> = self.eigenvalues.iter().map(|&l| (l * t).exp()).collect();
        let mut p = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += self.eigenvectors[i * n + k]
                        * exp_lt[k]
                        * self.inverse_eigenvectors[k * n + j];
                }
                p[i * n + j] = sum.max(0.0);
            }
        }
        p
    }
}

/// Trait for substitution models of any state count.
///
/// Implementors provide the equilibrium frequencies and the rate matrix;
/// the eigen system and transition probabilities follow.
pub trait SubstitutionModel: Send + Sync {
    /// Number of character states (4 for DNA, 20 for protein).
    fn n_states(&self) -> usize;

    /// Equilibrium frequencies, one per state.
    fn frequencies(&self) -> &[f64];

    /// Instantaneous rate matrix Q (N x N), normalised to one expected
    /// substitution per unit time.
    fn rate_matrix(&self) -> Vec<Vec<f64>>;

    /// Eigen decomposition of [`Self::rate_matrix`].
    fn eigen_decomposition(&self) -> EigenDecomposition {
        symmetric_eigen_decomposition(&self.rate_matrix(), self.frequencies())
    }

    /// Transition probability matrix P(t) = exp(Qt) for branch length t.
    fn transition_probs(&self, t: f64) -> Vec<Vec<f64>> {
        let n = self.n_states();
        let flat = self.eigen_decomposition().transition_matrix(t);
        flat.chunks(n).map(|row| row.to_vec()).collect()
    }
}

fn check_frequencies(freqs: &[f64]) -> Result<()> {
    if freqs.iter().any(|&f| !(f > 0.0 && f.is_finite())) {
        return Err(StsError::InvalidInput(
            "state frequencies must be positive and finite".into(),
        ));
    }
    let total: f64 = freqs.iter().sum();
    if (total - 1.0).abs() > 1e-6 {
        return Err(StsError::InvalidInput(format!(
            "state frequencies sum to {}, expected 1",
            total
        )));
    }
    Ok(())
}

/// Jukes–Cantor 1969: equal frequencies and rates.
#[derive(Debug, Clone, PartialEq)]
pub struct Jc69Model {
    freqs: [f64; 4],
}

impl Jc69Model {
    pub fn new() -> Self {
        Self { freqs: [0.25; 4] }
    }
}

impl Default for Jc69Model {
    fn default() -> Self {
        Self::new()
    }
}

impl SubstitutionModel for Jc69Model {
    fn n_states(&self) -> usize {
        DNA_STATES
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn rate_matrix(&self) -> Vec<Vec<f64>> {
        let mut q = vec![vec![1.0 / 3.0; 4]; 4];
        for (i, row) in q.iter_mut().enumerate() {
            row[i] = -1.0;
        }
        q
    }

    fn transition_probs(&self, t: f64) -> Vec<Vec<f64>> {
        models::jc69_probability(t)
            .iter()
            .map(|row| row.to_vec())
            .collect()
    }
}

/// HKY85: transition/transversion ratio `kappa` plus base frequencies.
#[derive(Debug, Clone, PartialEq)]
pub struct Hky85Model {
    pub kappa: f64,
    pub freqs: [f64; 4],
}

impl Hky85Model {
    pub fn new(kappa: f64, freqs: [f64; 4]) -> Result<Self> {
        if !(kappa > 0.0 && kappa.is_finite()) {
            return Err(StsError::InvalidInput(format!(
                "kappa must be positive, got {}",
                kappa
            )));
        }
        check_frequencies(&freqs)?;
        Ok(Self { kappa, freqs })
    }
}

impl SubstitutionModel for Hky85Model {
    fn n_states(&self) -> usize {
        DNA_STATES
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn rate_matrix(&self) -> Vec<Vec<f64>> {
        // Transitions are A<->G (0,2) and C<->T (1,3).
        let k = self.kappa;
        let s = vec![
            vec![0.0, 1.0, k, 1.0],
            vec![1.0, 0.0, 1.0, k],
            vec![k, 1.0, 0.0, 1.0],
            vec![1.0, k, 1.0, 0.0],
        ];
        build_rate_matrix(&s, &self.freqs)
    }
}

/// General time-reversible model.
#[derive(Debug, Clone, PartialEq)]
pub struct GtrModel {
    /// Exchangeabilities in the order AC, AG, AT, CG, CT, GT.
    pub rates: [f64; 6],
    pub freqs: [f64; 4],
}

impl GtrModel {
    pub fn new(rates: [f64; 6], freqs: [f64; 4]) -> Result<Self> {
        if rates.iter().any(|&r| !(r > 0.0 && r.is_finite())) {
            return Err(StsError::InvalidInput(
                "GTR exchangeabilities must be positive".into(),
            ));
        }
        check_frequencies(&freqs)?;
        Ok(Self { rates, freqs })
    }
}

impl SubstitutionModel for GtrModel {
    fn n_states(&self) -> usize {
        DNA_STATES
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn rate_matrix(&self) -> Vec<Vec<f64>> {
        let [ac, ag, at, cg, ct, gt] = self.rates;
        let s = vec![
            vec![0.0, ac, ag, at],
            vec![ac, 0.0, cg, ct],
            vec![ag, cg, 0.0, gt],
            vec![at, ct, gt, 0.0],
        ];
        build_rate_matrix(&s, &self.freqs)
    }
}

/// Equal-exchangeability amino acid model (Poisson, optionally with
/// empirical frequencies).
#[derive(Debug, Clone, PartialEq)]
pub struct PoissonProteinModel {
    freqs: Vec<f64>,
}

impl PoissonProteinModel {
    /// Uniform frequencies.
    pub fn new() -> Self {
        Self {
            freqs: vec![1.0 / AA_STATES as f64; AA_STATES],
        }
    }

    /// Custom equilibrium frequencies (20 values summing to 1).
    pub fn with_frequencies(freqs: Vec<f64>) -> Result<Self> {
        if freqs.len() != AA_STATES {
            return Err(StsError::InvalidInput(format!(
                "expected {} amino acid frequencies, got {}",
                AA_STATES,
                freqs.len()
            )));
        }
        check_frequencies(&freqs)?;
        Ok(Self { freqs })
    }
}

impl Default for PoissonProteinModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SubstitutionModel for PoissonProteinModel {
    fn n_states(&self) -> usize {
        AA_STATES
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn rate_matrix(&self) -> Vec<Vec<f64>> {
        let s = vec![vec![1.0; AA_STATES]; AA_STATES];
        build_rate_matrix(&s, &self.freqs)
    }
}

/// Build a normalized rate matrix Q from exchangeability matrix S and frequencies pi.
///
/// Q\[i\]\[j\] = S\[i\]\[j\] * pi\[j\] for i != j, rows sum to 0,
/// normalized so -sum(pi_i * Q_ii) = 1.
pub(crate) fn build_rate_matrix(exchangeabilities: &[Vec<f64>], freqs: &[f64]) -> Vec<Vec<f64>> {
    let n = freqs.len();
    let mut q = vec![vec![0.0; n]; n];

    for i in 0..n {
        for j in 0..n {
            if i != j {
                q[i][j] = exchangeabilities[i][j] * freqs[j];
            }
        }
        let off_diag: f64 = (0..n).filter(|&j| j != i).map(|j| q[i][j]).sum();
        q[i][i] = -off_diag;
    }

    let mu: f64 = (0..n).map(|i| -freqs[i] * q[i][i]).sum();
    if mu > 0.0 {
        for row in q.iter_mut() {
            for v in row.iter_mut() {
                *v /= mu;
            }
        }
    }
    q
}

/// Eigen system of a reversible rate matrix via its `√π` symmetrisation.
///
/// With `B = U Λ Uᵀ`: `V = diag(1/√π) U` and `V⁻¹ = Uᵀ diag(√π)`.
pub fn symmetric_eigen_decomposition(q: &[Vec<f64>], freqs: &[f64]) -> EigenDecomposition {
    let n = q.len();
    let sqrt_pi: Vec<f64> = freqs.iter().map(|&f| f.sqrt()).collect();

    let mut b = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            b[i][j] = sqrt_pi[i] * q[i][j] / sqrt_pi[j];
        }
    }
    // Remove asymmetric round-off before the rotations.
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (b[i][j] + b[j][i]);
            b[i][j] = avg;
            b[j][i] = avg;
        }
    }

    let (eigenvalues, u) = jacobi_eigen(&b);
    let mut eigenvectors = vec![0.0; n * n];
    let mut inverse_eigenvectors = vec![0.0; n * n];
    for i in 0..n {
        for k in 0..n {
            eigenvectors[i * n + k] = u[i][k] / sqrt_pi[i];
            inverse_eigenvectors[k * n + i] = u[i][k] * sqrt_pi[i];
        }
    }
    EigenDecomposition {
        n_states: n,
        eigenvalues,
        eigenvectors,
        inverse_eigenvectors,
    }
}

/// Cyclic Jacobi eigendecomposition for real symmetric matrices.
///
/// Returns (eigenvalues, eigenvectors) where eigenvectors\[i\]\[k\] is the
/// i-th component of the k-th eigenvector.
fn jacobi_eigen(matrix: &[Vec<f64>]) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = matrix.len();
    let mut a: Vec<Vec<f64>> = matrix.to_vec();
    let mut v: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            let mut row = vec![0.0; n];
            row[i] = 1.0;
            row
        })
        .collect();

    for _sweep in 0..100 {
        let off: f64 = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .map(|(i, j)| a[i][j] * a[i][j])
            .sum();
        if off < 1e-30 {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                if a[p][q].abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[k][p];
                    let akq = a[k][q];
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p][k];
                    let aqk = a[q][k];
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                a[p][q] = 0.0;
                a[q][p] = 0.0;

                for row in v.iter_mut() {
                    let vp = row[p];
                    let vq = row[q];
                    row[p] = c * vp - s * vq;
                    row[q] = s * vp + c * vq;
                }
            }
        }
    }

    let eigenvalues: Vec<f64> = (0..n).map(|i| a[i][i]).collect();
    (eigenvalues, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[Vec<f64>], b: &[Vec<f64>], tol: f64) {
        for (i, (ra, rb)) in a.iter().zip(b).enumerate() {
            for (j, (x, y)) in ra.iter().zip(rb).enumerate() {
                assert!((x - y).abs() < tol, "({},{}): {} vs {}", i, j, x, y);
            }
        }
    }

    #[test]
    fn eigen_jc69_matches_closed_form() {
        let model = Jc69Model::new();
        let eigen = model.eigen_decomposition();
        for &t in &[0.0, 0.01, 0.1, 0.5, 2.0] {
            let flat = eigen.transition_matrix(t);
            let p: Vec<Vec<f64>> = flat.chunks(4).map(|r| r.to_vec()).collect();
            assert_close(&p, &model.transition_probs(t), 1e-12);
        }
        let mut ev = eigen.eigenvalues.clone();
        ev.sort_by(|a, b| a.total_cmp(b));
        assert!(ev[3].abs() < 1e-12);
        for &l in &ev[..3] {
            assert!((l + 4.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn eigen_reconstructs_rate_matrix() {
        let model = GtrModel::new([1.0, 2.0, 0.5, 1.5, 3.0, 1.0], [0.1, 0.2, 0.3, 0.4]).unwrap();
        let eigen = model.eigen_decomposition();
        let n = 4;
        let mut q = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                q[i][j] = (0..n)
                    .map(|k| {
                        eigen.eigenvectors[i * n + k]
                            * eigen.eigenvalues[k]
                            * eigen.inverse_eigenvectors[k * n + j]
                    })
                    .sum();
            }
        }
        assert_close(&q, &model.rate_matrix(), 1e-10);
    }

    #[test]
    fn rows_sum_to_one_and_stationary() {
        let hky = Hky85Model::new(4.0, [0.3, 0.2, 0.2, 0.3]).unwrap();
        let p = hky.transition_probs(0.4);
        for row in &p {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-10);
        }
        // π P = π
        for j in 0..4 {
            let pj: f64 = (0..4).map(|i| hky.freqs[i] * p[i][j]).sum();
            assert!((pj - hky.freqs[j]).abs() < 1e-10);
        }
    }

    #[test]
    fn hky_kappa_one_is_f81_like() {
        let hky = Hky85Model::new(1.0, [0.25; 4]).unwrap();
        assert_close(
            &hky.transition_probs(0.3),
            &Jc69Model::new().transition_probs(0.3),
            1e-10,
        );
    }

    #[test]
    fn rate_matrix_normalized() {
        let gtr = GtrModel::new([1.0, 2.0, 1.0, 1.0, 2.0, 1.0], [0.3, 0.2, 0.2, 0.3]).unwrap();
        let q = gtr.rate_matrix();
        let mu: f64 = (0..4).map(|i| -gtr.freqs[i] * q[i][i]).sum();
        assert!((mu - 1.0).abs() < 1e-12);
    }

    #[test]
    fn protein_model_transition_probs() {
        let model = PoissonProteinModel::new();
        assert_eq!(model.n_states(), 20);
        let p = model.transition_probs(0.5);
        // Poisson: P(same) = 1/20 + 19/20 exp(-20t/19)
        let same = 0.05 + 0.95 * (-20.0 * 0.5 / 19.0_f64).exp();
        assert!((p[3][3] - same).abs() < 1e-10);
        assert!((p[3].iter().sum::<f64>() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(Hky85Model::new(-1.0, [0.25; 4]).is_err());
        assert!(Hky85Model::new(2.0, [0.5, 0.5, 0.5, 0.5]).is_err());
        assert!(GtrModel::new([1.0, 0.0, 1.0, 1.0, 1.0, 1.0], [0.25; 4]).is_err());
        assert!(PoissonProteinModel::with_frequencies(vec![0.25; 4]).is_err());
    }
}

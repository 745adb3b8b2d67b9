//! Likelihood backend: indexed partials buffers, transition matrices and
//! scale buffers behind a small batched API.
//!
//! The engine never touches partials directly. It describes work as batches
//! of [`Operation`]s and matrix updates over integer handles, so a backend
//! is free to keep its storage wherever it likes. [`CpuBackend`] is the
//! bundled reference implementation.
//!
//! Partials are laid out `[rate][site][state]`. Every combine operation
//! rescales its destination per site (when enabled) and records the log
//! scale factor against the destination buffer; scale factors are summed
//! into cumulative scale buffers before a root evaluation.

use sts_core::BackendError;

use crate::subst_model::EigenDecomposition;

type BackendResult<T> = std::result::Result<T, BackendError>;

/// Allocation sizes of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDims {
    pub n_buffers: usize,
    pub n_matrices: usize,
    pub n_scale_buffers: usize,
    pub n_rates: usize,
    pub n_sites: usize,
    pub n_states: usize,
}

impl BackendDims {
    /// Values per partials buffer.
    pub fn partials_len(&self) -> usize {
        self.n_rates * self.n_sites * self.n_states
    }
}

/// `destination ← (P[matrix1] · child1) ⊙ (P[matrix2] · child2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation {
    pub destination: usize,
    pub child1: usize,
    pub matrix1: usize,
    pub child2: usize,
    pub matrix2: usize,
}

/// Batched likelihood kernel interface.
///
/// Every method reports contract violations as [`BackendError`]; none of
/// them is recoverable by retrying.
pub trait LikelihoodBackend: Send {
    /// Allocation sizes.
    fn dims(&self) -> BackendDims;

    /// Overwrite a partials buffer and clear its scale factors.
    fn set_partials(&mut self, buffer: usize, values: &[f64]) -> BackendResult<()>;

    /// Copy a partials buffer into `out`.
    fn get_partials(&self, buffer: usize, out: &mut [f64]) -> BackendResult<()>;

    fn set_eigen_decomposition(&mut self, eigen: &EigenDecomposition) -> BackendResult<()>;

    fn set_state_frequencies(&mut self, freqs: &[f64]) -> BackendResult<()>;

    fn set_category_rates(&mut self, rates: &[f64]) -> BackendResult<()>;

    fn set_category_weights(&mut self, weights: &[f64]) -> BackendResult<()>;

    /// Recompute `P(rate · length)` for each `(matrix, length)` pair.
    fn update_transition_matrices(&mut self, updates: &[(usize, f64)]) -> BackendResult<()>;

    /// Execute a batch of combine operations in order.
    fn update_partials(&mut self, operations: &[Operation]) -> BackendResult<()>;

    /// Sum over sites of the log scale factors recorded for `buffer`.
    fn buffer_log_scale(&self, buffer: usize) -> BackendResult<f64>;

    /// Zero a cumulative scale buffer.
    fn reset_scale_factors(&mut self, cumulative: usize) -> BackendResult<()>;

    /// Add the per-site scale factors of `buffers` into `cumulative`.
    fn accumulate_scale_factors(
        &mut self,
        buffers: &[usize],
        cumulative: usize,
    ) -> BackendResult<()>;

    /// `Σ_site ln(Σ_rate w Σ_state π · partials)` plus the cumulative scale.
    fn root_log_likelihood(&self, buffer: usize, cumulative: Option<usize>) -> BackendResult<f64>;

    /// Log-likelihood across an edge: `parent` on the upper side, `child`
    /// propagated through `matrix`.
    fn edge_log_likelihood(
        &self,
        parent: usize,
        child: usize,
        matrix: usize,
        cumulative: Option<usize>,
    ) -> BackendResult<f64>;
}

/// Plain-loop CPU implementation of [`LikelihoodBackend`].
#[derive(Debug, Clone)]
pub struct CpuBackend {
    dims: BackendDims,
    rescaling: bool,
    partials: Vec<Vec<f64>>,
    /// Per buffer, per site `ln` scale factor.
    site_scales: Vec<Vec<f64>>,
    cumulative: Vec<Vec<f64>>,
    /// Per matrix, `n_rates` row-major `n_states²` blocks.
    matrices: Vec<Vec<f64>>,
    eigen: Option<EigenDecomposition>,
    freqs: Option<Vec<f64>>,
    rates: Option<Vec<f64>>,
    weights: Option<Vec<f64>>,
}

impl CpuBackend {
    /// Allocate all storage up front. Rescaling is enabled.
    pub fn new(dims: BackendDims) -> Self {
        let len = dims.partials_len();
        let n2 = dims.n_states * dims.n_states;
        Self {
            dims,
            rescaling: true,
            partials: vec![vec![0.0; len]; dims.n_buffers],
            site_scales: vec![vec![0.0; dims.n_sites]; dims.n_buffers],
            cumulative: vec![vec![0.0; dims.n_sites]; dims.n_scale_buffers],
            matrices: vec![vec![0.0; dims.n_rates * n2]; dims.n_matrices],
            eigen: None,
            freqs: None,
            rates: None,
            weights: None,
        }
    }

    /// Enable or disable per-site rescaling of combine results.
    pub fn with_rescaling(mut self, rescaling: bool) -> Self {
        self.rescaling = rescaling;
        self
    }

    fn check_buffer(&self, index: usize) -> BackendResult<()> {
        if index >= self.dims.n_buffers {
            return Err(BackendError::BufferOutOfRange {
                index,
                limit: self.dims.n_buffers,
            });
        }
        Ok(())
    }

    fn check_matrix(&self, index: usize) -> BackendResult<()> {
        if index >= self.dims.n_matrices {
            return Err(BackendError::MatrixOutOfRange {
                index,
                limit: self.dims.n_matrices,
            });
        }
        Ok(())
    }

    fn check_scale(&self, index: usize) -> BackendResult<()> {
        if index >= self.dims.n_scale_buffers {
            return Err(BackendError::ScaleBufferOutOfRange {
                index,
                limit: self.dims.n_scale_buffers,
            });
        }
        Ok(())
    }

    fn check_len(what: &'static str, expected: usize, got: usize) -> BackendResult<()> {
        if expected != got {
            return Err(BackendError::DimensionMismatch {
                what,
                expected,
                got,
            });
        }
        Ok(())
    }

    fn site_log_likelihoods<F>(
        &self,
        cumulative: Option<usize>,
        mut site_value: F,
    ) -> BackendResult<f64>
    where
        F: FnMut(usize, usize, &[f64]) -> f64,
    {
        let freqs = self
            .freqs
            .as_deref()
            .ok_or(BackendError::Uninitialized("state frequencies"))?;
        let weights = self
            .weights
            .as_deref()
            .ok_or(BackendError::Uninitialized("category weights"))?;
        if let Some(c) = cumulative {
            self.check_scale(c)?;
        }
        let mut total = 0.0;
        for site in 0..self.dims.n_sites {
            let mut sum = 0.0;
            for (rate, &w) in weights.iter().enumerate() {
                sum += w * site_value(rate, site, freqs);
            }
            if !(sum > 0.0) {
                return Ok(f64::NEG_INFINITY);
            }
            total += sum.ln();
        }
        if let Some(c) = cumulative {
            total += self.cumulative[c].iter().sum::<f64>();
        }
        Ok(total)
    }
}

impl LikelihoodBackend for CpuBackend {
    fn dims(&self) -> BackendDims {
        self.dims
    }

    fn set_partials(&mut self, buffer: usize, values: &[f64]) -> BackendResult<()> {
        self.check_buffer(buffer)?;
        Self::check_len("partials", self.dims.partials_len(), values.len())?;
        self.partials[buffer].copy_from_slice(values);
        self.site_scales[buffer].iter_mut().for_each(|s| *s = 0.0);
        Ok(())
    }

    fn get_partials(&self, buffer: usize, out: &mut [f64]) -> BackendResult<()> {
        self.check_buffer(buffer)?;
        Self::check_len("partials", self.dims.partials_len(), out.len())?;
        out.copy_from_slice(&self.partials[buffer]);
        Ok(())
    }

    fn set_eigen_decomposition(&mut self, eigen: &EigenDecomposition) -> BackendResult<()> {
        let n = self.dims.n_states;
        Self::check_len("eigenvalues", n, eigen.eigenvalues.len())?;
        Self::check_len("eigenvectors", n * n, eigen.eigenvectors.len())?;
        Self::check_len("inverse eigenvectors", n * n, eigen.inverse_eigenvectors.len())?;
        self.eigen = Some(eigen.clone());
        Ok(())
    }

    fn set_state_frequencies(&mut self, freqs: &[f64]) -> BackendResult<()> {
        Self::check_len("state frequencies", self.dims.n_states, freqs.len())?;
        self.freqs = Some(freqs.to_vec());
        Ok(())
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> BackendResult<()> {
        Self::check_len("category rates", self.dims.n_rates, rates.len())?;
        self.rates = Some(rates.to_vec());
        Ok(())
    }

    fn set_category_weights(&mut self, weights: &[f64]) -> BackendResult<()> {
        Self::check_len("category weights", self.dims.n_rates, weights.len())?;
        self.weights = Some(weights.to_vec());
        Ok(())
    }

    fn update_transition_matrices(&mut self, updates: &[(usize, f64)]) -> BackendResult<()> {
        let eigen = self
            .eigen
            .as_ref()
            .ok_or(BackendError::Uninitialized("eigen decomposition"))?;
        let rates = self
            .rates
            .as_ref()
            .ok_or(BackendError::Uninitialized("category rates"))?;
        let n2 = self.dims.n_states * self.dims.n_states;
        for &(matrix, length) in updates {
            if matrix >= self.dims.n_matrices {
                return Err(BackendError::MatrixOutOfRange {
                    index: matrix,
                    limit: self.dims.n_matrices,
                });
            }
            if !(length >= 0.0 && length.is_finite()) {
                return Err(BackendError::InvalidBranchLength(length));
            }
            for (r, &rate) in rates.iter().enumerate() {
                let p = eigen.transition_matrix(rate * length);
                self.matrices[matrix][r * n2..(r + 1) * n2].copy_from_slice(&p);
            }
        }
        Ok(())
    }

    fn update_partials(&mut self, operations: &[Operation]) -> BackendResult<()> {
        let BackendDims {
            n_rates,
            n_sites,
            n_states: k,
            ..
        } = self.dims;
        for op in operations {
            self.check_buffer(op.destination)?;
            self.check_buffer(op.child1)?;
            self.check_buffer(op.child2)?;
            self.check_matrix(op.matrix1)?;
            self.check_matrix(op.matrix2)?;
            if op.destination == op.child1 || op.destination == op.child2 {
                return Err(BackendError::AliasedBuffers(op.destination));
            }

            let mut dest = std::mem::take(&mut self.partials[op.destination]);
            let c1 = &self.partials[op.child1];
            let c2 = &self.partials[op.child2];
            let m1 = &self.matrices[op.matrix1];
            let m2 = &self.matrices[op.matrix2];
            for r in 0..n_rates {
                let p1 = &m1[r * k * k..(r + 1) * k * k];
                let p2 = &m2[r * k * k..(r + 1) * k * k];
                for s in 0..n_sites {
                    let off = (r * n_sites + s) * k;
                    let x1 = &c1[off..off + k];
                    let x2 = &c2[off..off + k];
                    for i in 0..k {
                        let row1 = &p1[i * k..(i + 1) * k];
                        let row2 = &p2[i * k..(i + 1) * k];
                        let a: f64 = row1.iter().zip(x1).map(|(p, x)| p * x).sum();
                        let b: f64 = row2.iter().zip(x2).map(|(p, x)| p * x).sum();
                        dest[off + i] = a * b;
                    }
                }
            }

            let scales = &mut self.site_scales[op.destination];
            for (s, scale) in scales.iter_mut().enumerate() {
                *scale = 0.0;
                if !self.rescaling {
                    continue;
                }
                let max = (0..n_rates)
                    .flat_map(|r| {
                        let off = (r * n_sites + s) * k;
                        dest[off..off + k].iter().copied()
                    })
                    .fold(0.0_f64, f64::max);
                if max > 0.0 {
                    for r in 0..n_rates {
                        let off = (r * n_sites + s) * k;
                        dest[off..off + k].iter_mut().for_each(|v| *v /= max);
                    }
                    *scale = max.ln();
                }
            }
            self.partials[op.destination] = dest;
        }
        Ok(())
    }

    fn buffer_log_scale(&self, buffer: usize) -> BackendResult<f64> {
        self.check_buffer(buffer)?;
        Ok(self.site_scales[buffer].iter().sum())
    }

    fn reset_scale_factors(&mut self, cumulative: usize) -> BackendResult<()> {
        self.check_scale(cumulative)?;
        self.cumulative[cumulative].iter_mut().for_each(|s| *s = 0.0);
        Ok(())
    }

    fn accumulate_scale_factors(
        &mut self,
        buffers: &[usize],
        cumulative: usize,
    ) -> BackendResult<()> {
        self.check_scale(cumulative)?;
        for &b in buffers {
            self.check_buffer(b)?;
        }
        let (site_scales, acc) = (&self.site_scales, &mut self.cumulative[cumulative]);
        for &b in buffers {
            for (total, s) in acc.iter_mut().zip(&site_scales[b]) {
                *total += s;
            }
        }
        Ok(())
    }

    fn root_log_likelihood(&self, buffer: usize, cumulative: Option<usize>) -> BackendResult<f64> {
        self.check_buffer(buffer)?;
        let (n_sites, k) = (self.dims.n_sites, self.dims.n_states);
        let x = &self.partials[buffer];
        self.site_log_likelihoods(cumulative, |r, s, freqs| {
            let off = (r * n_sites + s) * k;
            x[off..off + k].iter().zip(freqs).map(|(v, p)| v * p).sum()
        })
    }

    fn edge_log_likelihood(
        &self,
        parent: usize,
        child: usize,
        matrix: usize,
        cumulative: Option<usize>,
    ) -> BackendResult<f64> {
        self.check_buffer(parent)?;
        self.check_buffer(child)?;
        self.check_matrix(matrix)?;
        let (n_sites, k) = (self.dims.n_sites, self.dims.n_states);
        let up = &self.partials[parent];
        let down = &self.partials[child];
        let m = &self.matrices[matrix];
        self.site_log_likelihoods(cumulative, |r, s, freqs| {
            let off = (r * n_sites + s) * k;
            let p = &m[r * k * k..(r + 1) * k * k];
            let x = &down[off..off + k];
            (0..k)
                .map(|i| {
                    let moved: f64 = p[i * k..(i + 1) * k].iter().zip(x).map(|(a, b)| a * b).sum();
                    freqs[i] * up[off + i] * moved
                })
                .sum()
        })
    }
}

//! Shared primitives for the sts online placement workspace.
//!
//! - **Error types**: [`StsError`], [`BackendError`] and [`Result`]
//! - **Log-space helpers**: [`LogProb`], [`log_sum_exp`], [`normalize_log_weights`]
//! - **Traits**: [`Summarizable`]

pub mod error;
pub mod prob;
pub mod traits;

pub use error::{BackendError, Result, StsError};
pub use prob::{log_sum_exp, normalize_log_weights, LogProb};
pub use traits::*;

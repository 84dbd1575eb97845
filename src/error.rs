// src/error.rs

//! Fatal error taxonomy for model fitting.
//!
//! Only invalid inputs, invalid configuration, and setup-time numerical
//! breakdowns are errors. Infeasible points met *during* optimization are not:
//! the likelihood maps them to a large penalty value so the optimizer keeps
//! searching (see [`crate::likelihood::INFEASIBLE`]).

use thiserror::Error;

/// A comprehensive error type for the model fitting process.
#[derive(Error, Debug)]
pub enum FitError {
    #[error(
        "response matrix is {x_rows}x{x_cols} but the phylogenetic covariance is {vphy_rows}x{vphy_cols}; expected one phylogeny row/column per taxon"
    )]
    PhylogenyShapeMismatch {
        x_rows: usize,
        x_cols: usize,
        vphy_rows: usize,
        vphy_cols: usize,
    },

    #[error("phylogenetic covariance is not symmetric at ({row}, {col})")]
    PhylogenyNotSymmetric { row: usize, col: usize },

    #[error(
        "measurement-error matrix is {found_rows}x{found_cols}; it must match the {expected_rows}x{expected_cols} response matrix"
    )]
    MeasurementErrorShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        found_cols: usize,
    },

    #[error("{found} predictor blocks were supplied for {expected} traits; pass one block per trait or none at all")]
    PredictorCountMismatch { expected: usize, found: usize },

    #[error("predictor block {index} has {found} rows but the response has {expected} taxa")]
    PredictorRowsMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error(
        "replicate response is {found_rows}x{found_cols} but the reference fit used {expected_rows}x{expected_cols}"
    )]
    ReplicateShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        found_cols: usize,
    },

    #[error("non-finite values found in {0}; all inputs must be finite")]
    NonFiniteInput(&'static str),

    #[error("response column {0} has zero variance and cannot be standardized")]
    ConstantResponse(usize),

    #[error("only {found} taxa were supplied, but at least {required} are needed to estimate a residual covariance")]
    TooFewTaxa { found: usize, required: usize },

    #[error("invalid option `{name}`: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    /// The residual covariance was not positive definite when seeding a fit.
    /// Fatal for the fit attempt in question; the bootstrap engine decides
    /// whether a replicate-level occurrence aborts the run or is recorded as a
    /// failed replicate.
    #[error("Cholesky decomposition of the residual covariance failed during {stage}; the traits may be collinear after predictor removal")]
    ResidualCovarianceNotPd { stage: String },

    #[error("a linear-algebra routine failed during setup or output assembly: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),

    #[error("optimizer backend failed: {0}")]
    BackendFailed(String),
}

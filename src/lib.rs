// src/lib.rs

//! # phylocorr
//!
//! Multivariate phylogenetic generalized least squares: estimates correlated
//! evolution among traits while controlling for shared phylogenetic history
//! and measurement error. Given trait values for related taxa, a phylogenetic
//! covariance, optional per-trait predictors, and optional measurement-error
//! estimates, a fit yields the among-trait correlation matrix, regression
//! coefficients with their covariance, and per-trait phylogenetic signal
//! strengths, by minimizing a numerically guarded profile log-likelihood with
//! a derivative-free backend. Estimator uncertainty can be quantified with a
//! parametric bootstrap.
//!
//! The typical entry point is [`fit`]:
//!
//! ```no_run
//! use phylocorr::{FitOptions, TraitData, fit};
//! # fn example(x: ndarray::Array2<f64>, vphy: ndarray::Array2<f64>) -> Result<(), phylocorr::FitError> {
//! let data = TraitData::without_predictors(x, vphy)?;
//! let result = fit(&data, &FitOptions::default())?;
//! println!("correlations: {:?}", result.correlations);
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod context;
pub mod covariance;
pub mod data;
pub mod error;
pub mod fit;
pub mod likelihood;
pub mod model;
pub mod optimize;
pub mod output;

pub use bootstrap::{
    BACKEND_FAILURE_CODE, BootReplicate, BootstrapEngine, BootstrapResults, ReplicateEstimates,
    RetainedReplicate, SETUP_FAILURE_CODE,
};
pub use context::FitContext;
pub use data::{Standardization, Standardized, TraitData, standardize};
pub use error::FitError;
pub use fit::fit;
pub use likelihood::{INFEASIBLE, profile_nll};
pub use model::{
    CoefficientTable, FitOptions, FitResult, KeepBoots, Method, RcondReport, SannSchedule,
    SetupFailurePolicy,
};
pub use optimize::{CodeConvention, CodeConventions, DriverState, OptimizerDriver, shared_code};
pub use output::{ModelSummary, assemble};

// src/model.rs

//! Configuration and user-facing result types.

use crate::bootstrap::BootstrapResults;
use crate::error::FitError;
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Schedule for the annealing stage of [`Method::Sann`].
#[derive(Debug, Clone, Copy)]
pub struct SannSchedule {
    /// Iteration budget for the annealing pass (the simplex polish afterwards
    /// uses the fit's own `max_iter`).
    pub maxit: u64,
    /// Starting temperature.
    pub temp: f64,
    /// Temperature-plateau length. The annealing backend exposes a reannealing
    /// cadence rather than evaluations-per-temperature, so this scales how
    /// often the schedule is restarted.
    pub tmax: u64,
}

impl Default for SannSchedule {
    fn default() -> Self {
        Self {
            maxit: 1000,
            temp: 1.1,
            tmax: 1,
        }
    }
}

/// The derivative-free backend used to minimize the profile likelihood.
///
/// A closed enumeration: one case per supported algorithm, each carrying its
/// own options. All backends see the same objective and starting point.
#[derive(Debug, Clone)]
pub enum Method {
    /// Nelder–Mead simplex.
    NelderMead,
    /// Simulated annealing followed by a Nelder–Mead polish of the annealed
    /// point. The two-stage composition is part of the contract: the polish
    /// materially changes convergence behavior and reported results come from
    /// it.
    Sann(SannSchedule),
    /// Powell-family linear/quadratic-model trust-region search.
    Cobyla,
}

/// Which bootstrap replicates retain their synthetic dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepBoots {
    None,
    All,
    /// Only replicates with a nonzero convergence code.
    Fail,
}

/// What to do when a bootstrap replicate's residual covariance is not positive
/// definite at setup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFailurePolicy {
    /// Abort the whole bootstrap run.
    Abort,
    /// Record the replicate as failed (with a dedicated convergence code and
    /// no estimates) and continue.
    RecordAsFailed,
}

/// Everything configurable about a fit.
#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Restricted maximum likelihood rather than full maximum likelihood.
    pub reml: bool,
    /// Constrain each phylogenetic signal to `[signal_lower, 1]`.
    pub constrain_signal: bool,
    /// Lower bound used by the signal constraint transform.
    pub signal_lower: f64,
    /// Emit a trace line (objective value and parameters) per evaluation.
    pub verbose: bool,
    /// Minimum acceptable reciprocal condition number; evaluation points whose
    /// covariance or information matrix falls below it are treated as
    /// infeasible.
    pub rcond_threshold: f64,
    /// Relative convergence tolerance handed to the backend.
    pub rel_tol: f64,
    /// Iteration/evaluation budget handed to the backend.
    pub max_iter: u64,
    pub method: Method,
    /// Number of parametric bootstrap replicates; zero disables the bootstrap.
    pub boot: usize,
    pub keep_boots: KeepBoots,
    pub setup_failure_policy: SetupFailurePolicy,
    /// Seeds the bootstrap noise generator and the annealing proposal kernel.
    /// Unseeded runs draw from entropy.
    pub seed: Option<u64>,
    /// Checked once per bootstrap replicate; when set, the loop stops cleanly,
    /// keeping already-recorded replicates.
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            reml: true,
            constrain_signal: false,
            signal_lower: 1e-7,
            verbose: false,
            rcond_threshold: 1e-10,
            rel_tol: 1e-6,
            max_iter: 1000,
            method: Method::NelderMead,
            boot: 0,
            keep_boots: KeepBoots::None,
            setup_failure_policy: SetupFailurePolicy::RecordAsFailed,
            seed: None,
            interrupt: None,
        }
    }
}

impl FitOptions {
    /// Rejects malformed configuration before any fitting begins.
    pub fn validate(&self) -> Result<(), FitError> {
        if !self.rel_tol.is_finite() || self.rel_tol <= 0.0 {
            return Err(FitError::InvalidOption {
                name: "rel_tol",
                reason: format!("must be a finite positive number, got {}", self.rel_tol),
            });
        }
        if self.max_iter == 0 {
            return Err(FitError::InvalidOption {
                name: "max_iter",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.rcond_threshold.is_finite() || self.rcond_threshold < 0.0 {
            return Err(FitError::InvalidOption {
                name: "rcond_threshold",
                reason: format!(
                    "must be a finite non-negative number, got {}",
                    self.rcond_threshold
                ),
            });
        }
        if !self.signal_lower.is_finite() || !(0.0..1.0).contains(&self.signal_lower) {
            return Err(FitError::InvalidOption {
                name: "signal_lower",
                reason: format!("must lie in [0, 1), got {}", self.signal_lower),
            });
        }
        if let Method::Sann(schedule) = &self.method {
            if !schedule.temp.is_finite() || schedule.temp <= 0.0 {
                return Err(FitError::InvalidOption {
                    name: "sann.temp",
                    reason: format!("must be a finite positive number, got {}", schedule.temp),
                });
            }
            if schedule.maxit == 0 {
                return Err(FitError::InvalidOption {
                    name: "sann.maxit",
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Coefficient estimates on the original data scale, with standard errors,
/// Z-scores, and two-sided normal p-values.
#[derive(Debug, Clone, Serialize)]
pub struct CoefficientTable {
    pub estimate: Array1<f64>,
    pub std_err: Array1<f64>,
    pub z: Array1<f64>,
    pub p_value: Array1<f64>,
}

/// Reciprocal condition numbers observed at the optimum, reported to help
/// users judge `rcond_threshold`. Diagnostics only; nothing is gated on them.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RcondReport {
    /// Of the assembled trait covariance `V`.
    pub covariance: f64,
    /// Of the GLS information matrix `UUᵀV⁻¹UU`.
    pub information: f64,
}

/// Everything a converged (or best-effort) fit reports.
#[derive(Debug, Clone, Serialize)]
pub struct FitResult {
    /// Among-trait correlation matrix.
    pub correlations: Array2<f64>,
    /// Per-trait phylogenetic signal strengths.
    pub signals: Array1<f64>,
    pub coefficients: CoefficientTable,
    pub coefficient_covariance: Array2<f64>,
    pub log_lik: f64,
    pub aic: f64,
    pub bic: f64,
    pub iterations: u64,
    /// Shared convergence taxonomy: `0` converged, `1` hit the
    /// iteration/evaluation budget, `> 1` backend-specific failure.
    pub convergence: i32,
    pub rcond: RcondReport,
    pub bootstrap: Option<BootstrapResults>,
}

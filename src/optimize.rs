// src/optimize.rs

//! # Optimizer Driver
//!
//! Adapts a [`FitContext`] and a [`Method`] to one of several derivative-free
//! backends, then writes the optimized vector, achieved objective, normalized
//! convergence code, and iteration count back into the context. One call is
//! one optimization attempt; the driver never retries.
//!
//! Every backend reports termination in its own vocabulary. Each adapter first
//! flattens its backend's outcome onto one raw integer scale (positive for
//! orderly termination, with budget exhaustion at the top of that range;
//! non-positive for failures), and the pure [`shared_code`] mapping then
//! collapses raw codes into the shared taxonomy: `0` converged, `1` hit the
//! iteration/evaluation budget, `> 1` backend-specific failure. The collapse
//! thresholds are per-backend configuration ([`CodeConventions`]), not
//! hard-coded, because they track each backend's documented code meanings.

use crate::context::FitContext;
use crate::error::FitError;
use crate::likelihood::profile_nll;
use crate::model::{FitOptions, Method, SannSchedule};
use argmin::core::{
    CostFunction, Error as ArgminError, Executor, State, TerminationReason, TerminationStatus,
};
use argmin::solver::neldermead::NelderMead;
use argmin::solver::simulatedannealing::{Anneal, SATempFunc, SimulatedAnnealing};
use cobyla::{Func, RhoBeg, StopTols, minimize};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;
use std::sync::Mutex;

/// Box half-width for the trust-region backend; the search lives in a region
/// where parameters are O(1), so this never binds in practice.
const SEARCH_BOUND: f64 = 1.0e3;

/// Where a driver is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Unfit,
    Fitting,
    Converged,
    Failed,
}

/// Raw-code collapse thresholds for one backend: raw codes in
/// `success_floor..limit_floor` are success, codes at or above `limit_floor`
/// mean the budget ran out, and non-positive codes are failures mapped to
/// `|code| + 1`.
#[derive(Debug, Clone, Copy)]
pub struct CodeConvention {
    pub success_floor: i32,
    pub limit_floor: i32,
}

impl Default for CodeConvention {
    fn default() -> Self {
        Self {
            success_floor: 1,
            limit_floor: 5,
        }
    }
}

/// Per-backend code conventions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeConventions {
    pub nelder_mead: CodeConvention,
    pub sann: CodeConvention,
    pub cobyla: CodeConvention,
}

impl CodeConventions {
    fn for_method(&self, method: &Method) -> CodeConvention {
        match method {
            Method::NelderMead => self.nelder_mead,
            Method::Sann(_) => self.sann,
            Method::Cobyla => self.cobyla,
        }
    }
}

/// Collapses a backend's raw status code into the shared taxonomy.
pub fn shared_code(raw: i32, convention: CodeConvention) -> i32 {
    if raw >= convention.success_floor && raw < convention.limit_floor {
        0
    } else if raw >= convention.limit_floor {
        1
    } else {
        raw.abs() + 1
    }
}

/// What one backend invocation produced, on the raw code scale.
struct BackendRun {
    par: Vec<f64>,
    objective: f64,
    raw_code: i32,
    iterations: u64,
}

/// Drives one fit through a chosen backend.
#[derive(Debug)]
pub struct OptimizerDriver {
    state: DriverState,
    conventions: CodeConventions,
}

impl OptimizerDriver {
    pub fn new() -> Self {
        Self {
            state: DriverState::Unfit,
            conventions: CodeConventions::default(),
        }
    }

    /// Overrides the per-backend raw-code collapse thresholds.
    pub fn with_conventions(conventions: CodeConventions) -> Self {
        Self {
            state: DriverState::Unfit,
            conventions,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Runs the configured backend from `ctx.par0` and writes the results back
    /// into `ctx`. Errors only on backend setup/infrastructure failure;
    /// non-convergence is reported through the convergence code instead.
    pub fn fit(&mut self, ctx: &mut FitContext, options: &FitOptions) -> Result<(), FitError> {
        self.state = DriverState::Fitting;
        let start = ctx.par0.to_vec();
        let run = match &options.method {
            Method::NelderMead => {
                nelder_mead_run(ctx, start, options.rel_tol, options.max_iter)
            }
            Method::Sann(schedule) => sann_run(
                ctx,
                start,
                schedule,
                options.rel_tol,
                options.max_iter,
                options.seed,
            ),
            Method::Cobyla => cobyla_run(ctx, start, options.rel_tol, options.max_iter),
        };
        let run = match run {
            Ok(run) => run,
            Err(e) => {
                self.state = DriverState::Failed;
                return Err(e);
            }
        };

        let code = shared_code(run.raw_code, self.conventions.for_method(&options.method));
        ctx.min_par = Array1::from(run.par);
        ctx.objective = run.objective;
        ctx.convergence = Some(code);
        ctx.iterations = run.iterations;
        if ctx.verbose {
            log::debug!(
                "optimizer finished: nll {:.6}, code {code}, {} iterations",
                ctx.objective,
                ctx.iterations
            );
        }
        self.state = if code == 0 {
            DriverState::Converged
        } else {
            DriverState::Failed
        };
        Ok(())
    }
}

impl Default for OptimizerDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// The likelihood as an argmin problem. Infeasible points already come back as
/// a large finite penalty, so the cost call itself never fails.
struct Objective<'a> {
    ctx: &'a FitContext,
}

impl CostFunction for Objective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, par: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(profile_nll(par, self.ctx))
    }
}

/// The likelihood plus a proposal kernel for the annealing stage.
struct AnnealingObjective<'a> {
    ctx: &'a FitContext,
    rng: Mutex<StdRng>,
}

impl CostFunction for AnnealingObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, par: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(profile_nll(par, self.ctx))
    }
}

impl Anneal for AnnealingObjective<'_> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;
    type Float = f64;

    /// Nudges one random coordinate per unit of remaining temperature.
    fn anneal(&self, param: &Self::Param, extent: Self::Float) -> Result<Self::Output, ArgminError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ArgminError::msg("annealing proposal generator poisoned"))?;
        let mut next = param.clone();
        for _ in 0..(extent.floor() as u64 + 1) {
            let idx = rng.gen_range(0..param.len());
            next[idx] += rng.gen_range(-0.1..0.1);
        }
        Ok(next)
    }
}

/// Initial simplex: the starting point plus one vertex per dimension, each
/// perturbed by 10% of the coordinate's magnitude.
fn initial_simplex(start: &[f64]) -> Vec<Vec<f64>> {
    let mut vertices = Vec::with_capacity(start.len() + 1);
    vertices.push(start.to_vec());
    for i in 0..start.len() {
        let step = if start[i] == 0.0 {
            0.1
        } else {
            0.1 * start[i].abs()
        };
        let mut vertex = start.to_vec();
        vertex[i] += step;
        vertices.push(vertex);
    }
    vertices
}

fn raw_termination_code(status: &TerminationStatus) -> i32 {
    match status {
        TerminationStatus::Terminated(TerminationReason::SolverConverged) => 1,
        TerminationStatus::Terminated(TerminationReason::TargetCostReached) => 2,
        TerminationStatus::Terminated(TerminationReason::MaxItersReached) => 5,
        TerminationStatus::Terminated(TerminationReason::Timeout) => 6,
        TerminationStatus::Terminated(TerminationReason::KeyboardInterrupt) => -5,
        TerminationStatus::NotTerminated => 5,
        _ => -1,
    }
}

fn nelder_mead_run(
    ctx: &FitContext,
    start: Vec<f64>,
    rel_tol: f64,
    max_iter: u64,
) -> Result<BackendRun, FitError> {
    let solver: NelderMead<Vec<f64>, f64> = NelderMead::new(initial_simplex(&start))
        .with_sd_tolerance(rel_tol)
        .map_err(|e| FitError::BackendFailed(format!("simplex setup: {e}")))?;
    let res = Executor::new(Objective { ctx }, solver)
        .configure(|state| state.max_iters(max_iter))
        .run()
        .map_err(|e| FitError::BackendFailed(format!("simplex run: {e}")))?;
    let state = res.state();
    let par = state.get_best_param().cloned().unwrap_or(start);
    Ok(BackendRun {
        par,
        objective: state.get_best_cost(),
        raw_code: raw_termination_code(state.get_termination_status()),
        iterations: state.get_iter(),
    })
}

fn sann_run(
    ctx: &FitContext,
    start: Vec<f64>,
    schedule: &SannSchedule,
    rel_tol: f64,
    max_iter: u64,
    seed: Option<u64>,
) -> Result<BackendRun, FitError> {
    let rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let problem = AnnealingObjective {
        ctx,
        rng: Mutex::new(rng),
    };
    let solver = SimulatedAnnealing::new(schedule.temp)
        .map_err(|e| FitError::BackendFailed(format!("annealing setup: {e}")))?
        .with_temp_func(SATempFunc::Boltzmann)
        .with_reannealing_fixed(schedule.tmax.saturating_mul(100).max(100));
    let res = Executor::new(problem, solver)
        .configure(|state| state.param(start.clone()).max_iters(schedule.maxit))
        .run()
        .map_err(|e| FitError::BackendFailed(format!("annealing run: {e}")))?;
    let refined = res.state().get_best_param().cloned().unwrap_or(start);

    // The annealing pass only refines the starting point; the simplex polish
    // is part of the method's contract and supplies the reported results.
    nelder_mead_run(ctx, refined, rel_tol, max_iter)
}

fn cobyla_run(
    ctx: &FitContext,
    start: Vec<f64>,
    rel_tol: f64,
    max_iter: u64,
) -> Result<BackendRun, FitError> {
    let evals = Cell::new(0_u64);
    let objective = |par: &[f64], _data: &mut ()| {
        evals.set(evals.get() + 1);
        profile_nll(par, ctx)
    };
    let constraints: Vec<&dyn Func<()>> = Vec::new();
    let bounds = vec![(-SEARCH_BOUND, SEARCH_BOUND); start.len()];
    let stop = StopTols {
        ftol_rel: rel_tol,
        ftol_abs: rel_tol,
        xtol_rel: 1e-4,
        ..StopTols::default()
    };
    let maxeval = max_iter as usize;
    let outcome = minimize(
        objective,
        &start,
        &bounds,
        &constraints,
        (),
        maxeval,
        RhoBeg::All(0.5),
        Some(stop),
    );
    let (par, objective_value, succeeded) = match outcome {
        Ok((_, par, value)) => (par, value, true),
        Err((_, par, value)) => (par, value, false),
    };
    let iterations = evals.get();
    let raw_code = if iterations >= maxeval as u64 {
        5
    } else if succeeded {
        1
    } else {
        -1
    };
    Ok(BackendRun {
        par,
        objective: objective_value,
        raw_code,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_code_collapses_like_the_backends_document() {
        let convention = CodeConvention::default();
        // Orderly termination below the budget floor is success.
        assert_eq!(shared_code(1, convention), 0);
        assert_eq!(shared_code(4, convention), 0);
        // Budget exhaustion.
        assert_eq!(shared_code(5, convention), 1);
        assert_eq!(shared_code(6, convention), 1);
        // Failures keep their identity on the shared scale.
        assert_eq!(shared_code(0, convention), 1);
        assert_eq!(shared_code(-1, convention), 2);
        assert_eq!(shared_code(-5, convention), 6);
    }

    #[test]
    fn shared_code_thresholds_are_configurable() {
        let strict = CodeConvention {
            success_floor: 1,
            limit_floor: 2,
        };
        assert_eq!(shared_code(1, strict), 0);
        assert_eq!(shared_code(4, strict), 1);
    }

    #[test]
    fn simplex_has_one_vertex_per_dimension_plus_start() {
        let simplex = initial_simplex(&[0.0, 2.0, -4.0]);
        assert_eq!(simplex.len(), 4);
        assert_eq!(simplex[0], vec![0.0, 2.0, -4.0]);
        assert_eq!(simplex[1][0], 0.1);
        assert!((simplex[2][1] - 2.2).abs() < 1e-12);
        assert!((simplex[3][2] + 3.6).abs() < 1e-12);
    }

    #[test]
    fn argmin_termination_lands_on_the_raw_scale() {
        assert_eq!(
            raw_termination_code(&TerminationStatus::Terminated(
                TerminationReason::SolverConverged
            )),
            1
        );
        assert_eq!(
            raw_termination_code(&TerminationStatus::Terminated(
                TerminationReason::MaxItersReached
            )),
            5
        );
        assert_eq!(raw_termination_code(&TerminationStatus::NotTerminated), 5);
    }
}

// src/fit.rs

//! # Fitting Pipeline
//!
//! The orchestration entry point: validates configuration and data, builds the
//! fit context, runs the optimizer driver, assembles output, and — when
//! requested — hands the converged fit to the bootstrap engine.

use crate::bootstrap::BootstrapEngine;
use crate::context::FitContext;
use crate::data::TraitData;
use crate::error::FitError;
use crate::model::{FitOptions, FitResult};
use crate::optimize::OptimizerDriver;
use crate::output;

/// Fits the multivariate phylogenetic GLS model.
///
/// Always returns a result object — possibly with a nonzero convergence code —
/// except for fatal setup or configuration errors, which abort with a
/// descriptive cause. Bootstrap replicate failures never abort the run; they
/// are counted in the result and optionally retained for inspection.
pub fn fit(data: &TraitData, options: &FitOptions) -> Result<FitResult, FitError> {
    options.validate()?;
    data.validate()?;

    log::info!(
        "fitting {} traits across {} taxa ({} likelihood)",
        data.n_traits(),
        data.n_taxa(),
        if options.reml { "restricted" } else { "full" }
    );

    let mut ctx = FitContext::from_data(data, options)?;
    let mut driver = OptimizerDriver::new();
    driver.fit(&mut ctx, options)?;
    let convergence = ctx
        .convergence
        .expect("driver recorded a convergence code");
    log::info!(
        "optimization finished with code {convergence} after {} iterations",
        ctx.iterations
    );

    let summary = output::assemble(&ctx)?;

    let bootstrap = if options.boot > 0 {
        log::info!("running {} bootstrap replicates", options.boot);
        let engine = BootstrapEngine::new(&ctx, &summary.coefficients.estimate)?;
        Some(engine.run(data, &ctx, options)?)
    } else {
        None
    };

    Ok(FitResult {
        correlations: summary.correlations,
        signals: summary.signals,
        coefficients: summary.coefficients,
        coefficient_covariance: summary.coefficient_covariance,
        log_lik: summary.log_lik,
        aic: summary.aic,
        bic: summary.bic,
        iterations: ctx.iterations,
        convergence,
        rcond: summary.rcond,
        bootstrap,
    })
}

// src/likelihood.rs

//! # Profile Log-Likelihood
//!
//! The objective minimized by the optimizer driver: the negative (restricted)
//! profile log-likelihood of the GLS model as a pure function of the parameter
//! vector and the fit context. Backends may evaluate arbitrary parameter
//! sequences, including re-evaluating earlier points, so no state is carried
//! between calls and the same vector always yields the same value.
//!
//! Numerical trouble is not an error here. Out-of-domain signal parameters
//! (strict extraction), a covariance or information matrix whose reciprocal
//! condition number falls below the context's threshold, and non-finite
//! determinants all map to [`INFEASIBLE`], a value no genuine likelihood can
//! reach, so the optimizer simply treats the region as unfavorable.

use crate::context::FitContext;
use crate::covariance::{self, SignalMode};
use ndarray_linalg::{Determinant, Inverse, ReciprocalConditionNum, Solve};

/// Sentinel objective for infeasible evaluation points.
pub const INFEASIBLE: f64 = 1.0e10;

/// Negative profile log-likelihood at `par`, or [`INFEASIBLE`].
pub fn profile_nll(par: &[f64], ctx: &FitContext) -> f64 {
    match feasible_nll(par, ctx) {
        Some(value) => {
            if ctx.verbose {
                log::debug!("nll {value:.6} at {par:?}");
            }
            value
        }
        None => INFEASIBLE,
    }
}

fn feasible_nll(par: &[f64], ctx: &FitContext) -> Option<f64> {
    let n = ctx.n_taxa;
    let p = ctx.n_traits;

    let l = covariance::correlation_factor(par, p);
    let r = l.t().dot(&l);
    let d = covariance::signal_params(
        par,
        p,
        ctx.constrain_signal,
        ctx.signal_lower,
        SignalMode::Strict,
    )?;

    let c = covariance::ou_covariance(n, p, &ctx.tau, &d, &ctx.vphy, &r);
    let v = covariance::with_measurement_error(&c, &ctx.mm);
    let rc = v.rcond().ok()?;
    if !rc.is_finite() || rc < ctx.rcond_threshold {
        return None;
    }

    let iv = v.inv().ok()?;
    let information = ctx.uu.t().dot(&iv).dot(&ctx.uu);
    let rc = information.rcond().ok()?;
    if !rc.is_finite() || rc < ctx.rcond_threshold {
        return None;
    }

    let rhs = ctx.uu.t().dot(&iv).dot(&ctx.xx);
    let b0 = information.solve(&rhs).ok()?;
    let h = &ctx.xx - &ctx.uu.dot(&b0);

    let (_, ln_det_iv) = iv.sln_det().ok()?;
    let logdet_v = -ln_det_iv;
    if !logdet_v.is_finite() {
        return None;
    }

    let quad = h.dot(&iv.dot(&h));
    if ctx.reml {
        let (_, ln_det_info) = information.sln_det().ok()?;
        Some(0.5 * (logdet_v + ln_det_info + quad))
    } else {
        Some(0.5 * (logdet_v + quad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TraitData;
    use crate::model::FitOptions;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn example_context() -> FitContext {
        let n = 6;
        let mut rng = StdRng::seed_from_u64(11);
        let x = Array2::from_shape_fn((n, 2), |_| rng.sample::<f64, _>(StandardNormal));
        let vphy = Array2::from_shape_fn((n, n), |(a, b)| {
            if a == b {
                1.0
            } else if a / 3 == b / 3 {
                0.5
            } else {
                0.1
            }
        });
        let data = TraitData::without_predictors(x, vphy).unwrap();
        FitContext::from_data(&data, &FitOptions::default()).unwrap()
    }

    #[test]
    fn evaluation_is_deterministic() {
        let ctx = example_context();
        let par = ctx.par0.to_vec();
        let first = profile_nll(&par, &ctx);
        let second = profile_nll(&par, &ctx);
        assert!(first.is_finite());
        assert!(first < INFEASIBLE);
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn degenerate_signal_product_hits_the_sentinel() {
        let ctx = example_context();
        // Unconstrained signals of exactly one make the OU law divide zero by
        // zero; the condition-number guard must turn that into the sentinel.
        let mut par = ctx.par0.to_vec();
        let p = ctx.n_traits;
        for value in par.iter_mut().skip(p * (p + 1) / 2) {
            *value = 1.0;
        }
        assert_eq!(profile_nll(&par, &ctx), INFEASIBLE);
    }

    #[test]
    fn strict_domain_violation_hits_the_sentinel() {
        let ctx = example_context();
        let mut par = ctx.par0.to_vec();
        let last = par.len() - 1;
        par[last] = 11.0;
        assert_eq!(profile_nll(&par, &ctx), INFEASIBLE);
    }

    #[test]
    fn reml_and_full_objectives_differ() {
        let mut ctx = example_context();
        let par = ctx.par0.to_vec();
        let reml_value = profile_nll(&par, &ctx);
        ctx.reml = false;
        let ml_value = profile_nll(&par, &ctx);
        assert!(reml_value.is_finite());
        assert!(ml_value.is_finite());
        assert_ne!(reml_value, ml_value);
    }

    #[test]
    fn an_extreme_rcond_threshold_rejects_every_point() {
        let mut ctx = example_context();
        let par = ctx.par0.to_vec();
        assert!(profile_nll(&par, &ctx) < INFEASIBLE);
        ctx.rcond_threshold = 1.0;
        assert_eq!(profile_nll(&par, &ctx), INFEASIBLE);
    }
}

// src/context.rs

//! # Fit Context
//!
//! [`FitContext`] owns every matrix one model fit needs — the flattened
//! response, the block-diagonal design, squared measurement errors, the
//! normalized phylogeny and its distance structure — plus the starting
//! parameter vector and, after fitting, the optimizer's results.
//!
//! There are two construction paths. [`FitContext::from_data`] derives
//! everything from raw data. [`FitContext::from_data_with_reference`] is the
//! bootstrap path: it standardizes the replicate's data but copies `Vphy`,
//! `tau`, and the design verbatim from the reference fit. Re-deriving them
//! would normalize the phylogeny twice, and replicates that refuse to converge
//! under the doubly-normalized structure will happily converge when refit on
//! their own — irreproducible behavior this constructor exists to rule out.

use crate::covariance::packed_len;
use crate::data::{Standardization, TraitData, standardize};
use crate::error::FitError;
use crate::model::FitOptions;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Cholesky, Determinant, Solve, UPLO};

/// All state for one model fit, original or bootstrap replicate.
#[derive(Debug, Clone)]
pub struct FitContext {
    /// Standardized response, columns stacked into one vector of length `n·p`.
    pub xx: Array1<f64>,
    /// Block-diagonal design: per-trait intercept columns followed by the
    /// predictor columns that show variation.
    pub uu: Array2<f64>,
    /// Squared standardized measurement errors, flattened like `xx`.
    pub mm: Array1<f64>,
    /// Phylogenetic covariance, normalized so its largest entry is one and its
    /// log-determinant is zero.
    pub vphy: Array2<f64>,
    /// Phylogenetic distance structure: `tau[a, b] = Vphy[b, b] − Vphy[a, b]`.
    pub tau: Array2<f64>,
    /// Which predictor columns (per trait) entered the design; also drives
    /// coefficient back-scaling.
    pub kept: Vec<Vec<bool>>,
    /// Scale factors from standardization, for undoing it in output assembly
    /// and bootstrap noise generation.
    pub scale: Standardization,
    pub reml: bool,
    pub constrain_signal: bool,
    pub signal_lower: f64,
    pub verbose: bool,
    pub rcond_threshold: f64,
    /// Starting parameter vector: packed residual Cholesky strips followed by
    /// 0.5 for each signal parameter.
    pub par0: Array1<f64>,
    pub n_taxa: usize,
    pub n_traits: usize,
    /// Optimized parameter vector (equals `par0` until fitted).
    pub min_par: Array1<f64>,
    /// Minimized negative profile log-likelihood.
    pub objective: f64,
    /// Shared convergence code; `None` until a driver has run.
    pub convergence: Option<i32>,
    pub iterations: u64,
}

impl FitContext {
    /// Builds a context from raw data, deriving all phylogeny-dependent
    /// structures.
    pub fn from_data(data: &TraitData, options: &FitOptions) -> Result<Self, FitError> {
        data.validate()?;
        let n = data.n_taxa();
        let p = data.n_traits();

        let mut vphy = data.vphy.clone();
        let max = vphy.iter().fold(f64::NEG_INFINITY, |a, &v| a.max(v));
        vphy.mapv_inplace(|v| v / max);
        let (_, ln_det) = vphy.sln_det()?;
        let det_scale = (ln_det / n as f64).exp();
        vphy.mapv_inplace(|v| v / det_scale);

        let diag: Vec<f64> = (0..n).map(|k| vphy[[k, k]]).collect();
        let tau = Array2::from_shape_fn((n, n), |(a, b)| diag[b] - vphy[[a, b]]);

        let (std_data, scale) = standardize(&data.x, &data.u, &data.m)?;
        let (uu, kept) = assemble_design(&std_data.u, n, p);
        let xx = flatten_columns(&std_data.x);
        let mm = flatten_columns(&std_data.m.mapv(|v| v * v));
        let par0 = seed_parameters(&std_data.x, &std_data.u, &kept, "model fitting")?;

        Ok(Self {
            xx,
            uu,
            mm,
            vphy,
            tau,
            kept,
            scale,
            reml: options.reml,
            constrain_signal: options.constrain_signal,
            signal_lower: options.signal_lower,
            verbose: options.verbose,
            rcond_threshold: options.rcond_threshold,
            min_par: par0.clone(),
            par0,
            n_taxa: n,
            n_traits: p,
            objective: f64::NAN,
            convergence: None,
            iterations: 0,
        })
    }

    /// Builds a context for new response data while reusing the reference
    /// fit's phylogeny-derived structures (`Vphy`, `tau`, design, kept mask)
    /// verbatim. Required for bootstrap replicates; see the module docs.
    pub fn from_data_with_reference(
        x: &Array2<f64>,
        u: &[Array2<f64>],
        m: &Array2<f64>,
        reference: &FitContext,
    ) -> Result<Self, FitError> {
        let n = reference.n_taxa;
        let p = reference.n_traits;
        if x.dim() != (n, p) {
            return Err(FitError::ReplicateShapeMismatch {
                expected_rows: n,
                expected_cols: p,
                found_rows: x.nrows(),
                found_cols: x.ncols(),
            });
        }

        let (std_data, scale) = standardize(x, u, m)?;
        let xx = flatten_columns(&std_data.x);
        let mm = flatten_columns(&std_data.m.mapv(|v| v * v));
        let par0 = seed_parameters(&std_data.x, &std_data.u, &reference.kept, "a bootstrap replicate")?;

        Ok(Self {
            xx,
            uu: reference.uu.clone(),
            mm,
            vphy: reference.vphy.clone(),
            tau: reference.tau.clone(),
            kept: reference.kept.clone(),
            scale,
            reml: reference.reml,
            constrain_signal: reference.constrain_signal,
            signal_lower: reference.signal_lower,
            verbose: reference.verbose,
            rcond_threshold: reference.rcond_threshold,
            min_par: par0.clone(),
            par0,
            n_taxa: n,
            n_traits: p,
            objective: f64::NAN,
            convergence: None,
            iterations: 0,
        })
    }
}

/// Stacks the columns of an `n×p` matrix into one length-`n·p` vector.
fn flatten_columns(a: &Array2<f64>) -> Array1<f64> {
    let (n, _) = a.dim();
    Array1::from_shape_fn(a.len(), |k| a[[k % n, k / n]])
}

/// Assembles the block-diagonal design: `kron(I_p, 1_n)` intercept columns,
/// then each trait's predictor columns placed in that trait's row block —
/// keeping only columns that show variation once assembled.
fn assemble_design(us: &[Array2<f64>], n: usize, p: usize) -> (Array2<f64>, Vec<Vec<bool>>) {
    let mut columns: Vec<Array1<f64>> = Vec::with_capacity(p);
    for i in 0..p {
        let mut col = Array1::zeros(n * p);
        for a in 0..n {
            col[i * n + a] = 1.0;
        }
        columns.push(col);
    }

    let mut kept = Vec::with_capacity(us.len());
    for (i, block) in us.iter().enumerate() {
        let mut kept_block = Vec::with_capacity(block.ncols());
        for j in 0..block.ncols() {
            let mut col = Array1::zeros(n * p);
            for a in 0..n {
                col[i * n + a] = block[[a, j]];
            }
            let keep = has_variation(&col);
            if keep {
                columns.push(col);
            }
            kept_block.push(keep);
        }
        kept.push(kept_block);
    }

    let mut uu = Array2::zeros((n * p, columns.len()));
    for (k, col) in columns.iter().enumerate() {
        uu.column_mut(k).assign(col);
    }
    (uu, kept)
}

/// Positive maximum first difference, the design-column retention test.
fn has_variation(col: &Array1<f64>) -> bool {
    col.iter()
        .zip(col.iter().skip(1))
        .map(|(a, b)| b - a)
        .fold(f64::NEG_INFINITY, f64::max)
        > 0.0
}

/// Per-trait residuals against the trait's own kept predictors (or the
/// centered response when it has none), shared by both construction paths.
fn per_trait_residuals(
    xs: &Array2<f64>,
    us: &[Array2<f64>],
    kept: &[Vec<bool>],
) -> Result<Array2<f64>, FitError> {
    let mut eps = xs.clone();
    if us.is_empty() {
        return Ok(eps);
    }
    let n = xs.nrows();
    for i in 0..xs.ncols() {
        let cols: Vec<usize> = kept[i]
            .iter()
            .enumerate()
            .filter_map(|(j, &keep)| keep.then_some(j))
            .collect();
        if cols.is_empty() {
            let mean = xs.column(i).mean().unwrap_or(0.0);
            for a in 0..n {
                eps[[a, i]] = xs[[a, i]] - mean;
            }
        } else {
            let uk = Array2::from_shape_fn((n, cols.len()), |(a, j)| us[i][[a, cols[j]]]);
            let xtx = uk.t().dot(&uk);
            let xty = uk.t().dot(&xs.column(i));
            let coef = xtx.solve(&xty)?;
            let fitted = uk.dot(&coef);
            for a in 0..n {
                eps[[a, i]] = xs[[a, i]] - fitted[a];
            }
        }
    }
    Ok(eps)
}

fn sample_covariance(eps: &Array2<f64>) -> Array2<f64> {
    let (n, p) = eps.dim();
    let means: Vec<f64> = (0..p).map(|j| eps.column(j).mean().unwrap_or(0.0)).collect();
    let denom = (n - 1) as f64;
    Array2::from_shape_fn((p, p), |(i, j)| {
        let mut acc = 0.0;
        for a in 0..n {
            acc += (eps[[a, i]] - means[i]) * (eps[[a, j]] - means[j]);
        }
        acc / denom
    })
}

/// Packs the Cholesky factor of the residual covariance into the leading
/// strips of the starting vector; signal entries start at 0.5. Fails fast when
/// the residual covariance is not positive definite.
fn seed_parameters(
    xs: &Array2<f64>,
    us: &[Array2<f64>],
    kept: &[Vec<bool>],
    stage: &str,
) -> Result<Array1<f64>, FitError> {
    let p = xs.ncols();
    let eps = per_trait_residuals(xs, us, kept)?;
    let cov = sample_covariance(&eps);
    let l = cov
        .cholesky(UPLO::Lower)
        .map_err(|_| FitError::ResidualCovarianceNotPd {
            stage: stage.to_string(),
        })?;
    let mut par0 = Array1::from_elem(packed_len(p), 0.5);
    let mut idx = 0;
    for col in 0..p {
        for row in col..p {
            par0[idx] = l[[row, col]];
            idx += 1;
        }
    }
    Ok(par0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn example_data(seed: u64) -> TraitData {
        let n = 8;
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, 2), |_| rng.sample::<f64, _>(StandardNormal));
        // Two clades of four taxa, Brownian-style shared history.
        let vphy = Array2::from_shape_fn((n, n), |(a, b)| {
            if a == b {
                1.0
            } else if a / 4 == b / 4 {
                0.5
            } else {
                0.0
            }
        });
        TraitData::without_predictors(x, vphy).unwrap()
    }

    #[test]
    fn normalized_phylogeny_has_unit_generalized_mean() {
        let ctx = FitContext::from_data(&example_data(1), &FitOptions::default()).unwrap();
        let (_, ln_det) = ctx.vphy.sln_det().unwrap();
        assert_abs_diff_eq!(ln_det, 0.0, epsilon = 1e-9);
        // tau is zero on the diagonal by construction.
        for a in 0..ctx.n_taxa {
            assert_abs_diff_eq!(ctx.tau[[a, a]], 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn starting_vector_packs_factor_then_signals() {
        let ctx = FitContext::from_data(&example_data(2), &FitOptions::default()).unwrap();
        assert_eq!(ctx.par0.len(), packed_len(2));
        // Trailing signal entries keep the flat 0.5 start.
        assert_eq!(ctx.par0[3], 0.5);
        assert_eq!(ctx.par0[4], 0.5);
        // The leading diagonal entry of a Cholesky factor is positive.
        assert!(ctx.par0[0] > 0.0);
    }

    #[test]
    fn reference_construction_reuses_structures_bit_for_bit() {
        let data = example_data(3);
        let reference = FitContext::from_data(&data, &FitOptions::default()).unwrap();

        let mut rng = StdRng::seed_from_u64(99);
        let synthetic =
            Array2::from_shape_fn((8, 2), |_| rng.sample::<f64, _>(StandardNormal));
        let m = Array2::zeros((8, 2));

        let first =
            FitContext::from_data_with_reference(&synthetic, &[], &m, &reference).unwrap();
        let second =
            FitContext::from_data_with_reference(&synthetic, &[], &m, &reference).unwrap();

        assert_eq!(first.vphy, reference.vphy);
        assert_eq!(first.tau, reference.tau);
        assert_eq!(first.uu, reference.uu);
        assert_eq!(first.vphy, second.vphy);
        assert_eq!(first.tau, second.tau);
        assert_eq!(first.uu, second.uu);
        assert_eq!(first.par0, second.par0);
    }

    #[test]
    fn design_keeps_only_varying_predictor_columns() {
        let n = 8;
        let mut rng = StdRng::seed_from_u64(4);
        let x = Array2::from_shape_fn((n, 2), |_| rng.sample::<f64, _>(StandardNormal));
        let vphy = Array2::eye(n) + Array2::from_elem((n, n), 0.2);
        let varying = Array2::from_shape_fn((n, 1), |_| rng.sample::<f64, _>(StandardNormal));
        let constant = Array2::from_elem((n, 1), 3.0);
        let u = vec![varying, constant];
        let data = TraitData::new(x, u, Array2::zeros((n, 2)), vphy).unwrap();

        let ctx = FitContext::from_data(&data, &FitOptions::default()).unwrap();
        assert_eq!(ctx.kept, vec![vec![true], vec![false]]);
        // Two intercept columns plus the single varying predictor column.
        assert_eq!(ctx.uu.ncols(), 3);
    }

    #[test]
    fn collinear_traits_fail_fast_at_setup() {
        let n = 8;
        let mut rng = StdRng::seed_from_u64(5);
        let base = Array1::from_shape_fn(n, |_| rng.sample::<f64, _>(StandardNormal));
        let x = Array2::from_shape_fn((n, 2), |(a, j)| if j == 0 { base[a] } else { 2.0 * base[a] });
        let vphy = Array2::eye(n) + Array2::from_elem((n, n), 0.2);
        let data = TraitData::without_predictors(x, vphy).unwrap();

        let err = FitContext::from_data(&data, &FitOptions::default()).unwrap_err();
        assert!(matches!(err, FitError::ResidualCovarianceNotPd { .. }));
    }
}

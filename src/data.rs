// src/data.rs

//! # Input Data and Standardization
//!
//! This module is the entry point for user-provided matrices. [`TraitData`]
//! bundles the trait values, optional per-trait predictor blocks, per-value
//! measurement errors, and the phylogenetic covariance, and validates their
//! shapes before any fitting begins.
//!
//! Standardization is a pure transform: it returns freshly standardized
//! matrices together with the [`Standardization`] scale factors needed to undo
//! it later (coefficient back-scaling, bootstrap noise rescaling). Nothing is
//! rescaled in place, so the caller's data is never aliased by a fit.

use crate::error::FitError;
use ndarray::{Array1, Array2};

/// Trait values and their covariance structure, validated and ready to fit.
#[derive(Debug, Clone)]
pub struct TraitData {
    /// Trait values, one row per taxon, one column per trait.
    pub x: Array2<f64>,
    /// Per-trait predictor blocks. Either empty (no predictors anywhere) or
    /// exactly one block per trait; a block may have zero columns.
    pub u: Vec<Array2<f64>>,
    /// Standard errors of the trait values, same shape as `x`. Zeros mean the
    /// values are treated as observed without error.
    pub m: Array2<f64>,
    /// Phylogenetic covariance between taxa, e.g. a Brownian-motion covariance
    /// derived from branch lengths.
    pub vphy: Array2<f64>,
}

impl TraitData {
    pub fn new(
        x: Array2<f64>,
        u: Vec<Array2<f64>>,
        m: Array2<f64>,
        vphy: Array2<f64>,
    ) -> Result<Self, FitError> {
        let data = Self { x, u, m, vphy };
        data.validate()?;
        Ok(data)
    }

    /// Convenience constructor for the common no-predictor, no-error case.
    pub fn without_predictors(x: Array2<f64>, vphy: Array2<f64>) -> Result<Self, FitError> {
        let m = Array2::zeros(x.raw_dim());
        Self::new(x, Vec::new(), m, vphy)
    }

    pub fn n_taxa(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_traits(&self) -> usize {
        self.x.ncols()
    }

    /// Rejects malformed inputs before any fitting begins.
    pub fn validate(&self) -> Result<(), FitError> {
        let (n, p) = self.x.dim();
        if n < 3 {
            return Err(FitError::TooFewTaxa {
                found: n,
                required: 3,
            });
        }
        if self.vphy.nrows() != n || self.vphy.ncols() != n {
            return Err(FitError::PhylogenyShapeMismatch {
                x_rows: n,
                x_cols: p,
                vphy_rows: self.vphy.nrows(),
                vphy_cols: self.vphy.ncols(),
            });
        }
        let tol = 1e-8 * self.vphy.iter().fold(1.0_f64, |a, &v| a.max(v.abs()));
        for row in 0..n {
            for col in (row + 1)..n {
                if (self.vphy[[row, col]] - self.vphy[[col, row]]).abs() > tol {
                    return Err(FitError::PhylogenyNotSymmetric { row, col });
                }
            }
        }
        if self.m.dim() != (n, p) {
            return Err(FitError::MeasurementErrorShapeMismatch {
                expected_rows: n,
                expected_cols: p,
                found_rows: self.m.nrows(),
                found_cols: self.m.ncols(),
            });
        }
        if !self.u.is_empty() && self.u.len() != p {
            return Err(FitError::PredictorCountMismatch {
                expected: p,
                found: self.u.len(),
            });
        }
        for (index, block) in self.u.iter().enumerate() {
            if block.ncols() > 0 && block.nrows() != n {
                return Err(FitError::PredictorRowsMismatch {
                    index,
                    expected: n,
                    found: block.nrows(),
                });
            }
            if block.iter().any(|v| !v.is_finite()) {
                return Err(FitError::NonFiniteInput("a predictor block"));
            }
        }
        if self.x.iter().any(|v| !v.is_finite()) {
            return Err(FitError::NonFiniteInput("the response matrix"));
        }
        if self.m.iter().any(|v| !v.is_finite()) {
            return Err(FitError::NonFiniteInput("the measurement-error matrix"));
        }
        if self.vphy.iter().any(|v| !v.is_finite()) {
            return Err(FitError::NonFiniteInput("the phylogenetic covariance"));
        }
        Ok(())
    }
}

/// Standardized copies of the input matrices.
#[derive(Debug, Clone)]
pub struct Standardized {
    pub x: Array2<f64>,
    pub u: Vec<Array2<f64>>,
    pub m: Array2<f64>,
}

/// The per-column offsets and scales applied during standardization, kept so
/// estimates can be mapped back to the original data scale and bootstrap noise
/// can be rescaled to it.
#[derive(Debug, Clone)]
pub struct Standardization {
    pub x_mean: Array1<f64>,
    pub x_sd: Array1<f64>,
    pub u_mean: Vec<Array1<f64>>,
    pub u_sd: Vec<Array1<f64>>,
}

/// Standardizes response, predictor, and measurement-error matrices.
///
/// Response columns become zero-mean/unit-sd, and the matching error column is
/// divided by the *original* response standard deviation so errors stay on the
/// standardized response scale. Predictor columns are centered, and scaled only
/// when they actually vary; a zero-variance column is left unscaled.
pub fn standardize(
    x: &Array2<f64>,
    u: &[Array2<f64>],
    m: &Array2<f64>,
) -> Result<(Standardized, Standardization), FitError> {
    let (n, p) = x.dim();
    let mut xs = x.clone();
    let mut ms = m.clone();
    let mut x_mean = Array1::zeros(p);
    let mut x_sd = Array1::zeros(p);
    for j in 0..p {
        let mean = x.column(j).mean().unwrap_or(0.0);
        let sd = x.column(j).std(1.0);
        if sd == 0.0 {
            return Err(FitError::ConstantResponse(j));
        }
        x_mean[j] = mean;
        x_sd[j] = sd;
        for a in 0..n {
            xs[[a, j]] = (x[[a, j]] - mean) / sd;
            ms[[a, j]] = m[[a, j]] / sd;
        }
    }

    let mut us = Vec::with_capacity(u.len());
    let mut u_mean = Vec::with_capacity(u.len());
    let mut u_sd = Vec::with_capacity(u.len());
    for block in u {
        let q = block.ncols();
        let mut centered = block.clone();
        let mut means = Array1::zeros(q);
        let mut sds = Array1::zeros(q);
        for j in 0..q {
            let mean = block.column(j).mean().unwrap_or(0.0);
            let sd = block.column(j).std(1.0);
            means[j] = mean;
            sds[j] = sd;
            for a in 0..n {
                centered[[a, j]] -= mean;
                if sd > 0.0 {
                    centered[[a, j]] /= sd;
                }
            }
        }
        us.push(centered);
        u_mean.push(means);
        u_sd.push(sds);
    }

    Ok((
        Standardized { x: xs, u: us, m: ms },
        Standardization {
            x_mean,
            x_sd,
            u_mean,
            u_sd,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn example_phylogeny() -> Array2<f64> {
        array![
            [1.0, 0.5, 0.0, 0.0],
            [0.5, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.5],
            [0.0, 0.0, 0.5, 1.0],
        ]
    }

    #[test]
    fn standardized_response_is_zero_mean_unit_sd() {
        let x = array![[1.0, 10.0], [2.0, 14.0], [3.0, 11.0], [7.0, 13.0]];
        let m = Array2::zeros((4, 2));
        let (std_data, scale) = standardize(&x, &[], &m).unwrap();
        for j in 0..2 {
            assert_abs_diff_eq!(std_data.x.column(j).mean().unwrap(), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(std_data.x.column(j).std(1.0), 1.0, epsilon = 1e-12);
            assert!(scale.x_sd[j] > 0.0);
        }
    }

    #[test]
    fn error_columns_scale_with_the_response_sd() {
        let x = array![[1.0], [2.0], [3.0], [6.0]];
        let m = array![[0.5], [0.5], [0.5], [0.5]];
        let (std_data, scale) = standardize(&x, &[], &m).unwrap();
        for a in 0..4 {
            assert_abs_diff_eq!(std_data.m[[a, 0]], 0.5 / scale.x_sd[0], epsilon = 1e-12);
        }
    }

    #[test]
    fn constant_predictor_column_is_centered_but_not_scaled() {
        let x = array![[1.0], [2.0], [3.0], [6.0]];
        let m = Array2::zeros((4, 1));
        let u = vec![array![[2.0, 1.0], [2.0, 3.0], [2.0, 4.0], [2.0, 8.0]]];
        let (std_data, scale) = standardize(&x, &u, &m).unwrap();
        assert_eq!(scale.u_sd[0][0], 0.0);
        for a in 0..4 {
            assert_abs_diff_eq!(std_data.u[0][[a, 0]], 0.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(std_data.u[0].column(1).std(1.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_response_column_is_rejected() {
        let x = array![[1.0], [1.0], [1.0], [1.0]];
        let m = Array2::zeros((4, 1));
        let err = standardize(&x, &[], &m).unwrap_err();
        assert!(matches!(err, FitError::ConstantResponse(0)));
    }

    #[test]
    fn validation_rejects_shape_mismatches() {
        let x = array![[1.0, 2.0], [2.0, 1.0], [3.0, 4.0], [4.0, 3.0]];
        let bad_m = Array2::zeros((3, 2));
        let err = TraitData::new(x.clone(), Vec::new(), bad_m, example_phylogeny()).unwrap_err();
        assert!(matches!(err, FitError::MeasurementErrorShapeMismatch { .. }));

        let err = TraitData::without_predictors(x.clone(), Array2::eye(3)).unwrap_err();
        assert!(matches!(err, FitError::PhylogenyShapeMismatch { .. }));

        let one_block = vec![Array2::zeros((4, 1))];
        let err = TraitData::new(x, one_block, Array2::zeros((4, 2)), example_phylogeny())
            .unwrap_err();
        assert!(matches!(err, FitError::PredictorCountMismatch { .. }));
    }
}

// src/covariance.rs

//! # Parametric Covariance Model
//!
//! Pure functions mapping the flat optimization vector to the model's matrix
//! pieces. The vector packs the lower-triangular entries of a Cholesky factor
//! of the among-trait correlation (column-major, diagonal-down strips,
//! `p(p+1)/2` entries) followed by one raw phylogenetic-signal value per trait.
//!
//! The correlation matrix is `LᵀL`, so it is symmetric and positive
//! semi-definite for every finite parameter vector; validity is guaranteed by
//! construction, never checked after the fact. The trait-pair covariance blocks
//! follow an Ornstein–Uhlenbeck law: covariance decays with phylogenetic
//! distance at a rate set by the two traits' signal strengths.
//!
//! Nothing here fails or checks conditioning. Numerical degeneracies (e.g. a
//! signal product of exactly one) surface as non-finite entries and are caught
//! by the likelihood's condition-number guards.

use ndarray::{Array1, Array2};

/// Raw signal entries further than this from zero are outside the usable
/// domain of the bounding transform; strict extraction rejects such points.
pub(crate) const RAW_SIGNAL_DOMAIN: f64 = 10.0;

/// Length of a packed parameter vector for `p` traits.
pub fn packed_len(p: usize) -> usize {
    p * (p + 1) / 2 + p
}

/// Unpacks the leading entries of `par` into the lower-triangular correlation
/// factor `L`, one diagonal-down column strip at a time.
pub fn correlation_factor(par: &[f64], p: usize) -> Array2<f64> {
    let mut l = Array2::zeros((p, p));
    let mut idx = 0;
    for col in 0..p {
        for row in col..p {
            l[[row, col]] = par[idx];
            idx += 1;
        }
    }
    l
}

/// Whether out-of-domain raw signal values reject the whole parameter vector.
///
/// `Strict` is used while the optimizer is searching, so that wandering far
/// outside the transform's domain reads as an infeasible point. `Lenient` is
/// used when reporting results and never rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMode {
    Strict,
    Lenient,
}

/// Extracts the per-trait phylogenetic signal parameters from `par`.
///
/// With `constrain` set, each raw value is mapped through a logistic transform
/// into `[lower, 1]`. Returns `None` only in [`SignalMode::Strict`] when a raw
/// value falls outside the transform's domain; the caller must treat that as an
/// infeasible point, not an error.
pub fn signal_params(
    par: &[f64],
    p: usize,
    constrain: bool,
    lower: f64,
    mode: SignalMode,
) -> Option<Array1<f64>> {
    let raw = &par[p * (p + 1) / 2..];
    if constrain {
        if mode == SignalMode::Strict && raw.iter().any(|v| v.abs() > RAW_SIGNAL_DOMAIN) {
            return None;
        }
        Some(
            raw.iter()
                .map(|v| lower + (1.0 - lower) / (1.0 + (-v).exp()))
                .collect(),
        )
    } else {
        if mode == SignalMode::Strict
            && raw.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b)) > RAW_SIGNAL_DOMAIN
        {
            return None;
        }
        Some(Array1::from_iter(raw.iter().copied()))
    }
}

/// Builds the `(n·p)×(n·p)` trait covariance from the OU decay law.
///
/// Block `(i, j)` is `R[i,j] · dᵢ^tau ∘ dⱼ^tauᵀ ∘ (1 − (dᵢdⱼ)^Vphy) / (1 − dᵢdⱼ)`,
/// where `∘` is element-wise and `tau` is the phylogenetic distance structure.
pub fn ou_covariance(
    n: usize,
    p: usize,
    tau: &Array2<f64>,
    d: &Array1<f64>,
    vphy: &Array2<f64>,
    r: &Array2<f64>,
) -> Array2<f64> {
    let mut c = Array2::zeros((n * p, n * p));
    for i in 0..p {
        for j in 0..p {
            let dij = d[i] * d[j];
            let scale = r[[i, j]];
            for a in 0..n {
                for b in 0..n {
                    let decay = d[i].powf(tau[[a, b]]) * d[j].powf(tau[[b, a]]);
                    let shared = (1.0 - dij.powf(vphy[[a, b]])) / (1.0 - dij);
                    c[[i * n + a, j * n + b]] = scale * decay * shared;
                }
            }
        }
    }
    c
}

/// Adds the squared measurement errors to the diagonal of `c`.
pub fn with_measurement_error(c: &Array2<f64>, mm: &Array1<f64>) -> Array2<f64> {
    let mut v = c.clone();
    for (k, &m2) in mm.iter().enumerate() {
        v[[k, k]] += m2;
    }
    v
}

/// Converts the reconstructed `R = LᵀL` to a correlation matrix.
pub fn to_correlation(r: &Array2<f64>) -> Array2<f64> {
    let p = r.nrows();
    Array2::from_shape_fn((p, p), |(i, j)| r[[i, j]] / (r[[i, i]] * r[[j, j]]).sqrt())
}

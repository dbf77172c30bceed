//! Fisher vector encoding.
//!
//! The encoder returns the raw gradients of the average log-likelihood with
//! respect to the mixture weights, means and variances:
//!
//! ```text
//! d_pi[k]    = S0[k] - pi[k]
//! d_mu[k]    = S1[k] - S0[k] mu[k]
//! d_sigma[k] = -S2[k] - S0[k] mu[k]^2 + S0[k] sigma2[k] + 2 S1[k] mu[k]
//! ```
//!
//! where `S0`, `S1`, `S2` are the zeroth, first and second order statistics
//! of the descriptors weighted by their posteriors and averaged over rows.
//!
//! NOTE: this is *not* the textbook "improved" Fisher vector. The gradients
//! are neither scaled by `1 / sqrt(pi)` and `1 / sigma` nor power and L2
//! normalized unless [`Normalization::PowerL2`] is requested. Existing feature
//! files are produced with [`Normalization::Raw`], which stays the default.

use serde::{Deserialize, Serialize};

use crate::*;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
/// Post-processing applied to every encoded vector.
pub enum Normalization {
    /// Raw sufficient-statistic gradients.
    Raw,
    /// Signed square root of every component, then L2 normalization.
    PowerL2,
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization::Raw
    }
}

/// Length of a Fisher vector for `k` components over `d` dimensions.
pub fn fisher_len(k: usize, d: usize) -> usize {
    k + 2 * k * d
}

/// Encode the rows of `x` (N, d) against a fitted mixture.
///
/// Deterministic for a given `(x, gmm)`; the output always has
/// [`fisher_len`]`(K, d)` components.
pub fn fisher_vector(x: &Desc, gmm: &GaussianMixture) -> FvResult<FisherVector> {
    let (n, d) = x.shape();
    if n == 0 {
        return Err(FvErr::DegenerateInput("no descriptors to encode".into()));
    }
    let k = gmm.n_components();

    // posteriors (N, K)
    let q = gmm.predict_proba(x)?;

    // sufficient statistics, averaged over rows
    let inv_n = 1. / n as f64;
    let s0: Vec<f64> = q.column_iter().map(|c| c.sum() * inv_n).collect();
    let s1 = (q.transpose() * x) * inv_n;
    let s2 = (q.transpose() * x.component_mul(x)) * inv_n;

    let means = gmm.means();
    let variances = gmm.variances();

    let mut fv: FisherVector = Vec::with_capacity(fisher_len(k, d));
    fv.extend((0..k).map(|c| s0[c] - gmm.weights()[c]));
    for c in 0..k {
        for j in 0..d {
            fv.push(s1[(c, j)] - s0[c] * means[(c, j)]);
        }
    }
    for c in 0..k {
        for j in 0..d {
            let mu = means[(c, j)];
            fv.push(
                -s2[(c, j)] - s0[c] * mu * mu + s0[c] * variances[(c, j)] + 2. * s1[(c, j)] * mu,
            );
        }
    }

    Ok(fv)
}

/// [`fisher_vector`] followed by the requested normalization.
pub fn encode(x: &Desc, gmm: &GaussianMixture, normalization: Normalization) -> FvResult<FisherVector> {
    let mut fv = fisher_vector(x, gmm)?;
    if normalization == Normalization::PowerL2 {
        fv.power_normalize();
        fv.l2_normalize();
    }
    Ok(fv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    fn two_component() -> GaussianMixture {
        GaussianMixture::new(
            DVector::from_vec(vec![0.25, 0.75]),
            DMatrix::from_row_slice(2, 2, &[-1., 0., 1., 2.]),
            DMatrix::from_row_slice(2, 2, &[0.5, 1., 2., 0.25]),
        )
        .unwrap()
    }

    fn descriptors() -> Desc {
        DMatrix::from_row_slice(4, 2, &[-1., 0.5, 0.8, 2.1, 0.2, 1.0, 1.5, 1.9])
    }

    #[test]
    fn length_is_k_plus_2kd() {
        let fv = fisher_vector(&descriptors(), &two_component()).unwrap();
        assert_eq!(fv.len(), fisher_len(2, 2));
        assert_eq!(fv.len(), 10);
        assert!(fv.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn single_component_has_closed_form() {
        // K = 1: every posterior is 1, so the statistics are plain moments
        let gmm = GaussianMixture::new(
            DVector::from_vec(vec![1.]),
            DMatrix::from_row_slice(1, 2, &[1., -1.]),
            DMatrix::from_row_slice(1, 2, &[2., 3.]),
        )
        .unwrap();
        let x = DMatrix::from_row_slice(2, 2, &[0., 0., 4., -4.]);
        let fv = fisher_vector(&x, &gmm).unwrap();

        // d_pi = 1 - 1
        assert_eq!(fv[0], 0.);
        // d_mu = mean(x) - mu = (2, -2) - (1, -1)
        assert!((fv[1] - 1.).abs() < 1e-12);
        assert!((fv[2] + 1.).abs() < 1e-12);
        // d_sigma = -E[x^2] - mu^2 + sigma2 + 2 E[x] mu
        assert!((fv[3] - (-8. - 1. + 2. + 4.)).abs() < 1e-12);
        assert!((fv[4] - (-8. - 1. + 3. + 4.)).abs() < 1e-12);
    }

    #[test]
    fn weight_gradient_sums_to_zero() {
        let fv = fisher_vector(&descriptors(), &two_component()).unwrap();
        assert!((fv[0] + fv[1]).abs() < 1e-9);
    }

    #[test]
    fn encoding_is_deterministic() {
        let gmm = two_component();
        let a = fisher_vector(&descriptors(), &gmm).unwrap();
        let b = fisher_vector(&descriptors(), &gmm).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn power_l2_has_unit_norm() {
        let fv = encode(&descriptors(), &two_component(), Normalization::PowerL2).unwrap();
        let norm: f64 = fv.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((norm - 1.).abs() < 1e-9);

        let raw = encode(&descriptors(), &two_component(), Normalization::Raw).unwrap();
        assert_eq!(raw, fisher_vector(&descriptors(), &two_component()).unwrap());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let x = DMatrix::from_element(3, 5, 0.);
        assert!(matches!(
            fisher_vector(&x, &two_component()),
            Err(FvErr::SchemaMismatch(_))
        ));
    }
}

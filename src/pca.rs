use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::*;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Linear projection onto the directions of greatest variance of a sample.
///
/// Components are ordered by descending explained variance. The sign of each
/// component is fixed so that its largest-magnitude loading is positive.
pub struct Pca {
    mean: DVector<f64>,
    /// (n_components, D), one principal axis per row.
    components: DMatrix<f64>,
    explained_variance: DVector<f64>,
}

impl Pca {
    /// Fit `n_components` principal axes on the rows of `x` through the
    /// eigen-decomposition of the sample covariance.
    pub fn fit(x: &Desc, n_components: usize) -> FvResult<Self> {
        let (n, dim) = x.shape();
        if n == 0 {
            return Err(FvErr::DegenerateInput("PCA on an empty matrix".into()));
        }
        if n_components == 0 || n_components > dim {
            return Err(FvErr::DegenerateInput(format!(
                "cannot keep {} components of {} dimensions",
                n_components, dim
            )));
        }
        if n < n_components {
            warn!(
                "PCA fit on {} rows for {} components, trailing components carry no variance",
                n, n_components
            );
        }

        let mean = DVector::from_iterator(dim, x.column_iter().map(|c| c.mean()));
        let centered = Self::center(x, &mean);
        let denom = if n > 1 { (n - 1) as f64 } else { 1. };
        let cov = (centered.transpose() * &centered) / denom;

        let eigen = cov.symmetric_eigen();
        let mut order: Vec<usize> = (0..dim).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut components: DMatrix<f64> = DMatrix::zeros(n_components, dim);
        let mut explained_variance: DVector<f64> = DVector::zeros(n_components);
        for (row, &idx) in order.iter().take(n_components).enumerate() {
            let axis = eigen.eigenvectors.column(idx);
            let pivot = axis
                .iter()
                .fold(0f64, |best, &v| if v.abs() > best.abs() { v } else { best });
            let sign = if pivot < 0. { -1. } else { 1. };
            for j in 0..dim {
                components[(row, j)] = sign * axis[j];
            }
            explained_variance[row] = eigen.eigenvalues[idx].max(0.);
        }

        debug!(
            "PCA {} -> {} dims on {} rows, retained variance {:.4}",
            dim,
            n_components,
            n,
            explained_variance.sum() / eigen.eigenvalues.iter().map(|v| v.max(0.)).sum::<f64>().max(f64::MIN_POSITIVE)
        );

        Ok(Self {
            mean,
            components,
            explained_variance,
        })
    }

    /// Project rows of `x` onto the fitted axes: (N, D) -> (N, n_components).
    pub fn transform(&self, x: &Desc) -> FvResult<Desc> {
        if x.ncols() != self.mean.len() {
            return Err(FvErr::SchemaMismatch(format!(
                "PCA fitted on {} dimensions, got {}",
                self.mean.len(),
                x.ncols()
            )));
        }
        Ok(Self::center(x, &self.mean) * self.components.transpose())
    }

    /// Fit on `x` keeping half of its dimensions and project it.
    pub fn reduce_by_half(x: &Desc) -> FvResult<Desc> {
        let dim = x.ncols();
        if dim < 2 || dim % 2 != 0 {
            return Err(FvErr::DegenerateInput(format!(
                "descriptor dimension {} cannot be halved",
                dim
            )));
        }
        Self::fit(x, dim / 2)?.transform(x)
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn components(&self) -> &DMatrix<f64> {
        &self.components
    }

    pub fn explained_variance(&self) -> &DVector<f64> {
        &self.explained_variance
    }

    fn center(x: &Desc, mean: &DVector<f64>) -> Desc {
        let mut centered = x.clone();
        for (j, mut col) in centered.column_iter_mut().enumerate() {
            col.add_scalar_mut(-mean[j]);
        }
        centered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn sample(n: usize, dim: usize, seed: u64) -> Desc {
        let mut rng = StdRng::seed_from_u64(seed);
        // correlated columns: each column mixes a few shared latent factors
        let latent = DMatrix::from_fn(n, 3, |_, _| rng.gen_range(-1.0..1.0));
        let mix = DMatrix::from_fn(3, dim, |_, _| rng.gen_range(-2.0..2.0));
        let noise = DMatrix::from_fn(n, dim, |_, _| rng.gen_range(-0.1..0.1));
        latent * mix + noise
    }

    fn covariance(x: &Desc) -> DMatrix<f64> {
        let mean = DVector::from_iterator(x.ncols(), x.column_iter().map(|c| c.mean()));
        let c = Pca::center(x, &mean);
        (c.transpose() * &c) / (x.nrows() - 1) as f64
    }

    #[test]
    fn halves_dimension() {
        let x = sample(40, 12, 1);
        let y = Pca::reduce_by_half(&x).unwrap();
        assert_eq!(y.shape(), (40, 6));
    }

    #[test]
    fn projected_columns_are_uncorrelated() {
        let x = sample(200, 10, 2);
        let y = Pca::reduce_by_half(&x).unwrap();
        let cov = covariance(&y);
        for i in 0..cov.nrows() {
            for j in 0..cov.ncols() {
                if i != j {
                    assert!(cov[(i, j)].abs() < 1e-8, "cov[{},{}] = {}", i, j, cov[(i, j)]);
                }
            }
        }
    }

    #[test]
    fn variance_is_descending_and_matches_projection() {
        let x = sample(100, 8, 3);
        let pca = Pca::fit(&x, 4).unwrap();
        let ev = pca.explained_variance();
        for w in ev.as_slice().windows(2) {
            assert!(w[0] >= w[1]);
        }
        let cov = covariance(&pca.transform(&x).unwrap());
        for i in 0..4 {
            assert!((cov[(i, i)] - ev[i]).abs() < 1e-8);
        }
    }

    #[test]
    fn sign_convention_is_fixed() {
        let x = sample(60, 6, 4);
        let pca = Pca::fit(&x, 3).unwrap();
        for row in pca.components().row_iter() {
            let pivot = row
                .iter()
                .fold(0f64, |best, &v| if v.abs() > best.abs() { v } else { best });
            assert!(pivot > 0.);
        }
    }

    #[test]
    fn odd_dimension_is_rejected() {
        let x = sample(10, 5, 5);
        assert!(matches!(Pca::reduce_by_half(&x), Err(FvErr::DegenerateInput(_))));
    }

    #[test]
    fn fewer_rows_than_components_still_projects() {
        let x = sample(2, 8, 6);
        let y = Pca::reduce_by_half(&x).unwrap();
        assert_eq!(y.shape(), (2, 4));
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn transform_checks_width() {
        let pca = Pca::fit(&sample(20, 6, 7), 3).unwrap();
        assert!(matches!(
            pca.transform(&sample(5, 8, 8)),
            Err(FvErr::SchemaMismatch(_))
        ));
    }
}

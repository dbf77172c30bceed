use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::*;

/// Added to every component's responsibility mass so empty components keep
/// a non-zero weight.
const MASS_FLOOR: f64 = 10. * f64::EPSILON;
/// Tolerance on the sum of mixing weights of a valid model.
const WEIGHT_SUM_TOL: f64 = 1e-6;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
/// Parameters of the mixture fit.
pub struct GmmConfig {
    /// Number of mixture components (K).
    pub n_components: usize,
    /// Cap on EM iterations.
    pub max_iter: usize,
    /// Convergence threshold on the change of the mean log-likelihood.
    pub tol: f64,
    /// Added to every variance; also the variance floor.
    pub reg_covar: f64,
    /// Cap on k-means iterations used to seed EM.
    pub kmeans_iter: usize,
    /// Seed for the k-means initialization. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for GmmConfig {
    fn default() -> Self {
        Self {
            n_components: 128,
            max_iter: 100,
            tol: 1e-3,
            reg_covar: 1e-6,
            kmeans_iter: 300,
            seed: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Gaussian mixture with diagonal covariances over `d` dimensions:
/// 1. Fitted on a reduced descriptor matrix with [`GaussianMixture::fit`].
/// 2. Saved to & loaded from a file (requires bincode feature).
/// 3. Used to compute posterior responsibilities of new descriptors.
pub struct GaussianMixture {
    weights: DVector<f64>,
    /// (K, d)
    means: DMatrix<f64>,
    /// (K, d), strictly positive.
    variances: DMatrix<f64>,
    converged: bool,
    n_iter: usize,
}

/// Mixture API
impl GaussianMixture {
    /// Build a mixture from explicit parameters. Fails with `FitDivergence`
    /// if the parameters do not describe a valid model.
    pub fn new(weights: DVector<f64>, means: DMatrix<f64>, variances: DMatrix<f64>) -> FvResult<Self> {
        if means.nrows() != weights.len() || means.shape() != variances.shape() {
            return Err(FvErr::SchemaMismatch(format!(
                "mixture parameter shapes disagree: weights {}, means {:?}, variances {:?}",
                weights.len(),
                means.shape(),
                variances.shape()
            )));
        }
        let gmm = Self {
            weights,
            means,
            variances,
            converged: true,
            n_iter: 0,
        };
        gmm.validate()?;
        Ok(gmm)
    }

    /// Fit a mixture on the rows of `x` with k-means seeding followed by
    /// expectation-maximization.
    pub fn fit(x: &Desc, config: &GmmConfig) -> FvResult<Self> {
        let (n, d) = x.shape();
        let k = config.n_components;
        if k == 0 {
            return Err(FvErr::Config("mixture needs at least one component".into()));
        }
        if n == 0 || d == 0 {
            return Err(FvErr::DegenerateInput(format!("cannot fit a mixture on a {}x{} matrix", n, d)));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(FvErr::DegenerateInput("descriptor matrix holds non-finite values".into()));
        }
        if n < k {
            warn!(
                "Degenerate input: {} rows for {} mixture components, fit may diverge",
                n, k
            );
        }

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        // Seed EM with hard k-means assignments
        let labels = Self::kmeans_labels(x, k, config.kmeans_iter, &mut rng);
        let mut resp: DMatrix<f64> = DMatrix::zeros(n, k);
        for (i, &l) in labels.iter().enumerate() {
            resp[(i, l)] = 1.;
        }
        let mut gmm = Self::m_step(x, &resp, config.reg_covar);

        let mut lower_bound = f64::NEG_INFINITY;
        for iter in 1..=config.max_iter {
            let prev = lower_bound;
            let (log_prob_norm, log_resp) = gmm.e_step(x);
            if !log_prob_norm.is_finite() {
                return Err(FvErr::FitDivergence(format!(
                    "log-likelihood became {} at iteration {}",
                    log_prob_norm, iter
                )));
            }
            resp = log_resp.map(f64::exp);
            gmm = Self::m_step(x, &resp, config.reg_covar);
            gmm.n_iter = iter;
            lower_bound = log_prob_norm;

            if (lower_bound - prev).abs() < config.tol {
                gmm.converged = true;
                break;
            }
        }

        if gmm.converged {
            debug!(
                "GMM K={} d={} on {} rows converged after {} iterations, mean log-likelihood {:.4}",
                k, d, n, gmm.n_iter, lower_bound
            );
        } else {
            warn!(
                "GMM K={} d={} did not converge within {} iterations, mean log-likelihood {:.4}",
                k, d, config.max_iter, lower_bound
            );
        }

        gmm.validate()?;
        Ok(gmm)
    }

    /// Posterior probability of every component for every row of `x`: (N, K),
    /// rows sum to one.
    pub fn predict_proba(&self, x: &Desc) -> FvResult<DMatrix<f64>> {
        self.check_dim(x)?;
        let (log_prob_norm, log_resp) = self.e_step(x);
        if !log_prob_norm.is_finite() {
            return Err(FvErr::DegenerateInput(
                "descriptors have zero density under the mixture".into(),
            ));
        }
        Ok(log_resp.map(f64::exp))
    }

    /// Most probable component of every row of `x`.
    pub fn predict(&self, x: &Desc) -> FvResult<Vec<usize>> {
        self.check_dim(x)?;
        let log_prob = self.weighted_log_prob(x);
        Ok(log_prob
            .row_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (c, &v)| if v > best.1 { (c, v) } else { best })
                    .0
            })
            .collect())
    }

    /// Mean log-likelihood of the rows of `x`.
    pub fn score(&self, x: &Desc) -> FvResult<f64> {
        self.check_dim(x)?;
        Ok(self.e_step(x).0)
    }

    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    pub fn means(&self) -> &DMatrix<f64> {
        &self.means
    }

    pub fn variances(&self) -> &DMatrix<f64> {
        &self.variances
    }

    /// Number of components (K).
    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    /// Dimension of the modelled space (d).
    pub fn dim(&self) -> usize {
        self.means.ncols()
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    /// Load a mixture from a file
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> FvResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        let gmm: Self = bincode::deserialize(&buffer)?;
        gmm.validate()?;
        Ok(gmm)
    }

    /// Save mixture to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> FvResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        Ok(())
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl GaussianMixture {
    /// Mixture parameters maximizing the expected log-likelihood under `resp`.
    fn m_step(x: &Desc, resp: &DMatrix<f64>, reg_covar: f64) -> Self {
        let d = x.ncols();
        let k = resp.ncols();

        let nk: Vec<f64> = resp.column_iter().map(|c| c.sum() + MASS_FLOOR).collect();
        let sum_x = resp.transpose() * x;
        let sum_x2 = resp.transpose() * x.component_mul(x);

        let mut means: DMatrix<f64> = DMatrix::zeros(k, d);
        let mut variances: DMatrix<f64> = DMatrix::zeros(k, d);
        for c in 0..k {
            for j in 0..d {
                let mean = sum_x[(c, j)] / nk[c];
                let var = sum_x2[(c, j)] / nk[c] - mean * mean + reg_covar;
                means[(c, j)] = mean;
                variances[(c, j)] = var.max(reg_covar);
            }
        }

        let total: f64 = nk.iter().sum();
        let weights = DVector::from_iterator(k, nk.iter().map(|&m| m / total));

        Self {
            weights,
            means,
            variances,
            converged: false,
            n_iter: 0,
        }
    }

    /// Mean log-likelihood of `x` and the log responsibilities (N, K).
    fn e_step(&self, x: &Desc) -> (f64, DMatrix<f64>) {
        let mut log_resp = self.weighted_log_prob(x);
        let mut total = 0.;
        for mut row in log_resp.row_iter_mut() {
            let max = row.iter().fold(f64::NEG_INFINITY, |a, &v| a.max(v));
            let norm = max + row.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
            row.add_scalar_mut(-norm);
            total += norm;
        }
        (total / x.nrows().max(1) as f64, log_resp)
    }

    /// `log pi_k + log N(x_n | mu_k, sigma_k)` for every row and component.
    fn weighted_log_prob(&self, x: &Desc) -> DMatrix<f64> {
        let (n, d) = x.shape();
        let k = self.n_components();
        let log_2pi = (2. * std::f64::consts::PI).ln();

        let log_norm: Vec<f64> = (0..k)
            .map(|c| {
                let log_det: f64 = self.variances.row(c).iter().map(|v| v.ln()).sum();
                self.weights[c].ln() - 0.5 * (d as f64 * log_2pi + log_det)
            })
            .collect();

        DMatrix::from_fn(n, k, |i, c| {
            let mut mahalanobis = 0.;
            for j in 0..d {
                let diff = x[(i, j)] - self.means[(c, j)];
                mahalanobis += diff * diff / self.variances[(c, j)];
            }
            log_norm[c] - 0.5 * mahalanobis
        })
    }

    /// Hard assignment of rows to `k` clusters with Lloyd iterations, seeded
    /// from randomly chosen rows.
    fn kmeans_labels(x: &Desc, k: usize, max_iter: usize, rng: &mut StdRng) -> Vec<usize> {
        let n = x.nrows();
        let mut seeds = index::sample(rng, n, k.min(n)).into_vec();
        // more clusters than rows: reuse rows, surplus clusters stay empty
        while seeds.len() < k {
            seeds.push(rng.gen_range(0..n));
        }
        let mut centers: Vec<DVector<f64>> = seeds.iter().map(|&i| x.row(i).transpose()).collect();

        let mut labels: Vec<usize> = vec![usize::MAX; n];
        // at least one assignment pass, labels start out invalid
        for _ in 0..max_iter.max(1) {
            let new_labels: Vec<usize> = x
                .row_iter()
                .map(|row| {
                    let mut best: (usize, f64) = (0, f64::INFINITY);
                    for (c, center) in centers.iter().enumerate() {
                        let dist = row
                            .iter()
                            .zip(center.iter())
                            .fold(0., |a, (p, q)| a + (p - q) * (p - q));
                        if dist < best.1 {
                            best = (c, dist);
                        }
                    }
                    best.0
                })
                .collect();

            if new_labels == labels {
                break; // converged
            }

            // update centers, empty clusters keep their previous center
            let mut sums: Vec<DVector<f64>> = vec![DVector::zeros(x.ncols()); k];
            let mut counts = vec![0usize; k];
            for (row, &l) in x.row_iter().zip(new_labels.iter()) {
                sums[l] += row.transpose();
                counts[l] += 1;
            }
            for c in 0..k {
                if counts[c] > 0 {
                    centers[c] = &sums[c] / counts[c] as f64;
                }
            }
            labels = new_labels;
        }
        labels
    }

    fn check_dim(&self, x: &Desc) -> FvResult<()> {
        if x.ncols() != self.dim() {
            return Err(FvErr::SchemaMismatch(format!(
                "mixture models {} dimensions, descriptors have {}",
                self.dim(),
                x.ncols()
            )));
        }
        Ok(())
    }

    fn validate(&self) -> FvResult<()> {
        if self.weights.is_empty() {
            return Err(FvErr::FitDivergence("mixture has no components".into()));
        }
        if self.weights.iter().any(|w| !w.is_finite() || *w < 0.) {
            return Err(FvErr::FitDivergence("mixing weights are not finite and non-negative".into()));
        }
        let sum = self.weights.sum();
        if (sum - 1.).abs() > WEIGHT_SUM_TOL {
            return Err(FvErr::FitDivergence(format!("mixing weights sum to {}", sum)));
        }
        if self.means.iter().any(|m| !m.is_finite()) {
            return Err(FvErr::FitDivergence("component means are not finite".into()));
        }
        if self.variances.iter().any(|v| !v.is_finite() || *v <= 0.) {
            return Err(FvErr::FitDivergence("component variances are not finite and positive".into()));
        }
        Ok(())
    }
}

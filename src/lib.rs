use thiserror::Error;

/// Per-trajectory records as delivered by the dense trajectory extractor.
pub mod trajectory;
pub use trajectory::{DescriptorBlock, TrajectoryRecord};

/// Selection of descriptor matrices (HOG, HOF, MBH) out of a record batch.
pub mod extract;
pub use extract::{Channel, DescriptorKind};

/// Principal component analysis used to halve descriptor dimensionality.
pub mod pca;
pub use pca::Pca;

/// Diagonal-covariance Gaussian mixture fitted with expectation-maximization.
pub mod gmm;
pub use gmm::GaussianMixture;

/// Fisher vector statistics of a descriptor set under a fitted mixture.
pub mod fisher;
pub use fisher::Normalization;

/// Extract -> reduce -> fit -> encode for a single channel of one video.
pub mod pipeline;
pub use pipeline::ChannelPipeline;

/// Runs the channel pipelines over a whole corpus of videos.
pub mod corpus;
pub use corpus::{Corpus, FeatureTable, TrajectorySource};

/// Runner configuration: enabled channels, mixture parameters, directories.
pub mod config;
pub use config::Config;

/// Descriptor matrix: rows are trajectories, columns descriptor dimensions.
pub type Desc = nalgebra::DMatrix<f64>;

/// Video-level encoding of one channel.
///
/// Layout: `K` weight gradients, then `K * d` mean gradients, then
/// `K * d` variance gradients, components in mixture order.
pub type FisherVector = Vec<f64>;

/// Post-processing of Fisher vectors.
pub trait FisherVecTrait {
    /// Signed square root of every component.
    fn power_normalize(&mut self);
    /// Scale to unit euclidean length. Zero vectors are left untouched.
    fn l2_normalize(&mut self);
}

impl FisherVecTrait for FisherVector {
    fn power_normalize(&mut self) {
        for v in self.iter_mut() {
            *v = v.signum() * v.abs().sqrt();
        }
    }

    fn l2_normalize(&mut self) {
        let norm = self.iter().fold(0., |a, v| a + v * v).sqrt();
        if norm > 0. {
            let inv = 1. / norm;
            for v in self.iter_mut() {
                *v *= inv;
            }
        }
    }
}

pub type FvResult<T> = std::result::Result<T, FvErr>;

#[derive(Error, Debug)]
pub enum FvErr {
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),
    #[error("Mixture fit diverged: {0}")]
    FitDivergence(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Serialization Error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Csv Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Config Parse Error: {0}")]
    Json(#[from] serde_json::Error),
}

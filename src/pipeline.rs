use log::debug;

use crate::gmm::GmmConfig;
use crate::*;

#[derive(Debug, Clone, PartialEq)]
/// Turns the descriptors of one channel of one video into its Fisher vector.
///
/// Every call fits a fresh PCA basis and mixture on the video's own
/// descriptors; nothing is shared between videos.
pub struct ChannelPipeline {
    gmm: GmmConfig,
    normalization: Normalization,
}

impl ChannelPipeline {
    pub fn new(gmm: GmmConfig, normalization: Normalization) -> Self {
        Self { gmm, normalization }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.gmm.clone(), config.normalization)
    }

    pub fn gmm_config(&self) -> &GmmConfig {
        &self.gmm
    }

    /// Extract, reduce, fit and encode a channel. MBH encodes its X and Y
    /// axes independently and returns their concatenation (X first).
    pub fn run(&self, records: &[TrajectoryRecord], channel: Channel) -> FvResult<FisherVector> {
        let matrices = extract::extract(records, channel)?;
        let mut fv = FisherVector::new();
        for (x, kind) in matrices.iter().zip(channel.kinds()) {
            debug!("Encoding {} descriptors of shape {:?}", kind, x.shape());
            fv.extend(self.encode_matrix(x)?);
        }
        Ok(fv)
    }

    /// Reduce a descriptor matrix to half its dimension, fit a mixture on it
    /// and encode it.
    pub fn encode_matrix(&self, x: &Desc) -> FvResult<FisherVector> {
        let (reduced, gmm) = self.fit(x)?;
        self.encode_with(&reduced, &gmm)
    }

    /// Reduced descriptors and the mixture fitted on them.
    pub fn fit(&self, x: &Desc) -> FvResult<(Desc, GaussianMixture)> {
        let reduced = Pca::reduce_by_half(x)?;
        let gmm = GaussianMixture::fit(&reduced, &self.gmm)?;
        Ok((reduced, gmm))
    }

    /// Encode already reduced descriptors against a fixed mixture.
    pub fn encode_with(&self, reduced: &Desc, gmm: &GaussianMixture) -> FvResult<FisherVector> {
        fisher::encode(reduced, gmm, self.normalization)
    }
}

impl Default for ChannelPipeline {
    fn default() -> Self {
        Self::new(GmmConfig::default(), Normalization::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn pipeline(k: usize) -> ChannelPipeline {
        ChannelPipeline::new(
            GmmConfig {
                n_components: k,
                seed: Some(11),
                ..Default::default()
            },
            Normalization::Raw,
        )
    }

    fn records(n: usize, seed: u64) -> Vec<TrajectoryRecord> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut block = |dim: usize| (0..dim).map(|_| rng.gen_range(0.0f32..1.0)).collect::<Vec<_>>();
        (0..n)
            .map(|_| TrajectoryRecord::with_descriptors(block(8), block(12), block(8), block(8)))
            .collect()
    }

    #[test]
    fn hof_length() {
        let fv = pipeline(3).run(&records(30, 1), Channel::Hof).unwrap();
        assert_eq!(fv.len(), Channel::Hof.expected_len(3, 12));
        assert_eq!(fv.len(), 3 + 2 * 3 * 6);
    }

    #[test]
    fn mbh_concatenates_axes() {
        let p = pipeline(2);
        let recs = records(25, 2);
        let fv = p.run(&recs, Channel::Mbh).unwrap();
        assert_eq!(fv.len(), 2 * (2 + 2 * 2 * 4));

        let xs = extract::extract(&recs, Channel::Mbh).unwrap();
        let x_part = p.encode_matrix(&xs[0]).unwrap();
        let y_part = p.encode_matrix(&xs[1]).unwrap();
        assert_eq!(&fv[..x_part.len()], x_part.as_slice());
        assert_eq!(&fv[x_part.len()..], y_part.as_slice());
    }

    #[test]
    fn fixed_model_is_idempotent() {
        let p = pipeline(3);
        let x = extract::descriptor_matrix(&records(40, 3), DescriptorKind::Hog).unwrap();
        let (reduced, gmm) = p.fit(&x).unwrap();
        let a = p.encode_with(&reduced, &gmm).unwrap();
        let b = p.encode_with(&reduced, &gmm).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_batch_fails() {
        assert!(matches!(
            pipeline(2).run(&[], Channel::Hog),
            Err(FvErr::SchemaMismatch(_))
        ));
    }
}

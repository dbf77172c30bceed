use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::gmm::GmmConfig;
use crate::*;

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Channels to encode. With none enabled, trajectories are dumped raw.
    pub channels: ChannelSet,

    /// Mixture fit parameters, including the component count K.
    pub gmm: GmmConfig,

    /// Post-processing of the Fisher vectors.
    pub normalization: Normalization,

    /// Directory holding the per-video trajectory batches.
    pub data_dir: PathBuf,

    /// Directory the feature tables (or raw dumps) are written to.
    pub target_dir: PathBuf,

    /// Encode videos on the rayon thread pool.
    pub parallel: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channels: ChannelSet::default(),
            gmm: GmmConfig::default(),
            normalization: Normalization::Raw,
            data_dir: PathBuf::from("data"),
            target_dir: PathBuf::from("features"),
            parallel: false,
        }
    }
}

/// Enabled channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSet {
    pub hog: bool,
    pub hof: bool,
    pub mbh: bool,
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self {
            hog: true,
            hof: true,
            mbh: true,
        }
    }
}

impl ChannelSet {
    pub fn none() -> Self {
        Self {
            hog: false,
            hof: false,
            mbh: false,
        }
    }

    pub fn only(channel: Channel) -> Self {
        let mut set = Self::none();
        match channel {
            Channel::Hog => set.hog = true,
            Channel::Hof => set.hof = true,
            Channel::Mbh => set.mbh = true,
        }
        set
    }

    pub fn is_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Hog => self.hog,
            Channel::Hof => self.hof,
            Channel::Mbh => self.mbh,
        }
    }

    /// Enabled channels in table order (HOG, HOF, MBH).
    pub fn enabled(&self) -> Vec<Channel> {
        Channel::ALL.iter().copied().filter(|&c| self.is_enabled(c)).collect()
    }
}

impl Config {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> FvResult<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FvResult<()> {
        if self.gmm.n_components == 0 {
            return Err(FvErr::Config("gmm.n_components must be at least 1".into()));
        }
        if self.gmm.max_iter == 0 {
            return Err(FvErr::Config("gmm.max_iter must be at least 1".into()));
        }
        if self.gmm.kmeans_iter == 0 {
            return Err(FvErr::Config("gmm.kmeans_iter must be at least 1".into()));
        }
        if !(self.gmm.tol > 0.) {
            return Err(FvErr::Config(format!("gmm.tol must be positive, got {}", self.gmm.tol)));
        }
        if !(self.gmm.reg_covar > 0.) {
            return Err(FvErr::Config(format!(
                "gmm.reg_covar must be positive, got {}",
                self.gmm.reg_covar
            )));
        }
        Ok(())
    }
}

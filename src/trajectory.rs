use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::*;

/// HOG block length produced by the upstream extractor (2x2x3 cells, 8 bins).
pub const HOG_DIM: usize = 96;
/// HOF block length (2x2x3 cells, 9 bins).
pub const HOF_DIM: usize = 108;
/// Length of each MBH axis block.
pub const MBH_DIM: usize = 96;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// A numeric descriptor block attached to a trajectory.
///
/// Values are stored row-major with respect to `shape`, so a block that the
/// extractor reports as a small patch (e.g. `[8, 12]`) flattens to `values`
/// without copying or reordering.
pub struct DescriptorBlock {
    shape: SmallVec<[usize; 3]>,
    values: Vec<f32>,
}

impl DescriptorBlock {
    /// One-dimensional block.
    pub fn flat(values: Vec<f32>) -> Self {
        Self {
            shape: smallvec::smallvec![values.len()],
            values,
        }
    }

    /// Block with an explicit shape. The product of `shape` must match the
    /// number of values.
    pub fn with_shape(shape: &[usize], values: Vec<f32>) -> FvResult<Self> {
        let block = Self {
            shape: shape.into(),
            values,
        };
        block.check()?;
        Ok(block)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of scalar values once flattened.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Row-major flattened view of the block.
    pub fn flatten(&self) -> FvResult<&[f32]> {
        self.check()?;
        Ok(&self.values)
    }

    fn check(&self) -> FvResult<()> {
        let expected: usize = self.shape.iter().product();
        if expected != self.values.len() {
            return Err(FvErr::SchemaMismatch(format!(
                "block of shape {:?} holds {} values",
                self.shape.as_slice(),
                self.values.len()
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
/// One tracked point sequence: scalar metadata followed by the four
/// descriptor blocks. A block the producer did not emit is `None`.
pub struct TrajectoryRecord {
    /// Frame on which the trajectory ends.
    pub frame_num: i32,
    pub mean_x: f32,
    pub mean_y: f32,
    pub var_x: f32,
    pub var_y: f32,
    /// Length of the trajectory in pixels.
    pub length: f32,
    /// Spatial scale the trajectory was tracked at.
    pub scale: f32,
    /// Normalized space-time position of the trajectory.
    pub x_pos: f32,
    pub y_pos: f32,
    pub t_pos: f32,
    /// Normalized point displacements along the trajectory.
    #[serde(default)]
    pub coords: Vec<[f32; 2]>,
    #[serde(default)]
    pub hog: Option<DescriptorBlock>,
    #[serde(default)]
    pub hof: Option<DescriptorBlock>,
    #[serde(default)]
    pub mbh_x: Option<DescriptorBlock>,
    #[serde(default)]
    pub mbh_y: Option<DescriptorBlock>,
}

impl TrajectoryRecord {
    /// Record carrying only descriptor blocks, metadata zeroed.
    pub fn with_descriptors(
        hog: Vec<f32>,
        hof: Vec<f32>,
        mbh_x: Vec<f32>,
        mbh_y: Vec<f32>,
    ) -> Self {
        Self {
            hog: Some(DescriptorBlock::flat(hog)),
            hof: Some(DescriptorBlock::flat(hof)),
            mbh_x: Some(DescriptorBlock::flat(mbh_x)),
            mbh_y: Some(DescriptorBlock::flat(mbh_y)),
            ..Default::default()
        }
    }

    /// Descriptor block of the given kind, if present.
    pub fn block(&self, kind: DescriptorKind) -> Option<&DescriptorBlock> {
        match kind {
            DescriptorKind::Hog => self.hog.as_ref(),
            DescriptorKind::Hof => self.hof.as_ref(),
            DescriptorKind::MbhX => self.mbh_x.as_ref(),
            DescriptorKind::MbhY => self.mbh_y.as_ref(),
        }
    }
}

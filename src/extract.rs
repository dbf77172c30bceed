use serde::{Deserialize, Serialize};
use std::fmt;

use crate::*;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A single descriptor block of a trajectory record.
pub enum DescriptorKind {
    Hog,
    Hof,
    MbhX,
    MbhY,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// An encoded channel. MBH is made of two descriptor kinds (one per flow
/// gradient axis) which are encoded separately and concatenated afterwards.
pub enum Channel {
    Hog,
    Hof,
    Mbh,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Hog, Channel::Hof, Channel::Mbh];

    /// Descriptor kinds making up this channel, in concatenation order.
    pub fn kinds(self) -> &'static [DescriptorKind] {
        match self {
            Channel::Hog => &[DescriptorKind::Hog],
            Channel::Hof => &[DescriptorKind::Hof],
            Channel::Mbh => &[DescriptorKind::MbhX, DescriptorKind::MbhY],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Hog => "hog",
            Channel::Hof => "hof",
            Channel::Mbh => "mbh",
        }
    }

    /// Name of the feature table file written for this channel.
    pub fn file_name(self) -> String {
        format!("{}_features.csv", self.name())
    }

    /// Length of the channel's Fisher vector for `k` components and
    /// descriptors of dimension `dim` (before halving).
    pub fn expected_len(self, k: usize, dim: usize) -> usize {
        self.kinds().len() * fisher::fisher_len(k, dim / 2)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().to_uppercase())
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DescriptorKind::Hog => "HOG",
            DescriptorKind::Hof => "HOF",
            DescriptorKind::MbhX => "MBH-X",
            DescriptorKind::MbhY => "MBH-Y",
        };
        f.write_str(name)
    }
}

/// Build the (N, D) descriptor matrix of one kind out of a record batch.
///
/// Every record must carry the block and all blocks must flatten to the
/// same, non-zero dimension. An empty batch is rejected as well.
pub fn descriptor_matrix(records: &[TrajectoryRecord], kind: DescriptorKind) -> FvResult<Desc> {
    if records.is_empty() {
        return Err(FvErr::SchemaMismatch(format!("no trajectories for {}", kind)));
    }

    let mut dim = None;
    let mut data: Vec<f64> = Vec::new();
    for (i, record) in records.iter().enumerate() {
        let block = record.block(kind).ok_or_else(|| {
            FvErr::SchemaMismatch(format!("record {} has no {} block", i, kind))
        })?;
        let values = block.flatten()?;
        match dim {
            None => {
                if values.is_empty() {
                    return Err(FvErr::SchemaMismatch(format!("record {} has an empty {} block", i, kind)));
                }
                dim = Some(values.len());
                data.reserve(records.len() * values.len());
            }
            Some(d) if d != values.len() => {
                return Err(FvErr::SchemaMismatch(format!(
                    "record {} has {} block of dimension {}, expected {}",
                    i,
                    kind,
                    values.len(),
                    d
                )));
            }
            _ => {}
        }
        data.extend(values.iter().map(|&v| v as f64));
    }

    let dim = dim.unwrap_or(0);
    Ok(Desc::from_row_slice(records.len(), dim, &data))
}

/// Descriptor matrices of a channel, one per descriptor kind: a single
/// matrix for HOG and HOF, the X and Y axis matrices for MBH.
pub fn extract(records: &[TrajectoryRecord], channel: Channel) -> FvResult<Vec<Desc>> {
    channel
        .kinds()
        .iter()
        .map(|&kind| descriptor_matrix(records, kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seed: f32) -> TrajectoryRecord {
        TrajectoryRecord::with_descriptors(
            vec![seed; 4],
            vec![seed + 1.; 6],
            vec![seed + 2.; 4],
            vec![seed + 3.; 4],
        )
    }

    #[test]
    fn matrix_rows_follow_records() {
        let records = vec![record(0.), record(10.)];
        let m = descriptor_matrix(&records, DescriptorKind::Hof).unwrap();
        assert_eq!(m.shape(), (2, 6));
        assert_eq!(m[(0, 0)], 1.);
        assert_eq!(m[(1, 5)], 11.);
    }

    #[test]
    fn mbh_yields_two_matrices() {
        let records = vec![record(0.), record(1.), record(2.)];
        let ms = extract(&records, Channel::Mbh).unwrap();
        assert_eq!(ms.len(), 2);
        assert_eq!(ms[0][(2, 0)], 4.);
        assert_eq!(ms[1][(2, 0)], 5.);
    }

    #[test]
    fn patch_blocks_are_flattened() {
        let mut r = record(0.);
        r.hog = Some(DescriptorBlock::with_shape(&[2, 2], vec![1., 2., 3., 4.]).unwrap());
        let m = descriptor_matrix(&[r], DescriptorKind::Hog).unwrap();
        assert_eq!(m.row(0).iter().cloned().collect::<Vec<_>>(), vec![1., 2., 3., 4.]);
    }

    #[test]
    fn inconsistent_dimension_is_schema_mismatch() {
        let mut odd = record(1.);
        odd.hog = Some(DescriptorBlock::flat(vec![0.; 5]));
        let err = descriptor_matrix(&[record(0.), odd], DescriptorKind::Hog).unwrap_err();
        assert!(matches!(err, FvErr::SchemaMismatch(_)));
    }

    #[test]
    fn missing_block_is_schema_mismatch() {
        let mut r = record(0.);
        r.mbh_y = None;
        assert!(matches!(
            extract(&[r], Channel::Mbh),
            Err(FvErr::SchemaMismatch(_))
        ));
    }

    #[test]
    fn empty_batch_is_schema_mismatch() {
        assert!(matches!(
            descriptor_matrix(&[], DescriptorKind::Hog),
            Err(FvErr::SchemaMismatch(_))
        ));
    }

    #[test]
    fn channel_lengths() {
        assert_eq!(Channel::Hog.expected_len(4, 96), 388);
        assert_eq!(Channel::Mbh.expected_len(4, 96), 776);
        assert_eq!(Channel::Hof.file_name(), "hof_features.csv");
    }
}

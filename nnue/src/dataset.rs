use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::encoding::{
    decode_features, decode_features_into, target_to_win_rate, validate_record,
    FEATURE_SET_SIZE, NUM_FEATURES, RECORD_SIZE,
};
use crate::error::{Error, Result};

/// A decoded training position.
#[derive(Debug, Clone)]
pub struct Position {
    pub stm_features: Vec<f32>,
    pub sntm_features: Vec<f32>,
    pub target: f32,
}

/// Random-access view over a file of fixed-size training records.
///
/// The whole file is read once and validated up front; a single bad
/// record fails the load. Lookups afterwards are plain offset decodes.
pub struct PositionDataset {
    data: Vec<u8>,
}

impl PositionDataset {
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let dataset = Self::from_bytes(data)?;
        log::info!("Loaded {} positions from {:?}", dataset.len(), path);
        Ok(dataset)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() % RECORD_SIZE != 0 {
            return Err(Error::Format(format!(
                "dataset is {} bytes, which is not a multiple of the {} byte record size",
                data.len(),
                RECORD_SIZE
            )));
        }

        for offset in (0..data.len()).step_by(RECORD_SIZE) {
            validate_record(&data, offset)?;
        }

        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len() / RECORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<Position> {
        let offset = self.offset(index)?;
        Ok(Position {
            stm_features: decode_features(&self.data, offset),
            sntm_features: decode_features(&self.data, offset + FEATURE_SET_SIZE),
            target: target_to_win_rate(self.data[offset + FEATURE_SET_SIZE * 2]),
        })
    }

    /// Yields every record exactly once, in random order, grouped into batches.
    pub fn batches<'a, R: Rng>(
        &'a self,
        rng: &mut R,
        batch_size: usize,
        device: &'a Device,
    ) -> Batches<'a> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);

        Batches {
            dataset: self,
            order,
            batch_size: batch_size.max(1),
            cursor: 0,
            device,
        }
    }

    fn offset(&self, index: usize) -> Result<usize> {
        if index >= self.len() {
            return Err(Error::OutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok(index * RECORD_SIZE)
    }

    fn write_batch(
        &self,
        indices: &[usize],
        stm: &mut [f32],
        sntm: &mut [f32],
        targets: &mut Vec<f32>,
    ) -> Result<()> {
        let rows = stm
            .chunks_exact_mut(NUM_FEATURES)
            .zip(sntm.chunks_exact_mut(NUM_FEATURES));

        for (&index, (stm_row, sntm_row)) in indices.iter().zip(rows) {
            let offset = self.offset(index)?;
            decode_features_into(&self.data, offset, stm_row);
            decode_features_into(&self.data, offset + FEATURE_SET_SIZE, sntm_row);
            targets.push(target_to_win_rate(self.data[offset + FEATURE_SET_SIZE * 2]));
        }
        Ok(())
    }
}

/// A batch of positions as tensors ready for the network.
pub struct Batch {
    pub stm: Tensor,
    pub sntm: Tensor,
    pub targets: Tensor,
    pub len: usize,
}

pub struct Batches<'a> {
    dataset: &'a PositionDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    device: &'a Device,
}

impl Batches<'_> {
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    fn build(&self, indices: &[usize]) -> Result<Batch> {
        let len = indices.len();
        let mut stm = vec![0f32; len * NUM_FEATURES];
        let mut sntm = vec![0f32; len * NUM_FEATURES];
        let mut targets = Vec::with_capacity(len);

        self.dataset
            .write_batch(indices, &mut stm, &mut sntm, &mut targets)?;

        Ok(Batch {
            stm: Tensor::from_vec(stm, (len, NUM_FEATURES), self.device)?,
            sntm: Tensor::from_vec(sntm, (len, NUM_FEATURES), self.device)?,
            targets: Tensor::from_vec(targets, (len, 1), self.device)?,
            len,
        })
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.build(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Record;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn dataset_bytes(records: &[Record]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|r| r.encode().unwrap())
            .collect()
    }

    fn sample_records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record {
                stm_features: vec![i as u16, 700],
                sntm_features: vec![(i + 100) as u16],
                target: (i * 10) as u8,
            })
            .collect()
    }

    #[test]
    fn test_len_and_get() {
        let dataset = PositionDataset::from_bytes(dataset_bytes(&sample_records(5))).unwrap();
        assert_eq!(dataset.len(), 5);

        for i in 0..5 {
            let position = dataset.get(i).unwrap();
            assert_eq!(position.stm_features[i], 1.0);
            assert_eq!(position.stm_features[700], 1.0);
            assert_eq!(position.stm_features.iter().sum::<f32>(), 2.0);
            assert_eq!(position.sntm_features[i + 100], 1.0);
            assert_eq!(position.target, (i * 10) as f32 / 255.0);
        }

        assert!(matches!(
            dataset.get(5),
            Err(Error::OutOfRange { index: 5, len: 5 })
        ));
        assert!(matches!(
            dataset.get(usize::MAX),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_target_bytes() {
        let records: Vec<Record> = [255u8, 0, 128]
            .iter()
            .map(|&target| Record {
                stm_features: vec![],
                sntm_features: vec![],
                target,
            })
            .collect();
        let dataset = PositionDataset::from_bytes(dataset_bytes(&records)).unwrap();

        assert_eq!(dataset.get(0).unwrap().target, 1.0);
        assert_eq!(dataset.get(1).unwrap().target, 0.0);
        assert!((dataset.get(2).unwrap().target - 0.50196).abs() < 1e-5);
    }

    #[test]
    fn test_rejects_partial_record() {
        let mut bytes = dataset_bytes(&sample_records(2));
        bytes.pop();
        assert!(matches!(
            PositionDataset::from_bytes(bytes),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_rejects_bad_feature_index() {
        let mut bytes = dataset_bytes(&sample_records(3));
        let offset = RECORD_SIZE * 2 + FEATURE_SET_SIZE;
        bytes[offset..offset + 2].copy_from_slice(&1000u16.to_le_bytes());
        assert!(matches!(
            PositionDataset::from_bytes(bytes),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_empty_dataset() {
        let dataset = PositionDataset::from_bytes(Vec::new()).unwrap();
        assert!(dataset.is_empty());
        assert_eq!(dataset.len(), 0);
    }

    #[test]
    fn test_batches_cover_every_record_once() {
        let dataset = PositionDataset::from_bytes(dataset_bytes(&sample_records(10))).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let device = Device::Cpu;

        let batches = dataset.batches(&mut rng, 4, &device);
        assert_eq!(batches.num_batches(), 3);

        let mut seen = HashSet::new();
        let mut sizes = Vec::new();
        for batch in batches {
            let batch = batch.unwrap();
            sizes.push(batch.len);
            assert_eq!(batch.stm.dims(), &[batch.len, NUM_FEATURES]);
            assert_eq!(batch.targets.dims(), &[batch.len, 1]);

            // Each stm row carries its record index as the first feature.
            let rows = batch.stm.to_vec2::<f32>().unwrap();
            for row in rows {
                let index = row.iter().position(|&v| v == 1.0).unwrap();
                assert!(seen.insert(index));
            }
        }

        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(seen.len(), 10);
    }
}

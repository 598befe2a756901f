//! Fixed-capacity activation store
//!
//! Holds the activation vectors produced during one generation phase, then
//! hands them back as shuffled training mini-batches. Capacity is the hard
//! memory ceiling of the whole pipeline: appending past it is a
//! `CapacityExceeded` error, never a silent resize.
//!
//! Discipline per cycle: single writer (`append` during generation), then
//! single reader (`sample_batches` during training), then `clear()`. The
//! batch iterator borrows the store, so the borrow checker rules out
//! interleaving a write with an in-flight read.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::SaeError;

/// In-memory store of activation vectors, each of length `d_in`.
#[derive(Debug)]
pub struct ActivationStore {
    /// Row-major contiguous storage, `len * d_in` valid floats.
    data: Vec<f32>,
    d_in: usize,
    capacity: usize,
    len: usize,
}

impl ActivationStore {
    /// Allocate a store for up to `capacity` vectors of length `d_in`.
    pub fn new(capacity: usize, d_in: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity * d_in),
            d_in,
            capacity,
            len: 0,
        }
    }

    /// Number of vectors currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the store holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fixed capacity, in vectors.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Width of each stored vector.
    pub fn d_in(&self) -> usize {
        self.d_in
    }

    /// Append a batch of activation vectors, shape `(n, d_in)`.
    ///
    /// Fails with `CapacityExceeded` if the batch would overfill the store;
    /// nothing is appended in that case.
    pub fn append(&mut self, batch: &Tensor) -> Result<(), SaeError> {
        let (n, width) = batch.dims2()?;
        if width != self.d_in {
            return Err(SaeError::InvalidConfig(format!(
                "appended vectors have width {width}, store expects {}",
                self.d_in
            )));
        }
        if self.len + n > self.capacity {
            return Err(SaeError::CapacityExceeded {
                len: self.len,
                extra: n,
                capacity: self.capacity,
            });
        }
        let rows = batch.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        for row in rows {
            self.data.extend_from_slice(&row);
        }
        self.len += n;
        Ok(())
    }

    /// Drop all stored vectors. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.data.clear();
        self.len = 0;
    }

    /// Lazy, finite, non-restartable sequence of shuffled mini-batches.
    ///
    /// Together the yielded batches cover every stored vector exactly once;
    /// the final batch may be smaller than `batch_size`. Batch tensors are
    /// built on `device` with shape `(batch, d_in)`.
    pub fn sample_batches<'a>(
        &'a self,
        batch_size: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> BatchIter<'a> {
        let mut order: Vec<usize> = (0..self.len).collect();
        order.shuffle(rng);
        BatchIter {
            store: self,
            order,
            position: 0,
            batch_size: batch_size.max(1),
            device: device.clone(),
        }
    }
}

/// Iterator over one shuffled pass of the store. See
/// [`ActivationStore::sample_batches`].
pub struct BatchIter<'a> {
    store: &'a ActivationStore,
    order: Vec<usize>,
    position: usize,
    batch_size: usize,
    device: Device,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let indices = &self.order[self.position..end];
        self.position = end;

        let d = self.store.d_in;
        let mut flat = Vec::with_capacity(indices.len() * d);
        for &i in indices {
            flat.extend_from_slice(&self.store.data[i * d..(i + 1) * d]);
        }
        let batch = Tensor::from_vec(flat, (indices.len(), d), &self.device)
            .map_err(anyhow::Error::from);
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn batch_of(rows: &[[f32; 2]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_fill_to_exact_capacity() {
        let mut store = ActivationStore::new(4, 2);
        store
            .append(&batch_of(&[[0.0, 0.0], [1.0, 1.0]]))
            .unwrap();
        store
            .append(&batch_of(&[[2.0, 2.0], [3.0, 3.0]]))
            .unwrap();
        assert_eq!(store.len(), store.capacity());
    }

    #[test]
    fn test_append_past_capacity_fails() {
        let mut store = ActivationStore::new(3, 2);
        store
            .append(&batch_of(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]))
            .unwrap();
        let err = store.append(&batch_of(&[[3.0, 3.0]])).unwrap_err();
        assert!(matches!(
            err,
            SaeError::CapacityExceeded {
                len: 3,
                extra: 1,
                capacity: 3
            }
        ));
        // The failed append must not have partially landed.
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_width_mismatch_fails() {
        let mut store = ActivationStore::new(4, 3);
        let err = store.append(&batch_of(&[[0.0, 0.0]])).unwrap_err();
        assert!(matches!(err, SaeError::InvalidConfig(_)));
    }

    #[test]
    fn test_sample_batches_covers_every_vector_exactly_once() {
        let mut store = ActivationStore::new(10, 2);
        let rows: Vec<[f32; 2]> = (0..10).map(|i| [i as f32, i as f32 + 0.5]).collect();
        store.append(&batch_of(&rows)).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut seen: Vec<u32> = Vec::new();
        for batch in store.sample_batches(3, &mut rng, &Device::Cpu) {
            let batch = batch.unwrap();
            for row in batch.to_vec2::<f32>().unwrap() {
                seen.push(row[0] as u32);
            }
        }
        assert_eq!(seen.len(), 10);
        let unique: BTreeSet<u32> = seen.iter().copied().collect();
        assert_eq!(unique, (0..10).collect::<BTreeSet<u32>>());
    }

    #[test]
    fn test_partial_final_batch() {
        let mut store = ActivationStore::new(10, 2);
        let rows: Vec<[f32; 2]> = (0..10).map(|i| [i as f32, 0.0]).collect();
        store.append(&batch_of(&rows)).unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let sizes: Vec<usize> = store
            .sample_batches(4, &mut rng, &Device::Cpu)
            .map(|b| b.unwrap().dims2().unwrap().0)
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_shuffle_depends_on_seed() {
        let mut store = ActivationStore::new(32, 2);
        let rows: Vec<[f32; 2]> = (0..32).map(|i| [i as f32, 0.0]).collect();
        store.append(&batch_of(&rows)).unwrap();

        let order = |seed: u64| -> Vec<u32> {
            let mut rng = StdRng::seed_from_u64(seed);
            store
                .sample_batches(8, &mut rng, &Device::Cpu)
                .flat_map(|b| {
                    b.unwrap()
                        .to_vec2::<f32>()
                        .unwrap()
                        .into_iter()
                        .map(|r| r[0] as u32)
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        assert_eq!(order(3), order(3));
        assert_ne!(order(3), order(4));
    }

    #[test]
    fn test_clear_empties_store() {
        let mut store = ActivationStore::new(4, 2);
        store.append(&batch_of(&[[1.0, 2.0]])).unwrap();
        assert!(!store.is_empty());
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        assert_eq!(store.capacity(), 4);
        // Refilling after clear works to full capacity again.
        let rows: Vec<[f32; 2]> = (0..4).map(|i| [i as f32, 0.0]).collect();
        store.append(&batch_of(&rows)).unwrap();
        assert_eq!(store.len(), 4);
    }
}

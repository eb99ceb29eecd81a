//! Cyclic mini-batches
//!
//! An endless iterator over shuffled mini-batches. When an epoch is exhausted
//! the order is reshuffled and iteration restarts; the only failure is an
//! empty source.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::{DataError, DataResult};

/// Endless shuffled batches of indices into a source of `len` items
#[derive(Clone, Debug)]
pub struct CyclicBatches {
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    epoch: usize,
    rng: ChaCha8Rng,
}

impl CyclicBatches {
    /// Batches over `len` items.
    ///
    /// `batch_size` is clamped to `1..=len`. Fails when `len` is zero.
    pub fn new(len: usize, batch_size: usize, seed: u64) -> DataResult<Self> {
        if len == 0 {
            return Err(DataError::EmptySource);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut rng);
        Ok(Self {
            order,
            batch_size: batch_size.clamp(1, len),
            cursor: 0,
            epoch: 0,
            rng,
        })
    }

    /// Completed passes over the source
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Items per batch
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Iterator for CyclicBatches {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor + self.batch_size > self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            self.epoch += 1;
        }
        let batch = self.order[self.cursor..self.cursor + self.batch_size].to_vec();
        self.cursor += self.batch_size;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_source_fails() {
        assert!(matches!(CyclicBatches::new(0, 4, 1), Err(DataError::EmptySource)));
    }

    #[test]
    fn test_epoch_covers_every_index_once() {
        let mut batches = CyclicBatches::new(12, 4, 7).unwrap();
        let mut seen: Vec<usize> = batches.by_ref().take(3).flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert_eq!(batches.epoch(), 0);

        batches.next();
        assert_eq!(batches.epoch(), 1);
    }

    #[test]
    fn test_restarts_and_drops_ragged_tail() {
        let batches = CyclicBatches::new(5, 2, 3).unwrap();
        let all: Vec<Vec<usize>> = batches.take(10).collect();
        assert!(all.iter().all(|b| b.len() == 2));

        let big = CyclicBatches::new(3, 10, 3).unwrap();
        assert_eq!(big.batch_size(), 3);
    }
}

//! Vocabulary head split into ordered shards.

use crate::error::{QwenError, Result};
use crate::layers::Conv1x1;
use crate::tensor::Tensor;

/// Rows per shard when `vocab_size` rows are split `n` ways: `vocab_size / n`
/// each, with one extra row for each of the first `vocab_size % n` shards.
pub fn split_sizes(vocab_size: usize, n: usize) -> Vec<usize> {
    let base = vocab_size / n;
    let remainder = vocab_size % n;
    (0..n).map(|i| base + usize::from(i < remainder)).collect()
}

/// The output projection to vocabulary logits, as `N >= 1` shards.
#[derive(Debug, Clone)]
pub struct VocabHead {
    shards: Vec<Conv1x1>,
}

impl VocabHead {
    pub fn new(hidden_size: usize, vocab_size: usize, n_splits: usize) -> Self {
        let shards = split_sizes(vocab_size, n_splits)
            .into_iter()
            .map(|rows| Conv1x1::new(hidden_size, rows))
            .collect();
        VocabHead { shards }
    }

    pub fn shards(&self) -> &[Conv1x1] {
        &self.shards
    }

    #[inline]
    pub fn n_splits(&self) -> usize {
        self.shards.len()
    }

    pub fn vocab_size(&self) -> usize {
        self.shards.iter().map(|s| s.out_features()).sum()
    }

    /// Split a `[V, H, 1, 1]` weight by rows and assign one block per shard.
    pub fn load(&mut self, weight: &Tensor) -> Result<()> {
        let sizes: Vec<usize> = self.shards.iter().map(|s| s.out_features()).collect();
        let parts = weight.split(&sizes)?;
        for (i, (shard, part)) in self.shards.iter_mut().zip(parts).enumerate() {
            if part.shape() != shard.weight.shape() {
                return Err(QwenError::Shape(format!(
                    "lm_head shard {} expects {:?}, got {:?}",
                    i,
                    shard.weight.shape(),
                    part.shape()
                )));
            }
            tracing::debug!(shard = i, shape = ?part.shape(), "loaded lm_head shard");
            shard.weight = part;
        }
        Ok(())
    }

    /// Per-shard logits `[B, S, V_i]`, in shard order.
    pub fn forward_parts(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        self.shards.iter().map(|s| s.forward(x)).collect()
    }

    /// Full logits `[B, S, V]`: shard outputs concatenated on the last axis.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let parts = self.forward_parts(x)?;
        let axis = x.rank().saturating_sub(1);
        Tensor::cat(&parts, axis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sizes_remainder_goes_first() {
        let sizes = split_sizes(128257, 16);
        assert_eq!(sizes[0], 8017);
        assert!(sizes[1..].iter().all(|&s| s == 8016));
        assert_eq!(sizes.iter().sum::<usize>(), 128257);

        assert_eq!(split_sizes(17, 2), vec![9, 8]);
        assert_eq!(split_sizes(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(split_sizes(12, 3), vec![4, 4, 4]);
        assert_eq!(split_sizes(5, 1), vec![5]);
    }

    #[test]
    fn test_split_head_matches_unsplit() {
        let (vocab, hidden) = (11, 3);
        let values: Vec<f32> = (0..vocab * hidden).map(|i| ((i * 7) % 13) as f32 / 4.0 - 1.5).collect();
        let weight = Tensor::from_f32([vocab, hidden, 1, 1], &values).unwrap();
        let x = Tensor::from_f32([1, 2, hidden], &[0.5, -1.0, 0.25, 1.0, 2.0, -0.5]).unwrap();

        let mut whole = VocabHead::new(hidden, vocab, 1);
        whole.load(&weight).unwrap();
        let expected = whole.forward(&x).unwrap();
        assert_eq!(expected.shape(), &[1, 2, vocab]);

        for n in [2, 3, 4, 11] {
            let mut head = VocabHead::new(hidden, vocab, n);
            head.load(&weight).unwrap();
            assert_eq!(head.n_splits(), n);
            assert_eq!(head.vocab_size(), vocab);
            let parts = head.forward_parts(&x).unwrap();
            assert_eq!(parts.len(), n);
            assert_eq!(Tensor::cat(&parts, 2).unwrap(), expected);
            assert_eq!(head.forward(&x).unwrap(), expected);
        }
    }

    #[test]
    fn test_load_rejects_wrong_width() {
        let mut head = VocabHead::new(4, 6, 2);
        let weight: Tensor = Tensor::zeros([6, 3, 1, 1]);
        assert!(head.load(&weight).is_err());
        let weight: Tensor = Tensor::zeros([7, 4, 1, 1]);
        assert!(head.load(&weight).is_err());
    }
}

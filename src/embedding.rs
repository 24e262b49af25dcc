//! Deterministic text embeddings.
//!
//! Feature-hashed word unigrams and character trigrams projected into a
//! fixed-dimension vector, L2-normalized. Byte-identical input always
//! produces the same vector: no randomness, no time dependence. Cosine
//! similarity of two outputs equals their dot product.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::EMBEDDING_DIM;

/// Errors produced by embedding generation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmbedError {
    #[error("cannot embed empty text")]
    EmptyInput,
}

/// Deterministic feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct Embedder {
    dim: usize,
}

impl Default for Embedder {
    fn default() -> Self {
        Self { dim: EMBEDDING_DIM }
    }
}

impl Embedder {
    /// Embedder with the store-wide default dimension.
    pub fn new() -> Self {
        Self::default()
    }

    /// Embedder with an explicit dimension.
    pub fn with_dim(dim: usize) -> Self {
        Self { dim }
    }

    /// Configured output dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Embed text into a unit-length vector of the configured dimension.
    ///
    /// Single streaming pass over the input; memory is bounded by the
    /// output dimension, not the input length.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::EmptyInput);
        }

        let mut accumulator = vec![0.0f64; self.dim];

        for word in text.split_whitespace() {
            let lowered = word.to_lowercase();
            self.accumulate(&mut accumulator, lowered.as_bytes());

            let chars: Vec<char> = lowered.chars().collect();
            if chars.len() >= 3 {
                for window in chars.windows(3) {
                    let trigram: String = window.iter().collect();
                    self.accumulate(&mut accumulator, trigram.as_bytes());
                }
            }
        }

        let norm = accumulator.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm == 0.0 {
            // Every feature hashed to a cancelling pair; treat like empty
            // input rather than emitting a zero vector.
            return Err(EmbedError::EmptyInput);
        }

        Ok(accumulator.iter().map(|v| (v / norm) as f32).collect())
    }

    /// Hash one feature into a signed component update.
    fn accumulate(&self, accumulator: &mut [f64], feature: &[u8]) {
        let digest = Sha256::digest(feature);
        let index = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
            as usize
            % self.dim;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        accumulator[index] += sign;
    }
}

/// Cosine similarity of two unit vectors is their dot product.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let embedder = Embedder::new();
        let a = embedder.embed("the quick brown fox").unwrap();
        let b = embedder.embed("the quick brown fox").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unit_norm() {
        let embedder = Embedder::new();
        for text in ["a", "hello world", "a much longer sentence with many words in it"] {
            let v = embedder.embed(text).unwrap();
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-3, "norm {norm} for {text:?}");
        }
    }

    #[test]
    fn test_dimension() {
        let embedder = Embedder::new();
        assert_eq!(embedder.embed("x").unwrap().len(), EMBEDDING_DIM);
        let small = Embedder::with_dim(16);
        assert_eq!(small.embed("x").unwrap().len(), 16);
    }

    #[test]
    fn test_no_nan_or_infinite() {
        let embedder = Embedder::new();
        let v = embedder.embed("numbers 123 and symbols !?%").unwrap();
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_empty_input_fails() {
        let embedder = Embedder::new();
        assert_eq!(embedder.embed(""), Err(EmbedError::EmptyInput));
        assert_eq!(embedder.embed("   \n\t"), Err(EmbedError::EmptyInput));
    }

    #[test]
    fn test_identical_texts_fully_similar() {
        let embedder = Embedder::new();
        let a = embedder.embed("similarity check").unwrap();
        let b = embedder.embed("similarity check").unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_different_texts_differ() {
        let embedder = Embedder::new();
        let a = embedder.embed("storage engines and branches").unwrap();
        let b = embedder.embed("an unrelated cooking recipe").unwrap();
        assert!(cosine_similarity(&a, &b) < 0.9);
    }
}

#![allow(dead_code)]

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// `n` rows of length `len` with entries in `[-1, 1)`.
pub fn make_rows(n: usize, len: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

/// A random symmetric positive semi-definite `n x n` matrix `AᵀA`.
pub fn make_gram(n: usize, seed: u64) -> Vec<Vec<f64>> {
    let a = make_rows(n, n, seed);
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| a.iter().map(|row| row[i] * row[j]).sum())
                .collect()
        })
        .collect()
}

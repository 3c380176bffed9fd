//! Mini-batch subsampling and seeded random streams.
//!
//! Every random draw of a request derives from one `u64` seed. Each purpose
//! (direction subset, first-order subset, second-order subset, Monte-Carlo
//! factor of sample `n`) reads its own ChaCha stream, so selecting a
//! different subset never changes another purpose's draws.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// What a random stream is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Directions,
    FirstOrder,
    SecondOrder,
    /// Monte-Carlo factor of one sample.
    MonteCarlo(usize),
    /// Free for downstream crates (damping policies, ...).
    User(u64),
}

impl Stream {
    /// Tag and index; distinct purposes never share a pair.
    fn key(self) -> (u8, u64) {
        match self {
            Stream::Directions => (0, 0),
            Stream::FirstOrder => (1, 0),
            Stream::SecondOrder => (2, 0),
            Stream::MonteCarlo(n) => (3, n as u64),
            Stream::User(k) => (4, k),
        }
    }
}

/// Independent, reproducible random stream for `purpose`.
///
/// The ChaCha key packs `seed`, the purpose tag and its index into disjoint
/// bytes.
pub fn stream(seed: u64, purpose: Stream) -> ChaCha8Rng {
    let (tag, index) = purpose.key();
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    key[8] = tag;
    key[16..24].copy_from_slice(&index.to_le_bytes());
    ChaCha8Rng::from_seed(key)
}

/// Which samples of a batch contribute to a quantity.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Subsample {
    /// Every sample, in batch order.
    #[default]
    All,
    /// The first `n` samples (`0..n`).
    First(usize),
    /// `n` samples drawn uniformly without replacement, returned in ascending
    /// order. Drawing all `N` samples therefore reproduces [`Subsample::All`].
    Random(usize),
    /// Explicit indices; must be unique and in range. Order is preserved.
    Indices(Vec<usize>),
}

impl Subsample {
    /// Resolve to concrete sample indices for a batch of `batch_size`.
    pub fn select(
        &self,
        batch_size: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<usize>, ConfigurationError> {
        if batch_size == 0 {
            return Err(ConfigurationError::EmptyBatch);
        }
        let check = |n: usize| {
            if n == 0 || n > batch_size {
                Err(ConfigurationError::InvalidSubsample {
                    requested: n,
                    available: batch_size,
                })
            } else {
                Ok(n)
            }
        };
        match self {
            Subsample::All => Ok((0..batch_size).collect()),
            Subsample::First(n) => Ok((0..check(*n)?).collect()),
            Subsample::Random(n) => {
                let n = check(*n)?;
                let mut picked = rand::seq::index::sample(rng, batch_size, n).into_vec();
                picked.sort_unstable();
                Ok(picked)
            }
            Subsample::Indices(indices) => {
                check(indices.len())?;
                let mut seen = vec![false; batch_size];
                for &i in indices {
                    if i >= batch_size {
                        return Err(ConfigurationError::SampleOutOfRange {
                            index: i,
                            available: batch_size,
                        });
                    }
                    if seen[i] {
                        return Err(ConfigurationError::InvalidSubsample {
                            requested: indices.len(),
                            available: batch_size,
                        });
                    }
                    seen[i] = true;
                }
                Ok(indices.clone())
            }
        }
    }
}

/// Assignment of batch samples to the three computational tasks.
///
/// Directions (the Gram matrix and its eigenvectors), first-order and
/// second-order directional derivatives may each use a different subset.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SampleSplit {
    pub directions: Subsample,
    pub first_order: Subsample,
    pub second_order: Subsample,
}

impl SampleSplit {
    /// Use the same policy for every task.
    pub fn uniform(policy: Subsample) -> Self {
        SampleSplit {
            directions: policy.clone(),
            first_order: policy.clone(),
            second_order: policy,
        }
    }

    pub fn resolve(&self, batch_size: usize, seed: u64) -> Result<ResolvedSplit, ConfigurationError> {
        Ok(ResolvedSplit {
            directions: self
                .directions
                .select(batch_size, &mut stream(seed, Stream::Directions))?,
            first_order: self
                .first_order
                .select(batch_size, &mut stream(seed, Stream::FirstOrder))?,
            second_order: self
                .second_order
                .select(batch_size, &mut stream(seed, Stream::SecondOrder))?,
            batch_size,
        })
    }
}

/// Concrete sample indices per task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSplit {
    pub directions: Vec<usize>,
    pub first_order: Vec<usize>,
    pub second_order: Vec<usize>,
    pub batch_size: usize,
}

impl ResolvedSplit {
    /// Samples whose loss-Hessian factor must be backpropagated, ascending.
    pub fn factor_samples(&self) -> Vec<usize> {
        let mut needed = vec![false; self.batch_size];
        for &i in self.directions.iter().chain(&self.second_order) {
            needed[i] = true;
        }
        (0..self.batch_size).filter(|&i| needed[i]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_n_is_prefix() {
        let mut rng = stream(0, Stream::Directions);
        assert_eq!(Subsample::First(3).select(5, &mut rng).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn random_is_sorted_unique_and_reproducible() {
        let a = Subsample::Random(4)
            .select(10, &mut stream(42, Stream::Directions))
            .unwrap();
        let b = Subsample::Random(4)
            .select(10, &mut stream(42, Stream::Directions))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn random_full_batch_equals_all() {
        let picked = Subsample::Random(6)
            .select(6, &mut stream(3, Stream::Directions))
            .unwrap();
        assert_eq!(picked, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn invalid_sizes() {
        let mut rng = stream(0, Stream::Directions);
        assert_eq!(
            Subsample::First(0).select(4, &mut rng),
            Err(ConfigurationError::InvalidSubsample {
                requested: 0,
                available: 4
            })
        );
        assert!(Subsample::Random(5).select(4, &mut rng).is_err());
        assert!(Subsample::Indices(vec![1, 1]).select(4, &mut rng).is_err());
        assert_eq!(
            Subsample::Indices(vec![7]).select(4, &mut rng),
            Err(ConfigurationError::SampleOutOfRange {
                index: 7,
                available: 4
            })
        );
    }

    #[test]
    fn streams_are_independent() {
        use rand::Rng;
        let x: u64 = stream(1, Stream::MonteCarlo(0)).gen();
        let y: u64 = stream(1, Stream::MonteCarlo(1)).gen();
        let z: u64 = stream(1, Stream::MonteCarlo(0)).gen();
        assert_ne!(x, y);
        assert_eq!(x, z);
    }

    #[test]
    fn user_streams_cover_the_full_index_range() {
        use rand::Rng;
        let draw = |purpose| stream(9, purpose).gen::<u64>();
        let top = draw(Stream::User(u64::MAX));
        assert_eq!(top, draw(Stream::User(u64::MAX)));
        assert_ne!(draw(Stream::User(0)), draw(Stream::User(1 << 63)));
        assert_ne!(draw(Stream::User(1)), draw(Stream::MonteCarlo(1)));
        assert_ne!(draw(Stream::Directions), draw(Stream::User(0)));
        assert_ne!(
            stream(9, Stream::User(5)).gen::<u64>(),
            stream(10, Stream::User(5)).gen::<u64>()
        );
    }

    #[test]
    fn factor_samples_is_union() {
        let split = ResolvedSplit {
            directions: vec![3, 0],
            first_order: vec![1],
            second_order: vec![0, 2],
            batch_size: 5,
        };
        assert_eq!(split.factor_samples(), vec![0, 2, 3]);
    }
}

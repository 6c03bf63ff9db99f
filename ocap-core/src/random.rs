//! Random number generation provider abstraction.
//!
//! Randomness feeds backoff jitter and incarnation ids. Production code uses
//! the thread-local RNG; tests use [`ChaChaRandomProvider`] with a fixed seed
//! so jitter sequences are reproducible.

use rand::distr::{Distribution, StandardUniform};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::cell::RefCell;
use std::rc::Rc;

/// Provider trait for random number generation.
///
/// Implementations hold their own source of randomness and hand out values
/// through `&self`, so a provider can be cloned into every peer driver.
pub trait RandomProvider: Clone {
    /// Generate a random value of type T.
    ///
    /// The type T must implement the Standard distribution.
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>;

    /// Generate a random f64 between 0.0 and 1.0.
    ///
    /// This is a convenience method for generating ratios and percentages.
    fn random_ratio(&self) -> f64;
}

/// Production random provider using thread-local RNG.
///
/// Uses `rand::rng()` (thread-local, non-cryptographic) for efficient
/// random number generation in production environments.
///
/// # Example
///
/// ```rust
/// use ocap_core::{RandomProvider, TokioRandomProvider};
///
/// let random = TokioRandomProvider::new();
/// let value: u64 = random.random();
/// let ratio = random.random_ratio();
/// assert!((0.0..1.0).contains(&ratio));
/// ```
#[derive(Clone, Default)]
pub struct TokioRandomProvider;

impl TokioRandomProvider {
    /// Create a new production random provider.
    pub fn new() -> Self {
        Self
    }
}

// Thread-local RNG for TokioRandomProvider
thread_local! {
    static RNG: RefCell<rand::rngs::ThreadRng> = RefCell::new(rand::rng());
}

impl RandomProvider for TokioRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        RNG.with(|rng| rng.borrow_mut().random())
    }

    fn random_ratio(&self) -> f64 {
        RNG.with(|rng| rng.borrow_mut().random())
    }
}

/// Seeded random provider backed by ChaCha8.
///
/// Clones share the same generator state.
#[derive(Clone, Debug)]
pub struct ChaChaRandomProvider {
    rng: Rc<RefCell<ChaCha8Rng>>,
}

impl ChaChaRandomProvider {
    /// Create a provider seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Rc::new(RefCell::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }
}

impl RandomProvider for ChaChaRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        self.rng.borrow_mut().random()
    }

    fn random_ratio(&self) -> f64 {
        self.rng.borrow_mut().random()
    }
}

//! Provider bundle trait for simplified type parameters.
//!
//! The reliability layer needs a dialer, a clock, a task spawner and a random
//! source. [`Providers`] bundles them behind one type parameter so the manager
//! and the per-peer driver read as `Foo<P: Providers>`.
//!
//! ```rust
//! use ocap_core::{Providers, TimeProvider, TokioProviders};
//!
//! let providers = TokioProviders::new();
//! let _elapsed = providers.time().now();
//! ```

use crate::{
    Dialer, RandomProvider, TaskProvider, TimeProvider, TokioDialer, TokioRandomProvider,
    TokioTaskProvider, TokioTimeProvider,
};

/// Bundle of all provider types for a runtime environment.
///
/// ## Implementations
///
/// - [`TokioProviders`]: Tokio TCP, real clock, thread-local RNG
/// - [`crate::memory::MemoryProviders`]: in-memory network with a seeded RNG
pub trait Providers: Clone + 'static {
    /// Dialer type for outbound connections and listeners.
    type Dialer: Dialer + Clone + 'static;

    /// Time provider type for sleep, timeout, and time queries.
    type Time: TimeProvider + Clone + 'static;

    /// Task provider type for spawning local tasks.
    type Task: TaskProvider + Clone + 'static;

    /// Random provider type for jitter and incarnation ids.
    type Random: RandomProvider + Clone + 'static;

    /// Get the dialer instance.
    fn dialer(&self) -> &Self::Dialer;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the task provider instance.
    fn task(&self) -> &Self::Task;

    /// Get the random provider instance.
    fn random(&self) -> &Self::Random;
}

/// Production providers using Tokio runtime.
#[derive(Clone)]
pub struct TokioProviders {
    dialer: TokioDialer,
    time: TokioTimeProvider,
    task: TokioTaskProvider,
    random: TokioRandomProvider,
}

impl TokioProviders {
    /// Create a new production providers bundle.
    pub fn new() -> Self {
        Self {
            dialer: TokioDialer::new(),
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
            random: TokioRandomProvider::new(),
        }
    }
}

impl Default for TokioProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl Providers for TokioProviders {
    type Dialer = TokioDialer;
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;
    type Random = TokioRandomProvider;

    fn dialer(&self) -> &Self::Dialer {
        &self.dialer
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }

    fn random(&self) -> &Self::Random {
        &self.random
    }
}

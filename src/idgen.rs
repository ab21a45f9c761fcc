//! Transaction id generation.
//!
//! Transaction ids are the first line of defense against off-path
//! spoofing, so they must be unpredictable: the default generator draws
//! from the operating system backed RNG. The generator is an owned member
//! of the core rather than a global, so tests can inject a deterministic
//! one.

use rand::rngs::ThreadRng;
use rand::Rng;

//------------ IdGenerator ---------------------------------------------------

/// A source of 16-bit transaction ids.
///
/// The generator does not track which ids are in use; the core checks a
/// fresh id against its registry of outstanding operations and asks for
/// another one on a collision, a bounded number of times.
pub trait IdGenerator {
    /// Returns a candidate transaction id.
    fn generate(&mut self) -> u16;
}

//------------ RandomIds -----------------------------------------------------

/// The default id source, uniform over the full 16-bit range.
#[derive(Debug, Default)]
pub struct RandomIds {
    /// The thread-local RNG, which is cryptographically secure and
    /// reseeded from the operating system.
    rng: ThreadRng,
}

impl RandomIds {
    /// Creates a new generator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for RandomIds {
    fn generate(&mut self) -> u16 {
        self.rng.gen()
    }
}

//============ Testing ======================================================

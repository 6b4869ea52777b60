use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of group secrets, connect passwords and gupids.
///
/// Owned by the pool; there is no global state.
pub struct RandomGenerator {
    rng: Mutex<StdRng>,
    gupid_seq: AtomicU64,
}

impl RandomGenerator {
    pub fn new() -> RandomGenerator {
        RandomGenerator {
            rng: Mutex::new(StdRng::from_entropy()),
            gupid_seq: AtomicU64::new(1),
        }
    }

    /// A random alphanumeric ASCII string of the given length.
    pub fn ascii_string(&self, len: usize) -> String {
        let mut rng = self.rng.lock().unwrap();
        (&mut *rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    /// A globally unique process identifier, stable for the life of a
    /// process object.
    pub fn gupid(&self) -> String {
        let seq = self.gupid_seq.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.ascii_string(8), seq)
    }
}

impl Default for RandomGenerator {
    fn default() -> RandomGenerator {
        RandomGenerator::new()
    }
}

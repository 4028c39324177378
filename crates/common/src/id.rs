//! ID generation utilities.

use std::sync::Mutex;

use ulid::Generator;

/// Generator for job identifiers.
///
/// IDs are lowercase ULIDs from a monotonic generator: within one process,
/// every ID sorts lexicographically after the previous one, even when both
/// were produced in the same millisecond.
#[derive(Default)]
pub struct IdGenerator {
    inner: Mutex<Generator>,
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Generate a new time-ordered ID.
    #[must_use]
    pub fn generate(&self) -> String {
        // A poisoned lock still holds a valid generator state.
        let mut generator = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Overflow only happens after 2^80 IDs in one millisecond.
        generator
            .generate()
            .unwrap_or_else(|_| ulid::Ulid::new())
            .to_string()
            .to_lowercase()
    }
}

//! Thread-safe generation counter that retires stale session handles.
//!
//! # What is a generation? (for beginners)
//!
//! Only one application can be selected on the key at a time.  Every time the
//! host grants a new session (or the link drops) the previous session becomes
//! useless: the key is now talking to a different application, or to nobody.
//!
//! Instead of tracking every handle that was ever given out, the host keeps a
//! single counter.  Each handle remembers the counter value it was issued
//! under, its *generation*.  Granting a new session or losing the link bumps
//! the counter, and a handle whose generation no longer matches knows it has
//! been retired without anyone having to notify it.
//!
//! # Thread safety
//!
//! The counter is an `AtomicU64`.  Handles on any thread can compare against
//! it without taking a lock while the connection task advances it.  The
//! counter never goes backwards, not even across a reconnect, so a handle from
//! before a disconnect can never become valid again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// The counter value a session handle was issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation before any session was granted.
    pub const INITIAL: Generation = Generation(0);
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// A thread-safe, monotonically increasing generation counter.
///
/// # Examples
///
/// ```rust
/// use keylink_core::{Generation, GenerationCounter};
///
/// let counter = GenerationCounter::new();
/// let first = counter.advance();
/// assert!(counter.is_current(first));
///
/// counter.advance();
/// assert!(!counter.is_current(first));
/// ```
pub struct GenerationCounter {
    inner: AtomicU64,
}

impl GenerationCounter {
    /// Creates a counter at [`Generation::INITIAL`].
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(Generation::INITIAL.0),
        }
    }

    /// Moves to the next generation and returns it.
    ///
    /// Saturates at `u64::MAX` rather than wrapping, so an old generation can
    /// never compare equal to a new one.
    ///
    /// # Atomic ordering
    ///
    /// `AcqRel` pairs with the `Acquire` load in [`current`](Self::current):
    /// a thread that observes the new generation also observes everything the
    /// advancing thread wrote before advancing it.
    pub fn advance(&self) -> Generation {
        let previous = self
            .inner
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |g| {
                Some(g.saturating_add(1))
            })
            .unwrap_or_else(|g| g);
        Generation(previous.saturating_add(1))
    }

    pub fn current(&self) -> Generation {
        Generation(self.inner.load(Ordering::Acquire))
    }

    /// Returns `true` if `generation` has not been retired.
    pub fn is_current(&self, generation: Generation) -> bool {
        self.current() == generation
    }
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GenerationCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GenerationCounter").field(&self.current()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_starts_at_initial() {
        // Arrange / Act
        let counter = GenerationCounter::new();

        // Assert
        assert_eq!(counter.current(), Generation::INITIAL);
    }

    #[test]
    fn test_advance_returns_new_value() {
        // Arrange
        let counter = GenerationCounter::new();

        // Act
        let first = counter.advance();
        let second = counter.advance();

        // Assert
        assert_eq!(first, Generation(1));
        assert_eq!(second, Generation(2));
        assert_eq!(counter.current(), second);
    }

    #[test]
    fn test_advance_retires_previous_generation() {
        // Arrange
        let counter = GenerationCounter::new();
        let old = counter.advance();

        // Act
        let new = counter.advance();

        // Assert
        assert!(!counter.is_current(old));
        assert!(counter.is_current(new));
        assert!(new > old);
    }

    #[test]
    fn test_advance_saturates_instead_of_wrapping() {
        // Arrange – start one step before the end
        let counter = GenerationCounter {
            inner: AtomicU64::new(u64::MAX - 1),
        };

        // Act
        let last = counter.advance();
        let still_last = counter.advance();

        // Assert
        assert_eq!(last, Generation(u64::MAX));
        assert_eq!(still_last, Generation(u64::MAX));
    }

    #[test]
    fn test_concurrent_advances_are_unique() {
        // Arrange
        let counter = Arc::new(GenerationCounter::new());
        let thread_count = 8;
        let advances_per_thread = 500;

        // Act
        let handles: Vec<_> = (0..thread_count)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || {
                    (0..advances_per_thread)
                        .map(|_| c.advance())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<Generation> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert – no two advances produced the same generation
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), thread_count * advances_per_thread);
        assert_eq!(
            counter.current(),
            Generation((thread_count * advances_per_thread) as u64)
        );
    }
}

//! Finalization safety net for closure wrappers.
//!
//! Explicit release is the normal way a closure goes away. The registry
//! covers wrappers the host dropped without releasing: it keeps a weak
//! reference to each wrapper next to the shared state, and a sweep destroys
//! every state whose wrappers are all gone.

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;

use crate::bridge::Bridge;
use crate::closure::{Closure, ClosureInner, ClosureState};

struct Entry {
    wrapper: Weak<ClosureInner>,
    state: Rc<ClosureState>,
}

/// Tracks closure wrappers that may need finalizing.
pub struct FinalizationRegistry {
    entries: Vec<Entry>,
    /// Registrations between automatic sweeps.
    threshold: usize,
    /// Registrations since the last sweep.
    registrations: usize,
    finalized: u64,
}

impl FinalizationRegistry {
    /// Create a registry that asks for a sweep every `threshold` registrations.
    pub fn new(threshold: usize) -> Self {
        FinalizationRegistry {
            entries: Vec::new(),
            threshold: threshold.max(1),
            registrations: 0,
            finalized: 0,
        }
    }

    /// Track a wrapper. Returns whether a sweep is due.
    pub fn register(&mut self, closure: &Closure) -> bool {
        self.entries.push(Entry {
            wrapper: Rc::downgrade(&closure.inner),
            state: Rc::clone(&closure.inner.state),
        });
        self.registrations += 1;
        self.registrations >= self.threshold
    }

    /// Number of tracked wrappers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total states destroyed by sweeps.
    pub fn finalized(&self) -> u64 {
        self.finalized
    }

    /// Drop entries for destroyed states and hand back the states whose
    /// wrappers were dropped without release.
    fn sweep(&mut self) -> Vec<Rc<ClosureState>> {
        self.registrations = 0;
        let mut doomed = Vec::new();
        self.entries.retain(|entry| {
            if entry.state.is_destroyed() {
                return false;
            }
            if entry.wrapper.strong_count() == 0 {
                doomed.push(Rc::clone(&entry.state));
                return false;
            }
            true
        });
        self.finalized += doomed.len() as u64;
        doomed
    }
}

impl Bridge {
    /// Destroy closures whose wrappers were dropped without release.
    ///
    /// Returns how many were destroyed.
    pub fn collect_garbage(&mut self) -> usize {
        let doomed = self.finalizers.sweep();
        for state in &doomed {
            state.destroy(self);
        }
        if !doomed.is_empty() {
            log::debug!("finalized {} unreleased closures", doomed.len());
        }
        doomed.len()
    }

    /// The finalization registry.
    pub fn finalizers(&self) -> &FinalizationRegistry {
        &self.finalizers
    }
}

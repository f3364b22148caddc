//! Identifiers. `uid` is a monotonically increasing counter rather than an
//! object identity, and `compute_id` similarly never repeats within a
//! scheduler process lifetime.
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type ComputeId = u64;
pub type Uid = u64;

/// A process-lifetime monotonic counter. Never resets except on scheduler
/// restart; guarantees that a uid present in `sched_jobs` is never also
/// present in a cluster's `jobs_queue`, since two live jobs can never share
/// a uid.
#[derive(Debug, Default)]
pub struct IdGen(AtomicU64);

impl IdGen {
    pub fn new() -> Self {
        // start at 1; 0 is reserved as a sentinel in a couple of wire replies
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A reply-binding nonce. Rotated on reschedule so that a stale reply from
/// a node that died mid-job is rejected rather than accepted against the
/// job's new incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub u64);

impl Hash {
    pub fn fresh() -> Self {
        use rand::RngCore;
        Self(rand::thread_rng().next_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_gen_never_repeats() {
        let gen = IdGen::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn fresh_hashes_differ() {
        let a = Hash::fresh();
        let b = Hash::fresh();
        // astronomically unlikely to collide; if it does, a stale reply
        // could be mistaken for a fresh dispatch
        assert_ne!(a, b);
    }
}

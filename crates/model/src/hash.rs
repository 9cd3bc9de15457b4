//! Stable 64 bit hashing.
//!
//! User partitioning, regex memoization keys and shard routing all need a
//! hash that is identical across processes and restarts, which rules out the
//! randomly seeded std hasher.

use rustc_hash::FxHasher;
use std::hash::Hasher;

pub fn stable_hash(input: impl AsRef<[u8]>) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(input.as_ref());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_stable_across_calls() {
        assert_eq!(stable_hash("user-123"), stable_hash("user-123"));
        assert_ne!(stable_hash("user-123"), stable_hash("user-124"));
    }
}

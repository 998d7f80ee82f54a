// src/core/ids.rs

//! Rejection-sampled id allocation for new cluster objects.
//!
//! Ids must round-trip exactly through any JSON client that represents
//! numbers as IEEE-754 doubles, so they are held under 2^53. Sampling
//! (rather than a counter) avoids coordinating a separate sequence through
//! Raft: the proposer picks a candidate locally, the FSM apply path rejects
//! it if occupied, and the proposer retries.

use rand::Rng;

/// Ids fit in an `f64` mantissa exactly: 2^53.
pub const ID_SPACE: u64 = 1 << 53;

/// Retries before giving up and surfacing `unable_to_allocate_unique_id`.
pub const MAX_ATTEMPTS: u32 = 16;

/// Draws a candidate id in `[1, ID_SPACE)`, calling `is_taken` to test each
/// draw against the FSM's current state. Returns `None` after
/// [`MAX_ATTEMPTS`] collisions.
pub fn allocate<F>(mut is_taken: F) -> Option<i64>
where
    F: FnMut(i64) -> bool,
{
    let mut rng = rand::thread_rng();
    for _ in 0..MAX_ATTEMPTS {
        let candidate = rng.gen_range(1..ID_SPACE) as i64;
        if !is_taken(candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn allocates_within_id_space() {
        let id = allocate(|_| false).unwrap();
        assert!(id > 0 && (id as u64) < ID_SPACE);
    }

    #[test]
    fn retries_on_collision_then_succeeds() {
        let mut calls = 0;
        let id = allocate(|_| {
            calls += 1;
            calls < 3
        })
        .unwrap();
        assert!(id > 0);
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let result = allocate(|_| {
            calls += 1;
            true
        });
        assert!(result.is_none());
        assert_eq!(calls, MAX_ATTEMPTS);
    }

    #[test]
    fn many_draws_stay_distinct_with_high_probability() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = allocate(|c| seen.contains(&c)).unwrap();
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 1000);
    }
}

//! Sibling ordering keys.
//!
//! Positions are sparse `i64` keys: inserting between two siblings takes
//! the midpoint of their keys, inserting at an unbounded end steps by
//! [`IDEAL_DISTANCE`]. Nothing here renumbers unrelated siblings; when a
//! gap closes completely the caller gets [`GapExhausted`] and must
//! rebalance the list itself.
//!
//! [`GapExhausted`]: crate::error::TrellisError::GapExhausted

use crate::error::{Result, TrellisError};

/// Smallest usable ordering key.
pub const MIN_POSITION: i64 = i64::MIN;

/// Largest usable ordering key.
pub const MAX_POSITION: i64 = i64::MAX;

/// Key assigned to the first node placed under a parent.
pub const START_POSITION: i64 = 0;

/// Preferred spacing between consecutive keys, leaving room for later
/// midpoint insertions.
pub const IDEAL_DISTANCE: i64 = 500;

/// Compute an ordering key strictly between two optional neighbors.
///
/// - both neighbors: the midpoint of their keys
/// - only `before`: a key past it, unconstrained above
/// - only `after`: a key short of it, unconstrained below
/// - neither: [`START_POSITION`]
///
/// # Errors
///
/// Returns [`TrellisError::GapExhausted`] when no integer key remains
/// strictly between the neighbors (including a `before >= after` pair,
/// which callers should never produce).
pub fn position_between(before: Option<i64>, after: Option<i64>) -> Result<i64> {
    match (before, after) {
        (None, None) => Ok(START_POSITION),
        (Some(lo), None) => {
            if lo == MAX_POSITION {
                return Err(TrellisError::GapExhausted {
                    before: lo,
                    after: MAX_POSITION,
                });
            }
            if lo > MAX_POSITION - IDEAL_DISTANCE {
                midpoint(lo, MAX_POSITION)
            } else {
                Ok(lo + IDEAL_DISTANCE)
            }
        }
        (None, Some(hi)) => {
            if hi == MIN_POSITION {
                return Err(TrellisError::GapExhausted {
                    before: MIN_POSITION,
                    after: hi,
                });
            }
            if hi < MIN_POSITION + IDEAL_DISTANCE {
                midpoint(MIN_POSITION, hi)
            } else {
                Ok(hi - IDEAL_DISTANCE)
            }
        }
        (Some(lo), Some(hi)) => {
            if lo >= hi {
                return Err(TrellisError::GapExhausted {
                    before: lo,
                    after: hi,
                });
            }
            midpoint(lo, hi)
        }
    }
}

/// Floor midpoint in `i128` space so extreme keys cannot overflow.
fn midpoint(lo: i64, hi: i64) -> Result<i64> {
    let mid = (i128::from(lo) + i128::from(hi)).div_euclid(2);
    let mid = i64::try_from(mid).map_err(|_| TrellisError::GapExhausted {
        before: lo,
        after: hi,
    })?;
    if mid == lo {
        return Err(TrellisError::GapExhausted {
            before: lo,
            after: hi,
        });
    }
    Ok(mid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_key_is_start_position() {
        assert_eq!(position_between(None, None).unwrap(), START_POSITION);
    }

    #[test]
    fn after_last_steps_by_ideal_distance() {
        assert_eq!(position_between(Some(1000), None).unwrap(), 1500);
    }

    #[test]
    fn before_first_steps_back_by_ideal_distance() {
        assert_eq!(position_between(None, Some(1000)).unwrap(), 500);
        assert_eq!(position_between(None, Some(200)).unwrap(), -300);
    }

    #[test]
    fn between_two_keys_takes_the_midpoint() {
        assert_eq!(position_between(Some(100), Some(200)).unwrap(), 150);
        assert_eq!(position_between(Some(-300), Some(0)).unwrap(), -150);
    }

    #[test]
    fn repeated_insertion_stays_strictly_ordered() {
        let mut lo = 0;
        let hi = 1 << 20;
        for _ in 0..19 {
            let mid = position_between(Some(lo), Some(hi)).unwrap();
            assert!(mid > lo && mid < hi);
            lo = mid;
        }
    }

    #[test]
    fn adjacent_keys_exhaust_the_gap() {
        let err = position_between(Some(7), Some(8)).unwrap_err();
        assert!(matches!(
            err,
            TrellisError::GapExhausted { before: 7, after: 8 }
        ));
    }

    #[test]
    fn inverted_neighbors_are_rejected() {
        assert!(position_between(Some(10), Some(10)).is_err());
        assert!(position_between(Some(11), Some(10)).is_err());
    }

    #[test]
    fn edges_of_the_key_space() {
        assert!(position_between(Some(MAX_POSITION), None).is_err());
        assert!(position_between(None, Some(MIN_POSITION)).is_err());

        let near_top = position_between(Some(MAX_POSITION - 10), None).unwrap();
        assert!(near_top > MAX_POSITION - 10);

        let near_bottom = position_between(None, Some(MIN_POSITION + 10)).unwrap();
        assert!(near_bottom < MIN_POSITION + 10);

        // One key apart at the very edges: no room at all.
        assert!(position_between(Some(MAX_POSITION - 1), None).is_err());
        assert!(position_between(None, Some(MIN_POSITION + 1)).is_err());
    }
}

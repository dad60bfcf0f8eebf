//! Fee aggregation
//!
//! The auto-filled fee is the median of the connected servers' per-unit
//! estimates, not the mean: a single overloaded or misbehaving server
//! cannot drag the fee. Fee amounts are user-visible money, so the
//! rounding mode is pinned: an even-count median rounds half up.

/// Median of per-unit fee estimates. Even counts average the two middle
/// values, rounding half up. Empty input returns `None` (no connected
/// servers; fatal to fee auto-fill).
pub fn median_fee(mut fees: Vec<u64>) -> Option<u64> {
    if fees.is_empty() {
        return None;
    }
    fees.sort_unstable();
    let n = fees.len();
    if n % 2 == 1 {
        Some(fees[n / 2])
    } else {
        let low = fees[n / 2 - 1];
        let high = fees[n / 2];
        Some((low + high + 1) / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn even_count_rounds_half_up() {
        assert_eq!(median_fee(vec![10, 20, 30, 40]), Some(25));
        assert_eq!(median_fee(vec![12, 48, 96, 192]), Some(72));
        // 48 and 85 average to 66.5, rounded up.
        assert_eq!(median_fee(vec![12, 48, 85, 192]), Some(67));
    }

    #[test]
    fn odd_count_takes_middle() {
        assert_eq!(median_fee(vec![12, 96, 48]), Some(48));
        assert_eq!(median_fee(vec![7]), Some(7));
    }

    #[test]
    fn zero_servers_is_fatal() {
        assert_eq!(median_fee(vec![]), None);
    }

    #[test]
    fn input_order_is_irrelevant() {
        assert_eq!(median_fee(vec![40, 10, 30, 20]), Some(25));
    }

    proptest! {
        #[test]
        fn median_stays_within_bounds(fees in proptest::collection::vec(1u64..10_000_000, 1..20)) {
            let lowest = *fees.iter().min().unwrap();
            let highest = *fees.iter().max().unwrap();
            let median = median_fee(fees.clone()).unwrap();
            prop_assert!(median >= lowest && median <= highest);

            let mut shuffled = fees;
            shuffled.reverse();
            prop_assert_eq!(median_fee(shuffled), Some(median));
        }
    }
}

//! Property-Based Tests for the XOR code
//!
//! # Test Properties
//!
//! 1. **Bounded loss**: any `correctable_missing()` fragments may vanish
//! 2. **Roundtrip**: recovered data equals the padded payload
//! 3. **Determinism**: encoding the same payload twice yields the same fragments

#![cfg(test)]

use std::sync::atomic::AtomicBool;

use proptest::prelude::*;

use super::codec::{encode, join, padded_len, recover};
use super::eccmap::EccMap;

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for picking one of the supported schemes.
fn scheme_strategy() -> impl Strategy<Value = EccMap> {
    prop::sample::select(EccMap::names()).prop_map(|name| EccMap::by_name(name).unwrap())
}

/// Strategy for a scheme plus a loss set no larger than its threshold.
///
/// Losses index the `k + m` fragments: `< k` is data, the rest parity.
fn scheme_with_losses() -> impl Strategy<Value = (EccMap, Vec<usize>)> {
    scheme_strategy().prop_flat_map(|map| {
        let total = map.total_count();
        let max = map.correctable_missing();
        let losses = prop::sample::subsequence((0..total).collect::<Vec<_>>(), 0..=max);
        (Just(map), losses)
    })
}

/// Strategy for a scheme plus a set of dead supplier positions.
fn scheme_with_dead_suppliers() -> impl Strategy<Value = (EccMap, Vec<usize>)> {
    scheme_strategy().prop_flat_map(|map| {
        let positions = (0..map.supplier_count()).collect::<Vec<_>>();
        let max = map.correctable_missing();
        (Just(map), prop::sample::subsequence(positions, 0..=max))
    })
}

/// Strategy for small payloads.
fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2000)
}

fn split_losses(map: &EccMap, losses: &[usize]) -> (Vec<bool>, Vec<bool>) {
    let k = map.data_count();
    let data = (0..k).map(|i| !losses.contains(&i)).collect();
    let parity = (0..map.parity_count())
        .map(|j| !losses.contains(&(k + j)))
        .collect();
    (data, parity)
}

// =============================================================================
// Recovery Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: any fragment loss up to the threshold is fixable.
    #[test]
    fn prop_bounded_fragment_loss_is_fixable((map, losses) in scheme_with_losses()) {
        let (data, parity) = split_losses(&map, &losses);
        let plan = map.plan_recovery(&data, &parity);
        prop_assert!(plan.is_complete());
        prop_assert!(plan.parity.iter().all(|p| *p));
    }

    /// Property: losing whole suppliers (data and parity) up to the threshold is fixable.
    #[test]
    fn prop_bounded_supplier_loss_is_fixable((map, dead) in scheme_with_dead_suppliers()) {
        let alive: Vec<bool> = (0..map.supplier_count()).map(|i| !dead.contains(&i)).collect();
        prop_assert!(map.is_fixable(&alive, &alive));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: recovered bytes equal the padded payload.
    #[test]
    fn prop_recover_roundtrip(
        (map, losses) in scheme_with_losses(),
        payload in payload_strategy(),
    ) {
        let never = AtomicBool::new(false);
        let encoded = encode(&map, &payload, &never)?;
        let k = map.data_count();

        let mut data: Vec<Option<Vec<u8>>> = encoded.data.iter().cloned().map(Some).collect();
        let mut parity: Vec<Option<Vec<u8>>> = encoded.parity.iter().cloned().map(Some).collect();
        for &loss in &losses {
            if loss < k {
                data[loss] = None;
            } else {
                parity[loss - k] = None;
            }
        }

        let plan = recover(&map, &mut data, &mut parity, true, &never)?;
        prop_assert!(plan.is_complete());

        let joined = join(&data)?;
        prop_assert_eq!(joined.len(), padded_len(payload.len(), k));
        prop_assert_eq!(&joined[..payload.len()], payload.as_slice());

        let rebuilt: Vec<Vec<u8>> = parity.into_iter().map(|p| p.unwrap_or_default()).collect();
        prop_assert_eq!(rebuilt, encoded.parity);
    }

    /// Property: encoding is deterministic.
    #[test]
    fn prop_encode_deterministic(map in scheme_strategy(), payload in payload_strategy()) {
        let never = AtomicBool::new(false);
        let first = encode(&map, &payload, &never)?;
        let second = encode(&map, &payload, &never)?;
        prop_assert_eq!(first, second);
    }
}

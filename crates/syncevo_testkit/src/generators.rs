//! Property-based test generators using proptest.

use proptest::prelude::*;
use syncevo_source::{Luid, Revision, RevisionMap};

/// Strategy for LUIDs: mostly numeric, some free-form as backends with
/// path or UID based IDs produce.
pub fn luid_strategy() -> impl Strategy<Value = Luid> {
    prop_oneof![
        3 => (1u64..10_000).prop_map(|n| Luid::new(n.to_string())),
        1 => prop::string::string_regex("[a-zA-Z0-9_./@-]{1,24}")
            .expect("Invalid regex")
            .prop_map(Luid::new),
    ]
}

/// Strategy for revisions.
pub fn revision_strategy() -> impl Strategy<Value = Revision> {
    prop_oneof![
        any::<u64>().prop_map(|n| Revision::new(n.to_string())),
        prop::string::string_regex("[ -~]{1,32}")
            .expect("Invalid regex")
            .prop_map(Revision::new),
    ]
}

/// Strategy for revision maps with up to `max_items` entries.
pub fn revision_map_strategy(max_items: usize) -> impl Strategy<Value = RevisionMap> {
    prop::collection::hash_map(luid_strategy(), revision_strategy(), 0..=max_items)
        .prop_map(|entries| entries.into_iter().collect())
}

/// Strategy for a `(current, previous)` pair sharing part of their items,
/// some of them with a different revision.
pub fn map_pair_strategy(max_items: usize) -> impl Strategy<Value = (RevisionMap, RevisionMap)> {
    prop::collection::vec(
        (luid_strategy(), revision_strategy(), 0u8..4),
        0..=max_items,
    )
    .prop_map(|entries| {
        let mut current = RevisionMap::new();
        let mut previous = RevisionMap::new();
        for (luid, revision, kind) in entries {
            match kind {
                // only now: added
                0 => {
                    current.insert(luid, revision);
                }
                // only before: deleted
                1 => {
                    previous.insert(luid, revision);
                }
                // both, same revision: unchanged
                2 => {
                    current.insert(luid.clone(), revision.clone());
                    previous.insert(luid, revision);
                }
                // both, different revision: updated
                _ => {
                    previous.insert(luid.clone(), format!("{revision}~old"));
                    current.insert(luid, revision);
                }
            }
        }
        (current, previous)
    })
}

/// Strategy for item content.
pub fn item_data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn maps_respect_size(map in revision_map_strategy(20)) {
            prop_assert!(map.len() <= 20);
        }

        #[test]
        fn pairs_are_generated((current, previous) in map_pair_strategy(30)) {
            prop_assert!(current.len() <= 30);
            prop_assert!(previous.len() <= 30);
        }
    }
}

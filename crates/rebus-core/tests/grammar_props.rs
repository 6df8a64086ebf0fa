// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for the selector grammar and content hashing.

use proptest::prelude::*;
use rebus_core::{DEFAULT_DOMAIN, Descriptor, Value, selector};

proptest! {
    #[test]
    fn valid_paths_are_accepted(path in "(/[A-Za-z0-9_-]{1,12}){1,5}") {
        prop_assert!(selector::validate_prefix(&path).is_ok());
        prop_assert!(selector::validate_selector(&path).is_ok());
        let hash = "0".repeat(64);
        prop_assert!(selector::validate_selector(&selector::join_hash(&path, &hash)).is_ok());
    }

    #[test]
    fn forbidden_bytes_are_rejected(path in "(/[A-Za-z0-9_-]{1,8}){1,3}", bad in "[ !$&*.:;<>?@\\\\|]") {
        let poisoned = format!("{path}{bad}");
        prop_assert!(selector::validate_selector(&poisoned).is_err());
    }

    #[test]
    fn selector_always_embeds_the_hash(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let d = Descriptor::new("p", "/raw", Value::Bytes(bytes), DEFAULT_DOMAIN, "inject").unwrap();
        prop_assert_eq!(selector::hash_of(d.selector()), Some(d.hash()));
        prop_assert_eq!(selector::prefix_of(d.selector()), "/raw");
    }

    #[test]
    fn hashing_is_deterministic_and_value_sensitive(
        a in proptest::collection::vec(any::<u8>(), 0..128),
        b in proptest::collection::vec(any::<u8>(), 0..128),
    ) {
        let da = Descriptor::new("x", "/raw", Value::Bytes(a.clone()), DEFAULT_DOMAIN, "i").unwrap();
        let da2 = Descriptor::new("x", "/raw", Value::Bytes(a.clone()), DEFAULT_DOMAIN, "i").unwrap();
        let db = Descriptor::new("x", "/raw", Value::Bytes(b.clone()), DEFAULT_DOMAIN, "i").unwrap();
        prop_assert_eq!(da.selector(), da2.selector());
        if a != b {
            prop_assert_ne!(da.selector(), db.selector());
        }
    }

    #[test]
    fn derived_hash_separates_agents(
        bytes in proptest::collection::vec(any::<u8>(), 0..64),
        agent_a in "[a-z]{1,8}",
        agent_b in "[a-z]{1,8}",
    ) {
        let parent =
            Descriptor::new("x", "/raw", Value::Bytes(bytes), DEFAULT_DOMAIN, "inject").unwrap();
        let ca = parent.spawn_descriptor("/out", Value::text("v"), &agent_a).unwrap();
        let cb = parent.spawn_descriptor("/out", Value::text("v"), &agent_b).unwrap();
        if agent_a == agent_b {
            prop_assert_eq!(ca.selector(), cb.selector());
        } else {
            prop_assert_ne!(ca.selector(), cb.selector());
        }
    }
}

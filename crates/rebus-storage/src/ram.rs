// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory descriptor store.
//!
//! Every index lives in process memory and dies with it; recommended only
//! together with the in-process transport. Insertion order is preserved
//! per domain so recency-ordered searches behave exactly like the disk
//! backend's.

use crate::{NameConfig, Storage, StorageError, anchored};
use rebus_core::{Descriptor, DescriptorMeta, Value, selector};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

#[derive(Default)]
struct DomainStore {
    /// Selectors in ingestion order, oldest first.
    order: Vec<String>,
    descriptors: HashMap<String, Descriptor>,
    /// selector prefix → version → full selector.
    versions: HashMap<String, BTreeMap<u32, String>>,
    /// precursor selector → derived selectors.
    edges: HashMap<String, BTreeSet<String>>,
    processed: HashMap<String, BTreeSet<NameConfig>>,
    processable: HashMap<String, BTreeSet<NameConfig>>,
}

impl DomainStore {
    fn resolve(&self, sel: &str) -> Option<String> {
        if let Some((prefix, n)) = selector::version_ref(sel) {
            let versions = self.versions.get(prefix)?;
            let version = if n < 0 {
                let max = i64::from(*versions.keys().next_back()?);
                u32::try_from(max + n + 1).ok()?
            } else {
                u32::try_from(n).ok()?
            };
            versions.get(&version).cloned()
        } else {
            Some(sel.to_owned())
        }
    }
}

/// RAM-backed [`Storage`] implementation.
#[derive(Default)]
pub struct RamStorage {
    domains: HashMap<String, DomainStore>,
    internal_state: HashMap<String, Vec<u8>>,
}

impl RamStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn domain(&self, domain: &str) -> Option<&DomainStore> {
        self.domains.get(domain)
    }
}

impl Storage for RamStorage {
    fn backend_name(&self) -> &'static str {
        "ramstorage"
    }

    fn stores_internal_state(&self) -> bool {
        false
    }

    fn add(&mut self, descriptor: Descriptor) -> Result<bool, StorageError> {
        let domain = descriptor.domain().to_owned();
        let sel = descriptor.selector().to_owned();
        let store = self.domains.entry(domain).or_default();
        if store.descriptors.contains_key(&sel) {
            return Ok(false);
        }
        store
            .versions
            .entry(selector::prefix_of(&sel).to_owned())
            .or_default()
            .insert(descriptor.version(), sel.clone());
        for precursor in descriptor.precursors() {
            store
                .edges
                .entry(precursor.clone())
                .or_default()
                .insert(sel.clone());
        }
        store.processed.entry(sel.clone()).or_default();
        store.order.push(sel.clone());
        store.descriptors.insert(sel, descriptor);
        Ok(true)
    }

    fn get_descriptor(&self, domain: &str, sel: &str) -> Option<DescriptorMeta> {
        let store = self.domain(domain)?;
        let sel = store.resolve(sel)?;
        store.descriptors.get(&sel).map(|d| d.meta().clone())
    }

    fn get_value(&self, domain: &str, sel: &str) -> Option<Value> {
        let store = self.domain(domain)?;
        let sel = store.resolve(sel)?;
        store.descriptors.get(&sel).map(|d| d.value().clone())
    }

    fn find(
        &self,
        domain: &str,
        selector_regex: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>, StorageError> {
        let regex = Regex::new(&anchored(selector_regex))?;
        let Some(store) = self.domain(domain) else {
            return Ok(Vec::new());
        };
        Ok(store
            .order
            .iter()
            .rev()
            .filter(|sel| regex.is_match(sel))
            .skip(offset)
            .take(if limit == 0 { usize::MAX } else { limit })
            .cloned()
            .collect())
    }

    fn find_by_selector(
        &self,
        domain: &str,
        prefix: &str,
        limit: usize,
        offset: usize,
    ) -> Vec<DescriptorMeta> {
        let Some(store) = self.domain(domain) else {
            return Vec::new();
        };
        store
            .order
            .iter()
            .rev()
            .filter(|sel| sel.starts_with(prefix))
            .skip(offset)
            .take(if limit == 0 { usize::MAX } else { limit })
            .filter_map(|sel| store.descriptors.get(sel))
            .map(|d| d.meta().clone())
            .collect()
    }

    fn find_by_uuid(&self, domain: &str, uuid: Uuid) -> Vec<DescriptorMeta> {
        let Some(store) = self.domain(domain) else {
            return Vec::new();
        };
        store
            .order
            .iter()
            .filter_map(|sel| store.descriptors.get(sel))
            .filter(|d| d.uuid() == uuid)
            .map(|d| d.meta().clone())
            .collect()
    }

    fn find_by_value(
        &self,
        domain: &str,
        prefix: &str,
        value_regex: &str,
    ) -> Result<Vec<DescriptorMeta>, StorageError> {
        let regex = Regex::new(&anchored(value_regex))?;
        let Some(store) = self.domain(domain) else {
            return Ok(Vec::new());
        };
        Ok(store
            .order
            .iter()
            .filter(|sel| sel.starts_with(prefix))
            .filter_map(|sel| store.descriptors.get(sel))
            .filter(|d| regex.is_match(&d.value().search_text()))
            .map(|d| d.meta().clone())
            .collect())
    }

    fn list_uuids(&self, domain: &str) -> BTreeMap<Uuid, String> {
        let mut result = BTreeMap::new();
        let Some(store) = self.domain(domain) else {
            return result;
        };
        for sel in &store.order {
            let Some(desc) = store.descriptors.get(sel) else {
                continue;
            };
            // Prefer the label of a precursor-less descriptor.
            if !result.contains_key(&desc.uuid()) || desc.precursors().is_empty() {
                result.insert(desc.uuid(), desc.label().to_owned());
            }
        }
        result
    }

    fn get_children(&self, domain: &str, sel: &str, recurse: bool) -> Vec<DescriptorMeta> {
        let Some(store) = self.domain(domain) else {
            return Vec::new();
        };
        if !store.descriptors.contains_key(sel) {
            return Vec::new();
        }
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: Vec<&str> = vec![sel];
        let mut result = Vec::new();
        while let Some(parent) = queue.pop() {
            let Some(children) = store.edges.get(parent) else {
                continue;
            };
            for child in children {
                if seen.insert(child.clone()) {
                    if let Some(desc) = store.descriptors.get(child) {
                        result.push(desc.meta().clone());
                    }
                    if recurse {
                        queue.push(child);
                    }
                }
            }
        }
        result
    }

    fn mark_processed(&mut self, domain: &str, sel: &str, agent_name: &str, config: &str) -> bool {
        let Some(store) = self.domains.get_mut(domain) else {
            return false;
        };
        let Some(processed) = store.processed.get_mut(sel) else {
            return false;
        };
        let key = (agent_name.to_owned(), config.to_owned());
        let mut newly = processed.insert(key.clone());
        if let Some(processable) = store.processable.get_mut(sel) {
            if processable.remove(&key) {
                // The pair already counted itself via mark_processable.
                newly = false;
            }
        }
        newly
    }

    fn mark_processable(
        &mut self,
        domain: &str,
        sel: &str,
        agent_name: &str,
        config: &str,
    ) -> bool {
        let Some(store) = self.domains.get_mut(domain) else {
            return false;
        };
        if !store.descriptors.contains_key(sel) {
            return false;
        }
        let key = (agent_name.to_owned(), config.to_owned());
        let newly = store
            .processable
            .entry(sel.to_owned())
            .or_default()
            .insert(key.clone());
        // Two instances of one agent may run in different modes; a pair
        // that already processed the selector is not newly processable.
        newly && !store.processed.get(sel).is_some_and(|p| p.contains(&key))
    }

    fn get_processed(&self, domain: &str, sel: &str) -> Vec<NameConfig> {
        self.domain(domain)
            .and_then(|s| s.processed.get(sel))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn get_processable(&self, domain: &str, sel: &str) -> Vec<NameConfig> {
        self.domain(domain)
            .and_then(|s| s.processable.get(sel))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn processed_stats(&self, domain: &str) -> (Vec<(String, u64)>, u64) {
        let Some(store) = self.domain(domain) else {
            return (Vec::new(), 0);
        };
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for pairs in store.processed.values() {
            let names: BTreeSet<&str> = pairs.iter().map(|(name, _)| name.as_str()).collect();
            for name in names {
                *counts.entry(name).or_default() += 1;
            }
        }
        (
            counts.into_iter().map(|(n, c)| (n.to_owned(), c)).collect(),
            store.order.len() as u64,
        )
    }

    fn store_agent_state(&mut self, agent_name: &str, state: &[u8]) -> Result<(), StorageError> {
        self.internal_state
            .insert(agent_name.to_owned(), state.to_vec());
        Ok(())
    }

    fn load_agent_state(&self, agent_name: &str) -> Vec<u8> {
        self.internal_state
            .get(agent_name)
            .cloned()
            .unwrap_or_default()
    }

    fn store_state(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn list_unprocessed_by_agent(
        &self,
        agent_name: &str,
        config: &str,
    ) -> Vec<(String, Uuid, String)> {
        let key = (agent_name.to_owned(), config.to_owned());
        let mut result = Vec::new();
        for (domain, store) in &self.domains {
            for sel in &store.order {
                let done = store.processed.get(sel).is_some_and(|p| p.contains(&key));
                if !done {
                    if let Some(desc) = store.descriptors.get(sel) {
                        result.push((domain.clone(), desc.uuid(), sel.clone()));
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebus_core::DEFAULT_DOMAIN;

    fn root(prefix: &str, bytes: &[u8]) -> Descriptor {
        Descriptor::new(
            "t",
            prefix,
            Value::Bytes(bytes.to_vec()),
            DEFAULT_DOMAIN,
            "inject",
        )
        .unwrap()
    }

    #[test]
    fn re_adding_is_a_no_op() {
        let mut s = RamStorage::new();
        let d = root("/raw", b"x");
        assert!(s.add(d.clone()).unwrap());
        assert!(!s.add(d.clone()).unwrap());
        assert_eq!(s.find(DEFAULT_DOMAIN, "/raw", 0, 0).unwrap().len(), 1);
    }

    #[test]
    fn find_is_most_recent_first() {
        let mut s = RamStorage::new();
        let a = root("/raw", b"a");
        let b = root("/raw", b"b");
        s.add(a.clone()).unwrap();
        s.add(b.clone()).unwrap();
        let found = s.find(DEFAULT_DOMAIN, "/raw", 0, 0).unwrap();
        assert_eq!(found, vec![b.selector().to_owned(), a.selector().to_owned()]);
        // Offset skips the most recent.
        let found = s.find(DEFAULT_DOMAIN, "/raw", 1, 1).unwrap();
        assert_eq!(found, vec![a.selector().to_owned()]);
    }

    #[test]
    fn find_anchors_at_selector_start() {
        let mut s = RamStorage::new();
        s.add(root("/binary/elf", b"x")).unwrap();
        assert_eq!(s.find(DEFAULT_DOMAIN, "/binary", 0, 0).unwrap().len(), 1);
        assert!(s.find(DEFAULT_DOMAIN, "elf", 0, 0).unwrap().is_empty());
        assert!(s.find(DEFAULT_DOMAIN, "[", 0, 0).is_err());
    }

    #[test]
    fn version_references_resolve() {
        let mut s = RamStorage::new();
        let v0 = root("/graph/dot", b"digraph {}");
        let v1 = v0.new_version(Value::Bytes(b"digraph {a}".to_vec()), "g").unwrap();
        let v2 = v1.new_version(Value::Bytes(b"digraph {b}".to_vec()), "g").unwrap();
        for d in [&v0, &v1, &v2] {
            s.add(d.clone()).unwrap();
        }
        let got = s.get_descriptor(DEFAULT_DOMAIN, "/graph/dot/~0").unwrap();
        assert_eq!(got.selector(), v0.selector());
        let got = s.get_descriptor(DEFAULT_DOMAIN, "/graph/dot/~-1").unwrap();
        assert_eq!(got.selector(), v2.selector());
        let got = s.get_descriptor(DEFAULT_DOMAIN, "/graph/dot/~-2").unwrap();
        assert_eq!(got.selector(), v1.selector());
        assert!(s.get_descriptor(DEFAULT_DOMAIN, "/graph/dot/~9").is_none());
        assert!(s.get_value(DEFAULT_DOMAIN, "/graph/dot/~1").is_some());
    }

    #[test]
    fn children_follow_edges() {
        let mut s = RamStorage::new();
        let parent = root("/archive/zip", b"zip");
        let child = parent
            .spawn_descriptor("/binary/elf", Value::Bytes(b"elf".to_vec()), "unzip")
            .unwrap();
        let grandchild = child
            .spawn_descriptor("/text/ascii", Value::text("strings"), "strings")
            .unwrap();
        s.add(parent.clone()).unwrap();
        s.add(child.clone()).unwrap();
        s.add(grandchild.clone()).unwrap();

        let direct = s.get_children(DEFAULT_DOMAIN, parent.selector(), false);
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].selector(), child.selector());

        let all = s.get_children(DEFAULT_DOMAIN, parent.selector(), true);
        let sels: BTreeSet<&str> = all.iter().map(|d| d.selector()).collect();
        assert!(sels.contains(child.selector()));
        assert!(sels.contains(grandchild.selector()));
    }

    #[test]
    fn processed_then_processable_bookkeeping() {
        let mut s = RamStorage::new();
        let d = root("/raw", b"x");
        let sel = d.selector().to_owned();
        s.add(d).unwrap();

        assert!(s.mark_processable(DEFAULT_DOMAIN, &sel, "cat", "{}"));
        assert!(!s.mark_processable(DEFAULT_DOMAIN, &sel, "cat", "{}"));
        // Moving to processed is not "new" — the pair was already counted.
        assert!(!s.mark_processed(DEFAULT_DOMAIN, &sel, "cat", "{}"));
        assert!(s.get_processable(DEFAULT_DOMAIN, &sel).is_empty());
        assert_eq!(
            s.get_processed(DEFAULT_DOMAIN, &sel),
            vec![("cat".to_owned(), "{}".to_owned())]
        );
        // Marking processable after processed is not new either.
        assert!(!s.mark_processable(DEFAULT_DOMAIN, &sel, "cat", "{}"));
    }

    #[test]
    fn mark_processed_is_new_once_per_config() {
        let mut s = RamStorage::new();
        let d = root("/raw", b"x");
        let sel = d.selector().to_owned();
        s.add(d).unwrap();
        assert!(s.mark_processed(DEFAULT_DOMAIN, &sel, "cat", "{\"a\":1}"));
        assert!(!s.mark_processed(DEFAULT_DOMAIN, &sel, "cat", "{\"a\":1}"));
        assert!(s.mark_processed(DEFAULT_DOMAIN, &sel, "cat", "{\"a\":2}"));
        assert!(!s.mark_processed(DEFAULT_DOMAIN, "/raw/%missing", "cat", "{}"));
    }

    #[test]
    fn stats_count_distinct_selectors_per_name() {
        let mut s = RamStorage::new();
        let a = root("/raw", b"a");
        let b = root("/raw", b"b");
        for d in [&a, &b] {
            s.add(d.clone()).unwrap();
        }
        s.mark_processed(DEFAULT_DOMAIN, a.selector(), "cat", "{\"x\":1}");
        s.mark_processed(DEFAULT_DOMAIN, a.selector(), "cat", "{\"x\":2}");
        s.mark_processed(DEFAULT_DOMAIN, b.selector(), "cat", "{\"x\":1}");
        s.mark_processed(DEFAULT_DOMAIN, a.selector(), "ls", "{}");
        let (per_agent, total) = s.processed_stats(DEFAULT_DOMAIN);
        assert_eq!(total, 2);
        assert_eq!(
            per_agent,
            vec![("cat".to_owned(), 2), ("ls".to_owned(), 1)]
        );
    }

    #[test]
    fn unprocessed_listing_is_the_set_difference() {
        let mut s = RamStorage::new();
        let a = root("/raw", b"a");
        let b = root("/raw", b"b");
        s.add(a.clone()).unwrap();
        s.add(b.clone()).unwrap();
        s.mark_processed(DEFAULT_DOMAIN, a.selector(), "cat", "{}");
        let missing = s.list_unprocessed_by_agent("cat", "{}");
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].2, b.selector());
        assert_eq!(missing[0].1, b.uuid());
        // A different config sees everything.
        assert_eq!(s.list_unprocessed_by_agent("cat", "{\"d\":1}").len(), 2);
    }

    #[test]
    fn uuid_label_prefers_the_root() {
        let mut s = RamStorage::new();
        let parent = root("/raw", b"sample");
        let child = parent
            .spawn_descriptor("/text/ascii", Value::text("d"), "strings")
            .unwrap();
        // Insert the child first; the root's label must still win.
        s.add(child.clone()).unwrap();
        s.add(parent.clone()).unwrap();
        let uuids = s.list_uuids(DEFAULT_DOMAIN);
        assert_eq!(uuids.get(&parent.uuid()).map(String::as_str), Some("t"));
    }

    #[test]
    fn value_search_is_prefix_bounded() {
        let mut s = RamStorage::new();
        let a = root("/binary/elf", b"MAGIC-aaa");
        let b = root("/text/ascii", b"MAGIC-bbb");
        s.add(a.clone()).unwrap();
        s.add(b.clone()).unwrap();
        let hits = s.find_by_value(DEFAULT_DOMAIN, "/binary", "MAGIC").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].selector(), a.selector());
    }

    #[test]
    fn agent_state_is_volatile_but_readable() {
        let mut s = RamStorage::new();
        assert!(s.load_agent_state("cat").is_empty());
        s.store_agent_state("cat", b"state").unwrap();
        assert_eq!(s.load_agent_state("cat"), b"state");
        assert!(!s.stores_internal_state());
    }
}

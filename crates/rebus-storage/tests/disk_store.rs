// SPDX-License-Identifier: MIT OR Apache-2.0
//! Disk backend integration: layout, restart rediscovery, corruption
//! handling.

use rebus_core::{DEFAULT_DOMAIN, Descriptor, Value};
use rebus_storage::{DiskStorage, Storage};

fn root(label: &str, prefix: &str, bytes: &[u8]) -> Descriptor {
    Descriptor::new(
        label,
        prefix,
        Value::Bytes(bytes.to_vec()),
        DEFAULT_DOMAIN,
        "inject",
    )
    .unwrap()
}

#[test]
fn layout_matches_the_contract() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStorage::open(dir.path()).unwrap();
    let d = root("hi", "/binary/elf", b"\x7fELF");
    assert!(store.add(d.clone()).unwrap());

    let stem = dir
        .path()
        .join(DEFAULT_DOMAIN)
        .join("binary/elf")
        .join(format!("%{}", d.hash()));
    assert!(stem.with_extension("meta").is_file());
    assert!(stem.with_extension("value").is_file());
    assert!(dir.path().join("diskstorage.sqlite3").is_file());

    // Round trip through the filesystem.
    let meta = store.get_descriptor(DEFAULT_DOMAIN, d.selector()).unwrap();
    assert_eq!(meta.selector(), d.selector());
    assert_eq!(meta.uuid(), d.uuid());
    let value = store.get_value(DEFAULT_DOMAIN, d.selector()).unwrap();
    assert_eq!(value.as_bytes(), Some(&b"\x7fELF"[..]));
}

#[test]
fn duplicate_add_is_refused_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStorage::open(dir.path()).unwrap();
    let d = root("hi", "/raw", b"HELLOWORLD");
    assert!(store.add(d.clone()).unwrap());
    assert!(!store.add(d.clone()).unwrap());
    assert_eq!(store.find(DEFAULT_DOMAIN, "/raw", 0, 0).unwrap().len(), 1);
}

#[test]
fn restart_rediscovers_descriptors_and_marks() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b, c) = (
        root("a", "/raw", b"aaa"),
        root("b", "/raw", b"bbb"),
        root("c", "/raw", b"ccc"),
    );
    {
        let mut store = DiskStorage::open(dir.path()).unwrap();
        for d in [&a, &b, &c] {
            assert!(store.add(d.clone()).unwrap());
        }
        assert!(store.mark_processed(DEFAULT_DOMAIN, a.selector(), "x", "{}"));
        store.store_state().unwrap();
    }

    let store = DiskStorage::open(dir.path()).unwrap();
    assert_eq!(store.find(DEFAULT_DOMAIN, "/raw", 0, 0).unwrap().len(), 3);
    // A's mark survived; only B and C are replayed for (x, {}).
    assert!(!{
        let mut s = DiskStorage::open(dir.path()).unwrap();
        s.mark_processed(DEFAULT_DOMAIN, a.selector(), "x", "{}")
    });
    let missing = store.list_unprocessed_by_agent("x", "{}");
    let mut sels: Vec<&str> = missing.iter().map(|(_, _, s)| s.as_str()).collect();
    sels.sort_unstable();
    let mut expect = vec![b.selector(), c.selector()];
    expect.sort_unstable();
    assert_eq!(sels, expect);
    // Uuids and labels were rebuilt from the tree.
    let uuids = store.list_uuids(DEFAULT_DOMAIN);
    assert_eq!(uuids.len(), 3);
    assert_eq!(uuids.get(&a.uuid()).map(String::as_str), Some("a"));
}

#[test]
fn restart_preserves_ingestion_order() {
    let dir = tempfile::tempdir().unwrap();
    let descriptors: Vec<Descriptor> = (0..5)
        .map(|i| root(&format!("d{i}"), "/raw", format!("payload-{i}").as_bytes()))
        .collect();
    {
        let mut store = DiskStorage::open(dir.path()).unwrap();
        for d in &descriptors {
            store.add(d.clone()).unwrap();
        }
        store.store_state().unwrap();
    }
    let store = DiskStorage::open(dir.path()).unwrap();
    let found = store.find(DEFAULT_DOMAIN, "/raw", 0, 0).unwrap();
    let expected: Vec<String> = descriptors
        .iter()
        .rev()
        .map(|d| d.selector().to_owned())
        .collect();
    assert_eq!(found, expected);
}

#[test]
fn lineage_and_versions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let parent = root("p", "/archive/zip", b"zip");
    let child = parent
        .spawn_descriptor("/binary/elf", Value::Bytes(b"elf".to_vec()), "unzip")
        .unwrap();
    let v1 = parent
        .new_version(Value::Bytes(b"zip2".to_vec()), "inject")
        .unwrap();
    {
        let mut store = DiskStorage::open(dir.path()).unwrap();
        for d in [&parent, &child, &v1] {
            store.add(d.clone()).unwrap();
        }
        store.store_state().unwrap();
    }
    let store = DiskStorage::open(dir.path()).unwrap();
    let children = store.get_children(DEFAULT_DOMAIN, parent.selector(), true);
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].selector(), child.selector());
    let latest = store
        .get_descriptor(DEFAULT_DOMAIN, "/archive/zip/~-1")
        .unwrap();
    assert_eq!(latest.selector(), v1.selector());
}

#[test]
fn orphan_value_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = DiskStorage::open(dir.path()).unwrap();
        store.add(root("a", "/raw", b"aaa")).unwrap();
    }
    // Remove a .meta, leaving its .value orphaned.
    let meta = walkdir::WalkDir::new(dir.path())
        .into_iter()
        .filter_map(Result::ok)
        .find(|e| e.path().extension().is_some_and(|x| x == "meta"))
        .unwrap();
    std::fs::remove_file(meta.path()).unwrap();
    assert!(DiskStorage::open(dir.path()).is_err());
}

#[test]
fn foreign_files_fail_startup() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("default/raw")).unwrap();
    std::fs::write(dir.path().join("default/raw/notes.txt"), b"hello").unwrap();
    assert!(DiskStorage::open(dir.path()).is_err());
}

#[test]
fn undecodable_meta_is_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let good = root("good", "/raw", b"good");
    {
        let mut store = DiskStorage::open(dir.path()).unwrap();
        store.add(good.clone()).unwrap();
        store.store_state().unwrap();
    }
    // Corrupt a fresh pair: garbage .meta with a matching .value sibling.
    let bogus_stem = dir
        .path()
        .join("default/raw")
        .join(format!("%{}", "e".repeat(64)));
    std::fs::write(bogus_stem.with_extension("meta"), b"\xde\xad").unwrap();
    std::fs::write(bogus_stem.with_extension("value"), b"\xbe\xef").unwrap();

    let store = DiskStorage::open(dir.path()).unwrap();
    let found = store.find(DEFAULT_DOMAIN, "/raw", 0, 0).unwrap();
    assert_eq!(found, vec![good.selector().to_owned()]);
}

#[test]
fn mismatched_domain_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let d = root("a", "/raw", b"aaa");
    {
        let mut store = DiskStorage::open(dir.path()).unwrap();
        store.add(d.clone()).unwrap();
    }
    // Relocate the whole domain directory; filenames no longer match the
    // serialized metadata.
    std::fs::rename(dir.path().join("default"), dir.path().join("moved")).unwrap();
    assert!(DiskStorage::open(dir.path()).is_err());
}

#[test]
fn agent_state_round_trips_through_files() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = DiskStorage::open(dir.path()).unwrap();
        assert!(store.stores_internal_state());
        store.store_agent_state("unarchive", b"depth=3").unwrap();
    }
    let store = DiskStorage::open(dir.path()).unwrap();
    assert_eq!(store.load_agent_state("unarchive"), b"depth=3");
    assert!(store.load_agent_state("unknown").is_empty());
    assert!(
        dir.path()
            .join("agent_intstate/unarchive.intstate")
            .is_file()
    );
}

#[test]
fn missing_base_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let gone = dir.path().join("never-created");
    assert!(DiskStorage::open(&gone).is_err());
}

#[test]
fn value_search_reads_payloads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DiskStorage::open(dir.path()).unwrap();
    let a = root("a", "/binary/pe", b"MZ-needle-aaa");
    let b = root("b", "/binary/pe", b"MZ-other");
    store.add(a.clone()).unwrap();
    store.add(b.clone()).unwrap();
    let hits = store
        .find_by_value(DEFAULT_DOMAIN, "/binary", "MZ-needle")
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].selector(), a.selector());
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! On-disk descriptor store.
//!
//! Layout, relative to the base path:
//!
//! ```text
//! <domain>/<selector path>/%<hash>.meta
//! <domain>/<selector path>/%<hash>.value
//! agent_intstate/<agent-name>.intstate
//! diskstorage.sqlite3
//! ```
//!
//! Metadata and payload are serialized separately so listings never load
//! payloads. On startup the store walks the tree to rebuild its indices,
//! cross-checking every filename against the serialized metadata, and
//! restores processed marks from the sqlite index. A checkpoint thread
//! flushes dirty selector rows every five seconds.

use crate::index::MetadataDb;
use crate::{NameConfig, Storage, StorageError, anchored};
use rebus_core::{Descriptor, DescriptorMeta, Value, selector};
use rebus_proto::Wire;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Interval between checkpoint flushes.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);
/// Sleep granularity of the checkpoint thread, so shutdown stays prompt.
const CHECKPOINT_TICK: Duration = Duration::from_millis(250);

const INTSTATE_DIR: &str = "agent_intstate";
const INDEX_FILE: &str = "diskstorage.sqlite3";

#[derive(Default)]
struct DomainIndex {
    /// Selectors in ingestion order, oldest first.
    order: Vec<String>,
    known: HashSet<String>,
    /// selector prefix → version → full selector.
    versions: HashMap<String, BTreeMap<u32, String>>,
    /// precursor selector → derived selectors.
    edges: HashMap<String, BTreeSet<String>>,
    processed: HashMap<String, BTreeSet<NameConfig>>,
    processable: HashMap<String, BTreeSet<NameConfig>>,
    uuids: HashMap<Uuid, BTreeSet<String>>,
    labels: HashMap<Uuid, String>,
    uuid_of: HashMap<String, Uuid>,
}

#[derive(Default)]
struct DiskIndex {
    domains: HashMap<String, DomainIndex>,
    /// Selector rows awaiting a sqlite flush.
    dirty_selectors: Vec<(String, String)>,
}

impl DiskIndex {
    /// Record a descriptor's metadata in every in-memory index.
    fn register_meta(&mut self, meta: &DescriptorMeta) {
        let domain = self.domains.entry(meta.domain().to_owned()).or_default();
        let sel = meta.selector().to_owned();
        if !domain.known.insert(sel.clone()) {
            return;
        }
        domain.order.push(sel.clone());
        domain
            .versions
            .entry(selector::prefix_of(&sel).to_owned())
            .or_default()
            .insert(meta.version(), sel.clone());
        for precursor in meta.precursors() {
            domain
                .edges
                .entry(precursor.clone())
                .or_default()
                .insert(sel.clone());
        }
        domain.processed.entry(sel.clone()).or_default();
        domain.uuids.entry(meta.uuid()).or_default().insert(sel.clone());
        domain.uuid_of.insert(sel.clone(), meta.uuid());
        // Prefer the label of a precursor-less descriptor.
        if !domain.labels.contains_key(&meta.uuid()) || meta.precursors().is_empty() {
            domain.labels.insert(meta.uuid(), meta.label().to_owned());
        }
    }

    fn resolve(&self, domain: &str, sel: &str) -> Option<String> {
        let dom = self.domains.get(domain)?;
        if let Some((prefix, n)) = selector::version_ref(sel) {
            let versions = dom.versions.get(prefix)?;
            let version = if n < 0 {
                let max = i64::from(*versions.keys().next_back()?);
                u32::try_from(max + n + 1).ok()?
            } else {
                u32::try_from(n).ok()?
            };
            versions.get(&version).cloned()
        } else {
            dom.known.contains(sel).then(|| sel.to_owned())
        }
    }
}

/// Disk-backed [`Storage`] implementation.
pub struct DiskStorage {
    base: PathBuf,
    wire: Wire,
    index: Arc<Mutex<DiskIndex>>,
    db: Arc<MetadataDb>,
    stop: Arc<AtomicBool>,
    checkpoint: Option<std::thread::JoinHandle<()>>,
}

impl DiskStorage {
    /// Open a store rooted at `base`.
    ///
    /// The directory must exist. Walks the tree to rediscover descriptors,
    /// restores processed marks from the sqlite index, and fails on any
    /// inconsistency between filenames and serialized metadata.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base = base.into();
        if !base.is_dir() {
            return Err(StorageError::Corrupt(format!(
                "storage directory {} does not exist",
                base.display()
            )));
        }
        let intstate = base.join(INTSTATE_DIR);
        std::fs::create_dir_all(&intstate).map_err(|source| StorageError::Io {
            path: intstate,
            source,
        })?;

        let wire = Wire::Bin;
        let db = Arc::new(MetadataDb::open(&base.join(INDEX_FILE))?);
        let mut index = DiskIndex::default();
        discover(&base, wire, &db, &mut index)?;
        let index = Arc::new(Mutex::new(index));

        let stop = Arc::new(AtomicBool::new(false));
        let checkpoint = {
            let index = Arc::clone(&index);
            let db = Arc::clone(&db);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("diskstorage-checkpoint".into())
                .spawn(move || checkpoint_loop(&index, &db, &stop))
                .map_err(|source| StorageError::Io {
                    path: PathBuf::from("<checkpoint thread>"),
                    source,
                })?
        };

        Ok(DiskStorage {
            base,
            wire,
            index,
            db,
            stop,
            checkpoint: Some(checkpoint),
        })
    }

    /// Filesystem path for a selector, without extension.
    ///
    /// Both components are validated before touching the filesystem, so a
    /// hostile selector can never escape the base directory.
    fn path_for(&self, domain: &str, sel: &str) -> Option<PathBuf> {
        selector::validate_domain(domain).ok()?;
        selector::validate_selector(sel).ok()?;
        Some(self.base.join(domain).join(&sel[1..]))
    }

    fn read_meta(&self, domain: &str, sel: &str) -> Option<DescriptorMeta> {
        let path = self.path_for(domain, sel)?.with_extension("meta");
        let bytes = std::fs::read(&path).ok()?;
        match self.wire.decode(&bytes) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable descriptor metadata");
                None
            }
        }
    }

    fn read_value(&self, domain: &str, sel: &str) -> Option<Value> {
        let path = self.path_for(domain, sel)?.with_extension("value");
        let bytes = std::fs::read(&path).ok()?;
        match self.wire.decode(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable descriptor value");
                None
            }
        }
    }

    fn intstate_path(&self, agent_name: &str) -> PathBuf {
        self.base
            .join(INTSTATE_DIR)
            .join(format!("{agent_name}.intstate"))
    }

    fn flush(&self) -> Result<(), StorageError> {
        flush_dirty(&self.index, &self.db)
    }
}

impl Drop for DiskStorage {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.checkpoint.take() {
            let _ = handle.join();
        }
        if let Err(err) = self.flush() {
            warn!(error = %err, "final index flush failed");
        }
    }
}

fn checkpoint_loop(index: &Mutex<DiskIndex>, db: &MetadataDb, stop: &AtomicBool) {
    let ticks_per_flush =
        (CHECKPOINT_INTERVAL.as_millis() / CHECKPOINT_TICK.as_millis()).max(1) as u32;
    let mut tick = 0u32;
    loop {
        std::thread::sleep(CHECKPOINT_TICK);
        if stop.load(Ordering::Relaxed) {
            return;
        }
        tick += 1;
        if tick >= ticks_per_flush {
            tick = 0;
            if let Err(err) = flush_dirty_inner(index, db) {
                warn!(error = %err, "checkpoint flush failed");
            }
        }
    }
}

fn flush_dirty(index: &Arc<Mutex<DiskIndex>>, db: &Arc<MetadataDb>) -> Result<(), StorageError> {
    flush_dirty_inner(index, db)
}

fn flush_dirty_inner(index: &Mutex<DiskIndex>, db: &MetadataDb) -> Result<(), StorageError> {
    let pending = {
        let mut guard = index.lock().expect("disk index lock poisoned");
        std::mem::take(&mut guard.dirty_selectors)
    };
    if pending.is_empty() {
        return Ok(());
    }
    debug!(rows = pending.len(), "flushing selector rows");
    if let Err(err) = db.add_selectors(&pending) {
        // Put the rows back so the next flush retries them.
        let mut guard = index.lock().expect("disk index lock poisoned");
        let mut restored = pending;
        restored.extend(std::mem::take(&mut guard.dirty_selectors));
        guard.dirty_selectors = restored;
        return Err(err);
    }
    Ok(())
}

/// Walk the tree and rebuild every index.
fn discover(
    base: &Path,
    wire: Wire,
    db: &MetadataDb,
    index: &mut DiskIndex,
) -> Result<(), StorageError> {
    let mut discovered: Vec<DescriptorMeta> = Vec::new();
    for entry in walkdir::WalkDir::new(base).min_depth(1) {
        let entry = entry.map_err(|err| {
            StorageError::Corrupt(format!("walk failed under {}: {err}", base.display()))
        })?;
        let path = entry.path();
        let relative = path.strip_prefix(base).unwrap_or(path);
        if relative.starts_with(INTSTATE_DIR) {
            continue;
        }
        if entry.file_type().is_dir() {
            continue;
        }
        if !entry.file_type().is_file() {
            return Err(StorageError::Corrupt(format!(
                "{} is neither a regular file nor a directory",
                path.display()
            )));
        }
        // The sqlite index and its transient journal/WAL siblings live at
        // the root and are not descriptor files.
        if relative.components().count() == 1
            && relative.to_string_lossy().starts_with(INDEX_FILE)
        {
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("value") => {
                if !path.with_extension("meta").is_file() {
                    return Err(StorageError::Corrupt(format!(
                        "missing metadata for {}",
                        path.display()
                    )));
                }
            }
            Some("meta") => {
                if !path.with_extension("value").is_file() {
                    return Err(StorageError::Corrupt(format!(
                        "missing value for {}",
                        path.display()
                    )));
                }
                let bytes = std::fs::read(path).map_err(|source| StorageError::Io {
                    path: path.to_owned(),
                    source,
                })?;
                let meta: DescriptorMeta = match wire.decode(&bytes) {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err,
                              "skipping undecodable descriptor");
                        continue;
                    }
                };
                let file_domain = relative
                    .components()
                    .next()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .unwrap_or_default();
                if file_domain != meta.domain() {
                    return Err(StorageError::Corrupt(format!(
                        "filename domain {file_domain:?} does not match metadata domain {:?} \
                         for {}",
                        meta.domain(),
                        path.display()
                    )));
                }
                let file_hash = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix('%'))
                    .unwrap_or_default();
                if file_hash != meta.hash() {
                    return Err(StorageError::Corrupt(format!(
                        "filename hash does not match metadata hash for {}",
                        path.display()
                    )));
                }
                discovered.push(meta);
            }
            _ => {
                return Err(StorageError::Corrupt(format!(
                    "{} has an invalid extension (must be .meta or .value)",
                    path.display()
                )));
            }
        }
    }

    // Ingestion order: the sqlite selector table is authoritative; anything
    // discovered on disk but missing from it is appended and queued for the
    // next flush.
    let mut by_selector: HashMap<(String, String), DescriptorMeta> = discovered
        .into_iter()
        .map(|m| ((m.domain().to_owned(), m.selector().to_owned()), m))
        .collect();
    for (domain, sel) in db.load_selectors()? {
        if let Some(meta) = by_selector.remove(&(domain, sel)) {
            index.register_meta(&meta);
        }
    }
    let mut remaining: Vec<DescriptorMeta> = by_selector.into_values().collect();
    remaining.sort_by(|a, b| a.selector().cmp(b.selector()));
    for meta in remaining {
        index.register_meta(&meta);
        index
            .dirty_selectors
            .push((meta.domain().to_owned(), meta.selector().to_owned()));
    }

    for (domain, sel, pair) in db.load_processed()? {
        let dom = index.domains.entry(domain).or_default();
        dom.processed.entry(sel).or_default().insert(pair);
    }
    Ok(())
}

impl Storage for DiskStorage {
    fn backend_name(&self) -> &'static str {
        "diskstorage"
    }

    fn stores_internal_state(&self) -> bool {
        true
    }

    fn add(&mut self, descriptor: Descriptor) -> Result<bool, StorageError> {
        let domain = descriptor.domain().to_owned();
        let sel = descriptor.selector().to_owned();
        let Some(stem) = self.path_for(&domain, &sel) else {
            return Err(StorageError::Corrupt(format!(
                "refusing to store out-of-grammar selector {sel:?}"
            )));
        };
        let meta_path = stem.with_extension("meta");
        if meta_path.is_file() {
            return Ok(false);
        }
        if let Some(parent) = stem.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_owned(),
                source,
            })?;
        }
        let (meta, value) = descriptor.into_parts();
        let meta_bytes = self.wire.encode(&meta)?;
        let value_bytes = self.wire.encode(&value)?;
        std::fs::write(&meta_path, meta_bytes).map_err(|source| StorageError::Io {
            path: meta_path.clone(),
            source,
        })?;
        let value_path = stem.with_extension("value");
        std::fs::write(&value_path, value_bytes).map_err(|source| StorageError::Io {
            path: value_path,
            source,
        })?;

        let mut index = self.index.lock().expect("disk index lock poisoned");
        index.register_meta(&meta);
        index.dirty_selectors.push((domain, sel));
        Ok(true)
    }

    fn get_descriptor(&self, domain: &str, sel: &str) -> Option<DescriptorMeta> {
        let resolved = {
            let index = self.index.lock().expect("disk index lock poisoned");
            index.resolve(domain, sel)?
        };
        self.read_meta(domain, &resolved)
    }

    fn get_value(&self, domain: &str, sel: &str) -> Option<Value> {
        let resolved = {
            let index = self.index.lock().expect("disk index lock poisoned");
            index.resolve(domain, sel)?
        };
        self.read_value(domain, &resolved)
    }

    fn find(
        &self,
        domain: &str,
        selector_regex: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<String>, StorageError> {
        let regex = Regex::new(&anchored(selector_regex))?;
        let index = self.index.lock().expect("disk index lock poisoned");
        let Some(dom) = index.domains.get(domain) else {
            return Ok(Vec::new());
        };
        Ok(dom
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
        let selected: Vec<String> = {
            let index = self.index.lock().expect("disk index lock poisoned");
            let Some(dom) = index.domains.get(domain) else {
                return Vec::new();
            };
            dom.order
                .iter()
                .rev()
                .filter(|sel| sel.starts_with(prefix))
                .skip(offset)
                .take(if limit == 0 { usize::MAX } else { limit })
                .cloned()
                .collect()
        };
        selected
            .iter()
            .filter_map(|sel| self.read_meta(domain, sel))
            .collect()
    }

    fn find_by_uuid(&self, domain: &str, uuid: Uuid) -> Vec<DescriptorMeta> {
        let selected: Vec<String> = {
            let index = self.index.lock().expect("disk index lock poisoned");
            index
                .domains
                .get(domain)
                .and_then(|dom| dom.uuids.get(&uuid))
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        selected
            .iter()
            .filter_map(|sel| self.read_meta(domain, sel))
            .collect()
    }

    fn find_by_value(
        &self,
        domain: &str,
        prefix: &str,
        value_regex: &str,
    ) -> Result<Vec<DescriptorMeta>, StorageError> {
        let regex = Regex::new(&anchored(value_regex))?;
        let candidates: Vec<String> = {
            let index = self.index.lock().expect("disk index lock poisoned");
            let Some(dom) = index.domains.get(domain) else {
                return Ok(Vec::new());
            };
            dom.order
                .iter()
                .filter(|sel| sel.starts_with(prefix))
                .cloned()
                .collect()
        };
        let mut result = Vec::new();
        for sel in candidates {
            let Some(value) = self.read_value(domain, &sel) else {
                continue;
            };
            if regex.is_match(&value.search_text()) {
                if let Some(meta) = self.read_meta(domain, &sel) {
                    result.push(meta);
                }
            }
        }
        Ok(result)
    }

    fn list_uuids(&self, domain: &str) -> BTreeMap<Uuid, String> {
        let index = self.index.lock().expect("disk index lock poisoned");
        index
            .domains
            .get(domain)
            .map(|dom| {
                dom.labels
                    .iter()
                    .map(|(uuid, label)| (*uuid, label.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_children(&self, domain: &str, sel: &str, recurse: bool) -> Vec<DescriptorMeta> {
        let selected: Vec<String> = {
            let index = self.index.lock().expect("disk index lock poisoned");
            let Some(dom) = index.domains.get(domain) else {
                return Vec::new();
            };
            if !dom.known.contains(sel) {
                return Vec::new();
            }
            let mut seen: HashSet<String> = HashSet::new();
            let mut queue: Vec<&str> = vec![sel];
            let mut out = Vec::new();
            while let Some(parent) = queue.pop() {
                let Some(children) = dom.edges.get(parent) else {
                    continue;
                };
                for child in children {
                    if seen.insert(child.clone()) {
                        out.push(child.clone());
                        if recurse {
                            queue.push(child);
                        }
                    }
                }
            }
            out
        };
        selected
            .iter()
            .filter_map(|s| self.read_meta(domain, s))
            .collect()
    }

    fn mark_processed(&mut self, domain: &str, sel: &str, agent_name: &str, config: &str) -> bool {
        let newly = {
            let mut index = self.index.lock().expect("disk index lock poisoned");
            let Some(dom) = index.domains.get_mut(domain) else {
                return false;
            };
            let Some(processed) = dom.processed.get_mut(sel) else {
                return false;
            };
            let key = (agent_name.to_owned(), config.to_owned());
            let mut newly = processed.insert(key.clone());
            if let Some(processable) = dom.processable.get_mut(sel) {
                if processable.remove(&key) {
                    newly = false;
                }
            }
            newly
        };
        // Durability is write-through; the in-memory index stays
        // authoritative for newness.
        if let Err(err) = self.db.add_processed(domain, sel, agent_name, config) {
            warn!(error = %err, domain, selector = sel, "processed mark not persisted");
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
        let mut index = self.index.lock().expect("disk index lock poisoned");
        let Some(dom) = index.domains.get_mut(domain) else {
            return false;
        };
        if !dom.known.contains(sel) {
            return false;
        }
        let key = (agent_name.to_owned(), config.to_owned());
        let newly = dom
            .processable
            .entry(sel.to_owned())
            .or_default()
            .insert(key.clone());
        newly && !dom.processed.get(sel).is_some_and(|p| p.contains(&key))
    }

    fn get_processed(&self, domain: &str, sel: &str) -> Vec<NameConfig> {
        let index = self.index.lock().expect("disk index lock poisoned");
        index
            .domains
            .get(domain)
            .and_then(|dom| dom.processed.get(sel))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn get_processable(&self, domain: &str, sel: &str) -> Vec<NameConfig> {
        let index = self.index.lock().expect("disk index lock poisoned");
        index
            .domains
            .get(domain)
            .and_then(|dom| dom.processable.get(sel))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn processed_stats(&self, domain: &str) -> (Vec<(String, u64)>, u64) {
        let index = self.index.lock().expect("disk index lock poisoned");
        let Some(dom) = index.domains.get(domain) else {
            return (Vec::new(), 0);
        };
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for pairs in dom.processed.values() {
            let names: BTreeSet<&str> = pairs.iter().map(|(name, _)| name.as_str()).collect();
            for name in names {
                *counts.entry(name).or_default() += 1;
            }
        }
        (
            counts.into_iter().map(|(n, c)| (n.to_owned(), c)).collect(),
            dom.order.len() as u64,
        )
    }

    fn store_agent_state(&mut self, agent_name: &str, state: &[u8]) -> Result<(), StorageError> {
        let path = self.intstate_path(agent_name);
        std::fs::write(&path, state).map_err(|source| StorageError::Io { path, source })
    }

    fn load_agent_state(&self, agent_name: &str) -> Vec<u8> {
        std::fs::read(self.intstate_path(agent_name)).unwrap_or_default()
    }

    fn store_state(&mut self) -> Result<(), StorageError> {
        self.flush()
    }

    fn list_unprocessed_by_agent(
        &self,
        agent_name: &str,
        config: &str,
    ) -> Vec<(String, Uuid, String)> {
        let key = (agent_name.to_owned(), config.to_owned());
        let index = self.index.lock().expect("disk index lock poisoned");
        let mut result = Vec::new();
        for (domain, dom) in &index.domains {
            for sel in &dom.order {
                let done = dom.processed.get(sel).is_some_and(|p| p.contains(&key));
                if !done {
                    if let Some(uuid) = dom.uuid_of.get(sel) {
                        result.push((domain.clone(), *uuid, sel.clone()));
                    }
                }
            }
        }
        result
    }
}

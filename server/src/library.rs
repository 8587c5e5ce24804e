//! Filesystem-backed probe library.
//!
//! Maintains metadata indices over every probe found under a configured root
//! directory; directory layout is authoritative for categories. Initial load
//! runs in a background thread and publishes the whole index under one write
//! lock; consumers querying earlier see a partial view (`is_loaded`).

use crate::error::{Error, Result};
use crate::parser;
use crate::types::*;
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Metadata index: primary map plus category/severity buckets. The category
/// map also carries empty buckets so pre-declared namespaces survive.
#[derive(Default)]
struct Index {
    by_id: HashMap<String, Probe>,
    by_category: HashMap<String, Vec<String>>,
    by_severity: HashMap<Severity, Vec<String>>,
}

impl Index {
    fn insert(&mut self, probe: Probe) {
        self.remove(&probe.id);
        self.by_category.entry(probe.category.clone()).or_default().push(probe.id.clone());
        self.by_severity.entry(probe.severity).or_default().push(probe.id.clone());
        self.by_id.insert(probe.id.clone(), probe);
    }

    fn remove(&mut self, id: &str) -> Option<Probe> {
        let probe = self.by_id.remove(id)?;
        if let Some(bucket) = self.by_category.get_mut(&probe.category) {
            bucket.retain(|i| i != id);
        }
        if let Some(bucket) = self.by_severity.get_mut(&probe.severity) {
            bucket.retain(|i| i != id);
        }
        Some(probe)
    }
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

pub struct ProbeLibrary {
    root: RwLock<PathBuf>,
    index: RwLock<Index>,
    loaded: AtomicBool,
}

impl ProbeLibrary {
    /// Open a library rooted at `root` and start the background initial load.
    /// The library is usable immediately; `is_loaded` flips once the walk
    /// has been published.
    pub fn open(root: impl Into<PathBuf>) -> Arc<Self> {
        let lib = Arc::new(Self::new(root.into()));
        let bg = Arc::clone(&lib);
        std::thread::spawn(move || bg.rescan_blocking());
        lib
    }

    /// Open and load synchronously. Used by the CLI one-shot commands and
    /// the test harness.
    pub fn open_blocking(root: impl Into<PathBuf>) -> Arc<Self> {
        let lib = Arc::new(Self::new(root.into()));
        lib.rescan_blocking();
        lib
    }

    fn new(root: PathBuf) -> Self {
        if let Err(e) = fs::create_dir_all(&root) {
            warn!(root = %root.display(), error = %e, "Could not create library root");
        }
        Self {
            root: RwLock::new(root),
            index: RwLock::new(Index::default()),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.root.read().unwrap().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Point the library at a new root and re-run the load in the background.
    pub fn reload(self: &Arc<Self>, new_root: Option<PathBuf>) {
        if let Some(dir) = new_root {
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!(root = %dir.display(), error = %e, "Could not create library root");
            }
            *self.root.write().unwrap() = dir;
        }
        self.loaded.store(false, Ordering::Release);
        let bg = Arc::clone(self);
        std::thread::spawn(move || bg.rescan_blocking());
    }

    // -----------------------------------------------------------------------
    // Initial / full scan
    // -----------------------------------------------------------------------

    /// Walk the root, parse every `.yaml`/`.yml` file's metadata, and publish
    /// a fresh index. Unparseable probes are logged and skipped — they are
    /// never indexed.
    pub fn rescan_blocking(&self) {
        let root = self.root();
        let start = Instant::now();

        let mut files: Vec<PathBuf> = Vec::new();
        let mut dirs: Vec<PathBuf> = Vec::new();
        for entry in WalkBuilder::new(&root)
            .hidden(true)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .build()
            .flatten()
        {
            let path = entry.path();
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                if path != root {
                    dirs.push(path.to_path_buf());
                }
            } else if is_probe_file(path) {
                files.push(path.to_path_buf());
            }
        }
        files.sort();

        let parsed: Vec<Probe> = files
            .par_iter()
            .filter_map(|path| match load_metadata(&root, path) {
                Ok(probe) => Some(probe),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unparseable probe");
                    None
                }
            })
            .collect();

        let mut index = Index::default();
        let mut seen: HashSet<String> = HashSet::new();
        for probe in parsed {
            if !seen.insert(probe.id.clone()) {
                warn!(id = probe.id.as_str(), file = %probe.file_path.display(),
                      "Duplicate probe id on disk, keeping first");
                continue;
            }
            index.insert(probe);
        }

        // Empty directories still declare a category namespace.
        for dir in dirs {
            if let Some(cat) = category_from_dir(&root, &dir) {
                index.by_category.entry(cat).or_default();
            }
        }

        let count = index.by_id.len();
        let categories = index.by_category.len();
        *self.index.write().unwrap() = index;
        self.loaded.store(true, Ordering::Release);

        info!(
            probes = count,
            categories = categories,
            time_ms = start.elapsed().as_millis() as u64,
            "Probe library loaded"
        );
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Snapshot of all indexed probe metadata, sorted by id.
    pub fn get_all(&self) -> Vec<Probe> {
        let idx = self.index.read().unwrap();
        let mut all: Vec<Probe> = idx.by_id.values().cloned().collect();
        drop(idx);
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Zero-indexed page of the sorted metadata snapshot plus the total count.
    pub fn get_paginated(&self, page: usize, size: usize) -> (Vec<Probe>, usize) {
        let all = self.get_all();
        let total = all.len();
        if size == 0 {
            return (Vec::new(), total);
        }
        let start = page.saturating_mul(size).min(total);
        let end = start.saturating_add(size).min(total);
        (all[start..end].to_vec(), total)
    }

    /// Metadata-only lookup; no disk access. Used by the scanner to resolve
    /// probe ids at submit time.
    pub fn get_meta(&self, id: &str) -> Option<Probe> {
        self.index.read().unwrap().by_id.get(id).cloned()
    }

    /// Fetch a probe with `content` and `requests` populated from disk.
    pub fn get_by_id(&self, id: &str) -> Result<Probe> {
        let mut probe = {
            let idx = self.index.read().unwrap();
            idx.by_id.get(id).cloned().ok_or_else(|| Error::NotFound(format!("probe `{id}`")))?
        };
        let text = fs::read_to_string(&probe.file_path)?;
        let parsed = parser::parse(&text)?;
        probe.requests = parsed.requests;
        probe.content = Some(text);
        Ok(probe)
    }

    pub fn get_by_category(&self, category: &str) -> Vec<Probe> {
        let key = normalize_category(category);
        let idx = self.index.read().unwrap();
        let Some(bucket) = idx.by_category.get(key) else {
            return Vec::new();
        };
        let mut probes: Vec<Probe> =
            bucket.iter().filter_map(|id| idx.by_id.get(id).cloned()).collect();
        drop(idx);
        probes.sort_by(|a, b| a.id.cmp(&b.id));
        probes
    }

    pub fn get_by_severity(&self, severity: Severity) -> Vec<Probe> {
        let idx = self.index.read().unwrap();
        let Some(bucket) = idx.by_severity.get(&severity) else {
            return Vec::new();
        };
        let mut probes: Vec<Probe> =
            bucket.iter().filter_map(|id| idx.by_id.get(id).cloned()).collect();
        drop(idx);
        probes.sort_by(|a, b| a.id.cmp(&b.id));
        probes
    }

    /// Case-insensitive metadata search with optional category/severity filters.
    pub fn search(
        &self,
        query: &str,
        category: Option<&str>,
        severity: Option<Severity>,
    ) -> Vec<Probe> {
        let needle = query.trim().to_lowercase();
        let category = category.map(normalize_category);
        let idx = self.index.read().unwrap();
        let mut hits: Vec<Probe> = idx
            .by_id
            .values()
            .filter(|p| {
                if let Some(cat) = category {
                    if p.category != cat {
                        return false;
                    }
                }
                if let Some(sev) = severity {
                    if p.severity != sev {
                        return false;
                    }
                }
                if needle.is_empty() {
                    return true;
                }
                p.id.to_lowercase().contains(&needle)
                    || p.name.to_lowercase().contains(&needle)
                    || p.description.to_lowercase().contains(&needle)
                    || p.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        drop(idx);
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }

    /// Category rows with probe counts, uncategorized first.
    pub fn list_with_counts(&self) -> Vec<CategoryCount> {
        let idx = self.index.read().unwrap();
        let mut rows: Vec<CategoryCount> = idx
            .by_category
            .iter()
            .filter(|(path, _)| !path.is_empty())
            .map(|(path, ids)| CategoryCount { path: path.clone(), count: ids.len() })
            .collect();
        let uncategorized =
            idx.by_category.get("").map(|ids| ids.len()).unwrap_or(0);
        drop(idx);
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        rows.insert(0, CategoryCount { path: UNCATEGORIZED.to_string(), count: uncategorized });
        rows
    }

    /// Counts by category and by severity for the dashboard.
    pub fn stats(&self) -> LibraryStats {
        let idx = self.index.read().unwrap();
        let mut by_category = std::collections::BTreeMap::new();
        for (path, ids) in &idx.by_category {
            if ids.is_empty() && path.is_empty() {
                continue;
            }
            let name =
                if path.is_empty() { UNCATEGORIZED.to_string() } else { path.clone() };
            by_category.insert(name, ids.len());
        }
        let mut by_severity = std::collections::BTreeMap::new();
        for (sev, ids) in &idx.by_severity {
            if !ids.is_empty() {
                by_severity.insert(sev.as_str().to_string(), ids.len());
            }
        }
        LibraryStats { total: idx.by_id.len(), by_category, by_severity }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Write a probe to disk and index it. The target path derives from the
    /// `category` field (existing `file_path` is kept only while it still
    /// agrees with the category). The write is write-then-rename; the index
    /// is only touched after the filesystem succeeds.
    pub fn save(&self, probe: &mut Probe) -> Result<()> {
        validate_category(&probe.category)?;
        let root = self.root();

        let content = match &probe.content {
            Some(text) => text.clone(),
            None => parser::serialize(probe)?,
        };

        let target = if !probe.file_path.as_os_str().is_empty()
            && derive_category(&root, &probe.file_path).as_deref() == Some(probe.category.as_str())
        {
            probe.file_path.clone()
        } else {
            let mut dir = root.clone();
            if !probe.category.is_empty() {
                dir = dir.join(&probe.category);
            }
            dir.join(format!("{}.yaml", probe.id))
        };

        let mut idx = self.index.write().unwrap();

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&target, content.as_bytes())?;

        // A category change leaves the old file behind; drop it.
        let previous = idx.by_id.get(&probe.id).map(|p| p.file_path.clone());
        if let Some(old_path) = previous {
            if old_path != target {
                if let Err(e) = fs::remove_file(&old_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(file = %old_path.display(), error = %e,
                              "Could not remove relocated probe file");
                    }
                }
            }
        }

        probe.file_path = target;
        probe.updated_at = Utc::now();

        let mut meta = probe.clone();
        meta.content = None;
        meta.requests = Vec::new();
        idx.insert(meta);
        debug!(id = probe.id.as_str(), file = %probe.file_path.display(), "Probe saved");
        Ok(())
    }

    /// Unlink a probe's file and drop it from every index.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut idx = self.index.write().unwrap();
        let probe =
            idx.by_id.get(id).ok_or_else(|| Error::NotFound(format!("probe `{id}`")))?;
        match fs::remove_file(&probe.file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        idx.remove(id);
        debug!(id = id, "Probe deleted");
        Ok(())
    }

    /// Create an empty category directory and register its bucket.
    pub fn create_category(&self, path: &str) -> Result<()> {
        if path.is_empty() || path == UNCATEGORIZED {
            return Err(Error::InvalidArgument("category name is reserved".into()));
        }
        validate_category(path)?;
        let root = self.root();
        let dir = root.join(path);

        let mut idx = self.index.write().unwrap();
        if idx.by_category.contains_key(path) || dir.exists() {
            return Err(Error::Conflict(format!("category `{path}` already exists")));
        }
        fs::create_dir_all(&dir)?;
        idx.by_category.insert(path.to_string(), Vec::new());
        Ok(())
    }

    /// Remove an empty category. Refuses the reserved name and any category
    /// that still holds probes (directly or in nested categories).
    pub fn delete_category(&self, path: &str) -> Result<()> {
        if path.is_empty() || path == UNCATEGORIZED {
            return Err(Error::InvalidArgument("category name is reserved".into()));
        }
        let root = self.root();
        let dir = root.join(path);

        let mut idx = self.index.write().unwrap();
        let known = idx.by_category.contains_key(path) || dir.exists();
        if !known {
            return Err(Error::NotFound(format!("category `{path}`")));
        }
        let prefix = format!("{path}/");
        let occupied = idx
            .by_category
            .iter()
            .any(|(k, ids)| (k == path || k.starts_with(&prefix)) && !ids.is_empty());
        if occupied {
            return Err(Error::Conflict(format!("category `{path}` is not empty")));
        }
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        idx.by_category.retain(|k, _| k != path && !k.starts_with(&prefix));
        Ok(())
    }

    /// Rename a category directory and rewrite every affected probe's
    /// `category` and `file_path` in place. Nested categories move with it.
    pub fn rename_category(&self, old: &str, new: &str) -> Result<()> {
        if old.is_empty() || old == UNCATEGORIZED {
            return Err(Error::InvalidArgument("category name is reserved".into()));
        }
        validate_category(new)?;
        if new.is_empty() {
            return Err(Error::InvalidArgument("new category name is empty".into()));
        }
        if old == new {
            return Ok(());
        }
        let root = self.root();
        let old_dir = root.join(old);
        let new_dir = root.join(new);

        let mut idx = self.index.write().unwrap();
        if !idx.by_category.contains_key(old) && !old_dir.exists() {
            return Err(Error::NotFound(format!("category `{old}`")));
        }
        if idx.by_category.contains_key(new) || new_dir.exists() {
            return Err(Error::Conflict(format!("category `{new}` already exists")));
        }

        // Nested categories are renamed too; every rewritten path must stay
        // within the depth limit before anything touches the filesystem.
        let prefix = format!("{old}/");
        let rekeyed: Vec<(String, String)> = idx
            .by_category
            .keys()
            .filter(|k| *k == old || k.starts_with(&prefix))
            .map(|k| {
                let suffix = &k[old.len()..];
                (k.clone(), format!("{new}{suffix}"))
            })
            .collect();
        for (_, new_key) in &rekeyed {
            validate_category(new_key)?;
        }

        if let Some(parent) = new_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        if old_dir.exists() {
            fs::rename(&old_dir, &new_dir)?;
        } else {
            fs::create_dir_all(&new_dir)?;
        }

        for (old_key, new_key) in rekeyed {
            let ids = idx.by_category.remove(&old_key).unwrap_or_default();
            for id in &ids {
                if let Some(probe) = idx.by_id.get_mut(id) {
                    let rel = probe
                        .file_path
                        .strip_prefix(&old_dir)
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|_| PathBuf::from(format!("{id}.yaml")));
                    probe.category = new_key.clone();
                    probe.file_path = new_dir.join(rel);
                }
            }
            idx.by_category.insert(new_key, ids);
        }
        info!(old = old, new = new, "Category renamed");
        Ok(())
    }

    /// Return `name` if unused within `category`, otherwise the first free
    /// `name_1` … `name_999`, falling back to a timestamp suffix.
    pub fn unique_name(&self, category: &str, name: &str) -> String {
        let key = normalize_category(category);
        let idx = self.index.read().unwrap();
        let taken: HashSet<&str> = idx
            .by_category
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| idx.by_id.get(id))
                    .map(|p| p.name.as_str())
                    .collect()
            })
            .unwrap_or_default();
        if !taken.contains(name) {
            return name.to_string();
        }
        for i in 1..=999 {
            let candidate = format!("{name}_{i}");
            if !taken.contains(candidate.as_str()) {
                return candidate;
            }
        }
        format!("{name}_{}", Utc::now().timestamp())
    }

    // -----------------------------------------------------------------------
    // Incremental updates (watcher)
    // -----------------------------------------------------------------------

    /// Re-parse a probe file that changed on disk and upsert its metadata.
    pub fn reindex_file(&self, path: &Path) -> Result<()> {
        let root = self.root();
        let probe = load_metadata(&root, path)?;
        let mut idx = self.index.write().unwrap();
        // The same id at a different path keeps its first home.
        if let Some(existing) = idx.by_id.get(&probe.id) {
            if existing.file_path != probe.file_path {
                warn!(id = probe.id.as_str(), file = %path.display(),
                      "Duplicate probe id, ignoring new file");
                return Ok(());
            }
        }
        idx.insert(probe);
        Ok(())
    }

    /// Drop the probe indexed at `path`, if any.
    pub fn remove_by_path(&self, path: &Path) {
        let mut idx = self.index.write().unwrap();
        let id = idx
            .by_id
            .values()
            .find(|p| p.file_path == path)
            .map(|p| p.id.clone());
        if let Some(id) = id {
            idx.remove(&id);
            debug!(id = id.as_str(), "Probe removed after external delete");
        }
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub(crate) fn is_probe_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn normalize_category(category: &str) -> &str {
    if category == UNCATEGORIZED {
        ""
    } else {
        category
    }
}

/// Category of a probe file: the relative directory path from the root,
/// capped at three segments. A file directly under the root has an empty
/// category.
pub(crate) fn derive_category(root: &Path, file_path: &Path) -> Option<String> {
    let parent = file_path.parent()?;
    let rel = parent.strip_prefix(root).ok()?;
    let segments: Vec<String> = rel
        .components()
        .filter_map(|c| c.as_os_str().to_str().map(str::to_string))
        .take(MAX_CATEGORY_DEPTH)
        .collect();
    Some(segments.join("/"))
}

fn category_from_dir(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    let segments: Vec<String> = rel
        .components()
        .filter_map(|c| c.as_os_str().to_str().map(str::to_string))
        .collect();
    if segments.is_empty() || segments.len() > MAX_CATEGORY_DEPTH {
        return None;
    }
    Some(segments.join("/"))
}

/// Read a probe file and produce its metadata entry: parsed metadata with
/// category derived from the directory and timestamps from the file.
fn load_metadata(root: &Path, path: &Path) -> Result<Probe> {
    let text = fs::read_to_string(path)?;
    let mut probe = parser::parse_metadata(&text)?;
    probe.category = derive_category(root, path).unwrap_or_default();
    probe.file_path = path.to_path_buf();
    let meta = fs::metadata(path)?;
    let modified: DateTime<Utc> =
        meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
    let created: DateTime<Utc> = meta.created().map(DateTime::from).unwrap_or(modified);
    probe.created_at = created;
    probe.updated_at = modified;
    Ok(probe)
}

/// Write-then-rename so readers never observe a torn file.
fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::InvalidArgument(format!("bad path {}", target.display())))?;
    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        target.file_name().and_then(|n| n.to_str()).unwrap_or("probe"),
        uuid::Uuid::new_v4().simple()
    ));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn probe_yaml(id: &str, name: &str) -> String {
        format!(
            "id: {id}\ninfo:\n  name: {name}\n  severity: low\nhttp:\n  - method: GET\n    path: [\"{{{{BaseURL}}}}/\"]\n    matchers:\n      - type: status\n        status: [200]\n"
        )
    }

    fn seeded_library() -> (Arc<ProbeLibrary>, TempDir) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("web/sqli")).unwrap();
        fs::write(tmp.path().join("web/sqli/p1.yaml"), probe_yaml("p1", "First")).unwrap();
        fs::write(tmp.path().join("root-probe.yaml"), probe_yaml("p2", "Second")).unwrap();
        (ProbeLibrary::open_blocking(tmp.path()), tmp)
    }

    #[test]
    fn scan_indexes_probes_and_categories() {
        let (lib, _tmp) = seeded_library();
        assert!(lib.is_loaded());
        assert_eq!(lib.get_all().len(), 2);
        assert_eq!(lib.get_by_category("web/sqli").len(), 1);
        assert_eq!(lib.get_by_category(UNCATEGORIZED).len(), 1);
        assert_eq!(lib.get_by_severity(Severity::Low).len(), 2);
    }

    #[test]
    fn get_by_id_loads_content_lazily() {
        let (lib, _tmp) = seeded_library();
        let metadata = &lib.get_all()[0];
        assert!(metadata.content.is_none());
        let full = lib.get_by_id("p1").unwrap();
        assert!(full.content.is_some());
        assert_eq!(full.requests.len(), 1);
        assert!(lib.get_by_id("ghost").is_err());
    }

    #[test]
    fn save_moves_file_when_category_changes() {
        let (lib, tmp) = seeded_library();
        let mut probe = lib.get_by_id("p1").unwrap();
        probe.category = "web/xss".to_string();
        lib.save(&mut probe).unwrap();
        assert!(probe.file_path.starts_with(tmp.path().join("web/xss")));
        assert!(probe.file_path.exists());
        assert!(!tmp.path().join("web/sqli/p1.yaml").exists());
        assert!(lib.get_by_category("web/sqli").is_empty());
        assert_eq!(lib.get_by_category("web/xss").len(), 1);
    }

    #[test]
    fn delete_unlinks_and_unindexes() {
        let (lib, tmp) = seeded_library();
        lib.delete("p1").unwrap();
        assert!(!tmp.path().join("web/sqli/p1.yaml").exists());
        assert!(lib.get_by_id("p1").is_err());
        assert!(lib.get_by_category("web/sqli").is_empty());
        assert!(matches!(lib.delete("p1"), Err(Error::NotFound(_))));
    }

    #[test]
    fn category_lifecycle_guards() {
        let (lib, tmp) = seeded_library();
        lib.create_category("net/ssh").unwrap();
        assert!(tmp.path().join("net/ssh").is_dir());
        assert!(matches!(lib.create_category("net/ssh"), Err(Error::Conflict(_))));
        assert!(matches!(lib.create_category("a/b/c/d"), Err(Error::InvalidArgument(_))));
        assert!(matches!(lib.create_category("ba:d"), Err(Error::InvalidArgument(_))));
        assert!(matches!(lib.delete_category("web/sqli"), Err(Error::Conflict(_))));
        assert!(matches!(lib.delete_category(UNCATEGORIZED), Err(Error::InvalidArgument(_))));
        lib.delete_category("net/ssh").unwrap();
        assert!(!tmp.path().join("net/ssh").exists());
    }

    #[test]
    fn rename_category_rewrites_probes() {
        let (lib, tmp) = seeded_library();
        lib.rename_category("web/sqli", "webapp/sql-injection").unwrap();
        assert!(lib.get_by_category("web/sqli").is_empty());
        let moved = lib.get_by_category("webapp/sql-injection");
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].category, "webapp/sql-injection");
        assert!(moved[0].file_path.starts_with(tmp.path().join("webapp/sql-injection")));
        assert!(lib.get_by_id("p1").unwrap().file_path.exists());

        // Round-trip restores the original state.
        lib.rename_category("webapp/sql-injection", "web/sqli").unwrap();
        assert_eq!(lib.get_by_category("web/sqli").len(), 1);
        assert!(lib.get_by_category("webapp/sql-injection").is_empty());
    }

    #[test]
    fn rename_refuses_existing_target() {
        let (lib, _tmp) = seeded_library();
        lib.create_category("web/xss").unwrap();
        assert!(matches!(
            lib.rename_category("web/sqli", "web/xss"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn unique_name_suffixes() {
        let (lib, _tmp) = seeded_library();
        assert_eq!(lib.unique_name("web/sqli", "Fresh"), "Fresh");
        assert_eq!(lib.unique_name("web/sqli", "First"), "First_1");
        // Same name in another category is not a collision.
        assert_eq!(lib.unique_name("web/xss", "First"), "First");
    }

    #[test]
    fn pagination_slices() {
        let tmp = TempDir::new().unwrap();
        for i in 0..5 {
            fs::write(tmp.path().join(format!("p{i}.yaml")), probe_yaml(&format!("p{i}"), "N"))
                .unwrap();
        }
        let lib = ProbeLibrary::open_blocking(tmp.path());
        let (page, total) = lib.get_paginated(1, 2);
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), ["p2", "p3"]);
        let (tail, _) = lib.get_paginated(2, 2);
        assert_eq!(tail.len(), 1);
        let (beyond, _) = lib.get_paginated(9, 2);
        assert!(beyond.is_empty());
    }

    #[test]
    fn reindex_and_remove_follow_external_edits() {
        let (lib, tmp) = seeded_library();
        let path = tmp.path().join("web/sqli/p1.yaml");

        // External edit bumps the severity; reindex picks it up.
        fs::write(&path, probe_yaml("p1", "First").replace("low", "critical")).unwrap();
        lib.reindex_file(&path).unwrap();
        assert_eq!(lib.get_by_severity(Severity::Critical).len(), 1);
        assert!(lib.get_by_severity(Severity::Low).iter().all(|p| p.id != "p1"));

        // External delete drops the probe from every index.
        fs::remove_file(&path).unwrap();
        lib.remove_by_path(&path);
        assert!(lib.get_by_id("p1").is_err());
        assert!(lib.get_by_category("web/sqli").is_empty());

        // A second file claiming an indexed id is ignored.
        let clash = tmp.path().join("clash.yaml");
        fs::write(&clash, probe_yaml("p2", "Clone")).unwrap();
        lib.reindex_file(&clash).unwrap();
        assert_eq!(lib.get_by_id("p2").unwrap().name, "Second");
    }

    #[test]
    fn unparseable_probe_is_not_indexed() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("bad.yaml"), "info:\n  name: no id\n").unwrap();
        fs::write(tmp.path().join("good.yaml"), probe_yaml("ok", "Ok")).unwrap();
        let lib = ProbeLibrary::open_blocking(tmp.path());
        assert_eq!(lib.get_all().len(), 1);
    }
}

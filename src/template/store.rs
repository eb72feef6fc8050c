//! Mtime-gated template cache with graceful degradation
//!
//! The store never fails a request: a missing file yields an empty template
//! set (warned once per path until the file appears), and a file that stops
//! parsing keeps serving the last successfully parsed set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::types::{PromptBlueprint, RegexRule, TemplateSet};

#[derive(Debug, Default)]
struct CacheEntry {
    set: Arc<TemplateSet>,
    mtime: Option<SystemTime>,
    /// True once a parse has ever succeeded for this path
    loaded: bool,
    /// Gates the once-per-path missing-file warning
    missing_warned: bool,
    /// Number of successful disk loads, exposed for cache diagnostics
    load_count: u64,
}

/// Shared cache of parsed template files, keyed by path
#[derive(Debug, Default)]
pub struct TemplateStore {
    cache: RwLock<HashMap<PathBuf, CacheEntry>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        debug!("TemplateStore::new: called");
        Self::default()
    }

    /// Make sure the cached set for `path` reflects the file on disk
    ///
    /// Reloads only when the file's mtime differs from the cached one.
    /// Infallible by design; degradation is logged, never returned.
    pub fn ensure_loaded(&self, path: &Path) {
        debug!(path = %path.display(), "TemplateStore::ensure_loaded: called");

        let mtime = std::fs::metadata(path).and_then(|meta| meta.modified()).ok();

        // A missing file forces an empty set; the warning fires once per
        // path until the file reappears.
        let Some(mtime) = mtime else {
            let mut cache = write_lock(&self.cache);
            let entry = cache.entry(path.to_path_buf()).or_default();
            if !entry.missing_warned {
                warn!(path = %path.display(), "template file not found, serving empty template");
                entry.missing_warned = true;
            }
            entry.set = Arc::new(TemplateSet::default());
            entry.mtime = None;
            entry.loaded = false;
            return;
        };

        {
            let cache = read_lock(&self.cache);
            if let Some(entry) = cache.get(path)
                && entry.loaded
                && entry.mtime == Some(mtime)
            {
                debug!(path = %path.display(), "TemplateStore::ensure_loaded: cache hit");
                return;
            }
        }

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read template file");
                return;
            }
        };

        let mut cache = write_lock(&self.cache);
        let entry = cache.entry(path.to_path_buf()).or_default();
        match TemplateSet::parse(&text) {
            Ok(set) => {
                info!(
                    path = %path.display(),
                    blueprints = set.blueprints.len(),
                    rules = set.rules.len(),
                    "loaded template file"
                );
                entry.set = Arc::new(set);
                entry.mtime = Some(mtime);
                entry.loaded = true;
                entry.missing_warned = false;
                entry.load_count += 1;
            }
            Err(err) if entry.loaded => {
                warn!(path = %path.display(), error = %err, "template parse failed, keeping last-known-good set");
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "template parse failed, serving empty template");
            }
        }
    }

    /// Current template set for `path` (empty if never loaded)
    pub fn get(&self, path: &Path) -> Arc<TemplateSet> {
        debug!(path = %path.display(), "TemplateStore::get: called");
        read_lock(&self.cache)
            .get(path)
            .map(|entry| Arc::clone(&entry.set))
            .unwrap_or_default()
    }

    /// Prompt blueprints for `path`, refreshed from disk if stale
    pub fn blueprints(&self, path: &Path) -> Vec<PromptBlueprint> {
        self.ensure_loaded(path);
        self.get(path).blueprints.clone()
    }

    /// Regex rules for `path`, refreshed from disk if stale
    pub fn regex_rules(&self, path: &Path) -> Vec<RegexRule> {
        self.ensure_loaded(path);
        self.get(path).rules.clone()
    }

    /// How many times `path` has been loaded from disk
    pub fn load_count(&self, path: &Path) -> u64 {
        read_lock(&self.cache).get(path).map(|entry| entry.load_count).unwrap_or(0)
    }
}

// Lock poisoning only happens if a holder panicked; the cache data itself is
// replaced wholesale on write, so recovering the guard is safe.
fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

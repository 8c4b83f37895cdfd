use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        PoisonError,
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
    },
};

/// Shown when the panel is known to proxy the domain to the expected upstream.
pub const STATUS_SYNCED: &str = "✅ 已同步";

/// Shown when the domain still needs (re)applying.
pub const STATUS_QUEUED: &str = "⏳ 等待处理队列中...";

#[derive(Default)]
struct Caches {
    /// domain -> upstream last applied by this process.
    synced: HashMap<String, String>,
    /// domain -> progress of the action currently running for it.
    progress: HashMap<String, String>,
}

/// Synced and progress caches behind one lock, so readers always see both from the same instant.
///
/// Critical sections only touch the maps; no I/O happens while the lock is held.
#[derive(Default)]
pub struct SyncState {
    caches: RwLock<Caches>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the maps half-updated, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Caches> {
        self.caches.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Caches> {
        self.caches.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Progress wins over synced state; `expected_upstream` decides between synced and queued.
    pub fn status(&self, domain: &str, expected_upstream: &str) -> String {
        let caches = self.read();

        if let Some(progress) = caches.progress.get(domain).filter(|progress| !progress.is_empty()) {
            return progress.clone();
        }

        if caches.synced.get(domain).map(String::as_str) == Some(expected_upstream) {
            STATUS_SYNCED.to_string()
        } else {
            STATUS_QUEUED.to_string()
        }
    }

    /// Sets the progress of `domain`; an empty message removes it.
    pub fn set_progress(&self, domain: &str, msg: &str) {
        let mut caches = self.write();
        if msg.is_empty() {
            caches.progress.remove(domain);
        } else {
            caches.progress.insert(domain.to_string(), msg.to_string());
        }
    }

    pub fn clear_progress(&self, domain: &str) {
        self.set_progress(domain, "");
    }

    pub fn progress(&self, domain: &str) -> Option<String> {
        self.read().progress.get(domain).cloned()
    }

    pub fn synced_upstream(&self, domain: &str) -> Option<String> {
        self.read().synced.get(domain).cloned()
    }

    pub fn is_synced(&self, domain: &str) -> bool {
        self.read().synced.contains_key(domain)
    }

    pub fn mark_synced(&self, domain: &str, upstream: &str) {
        self.write()
            .synced
            .insert(domain.to_string(), upstream.to_string());
    }

    pub fn clear_synced(&self, domain: &str) {
        self.write().synced.remove(domain);
    }

    /// Drops every synced entry whose domain is not in `keep`. Returns the dropped domains.
    pub fn prune_synced(&self, keep: &HashSet<String>) -> Vec<String> {
        let mut caches = self.write();
        let orphans: Vec<String> = caches
            .synced
            .keys()
            .filter(|domain| !keep.contains(*domain))
            .cloned()
            .collect();
        for domain in &orphans {
            caches.synced.remove(domain);
        }
        orphans
    }

    pub fn synced_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.read().synced.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn has_progress(&self) -> bool {
        !self.read().progress.is_empty()
    }
}

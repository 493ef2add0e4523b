use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Persisted form of the cache: its directory and hashes, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLedger {
    pub dir: PathBuf,
    pub hashes: Vec<String>,
}

impl CacheLedger {
    pub const FILENAME: &str = "ledger.json";

    /// A missing or unreadable ledger is an empty cache.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match fsutil::read_json_with_deserialize(path.as_ref()) {
            Ok(ledger) => ledger,
            Err(e) if e.is_not_found() => Self::default(),
            Err(e) => {
                log::warn!("Ignoring broken compile cache ledger: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> fsutil::Result<()> {
        fsutil::write_json_with_mkdir(path, self)
    }
}

/// Bounded LRU set of compiled artifacts living in one directory.
#[derive(Debug)]
pub(super) struct ArtifactCache {
    dir: PathBuf,
    order: VecDeque<String>,
    limit: usize,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            dir: dir.into(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Restores the ledger if it belongs to `self.dir`; otherwise the
    /// artifacts it lists are stale and get removed.
    pub fn restore(&mut self, ledger: CacheLedger) {
        if ledger.dir != self.dir {
            if !ledger.hashes.is_empty() {
                log::debug!(
                    "Discarding compile cache ledger of {}",
                    ledger.dir.to_string_lossy()
                );
            }
            remove_artifacts(&ledger.dir, ledger.hashes.iter());
            return;
        }
        self.order = ledger.hashes.into_iter().collect();
        self.evict_overflow();
    }

    pub fn ledger(&self) -> CacheLedger {
        CacheLedger {
            dir: self.dir.clone(),
            hashes: self.order.iter().cloned().collect(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn artifact_path(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }

    /// Switching directories drops every entry of the old one.
    pub fn switch_dir(&mut self, dir: &Path) {
        if self.dir == dir {
            return;
        }
        log::info!(
            "Build dir changed ({} -> {}), clearing compile cache",
            self.dir.to_string_lossy(),
            dir.to_string_lossy()
        );
        self.clear();
        self.dir = dir.to_owned();
    }

    /// On hit, moves `hash` to the most-recently-used end.
    /// An entry whose file vanished is dropped and reported as a miss.
    pub fn lookup(&mut self, hash: &str) -> Option<PathBuf> {
        let pos = self.order.iter().position(|h| h == hash)?;
        let path = self.artifact_path(hash);
        let entry = self.order.remove(pos)?;
        if !path.is_file() {
            log::debug!("Cached artifact {} is gone", path.to_string_lossy());
            return None;
        }
        self.order.push_back(entry);
        Some(path)
    }

    pub fn insert(&mut self, hash: String) {
        if let Some(pos) = self.order.iter().position(|h| *h == hash) {
            self.order.remove(pos);
        }
        self.order.push_back(hash);
        self.evict_overflow();
    }

    pub fn clear(&mut self) {
        remove_artifacts(&self.dir, self.order.iter());
        self.order.clear();
    }

    fn evict_overflow(&mut self) {
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                log::debug!("Evicting cached artifact {}", oldest);
                remove_artifacts(&self.dir, std::iter::once(&oldest));
            }
        }
    }
}

fn remove_artifacts<'a>(dir: &Path, hashes: impl Iterator<Item = &'a String>) {
    for hash in hashes {
        if let Err(e) = fsutil::remove_file_if_exists(dir.join(hash)) {
            log::warn!("{:#}", e);
        }
    }
}

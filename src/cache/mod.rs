//! Persistent cross-build artifact cache.
//!
//! Layout is `<root>/<format>/<name>-<version>/`. Opening a root whose format
//! directory is missing wipes the root, which is how incompatible layout
//! changes invalidate old entries wholesale.
//!
//! A store assumes it is the only writer of its root for the lifetime of the
//! run. Nothing is locked.

use anyhow::Result;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::SupplyError;
use crate::runtime::Runtime;

const PENDING_SUFFIX: &str = ".partial";

/// Per-run state of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Left over from an earlier run and not requested yet.
    Unmarked,
    InUse,
    Deleted,
}

pub struct CacheStore<R: Runtime> {
    runtime: Arc<R>,
    dir: PathBuf,
    entries: BTreeMap<String, EntryState>,
}

impl<R: Runtime> CacheStore<R> {
    /// Open `root` for this run, invalidating it when `format_version` is new
    /// or when `no_cache` is set.
    #[tracing::instrument(skip(runtime))]
    pub fn open(runtime: Arc<R>, root: &Path, format_version: &str, no_cache: bool) -> Result<Self> {
        let dir = root.join(format_version);

        if no_cache {
            info!("Persistent cache disabled, clearing {:?}", root);
            clear_dir(runtime.as_ref(), root);
        } else if !runtime.exists(&dir) {
            info!("Cache format {} not found, clearing {:?}", format_version, root);
            clear_dir(runtime.as_ref(), root);
        }

        runtime
            .create_dir_all(&dir)
            .map_err(|e| SupplyError::CacheRootUnavailable {
                path: dir.clone(),
                reason: format!("{:#}", e),
            })?;

        let children = runtime
            .read_dir(&dir)
            .map_err(|e| SupplyError::CacheRootUnavailable {
                path: dir.clone(),
                reason: format!("{:#}", e),
            })?;

        let mut entries = BTreeMap::new();
        for child in children {
            let Some(name) = child.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                if name.ends_with(PENDING_SUFFIX) {
                    debug!("Removing unfinished cache entry {:?}", child);
                    if let Err(e) = remove_entry(runtime.as_ref(), &child) {
                        warn!("Failed to remove unfinished cache entry {:?}: {:#}", child, e);
                    }
                }
                continue;
            }
            entries.insert(name, EntryState::Unmarked);
        }
        debug!("Cache {:?} holds {} entries", dir, entries.len());

        Ok(Self {
            runtime,
            dir,
            entries,
        })
    }

    /// The format directory entries live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, full_name: &str) -> PathBuf {
        self.dir.join(full_name)
    }

    /// Scratch location an entry is built in before [`publish`](Self::publish).
    pub fn pending_path(&self, full_name: &str) -> PathBuf {
        self.dir.join(format!(".{}{}", full_name, PENDING_SUFFIX))
    }

    pub fn has(&self, full_name: &str) -> bool {
        self.entries.get(full_name) != Some(&EntryState::Deleted)
            && self.runtime.exists(&self.path(full_name))
    }

    pub fn state(&self, full_name: &str) -> Option<EntryState> {
        self.entries.get(full_name).copied()
    }

    /// Move a fully built pending entry into its final slot.
    pub fn publish(&self, full_name: &str) -> Result<PathBuf> {
        let target = self.path(full_name);
        if self.runtime.exists(&target) {
            remove_entry(self.runtime.as_ref(), &target)?;
        }
        self.runtime.rename(&self.pending_path(full_name), &target)?;
        debug!("Published cache entry {:?}", target);
        Ok(target)
    }

    /// Record that this run needs `full_name`, evicting other cached versions of `name`.
    ///
    /// Eviction failures are logged and ignored.
    pub fn mark_in_use(&mut self, name: &str, full_name: &str) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(entry, state)| {
                entry.as_str() != full_name
                    && **state != EntryState::Deleted
                    && is_version_of(entry, name)
            })
            .map(|(entry, _)| entry.clone())
            .collect();

        for entry in stale {
            let path = self.path(&entry);
            info!("Removing stale cached version {}", entry);
            match remove_entry(self.runtime.as_ref(), &path) {
                Ok(()) => {
                    self.entries.insert(entry, EntryState::Deleted);
                }
                Err(e) => warn!("Failed to remove stale cache entry {:?}: {:#}", path, e),
            }
        }

        self.entries.insert(full_name.to_string(), EntryState::InUse);
    }

    /// Delete every entry this run never marked. Returns the names removed.
    #[tracing::instrument(skip(self))]
    pub fn sweep(&mut self) -> Vec<String> {
        let unused: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, state)| **state == EntryState::Unmarked)
            .map(|(entry, _)| entry.clone())
            .collect();

        let mut removed = Vec::new();
        for entry in unused {
            let path = self.path(&entry);
            info!("Removing unused cached dependency {}", entry);
            match remove_entry(self.runtime.as_ref(), &path) {
                Ok(()) => {
                    self.entries.insert(entry.clone(), EntryState::Deleted);
                    removed.push(entry);
                }
                Err(e) => warn!("Failed to remove unused cache entry {:?}: {:#}", path, e),
            }
        }
        removed
    }
}

/// `entry` is `<name>-<version>` with a version starting with a digit.
fn is_version_of(entry: &str, name: &str) -> bool {
    entry
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|version| version.chars().next())
        .is_some_and(|c| c.is_ascii_digit())
}

fn remove_entry<R: Runtime + ?Sized>(runtime: &R, path: &Path) -> Result<()> {
    if runtime.is_dir(path) {
        runtime.remove_dir_all(path)
    } else {
        runtime.remove_file(path)
    }
}

/// Empty `dir` without removing it; it may be a mount point.
fn clear_dir<R: Runtime + ?Sized>(runtime: &R, dir: &Path) {
    if !runtime.exists(dir) {
        return;
    }
    match runtime.read_dir(dir) {
        Ok(children) => {
            for child in children {
                if let Err(e) = remove_entry(runtime, &child) {
                    warn!("Failed to remove {:?}: {:#}", child, e);
                }
            }
        }
        Err(e) => warn!("Failed to list {:?}: {:#}", dir, e),
    }
}

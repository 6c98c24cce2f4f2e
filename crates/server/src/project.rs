// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cached, watcher-invalidated project index.
//!
//! Projects are directories under the sessions root whose names decode as
//! project ids. Two layouts coexist: project dirs directly under the root,
//! and project dirs nested one level under a hostname directory. The same
//! logical path seen from several hosts is merged into one project.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus, WatchedFileType};
use crate::record::{decode_project_id, encode_project_id};
use crate::store::LogStore;

/// One logical project and where its sessions live.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub session_dir: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub merged_session_dirs: Vec<PathBuf>,
    pub last_activity_ms: u64,
    pub session_count: usize,
    /// True for the synthesized home-directory project.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
}

impl Project {
    /// All directories that may hold this project's session logs.
    pub fn all_session_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.session_dir.clone()];
        dirs.extend(self.merged_session_dirs.iter().cloned());
        dirs
    }
}

struct Cached {
    snapshot: Option<Arc<Vec<Project>>>,
    taken: Instant,
    dirty: bool,
}

/// TTL-cached snapshot of the project scan, with coalesced refresh.
pub struct ProjectIndex {
    root: PathBuf,
    home: PathBuf,
    ttl: Duration,
    cached: parking_lot::Mutex<Cached>,
    refresh: tokio::sync::Mutex<()>,
}

impl ProjectIndex {
    pub fn new(root: PathBuf, home: PathBuf, ttl: Duration) -> Self {
        Self {
            root,
            home,
            ttl,
            cached: parking_lot::Mutex::new(Cached {
                snapshot: None,
                taken: Instant::now(),
                dirty: true,
            }),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Current snapshot, rescanned at most once per TTL window.
    ///
    /// Concurrent callers past an expired snapshot coalesce on one scan.
    pub async fn snapshot(&self) -> Arc<Vec<Project>> {
        if let Some(snap) = self.fresh() {
            return snap;
        }
        let _guard = self.refresh.lock().await;
        // Someone else may have refreshed while we waited for the guard.
        if let Some(snap) = self.fresh() {
            return snap;
        }
        let projects = Arc::new(scan_projects(&self.root, &self.home));
        let mut cached = self.cached.lock();
        cached.snapshot = Some(Arc::clone(&projects));
        cached.taken = Instant::now();
        cached.dirty = false;
        projects
    }

    /// Look up one project by id.
    pub async fn find(&self, id: &str) -> Option<Project> {
        self.snapshot().await.iter().find(|p| p.id == id).cloned()
    }

    /// Mark the snapshot stale; the next `snapshot()` call rescans.
    pub fn invalidate(&self) {
        self.cached.lock().dirty = true;
    }

    fn fresh(&self) -> Option<Arc<Vec<Project>>> {
        let cached = self.cached.lock();
        if cached.dirty || cached.taken.elapsed() >= self.ttl {
            return None;
        }
        cached.snapshot.as_ref().map(Arc::clone)
    }

    /// Spawn a task invalidating the cache on session file changes.
    pub fn spawn_invalidator(
        self: &Arc<Self>,
        bus: &EventBus,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let index = Arc::clone(self);
        let mut sub = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = sub.recv() => match event {
                        Some(BusEvent::FileChange { file_type, .. })
                            if matches!(
                                file_type,
                                WatchedFileType::Session | WatchedFileType::AgentSession
                            ) =>
                        {
                            index.invalidate();
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        })
    }
}

/// Enumerate both layouts and merge cross-host duplicates.
///
/// The direct (this-host) layout is scanned before hostname subdirectories,
/// so when the same logical path appears in both, the local directory is the
/// first seen and stays primary; new sessions then spawn against a path that
/// actually exists on this host.
fn scan_projects(root: &Path, home: &Path) -> Vec<Project> {
    let mut entries: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut host_dirs: Vec<PathBuf> = Vec::new();

    if let Ok(read) = std::fs::read_dir(root) {
        for entry in read.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match decode_project_id(name) {
                Ok(path) => entries.push((path, dir)),
                Err(_) => host_dirs.push(dir),
            }
        }
    }

    // Hostname layout second, in name order, so "first seen" is stable.
    host_dirs.sort();
    for host_dir in host_dirs {
        let Ok(read) = std::fs::read_dir(&host_dir) else {
            continue;
        };
        let mut children: Vec<PathBuf> = read.flatten().map(|e| e.path()).collect();
        children.sort();
        for dir in children {
            if !dir.is_dir() {
                continue;
            }
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Ok(path) = decode_project_id(name) {
                entries.push((path, dir));
            }
        }
    }

    let mut projects: Vec<Project> = Vec::new();
    for (path, dir) in entries {
        if let Some(existing) = projects.iter_mut().find(|p| p.path == path) {
            existing.merged_session_dirs.push(dir);
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("(root)").to_owned();
        projects.push(Project {
            id: encode_project_id(&path),
            name,
            path,
            session_dir: dir,
            merged_session_dirs: vec![],
            last_activity_ms: 0,
            session_count: 0,
            synthetic: false,
        });
    }

    for project in &mut projects {
        let sessions = LogStore::list_sessions(&project.all_session_dirs());
        project.session_count = sessions.len();
        project.last_activity_ms = sessions.iter().map(|s| s.modified_ms).max().unwrap_or(0);
    }

    projects.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));

    if projects.is_empty() {
        projects.push(virtual_home_project(root, home));
    }
    projects
}

/// Fallback project pointing at the user's home directory.
fn virtual_home_project(root: &Path, home: &Path) -> Project {
    let id = encode_project_id(home);
    Project {
        session_dir: root.join(&id),
        id,
        name: home.file_name().and_then(|n| n.to_str()).unwrap_or("home").to_owned(),
        path: home.to_path_buf(),
        merged_session_dirs: vec![],
        last_activity_ms: 0,
        session_count: 0,
        synthetic: true,
    }
}

#[cfg(test)]
#[path = "project_tests.rs"]
mod tests;

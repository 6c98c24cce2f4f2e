// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;
use std::time::Duration;

use super::ProjectIndex;
use crate::record::encode_project_id;

fn touch_session(dir: &Path, session_id: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(format!("{session_id}.jsonl")), "{\"type\":\"user\"}\n")?;
    Ok(())
}

#[tokio::test]
async fn discovers_direct_layout() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let home = tempfile::tempdir()?;
    let project_dir = root.path().join(encode_project_id(Path::new("/tmp/demo")));
    touch_session(&project_dir, "s1")?;
    touch_session(&project_dir, "s2")?;

    let index =
        ProjectIndex::new(root.path().to_path_buf(), home.path().to_path_buf(), Duration::from_secs(5));
    let snap = index.snapshot().await;
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].path, Path::new("/tmp/demo"));
    assert_eq!(snap[0].name, "demo");
    assert_eq!(snap[0].session_count, 2);
    assert!(!snap[0].synthetic);
    Ok(())
}

#[tokio::test]
async fn merges_cross_host_duplicates() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let home = tempfile::tempdir()?;
    let id = encode_project_id(Path::new("/srv/app"));
    touch_session(&root.path().join("host-a").join(&id), "s1")?;
    touch_session(&root.path().join("host-b").join(&id), "s2")?;

    let index =
        ProjectIndex::new(root.path().to_path_buf(), home.path().to_path_buf(), Duration::from_secs(5));
    let snap = index.snapshot().await;
    assert_eq!(snap.len(), 1);
    let project = &snap[0];
    // First-seen (host-a, name order) is primary; the sibling is merged.
    assert!(project.session_dir.ends_with(Path::new("host-a").join(&id)));
    assert_eq!(project.merged_session_dirs.len(), 1);
    assert_eq!(project.session_count, 2);
    Ok(())
}

#[tokio::test]
async fn local_layout_wins_when_path_exists() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let home = tempfile::tempdir()?;
    // Use the home tempdir as a project path that genuinely exists.
    let real_path = home.path().join("work");
    std::fs::create_dir_all(&real_path)?;
    let id = encode_project_id(&real_path);

    touch_session(&root.path().join("aaa-host").join(&id), "remote")?;
    touch_session(&root.path().join(&id), "local")?;

    let index =
        ProjectIndex::new(root.path().to_path_buf(), home.path().to_path_buf(), Duration::from_secs(5));
    let snap = index.snapshot().await;
    assert_eq!(snap.len(), 1);
    // The direct layout dir is primary even though the hostname dir also exists.
    assert_eq!(snap[0].session_dir, root.path().join(&id));
    assert_eq!(snap[0].merged_session_dirs.len(), 1);
    Ok(())
}

#[tokio::test]
async fn empty_scan_synthesizes_home_project() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let home = tempfile::tempdir()?;
    let index =
        ProjectIndex::new(root.path().to_path_buf(), home.path().to_path_buf(), Duration::from_secs(5));
    let snap = index.snapshot().await;
    assert_eq!(snap.len(), 1);
    assert!(snap[0].synthetic);
    assert_eq!(snap[0].path, home.path());
    Ok(())
}

#[tokio::test]
async fn snapshot_is_cached_until_invalidated() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let home = tempfile::tempdir()?;
    let index = ProjectIndex::new(
        root.path().to_path_buf(),
        home.path().to_path_buf(),
        Duration::from_secs(60),
    );

    let first = index.snapshot().await;
    assert!(first[0].synthetic);

    // New project appears on disk, but the cache is still fresh.
    touch_session(&root.path().join(encode_project_id(Path::new("/tmp/demo"))), "s1")?;
    let cached = index.snapshot().await;
    assert!(cached[0].synthetic);

    index.invalidate();
    let rescanned = index.snapshot().await;
    assert_eq!(rescanned.len(), 1);
    assert!(!rescanned[0].synthetic);
    Ok(())
}

#[tokio::test]
async fn find_by_id() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let home = tempfile::tempdir()?;
    let id = encode_project_id(Path::new("/tmp/demo"));
    touch_session(&root.path().join(&id), "s1")?;

    let index =
        ProjectIndex::new(root.path().to_path_buf(), home.path().to_path_buf(), Duration::from_secs(5));
    assert!(index.find(&id).await.is_some());
    assert!(index.find("bm9wZQ").await.is_none());
    Ok(())
}

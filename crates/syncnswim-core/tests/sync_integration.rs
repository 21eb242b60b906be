//! Integration tests for transfers and sync passes against a real directory.
//!
//! A temporary directory stands in for the device mount point; there is no
//! mount table entry for it, so the store falls back to probing writability.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use syncnswim_core::{
    BatchSyncManager, Episode, EpisodeSource, FileSystem, MANIFEST_FILE_NAME, MountInspector,
    MountTable, MusicSelector, RealFileSystem, Result, SyncManifest, SyncMode, WRITE_PROBE_FILE,
    WritableStore,
};
use tempfile::TempDir;

/// Mount inspector that knows about no mounts.
struct EmptyMounts;

impl MountInspector for EmptyMounts {
    fn current_mounts(&self) -> MountTable {
        MountTable::default()
    }
}

/// Episode source that is never consulted in music mode.
struct NoEpisodes;

impl EpisodeSource for NoEpisodes {
    fn latest_episode(&self, _rss_url: &str) -> Result<Option<Episode>> {
        Ok(None)
    }

    fn download(&self, episode: &Episode, _podcast_name: &str) -> Result<std::path::PathBuf> {
        Ok(std::path::PathBuf::from(&episode.media_url))
    }
}

fn real_fs() -> Arc<dyn FileSystem> {
    Arc::new(RealFileSystem::new())
}

fn store_at(device: &Path, subdirectory: &str) -> WritableStore {
    WritableStore::new(device, subdirectory, real_fs(), Arc::new(EmptyMounts))
}

fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

#[test]
fn test_ensure_writable_creates_subdirectory_and_cleans_probe() {
    let device = TempDir::new().unwrap();
    let store = store_at(device.path(), "Podcasts");

    store.ensure_writable().unwrap();

    assert!(device.path().join("Podcasts").is_dir());
    assert!(!device.path().join(WRITE_PROBE_FILE).exists());
}

#[test]
fn test_copy_is_idempotent_and_overwrites_on_size_change() {
    let library = TempDir::new().unwrap();
    let device = TempDir::new().unwrap();
    let source = library.path().join("episode.mp3");
    write(&source, "first version");

    let store = store_at(device.path(), "Podcasts");
    let first = store.copy(&source, None).unwrap();
    assert!(!first.skipped);
    assert_eq!(first.size_bytes, 13);

    let second = store.copy(&source, None).unwrap();
    assert!(second.skipped);

    write(&source, "second, longer version");
    let third = store.copy(&source, None).unwrap();
    assert!(!third.skipped);
    assert_eq!(
        fs::read_to_string(device.path().join("Podcasts/episode.mp3")).unwrap(),
        "second, longer version"
    );
}

#[test]
fn test_copy_sanitizes_destination_name() {
    let library = TempDir::new().unwrap();
    let device = TempDir::new().unwrap();
    let source = library.path().join("download.mp3");
    write(&source, "audio");

    let store = store_at(device.path(), "");
    let stored = store.copy(&source, Some("Ep #12: Q&A!.mp3")).unwrap();

    assert_eq!(stored.file_name().as_deref(), Some("Ep _12_ Q_A_.mp3"));
    assert!(device.path().join("Ep _12_ Q_A_.mp3").is_file());
    assert_eq!(store.list_files().unwrap(), vec!["Ep _12_ Q_A_.mp3"]);
}

#[test]
fn test_copy_missing_source_fails() {
    let device = TempDir::new().unwrap();
    let store = store_at(device.path(), "");
    assert!(store.copy(&device.path().join("nope.mp3"), None).is_err());
}

#[test]
fn test_remove_reports_whether_file_existed() {
    let device = TempDir::new().unwrap();
    write(&device.path().join("Music/track.mp3"), "x");
    let store = store_at(device.path(), "Music");

    assert!(store.remove("track.mp3").unwrap());
    assert!(!store.remove("track.mp3").unwrap());
    assert!(store.remove("../escape.mp3").is_err());
}

#[test]
fn test_manifest_survives_reload() {
    let device = TempDir::new().unwrap();
    let fs = RealFileSystem::new();

    SyncManifest::new(vec!["a.mp3".into(), "b.mp3".into()])
        .save(&fs, device.path())
        .unwrap();

    let raw = fs::read_to_string(device.path().join(MANIFEST_FILE_NAME)).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["count"], 2);

    let loaded = SyncManifest::load(&fs, device.path());
    assert_eq!(loaded.files, vec!["a.mp3", "b.mp3"]);
}

#[test]
fn test_music_passes_rotate_the_batch() {
    let library = TempDir::new().unwrap();
    let device = TempDir::new().unwrap();
    for i in 0..30 {
        write(&library.path().join(format!("disc{}/track{i:02}.mp3", i % 3)), "tune");
    }
    write(&library.path().join("cover.jpg"), "not audio");
    write(&device.path().join("Music/mine.mp3"), "user file");

    let fs = real_fs();
    let manager = BatchSyncManager::new(SyncMode::Music, Arc::clone(&fs), Arc::new(NoEpisodes))
        .with_music(MusicSelector::new(library.path(), 20, Arc::clone(&fs)));
    let store = store_at(device.path(), "Music");

    let first = manager.sync(&store);
    assert!(first.success(), "{}", first.summary());
    assert_eq!(first.placed.len(), 20);

    let second = manager.sync(&store);
    assert!(second.success(), "{}", second.summary());
    assert_eq!(second.removed, 20);

    let on_device = store.list_files().unwrap();
    assert_eq!(on_device.len(), 21);
    assert!(on_device.contains(&"mine.mp3".to_string()));

    let manifest = SyncManifest::load(fs.as_ref(), device.path());
    assert_eq!(manifest.count, 20);
    for name in &manifest.files {
        assert!(device.path().join("Music").join(name).is_file());
    }
}

#[test]
fn test_music_pass_with_small_library_takes_everything() {
    let library = TempDir::new().unwrap();
    let device = TempDir::new().unwrap();
    write(&library.path().join("one.mp3"), "1");
    write(&library.path().join("two.m4a"), "2");

    let fs = real_fs();
    let manager = BatchSyncManager::new(SyncMode::Music, Arc::clone(&fs), Arc::new(NoEpisodes))
        .with_music(MusicSelector::new(library.path(), 20, Arc::clone(&fs)));

    let report = manager.sync(&store_at(device.path(), "Music"));
    assert_eq!(report.placed, vec!["one.mp3", "two.m4a"]);
    assert!(report.manifest_written);
}

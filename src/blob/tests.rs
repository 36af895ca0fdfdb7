use std::path::PathBuf;

use futures::TryStreamExt;

use super::*;
use crate::{fio::VirtualFileSystem, tests::setup_tracing};

fn config(segment_target_size: u64) -> BlobConfig {
    BlobConfig {
        segment_target_size,
    }
}

async fn segment_files(fs: &VirtualFileSystem, dir: &Path) -> Vec<PathBuf> {
    let entries: Vec<_> = fs.read_dir(dir).await.unwrap().try_collect().await.unwrap();
    entries.into_iter().map(|e| e.path().to_path_buf()).collect()
}

#[tokio::test]
async fn test_append_and_read() {
    setup_tracing();
    let fs = VirtualFileSystem::new();
    let store = BlobStore::open(fs, PathBuf::from("/blobs"), config(1 << 20))
        .await
        .unwrap();

    let a = store.append(b"first tile").await.unwrap();
    let b = store.append(b"").await.unwrap();
    let c = store.append(&[7u8; 300]).await.unwrap();
    assert_eq!(a.segment, 1);
    assert_eq!(a.offset, SEGMENT_HEADER_SIZE as u64);
    assert_eq!(b.offset, a.offset + a.footprint());

    assert_eq!(&store.read(&a).await.unwrap()[..], b"first tile");
    assert!(store.read(&b).await.unwrap().is_empty());
    assert_eq!(store.read(&c).await.unwrap().len(), 300);

    let stats = store.stats();
    assert_eq!(stats.segments, 1);
    assert_eq!(stats.live_regions, 3);
    assert_eq!(stats.live_bytes, 310);
}

#[tokio::test]
async fn test_read_unknown_location() {
    let fs = VirtualFileSystem::new();
    let store = BlobStore::open(fs, PathBuf::from("/blobs"), config(1 << 20))
        .await
        .unwrap();
    let a = store.append(b"abc").await.unwrap();

    let missing_segment = LocationRef { segment: 9, ..a };
    let missing_region = LocationRef { offset: 1000, ..a };
    assert!(matches!(
        store.read(&missing_segment).await,
        Err(VaultError::NotFound(_))
    ));
    assert!(matches!(
        store.read(&missing_region).await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_corruption_is_detected() {
    let fs = VirtualFileSystem::new();
    let dir = PathBuf::from("/blobs");
    let store = BlobStore::open(fs.clone(), dir.clone(), config(1 << 20))
        .await
        .unwrap();
    let a = store.append(b"precious pixels").await.unwrap();

    // Flip a payload byte behind the store's back
    let mut file = fs.open(&dir.join(segment_filename(1))).await.unwrap();
    let pos = a.offset + REGION_PREFIX_SIZE as u64;
    file.write_all_at(b"P", pos).await.unwrap();

    assert!(matches!(
        store.read(&a).await,
        Err(VaultError::Corruption(_))
    ));
}

#[tokio::test]
async fn test_rotation_and_reclaim() {
    setup_tracing();
    let fs = VirtualFileSystem::new();
    let dir = PathBuf::from("/blobs");
    let store = BlobStore::open(fs.clone(), dir.clone(), config(128))
        .await
        .unwrap();

    let mut locations = Vec::new();
    for i in 0..6u8 {
        locations.push(store.append(&[i; 40]).await.unwrap());
    }
    let segments: BTreeSet<_> = locations.iter().map(|l| l.segment).collect();
    assert!(segments.len() > 1, "appends should have rotated segments");

    // Reclaiming everything in the first segment removes its file
    let first: Vec<_> = locations.iter().filter(|l| l.segment == 1).copied().collect();
    let stats = store.reclaim(first.clone()).await.unwrap();
    assert_eq!(stats.regions, first.len());
    assert_eq!(stats.segments_removed, 1);
    assert!(!segment_files(&fs, &dir).await.contains(&dir.join(segment_filename(1))));
    assert!(matches!(
        store.read(&first[0]).await,
        Err(VaultError::NotFound(_))
    ));

    // Reclaiming twice is a no-op
    let stats = store.reclaim(first).await.unwrap();
    assert_eq!(stats, ReclaimStats::default());

    // The active segment is never removed, even without live regions
    let last = *locations.last().unwrap();
    store.reclaim([last]).await.unwrap();
    assert!(segment_files(&fs, &dir).await.contains(&dir.join(segment_filename(last.segment))));
    let fresh = store.append(b"still writable").await.unwrap();
    assert_eq!(&store.read(&fresh).await.unwrap()[..], b"still writable");
}

#[tokio::test]
async fn test_pinned_segment_is_deferred() {
    let fs = VirtualFileSystem::new();
    let dir = PathBuf::from("/blobs");
    let store = BlobStore::open(fs.clone(), dir.clone(), config(64))
        .await
        .unwrap();
    let a = store.append(&[1u8; 40]).await.unwrap();
    let b = store.append(&[2u8; 40]).await.unwrap();
    assert_ne!(a.segment, b.segment);

    // Simulate an in-flight read by holding the segment
    let pin = store.segments.read().get(&a.segment).cloned().unwrap();
    let stats = store.reclaim([a]).await.unwrap();
    assert_eq!(stats.segments_removed, 0);
    assert_eq!(stats.segments_pending, 1);
    assert!(segment_files(&fs, &dir).await.contains(&pin.path));

    drop(pin);
    let stats = store.reclaim([]).await.unwrap();
    assert_eq!(stats.segments_removed, 1);
    assert_eq!(store.stats().pending_removal, 0);
    assert!(!segment_files(&fs, &dir).await.contains(&dir.join(segment_filename(a.segment))));
}

#[tokio::test]
async fn test_reopen_restores_live_regions() {
    setup_tracing();
    let fs = VirtualFileSystem::new();
    let dir = PathBuf::from("/blobs");
    let (kept, dropped) = {
        let store = BlobStore::open(fs.clone(), dir.clone(), config(64))
            .await
            .unwrap();
        let kept = store.append(&[1u8; 40]).await.unwrap();
        let dropped = store.append(&[2u8; 40]).await.unwrap();
        store.shutdown().await.unwrap();
        (kept, dropped)
    };

    // A half created segment without a valid header
    fs.create(&dir.join(segment_filename(77)))
        .await
        .unwrap()
        .write_all(b"TVLT")
        .await
        .unwrap();

    let store = BlobStore::open(fs.clone(), dir.clone(), config(64))
        .await
        .unwrap();
    assert!(!segment_files(&fs, &dir).await.contains(&dir.join(segment_filename(77))));

    store.restore_live([kept]).unwrap();
    assert_eq!(store.sweep_unreferenced().await.unwrap(), 1);
    assert_eq!(&store.read(&kept).await.unwrap()[..], &[1u8; 40]);
    assert!(matches!(
        store.read(&dropped).await,
        Err(VaultError::NotFound(_))
    ));

    // New segments continue after the highest recovered id
    let fresh = store.append(b"x").await.unwrap();
    assert!(fresh.segment > dropped.segment);

    let missing = LocationRef {
        segment: 500,
        offset: 24,
        len: 1,
    };
    assert!(matches!(
        store.restore_live([missing]),
        Err(VaultError::Corruption(_))
    ));
}

//! # Blob store
//!
//! Append-only storage for tile payloads. Payloads are framed into regions and appended to the
//! active segment file `{dir}/{id:08}.blob`; a segment is sealed once it grows beyond
//! [`BlobConfig::segment_target_size`] and a new one takes over. Regions are never modified.
//!
//! Each segment tracks its live regions. Reclaimed regions are dropped from that set, and a
//! sealed segment without live regions is unlinked and its file removed as soon as no reader
//! holds on to it. Readers pin a segment by holding a clone of its `Arc`.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    mem,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tracing::instrument;
use zerocopy::IntoBytes;

use crate::{
    base::{ByteSize, VaultError, VaultResult},
    config::BlobConfig,
    fio::{FioFS, FioFile},
};

mod format;

pub use format::LocationRef;
use format::*;

#[derive(Debug)]
pub(crate) struct Segment<F: FioFS> {
    id: u64,
    path: PathBuf,
    sealed: AtomicBool,
    /// Offset to payload length of every live region.
    live: Mutex<HashMap<u64, u32>>,
    reader: tokio::sync::Mutex<F::File>,
}

impl<F: FioFS> Segment<F> {
    fn new(id: u64, path: PathBuf, reader: F::File, sealed: bool) -> Self {
        Self {
            id,
            path,
            sealed: AtomicBool::new(sealed),
            live: Mutex::new(HashMap::new()),
            reader: tokio::sync::Mutex::new(reader),
        }
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    fn is_dead(&self) -> bool {
        self.is_sealed() && self.live.lock().is_empty()
    }

    fn mark_live(&self, location: &LocationRef) {
        self.live.lock().insert(location.offset, location.len);
    }

    /// Returns whether the region was live before.
    fn mark_dead(&self, location: &LocationRef) -> bool {
        let mut live = self.live.lock();
        match live.get(&location.offset) {
            Some(&len) if len == location.len => {
                live.remove(&location.offset);
                true
            }
            _ => false,
        }
    }

    fn is_live(&self, location: &LocationRef) -> bool {
        self.live.lock().get(&location.offset) == Some(&location.len)
    }
}

#[derive(Debug)]
struct ActiveSegment<F: FioFS> {
    segment: Arc<Segment<F>>,
    file: F::File,
    filepos: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    pub regions: usize,
    pub bytes: u64,
    pub segments_removed: usize,
    /// Dead segments still pinned by readers, removed by a later reclaim.
    pub segments_pending: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlobStats {
    pub segments: usize,
    pub live_regions: usize,
    pub live_bytes: u64,
    pub pending_removal: usize,
}

#[derive(Debug)]
pub struct BlobStore<F: FioFS> {
    fs: F,
    dir: PathBuf,
    config: BlobConfig,
    active: tokio::sync::Mutex<ActiveSegment<F>>,
    segments: RwLock<BTreeMap<u64, Arc<Segment<F>>>>,
    retired: Mutex<Vec<Arc<Segment<F>>>>,
}

impl<F: FioFS> BlobStore<F> {
    /// Opens the store in `dir`. Existing segments are registered as sealed without live
    /// regions, see [`Self::restore_live`] and [`Self::sweep_unreferenced`].
    #[instrument(skip_all, level = "debug", fields(dir = ?dir))]
    pub async fn open(fs: F, dir: PathBuf, config: BlobConfig) -> VaultResult<Self> {
        fs.create_dir_all(&dir).await?;

        let mut segments = BTreeMap::new();
        let mut entries = fs.read_dir(&dir).await?;
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if entry.is_dir() {
                continue;
            }
            let Some(id) = parse_segment_filename(entry.path()) else {
                continue;
            };
            match Self::open_segment(&fs, entry.path(), id).await {
                Ok(segment) => {
                    segments.insert(id, Arc::new(segment));
                }
                Err(e) => {
                    warn!(path = ?entry.path(), "removing blob segment with invalid header: {e}");
                    fs.remove_file(entry.path()).await?;
                }
            }
        }

        let next_id = segments.last_key_value().map_or(1, |(id, _)| id + 1);
        let (segment, file) = Self::create_segment(&fs, &dir, next_id).await?;
        segments.insert(next_id, segment.clone());
        debug!(
            recovered = segments.len() - 1,
            active = next_id,
            "opened blob store"
        );

        Ok(Self {
            fs,
            dir,
            config,
            active: tokio::sync::Mutex::new(ActiveSegment {
                segment,
                file,
                filepos: SEGMENT_HEADER_SIZE as u64,
            }),
            segments: RwLock::new(segments),
            retired: Mutex::new(Vec::new()),
        })
    }

    async fn open_segment(fs: &F, path: &Path, id: u64) -> VaultResult<Segment<F>> {
        let mut file = fs.open(path).await?;
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact_at(&mut buf, 0).await?;
        let header = SegmentHeader::decode(&buf)?;
        if header.segment() != id {
            return Err(VaultError::Corruption(format!(
                "segment file {path:?} carries id {}",
                header.segment()
            )));
        }
        Ok(Segment::new(id, path.to_path_buf(), file, true))
    }

    async fn create_segment(
        fs: &F,
        dir: &Path,
        id: u64,
    ) -> VaultResult<(Arc<Segment<F>>, F::File)> {
        let path = dir.join(segment_filename(id));
        let mut file = fs.create(&path).await?;
        file.write_all_at(SegmentHeader::new(id).as_bytes(), 0).await?;
        file.sync_all().await?;
        let reader = fs.open(&path).await?;
        trace!(?path, "created blob segment");
        Ok((Arc::new(Segment::new(id, path, reader, false)), file))
    }

    /// Appends `data` as a new region and returns its location.
    pub async fn append(&self, data: &[u8]) -> VaultResult<LocationRef> {
        let len = u32::try_from(data.len()).map_err(|_| {
            VaultError::ArgumentError(format!(
                "Payload of {:?} exceeds the maximum region size",
                ByteSize(data.len() as u64)
            ))
        })?;

        let mut buf = BytesMut::with_capacity(REGION_PREFIX_SIZE + data.len());
        buf.put_slice(RegionPrefix::new(data).as_bytes());
        buf.put_slice(data);

        let mut active = self.active.lock().await;
        let header_size = SEGMENT_HEADER_SIZE as u64;
        if active.filepos > header_size
            && active.filepos + buf.len() as u64 > self.config.segment_target_size
        {
            self.rotate(&mut active).await?;
        }

        let offset = active.filepos;
        active.file.write_all_at(&buf, offset).await?;
        active.filepos += buf.len() as u64;

        let location = LocationRef {
            segment: active.segment.id,
            offset,
            len,
        };
        active.segment.mark_live(&location);
        Ok(location)
    }

    async fn rotate(&self, active: &mut ActiveSegment<F>) -> VaultResult<()> {
        active.file.sync_all().await?;
        let next_id = active.segment.id + 1;
        let (segment, file) = Self::create_segment(&self.fs, &self.dir, next_id).await?;
        self.segments.write().insert(next_id, segment.clone());

        let sealed = mem::replace(&mut active.segment, segment);
        sealed.sealed.store(true, Ordering::SeqCst);
        active.file = file;
        let size = mem::replace(&mut active.filepos, SEGMENT_HEADER_SIZE as u64);
        debug!(
            sealed = sealed.id,
            active = next_id,
            size = ?ByteSize(size),
            "rotated blob segment"
        );

        // Everything in the sealed segment may already be reclaimed
        self.unlink_if_dead(&sealed);
        Ok(())
    }

    /// Reads the payload of the region at `location`.
    ///
    /// Fails with [`VaultError::NotFound`] if the region was reclaimed or never existed, and
    /// with [`VaultError::Corruption`] if its checksum does not match.
    pub async fn read(&self, location: &LocationRef) -> VaultResult<Bytes> {
        // Holding the Arc pins the segment file until the read is done
        let segment = self.segments.read().get(&location.segment).cloned();
        let Some(segment) = segment else {
            return Err(VaultError::NotFound(format!("blob segment of {location}")));
        };
        if !segment.is_live(location) {
            return Err(VaultError::NotFound(format!("blob region {location}")));
        }

        let mut buf = vec![0u8; REGION_PREFIX_SIZE + location.len as usize];
        {
            let mut reader = segment.reader.lock().await;
            reader.read_exact_at(&mut buf, location.offset).await?;
        }

        let (prefix, data) = buf.split_at(REGION_PREFIX_SIZE);
        let prefix = RegionPrefix::decode(prefix.try_into().expect("split at the prefix size"));
        if prefix.len() != location.len || !prefix.is_valid_region(data) {
            return Err(VaultError::Corruption(format!(
                "blob region {location} failed checksum validation"
            )));
        }
        Ok(Bytes::from(buf).slice(REGION_PREFIX_SIZE..))
    }

    /// Marks the regions at `locations` as dead and removes segments that no longer hold any
    /// live region. Segments still pinned by a reader are retried on the next call.
    pub async fn reclaim(
        &self,
        locations: impl IntoIterator<Item = LocationRef>,
    ) -> VaultResult<ReclaimStats> {
        let mut stats = ReclaimStats::default();
        let mut touched = BTreeSet::new();
        for location in locations {
            let segment = self.segments.read().get(&location.segment).cloned();
            let Some(segment) = segment else {
                continue;
            };
            if segment.mark_dead(&location) {
                stats.regions += 1;
                stats.bytes += location.footprint();
                touched.insert(location.segment);
            }
        }

        for id in touched {
            let segment = self.segments.read().get(&id).cloned();
            if let Some(segment) = segment {
                self.unlink_if_dead(&segment);
            }
        }

        let (removed, pending) = self.sweep_retired().await?;
        stats.segments_removed = removed;
        stats.segments_pending = pending;
        if stats.regions > 0 || removed > 0 {
            debug!(
                regions = stats.regions,
                bytes = ?ByteSize(stats.bytes),
                segments_removed = removed,
                segments_pending = pending,
                "reclaimed blob regions"
            );
        }
        Ok(stats)
    }

    /// Moves a dead segment from the segment table to the retired list.
    fn unlink_if_dead(&self, segment: &Arc<Segment<F>>) {
        if !segment.is_dead() {
            return;
        }
        let unlinked = self.segments.write().remove(&segment.id);
        if let Some(unlinked) = unlinked {
            self.retired.lock().push(unlinked);
        }
    }

    /// Removes the files of retired segments that no reader holds anymore.
    /// Returns the number of removed and still pinned segments.
    async fn sweep_retired(&self) -> VaultResult<(usize, usize)> {
        let retired = mem::take(&mut *self.retired.lock());
        let mut pinned = Vec::new();
        let mut removed = 0;
        let mut result = Ok(());
        for segment in retired {
            if result.is_err() || Arc::strong_count(&segment) > 1 {
                pinned.push(segment);
                continue;
            }
            match self.fs.remove_file(&segment.path).await {
                Ok(()) => {
                    trace!(path = ?segment.path, "removed blob segment");
                    removed += 1;
                }
                Err(e) => {
                    pinned.push(segment);
                    result = Err(e);
                }
            }
        }
        let pending = pinned.len();
        self.retired.lock().extend(pinned);
        result?;
        Ok((removed, pending))
    }

    /// Marks the regions referenced by recovered headers as live.
    pub(crate) fn restore_live(
        &self,
        locations: impl IntoIterator<Item = LocationRef>,
    ) -> VaultResult<()> {
        let segments = self.segments.read();
        for location in locations {
            let Some(segment) = segments.get(&location.segment) else {
                return Err(VaultError::Corruption(format!(
                    "committed tile references missing blob segment {location}"
                )));
            };
            segment.mark_live(&location);
        }
        Ok(())
    }

    /// Removes every sealed segment without live regions. Returns the number of unlinked
    /// segments.
    pub(crate) async fn sweep_unreferenced(&self) -> VaultResult<usize> {
        let dead: Vec<_> = self
            .segments
            .read()
            .values()
            .filter(|segment| segment.is_dead())
            .cloned()
            .collect();
        for segment in &dead {
            self.unlink_if_dead(segment);
        }
        let count = dead.len();
        drop(dead);
        self.sweep_retired().await?;
        if count > 0 {
            info!(count, "removed unreferenced blob segments");
        }
        Ok(count)
    }

    /// Makes every appended region durable.
    pub async fn sync(&self) -> VaultResult<()> {
        let mut active = self.active.lock().await;
        active.file.sync_all().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(&self) -> VaultResult<()> {
        self.sync().await?;
        let (_, pending) = self.sweep_retired().await?;
        if pending > 0 {
            warn!(pending, "blob segments still pinned at shutdown");
        }
        Ok(())
    }

    pub fn stats(&self) -> BlobStats {
        let mut stats = BlobStats::default();
        for segment in self.segments.read().values() {
            stats.segments += 1;
            let live = segment.live.lock();
            stats.live_regions += live.len();
            stats.live_bytes += live.values().map(|&len| u64::from(len)).sum::<u64>();
        }
        stats.pending_removal = self.retired.lock().len();
        stats
    }
}

#[cfg(test)]
mod tests;

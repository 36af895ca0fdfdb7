use std::{
    collections::BTreeMap,
    fmt, io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::RwLock;

use crate::fio::{FioDirEntry, FioFS, FioFile};

type SharedData = Arc<RwLock<Vec<u8>>>;

/// A handle into a [`VirtualFileSystem`] file. Every handle has its own cursor, but
/// all handles share the same contents.
pub struct VirtualFile {
    data: SharedData,
    pos: usize,
}

impl VirtualFile {
    fn new(data: SharedData) -> Self {
        Self { data, pos: 0 }
    }
}

impl fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFile").field("pos", &self.pos).finish()
    }
}

#[async_trait]
impl FioFile for VirtualFile {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.write().await;
        let end_pos = self.pos + buf.len();
        if end_pos > data.len() {
            data.resize(end_pos, 0);
        }
        data[self.pos..end_pos].copy_from_slice(buf);
        self.pos = end_pos;
        Ok(buf.len())
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write(buf).await?;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.read().await;
        let start = self.pos;
        if data.len().saturating_sub(start) < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Unexpected end of file",
            ));
        }
        self.pos += buf.len();
        buf.copy_from_slice(&data[start..self.pos]);
        Ok(buf.len())
    }

    async fn sync_all(&mut self) -> io::Result<()> {
        // Nothing is buffered, the shared vector is the durable state
        Ok(())
    }

    async fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            io::SeekFrom::Start(offset) => Some(offset as usize),
            io::SeekFrom::End(offset) => {
                let len = self.data.read().await.len();
                len.checked_add_signed(offset as isize)
            }
            io::SeekFrom::Current(offset) => self.pos.checked_add_signed(offset as isize),
        };
        let Some(new_pos) = new_pos else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid seek input: Underflow",
            ));
        };
        self.pos = new_pos;
        Ok(self.pos as u64)
    }

    async fn size(&self) -> io::Result<u64> {
        let data = self.data.read().await;
        Ok(data.len() as u64)
    }
}

/// An in-memory file system. Clones share the same files, which lets tests "restart" a vault
/// by opening it again on a clone of the file system it was dropped with.
#[derive(Clone, Default)]
pub struct VirtualFileSystem {
    files: Arc<RwLock<BTreeMap<PathBuf, SharedData>>>,
}

impl fmt::Debug for VirtualFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFileSystem").finish_non_exhaustive()
    }
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Truncates the file at `path` to `len` bytes. Used to simulate torn writes.
    #[cfg(test)]
    pub(crate) async fn truncate(&self, path: &Path, len: usize) -> io::Result<()> {
        let path = Self::normalize(path);
        let files = self.files.read().await;
        let data = files
            .get(&path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "File not found"))?;
        data.write().await.truncate(len);
        Ok(())
    }

    fn normalize(path: impl AsRef<Path>) -> PathBuf {
        let mut components = Vec::new();

        for comp in path.as_ref().components() {
            match comp {
                Component::Prefix(_) => panic!(
                    "Path prefix in VFS is not supported! Got path {:?}.",
                    path.as_ref()
                ),
                Component::RootDir | Component::CurDir => {}
                Component::Normal(c) => components.push(c),
                Component::ParentDir => {
                    let old = components.pop();
                    debug_assert!(old.is_some(), "Parent directory navigation at root!");
                }
            }
        }

        let mut result = PathBuf::from("/");
        result.extend(components);
        result
    }
}

#[async_trait]
impl FioFS for VirtualFileSystem {
    type File = VirtualFile;

    async fn open(&self, path: &Path) -> io::Result<Self::File> {
        let path = Self::normalize(path);
        let files = self.files.read().await;
        let data = files
            .get(&path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "File not found"))?;

        Ok(VirtualFile::new(data.clone()))
    }

    async fn create(&self, path: &Path) -> io::Result<Self::File> {
        let path = Self::normalize(path);
        let mut files = self.files.write().await;
        let data = Arc::new(RwLock::new(Vec::new()));
        files.insert(path, data.clone());

        Ok(VirtualFile::new(data))
    }

    async fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        // Directories only exist implicitly, as prefixes of file paths
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        let path = Self::normalize(path);
        let mut files = self.files.write().await;
        match files.remove(&path) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "File not found")),
        }
    }

    async fn read_dir(
        &self,
        path: &Path,
    ) -> io::Result<BoxStream<'static, io::Result<FioDirEntry>>> {
        let search_path = Self::normalize(path);
        let mut prefix = search_path.to_string_lossy().into_owned();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        let files = self.files.read().await;
        let mut entries = BTreeMap::new();

        for file_path in files.keys() {
            let file_str = file_path.to_string_lossy();
            let Some(relative) = file_str.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let (name, is_dir) = match relative.find('/') {
                Some(idx) => (&relative[..idx], true),
                None => (relative, false),
            };
            let entry_path = PathBuf::from(&prefix).join(name);
            entries
                .entry(entry_path.clone())
                .or_insert(FioDirEntry {
                    path: entry_path,
                    is_dir,
                });
        }

        Ok(futures::stream::iter(entries.into_values().map(Ok)).boxed())
    }
}

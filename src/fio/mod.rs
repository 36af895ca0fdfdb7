//! # File I/O
//!
//! This module contains asynchronous abstractions over the file system, to allow testing of
//! implementations that require file-system I/O.

use std::{
    fmt::Debug,
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

mod tokio_fio;
mod virtual_fio;

use futures::stream::BoxStream;
pub use tokio_fio::*;
pub use virtual_fio::*;

#[derive(Debug, Clone)]
pub struct FioDirEntry {
    path: PathBuf,
    is_dir: bool,
}

impl FioDirEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }
}

#[async_trait]
pub trait FioFile: Debug + Send + Sync {
    /// Writes a buffer into this writer, returning how many bytes were written.
    ///
    /// This function will attempt to write the entire contents of `buf`, but
    /// the entire write might not succeed, or the write may also generate an
    /// error. Typically, a call to `write` represents one attempt to write to
    /// any wrapped object.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Attempts to write an entire buffer into this writer.
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Reads the exact number of bytes required to fill `buf`.
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    async fn sync_all(&mut self) -> io::Result<()>;

    async fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64>;

    async fn size(&self) -> io::Result<u64>;

    /// Writes all of `buf` at the absolute position `pos`.
    async fn write_all_at(&mut self, buf: &[u8], pos: u64) -> io::Result<()> {
        self.seek(io::SeekFrom::Start(pos)).await?;
        self.write_all(buf).await
    }

    /// Fills `buf` from the absolute position `pos`.
    async fn read_exact_at(&mut self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        self.seek(io::SeekFrom::Start(pos)).await?;
        self.read_exact(buf).await
    }
}

#[async_trait]
pub trait FioFS: Debug + Clone + Send + Sync + 'static {
    type File: FioFile + 'static;

    /// Opens an existing file for reading and writing.
    async fn open(&self, path: &Path) -> io::Result<Self::File>;

    /// Create a new [`Self::File`], returning the handle. Existing files are truncated.
    async fn create(&self, path: &Path) -> io::Result<Self::File>;

    /// Recursively creates a directory and all of its missing parents.
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Removes a file from the file system.
    async fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Reads the contents of a directory as an asynchronous stream of directory entries.
    async fn read_dir(
        &self,
        path: &Path,
    ) -> io::Result<BoxStream<'static, io::Result<FioDirEntry>>>;
}

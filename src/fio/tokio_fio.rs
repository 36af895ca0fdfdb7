use std::path::Path;

use async_trait::async_trait;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use tokio::io::{self, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::fio::{FioDirEntry, FioFS, FioFile};

#[derive(Debug)]
pub struct TokioFile(tokio::fs::File);

#[async_trait]
impl FioFile for TokioFile {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.0.write(buf).await?;
        // tokio buffers writes internally, flush so other handles observe them
        self.0.flush().await?;
        Ok(written)
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf).await?;
        self.0.flush().await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read_exact(buf).await
    }

    async fn sync_all(&mut self) -> io::Result<()> {
        self.0.sync_all().await
    }

    async fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.0.seek(pos).await
    }

    async fn size(&self) -> io::Result<u64> {
        let metadata = self.0.metadata().await?;
        Ok(metadata.len())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FioFS for TokioFileSystem {
    type File = TokioFile;

    async fn open(&self, path: &Path) -> io::Result<Self::File> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await?;
        Ok(TokioFile(file))
    }

    async fn create(&self, path: &Path) -> io::Result<Self::File> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(TokioFile(file))
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn read_dir(
        &self,
        path: &Path,
    ) -> io::Result<BoxStream<'static, io::Result<FioDirEntry>>> {
        let read_dir = tokio::fs::read_dir(path).await?;

        // Unfold the read_dir stream, trying to retrieve every entry within
        let stream = stream::unfold(read_dir, |mut rd| async move {
            match rd.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    match entry.file_type().await {
                        Ok(ft) => {
                            let res = Ok(FioDirEntry {
                                path,
                                is_dir: ft.is_dir(),
                            });
                            Some((res, rd)) // Successfully retrieved dir entry
                        }
                        Err(e) => Some((Err(e), rd)), // Failed to get file type
                    }
                }
                Ok(None) => None,             // End of stream
                Err(e) => Some((Err(e), rd)), // Error during iteration
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    #[tokio::test]
    async fn test_tokio_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = TokioFileSystem::new();
        let path = dir.path().join("nested").join("data.bin");

        fs.create_dir_all(path.parent().unwrap()).await.unwrap();
        let mut file = fs.create(&path).await.unwrap();
        file.write_all_at(b"tilevault", 0).await.unwrap();
        file.sync_all().await.unwrap();

        let mut reader = fs.open(&path).await.unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact_at(&mut buf, 4).await.unwrap();
        assert_eq!(&buf, b"vault");
        assert_eq!(reader.size().await.unwrap(), 9);

        let entries: Vec<_> = fs
            .read_dir(path.parent().unwrap())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_dir());

        fs.remove_file(&path).await.unwrap();
        assert!(fs.open(&path).await.is_err());
    }
}

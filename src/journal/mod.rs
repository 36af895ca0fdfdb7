//! # Journal
//!
//! The durable log of the vault. Every edit is framed with its length and a crc64 checksum and
//! appended to the current `JOURNAL-{filenum}` file; an edit that was synced survives a crash.
//!
//! The journal records three things:
//! - The transaction id limit. Ids are only handed out below a journaled limit, so a restarted
//!   vault resumes at the limit and never reuses an id.
//! - Commit records, appended before the transaction becomes visible.
//! - Prune watermarks, appended before any pruned region is reclaimed.
//!
//! Once the file grew large enough, the live state is written as a snapshot into a new file
//! and the old one is removed.

use std::{
    io,
    path::{Path, PathBuf},
};

use bincode::Options as BincodeOptions;
use bytes::{BufMut, BytesMut};
use futures::TryStreamExt;
use itertools::Itertools;
use tracing::instrument;
use zerocopy::IntoBytes;

use crate::{
    base::{ByteSize, HexU64, VaultError, VaultResult, bincode_options},
    config::JournalConfig,
    fio::{FioFS, FioFile},
    txn::TxnId,
};

mod format;

pub(crate) use format::*;

/// Manages reads and writes to the journal of a vault.
#[derive(Debug)]
pub(crate) struct Journal<F: FioFS> {
    /// The path to the directory the journal files are in.
    dir: PathBuf,

    /// The file system this journal uses.
    fs: F,

    /// A scratch buffer that is used for encoding and passed to FS writes.
    #[debug("BytesMut(len={},cap={})", scratch.len(), scratch.capacity())]
    scratch: BytesMut,

    /// File handle to the current journal file.
    current_file: F::File,
    current_path: PathBuf,
    filenum: u64,
    /// Write offset in the current journal file.
    filepos: u64,
    /// The size of the current journal file after its snapshot was written.
    initial_file_size: u64,

    /// Every id handed out so far is below this limit.
    txn_limit: TxnId,

    /// Set when the tail of the current file could not be read back.
    needs_rewrite: bool,

    /// This is `true`, when [`shutdown`] was called.
    ///
    /// [`shutdown`]: Self::shutdown
    is_shutdown: bool,

    config: JournalConfig,
}

impl<F: FioFS> Journal<F> {
    /// Opens the journal in `dir`, returning it together with every edit that was read back, in
    /// the order they were written.
    #[instrument(skip_all, level = "info")]
    pub(crate) async fn open(
        fs: F,
        dir: PathBuf,
        config: JournalConfig,
    ) -> VaultResult<(Self, Vec<JournalEditV1>)> {
        info!("opening journal at {:?}", dir);
        fs.create_dir_all(&dir).await?;

        let entries: Vec<_> = fs
            .read_dir(&dir)
            .await?
            .try_filter(|e| futures::future::ready(!e.is_dir()))
            .try_collect()
            .await?;

        let mut candidates = Vec::new();
        for entry in entries {
            let path = entry.path().to_path_buf();
            match Self::read_header(&fs, &path).await {
                Ok((filenum, file)) => candidates.push((filenum, path, file)),
                Err(e) => warn!(?path, "skipping file with unreadable journal header: {e}"),
            }
        }
        let mut candidates = candidates
            .into_iter()
            .sorted_by_key(|(filenum, _, _)| *filenum)
            .collect_vec();

        let mut scratch = BytesMut::with_capacity(4096);
        let mut chosen = None;
        // The newest file whose snapshot can be read back is authoritative
        while let Some((filenum, path, mut file)) = candidates.pop() {
            let size = file.size().await?;
            debug!(filenum, size = ?ByteSize(size), ?path, "reading journal file");
            let mut replay = Replay::default();
            let mut filepos = JOURNAL_HEADER_SIZE as u64;
            while filepos < size {
                match Self::read_framed_edit(&mut scratch, &mut file, filepos, size).await {
                    Ok((edit, bytes_read)) => {
                        trace!("got edit from journal: {:?}", edit);
                        filepos += bytes_read;
                        replay.edits.push(edit.into_latest());
                    }
                    Err(e) => {
                        warn!(
                            ?path, filepos = ?HexU64(filepos), size = ?ByteSize(size),
                            "could not read journal edit: {e}, continuing with the edits before"
                        );
                        replay.torn = true;
                        break;
                    }
                }
            }
            if replay.edits.is_empty() {
                warn!(?path, "journal file holds no readable snapshot, trying an older one");
                continue;
            }
            chosen = Some((filenum, path, file, filepos, replay));
            break;
        }

        // Older files are superseded by the chosen one, newer ones are unreadable
        let chosen_path = chosen.as_ref().map(|(_, path, _, _, _)| path.clone());
        let stale: Vec<_> = fs
            .read_dir(&dir)
            .await?
            .try_filter(|e| futures::future::ready(!e.is_dir()))
            .try_collect()
            .await?;
        for entry in stale {
            if Some(entry.path()) != chosen_path.as_deref() {
                debug!(path = ?entry.path(), "removing stale journal file");
                fs.remove_file(entry.path()).await?;
            }
        }

        let Some((filenum, path, file, filepos, replay)) = chosen else {
            info!("no journal file found, creating new file");
            let journal = Self::create(fs, dir, config, scratch, 1, TxnId::FIRST).await?;
            let edit = JournalEditV1 {
                txn_limit: Some(TxnId::FIRST),
                ..Default::default()
            };
            return Ok((journal, vec![edit]));
        };

        let txn_limit = replay
            .edits
            .iter()
            .filter_map(|edit| edit.txn_limit)
            .last()
            .ok_or_else(|| {
                VaultError::Corruption(format!("journal file {path:?} has no transaction limit"))
            })?;
        info!(
            filenum,
            edits = replay.edits.len(),
            txn_limit = txn_limit.get(),
            size = ?ByteSize(filepos),
            "finished reading journal file",
        );

        let journal = Self {
            dir,
            fs,
            scratch,
            current_file: file,
            current_path: path,
            filenum,
            filepos,
            initial_file_size: filepos,
            txn_limit,
            needs_rewrite: replay.torn,
            is_shutdown: false,
            config,
        };
        Ok((journal, replay.edits))
    }

    async fn read_header(fs: &F, path: &Path) -> VaultResult<(u64, F::File)> {
        let mut file = fs.open(path).await?;
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        file.read_exact_at(&mut buf, 0).await?;
        let header = JournalHeader::decode(&buf)?;
        if path.file_name() != Some(journal_filename(header.filenum()).as_os_str()) {
            return Err(VaultError::Corruption(format!(
                "journal file {path:?} carries file number {}",
                header.filenum()
            )));
        }
        Ok((header.filenum(), file))
    }

    /// Creates the journal file `filenum` holding a snapshot with `txn_limit` and no commits.
    async fn create(
        fs: F,
        dir: PathBuf,
        config: JournalConfig,
        mut scratch: BytesMut,
        filenum: u64,
        txn_limit: TxnId,
    ) -> VaultResult<Self> {
        let edit = JournalEdit::V1(JournalEditV1 {
            txn_limit: Some(txn_limit),
            ..Default::default()
        });
        let path = dir.join(journal_filename(filenum));
        let mut file = fs.create(&path).await?;
        let filepos = Self::write_to_file(&mut file, &mut scratch, filenum, &edit).await?;
        file.sync_all().await?;
        Ok(Self {
            dir,
            fs,
            scratch,
            current_file: file,
            current_path: path,
            filenum,
            filepos,
            initial_file_size: filepos,
            txn_limit,
            needs_rewrite: false,
            is_shutdown: false,
            config,
        })
    }

    /// Writes the header and `initial_edit` into a fresh file. Does not sync, the caller is
    /// responsible. Returns the number of bytes written.
    async fn write_to_file(
        file: &mut F::File,
        scratch: &mut BytesMut,
        filenum: u64,
        initial_edit: &JournalEdit,
    ) -> VaultResult<u64> {
        debug!(filenum, "writing journal to new file");
        file.write_all_at(JournalHeader::new(filenum).as_bytes(), 0)
            .await?;
        let written =
            Self::write_framed_edit(initial_edit, scratch, file, JOURNAL_HEADER_SIZE as u64)
                .await?;
        Ok(JOURNAL_HEADER_SIZE as u64 + written)
    }

    /// Writes a new framed edit into a file. Returns the number of bytes written.
    #[instrument(skip(edit, scratch, file), level = "trace")]
    async fn write_framed_edit(
        edit: &JournalEdit,
        scratch: &mut BytesMut,
        file: &mut F::File,
        filepos: u64,
    ) -> VaultResult<u64> {
        scratch.clear();

        // reserve space for the record prefix
        scratch.put_bytes(0, JOURNAL_RECORD_PREFIX_SIZE);
        bincode_options().serialize_into((&mut *scratch).writer(), edit)?;

        let prefix = JournalRecordPrefix::new(&scratch[JOURNAL_RECORD_PREFIX_SIZE..]);
        scratch[..JOURNAL_RECORD_PREFIX_SIZE].copy_from_slice(prefix.as_bytes());
        debug_assert!(prefix.is_valid_record(&scratch[JOURNAL_RECORD_PREFIX_SIZE..]));

        file.write_all_at(&scratch[..], filepos).await?;
        Ok(scratch.len() as u64)
    }

    #[instrument(skip(scratch, file), level = "trace")]
    async fn read_framed_edit(
        scratch: &mut BytesMut,
        file: &mut F::File,
        filepos: u64,
        size: u64,
    ) -> VaultResult<(JournalEdit, u64)> {
        let prefix_size = JOURNAL_RECORD_PREFIX_SIZE as u64;

        scratch.clear();
        scratch.resize(JOURNAL_RECORD_PREFIX_SIZE, 0);
        file.read_exact_at(&mut scratch[..], filepos).await?;
        let prefix = JournalRecordPrefix::decode(
            scratch[..].try_into().expect("scratch holds exactly the prefix"),
        );
        trace!(
            data_len = prefix.data_len(),
            checksum = ?HexU64(prefix.checksum()),
            "read and decoded journal record prefix"
        );

        let record_size = prefix_size + u64::from(prefix.data_len());
        if filepos + record_size > size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "journal record extends past the end of the file",
            )
            .into());
        }

        scratch.clear();
        scratch.resize(prefix.data_len() as usize, 0);
        file.read_exact_at(&mut scratch[..], filepos + prefix_size)
            .await?;
        if !prefix.is_valid_record(&scratch[..]) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "journal record checksum mismatch: potential corruption",
            )
            .into());
        }

        let edit: JournalEdit = bincode_options().deserialize(&scratch[..])?;
        Ok((edit, record_size))
    }

    async fn append_framed_edit(&mut self, edit: JournalEditV1) -> VaultResult<()> {
        assert!(!self.is_shutdown, "journal has been shut down");
        let edit = JournalEdit::V1(edit);
        let written = Self::write_framed_edit(
            &edit,
            &mut self.scratch,
            &mut self.current_file,
            self.filepos,
        )
        .await?;
        self.filepos += written;
        self.current_file.sync_all().await?;
        Ok(())
    }

    pub(crate) fn txn_limit(&self) -> TxnId {
        self.txn_limit
    }

    /// Makes sure `next` lies below the journaled id limit, extending the limit if needed.
    /// At the end of the id space the limit stays put and allocation fails on its own.
    pub(crate) async fn reserve_txn_ids(&mut self, next: TxnId) -> VaultResult<()> {
        if next < self.txn_limit {
            return Ok(());
        }
        let raw_limit = next.get().saturating_add(self.config.txn_limit_step.max(1));
        let new_limit = TxnId::new(raw_limit).unwrap_or(TxnId::MAX);
        if new_limit <= self.txn_limit {
            return Ok(());
        }
        self.append_framed_edit(JournalEditV1 {
            txn_limit: Some(new_limit),
            ..Default::default()
        })
        .await?;
        trace!(old = %self.txn_limit, new = %new_limit, "raised transaction id limit");
        self.txn_limit = new_limit;
        Ok(())
    }

    /// Durably records a committed transaction.
    pub(crate) async fn append_commit(&mut self, record: CommitRecord) -> VaultResult<()> {
        self.append_framed_edit(JournalEditV1 {
            commits: Some(vec![record]),
            ..Default::default()
        })
        .await
    }

    /// Durably records that shadowed versions up to `watermark` were pruned.
    pub(crate) async fn append_prune(&mut self, watermark: TxnId) -> VaultResult<()> {
        self.append_framed_edit(JournalEditV1 {
            prune_watermark: Some(watermark),
            ..Default::default()
        })
        .await
    }

    pub(crate) fn should_rotate(&self) -> bool {
        let threshold = std::cmp::max(
            self.initial_file_size * self.config.growth_factor,
            self.config.growth_baseline,
        );
        self.needs_rewrite || self.filepos > threshold
    }

    /// Writes the live state into a new journal file and removes the current one.
    #[instrument(skip_all, level = "debug", fields(filenum = self.filenum))]
    pub(crate) async fn rotate(&mut self, commits: Vec<CommitRecord>) -> VaultResult<()> {
        assert!(!self.is_shutdown, "journal has been shut down");
        let filenum = self.filenum + 1;
        let path = self.dir.join(journal_filename(filenum));
        let commit_count = commits.len();
        let snapshot = JournalEdit::V1(JournalEditV1 {
            txn_limit: Some(self.txn_limit),
            commits: Some(commits),
            prune_watermark: None,
        });

        let mut file = self.fs.create(&path).await?;
        let filepos = Self::write_to_file(&mut file, &mut self.scratch, filenum, &snapshot).await?;
        file.sync_all().await?;

        let old_path = std::mem::replace(&mut self.current_path, path);
        self.current_file = file;
        self.filenum = filenum;
        self.filepos = filepos;
        self.initial_file_size = filepos;
        self.needs_rewrite = false;
        self.fs.remove_file(&old_path).await?;

        info!(
            filenum,
            commits = commit_count,
            size = ?ByteSize(filepos),
            "rotated journal file"
        );
        Ok(())
    }

    /// Tightens the id limit down to `next` and marks the journal as cleanly shut down.
    pub(crate) async fn shutdown(&mut self, next: TxnId) -> VaultResult<()> {
        assert!(!self.is_shutdown, "journal has been shut down");
        let limit = next.min(self.txn_limit);
        self.append_framed_edit(JournalEditV1 {
            txn_limit: Some(limit),
            ..Default::default()
        })
        .await?;
        self.txn_limit = limit;
        self.is_shutdown = true;
        info!(txn_limit = limit.get(), "journal shut down cleanly");
        Ok(())
    }
}

impl<F: FioFS> Drop for Journal<F> {
    fn drop(&mut self) {
        if !self.is_shutdown {
            error!(
                path = ?self.current_path,
                "journal dropped without shutdown, the next open recovers from the last synced edit"
            );
        }
    }
}

#[derive(Debug, Default)]
struct Replay {
    edits: Vec<JournalEditV1>,
    /// The file ended in an edit that could not be read.
    torn: bool,
}

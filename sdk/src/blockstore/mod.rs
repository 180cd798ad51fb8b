//! Content-addressed block store.
//!
//! Files are split into fixed-size blocks identified by the base64 SHA-256 of their
//! content. Every distinct block is stored once inside a block volume. A file list
//! volume per session records the files, the blocks they consist of and a metadata
//! block for each entry. Any single file can be restored without reading the rest of
//! the store, using a persisted index from block id to volume.

mod cache;
mod index;
mod restore;
mod sidecar;
mod writer;

pub use {
    cache::{VolumeBlocks, VolumeCache},
    index::{BlockIndex, fingerprint},
    restore::{BlockRestoreOptions, BlockRestoreSummary},
    sidecar::{SidecarReport, read_sidecar},
    writer::{BlockBackupOptions, BlockBackupSummary},
};

use {
    crate::{
        backend::{Backend, RemoteFile},
        crypto::{Encryptor, HashingWriter},
        envelope,
        rules::Rules,
        tarfile::TarReader,
    },
    anyhow::{Context as _, Result},
    fs_err::File,
    heddle_protocol::{
        DateTimeUtc,
        blockstore::{encode_hash, member_name_to_id},
        naming::{Encoding, NameKind, NameStyle, ParsedName},
        verification::SIDECAR_SUFFIX,
    },
    sha2::Sha256,
    std::{
        collections::HashMap,
        io::{BufReader, BufWriter},
        path::Path,
        sync::Arc,
    },
    tempfile::{NamedTempFile, TempDir},
    tracing::debug,
};

/// Default size of content blocks.
pub const DEFAULT_BLOCKSIZE: u64 = 100 * 1024;

/// Name of the verification sidecar written next to the volumes.
#[must_use]
#[inline]
pub fn sidecar_name() -> String {
    format!("duplicity{SIDECAR_SUFFIX}")
}

/// A stored file: its name, the standard base64 SHA-256 of the stored bytes and their size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub hash: String,
    pub size: u64,
}

/// Remote side of a block store.
pub struct BlockStore {
    backend: Box<dyn Backend>,
    encryptor: Option<Arc<dyn Encryptor>>,
    style: NameStyle,
    compression: bool,
    temp_dir: TempDir,
}

impl BlockStore {
    #[inline]
    pub fn new(
        backend: Box<dyn Backend>,
        encryptor: Option<Arc<dyn Encryptor>>,
        compact_names: bool,
        compression: bool,
    ) -> Result<Self> {
        Ok(Self {
            backend,
            encryptor,
            style: if compact_names {
                NameStyle::Compact
            } else {
                NameStyle::Verbose
            },
            compression,
            temp_dir: TempDir::new()?,
        })
    }

    #[must_use]
    #[inline]
    pub fn location(&self) -> String {
        self.backend.location()
    }

    fn temp_file(&self) -> Result<NamedTempFile> {
        Ok(NamedTempFile::new_in(self.temp_dir.path())?)
    }

    fn name(&self, kind: NameKind) -> String {
        let encoding = if self.encryptor.is_some() {
            Encoding::Encrypted
        } else if self.compression {
            Encoding::Gzip
        } else {
            Encoding::Plain
        };
        ParsedName::new(kind, encoding, self.style).generate()
    }

    /// Seals the plain file and stores it under the name generated for `kind`.
    fn put(&self, kind: NameKind, plain: &Path) -> Result<StoredFile> {
        let name = self.name(kind);
        let stored = self.temp_file()?;
        let mut writer = HashingWriter::<_, Sha256>::new(BufWriter::new(stored.reopen()?));
        let encoding = ParsedName::parse(&name).map_or(Encoding::Plain, |parsed| parsed.encoding);
        envelope::seal(
            encoding,
            self.encryptor.as_deref(),
            &mut BufReader::new(File::open(plain)?),
            &mut writer,
        )?;
        let (_, digest, size) = writer.finish()?;
        debug!(name, size, "storing");
        self.backend.put(stored.path(), &name)?;
        Ok(StoredFile {
            name,
            hash: encode_hash(&digest),
            size,
        })
    }

    /// Downloads a file without opening its envelope.
    fn get_raw(&self, name: &str) -> Result<NamedTempFile> {
        let stored = self.temp_file()?;
        self.backend.get(name, stored.path())?;
        Ok(stored)
    }

    /// Downloads a file and returns its plain content.
    fn get(&self, name: &str) -> Result<NamedTempFile> {
        let stored = self.get_raw(name)?;
        let encoding = ParsedName::parse(name).map_or(Encoding::Plain, |parsed| parsed.encoding);
        let plain = self.temp_file()?;
        envelope::open(
            encoding,
            self.encryptor.as_deref(),
            &mut BufReader::new(File::open(stored.path())?),
            &mut BufWriter::new(plain.reopen()?),
        )
        .with_context(|| format!("failed to read {name}"))?;
        Ok(plain)
    }

    /// Block volumes currently in the store.
    #[inline]
    pub fn block_volumes(&self) -> Result<Vec<RemoteFile>> {
        let mut volumes: Vec<_> = self
            .backend
            .list()?
            .into_iter()
            .filter(|file| {
                ParsedName::parse(&file.name)
                    .is_some_and(|parsed| matches!(parsed.kind, NameKind::BlockVolume { .. }))
            })
            .collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    /// File lists with their session times, oldest first.
    #[inline]
    pub fn file_lists(&self) -> Result<Vec<(DateTimeUtc, String)>> {
        let mut lists: Vec<_> = self
            .backend
            .list()?
            .into_iter()
            .filter_map(|file| {
                let NameKind::FileList { time } = ParsedName::parse(&file.name)?.kind else {
                    return None;
                };
                Some((time, file.name))
            })
            .collect();
        lists.sort();
        Ok(lists)
    }

    /// Stores the tree at `source` as a new session: new blocks go into block volumes,
    /// the file list records every entry, and the sidecar and index are updated.
    #[inline]
    pub fn backup(
        &self,
        source: &Path,
        rules: Rules,
        index: &BlockIndex,
        cache: &VolumeCache,
        options: BlockBackupOptions,
    ) -> Result<BlockBackupSummary> {
        writer::backup(self, source, rules, index, cache, options)
    }

    /// Restores the files of the newest file list into `output`.
    ///
    /// Per-file failures are logged and counted in the summary. The index is rebuilt
    /// when it does not match the stored volumes, and at most once more when a block
    /// cannot be found.
    #[inline]
    pub fn restore_blocks(
        &self,
        output: &Path,
        index: &BlockIndex,
        options: &BlockRestoreOptions,
    ) -> Result<BlockRestoreSummary> {
        restore::restore(self, output, index, options)
    }

    /// Checks that every file listed in the sidecar exists with the recorded size and hash.
    #[inline]
    pub fn verify_sidecar(&self) -> Result<SidecarReport> {
        sidecar::verify(self)
    }

    /// Reads all blocks of a block volume.
    #[inline]
    pub fn read_block_volume(&self, name: &str) -> Result<VolumeBlocks> {
        let plain = self.get(name)?;
        let reader = TarReader::new(BufReader::new(File::from_parts(
            plain.reopen()?,
            plain.path(),
        )));
        let mut blocks = HashMap::new();
        for member in reader {
            let member = member.with_context(|| format!("invalid block volume {name}"))?;
            blocks.insert(member_name_to_id(&member.name), member.data);
        }
        Ok(VolumeBlocks::new(blocks))
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    #![expect(clippy::unwrap_used, reason = "test")]

    use {
        super::*,
        crate::{backend::open_backend, crypto::Cipher, retry::RetryPolicy},
        heddle_protocol::credentials::EncryptionKey,
        std::path::PathBuf,
    };

    pub(crate) fn store(dir: &Path, encrypted: bool) -> (PathBuf, BlockStore) {
        let target = dir.join("store");
        let encryptor: Option<Arc<dyn Encryptor>> =
            encrypted.then(|| Arc::new(Cipher::new(&EncryptionKey::generate().unwrap())) as _);
        let store = BlockStore::new(
            open_backend(&target.display().to_string(), RetryPolicy::default()).unwrap(),
            encryptor,
            false,
            true,
        )
        .unwrap();
        (target, store)
    }
}

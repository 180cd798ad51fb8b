use {
    super::{BlockIndex, BlockStore, VolumeCache},
    crate::crypto::HashingWriter,
    anyhow::{Context as _, Result, bail, ensure},
    filetime::{FileTime, set_file_mtime},
    fs_err::{File, OpenOptions, create_dir_all, set_permissions},
    globset::{Glob, GlobMatcher},
    heddle_protocol::{
        Error, Index,
        blockstore::{
            ArchiveOptions, BLOCK_HASH_LEN, FILELIST_MEMBER, FileListEntry, FileListEntryKind,
            FileMetadata, MANIFEST_MEMBER, encode_hash,
        },
    },
    serde::de::{self, DeserializeSeed, Deserializer, SeqAccess, Visitor},
    sha2::{Digest, Sha256},
    std::{
        fmt,
        fs::Permissions,
        io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
        os::unix::fs::{PermissionsExt, lchown},
        path::{Path, PathBuf},
    },
    tracing::{debug, info, instrument, warn},
};

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

#[derive(Debug, Clone)]
pub struct BlockRestoreOptions {
    /// Glob over file list paths; everything if `None`.
    pub scope: Option<String>,
    /// Memory budget for decoded volumes.
    pub max_cache_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockRestoreSummary {
    pub restored: u64,
    pub folders: u64,
    /// Symlinks are reported, not restored.
    pub symlinks: u64,
    pub errors: u64,
}

/// State shared by the restores of one run.
struct Restorer<'a> {
    store: &'a BlockStore,
    index: &'a BlockIndex,
    cache: &'a VolumeCache,
    options: ArchiveOptions,
    output: &'a Path,
    scope: Option<&'a GlobMatcher>,
    index_rebuilt: bool,
    summary: BlockRestoreSummary,
}

impl Restorer<'_> {
    fn in_scope(&self, path: &str) -> bool {
        self.scope
            .is_none_or(|scope| scope.is_match(path.trim_end_matches('/')))
    }

    fn target(&self, path: &str) -> Result<PathBuf> {
        let index = Index::from_relative_str(path.trim_start_matches('/'))?;
        Ok(index.to_path(self.output))
    }

    fn handle(&mut self, entry: FileListEntry) -> Result<()> {
        if !self.in_scope(&entry.path) {
            return Ok(());
        }
        match entry.kind {
            FileListEntryKind::File => self.restore_file_logged(&entry)?,
            FileListEntryKind::Folder => {
                create_dir_all(self.target(&entry.path)?)?;
                self.summary.folders = self.summary.folders.saturating_add(1);
            }
            FileListEntryKind::Symlink => {
                info!(path = %entry.path, "symlink existed at this path, not restored");
                self.summary.symlinks = self.summary.symlinks.saturating_add(1);
            }
            FileListEntryKind::Other => {
                debug!(path = %entry.path, "skipping entry of unknown type");
            }
        }
        Ok(())
    }

    /// Restores one file. Per-file failures are logged and counted; only a failure to
    /// rebuild the index is returned.
    fn restore_file_logged(&mut self, entry: &FileListEntry) -> Result<()> {
        let mut result = self.restore_file(entry);
        if let Err(err) = &result
            && is_block_not_found(err)
            && !self.index_rebuilt
        {
            warn!(path = %entry.path, error = %err, "block not found, rebuilding block index");
            self.index_rebuilt = true;
            let volumes = self.store.block_volumes()?;
            self.index.rebuild(self.store, &volumes, self.cache)?;
            result = self.restore_file(entry);
        }
        match result {
            Ok(()) => {
                debug!(path = %entry.path, "restored");
                self.summary.restored = self.summary.restored.saturating_add(1);
            }
            Err(err) => {
                warn!(path = %entry.path, error = format!("{err:#}"), "failed to restore file");
                self.summary.errors = self.summary.errors.saturating_add(1);
            }
        }
        Ok(())
    }

    fn restore_file(&self, entry: &FileListEntry) -> Result<()> {
        let target = self.target(&entry.path)?;
        if let Some(parent) = target.parent() {
            create_dir_all(parent)?;
        }
        let size = u64::try_from(entry.size).context("negative file size")?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)?;
        if entry.blocklists.is_empty() {
            if size != 0 {
                let hash = entry.hash.as_deref().context("file entry without hash")?;
                file.write_all(&self.block(hash)?)?;
            }
        } else {
            let hash_len = usize::try_from(BLOCK_HASH_LEN)?;
            for (list_index, list_id) in (0_u64..).zip(&entry.blocklists) {
                let hashes = self.block(list_id)?;
                ensure!(
                    hashes.len().checked_rem(hash_len) == Some(0),
                    "blocklist {list_id} has invalid length {}",
                    hashes.len()
                );
                for (block_index, hash) in (0_u64..).zip(hashes.chunks(hash_len)) {
                    let data = self.block(&encode_hash(hash))?;
                    file.seek(SeekFrom::Start(
                        self.options.block_offset(list_index, block_index),
                    ))?;
                    file.write_all(&data)?;
                }
            }
        }
        file.sync_all()?;
        drop(file);

        let actual_size = fs_err::metadata(&target)?.len();
        if actual_size != size {
            return Err(Error::Integrity(format!(
                "restored {} with size {actual_size}, expected {size}",
                entry.path
            ))
            .into());
        }
        let mut hasher = HashingWriter::<_, Sha256>::new(io::sink());
        io::copy(&mut BufReader::new(File::open(&target)?), &mut hasher)?;
        let (_, digest, _) = hasher.finish()?;
        let actual = encode_hash(&digest);
        let expected = entry.hash.as_deref().unwrap_or_default();
        if actual != expected {
            return Err(Error::Integrity(format!(
                "restored {} with hash {actual}, expected {expected}",
                entry.path
            ))
            .into());
        }
        if let Some(metahash) = &entry.metahash {
            self.apply_metadata(&target, metahash)?;
        }
        Ok(())
    }

    fn apply_metadata(&self, target: &Path, metahash: &str) -> Result<()> {
        let metadata: FileMetadata =
            serde_json::from_slice(&self.block(metahash)?).context("invalid metadata block")?;
        if let Some(mtime) = metadata.mtime_seconds()? {
            set_file_mtime(target, FileTime::from_unix_time(mtime, 0))?;
        }
        if let Some((uid, gid, perm)) = metadata.ownership()? {
            set_permissions(target, Permissions::from_mode(perm & 0o7777))?;
            if let Err(err) = lchown(target, Some(uid), Some(gid)) {
                debug!(path = %target.display(), error = %err, "failed to set owner");
            }
        }
        Ok(())
    }

    /// Content of a block, checked against its id.
    fn block(&self, id: &str) -> Result<Vec<u8>> {
        let volume = self.index.lookup(id)?;
        let blocks = self
            .cache
            .get_or_load(&volume, || self.store.read_block_volume(&volume))?;
        let Some(data) = blocks.get(id) else {
            return Err(Error::BlockNotFound(format!("block {id} is not in {volume}")).into());
        };
        let actual = encode_hash(&Sha256::digest(data));
        if actual != id {
            return Err(Error::Integrity(format!(
                "block {id} in {volume} has hash {actual}"
            ))
            .into());
        }
        Ok(data.to_vec())
    }
}

fn is_block_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::BlockNotFound(_)))
}

/// Feeds each element of a JSON array to a callback without collecting the array.
struct ForEachEntry<'a, 'r> {
    restorer: &'a mut Restorer<'r>,
    failure: &'a mut Option<anyhow::Error>,
}

impl<'de> DeserializeSeed<'de> for ForEachEntry<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ForEachEntry<'_, '_> {
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an array of file list entries")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(entry) = seq.next_element::<FileListEntry>()? {
            if let Err(err) = self.restorer.handle(entry) {
                *self.failure = Some(err);
                return Err(de::Error::custom("restore aborted"));
            }
        }
        Ok(())
    }
}

#[instrument(skip_all)]
pub(super) fn restore(
    store: &BlockStore,
    output: &Path,
    index: &BlockIndex,
    options: &BlockRestoreOptions,
) -> Result<BlockRestoreSummary> {
    let scope = options
        .scope
        .as_deref()
        .map(|pattern| {
            Glob::new(pattern)
                .map(|glob| glob.compile_matcher())
                .with_context(|| format!("invalid scope pattern {pattern:?}"))
        })
        .transpose()?;
    let Some((time, list_name)) = store.file_lists()?.pop() else {
        bail!("no file lists found in {}", store.location());
    };
    info!(name = %list_name, %time, "using newest file list");

    let volumes = store.block_volumes()?;
    let largest = volumes.iter().map(|file| file.size).max().unwrap_or(1);
    let cache = VolumeCache::with_budget(options.max_cache_bytes, largest);
    index.ensure_current(store, &cache)?;

    let list = store.get(&list_name)?;
    let mut archive = tar::Archive::new(BufReader::new(File::open(list.path())?));
    let mut archive_options = None;
    let mut restorer = None;
    for member in archive.entries()? {
        let member = member?;
        let name = member.path_bytes().into_owned();
        if name == MANIFEST_MEMBER.as_bytes() {
            let parsed: ArchiveOptions =
                serde_json::from_reader(member).context("invalid file list manifest")?;
            parsed.check_supported()?;
            archive_options = Some(parsed);
        } else if name == FILELIST_MEMBER.as_bytes() {
            let Some(options) = archive_options.take() else {
                bail!("file list {list_name} has no manifest before {FILELIST_MEMBER}");
            };
            let restorer = restorer.insert(Restorer {
                store,
                index,
                cache: &cache,
                options,
                output,
                scope: scope.as_ref(),
                index_rebuilt: false,
                summary: BlockRestoreSummary::default(),
            });
            stream_entries(member, restorer)?;
        }
    }
    let Some(restorer) = restorer else {
        bail!("file list {list_name} has no {FILELIST_MEMBER}");
    };
    info!(summary = ?restorer.summary, "block restore complete");
    Ok(restorer.summary)
}

fn stream_entries(member: impl Read, restorer: &mut Restorer<'_>) -> Result<()> {
    let mut reader = BufReader::new(member);
    if reader.fill_buf()?.starts_with(UTF8_BOM) {
        reader.consume(UTF8_BOM.len());
    }
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    let mut failure = None;
    let result = ForEachEntry {
        restorer,
        failure: &mut failure,
    }
    .deserialize(&mut deserializer);
    if let Some(err) = failure {
        return Err(err);
    }
    result.context("invalid file list")?;
    deserializer.end().context("invalid file list")?;
    Ok(())
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {
        super::*,
        crate::{
            blockstore::{BlockBackupOptions, BlockBackupSummary, test_util::store},
            rules::Rules,
        },
        fs_err::{read, write},
        std::os::unix::fs::symlink,
    };

    fn source(dir: &Path) -> PathBuf {
        let source = dir.join("source");
        create_dir_all(source.join("d")).unwrap();
        write(source.join("a"), b"hello").unwrap();
        let big: Vec<u8> = (0..1000_u32)
            .map(|i| u8::try_from(i % 251).unwrap())
            .collect();
        write(source.join("d/big"), big).unwrap();
        write(source.join("d/empty"), b"").unwrap();
        symlink("a", source.join("link")).unwrap();
        set_file_mtime(source.join("a"), FileTime::from_unix_time(1_500_000_000, 0)).unwrap();
        source
    }

    fn backup(
        store: &BlockStore,
        source: &Path,
        index: &BlockIndex,
        options: BlockBackupOptions,
    ) -> BlockBackupSummary {
        let cache = VolumeCache::with_budget(1_048_576, 1);
        store
            .backup(source, Rules::default(), index, &cache, options)
            .unwrap()
    }

    fn restore_options(scope: Option<&str>) -> BlockRestoreOptions {
        BlockRestoreOptions {
            scope: scope.map(Into::into),
            max_cache_bytes: 1_048_576,
        }
    }

    fn small_blocks() -> BlockBackupOptions {
        BlockBackupOptions {
            blocksize: 64,
            volume_size: 4096,
        }
    }

    fn roundtrip(encrypted: bool) {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());
        let (_, store) = store(dir.path(), encrypted);
        let index = BlockIndex::open(&dir.path().join("index")).unwrap();
        let summary = backup(&store, &source, &index, small_blocks());
        assert_eq!(summary.files, 3);
        assert_eq!(summary.folders, 1);
        assert_eq!(summary.symlinks, 1);
        assert_eq!(summary.errors, 0);
        assert!(summary.volumes > 1);

        let output = dir.path().join("output");
        let restored = store
            .restore_blocks(&output, &index, &restore_options(None))
            .unwrap();
        assert_eq!(
            restored,
            BlockRestoreSummary {
                restored: 3,
                folders: 1,
                symlinks: 1,
                errors: 0,
            }
        );
        assert_eq!(read(output.join("a")).unwrap(), b"hello");
        assert_eq!(
            read(output.join("d/big")).unwrap(),
            read(source.join("d/big")).unwrap()
        );
        assert!(read(output.join("d/empty")).unwrap().is_empty());
        assert!(!output.join("link").exists());
        let mtime = FileTime::from_last_modification_time(&fs_err::metadata(output.join("a")).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_500_000_000);
    }

    #[test]
    fn roundtrip_plain() {
        roundtrip(false);
    }

    #[test]
    fn roundtrip_encrypted() {
        roundtrip(true);
    }

    #[test]
    fn scope_selects_paths() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());
        let (_, store) = store(dir.path(), false);
        let index = BlockIndex::open(&dir.path().join("index")).unwrap();
        backup(&store, &source, &index, small_blocks());

        let output = dir.path().join("output");
        let restored = store
            .restore_blocks(&output, &index, &restore_options(Some("d/*")))
            .unwrap();
        assert_eq!(restored.restored, 2);
        assert_eq!(restored.symlinks, 0);
        assert!(!output.join("a").exists());
        assert!(output.join("d/big").exists());

        let err = store
            .restore_blocks(&output, &index, &restore_options(Some("[")))
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid scope pattern"));
    }

    #[test]
    fn index_is_rebuilt_when_stale() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());
        let (_, store) = store(dir.path(), false);
        let index = BlockIndex::open(&dir.path().join("index")).unwrap();
        backup(&store, &source, &index, BlockBackupOptions {
            blocksize: 64,
            volume_size: 1,
        });

        let id = encode_hash(&Sha256::digest(b"hello"));
        let holder = index.lookup(&id).unwrap();
        let volumes = store.block_volumes().unwrap();
        let other = volumes.iter().find(|file| file.name != holder).unwrap();
        index.insert(&id, &other.name).unwrap();
        index.set_fingerprint(&volumes).unwrap();

        let output = dir.path().join("output");
        let restored = store
            .restore_blocks(&output, &index, &restore_options(Some("a")))
            .unwrap();
        assert_eq!(restored.restored, 1);
        assert_eq!(restored.errors, 0);
        assert_eq!(read(output.join("a")).unwrap(), b"hello");
        assert_eq!(index.lookup(&id).unwrap(), holder);

        // A fresh index has no fingerprint and is built before restoring.
        let fresh = BlockIndex::open(&dir.path().join("fresh")).unwrap();
        let restored = store
            .restore_blocks(&dir.path().join("output2"), &fresh, &restore_options(None))
            .unwrap();
        assert_eq!(restored.restored, 3);
    }

    #[test]
    fn damaged_volume_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());
        let (target, store) = store(dir.path(), false);
        let index = BlockIndex::open(&dir.path().join("index")).unwrap();
        backup(&store, &source, &index, small_blocks());

        for volume in store.block_volumes().unwrap() {
            let garbage = vec![0_u8; usize::try_from(volume.size).unwrap()];
            write(target.join(&volume.name), garbage).unwrap();
        }
        let output = dir.path().join("output");
        let restored = store
            .restore_blocks(&output, &index, &restore_options(None))
            .unwrap();
        assert_eq!(restored.restored, 0);
        assert_eq!(restored.errors, 3);
        assert_eq!(restored.folders, 1);
    }

    #[test]
    fn empty_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (target, store) = store(dir.path(), false);
        create_dir_all(&target).unwrap();
        let index = BlockIndex::open(&dir.path().join("index")).unwrap();
        let err = store
            .restore_blocks(&dir.path().join("output"), &index, &restore_options(None))
            .unwrap_err();
        assert!(err.to_string().contains("no file lists"));
    }
}

use {
    super::{BlockIndex, BlockStore, DEFAULT_BLOCKSIZE, StoredFile, VolumeCache, sidecar},
    crate::{rules::Rules, tarfile::TarWriter, walk::TreeWalk},
    anyhow::{Context as _, Result},
    chrono::{TimeDelta, Utc},
    fs_err::File,
    heddle_protocol::{
        DateTimeUtc, Entry, EntryKind, Stat,
        blockstore::{
            ArchiveOptions, FILELIST_MEMBER, FileListEntry, FileListEntryKind,
            FileMetadata, MANIFEST_MEMBER, encode_hash, id_to_member_name,
        },
        naming::NameKind,
        time::whole_seconds,
        verification::{RemoteVolumeState, RemoteVolumeType, SidecarEntry},
    },
    sha2::{Digest, Sha256},
    std::{
        fs,
        io::{BufWriter, Read},
        path::Path,
    },
    tempfile::NamedTempFile,
    tracing::{debug, info, instrument, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBackupOptions {
    pub blocksize: u64,
    /// Target size of plain block volumes.
    pub volume_size: u64,
}

impl Default for BlockBackupOptions {
    #[inline]
    fn default() -> Self {
        Self {
            blocksize: DEFAULT_BLOCKSIZE,
            volume_size: 25_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockBackupSummary {
    pub files: u64,
    pub folders: u64,
    pub symlinks: u64,
    pub new_blocks: u64,
    pub reused_blocks: u64,
    pub volumes: u64,
    pub errors: u64,
}

struct OpenVolume {
    file: NamedTempFile,
    tar: TarWriter<BufWriter<fs::File>>,
    ids: Vec<String>,
}

/// Packs new blocks into size-bounded volumes and stores them.
struct VolumePacker<'a> {
    store: &'a BlockStore,
    index: &'a BlockIndex,
    volume_size: u64,
    current: Option<OpenVolume>,
    stored: Vec<StoredFile>,
    new_blocks: u64,
    reused_blocks: u64,
}

impl VolumePacker<'_> {
    /// Adds a block unless the store already has it.
    fn add(&mut self, id: &str, data: &[u8]) -> Result<()> {
        let pending = self
            .current
            .as_ref()
            .is_some_and(|volume| volume.ids.iter().any(|pending| pending == id));
        if pending || self.index.contains(id)? {
            self.reused_blocks = self.reused_blocks.saturating_add(1);
            return Ok(());
        }
        let volume = match &mut self.current {
            Some(volume) => volume,
            None => {
                let file = NamedTempFile::new_in(self.store.temp_dir.path())?;
                let tar = TarWriter::new(BufWriter::new(file.reopen()?));
                self.current.insert(OpenVolume {
                    file,
                    tar,
                    ids: Vec::new(),
                })
            }
        };
        volume.tar.append(
            &id_to_member_name(id),
            &EntryKind::Regular,
            &member_stat(0),
            data,
        )?;
        volume.ids.push(id.to_owned());
        self.new_blocks = self.new_blocks.saturating_add(1);
        if volume.tar.written() >= self.volume_size {
            self.close()?;
        }
        Ok(())
    }

    /// Stores the open volume, if any, and records its blocks in the index.
    fn close(&mut self) -> Result<()> {
        let Some(volume) = self.current.take() else {
            return Ok(());
        };
        volume
            .tar
            .finish()?
            .into_inner()
            .map_err(|err| err.into_error())?;
        let id = hex::encode(rand::random::<[u8; 16]>());
        let stored = self
            .store
            .put(NameKind::BlockVolume { id }, volume.file.path())?;
        info!(name = %stored.name, blocks = volume.ids.len(), "stored block volume");
        for id in &volume.ids {
            self.index.insert(id, &stored.name)?;
        }
        self.stored.push(stored);
        Ok(())
    }
}

fn member_stat(mtime: i64) -> Stat {
    Stat {
        mode: 0o644,
        uid: 0,
        gid: 0,
        mtime,
    }
}

fn block_id(data: &[u8]) -> String {
    encode_hash(&Sha256::digest(data))
}

fn sidecar_entry(stored: StoredFile, kind: RemoteVolumeType) -> SidecarEntry {
    SidecarEntry {
        name: stored.name,
        hash: Some(stored.hash),
        size: stored.size,
        state: RemoteVolumeState::Verified,
        kind,
    }
}

#[instrument(skip_all)]
pub(super) fn backup(
    store: &BlockStore,
    source: &Path,
    rules: Rules,
    index: &BlockIndex,
    cache: &VolumeCache,
    options: BlockBackupOptions,
) -> Result<BlockBackupSummary> {
    let archive_options = ArchiveOptions::new(options.blocksize);
    archive_options.check_supported()?;
    index.ensure_current(store, cache)?;

    let mut packer = VolumePacker {
        store,
        index,
        volume_size: options.volume_size,
        current: None,
        stored: Vec::new(),
        new_blocks: 0,
        reused_blocks: 0,
    };
    let mut summary = BlockBackupSummary::default();
    let mut entries = Vec::new();
    let mut walk = TreeWalk::new(source, rules)?;
    for entry in &mut walk {
        if entry.index.is_root() {
            continue;
        }
        let path = entry.index.to_relative_string();
        let listed = match &entry.kind {
            EntryKind::Directory => {
                summary.folders = summary.folders.saturating_add(1);
                list_entry(&mut packer, &entry, FileListEntryKind::Folder, format!("{path}/"))
            }
            EntryKind::Symlink(_) => {
                summary.symlinks = summary.symlinks.saturating_add(1);
                list_entry(&mut packer, &entry, FileListEntryKind::Symlink, path)
            }
            EntryKind::Regular => {
                let file_path = entry.index.to_path(source);
                store_file(&mut packer, &archive_options, &entry, &file_path, path)
                    .inspect(|_| summary.files = summary.files.saturating_add(1))
            }
            EntryKind::Fifo | EntryKind::Device(_) | EntryKind::Deleted => {
                debug!(path = %entry.index, kind = entry.kind.name(), "not stored in block store");
                continue;
            }
        };
        match listed {
            Ok(listed) => entries.push(listed),
            Err(err) => {
                warn!(path = %entry.index, error = format!("{err:#}"), "failed to store entry");
                summary.errors = summary.errors.saturating_add(1);
            }
        }
    }
    summary.errors = summary.errors.saturating_add(walk.errors());
    packer.close()?;
    summary.new_blocks = packer.new_blocks;
    summary.reused_blocks = packer.reused_blocks;
    summary.volumes = u64::try_from(packer.stored.len())?;

    let time = next_session_time(store)?;
    let list = write_file_list(store, time, archive_options, &entries)?;
    let mut sidecar_entries: Vec<_> = packer
        .stored
        .into_iter()
        .map(|stored| sidecar_entry(stored, RemoteVolumeType::Blocks))
        .collect();
    sidecar_entries.push(sidecar_entry(list, RemoteVolumeType::Files));
    sidecar::append(store, sidecar_entries)?;
    index.set_fingerprint(&store.block_volumes()?)?;
    info!(?summary, "block backup complete");
    Ok(summary)
}

fn next_session_time(store: &BlockStore) -> Result<DateTimeUtc> {
    let now = whole_seconds(Utc::now());
    Ok(store
        .file_lists()?
        .last()
        .and_then(|(newest, _)| newest.checked_add_signed(TimeDelta::seconds(1)))
        .map_or(now, |next| now.max(next)))
}

fn write_file_list(
    store: &BlockStore,
    time: DateTimeUtc,
    mut options: ArchiveOptions,
    entries: &[FileListEntry],
) -> Result<StoredFile> {
    options.created = Some(time.to_rfc3339());
    let file = NamedTempFile::new_in(store.temp_dir.path())?;
    let mut tar = TarWriter::new(BufWriter::new(file.reopen()?));
    let stat = member_stat(time.timestamp());
    tar.append(
        MANIFEST_MEMBER,
        &EntryKind::Regular,
        &stat,
        &serde_json::to_vec(&options)?,
    )?;
    tar.append(
        FILELIST_MEMBER,
        &EntryKind::Regular,
        &stat,
        &serde_json::to_vec(entries)?,
    )?;
    tar.finish()?.into_inner().map_err(|err| err.into_error())?;
    let stored = store.put(NameKind::FileList { time }, file.path())?;
    info!(name = %stored.name, entries = entries.len(), "stored file list");
    Ok(stored)
}

/// Stores the metadata block of an entry. Returns its id and size.
fn store_metadata(packer: &mut VolumePacker<'_>, entry: &Entry) -> Result<(String, u64)> {
    let metadata = FileMetadata {
        mtime: Some(entry.stat.mtime),
        core_last_write_time: None,
        uid_gid_perm: Some(format!(
            "{}-{}-{}",
            entry.stat.uid,
            entry.stat.gid,
            entry.stat.perms()
        )),
    };
    let data = serde_json::to_vec(&metadata)?;
    let id = block_id(&data);
    packer.add(&id, &data)?;
    Ok((id, u64::try_from(data.len())?))
}

fn list_entry(
    packer: &mut VolumePacker<'_>,
    entry: &Entry,
    kind: FileListEntryKind,
    path: String,
) -> Result<FileListEntry> {
    let (metahash, metasize) = store_metadata(packer, entry)?;
    Ok(FileListEntry {
        kind,
        path,
        hash: None,
        size: 0,
        blocklists: Vec::new(),
        metahash: Some(metahash),
        metasize: Some(metasize),
    })
}

fn store_file(
    packer: &mut VolumePacker<'_>,
    options: &ArchiveOptions,
    entry: &Entry,
    file_path: &Path,
    path: String,
) -> Result<FileListEntry> {
    let mut file = File::open(file_path)?;
    let mut file_hash = Sha256::new();
    let mut hashes = Vec::new();
    let mut size = 0_u64;
    loop {
        let mut block = Vec::new();
        (&mut file)
            .take(options.blocksize)
            .read_to_end(&mut block)
            .with_context(|| format!("failed to read {}", file_path.display()))?;
        if block.is_empty() {
            break;
        }
        file_hash.update(&block);
        size = size.saturating_add(u64::try_from(block.len())?);
        let digest = Sha256::digest(&block);
        packer.add(&encode_hash(&digest), &block)?;
        hashes.push(digest);
    }

    let mut blocklists = Vec::new();
    if hashes.len() > 1 {
        let per_list = usize::try_from(options.hashes_per_block())?;
        for list in hashes.chunks(per_list) {
            let data: Vec<u8> = list.iter().flat_map(|digest| digest.iter().copied()).collect();
            let id = block_id(&data);
            packer.add(&id, &data)?;
            blocklists.push(id);
        }
    }
    let (metahash, metasize) = store_metadata(packer, entry)?;
    Ok(FileListEntry {
        kind: FileListEntryKind::File,
        path,
        hash: Some(encode_hash(&file_hash.finalize())),
        size: i64::try_from(size)?,
        blocklists,
        metahash: Some(metahash),
        metasize: Some(metasize),
    })
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use {
        super::*,
        crate::blockstore::test_util::store,
        fs_err::{create_dir_all, write},
    };

    #[test]
    fn blocks_are_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        create_dir_all(&source).unwrap();
        write(source.join("a"), [7_u8; 300]).unwrap();
        write(source.join("b"), [7_u8; 300]).unwrap();
        let (_, store) = store(dir.path(), false);
        let index = BlockIndex::open(&dir.path().join("index")).unwrap();
        let cache = VolumeCache::with_budget(1_048_576, 1);
        let options = BlockBackupOptions {
            blocksize: 100,
            volume_size: 1_000_000,
        };

        let first = store
            .backup(&source, Rules::default(), &index, &cache, options)
            .unwrap();
        assert_eq!(first.files, 2);
        assert_eq!(first.volumes, 1);
        // One content block, one blocklist and up to two metadata blocks.
        assert!(first.new_blocks <= 4);
        assert!(first.reused_blocks >= 6);

        let second = store
            .backup(&source, Rules::default(), &index, &cache, options)
            .unwrap();
        assert_eq!(second.new_blocks, 0);
        assert_eq!(second.volumes, 0);

        write(source.join("b"), [8_u8; 300]).unwrap();
        let third = store
            .backup(&source, Rules::default(), &index, &cache, options)
            .unwrap();
        assert_eq!(third.volumes, 1);
        assert!(third.new_blocks >= 2);

        let lists = store.file_lists().unwrap();
        assert_eq!(lists.len(), 3);
        assert!(lists.windows(2).all(|pair| pair[0].0 < pair[1].0));
        assert!(index.is_current(&store.block_volumes().unwrap()).unwrap());
    }
}

use {
    super::{BlockStore, sidecar_name},
    crate::crypto::HashingWriter,
    anyhow::{Context as _, Result},
    fs_err::File,
    heddle_protocol::{
        blockstore::encode_hash,
        verification::{RemoteVolumeState, SidecarEntry},
    },
    sha2::Sha256,
    std::{
        collections::HashMap,
        io::{self, BufReader, BufWriter, Write},
    },
    tracing::{debug, info, instrument, warn},
};

/// Outcome of checking the files listed in a sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidecarReport {
    pub checked: u64,
    /// Entries marked as deleted whose file is gone, as expected.
    pub deleted: u64,
    pub failures: Vec<String>,
}

/// Entries of the store's sidecar. Empty if there is none yet.
#[inline]
pub fn read_sidecar(store: &BlockStore) -> Result<Vec<SidecarEntry>> {
    let name = sidecar_name();
    if !store.backend.list()?.iter().any(|file| file.name == name) {
        return Ok(Vec::new());
    }
    let file = store.get_raw(&name)?;
    serde_json::from_reader(BufReader::new(File::open(file.path())?))
        .with_context(|| format!("invalid verification file {name}"))
}

/// Adds entries to the sidecar, replacing earlier entries with the same name.
pub(super) fn append(store: &BlockStore, entries: Vec<SidecarEntry>) -> Result<()> {
    let mut all = read_sidecar(store)?;
    all.retain(|old| !entries.iter().any(|new| new.name == old.name));
    all.extend(entries);
    let file = store.temp_file()?;
    let mut writer = BufWriter::new(file.reopen()?);
    serde_json::to_writer(&mut writer, &all)?;
    writer.flush()?;
    store.backend.put(file.path(), &sidecar_name())?;
    debug!(entries = all.len(), "wrote verification file");
    Ok(())
}

#[instrument(skip_all)]
pub(super) fn verify(store: &BlockStore) -> Result<SidecarReport> {
    let entries = read_sidecar(store)?;
    let present: HashMap<_, _> = store
        .backend
        .list()?
        .into_iter()
        .map(|file| (file.name, file.size))
        .collect();
    let mut report = SidecarReport::default();
    for entry in entries {
        let Some(&size) = present.get(&entry.name) else {
            if entry.state == RemoteVolumeState::Deleted {
                report.deleted = report.deleted.saturating_add(1);
            } else {
                report.failures.push(format!("{} is missing", entry.name));
            }
            continue;
        };
        if entry.state == RemoteVolumeState::Deleted {
            debug!(name = %entry.name, "deleted file still present");
            continue;
        }
        report.checked = report.checked.saturating_add(1);
        if size != entry.size {
            report.failures.push(format!(
                "{} has size {size}, expected {}",
                entry.name, entry.size
            ));
            continue;
        }
        let Some(expected) = &entry.hash else {
            continue;
        };
        let actual = stored_hash(store, &entry.name)?;
        if actual != *expected {
            report.failures.push(format!(
                "{} has hash {actual}, expected {expected}",
                entry.name
            ));
        }
    }
    for failure in &report.failures {
        warn!("{failure}");
    }
    info!(
        checked = report.checked,
        deleted = report.deleted,
        failures = report.failures.len(),
        "verification file checked"
    );
    Ok(report)
}

fn stored_hash(store: &BlockStore, name: &str) -> Result<String> {
    let file = store.get_raw(name)?;
    let mut hasher = HashingWriter::<_, Sha256>::new(io::sink());
    io::copy(&mut BufReader::new(File::open(file.path())?), &mut hasher)?;
    let (_, digest, _) = hasher.finish()?;
    Ok(encode_hash(&digest))
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use {
        super::*,
        crate::{
            blockstore::{
                BlockBackupOptions, BlockIndex, VolumeCache, test_util::store,
            },
            rules::Rules,
        },
        fs_err::{create_dir_all, read, remove_file, write},
        heddle_protocol::verification::RemoteVolumeType,
    };

    #[test]
    fn detects_damage() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        create_dir_all(&source).unwrap();
        write(source.join("a"), b"hello").unwrap();
        let (target, store) = store(dir.path(), false);
        let index = BlockIndex::open(&dir.path().join("index")).unwrap();
        let cache = VolumeCache::with_budget(1_048_576, 1);
        store
            .backup(&source, Rules::default(), &index, &cache, BlockBackupOptions::default())
            .unwrap();

        let report = store.verify_sidecar().unwrap();
        assert_eq!(report.checked, 2);
        assert!(report.failures.is_empty());

        let mut entries = read_sidecar(&store).unwrap();
        assert_eq!(entries.len(), 2);
        let volume = entries
            .iter()
            .find(|entry| entry.kind == RemoteVolumeType::Blocks)
            .unwrap()
            .name
            .clone();
        let mut data = read(target.join(&volume)).unwrap();
        data[0] ^= 1;
        write(target.join(&volume), data).unwrap();
        let report = store.verify_sidecar().unwrap();
        assert_eq!(report.failures.len(), 1);

        remove_file(target.join(&volume)).unwrap();
        for entry in &mut entries {
            if entry.name == volume {
                entry.state = RemoteVolumeState::Deleted;
            }
        }
        append(&store, entries).unwrap();
        let report = store.verify_sidecar().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(report.failures.is_empty());
    }
}

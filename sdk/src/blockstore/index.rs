use {
    super::{BlockStore, VolumeCache},
    crate::backend::RemoteFile,
    anyhow::{Context as _, Result},
    heddle_protocol::{Error, encoding},
    itertools::Itertools,
    std::path::Path,
    tracing::info,
};

const KEY_FINGERPRINT: &[u8] = b"fingerprint";

/// Summary of a set of block volumes: sorted names joined by `;`, directly followed by
/// their sizes joined by `;`.
#[must_use]
#[inline]
pub fn fingerprint(volumes: &[RemoteFile]) -> String {
    let mut volumes: Vec<_> = volumes.iter().collect();
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    let names = volumes.iter().map(|file| &file.name).join(";");
    let sizes = volumes.iter().map(|file| file.size).join(";");
    format!("{names}{sizes}")
}

/// Persistent map from block id to the name of the volume holding it.
pub struct BlockIndex {
    db: sled::Db,
    blocks: sled::Tree,
}

impl BlockIndex {
    #[inline]
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("failed to open block index at {}", path.display()))?;
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            db,
        })
    }

    #[inline]
    pub fn is_current(&self, volumes: &[RemoteFile]) -> Result<bool> {
        let stored = self.db.get(KEY_FINGERPRINT)?;
        Ok(stored.is_some_and(|stored| stored.as_ref() == fingerprint(volumes).as_bytes()))
    }

    /// Rebuilds the index unless it matches the volumes currently in the store.
    /// Returns whether it was rebuilt.
    #[inline]
    pub fn ensure_current(&self, store: &BlockStore, cache: &VolumeCache) -> Result<bool> {
        let volumes = store.block_volumes()?;
        if self.is_current(&volumes)? {
            info!("reusing existing block index");
            return Ok(false);
        }
        self.rebuild(store, &volumes, cache)?;
        Ok(true)
    }

    /// Reads every volume and records its blocks.
    #[inline]
    pub fn rebuild(
        &self,
        store: &BlockStore,
        volumes: &[RemoteFile],
        cache: &VolumeCache,
    ) -> Result<()> {
        info!(volumes = volumes.len(), "building block index");
        self.db.remove(KEY_FINGERPRINT)?;
        self.blocks.clear()?;
        for volume in volumes {
            let blocks = cache.get_or_load(&volume.name, || store.read_block_volume(&volume.name))?;
            let value = encoding::serialize(&volume.name)?;
            let mut batch = sled::Batch::default();
            for id in blocks.ids() {
                batch.insert(id.as_bytes(), value.as_slice());
            }
            self.blocks.apply_batch(batch)?;
        }
        self.set_fingerprint(volumes)
    }

    #[inline]
    pub fn set_fingerprint(&self, volumes: &[RemoteFile]) -> Result<()> {
        self.db.insert(KEY_FINGERPRINT, fingerprint(volumes).as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    #[inline]
    pub fn insert(&self, id: &str, volume: &str) -> Result<()> {
        self.blocks
            .insert(id.as_bytes(), encoding::serialize(&volume)?)?;
        Ok(())
    }

    #[inline]
    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.blocks.contains_key(id.as_bytes())?)
    }

    /// Name of the volume holding block `id`.
    #[inline]
    pub fn lookup(&self, id: &str) -> Result<String> {
        let Some(volume) = self.blocks.get(id.as_bytes())? else {
            return Err(Error::BlockNotFound(format!("block {id} is not in any volume")).into());
        };
        encoding::deserialize(&volume).context("invalid entry in block index")
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    fn file(name: &str, size: u64) -> RemoteFile {
        RemoteFile {
            name: name.into(),
            size,
        }
    }

    #[test]
    fn fingerprint_format() {
        let volumes = [file("b.dblock", 20), file("a.dblock", 10)];
        assert_eq!(fingerprint(&volumes), "a.dblock;b.dblock10;20");
        assert_eq!(fingerprint(&[]), "");
    }

    #[test]
    fn lookup_and_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let index = BlockIndex::open(&dir.path().join("index")).unwrap();
        let volumes = [file("a.dblock", 10)];
        assert!(!index.is_current(&volumes).unwrap());
        index.insert("id1", "a.dblock").unwrap();
        index.set_fingerprint(&volumes).unwrap();
        assert!(index.is_current(&volumes).unwrap());
        assert!(!index.is_current(&[file("a.dblock", 11)]).unwrap());
        assert_eq!(index.lookup("id1").unwrap(), "a.dblock");
        assert!(index.contains("id1").unwrap());
        let err = index.lookup("id2").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::BlockNotFound(_))
        ));
    }
}

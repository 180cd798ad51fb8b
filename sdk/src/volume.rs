//! Packing a diff stream into size-bounded volumes.

use {
    crate::tarfile::TarWriter,
    anyhow::{Result, bail, ensure},
    heddle_protocol::{
        Entry, EntryKind, Index, Stat,
        manifest::{Manifest, VolumeHash, VolumeInfo},
        tarname::{DiffType, MemberKind, MemberName},
    },
    std::{
        io::{BufWriter, Read, Write},
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
    tracing::debug,
};

/// Upper bound of content stored in one tar member.
pub const MAX_CHUNK_LEN: u64 = 64 * 1024;

/// Space reserved for the tar header of a chunk.
const HEADER_RESERVE: u64 = 512;

/// One item of a diff stream on its way into volumes.
pub struct DiffEntry {
    pub entry: Entry,
    pub diff_type: DiffType,
    /// File content or delta. Only regular files with a snapshot or diff carry one.
    pub content: Option<Box<dyn Read>>,
}

impl DiffEntry {
    #[must_use]
    #[inline]
    pub fn deleted(index: Index) -> Self {
        Self {
            entry: Entry::deleted(index),
            diff_type: DiffType::Deleted,
            content: None,
        }
    }
}

/// Receives finished volumes.
pub trait VolumeSink {
    /// Stores the plain tar file of volume `volume_number` and returns the hash of the
    /// stored form.
    fn store_volume(&mut self, volume_number: u32, plain: &Path) -> Result<VolumeHash>;
}

/// Content chunk length for the given volume size.
#[inline]
pub fn chunk_len(volume_size: u64) -> Result<u64> {
    ensure!(
        volume_size > HEADER_RESERVE.saturating_mul(2),
        "volume size of {volume_size} bytes is too small"
    );
    Ok(MAX_CHUNK_LEN.min(volume_size.saturating_sub(HEADER_RESERVE)))
}

struct Position {
    index: Index,
    block: Option<u32>,
}

impl Position {
    fn whole(index: &Index) -> Self {
        Self {
            index: index.clone(),
            block: None,
        }
    }
}

struct OpenVolume {
    number: u32,
    tar: TarWriter<BufWriter<NamedTempFile>>,
    start: Position,
    end: Position,
}

/// Writes volumes of a single backup session.
pub struct VolumeWriter<'a> {
    volume_size: u64,
    chunk_len: usize,
    temp_dir: PathBuf,
    sink: &'a mut dyn VolumeSink,
    manifest: Manifest,
    current: Option<OpenVolume>,
    next_number: u32,
    stored_bytes: u64,
}

impl<'a> VolumeWriter<'a> {
    #[inline]
    pub fn new(
        volume_size: u64,
        temp_dir: &Path,
        manifest: Manifest,
        sink: &'a mut dyn VolumeSink,
    ) -> Result<Self> {
        Ok(Self {
            volume_size,
            chunk_len: usize::try_from(chunk_len(volume_size)?)?,
            temp_dir: temp_dir.to_owned(),
            sink,
            manifest,
            current: None,
            next_number: 1,
            stored_bytes: 0,
        })
    }

    /// Total size of the plain volumes written so far.
    #[must_use]
    #[inline]
    pub fn volume_bytes(&self) -> u64 {
        self.stored_bytes
    }

    /// Adds one entry, splitting its content into continuation chunks if needed.
    #[inline]
    pub fn add(&mut self, mut item: DiffEntry) -> Result<()> {
        let index = item.entry.index.clone();
        match (item.diff_type, item.content.take()) {
            (DiffType::Deleted, _) => {
                let name = MemberName::new(MemberKind::Deleted, index.clone()).to_string();
                let stat = Stat::default();
                self.append(Position::whole(&index), &name, &EntryKind::Regular, &stat, &[], None)
            }
            (diff_type, Some(mut content)) => {
                ensure!(item.entry.is_regular(), "content for non-regular entry {index}");
                let first = read_chunk(&mut content, self.chunk_len)?;
                let second = if first.len() == self.chunk_len {
                    read_chunk(&mut content, self.chunk_len)?
                } else {
                    Vec::new()
                };
                if second.is_empty() {
                    let name = MemberName::new(MemberKind::single(diff_type), index.clone());
                    return self.append(
                        Position::whole(&index),
                        &name.to_string(),
                        &EntryKind::Regular,
                        &item.entry.stat,
                        &first,
                        None,
                    );
                }
                let mut part = 1_u32;
                let mut joined_len = 0_u64;
                let mut chunk = first;
                let mut next = second;
                loop {
                    let kind = MemberKind::multivol(diff_type, part)
                        .ok_or_else(|| anyhow::anyhow!("tombstone with content"))?;
                    let name = MemberName::new(kind, index.clone()).to_string();
                    joined_len = joined_len.saturating_add(u64::try_from(chunk.len())?);
                    // The last chunk carries the joined length so that lost trailing
                    // chunks are detectable.
                    self.append(
                        Position {
                            index: index.clone(),
                            block: Some(part),
                        },
                        &name,
                        &EntryKind::Regular,
                        &item.entry.stat,
                        &chunk,
                        next.is_empty().then_some(joined_len),
                    )?;
                    if next.is_empty() {
                        return Ok(());
                    }
                    chunk = next;
                    next = if chunk.len() == self.chunk_len {
                        read_chunk(&mut content, self.chunk_len)?
                    } else {
                        Vec::new()
                    };
                    part = part
                        .checked_add(1)
                        .ok_or_else(|| anyhow::anyhow!("too many chunks for {index}"))?;
                }
            }
            (diff_type, None) => {
                let name = MemberName::new(MemberKind::single(diff_type), index.clone()).to_string();
                let kind = item.entry.kind.clone();
                self.append(Position::whole(&index), &name, &kind, &item.entry.stat, &[], None)
            }
        }
    }

    fn append(
        &mut self,
        position: Position,
        name: &str,
        kind: &EntryKind,
        stat: &Stat,
        data: &[u8],
        joined_len: Option<u64>,
    ) -> Result<()> {
        if self.current.is_none() {
            self.current = Some(self.open_volume(&position.index, position.block)?);
        }
        let Some(volume) = &mut self.current else {
            bail!("no open volume");
        };
        if let Some(size) = joined_len {
            volume.tar.append_file_size(size)?;
        }
        volume.tar.append(name, kind, stat, data)?;
        volume.end = position;
        if volume.tar.written() >= self.volume_size {
            self.close_volume()?;
        }
        Ok(())
    }

    fn open_volume(&mut self, index: &Index, block: Option<u32>) -> Result<OpenVolume> {
        let file = NamedTempFile::new_in(&self.temp_dir)?;
        let number = self.next_number;
        self.next_number = self.next_number.saturating_add(1);
        Ok(OpenVolume {
            number,
            tar: TarWriter::new(BufWriter::new(file)),
            start: Position {
                index: index.clone(),
                block,
            },
            end: Position {
                index: index.clone(),
                block,
            },
        })
    }

    fn close_volume(&mut self) -> Result<()> {
        let Some(volume) = self.current.take() else {
            return Ok(());
        };
        let mut file = volume.tar.finish()?.into_inner().map_err(|err| err.into_error())?;
        file.flush()?;
        let size = file.as_file().metadata()?.len();
        self.stored_bytes = self.stored_bytes.saturating_add(size);
        debug!(volume = volume.number, size, "volume finished");
        let hash = self.sink.store_volume(volume.number, file.path())?;
        self.manifest.add_volume_info(VolumeInfo {
            volume_number: volume.number,
            start_index: volume.start.index,
            start_block: volume.start.block,
            end_index: volume.end.index,
            end_block: volume.end.block,
            hash: Some(hash),
        });
        Ok(())
    }

    /// Closes the last volume and returns the session manifest. A session without any
    /// entries still gets one empty volume.
    #[inline]
    pub fn finish(mut self) -> Result<Manifest> {
        if self.current.is_none() && self.manifest.num_volumes() == 0 {
            self.current = Some(self.open_volume(&Index::root(), None)?);
        }
        self.close_volume()?;
        Ok(self.manifest)
    }
}

/// Reads up to `len` bytes, stopping early only at end of input.
fn read_chunk(reader: &mut dyn Read, len: usize) -> Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(len);
    reader.take(u64::try_from(len)?).read_to_end(&mut chunk)?;
    Ok(chunk)
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test"
)]
pub(crate) mod tests {
    use {
        super::*,
        crate::tarfile::{TarMember, TarReader},
        fs_err::File,
        heddle_protocol::manifest::VolumeHash,
        std::io::Cursor,
    };

    /// Keeps every volume in memory.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub(crate) volumes: Vec<Vec<u8>>,
    }

    impl VolumeSink for MemorySink {
        fn store_volume(&mut self, volume_number: u32, plain: &Path) -> Result<VolumeHash> {
            assert_eq!(volume_number as usize, self.volumes.len() + 1);
            let mut data = Vec::new();
            File::open(plain)?.read_to_end(&mut data)?;
            self.volumes.push(data);
            Ok(VolumeHash {
                algorithm: "SHA1".into(),
                value: volume_number.to_string(),
            })
        }
    }

    fn file(path: &str, content: &[u8]) -> DiffEntry {
        DiffEntry {
            entry: Entry {
                index: path.parse().unwrap(),
                kind: EntryKind::Regular,
                stat: Stat {
                    mode: 0o644,
                    uid: 0,
                    gid: 0,
                    mtime: 1,
                },
                size: content.len() as u64,
            },
            diff_type: DiffType::Snapshot,
            content: Some(Box::new(Cursor::new(content.to_vec()))),
        }
    }

    fn members(volume: &[u8]) -> Vec<TarMember> {
        TarReader::new(volume)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn large_file_spans_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = MemorySink::default();
        let volume_size = 100 * 1024;
        let mut writer = VolumeWriter::new(volume_size, dir.path(), Manifest::default(), &mut sink)
            .unwrap();
        let big = vec![5_u8; 1024 * 1024];
        writer.add(file("a", b"small")).unwrap();
        writer.add(file("b", &big)).unwrap();
        writer.add(DiffEntry::deleted("c".parse().unwrap())).unwrap();
        let manifest = writer.finish().unwrap();
        manifest.check_contiguous().unwrap();

        assert!(sink.volumes.len() >= 8);
        for volume in &sink.volumes {
            assert!(volume.len() as u64 <= volume_size + MAX_CHUNK_LEN + 3 * 1024);
        }
        let all: Vec<_> = sink.volumes.iter().flat_map(|v| members(v)).collect();
        let (last_chunk, chunks) = all
            .iter()
            .filter(|m| m.name.starts_with("multivol_snapshot/b/"))
            .collect::<Vec<_>>()
            .split_last()
            .map(|(last, rest)| ((*last).clone(), rest.len()))
            .unwrap();
        assert_eq!(chunks, 15);
        assert_eq!(last_chunk.file_size, Some(1024 * 1024));
        assert_eq!(all.iter().filter(|m| m.file_size.is_some()).count(), 1);
        let names: Vec<_> = all.into_iter().map(|m| m.name).collect();
        assert_eq!(names[0], "snapshot/a");
        assert_eq!(names[1], "multivol_snapshot/b/1");
        assert_eq!(names[16], "multivol_snapshot/b/16");
        assert_eq!(names.last().unwrap(), "deleted/c");

        let first = manifest.volume(1).unwrap();
        assert_eq!(first.start_index.to_string(), "a");
        assert_eq!(first.start_block, None);
        assert_eq!(first.end_index.to_string(), "b");
        assert_eq!(first.end_block, Some(2));
        let second = manifest.volume(2).unwrap();
        assert_eq!(second.start_index.to_string(), "b");
        assert_eq!(second.start_block, Some(3));
    }

    #[test]
    fn empty_session_has_one_volume() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = MemorySink::default();
        let writer =
            VolumeWriter::new(1024 * 1024, dir.path(), Manifest::default(), &mut sink).unwrap();
        let manifest = writer.finish().unwrap();
        assert_eq!(manifest.num_volumes(), 1);
        assert!(members(&sink.volumes[0]).is_empty());
    }

    #[test]
    fn tiny_volume_size_is_rejected() {
        chunk_len(1000).unwrap_err();
        assert_eq!(chunk_len(10_000).unwrap(), 10_000 - 512);
        assert_eq!(chunk_len(100 << 20).unwrap(), MAX_CHUNK_LEN);
    }
}

//! Signature files: per-session records of every changed entry, with an rsync
//! signature for each regular file.
//!
//! Members are named `signature/<path>` for regular files, `snapshot/<path>` for
//! everything else and `deleted/<path>` for tombstones. A full signature file lists
//! the whole tree; a new-signatures file lists only what changed in its session.

use {
    crate::{
        signature::Signature,
        tarfile::{TarMember, TarReader, TarWriter},
    },
    anyhow::{Context as _, Result, bail},
    heddle_protocol::{
        Entry, EntryKind, Index, Stat,
        tarname::{MemberKind, MemberName},
    },
    itertools::Itertools,
    std::{
        io::{Read, Write},
        iter::Peekable,
    },
};

/// An entry of a signature file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigEntry {
    pub entry: Entry,
    /// Serialized signature of a regular file.
    pub signature: Option<Vec<u8>>,
}

impl SigEntry {
    #[inline]
    pub fn from_member(member: TarMember) -> Result<Self> {
        let Some(name) = MemberName::parse(&member.name) else {
            bail!("unexpected member in signature file: {:?}", member.name);
        };
        let (kind, signature) = match name.kind {
            MemberKind::Signature => (EntryKind::Regular, Some(member.data)),
            MemberKind::Snapshot => (member.kind, None),
            MemberKind::Deleted => return Ok(Self::deleted(name.index)),
            MemberKind::Diff | MemberKind::MultivolSnapshot(_) | MemberKind::MultivolDiff(_) => {
                bail!("unexpected member in signature file: {:?}", member.name)
            }
        };
        Ok(Self {
            entry: Entry {
                index: name.index,
                kind,
                stat: member.stat,
                size: member.file_size.unwrap_or_default(),
            },
            signature,
        })
    }

    #[must_use]
    #[inline]
    pub fn deleted(index: Index) -> Self {
        Self {
            entry: Entry::deleted(index),
            signature: None,
        }
    }

    #[inline]
    pub fn parse_signature(&self) -> Result<Option<Signature>> {
        self.signature
            .as_deref()
            .map(Signature::from_bytes)
            .transpose()
            .with_context(|| format!("invalid signature of {}", self.entry.index))
    }
}

/// Writes a signature file.
pub struct SigTarWriter<W: Write> {
    tar: TarWriter<W>,
    entries: u64,
}

impl<W: Write> SigTarWriter<W> {
    #[inline]
    pub fn new(inner: W) -> Self {
        Self {
            tar: TarWriter::new(inner),
            entries: 0,
        }
    }

    #[must_use]
    #[inline]
    pub fn entries(&self) -> u64 {
        self.entries
    }

    #[inline]
    pub fn add_signature(&mut self, entry: &Entry, signature: &Signature) -> Result<()> {
        let name = MemberName::new(MemberKind::Signature, entry.index.clone());
        self.tar.append_file_size(entry.size)?;
        self.tar.append(
            &name.to_string(),
            &EntryKind::Regular,
            &entry.stat,
            &signature.to_bytes(),
        )?;
        self.entries = self.entries.saturating_add(1);
        Ok(())
    }

    /// Records a non-regular entry or a tombstone.
    #[inline]
    pub fn add_entry(&mut self, entry: &Entry) -> Result<()> {
        match &entry.kind {
            EntryKind::Regular => bail!("regular file {} needs a signature", entry.index),
            EntryKind::Deleted => {
                let name = MemberName::new(MemberKind::Deleted, entry.index.clone());
                self.tar
                    .append(&name.to_string(), &EntryKind::Regular, &Stat::default(), &[])?;
            }
            kind @ (EntryKind::Directory
            | EntryKind::Symlink(_)
            | EntryKind::Fifo
            | EntryKind::Device(_)) => {
                let name = MemberName::new(MemberKind::Snapshot, entry.index.clone());
                self.tar.append(&name.to_string(), kind, &entry.stat, &[])?;
            }
        }
        self.entries = self.entries.saturating_add(1);
        Ok(())
    }

    #[inline]
    pub fn finish(self) -> Result<W> {
        self.tar.finish()
    }
}

/// Reads a signature file in index order.
pub struct SigTarReader<R> {
    members: TarReader<R>,
    last: Option<Index>,
}

impl<R: Read> SigTarReader<R> {
    #[inline]
    pub fn new(inner: R) -> Self {
        Self {
            members: TarReader::new(inner),
            last: None,
        }
    }
}

impl<R: Read> Iterator for SigTarReader<R> {
    type Item = Result<SigEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let member = match self.members.next()? {
            Ok(member) => member,
            Err(err) => return Some(Err(err)),
        };
        let entry = match SigEntry::from_member(member) {
            Ok(entry) => entry,
            Err(err) => return Some(Err(err)),
        };
        if let Some(last) = &self.last
            && *last >= entry.entry.index
        {
            return Some(Err(heddle_protocol::Error::Consistency(format!(
                "signature file is not sorted: {} after {last}",
                entry.entry.index
            ))
            .into()));
        }
        self.last = Some(entry.entry.index.clone());
        Some(Ok(entry))
    }
}

/// Merges signature streams of one chain, oldest first, into the state of the tree
/// after the last of them.
///
/// For every index the entry from the newest stream wins. Tombstones are kept so
/// callers can tell a deleted path from one that never existed.
pub struct CombinedSignatures<I: Iterator<Item = Result<SigEntry>>> {
    streams: Vec<Peekable<I>>,
}

impl<I: Iterator<Item = Result<SigEntry>>> CombinedSignatures<I> {
    #[inline]
    pub fn new(streams: impl IntoIterator<Item = I>) -> Self {
        Self {
            streams: streams.into_iter().map(Iterator::peekable).collect(),
        }
    }
}

impl<I: Iterator<Item = Result<SigEntry>>> Iterator for CombinedSignatures<I> {
    type Item = Result<SigEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        // Errors are reported as soon as any stream reaches one.
        for stream in &mut self.streams {
            if let Some(Err(_)) = stream.peek() {
                return stream.next();
            }
        }
        let smallest = self
            .streams
            .iter_mut()
            .filter_map(|stream| match stream.peek() {
                Some(Ok(entry)) => Some(entry.entry.index.clone()),
                Some(Err(_)) | None => None,
            })
            .min()?;
        let mut newest = None;
        for stream in &mut self.streams {
            if let Some(Ok(entry)) = stream.peek()
                && entry.entry.index == smallest
            {
                newest = stream.next();
            }
        }
        newest
    }
}

/// Live entries of the combined signature streams, without tombstones.
#[inline]
pub fn live_entries<I: Iterator<Item = Result<SigEntry>>>(
    streams: impl IntoIterator<Item = I>,
) -> impl Iterator<Item = Result<SigEntry>> {
    CombinedSignatures::new(streams).filter_ok(|entry| !entry.entry.is_deleted())
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use {super::*, std::io::Cursor};

    fn entry(path: &str, kind: EntryKind, size: u64) -> Entry {
        Entry {
            index: path.parse().unwrap(),
            kind,
            stat: Stat {
                mode: 0o640,
                uid: 1,
                gid: 2,
                mtime: 1_600_000_000,
            },
            size,
        }
    }

    fn sigtar(entries: &[Entry]) -> Vec<u8> {
        let mut writer = SigTarWriter::new(Vec::new());
        for entry in entries {
            if entry.is_regular() {
                let signature = Signature::of_reader(512, &b"content"[..]).unwrap();
                writer.add_signature(entry, &signature).unwrap();
            } else {
                writer.add_entry(entry).unwrap();
            }
        }
        writer.finish().unwrap()
    }

    fn read(data: Vec<u8>) -> SigTarReader<Cursor<Vec<u8>>> {
        SigTarReader::new(Cursor::new(data))
    }

    #[test]
    fn entries_survive() {
        let entries = vec![
            entry("", EntryKind::Directory, 0),
            entry("a", EntryKind::Regular, 7),
            entry("b", EntryKind::Symlink("a".into()), 0),
            Entry::deleted("c".parse().unwrap()),
        ];
        let read: Vec<_> = read(sigtar(&entries)).collect::<Result<_>>().unwrap();
        assert_eq!(read.len(), 4);
        for (sig, expected) in read.iter().zip(&entries) {
            assert_eq!(&sig.entry, expected);
        }
        assert!(read[1].parse_signature().unwrap().is_some());
        assert!(read[2].signature.is_none());
    }

    #[test]
    fn unsorted_input_is_an_error() {
        let entries = vec![
            entry("b", EntryKind::Directory, 0),
            entry("a", EntryKind::Directory, 0),
        ];
        let result: Result<Vec<_>> = read(sigtar(&entries)).collect();
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<heddle_protocol::Error>(),
            Some(heddle_protocol::Error::Consistency(_))
        ));
    }

    #[test]
    fn newest_wins() {
        let full = sigtar(&[
            entry("", EntryKind::Directory, 0),
            entry("a", EntryKind::Regular, 1),
            entry("b", EntryKind::Regular, 1),
            entry("d", EntryKind::Regular, 1),
        ]);
        let inc1 = sigtar(&[entry("b", EntryKind::Regular, 2), entry("c", EntryKind::Fifo, 0)]);
        let inc2 = sigtar(&[
            Entry::deleted("a".parse().unwrap()),
            entry("b", EntryKind::Regular, 3),
        ]);
        let combined: Vec<_> = live_entries([read(full), read(inc1), read(inc2)])
            .map(|entry| entry.map(|e| (e.entry.index.to_string(), e.entry.size)))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            combined,
            [
                (".".to_owned(), 0),
                ("b".to_owned(), 3),
                ("c".to_owned(), 0),
                ("d".to_owned(), 1)
            ]
        );
    }
}

//! Comparing the source tree with the signatures of the previous session.
//!
//! [`DiffIter`] merge-joins the combined signature stream with the source walk and
//! yields what has to be stored. File content is read lazily: the content reader of a
//! regular entry computes the new signature (and the delta, if there is an old
//! signature) while the volume writer consumes it. The new signature is written to
//! the signature file once that reader reaches the end.

use {
    crate::{
        delta::DeltaWriter,
        signature::{Signature, SignatureBuilder, block_len_for},
        sigtar::{SigEntry, SigTarWriter},
        volume::DiffEntry,
    },
    anyhow::Result,
    fs_err::File,
    heddle_protocol::{Entry, Error, Index, tarname::DiffType},
    std::{
        io::{self, Read, Write},
        iter::Peekable,
        mem,
        path::PathBuf,
        sync::mpsc::{Receiver, Sender, channel},
    },
    tracing::{debug, info, warn},
};

const READ_CHUNK: usize = 64 * 1024;

/// Counters of one backup session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub source_files: u64,
    pub new_files: u64,
    pub changed_files: u64,
    pub deleted_files: u64,
    pub unchanged_files: u64,
    pub errors: u64,
    /// Snapshot content and deltas before packing into volumes.
    pub delta_bytes: u64,
    /// Plain size of all volumes of the session.
    pub volume_bytes: u64,
}

impl SessionStats {
    #[inline]
    pub fn log(&self) {
        info!(
            source_files = self.source_files,
            new = self.new_files,
            changed = self.changed_files,
            deleted = self.deleted_files,
            unchanged = self.unchanged_files,
            errors = self.errors,
            delta_bytes = self.delta_bytes,
            volume_bytes = self.volume_bytes,
            "backup statistics"
        );
    }
}

/// Sent by a content reader when it reaches the end of the file.
struct Finished {
    entry: Entry,
    signature: Signature,
    emitted: u64,
    read_failed: bool,
}

/// Reads a source file, feeding the new signature and producing either the file
/// content or a delta against the old signature.
struct ContentReader {
    file: File,
    entry: Entry,
    signature: Option<SignatureBuilder>,
    delta: Option<DeltaWriter<Vec<u8>>>,
    buffer: Vec<u8>,
    position: usize,
    read: u64,
    emitted: u64,
    read_failed: bool,
    finished: Sender<Finished>,
}

impl ContentReader {
    /// Reads the next piece of the file. At the end of the file the signature is sent
    /// and the last piece of the delta, if any, is left in the buffer.
    fn refill(&mut self) -> io::Result<()> {
        let mut chunk = vec![0; READ_CHUNK];
        let n = match self.file.read(&mut chunk) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => {
                warn!(
                    path = %self.entry.index,
                    error = %err,
                    "failed to read file, storing truncated content"
                );
                self.read_failed = true;
                0
            }
        };
        if n == 0 {
            return self.finish();
        }
        chunk.truncate(n);
        self.read = self.read.saturating_add(to_u64(n)?);
        if let Some(signature) = &mut self.signature {
            signature.update(&chunk);
        }
        self.buffer = match &mut self.delta {
            Some(delta) => {
                delta.write_all(&chunk)?;
                mem::take(delta.get_mut())
            }
            None => chunk,
        };
        self.position = 0;
        self.emitted = self.emitted.saturating_add(to_u64(self.buffer.len())?);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let Some(signature) = self.signature.take() else {
            return Ok(());
        };
        self.buffer = match self.delta.take() {
            Some(delta) => delta.finish()?,
            None => Vec::new(),
        };
        self.position = 0;
        self.emitted = self.emitted.saturating_add(to_u64(self.buffer.len())?);
        let mut entry = self.entry.clone();
        entry.size = self.read;
        // The receiver lives as long as the diff iterator.
        let _ = self.finished.send(Finished {
            entry,
            signature: signature.finish(),
            emitted: self.emitted,
            read_failed: self.read_failed,
        });
        Ok(())
    }
}

impl Read for ContentReader {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let pending = self.buffer.get(self.position..).unwrap_or_default();
            if !pending.is_empty() {
                let n = pending.len().min(buf.len());
                buf.get_mut(..n)
                    .unwrap_or_default()
                    .copy_from_slice(pending.get(..n).unwrap_or_default());
                self.position = self.position.saturating_add(n);
                return Ok(n);
            }
            if self.signature.is_none() {
                return Ok(0);
            }
            self.refill()?;
        }
    }
}

fn to_u64(n: usize) -> io::Result<u64> {
    u64::try_from(n).map_err(io::Error::other)
}

/// State of one side of the merge-join.
struct Side<I: Iterator> {
    items: Peekable<I>,
    last: Option<Index>,
    name: &'static str,
}

impl<I: Iterator> Side<I> {
    fn new(items: I, name: &'static str) -> Self {
        Self {
            items: items.peekable(),
            last: None,
            name,
        }
    }

    fn check_order(&mut self, index: &Index) -> Result<()> {
        if let Some(last) = &self.last
            && last >= index
        {
            return Err(Error::Consistency(format!(
                "{} is not sorted: {index} after {last}",
                self.name
            ))
            .into());
        }
        self.last = Some(index.clone());
        Ok(())
    }
}

/// Yields the entries that have to be stored in the new session.
pub struct DiffIter<S, N, W>
where
    S: Iterator<Item = Result<SigEntry>>,
    N: Iterator<Item = Entry>,
    W: Write,
{
    old: Side<S>,
    new: Side<N>,
    root: PathBuf,
    signatures: SigTarWriter<W>,
    finished_sender: Sender<Finished>,
    finished: Receiver<Finished>,
    stats: SessionStats,
    failed: bool,
}

impl<S, N, W> DiffIter<S, N, W>
where
    S: Iterator<Item = Result<SigEntry>>,
    N: Iterator<Item = Entry>,
    W: Write,
{
    /// `old` is the live signature state of the chain (empty for a full backup),
    /// `new` the walk of the source tree at `root`. Signatures of everything yielded
    /// are written to `signatures`.
    #[inline]
    pub fn new(old: S, new: N, root: impl Into<PathBuf>, signatures: W) -> Self {
        let (finished_sender, finished) = channel();
        Self {
            old: Side::new(old, "signature stream"),
            new: Side::new(new, "source tree"),
            root: root.into(),
            signatures: SigTarWriter::new(signatures),
            finished_sender,
            finished,
            stats: SessionStats::default(),
            failed: false,
        }
    }

    #[must_use]
    #[inline]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Writes the signatures of the last content and closes the signature file.
    #[inline]
    pub fn finish(mut self) -> Result<(SessionStats, W)> {
        self.drain_finished()?;
        Ok((self.stats, self.signatures.finish()?))
    }

    fn drain_finished(&mut self) -> Result<()> {
        while let Ok(finished) = self.finished.try_recv() {
            if finished.read_failed {
                self.stats.errors = self.stats.errors.saturating_add(1);
            }
            self.stats.delta_bytes = self.stats.delta_bytes.saturating_add(finished.emitted);
            self.signatures
                .add_signature(&finished.entry, &finished.signature)?;
        }
        Ok(())
    }

    fn take_old(&mut self) -> Result<Option<SigEntry>> {
        let Some(old) = self.old.items.next().transpose()? else {
            return Ok(None);
        };
        self.old.check_order(&old.entry.index)?;
        Ok(Some(old))
    }

    fn take_new(&mut self) -> Result<Option<Entry>> {
        let Some(new) = self.new.items.next() else {
            return Ok(None);
        };
        self.new.check_order(&new.index)?;
        self.stats.source_files = self.stats.source_files.saturating_add(1);
        Ok(Some(new))
    }

    fn store(&mut self, entry: Entry, old_signature: Option<Signature>) -> Result<Option<DiffEntry>> {
        if !entry.is_regular() {
            self.signatures.add_entry(&entry)?;
            return Ok(Some(DiffEntry {
                entry,
                diff_type: DiffType::Snapshot,
                content: None,
            }));
        }
        let path = entry.index.to_path(&self.root);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %entry.index, error = %err, "skipping unreadable file");
                self.stats.errors = self.stats.errors.saturating_add(1);
                return Ok(None);
            }
        };
        let diff_type = if old_signature.is_some() {
            DiffType::Diff
        } else {
            DiffType::Snapshot
        };
        let delta = old_signature
            .map(|signature| DeltaWriter::new(signature, Vec::new()))
            .transpose()?;
        let content = ContentReader {
            file,
            signature: Some(SignatureBuilder::new(block_len_for(entry.size))),
            delta,
            entry: entry.clone(),
            buffer: Vec::new(),
            position: 0,
            read: 0,
            emitted: 0,
            read_failed: false,
            finished: self.finished_sender.clone(),
        };
        Ok(Some(DiffEntry {
            entry,
            diff_type,
            content: Some(Box::new(content)),
        }))
    }

    fn next_item(&mut self) -> Result<Option<DiffEntry>> {
        loop {
            self.drain_finished()?;
            let old_index = match self.old.items.peek() {
                Some(Ok(old)) => Some(old.entry.index.clone()),
                Some(Err(_)) => {
                    self.take_old()?;
                    continue;
                }
                None => None,
            };
            let new_index = self.new.items.peek().map(|new| new.index.clone());
            let item = match (old_index, new_index) {
                (None, None) => return Ok(None),
                (Some(old), new) if new.as_ref().is_none_or(|new| old < *new) => {
                    let Some(old) = self.take_old()? else {
                        continue;
                    };
                    if old.entry.is_deleted() {
                        continue;
                    }
                    debug!(path = %old.entry.index, "deleted");
                    self.stats.deleted_files = self.stats.deleted_files.saturating_add(1);
                    let tombstone = Entry::deleted(old.entry.index);
                    self.signatures.add_entry(&tombstone)?;
                    Some(DiffEntry::deleted(tombstone.index))
                }
                (old, Some(new)) if old.as_ref() != Some(&new) => {
                    let Some(new) = self.take_new()? else {
                        continue;
                    };
                    debug!(path = %new.index, "new");
                    self.stats.new_files = self.stats.new_files.saturating_add(1);
                    self.store(new, None)?
                }
                (_, _) => {
                    let (Some(old), Some(new)) = (self.take_old()?, self.take_new()?) else {
                        continue;
                    };
                    if old.entry.is_deleted() {
                        self.stats.new_files = self.stats.new_files.saturating_add(1);
                        self.store(new, None)?
                    } else if old.entry.same_as(&new) {
                        self.stats.unchanged_files = self.stats.unchanged_files.saturating_add(1);
                        continue;
                    } else {
                        debug!(path = %new.index, "changed");
                        self.stats.changed_files = self.stats.changed_files.saturating_add(1);
                        let old_signature = if old.entry.is_regular() && new.is_regular() {
                            old.parse_signature()?
                        } else {
                            None
                        };
                        self.store(new, old_signature)?
                    }
                }
            };
            if let Some(item) = item {
                return Ok(Some(item));
            }
        }
    }
}

impl<S, N, W> Iterator for DiffIter<S, N, W>
where
    S: Iterator<Item = Result<SigEntry>>,
    N: Iterator<Item = Entry>,
    W: Write,
{
    type Item = Result<DiffEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.next_item().transpose();
        if matches!(result, Some(Err(_))) {
            self.failed = true;
        }
        result
    }
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test"
)]
mod tests {
    use {
        super::*,
        crate::{
            delta::apply_delta,
            rules::Rules,
            sigtar::{SigTarReader, live_entries},
            walk::TreeWalk,
        },
        fs_err::{create_dir_all, remove_file, write},
        heddle_protocol::EntryKind,
        std::{io::Cursor, path::Path},
    };

    struct Session {
        items: Vec<(Entry, DiffType, Vec<u8>)>,
        stats: SessionStats,
        signatures: Vec<u8>,
    }

    fn run(root: &Path, previous: &[Vec<u8>]) -> Session {
        let old = live_entries(previous.iter().map(|s| SigTarReader::new(Cursor::new(s.clone()))));
        let walk = TreeWalk::new(root, Rules::default()).unwrap();
        let mut diff = DiffIter::new(old, walk, root, Vec::new());
        let mut items = Vec::new();
        for item in diff.by_ref() {
            let mut item = item.unwrap();
            let mut data = Vec::new();
            if let Some(content) = &mut item.content {
                content.read_to_end(&mut data).unwrap();
            }
            items.push((item.entry, item.diff_type, data));
        }
        let (stats, signatures) = diff.finish().unwrap();
        Session {
            items,
            stats,
            signatures,
        }
    }

    fn names(session: &Session) -> Vec<(String, DiffType)> {
        session
            .items
            .iter()
            .map(|(entry, diff_type, _)| (entry.index.to_string(), *diff_type))
            .collect()
    }

    #[test]
    fn full_then_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        create_dir_all(root.join("d")).unwrap();
        let old_content: Vec<u8> = (0..20_000_u32).flat_map(|i| i.to_le_bytes()).collect();
        write(root.join("d/big"), &old_content).unwrap();
        write(root.join("gone"), "bye").unwrap();
        write(root.join("same"), "same").unwrap();

        let full = run(root, &[]);
        assert_eq!(
            names(&full),
            [
                (".".into(), DiffType::Snapshot),
                ("d".into(), DiffType::Snapshot),
                ("d/big".into(), DiffType::Snapshot),
                ("gone".into(), DiffType::Snapshot),
                ("same".into(), DiffType::Snapshot),
            ]
        );
        assert_eq!(full.items[2].2, old_content);
        assert_eq!(full.stats.new_files, 5);
        assert_eq!(full.stats.delta_bytes, old_content.len() as u64 + 7);

        let mut new_content = old_content.clone();
        new_content[40_000] ^= 1;
        write(root.join("d/big"), &new_content).unwrap();
        // Make sure the change is visible even within the same second.
        let later = filetime::FileTime::from_unix_time(2_000_000_000, 0);
        filetime::set_file_mtime(root.join("d/big"), later).unwrap();
        remove_file(root.join("gone")).unwrap();
        write(root.join("new"), "hello").unwrap();

        let inc = run(root, &[full.signatures.clone()]);
        let mut inc_names = names(&inc);
        // Directory mtimes change when entries are added or removed.
        inc_names.retain(|(name, _)| name != "." && name != "d");
        assert_eq!(
            inc_names,
            [
                ("d/big".into(), DiffType::Diff),
                ("gone".into(), DiffType::Deleted),
                ("new".into(), DiffType::Snapshot),
            ]
        );
        assert_eq!(inc.stats.deleted_files, 1);
        assert!(inc.stats.unchanged_files >= 1);

        let (_, _, delta) = inc
            .items
            .iter()
            .find(|(entry, _, _)| entry.index.to_string() == "d/big")
            .unwrap();
        assert!(delta.len() < 5_000);
        let mut patched = Vec::new();
        apply_delta(Cursor::new(&old_content), delta.as_slice(), &mut patched).unwrap();
        assert_eq!(patched, new_content);

        // The state after both sessions matches the tree.
        let combined: Vec<_> = live_entries(
            [full.signatures, inc.signatures]
                .into_iter()
                .map(|s| SigTarReader::new(Cursor::new(s))),
        )
        .collect::<Result<_>>()
        .unwrap();
        let indexes: Vec<_> = combined.iter().map(|s| s.entry.index.to_string()).collect();
        assert_eq!(indexes, [".", "d", "d/big", "new", "same"]);
        assert_eq!(combined[2].entry.size, new_content.len() as u64);
        assert_eq!(combined[2].entry.kind, EntryKind::Regular);

        let again = run(
            root,
            &[
                SigTarWriter::new(Vec::new()).finish().unwrap(),
                combined_to_sigtar(&combined),
            ],
        );
        assert!(again.items.is_empty());
    }

    fn combined_to_sigtar(entries: &[SigEntry]) -> Vec<u8> {
        let mut writer = SigTarWriter::new(Vec::new());
        for entry in entries {
            match entry.parse_signature().unwrap() {
                Some(signature) => writer.add_signature(&entry.entry, &signature).unwrap(),
                None => writer.add_entry(&entry.entry).unwrap(),
            }
        }
        writer.finish().unwrap()
    }

    #[test]
    fn unsorted_old_stream_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let unsorted = vec![
            Ok(SigEntry::deleted("b".parse().unwrap())),
            Ok(SigEntry::deleted("a".parse().unwrap())),
        ];
        let walk = TreeWalk::new(dir.path(), Rules::default()).unwrap();
        let diff = DiffIter::new(unsorted.into_iter(), walk, dir.path(), Vec::new());
        let err = diff.collect::<Result<Vec<_>>>().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Consistency(_))
        ));
    }
}

//! Rebuilding a tree from the volumes of a backup chain.
//!
//! Each backup set is read as a stream of tar members. [`SetEntries`] turns one such
//! stream into archived entries, joining multivol chunks. [`PatchIter`] merges the
//! sets of a chain, oldest first, and applies deltas so that every index yields its
//! state at the time of the newest set.

use {
    crate::{delta::apply_delta, tarfile::TarMember},
    anyhow::{Context as _, Result, bail},
    heddle_protocol::{
        Entry, EntryKind, Error, Index,
        tarname::{DiffType, MemberKind, MemberName},
    },
    std::{
        io::{Seek, SeekFrom, Write},
        iter::Peekable,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
    },
    tempfile::SpooledTempFile,
    tracing::warn,
};

/// Content larger than this is spooled to a temporary file.
const SPOOL_THRESHOLD: usize = 4 * 1024 * 1024;

/// Shared counter of entries that were skipped because of errors.
#[derive(Debug, Clone, Default)]
pub struct ErrorCount(Arc<AtomicU64>);

impl ErrorCount {
    #[inline]
    pub fn add(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[must_use]
#[inline]
pub fn new_content() -> SpooledTempFile {
    SpooledTempFile::new(SPOOL_THRESHOLD)
}

/// An entry as stored in one backup set.
pub struct ArchivedEntry {
    pub entry: Entry,
    pub diff_type: DiffType,
    /// Snapshot content or delta of a regular file, positioned at the start. The size
    /// of `entry` is only known after patching and is zero here.
    pub content: Option<SpooledTempFile>,
}

/// Entries of one backup set, in index order.
///
/// Only members at or below `prefix` are considered. An entry with missing or
/// misordered multivol chunks is skipped and counted as an error, unless the member
/// source already counted one while the entry was read (a skipped damaged volume).
pub struct SetEntries<I: Iterator<Item = Result<TarMember>>> {
    members: Peekable<I>,
    prefix: Index,
    errors: ErrorCount,
    last: Option<Index>,
}

impl<I: Iterator<Item = Result<TarMember>>> SetEntries<I> {
    #[inline]
    pub fn new(members: I, prefix: Index, errors: ErrorCount) -> Self {
        Self {
            members: members.peekable(),
            prefix,
            errors,
            last: None,
        }
    }

    /// Next member at or below the prefix, with its parsed name.
    fn next_member(&mut self) -> Result<Option<(MemberName, TarMember)>> {
        loop {
            let Some(member) = self.members.next().transpose()? else {
                return Ok(None);
            };
            let Some(name) = MemberName::parse(&member.name) else {
                warn!(name = %member.name, "skipping unknown volume member");
                continue;
            };
            if name.index.starts_with(&self.prefix) {
                return Ok(Some((name, member)));
            }
        }
    }

    /// Whether the next member continues the multivol entry at `index`.
    fn peek_continuation(&mut self, index: &Index, diff_type: DiffType) -> bool {
        let Some(Ok(member)) = self.members.peek() else {
            return false;
        };
        MemberName::parse(&member.name).is_some_and(|name| {
            name.index == *index
                && name.kind.part().is_some()
                && name.kind.diff_type() == Some(diff_type)
        })
    }

    fn next_entry(&mut self) -> Result<Option<ArchivedEntry>> {
        loop {
            let errors_before = self.errors.get();
            let Some((name, member)) = self.next_member()? else {
                return Ok(None);
            };
            let Some(diff_type) = name.kind.diff_type() else {
                warn!(name = %member.name, "skipping signature member in volume");
                continue;
            };
            if let Some(last) = &self.last
                && *last >= name.index
            {
                if name.kind.part().is_some() && *last == name.index {
                    // Leftover chunk of an entry that was already dropped.
                    continue;
                }
                return Err(Error::Consistency(format!(
                    "volume members are not sorted: {} after {last}",
                    name.index
                ))
                .into());
            }
            self.last = Some(name.index.clone());

            let entry = Entry {
                index: name.index.clone(),
                kind: if diff_type == DiffType::Deleted {
                    EntryKind::Deleted
                } else {
                    member.kind.clone()
                },
                stat: member.stat,
                size: 0,
            };
            let content = match name.kind {
                MemberKind::Deleted => None,
                MemberKind::Snapshot | MemberKind::Diff => {
                    if entry.is_regular() {
                        Some(spool(&member.data)?)
                    } else {
                        None
                    }
                }
                MemberKind::MultivolSnapshot(part) | MemberKind::MultivolDiff(part) => {
                    match self.join_parts(&name.index, diff_type, part, member)? {
                        Some(content) => Some(content),
                        None => {
                            if self.errors.get() == errors_before {
                                self.errors.add();
                            }
                            continue;
                        }
                    }
                }
                MemberKind::Signature => continue,
            };
            return Ok(Some(ArchivedEntry {
                entry,
                diff_type,
                content,
            }));
        }
    }

    /// Concatenates the chunks of a multivol entry. Returns `None` if chunks are
    /// missing: the chunks must run from the first without gaps, and the last one
    /// records the joined length.
    fn join_parts(
        &mut self,
        index: &Index,
        diff_type: DiffType,
        first_part: u32,
        first: TarMember,
    ) -> Result<Option<SpooledTempFile>> {
        let mut complete = first_part == 1;
        if !complete {
            warn!(path = %index, part = first_part, "multivol entry starts with a later chunk");
        }
        let mut content = new_content();
        content.write_all(&first.data)?;
        let mut joined_len = u64::try_from(first.data.len())?;
        let mut recorded_len = first.file_size;
        let mut expected = first_part.saturating_add(1);
        while self.peek_continuation(index, diff_type) {
            let Some(member) = self.members.next().transpose()? else {
                break;
            };
            let part = MemberName::parse(&member.name)
                .and_then(|name| name.kind.part())
                .unwrap_or_default();
            if part != expected && complete {
                warn!(path = %index, part, expected, "multivol chunk is missing");
                complete = false;
            }
            expected = part.saturating_add(1);
            joined_len = joined_len.saturating_add(u64::try_from(member.data.len())?);
            recorded_len = member.file_size;
            content.write_all(&member.data)?;
        }
        if complete && recorded_len != Some(joined_len) {
            warn!(
                path = %index,
                joined_len,
                recorded_len,
                "multivol entry lacks its last chunk"
            );
            complete = false;
        }
        if !complete {
            warn!(path = %index, "skipping entry with incomplete content");
            return Ok(None);
        }
        content.seek(SeekFrom::Start(0))?;
        Ok(Some(content))
    }
}

impl<I: Iterator<Item = Result<TarMember>>> Iterator for SetEntries<I> {
    type Item = Result<ArchivedEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

fn spool(data: &[u8]) -> Result<SpooledTempFile> {
    let mut content = new_content();
    content.write_all(data)?;
    content.seek(SeekFrom::Start(0))?;
    Ok(content)
}

/// An entry of the restored tree.
pub struct RestoredEntry {
    pub entry: Entry,
    /// Content of a regular file, positioned at the start.
    pub content: Option<SpooledTempFile>,
}

/// Merges the entries of a chain's sets and applies deltas.
///
/// Yields live entries in index order, re-rooted at the prefix the sets were read
/// with. Tombstones are dropped.
pub struct PatchIter<I: Iterator<Item = Result<ArchivedEntry>>> {
    sets: Vec<Peekable<I>>,
    prefix: Index,
    errors: ErrorCount,
    last: Option<Index>,
}

impl<I: Iterator<Item = Result<ArchivedEntry>>> PatchIter<I> {
    /// `sets` must be ordered oldest first.
    #[inline]
    pub fn new(sets: impl IntoIterator<Item = I>, prefix: Index, errors: ErrorCount) -> Self {
        Self {
            sets: sets.into_iter().map(Iterator::peekable).collect(),
            prefix,
            errors,
            last: None,
        }
    }

    /// Versions of the smallest pending index, oldest first.
    fn next_versions(&mut self) -> Result<Option<Vec<ArchivedEntry>>> {
        for set in &mut self.sets {
            if let Some(Err(_)) = set.peek()
                && let Some(Err(err)) = set.next()
            {
                return Err(err);
            }
        }
        let Some(smallest) = self
            .sets
            .iter_mut()
            .filter_map(|set| match set.peek() {
                Some(Ok(item)) => Some(item.entry.index.clone()),
                Some(Err(_)) | None => None,
            })
            .min()
        else {
            return Ok(None);
        };
        let mut versions = Vec::new();
        for set in &mut self.sets {
            if let Some(Ok(item)) = set.peek()
                && item.entry.index == smallest
                && let Some(item) = set.next()
            {
                versions.push(item?);
            }
        }
        Ok(Some(versions))
    }

    fn next_entry(&mut self) -> Result<Option<RestoredEntry>> {
        loop {
            let Some(versions) = self.next_versions()? else {
                return Ok(None);
            };
            let Some(first) = versions.first() else {
                continue;
            };
            let index = first.entry.index.clone();
            if let Some(last) = &self.last
                && *last >= index
            {
                bail!(Error::Consistency(format!(
                    "restored entries are not sorted: {index} after {last}"
                )));
            }
            self.last = Some(index.clone());

            let restored = match combine(versions) {
                Ok(Some(restored)) => restored,
                Ok(None) => continue,
                Err(err) => {
                    warn!(path = %index, error = format!("{err:#}"), "failed to restore entry");
                    self.errors.add();
                    continue;
                }
            };
            let Some(relative) = restored.entry.index.strip_prefix(&self.prefix) else {
                continue;
            };
            let mut restored = restored;
            restored.entry.index = relative;
            return Ok(Some(restored));
        }
    }
}

impl<I: Iterator<Item = Result<ArchivedEntry>>> Iterator for PatchIter<I> {
    type Item = Result<RestoredEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Folds the versions of one index, oldest first, into its final state. Returns
/// `None` if the entry is deleted.
fn combine(versions: Vec<ArchivedEntry>) -> Result<Option<RestoredEntry>> {
    let base = versions
        .iter()
        .rposition(|version| version.diff_type != DiffType::Diff)
        .context("delta without a base version")?;
    let mut versions = versions.into_iter().skip(base);
    let Some(base) = versions.next() else {
        return Ok(None);
    };
    if base.diff_type == DiffType::Deleted {
        if versions.next().is_some() {
            bail!("delta after deletion");
        }
        return Ok(None);
    }
    let mut entry = base.entry;
    let mut content = base.content;
    for diff in versions {
        let Some(basis) = content.take() else {
            bail!("delta against a non-regular entry");
        };
        let Some(delta) = diff.content else {
            bail!("delta member without content");
        };
        let mut patched = new_content();
        apply_delta(basis, delta, &mut patched)?;
        patched.seek(SeekFrom::Start(0))?;
        content = Some(patched);
        entry = diff.entry;
    }
    if let Some(content) = &mut content {
        entry.size = content.seek(SeekFrom::End(0))?;
        content.seek(SeekFrom::Start(0))?;
    }
    Ok(Some(RestoredEntry { entry, content }))
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
        crate::{delta::DeltaWriter, signature::Signature},
        heddle_protocol::Stat,
        std::{io::Read, iter},
    };

    fn member(name: &str, kind: EntryKind, mtime: i64, data: &[u8]) -> Result<TarMember> {
        sized_member(name, kind, mtime, data, None)
    }

    /// A member preceded by a file size record, as the last chunk of split content is.
    fn sized_member(
        name: &str,
        kind: EntryKind,
        mtime: i64,
        data: &[u8],
        file_size: Option<u64>,
    ) -> Result<TarMember> {
        Ok(TarMember {
            name: name.into(),
            kind,
            stat: Stat {
                mode: 0o644,
                uid: 0,
                gid: 0,
                mtime,
            },
            data: data.to_vec(),
            file_size,
        })
    }

    fn delta(old: &[u8], new: &[u8]) -> Vec<u8> {
        let signature = Signature::of_reader(512, old).unwrap();
        let mut writer = DeltaWriter::new(signature, Vec::new()).unwrap();
        writer.write_all(new).unwrap();
        writer.finish().unwrap()
    }

    fn restore(sets: Vec<Vec<Result<TarMember>>>, prefix: &str) -> (Vec<(String, Vec<u8>)>, u64) {
        let errors = ErrorCount::default();
        let prefix: Index = prefix.parse().unwrap();
        let sets: Vec<_> = sets
            .into_iter()
            .map(|members| SetEntries::new(members.into_iter(), prefix.clone(), errors.clone()))
            .collect();
        let restored = PatchIter::new(sets, prefix, errors.clone())
            .map(|item| {
                let mut item = item.unwrap();
                let mut data = Vec::new();
                if let Some(content) = &mut item.content {
                    content.read_to_end(&mut data).unwrap();
                    assert_eq!(item.entry.size, data.len() as u64);
                }
                (item.entry.index.to_string(), data)
            })
            .collect();
        (restored, errors.get())
    }

    fn chain() -> Vec<Vec<Result<TarMember>>> {
        let v1 = vec![1_u8; 3000];
        let mut v2 = v1.clone();
        v2[1500] = 2;
        let mut v3 = v2.clone();
        v3.extend_from_slice(b"tail");
        vec![
            vec![
                member("snapshot", EntryKind::Directory, 1, b""),
                member("multivol_snapshot/a/1", EntryKind::Regular, 1, &v1[..1000]),
                member("multivol_snapshot/a/2", EntryKind::Regular, 1, &v1[1000..2000]),
                sized_member(
                    "multivol_snapshot/a/3",
                    EntryKind::Regular,
                    1,
                    &v1[2000..],
                    Some(3000),
                ),
                member("snapshot/b", EntryKind::Regular, 1, b"b1"),
                member("snapshot/c", EntryKind::Symlink("a".into()), 1, b""),
            ],
            vec![
                member("diff/a", EntryKind::Regular, 2, &delta(&v1, &v2)),
                member("deleted/b", EntryKind::Regular, 0, b""),
            ],
            vec![
                member("diff/a", EntryKind::Regular, 3, &delta(&v2, &v3)),
                member("snapshot/b", EntryKind::Regular, 3, b"b3"),
            ],
        ]
    }

    #[test]
    fn chain_is_folded() {
        let (restored, errors) = restore(chain(), "");
        assert_eq!(errors, 0);
        let mut v3 = vec![1_u8; 3000];
        v3[1500] = 2;
        v3.extend_from_slice(b"tail");
        assert_eq!(
            restored,
            [
                (".".to_owned(), Vec::new()),
                ("a".to_owned(), v3),
                ("b".to_owned(), b"b3".to_vec()),
                ("c".to_owned(), Vec::new()),
            ]
        );

        // Only the first two sets: b is deleted.
        let mut sets = chain();
        sets.truncate(2);
        let (restored, _) = restore(sets, "");
        let names: Vec<_> = restored.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, [".", "a", "c"]);
    }

    #[test]
    fn prefix_is_rerooted() {
        let (restored, errors) = restore(chain(), "b");
        assert_eq!(errors, 0);
        assert_eq!(restored, [(".".to_owned(), b"b3".to_vec())]);
    }

    #[test]
    fn missing_chunk_skips_entry() {
        let set = vec![
            member("multivol_snapshot/a/1", EntryKind::Regular, 1, b"x"),
            sized_member("multivol_snapshot/a/3", EntryKind::Regular, 1, b"z", Some(3)),
            sized_member("multivol_snapshot/b/2", EntryKind::Regular, 1, b"y", Some(2)),
            member("snapshot/c", EntryKind::Regular, 1, b"c"),
        ];
        let (restored, errors) = restore(vec![set], "");
        assert_eq!(errors, 2);
        assert_eq!(restored, [("c".to_owned(), b"c".to_vec())]);
    }

    #[test]
    fn lost_trailing_chunks_skip_entry() {
        // "a" was written as three chunks; the volume holding the third one is gone.
        let set = vec![
            member("multivol_snapshot/a/1", EntryKind::Regular, 1, b"xx"),
            member("multivol_snapshot/a/2", EntryKind::Regular, 1, b"yy"),
            member("snapshot/b", EntryKind::Regular, 1, b"b"),
        ];
        let (restored, errors) = restore(vec![set], "");
        assert_eq!(errors, 1);
        assert_eq!(restored, [("b".to_owned(), b"b".to_vec())]);

        // A size record that disagrees with the joined chunks is just as incomplete.
        let set = vec![
            member("multivol_snapshot/a/1", EntryKind::Regular, 1, b"xx"),
            sized_member("multivol_snapshot/a/2", EntryKind::Regular, 1, b"yy", Some(6)),
            member("snapshot/b", EntryKind::Regular, 1, b"b"),
        ];
        let (restored, errors) = restore(vec![set], "");
        assert_eq!(errors, 1);
        assert_eq!(restored, [("b".to_owned(), b"b".to_vec())]);
    }

    #[test]
    fn chunks_lost_with_counted_volume_are_not_counted_again() {
        let errors = ErrorCount::default();
        let source_errors = errors.clone();
        let mut members = vec![
            member("multivol_snapshot/a/1", EntryKind::Regular, 1, b"xx"),
            member("multivol_snapshot/a/2", EntryKind::Regular, 1, b"yy"),
            member("snapshot/b", EntryKind::Regular, 1, b"b"),
        ]
        .into_iter()
        .enumerate();
        // The volume between a/2 and b held a/3 and failed its hash check.
        let members = iter::from_fn(move || {
            let (position, member) = members.next()?;
            if position == 2 {
                source_errors.add();
            }
            Some(member)
        });
        let names: Vec<_> = SetEntries::new(members, Index::root(), errors.clone())
            .map(|item| item.unwrap().entry.index.to_string())
            .collect();
        assert_eq!(names, ["b"]);
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn diff_without_base_is_counted() {
        let set = vec![member("diff/a", EntryKind::Regular, 1, b"HDLT\0")];
        let (restored, errors) = restore(vec![set], "");
        assert!(restored.is_empty());
        assert_eq!(errors, 1);
    }
}

//! Names of members inside volume and signature tar files.
//!
//! `snapshot/a/b`, `diff/a/b`, `deleted/a/b`, `signature/a/b`, and for content split
//! across volumes `multivol_snapshot/a/b/3`. The root entry has an empty path, so its
//! member name is just the prefix.

use {crate::index::Index, std::fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffType {
    /// Full content or, for non-regular entries, metadata only.
    Snapshot,
    /// Binary delta against the previous version of a regular file.
    Diff,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Snapshot,
    Diff,
    Deleted,
    Signature,
    /// Continuation chunk of snapshot content, numbered from 1.
    MultivolSnapshot(u32),
    MultivolDiff(u32),
}

impl MemberKind {
    #[must_use]
    #[inline]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Diff => "diff",
            Self::Deleted => "deleted",
            Self::Signature => "signature",
            Self::MultivolSnapshot(_) => "multivol_snapshot",
            Self::MultivolDiff(_) => "multivol_diff",
        }
    }

    #[must_use]
    #[inline]
    pub fn diff_type(self) -> Option<DiffType> {
        match self {
            Self::Snapshot | Self::MultivolSnapshot(_) => Some(DiffType::Snapshot),
            Self::Diff | Self::MultivolDiff(_) => Some(DiffType::Diff),
            Self::Deleted => Some(DiffType::Deleted),
            Self::Signature => None,
        }
    }

    /// Chunk number for multivol members.
    #[must_use]
    #[inline]
    pub fn part(self) -> Option<u32> {
        match self {
            Self::MultivolSnapshot(part) | Self::MultivolDiff(part) => Some(part),
            Self::Snapshot | Self::Diff | Self::Deleted | Self::Signature => None,
        }
    }

    /// Multivol kind for the given content type and chunk number.
    #[must_use]
    #[inline]
    pub fn multivol(diff_type: DiffType, part: u32) -> Option<Self> {
        match diff_type {
            DiffType::Snapshot => Some(Self::MultivolSnapshot(part)),
            DiffType::Diff => Some(Self::MultivolDiff(part)),
            DiffType::Deleted => None,
        }
    }

    #[must_use]
    #[inline]
    pub fn single(diff_type: DiffType) -> Self {
        match diff_type {
            DiffType::Snapshot => Self::Snapshot,
            DiffType::Diff => Self::Diff,
            DiffType::Deleted => Self::Deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberName {
    pub kind: MemberKind,
    pub index: Index,
}

impl MemberName {
    #[must_use]
    #[inline]
    pub fn new(kind: MemberKind, index: Index) -> Self {
        Self { kind, index }
    }

    #[must_use]
    #[inline]
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim_end_matches('/');
        let (prefix, path) = name.split_once('/').unwrap_or((name, ""));
        let kind = match prefix {
            "snapshot" => MemberKind::Snapshot,
            "diff" => MemberKind::Diff,
            "deleted" => MemberKind::Deleted,
            "signature" => MemberKind::Signature,
            "multivol_snapshot" | "multivol_diff" => {
                let (path, part) = path.rsplit_once('/').unwrap_or(("", path));
                let part = part.parse().ok().filter(|&part| part > 0)?;
                let kind = if prefix == "multivol_snapshot" {
                    MemberKind::MultivolSnapshot(part)
                } else {
                    MemberKind::MultivolDiff(part)
                };
                return Some(Self::new(kind, path.parse().ok()?));
            }
            _ => return None,
        };
        Some(Self::new(kind, path.parse().ok()?))
    }
}

impl fmt::Display for MemberName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.prefix())?;
        if !self.index.is_root() {
            write!(f, "/{}", self.index.to_relative_string())?;
        }
        if let Some(part) = self.kind.part() {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn names() {
        let index: Index = "dir/file.txt".parse().unwrap();
        let cases = [
            (MemberKind::Snapshot, "snapshot/dir/file.txt"),
            (MemberKind::Diff, "diff/dir/file.txt"),
            (MemberKind::Deleted, "deleted/dir/file.txt"),
            (MemberKind::Signature, "signature/dir/file.txt"),
            (MemberKind::MultivolSnapshot(3), "multivol_snapshot/dir/file.txt/3"),
            (MemberKind::MultivolDiff(12), "multivol_diff/dir/file.txt/12"),
        ];
        for (kind, text) in cases {
            let name = MemberName::new(kind, index.clone());
            assert_eq!(name.to_string(), text);
            assert_eq!(MemberName::parse(text), Some(name));
        }
    }

    #[test]
    fn root() {
        let name = MemberName::new(MemberKind::Snapshot, Index::root());
        assert_eq!(name.to_string(), "snapshot");
        assert_eq!(MemberName::parse("snapshot/"), Some(name.clone()));
        assert_eq!(MemberName::parse("snapshot"), Some(name));
    }

    #[test]
    fn rejected() {
        assert_eq!(MemberName::parse("other/a"), None);
        assert_eq!(MemberName::parse("multivol_snapshot/a/0"), None);
        assert_eq!(MemberName::parse("multivol_diff/a/b"), None);
        assert_eq!(MemberName::parse("snapshot/a/../b"), None);
    }
}

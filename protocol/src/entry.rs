use {
    crate::index::Index,
    serde::{Deserialize, Serialize},
    std::{fmt, mem},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Block,
    Char,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub major: u32,
    pub minor: u32,
}

/// Type of a filesystem object together with the data only that type has.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink(String),
    Fifo,
    Device(Device),
    /// Tombstone: the object existed in an earlier session and is gone now.
    Deleted,
}

impl EntryKind {
    /// Short type name used in messages.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Regular => "reg",
            Self::Directory => "dir",
            Self::Symlink(_) => "sym",
            Self::Fifo => "fifo",
            Self::Device(_) => "dev",
            Self::Deleted => "deleted",
        }
    }

    fn same_type(&self, other: &EntryKind) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stat {
    /// Permission bits including setuid, setgid and sticky.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Modification time in whole unix seconds.
    pub mtime: i64,
}

impl Stat {
    #[must_use]
    #[inline]
    pub fn perms(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Negative and zero mtimes are all treated as equal.
    #[must_use]
    #[inline]
    pub fn same_mtime(&self, other: &Stat) -> bool {
        self.mtime == other.mtime || (self.mtime <= 0 && other.mtime <= 0)
    }
}

/// One filesystem object as seen by a tree walk or stored in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub index: Index,
    pub kind: EntryKind,
    pub stat: Stat,
    /// Content length of regular files, zero for everything else.
    pub size: u64,
}

impl Entry {
    #[must_use]
    #[inline]
    pub fn deleted(index: Index) -> Self {
        Self {
            index,
            kind: EntryKind::Deleted,
            stat: Stat::default(),
            size: 0,
        }
    }

    #[must_use]
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.kind == EntryKind::Deleted
    }

    #[must_use]
    #[inline]
    pub fn is_regular(&self) -> bool {
        self.kind == EntryKind::Regular
    }

    #[must_use]
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Quick unchanged check used when deciding whether an entry needs to be stored
    /// again: type, permissions, owner, mtime and, for regular files, size.
    #[must_use]
    #[inline]
    pub fn same_as(&self, other: &Entry) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            EntryKind::Deleted => true,
            EntryKind::Symlink(_) => {
                self.stat.uid == other.stat.uid && self.stat.gid == other.stat.gid
            }
            EntryKind::Regular => self.same_attributes(other) && self.size == other.size,
            EntryKind::Directory | EntryKind::Fifo | EntryKind::Device(_) => {
                self.same_attributes(other)
            }
        }
    }

    fn same_attributes(&self, other: &Entry) -> bool {
        self.stat.perms() == other.stat.perms()
            && self.stat.uid == other.stat.uid
            && self.stat.gid == other.stat.gid
            && self.stat.same_mtime(&other.stat)
    }
}

/// Reason why a restored entry differs from the one on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Difference {
    New,
    Missing,
    Type {
        found: &'static str,
        expected: &'static str,
    },
    Permissions {
        found: u32,
        expected: u32,
    },
    Mtime {
        found: i64,
        expected: i64,
    },
    SymlinkTarget,
    DeviceNumbers,
    Data,
}

impl fmt::Display for Difference {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new file"),
            Self::Missing => write!(f, "file is missing"),
            Self::Type { found, expected } => {
                write!(f, "file has type {found}, expected {expected}")
            }
            Self::Permissions { found, expected } => {
                write!(f, "file has permissions {found:o}, expected {expected:o}")
            }
            Self::Mtime { found, expected } => {
                write!(f, "file has mtime {found}, expected {expected}")
            }
            Self::SymlinkTarget => write!(f, "symlink target differs"),
            Self::DeviceNumbers => write!(f, "device numbers differ"),
            Self::Data => write!(f, "data is different"),
        }
    }
}

/// Compares a backed up entry with the current one, ignoring regular file content.
///
/// Ownership is not compared because a restore by an unprivileged user cannot
/// reproduce it.
#[must_use]
#[inline]
pub fn compare_metadata(backup: Option<&Entry>, current: Option<&Entry>) -> Option<Difference> {
    let backup = backup.filter(|e| !e.is_deleted());
    let current = current.filter(|e| !e.is_deleted());
    let (backup, current) = match (backup, current) {
        (None, None) => return None,
        (None, Some(_)) => return Some(Difference::New),
        (Some(_), None) => return Some(Difference::Missing),
        (Some(backup), Some(current)) => (backup, current),
    };
    if !backup.kind.same_type(&current.kind) {
        return Some(Difference::Type {
            found: current.kind.name(),
            expected: backup.kind.name(),
        });
    }
    match (&backup.kind, &current.kind) {
        (EntryKind::Symlink(expected), EntryKind::Symlink(found)) => {
            (expected != found).then_some(Difference::SymlinkTarget)
        }
        (EntryKind::Device(expected), EntryKind::Device(found)) if expected != found => {
            Some(Difference::DeviceNumbers)
        }
        _ => {
            if backup.stat.perms() != current.stat.perms() {
                Some(Difference::Permissions {
                    found: current.stat.perms(),
                    expected: backup.stat.perms(),
                })
            } else if !backup.stat.same_mtime(&current.stat) {
                Some(Difference::Mtime {
                    found: current.stat.mtime,
                    expected: backup.stat.mtime,
                })
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    fn file(mode: u32, mtime: i64, size: u64) -> Entry {
        Entry {
            index: "a".parse().unwrap(),
            kind: EntryKind::Regular,
            stat: Stat {
                mode,
                uid: 1000,
                gid: 1000,
                mtime,
            },
            size,
        }
    }

    #[test]
    fn unchanged_detection() {
        assert!(file(0o644, 10, 5).same_as(&file(0o100_644, 10, 5)));
        assert!(!file(0o644, 10, 5).same_as(&file(0o600, 10, 5)));
        assert!(!file(0o644, 10, 5).same_as(&file(0o644, 11, 5)));
        assert!(!file(0o644, 10, 5).same_as(&file(0o644, 10, 6)));
        assert!(file(0o644, -3, 5).same_as(&file(0o644, 0, 5)));
        let mut link = file(0o777, 1, 0);
        link.kind = EntryKind::Symlink("x".into());
        let mut other = link.clone();
        other.stat.mtime = 99;
        assert!(link.same_as(&other));
        other.kind = EntryKind::Symlink("y".into());
        assert!(!link.same_as(&other));
    }

    #[test]
    fn differences() {
        let a = file(0o644, 10, 5);
        assert_eq!(compare_metadata(Some(&a), Some(&a)), None);
        assert_eq!(compare_metadata(None, Some(&a)), Some(Difference::New));
        assert_eq!(compare_metadata(Some(&a), None), Some(Difference::Missing));
        assert_eq!(
            compare_metadata(Some(&Entry::deleted(a.index.clone())), None),
            None
        );
        assert_eq!(
            compare_metadata(Some(&a), Some(&file(0o600, 10, 5))),
            Some(Difference::Permissions {
                found: 0o600,
                expected: 0o644
            })
        );
        assert_eq!(
            compare_metadata(Some(&a), Some(&file(0o644, 12, 5))),
            Some(Difference::Mtime {
                found: 12,
                expected: 10
            })
        );
        let mut dir = a.clone();
        dir.kind = EntryKind::Directory;
        assert!(matches!(
            compare_metadata(Some(&a), Some(&dir)),
            Some(Difference::Type { .. })
        ));
    }
}

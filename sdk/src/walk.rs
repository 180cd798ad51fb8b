//! Sorted walk over a source directory.

use {
    crate::rules::Rules,
    anyhow::{Context as _, Result, bail},
    fs_err::{read_dir, read_link, symlink_metadata},
    heddle_protocol::{Device, DeviceKind, Entry, EntryKind, Index, Stat},
    rustix::fs::{major, minor},
    std::{
        fs::Metadata,
        io,
        os::unix::fs::{FileTypeExt, MetadataExt},
        path::{Path, PathBuf},
        vec,
    },
    tracing::warn,
};

/// Builds an entry from `lstat` data. Returns `None` for sockets and other objects
/// that are not backed up.
#[inline]
pub fn entry_from_metadata(index: Index, path: &Path, metadata: &Metadata) -> Result<Option<Entry>> {
    let file_type = metadata.file_type();
    let kind = if file_type.is_file() {
        EntryKind::Regular
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        let target = read_link(path)?;
        let Some(target) = target.to_str() else {
            bail!("symlink target is not valid UTF-8: {}", target.display());
        };
        EntryKind::Symlink(target.to_owned())
    } else if file_type.is_fifo() {
        EntryKind::Fifo
    } else if file_type.is_block_device() || file_type.is_char_device() {
        let rdev = metadata.rdev();
        EntryKind::Device(Device {
            kind: if file_type.is_block_device() {
                DeviceKind::Block
            } else {
                DeviceKind::Char
            },
            major: major(rdev),
            minor: minor(rdev),
        })
    } else {
        return Ok(None);
    };
    let size = if kind == EntryKind::Regular {
        metadata.len()
    } else {
        0
    };
    Ok(Some(Entry {
        index,
        kind,
        stat: Stat {
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime: metadata.mtime(),
        },
        size,
    }))
}

/// Reads the entry at `index` below `root`, if it exists.
#[inline]
pub fn read_entry(root: &Path, index: &Index) -> Result<Option<Entry>> {
    let path = index.to_path(root);
    let metadata = match symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    entry_from_metadata(index.clone(), &path, &metadata)
}

struct DirFrame {
    index: Index,
    children: vec::IntoIter<String>,
}

/// Pre-order walk yielding entries in ascending index order.
///
/// Unreadable entries are logged, counted in [`TreeWalk::errors`] and skipped along
/// with their subtrees.
pub struct TreeWalk {
    root: PathBuf,
    rules: Rules,
    stack: Vec<DirFrame>,
    root_pending: bool,
    errors: u64,
}

impl TreeWalk {
    #[inline]
    pub fn new(root: impl Into<PathBuf>, rules: Rules) -> Result<Self> {
        let root = root.into();
        let metadata = symlink_metadata(&root)?;
        if !metadata.is_dir() {
            bail!("source must be a directory: {}", root.display());
        }
        Ok(Self {
            root,
            rules,
            stack: Vec::new(),
            root_pending: true,
            errors: 0,
        })
    }

    #[must_use]
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    #[inline]
    pub fn errors(&self) -> u64 {
        self.errors
    }

    fn children(&mut self, index: &Index, path: &Path) -> Vec<String> {
        let entries = match read_dir(path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %index, error = %err, "failed to list directory");
                self.errors = self.errors.saturating_add(1);
                return Vec::new();
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(path = %index, error = %err, "failed to list directory");
                    self.errors = self.errors.saturating_add(1);
                    continue;
                }
            };
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => {
                    warn!(path = %index, ?name, "skipping file with non-UTF-8 name");
                    self.errors = self.errors.saturating_add(1);
                }
            }
        }
        names.sort_unstable();
        names
    }

    fn visit(&mut self, index: Index) -> Result<Option<Entry>> {
        let path = index.to_path(&self.root);
        let metadata = symlink_metadata(&path)?;
        let Some(entry) = entry_from_metadata(index, &path, &metadata)
            .with_context(|| format!("failed to read {}", path.display()))?
        else {
            return Ok(None);
        };
        if entry.is_dir() {
            let children = self.children(&entry.index, &path);
            self.stack.push(DirFrame {
                index: entry.index.clone(),
                children: children.into_iter(),
            });
        }
        Ok(Some(entry))
    }
}

impl Iterator for TreeWalk {
    type Item = Entry;

    #[inline]
    fn next(&mut self) -> Option<Entry> {
        if self.root_pending {
            self.root_pending = false;
            match self.visit(Index::root()) {
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => return None,
                Err(err) => {
                    warn!(error = %err, "failed to read source root");
                    self.errors = self.errors.saturating_add(1);
                    return None;
                }
            }
        }
        loop {
            let frame = self.stack.last_mut()?;
            let Some(name) = frame.children.next() else {
                self.stack.pop();
                continue;
            };
            let index = match frame.index.join_one(&name) {
                Ok(index) => index,
                Err(err) => {
                    warn!(error = %err, ?name, "skipping unsupported file name");
                    self.errors = self.errors.saturating_add(1);
                    continue;
                }
            };
            if self.rules.excludes(&index) {
                continue;
            }
            match self.visit(index.clone()) {
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %index, error = %err, "skipping unreadable entry");
                    self.errors = self.errors.saturating_add(1);
                }
            }
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use {
        super::*,
        crate::rules::Rule,
        fs_err::{create_dir_all, write},
        std::os::unix::fs::symlink,
    };

    #[test]
    fn sorted_preorder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        create_dir_all(root.join("a/b")).unwrap();
        create_dir_all(root.join("a-")).unwrap();
        create_dir_all(root.join("skip/inner")).unwrap();
        write(root.join("a/b/f"), "x").unwrap();
        write(root.join("a/z"), "yy").unwrap();
        write(root.join("0"), "").unwrap();
        symlink("a/z", root.join("link")).unwrap();

        let rules = Rules(vec![Rule::NameEquals("skip".into())]);
        let mut walk = TreeWalk::new(root, rules).unwrap();
        let entries: Vec<_> = walk.by_ref().collect();
        let indexes: Vec<_> = entries.iter().map(|e| e.index.to_string()).collect();
        assert_eq!(indexes, [".", "0", "a", "a/b", "a/b/f", "a/z", "a-", "link"]);
        assert!(entries.windows(2).all(|w| w[0].index < w[1].index));
        assert_eq!(walk.errors(), 0);

        let z = entries.iter().find(|e| e.index.to_string() == "a/z").unwrap();
        assert_eq!(z.size, 2);
        let link = entries.last().unwrap();
        assert_eq!(link.kind, EntryKind::Symlink("a/z".into()));
    }

    #[test]
    fn source_must_be_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(TreeWalk::new(file.path(), Rules::default()).is_err());
    }
}

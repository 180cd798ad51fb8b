//! Writing restored entries to disk.

use {
    crate::patch::{ErrorCount, RestoredEntry},
    anyhow::{Context as _, Result, bail},
    filetime::{FileTime, set_file_mtime, set_symlink_file_times},
    fs_err::{File, create_dir, create_dir_all, remove_dir_all, remove_file, set_permissions},
    heddle_protocol::{DeviceKind, Entry, EntryKind, Index, Stat},
    rustix::fs::{CWD, FileType, Mode, makedev, mknodat},
    std::{
        fs::Permissions,
        io,
        os::unix::fs::{PermissionsExt, lchown, symlink},
        path::{Path, PathBuf},
    },
    tracing::{debug, warn},
};

/// A directory whose permissions and mtime are applied once all entries below it
/// have been written.
struct DirFrame {
    index: Index,
    path: PathBuf,
    stat: Stat,
}

/// Writes a stream of restored entries, in index order, below `root`.
pub struct TreeWriter {
    root: PathBuf,
    frames: Vec<DirFrame>,
    written: u64,
    errors: ErrorCount,
}

impl TreeWriter {
    #[inline]
    pub fn new(root: impl Into<PathBuf>, errors: ErrorCount) -> Self {
        Self {
            root: root.into(),
            frames: Vec::new(),
            written: 0,
            errors,
        }
    }

    /// Number of entries written so far.
    #[must_use]
    #[inline]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes one entry. Failures are logged and counted, not returned.
    #[inline]
    pub fn write(&mut self, restored: RestoredEntry) {
        let index = restored.entry.index.clone();
        while let Some(frame) = self.frames.last() {
            if index.starts_with(&frame.index) && index != frame.index {
                break;
            }
            self.pop_frame();
        }
        match self.write_entry(restored) {
            Ok(()) => self.written = self.written.saturating_add(1),
            Err(err) => {
                warn!(path = %index, error = format!("{err:#}"), "failed to restore entry");
                self.errors.add();
            }
        }
    }

    /// Applies the metadata of all directories that are still open.
    #[inline]
    pub fn finish(mut self) -> u64 {
        while !self.frames.is_empty() {
            self.pop_frame();
        }
        self.written
    }

    fn pop_frame(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let result = set_permissions(&frame.path, Permissions::from_mode(frame.stat.perms()))
            .map_err(anyhow::Error::from)
            .and_then(|()| set_mtime(&frame.path, &frame.stat));
        if let Err(err) = result {
            warn!(path = %frame.index, error = %err, "failed to set directory metadata");
            self.errors.add();
        }
    }

    fn write_entry(&mut self, restored: RestoredEntry) -> Result<()> {
        let RestoredEntry { entry, content } = restored;
        let path = entry.index.to_path(&self.root);
        debug!(path = %entry.index, kind = entry.kind.name(), "restoring");
        if let Some(parent) = path.parent()
            && !entry.index.is_root()
        {
            create_dir_all(parent)?;
        }
        if entry.is_dir() {
            prepare_dir(&path)?;
            set_owner(&path, &entry.stat);
            self.frames.push(DirFrame {
                index: entry.index,
                path,
                stat: entry.stat,
            });
            return Ok(());
        }
        remove_existing(&path)?;
        match &entry.kind {
            EntryKind::Regular => {
                let mut file = File::create(&path)?;
                if let Some(mut content) = content {
                    io::copy(&mut content, &mut file)?;
                }
                file.sync_all()?;
                drop(file);
                set_permissions(&path, Permissions::from_mode(entry.stat.perms()))?;
                set_owner(&path, &entry.stat);
                set_mtime(&path, &entry.stat)?;
            }
            EntryKind::Symlink(target) => {
                symlink(target, &path)
                    .with_context(|| format!("failed to create symlink {}", path.display()))?;
                set_owner(&path, &entry.stat);
                let mtime = FileTime::from_unix_time(entry.stat.mtime, 0);
                set_symlink_file_times(&path, mtime, mtime)?;
            }
            EntryKind::Fifo | EntryKind::Device(_) => {
                make_node(&path, &entry)?;
                set_owner(&path, &entry.stat);
                set_mtime(&path, &entry.stat)?;
            }
            EntryKind::Directory | EntryKind::Deleted => {
                bail!("unexpected {} entry", entry.kind.name());
            }
        }
        Ok(())
    }
}

/// Makes sure `path` is a writable directory until its final permissions are set.
fn prepare_dir(path: &Path) -> Result<()> {
    match fs_err::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            remove_file(path)?;
            create_dir(path)?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => create_dir(path)?,
        Err(err) => return Err(err.into()),
    }
    set_permissions(path, Permissions::from_mode(0o700))?;
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs_err::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => {
            warn!(path = %path.display(), "replacing existing directory");
            remove_dir_all(path)?;
        }
        Ok(_) => remove_file(path)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

/// Ownership is restored when permitted; failures are expected for non-root users.
fn set_owner(path: &Path, stat: &Stat) {
    if let Err(err) = lchown(path, Some(stat.uid), Some(stat.gid)) {
        debug!(path = %path.display(), error = %err, "failed to set owner");
    }
}

fn set_mtime(path: &Path, stat: &Stat) -> Result<()> {
    set_file_mtime(path, FileTime::from_unix_time(stat.mtime, 0))
        .with_context(|| format!("failed to set mtime of {}", path.display()))
}

fn make_node(path: &Path, entry: &Entry) -> Result<()> {
    let (file_type, dev) = match &entry.kind {
        EntryKind::Fifo => (FileType::Fifo, 0),
        EntryKind::Device(device) => (
            match device.kind {
                DeviceKind::Block => FileType::BlockDevice,
                DeviceKind::Char => FileType::CharacterDevice,
            },
            makedev(device.major, device.minor),
        ),
        EntryKind::Regular
        | EntryKind::Directory
        | EntryKind::Symlink(_)
        | EntryKind::Deleted => bail!("not a special file"),
    };
    mknodat(
        CWD,
        path,
        file_type,
        Mode::from_bits_truncate(entry.stat.perms()),
        dev,
    )
    .with_context(|| format!("failed to create {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {
        super::*,
        crate::patch::new_content,
        fs_err::{read, read_link, symlink_metadata},
        parking_lot::Mutex,
        std::{
            io::{Seek, SeekFrom, Write},
            os::unix::fs::{FileTypeExt, MetadataExt},
            sync::Arc,
        },
    };

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl Write for Logs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn restored(path: &str, kind: EntryKind, mode: u32, data: Option<&[u8]>) -> RestoredEntry {
        let content = data.map(|data| {
            let mut content = new_content();
            content.write_all(data).unwrap();
            content.seek(SeekFrom::Start(0)).unwrap();
            content
        });
        RestoredEntry {
            entry: Entry {
                index: path.parse().unwrap(),
                kind,
                stat: Stat {
                    mode,
                    uid: 0,
                    gid: 0,
                    mtime: 1_500_000_000,
                },
                size: 0,
            },
            content,
        }
    }

    #[test]
    fn writes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        let errors = ErrorCount::default();
        let mut writer = TreeWriter::new(&root, errors.clone());
        writer.write(restored("", EntryKind::Directory, 0o755, None));
        writer.write(restored("ro", EntryKind::Directory, 0o555, None));
        writer.write(restored("ro/f", EntryKind::Regular, 0o600, Some(b"data")));
        writer.write(restored("ro/l", EntryKind::Symlink("f".into()), 0o777, None));
        writer.write(restored("z", EntryKind::Fifo, 0o644, None));
        assert_eq!(writer.finish(), 5);
        assert_eq!(errors.get(), 0);

        assert_eq!(read(root.join("ro/f")).unwrap(), b"data");
        assert_eq!(read_link(root.join("ro/l")).unwrap(), Path::new("f"));
        let ro = symlink_metadata(root.join("ro")).unwrap();
        assert_eq!(ro.mode() & 0o7777, 0o555);
        assert_eq!(ro.mtime(), 1_500_000_000);
        let file = symlink_metadata(root.join("ro/f")).unwrap();
        assert_eq!(file.mode() & 0o7777, 0o600);
        assert_eq!(file.mtime(), 1_500_000_000);
        assert!(symlink_metadata(root.join("z")).unwrap().file_type().is_fifo());

        set_permissions(root.join("ro"), Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn replaces_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(dir.path().join("x")).unwrap();
        fs_err::write(dir.path().join("x/old"), "old").unwrap();
        fs_err::write(dir.path().join("y"), "old").unwrap();
        let logs = Logs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let mut writer = TreeWriter::new(dir.path(), ErrorCount::default());
            writer.write(restored("x", EntryKind::Regular, 0o644, Some(b"new")));
            writer.write(restored("y", EntryKind::Regular, 0o644, Some(b"newer")));
            writer.finish();
        });
        assert_eq!(read(dir.path().join("x")).unwrap(), b"new");
        assert_eq!(read(dir.path().join("y")).unwrap(), b"newer");
        let logs = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert_eq!(logs.matches("replacing existing directory").count(), 1);
        assert!(logs.contains(&dir.path().join("x").display().to_string()));
    }
}

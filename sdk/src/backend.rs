//! Where archive files are stored.
//!
//! The engine talks to storage only through [`Backend`]: whole-file put, get, list and
//! delete. The local directory backend is the only built-in one; it is wrapped in
//! [`RetryingBackend`] so transient failures are retried with backoff.

use {
    crate::retry::{AttemptError, RetryPolicy, ok_or_retry},
    anyhow::{Context as _, Error, Result, bail},
    fs_err::{File, create_dir_all, read_dir, remove_file},
    std::{
        io::{self, ErrorKind},
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
    tracing::{debug, instrument},
    url::Url,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub size: u64,
}

pub trait Backend: Send + Sync {
    /// Stores the contents of `local` as `remote_name`, replacing any existing file.
    fn put(&self, local: &Path, remote_name: &str) -> Result<()>;

    /// Copies `remote_name` into the file at `local`.
    fn get(&self, remote_name: &str, local: &Path) -> Result<()>;

    fn list(&self) -> Result<Vec<RemoteFile>>;

    /// Deletes the named files. Missing files are not an error.
    fn delete(&self, remote_names: &[String]) -> Result<()>;

    /// Human-readable location for messages.
    fn location(&self) -> String;
}

/// Opens the backend for a target given as a `file://` URL or a plain path.
#[inline]
pub fn open_backend(target: &str, policy: RetryPolicy) -> Result<Box<dyn Backend>> {
    let root = target_path(target)?;
    Ok(Box::new(RetryingBackend::new(LocalBackend::new(root)?, policy)))
}

/// Local path of a `file://` URL or plain path target.
#[inline]
pub fn target_path(target: &str) -> Result<PathBuf> {
    if target.contains("://") {
        let url = Url::parse(target).with_context(|| format!("invalid target URL: {target}"))?;
        if url.scheme() != "file" {
            bail!("unsupported backend scheme {:?}", url.scheme());
        }
        url.to_file_path()
            .map_err(|()| anyhow::anyhow!("invalid file URL: {target}"))
    } else {
        Ok(PathBuf::from(target))
    }
}

#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    #[inline]
    pub fn new(root: PathBuf) -> Result<Self> {
        create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, remote_name: &str) -> Result<PathBuf> {
        if remote_name.is_empty()
            || remote_name.contains('/')
            || remote_name.contains('\\')
            || remote_name == "."
            || remote_name == ".."
        {
            bail!("invalid remote file name: {remote_name:?}");
        }
        Ok(self.root.join(remote_name))
    }
}

impl Backend for LocalBackend {
    fn put(&self, local: &Path, remote_name: &str) -> Result<()> {
        let target = self.path(remote_name)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        io::copy(&mut File::open(local)?, &mut tmp)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target)
            .with_context(|| format!("failed to store {}", target.display()))?;
        Ok(())
    }

    fn get(&self, remote_name: &str, local: &Path) -> Result<()> {
        let source = self.path(remote_name)?;
        io::copy(&mut File::open(source)?, &mut File::create(local)?)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<RemoteFile>> {
        let mut files = Vec::new();
        for entry in read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            // Leftovers of interrupted puts.
            if name.starts_with(".tmp") {
                continue;
            }
            files.push(RemoteFile {
                name,
                size: metadata.len(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn delete(&self, remote_names: &[String]) -> Result<()> {
        for name in remote_names {
            match remove_file(self.path(name)?) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// Retries transient failures of the inner backend.
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B> RetryingBackend<B> {
    #[inline]
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

fn classify(err: Error) -> AttemptError {
    let transient = err.chain().any(|cause| {
        cause.downcast_ref::<io::Error>().is_some_and(|err| {
            matches!(
                err.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::TimedOut
                    | ErrorKind::WouldBlock
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::ResourceBusy
            )
        })
    });
    if transient {
        AttemptError::Transient(err)
    } else {
        AttemptError::Application(err)
    }
}

impl<B: Backend> Backend for RetryingBackend<B> {
    #[instrument(skip_all, fields(remote_name = %remote_name))]
    fn put(&self, local: &Path, remote_name: &str) -> Result<()> {
        debug!("put");
        ok_or_retry(&self.policy, || {
            self.inner.put(local, remote_name).map_err(classify)
        })
        .with_context(|| format!("failed to put {remote_name}"))
    }

    #[instrument(skip_all, fields(remote_name = %remote_name))]
    fn get(&self, remote_name: &str, local: &Path) -> Result<()> {
        debug!("get");
        ok_or_retry(&self.policy, || {
            self.inner.get(remote_name, local).map_err(classify)
        })
        .with_context(|| format!("failed to get {remote_name}"))
    }

    fn list(&self) -> Result<Vec<RemoteFile>> {
        ok_or_retry(&self.policy, || self.inner.list().map_err(classify))
            .with_context(|| format!("failed to list {}", self.inner.location()))
    }

    fn delete(&self, remote_names: &[String]) -> Result<()> {
        ok_or_retry(&self.policy, || {
            self.inner.delete(remote_names).map_err(classify)
        })
        .context("failed to delete remote files")
    }

    fn location(&self) -> String {
        self.inner.location()
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {super::*, std::io::Write, tempfile::TempDir};

    #[test]
    fn local_backend() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(
            &format!("file://{}", dir.path().join("repo").display()),
            RetryPolicy::default(),
        )
        .unwrap();

        let mut local = NamedTempFile::new().unwrap();
        writeln!(local, "ok").unwrap();
        backend.put(local.path(), "b.txt").unwrap();
        backend.put(local.path(), "a.txt").unwrap();

        let names: Vec<_> = backend.list().unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);

        let out = NamedTempFile::new().unwrap();
        backend.get("a.txt", out.path()).unwrap();
        assert_eq!(fs_err::read_to_string(out.path()).unwrap(), "ok\n");

        backend
            .delete(&["a.txt".to_owned(), "missing".to_owned()])
            .unwrap();
        assert_eq!(backend.list().unwrap().len(), 1);
        backend.get("a.txt", out.path()).unwrap_err();
        backend.put(local.path(), "../escape").unwrap_err();
    }

    #[test]
    fn targets() {
        assert_eq!(target_path("/tmp/x").unwrap(), PathBuf::from("/tmp/x"));
        assert_eq!(target_path("file:///tmp/x").unwrap(), PathBuf::from("/tmp/x"));
        target_path("s3://bucket/x").unwrap_err();
    }
}

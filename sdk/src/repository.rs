//! Backup sessions, restores and maintenance of one repository.
//!
//! A repository is a backend plus a local archive directory that caches the manifests
//! and signature files of the active chain. Everything else is derived from the file
//! listings via [`CollectionStatus`].

use {
    crate::{
        backend::Backend,
        collections::{BackupChain, BackupSet, CollectionStatus, Extraneous, SignatureChain},
        crypto::{Encryptor, HashingWriter},
        diff::{DiffIter, SessionStats},
        envelope,
        patch::{ErrorCount, PatchIter, RestoredEntry, SetEntries},
        rules::Rules,
        sigtar::{SigTarReader, live_entries},
        tarfile::{TarMember, TarReader},
        treewriter::TreeWriter,
        volume::{VolumeSink, VolumeWriter},
        walk::{TreeWalk, read_entry},
    },
    anyhow::{Context as _, Result, bail},
    chrono::{TimeDelta, Utc},
    fs_err::{File, create_dir_all, read_dir, read_to_string, remove_file},
    heddle_protocol::{
        DateTimeUtc, Entry, Error, Index,
        entry::{Difference, compare_metadata},
        manifest::{Manifest, VolumeHash},
        naming::{Encoding, NameKind, NameStyle, ParsedName},
        time::whole_seconds,
    },
    sha1::Sha1,
    sha2::{Digest, Sha256},
    std::{
        cmp::Ordering,
        io::{self, BufReader, BufWriter, Read},
        iter,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
        vec,
    },
    tempfile::{NamedTempFile, TempDir},
    tracing::{debug, info, instrument, warn},
};

const HASH_ALGORITHM: &str = "SHA1";
const COMPARE_CHUNK_LEN: u64 = 64 * 1024;

/// Settings of a repository that come from the configuration.
#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    pub volume_size: u64,
    pub compact_names: bool,
    /// Gzip volumes and signatures that are not encrypted.
    pub compression: bool,
    pub allow_source_mismatch: bool,
    /// Base of the local archive directories of all repositories.
    pub archive_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Incremental if a chain exists and is not older than the given age.
    Auto { full_if_older_than: Option<Duration> },
    Full,
    Incremental,
}

/// What to back up.
#[derive(Debug, Clone)]
pub struct BackupSource {
    pub path: PathBuf,
    pub rules: Rules,
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub written: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub compared: u64,
    pub differences: u64,
    pub errors: u64,
}

/// A stored volume and the hash its manifest records for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCheck {
    pub name: String,
    pub hash: Option<VolumeHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Volume,
    Signatures,
    Manifest,
}

#[derive(Debug, Clone, Copy)]
enum Session {
    Full(DateTimeUtc),
    Incremental {
        start: DateTimeUtc,
        end: DateTimeUtc,
    },
}

impl Session {
    fn volume(self, volume: u32) -> NameKind {
        match self {
            Self::Full(time) => NameKind::FullVolume { time, volume },
            Self::Incremental { start, end } => NameKind::IncVolume { start, end, volume },
        }
    }

    fn manifest(self) -> NameKind {
        match self {
            Self::Full(time) => NameKind::FullManifest { time },
            Self::Incremental { start, end } => NameKind::IncManifest { start, end },
        }
    }

    fn signatures(self) -> NameKind {
        match self {
            Self::Full(time) => NameKind::FullSignatures { time },
            Self::Incremental { start, end } => NameKind::NewSignatures { start, end },
        }
    }
}

/// Name of the archive directory of a target: a hex SHA-256 prefix of the target URL.
#[must_use]
#[inline]
pub fn backup_name(target: &str) -> String {
    let digest = Sha256::digest(target.as_bytes());
    hex::encode(digest.get(..16).unwrap_or_default())
}

pub struct Repository {
    backend: Box<dyn Backend>,
    encryptor: Option<Arc<dyn Encryptor>>,
    options: RepositoryOptions,
    archive_dir: PathBuf,
    temp_dir: TempDir,
}

impl Repository {
    /// Opens the repository at `target`. Files are encrypted iff `encryptor` is set.
    #[inline]
    pub fn open(
        target: &str,
        backend: Box<dyn Backend>,
        encryptor: Option<Arc<dyn Encryptor>>,
        options: RepositoryOptions,
    ) -> Result<Self> {
        let archive_dir = options.archive_dir.join(backup_name(target));
        create_dir_all(&archive_dir)?;
        Ok(Self {
            backend,
            encryptor,
            options,
            archive_dir,
            temp_dir: TempDir::new()?,
        })
    }

    #[must_use]
    #[inline]
    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    #[must_use]
    #[inline]
    pub fn location(&self) -> String {
        self.backend.location()
    }

    fn style(&self) -> NameStyle {
        if self.options.compact_names {
            NameStyle::Compact
        } else {
            NameStyle::Verbose
        }
    }

    fn encoding(&self, role: Role) -> Encoding {
        if self.encryptor.is_some() {
            Encoding::Encrypted
        } else if self.options.compression && role != Role::Manifest {
            Encoding::Gzip
        } else {
            Encoding::Plain
        }
    }

    fn remote_name(&self, kind: NameKind, role: Role) -> String {
        ParsedName::new(kind, self.encoding(role), self.style()).generate()
    }

    fn local_name(&self, kind: NameKind) -> String {
        ParsedName::new(kind, Encoding::Plain, self.style()).generate()
    }

    fn encryptor(&self) -> Option<&dyn Encryptor> {
        self.encryptor.as_deref()
    }

    fn local_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in read_dir(&self.archive_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }

    /// Collates the remote listing and the local archive directory.
    #[inline]
    pub fn collection_status(&self) -> Result<CollectionStatus> {
        let remote = self.backend.list()?;
        let local = self.local_names()?;
        Ok(CollectionStatus::new(&remote, &local))
    }

    /// Copies the manifests and signatures of the active chain into the local archive
    /// directory if they are missing there.
    #[instrument(skip_all)]
    #[inline]
    pub fn sync_local_cache(&self) -> Result<CollectionStatus> {
        let status = self.collection_status()?;
        let mut fetched = false;
        if let Some((sig_chain, chain)) = status.matched_chain_pair() {
            if !sig_chain.is_local() {
                for file in sig_chain.files() {
                    self.copy_to_local(&file.name)?;
                    fetched = true;
                }
            }
            for set in chain.sets() {
                if set.local_manifest_name().is_none()
                    && let Some(name) = set.manifest_name()
                {
                    self.copy_to_local(name)?;
                    fetched = true;
                }
            }
        }
        if fetched {
            self.collection_status()
        } else {
            Ok(status)
        }
    }

    fn copy_to_local(&self, remote_name: &str) -> Result<()> {
        let parsed = ParsedName::parse(remote_name)
            .with_context(|| format!("unexpected file name {remote_name:?}"))?;
        info!(name = remote_name, "copying to local archive directory");
        let plain = self.fetch(remote_name, None)?;
        self.write_local(parsed.kind, plain.path())
    }

    fn write_local(&self, kind: NameKind, plain: &Path) -> Result<()> {
        let target = self.archive_dir.join(self.local_name(kind));
        let mut tmp = NamedTempFile::new_in(&self.archive_dir)?;
        io::copy(&mut File::open(plain)?, &mut tmp)?;
        tmp.persist(&target)
            .with_context(|| format!("failed to write {}", target.display()))?;
        Ok(())
    }

    /// Seals `plain` and uploads it as `name`. Returns the hash of the stored bytes.
    fn store(&self, name: &str, role: Role, plain: &Path) -> Result<VolumeHash> {
        let stored = NamedTempFile::new_in(self.temp_dir.path())?;
        let mut writer = HashingWriter::<_, Sha1>::new(BufWriter::new(stored.reopen()?));
        envelope::seal(
            self.encoding(role),
            self.encryptor(),
            &mut BufReader::new(File::open(plain)?),
            &mut writer,
        )?;
        let (_, digest, size) = writer.finish()?;
        debug!(name, size, "storing");
        self.backend.put(stored.path(), name)?;
        Ok(VolumeHash {
            algorithm: HASH_ALGORITHM.into(),
            value: hex::encode(digest),
        })
    }

    /// Downloads `name`, checks its hash if one is given and returns the plain content.
    fn fetch(&self, name: &str, expected: Option<&VolumeHash>) -> Result<NamedTempFile> {
        let stored = NamedTempFile::new_in(self.temp_dir.path())?;
        self.backend.get(name, stored.path())?;
        if let Some(expected) = expected {
            check_hash(name, stored.path(), expected)?;
        }
        let encoding = ParsedName::parse(name).map_or(Encoding::Plain, |parsed| parsed.encoding);
        let plain = NamedTempFile::new_in(self.temp_dir.path())?;
        envelope::open(
            encoding,
            self.encryptor(),
            &mut BufReader::new(File::open(stored.path())?),
            &mut BufWriter::new(plain.reopen()?),
        )
        .with_context(|| format!("failed to read {name}"))?;
        Ok(plain)
    }

    fn open_fetched(plain: &NamedTempFile) -> Result<File> {
        Ok(File::from_parts(plain.reopen()?, plain.path()))
    }

    /// Reads the manifest of a set and checks it against the local copy.
    #[inline]
    pub fn get_manifest(&self, set: &BackupSet) -> Result<Manifest> {
        let Some(remote_name) = set.manifest_name() else {
            bail!("backup set at {} has no manifest", set.time());
        };
        let plain = self.fetch(remote_name, None)?;
        let remote_text = read_to_string(plain.path())?;
        match set.local_manifest_name() {
            Some(local_name) => {
                let local_text = read_to_string(self.archive_dir.join(local_name))?;
                if local_text != remote_text {
                    return Err(Error::Integrity(format!(
                        "local manifest {local_name} does not match remote manifest {remote_name}"
                    ))
                    .into());
                }
            }
            None => {
                if let Some(parsed) = ParsedName::parse(remote_name) {
                    self.write_local(parsed.kind, plain.path())?;
                }
            }
        }
        let manifest = Manifest::from_text(&remote_text)?;
        manifest.check_contiguous()?;
        Ok(manifest)
    }

    fn signature_streams(
        &self,
        sig_chain: &SignatureChain,
        time: DateTimeUtc,
    ) -> Result<Vec<SigTarReader<BufReader<File>>>> {
        let mut streams = Vec::new();
        for file in sig_chain.files_at_time(time) {
            let reader = if sig_chain.is_local() {
                File::open(self.archive_dir.join(&file.name))?
            } else {
                Self::open_fetched(&self.fetch(&file.name, None)?)?
            };
            streams.push(SigTarReader::new(BufReader::new(reader)));
        }
        Ok(streams)
    }

    /// Runs one backup session and returns its statistics.
    #[instrument(skip_all)]
    #[inline]
    pub fn backup(&self, source: &BackupSource, mode: BackupMode) -> Result<SessionStats> {
        let status = self.sync_local_cache()?;
        let now = whole_seconds(Utc::now());
        let time = status
            .newest_file_time()
            .and_then(|newest| newest.checked_add_signed(TimeDelta::seconds(1)))
            .map_or(now, |next| now.max(next));
        let base = match mode {
            BackupMode::Full => None,
            BackupMode::Incremental => Some(status.matched_chain_pair().context(
                "no backup chain with signatures found; a full backup is needed first",
            )?),
            BackupMode::Auto { full_if_older_than } => {
                status.matched_chain_pair().filter(|(_, chain)| {
                    full_if_older_than.is_none_or(|age| {
                        TimeDelta::from_std(age)
                            .ok()
                            .and_then(|age| chain.start_time().checked_add_signed(age))
                            .is_some_and(|limit| limit > now)
                    })
                })
            }
        };
        let local_dir = source.path.display().to_string();
        let (session, streams) = match base {
            Some((sig_chain, chain)) => {
                let manifest = self.get_manifest(chain.last())?;
                manifest.check_dirinfo(
                    &source.hostname,
                    &local_dir,
                    self.options.allow_source_mismatch,
                )?;
                let streams = self.signature_streams(sig_chain, chain.end_time())?;
                let session = Session::Incremental {
                    start: chain.end_time(),
                    end: time,
                };
                (session, streams)
            }
            None => (Session::Full(time), Vec::new()),
        };
        info!(
            kind = if streams.is_empty() { "full" } else { "incremental" },
            %time,
            source = %local_dir,
            "starting backup"
        );

        let mut walk = TreeWalk::new(&source.path, source.rules.clone())?;
        let signatures = NamedTempFile::new_in(self.temp_dir.path())?;
        let mut sink = RemoteSink {
            repository: self,
            session,
        };
        let mut volumes = VolumeWriter::new(
            self.options.volume_size,
            self.temp_dir.path(),
            Manifest::new(Some(source.hostname.clone()), Some(local_dir)),
            &mut sink,
        )?;
        let mut diff = DiffIter::new(
            live_entries(streams),
            &mut walk,
            &source.path,
            BufWriter::new(signatures.reopen()?),
        );
        for item in diff.by_ref() {
            volumes.add(item?)?;
        }
        let (mut stats, writer) = diff.finish()?;
        writer.into_inner().map_err(|err| err.into_error())?;
        stats.errors = stats.errors.saturating_add(walk.errors());
        stats.volume_bytes = volumes.volume_bytes();
        let manifest = volumes.finish()?;

        let sig_name = self.remote_name(session.signatures(), Role::Signatures);
        self.store(&sig_name, Role::Signatures, signatures.path())?;
        self.write_local(session.signatures(), signatures.path())?;

        let manifest_file = NamedTempFile::new_in(self.temp_dir.path())?;
        fs_err::write(manifest_file.path(), manifest.to_text())?;
        // Written last: a set without a manifest is incomplete.
        let manifest_name = self.remote_name(session.manifest(), Role::Manifest);
        self.store(&manifest_name, Role::Manifest, manifest_file.path())?;
        self.write_local(session.manifest(), manifest_file.path())?;

        stats.log();
        Ok(stats)
    }

    fn chain_at(
        status: &CollectionStatus,
        time: Option<DateTimeUtc>,
    ) -> Result<(BackupChain, DateTimeUtc)> {
        let time = match time {
            Some(time) => time,
            None => status.latest_time().context("no backup chains found")?,
        };
        let chain = status.get_backup_chain_at_time(time)?;
        Ok((chain.clone(), time))
    }

    /// Entries of the sets of `chain` at `time`, restricted to `prefix`.
    fn set_entries(
        &self,
        chain: &BackupChain,
        time: DateTimeUtc,
        prefix: &Index,
        errors: &ErrorCount,
    ) -> Result<Vec<SetEntries<VolumeMembers<'_>>>> {
        let mut sets = Vec::new();
        for set in chain.sets_at_time(time) {
            let manifest = self.get_manifest(set)?;
            let mut volumes = Vec::new();
            for number in manifest.get_containing_volumes(prefix) {
                let Some(name) = set.volume_name(number) else {
                    warn!(volume = number, set = %set.time(), "volume listed in manifest is missing");
                    errors.add();
                    continue;
                };
                let hash = manifest.volume(number).and_then(|info| info.hash.clone());
                volumes.push(VolumeCheck {
                    name: name.to_owned(),
                    hash,
                });
            }
            let members = VolumeMembers {
                repository: self,
                pending: volumes.into_iter(),
                current: None,
                errors: errors.clone(),
            };
            sets.push(SetEntries::new(members, prefix.clone(), errors.clone()));
        }
        Ok(sets)
    }

    /// Restores the state at `time` (latest if `None`) of `prefix` into `target`.
    #[instrument(skip_all)]
    #[inline]
    pub fn restore(
        &self,
        target: &Path,
        time: Option<DateTimeUtc>,
        prefix: &Index,
    ) -> Result<RestoreSummary> {
        let status = self.sync_local_cache()?;
        let (chain, time) = Self::chain_at(&status, time)?;
        info!(%time, chain = %chain.short_desc(), prefix = %prefix, "restoring");
        let errors = ErrorCount::default();
        let sets = self.set_entries(&chain, time, prefix, &errors)?;
        let mut writer = TreeWriter::new(target, errors.clone());
        for restored in PatchIter::new(sets, prefix.clone(), errors.clone()) {
            writer.write(restored?);
        }
        let written = writer.finish();
        if written == 0 && errors.get() == 0 {
            bail!("{prefix} not found in backup, no files restored");
        }
        Ok(RestoreSummary {
            written,
            errors: errors.get(),
        })
    }

    /// Live entries at `time`, from the signature chain if one covers it, otherwise
    /// from the volumes.
    #[inline]
    pub fn list_current_files(&self, time: Option<DateTimeUtc>) -> Result<Vec<Entry>> {
        let status = self.sync_local_cache()?;
        let (chain, time) = Self::chain_at(&status, time)?;
        if let Some(sig_chain) = status.signature_chain_for(&chain, time) {
            debug!(local = sig_chain.is_local(), "listing from signatures");
            return live_entries(self.signature_streams(sig_chain, time)?)
                .map(|entry| entry.map(|entry| entry.entry))
                .collect();
        }
        debug!("listing from volumes");
        let errors = ErrorCount::default();
        let root = Index::root();
        let sets = self.set_entries(&chain, time, &root, &errors)?;
        let entries = PatchIter::new(sets, root, errors.clone())
            .map(|restored| restored.map(|restored| restored.entry))
            .collect::<Result<Vec<_>>>()?;
        if errors.get() > 0 {
            return Err(Error::PartialFailure(errors.get()).into());
        }
        Ok(entries)
    }

    /// Compares the backup at `time` with the files below `source`.
    #[instrument(skip_all)]
    #[inline]
    pub fn verify(
        &self,
        source: &Path,
        rules: Rules,
        time: Option<DateTimeUtc>,
        prefix: &Index,
    ) -> Result<VerifySummary> {
        let status = self.sync_local_cache()?;
        let (chain, time) = Self::chain_at(&status, time)?;
        let errors = ErrorCount::default();
        let sets = self.set_entries(&chain, time, prefix, &errors)?;
        let mut backup = PatchIter::new(sets, prefix.clone(), errors.clone()).peekable();

        let root = prefix.to_path(source);
        let current: Box<dyn Iterator<Item = Entry>> = match read_entry(source, prefix)? {
            Some(entry) if entry.is_dir() => Box::new(TreeWalk::new(&root, rules)?),
            Some(mut entry) => {
                entry.index = Index::root();
                Box::new(iter::once(entry))
            }
            None => Box::new(iter::empty()),
        };
        let mut current = current.peekable();

        let mut summary = VerifySummary::default();
        loop {
            let order = match (backup.peek(), current.peek()) {
                (None, None) => break,
                (Some(Ok(backup)), Some(current)) => backup.entry.index.cmp(&current.index),
                (Some(_), _) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
            };
            let (backup_entry, current_entry) = match order {
                Ordering::Less => (backup.next().transpose()?, None),
                Ordering::Greater => (None, current.next()),
                Ordering::Equal => (backup.next().transpose()?, current.next()),
            };
            let Some(index) = backup_entry
                .as_ref()
                .map(|restored| restored.entry.index.clone())
                .or_else(|| current_entry.as_ref().map(|entry| entry.index.clone()))
            else {
                continue;
            };
            if backup_entry.is_some() {
                summary.compared = summary.compared.saturating_add(1);
            }
            let difference = match compare_metadata(
                backup_entry.as_ref().map(|restored| &restored.entry),
                current_entry.as_ref(),
            ) {
                Some(difference) => Some(difference),
                None => match (backup_entry, &current_entry) {
                    (Some(restored), Some(current)) if current.is_regular() => {
                        match compare_data(restored, &index.to_path(&root)) {
                            Ok(same) => (!same).then_some(Difference::Data),
                            Err(err) => {
                                warn!(path = %current.index, error = %err, "failed to compare data");
                                errors.add();
                                None
                            }
                        }
                    }
                    _ => None,
                },
            };
            if let Some(difference) = difference {
                info!("Difference found: {difference} {index}");
                summary.differences = summary.differences.saturating_add(1);
            }
        }
        summary.errors = errors.get();
        info!(
            "Verify complete: {} files compared, {} differences found.",
            summary.compared, summary.differences
        );
        Ok(summary)
    }

    /// Every stored volume of every chain with the hash its manifest records.
    #[inline]
    pub fn volume_checks(&self) -> Result<Vec<VolumeCheck>> {
        let status = self.sync_local_cache()?;
        let mut checks = Vec::new();
        for chain in status.all_backup_chains() {
            for set in chain.sets() {
                let manifest = self.get_manifest(set)?;
                for (number, name) in set.volume_names() {
                    checks.push(VolumeCheck {
                        name: name.to_owned(),
                        hash: manifest.volume(number).and_then(|info| info.hash.clone()),
                    });
                }
            }
        }
        Ok(checks)
    }

    /// Downloads a volume and checks its hash.
    #[inline]
    pub fn check_volume(&self, check: &VolumeCheck) -> Result<()> {
        let Some(hash) = &check.hash else {
            warn!(name = %check.name, "no hash recorded for volume");
            return Ok(());
        };
        let stored = NamedTempFile::new_in(self.temp_dir.path())?;
        self.backend.get(&check.name, stored.path())?;
        check_hash(&check.name, stored.path(), hash)
    }

    fn delete(&self, remote: &[String], local: &[String]) -> Result<()> {
        if !remote.is_empty() {
            info!(count = remote.len(), "deleting remote files");
            self.backend.delete(remote)?;
        }
        for name in local {
            match remove_file(self.archive_dir.join(name)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Lists, and with `force` deletes, files that belong to no usable chain.
    #[inline]
    pub fn cleanup(&self, force: bool) -> Result<Extraneous> {
        let extraneous = self.collection_status()?.get_extraneous();
        if force {
            self.delete(&extraneous.remote, &extraneous.local)?;
        }
        Ok(extraneous)
    }

    /// Lists, and with `force` deletes, whole chains that ended before `time`. The
    /// active chain is kept.
    #[inline]
    pub fn remove_older_than(&self, time: DateTimeUtc, force: bool) -> Result<Extraneous> {
        let status = self.collection_status()?;
        let required = status.get_older_than_required(time);
        if !required.is_empty() {
            warn!(
                count = required.len(),
                "some backup sets older than {time} are needed by newer sets and will be kept; \
                 run a full backup first to be able to remove them"
            );
        }
        let mut old_sets = status.get_older_than(time);
        old_sets.reverse();
        let mut files = Extraneous::default();
        for set in &old_sets {
            files.remote.extend(set.file_names());
            files.local.extend(set.local_manifest_name().map(ToOwned::to_owned));
        }
        let removed_starts: Vec<_> = status
            .get_chains_older_than(time)
            .filter(|chain| old_sets.iter().any(|set| *set == chain.full()))
            .map(BackupChain::start_time)
            .collect();
        for sig_chain in status.other_sig_chains() {
            if removed_starts.contains(&sig_chain.start_time()) {
                if sig_chain.is_local() {
                    files.local.extend(sig_chain.file_names());
                } else {
                    files.remote.extend(sig_chain.file_names());
                }
            }
        }
        if old_sets.is_empty() {
            info!("no old backup sets found, nothing deleted");
        } else if force {
            self.delete(&files.remote, &files.local)?;
        }
        Ok(files)
    }

    /// Removes chains older than the `count`-th newest full backup.
    #[inline]
    pub fn remove_all_but_n_full(&self, count: usize, force: bool) -> Result<Extraneous> {
        if count == 0 {
            bail!("the number of full backups to keep must be positive");
        }
        let status = self.collection_status()?;
        match status.get_nth_last_full_backup_time(count) {
            Some(time) => self.remove_older_than(time, force),
            None => {
                info!("fewer than {count} full backups found, nothing deleted");
                Ok(Extraneous::default())
            }
        }
    }
}

/// Stores finished volumes of a session.
struct RemoteSink<'a> {
    repository: &'a Repository,
    session: Session,
}

impl VolumeSink for RemoteSink<'_> {
    fn store_volume(&mut self, volume_number: u32, plain: &Path) -> Result<VolumeHash> {
        let name = self
            .repository
            .remote_name(self.session.volume(volume_number), Role::Volume);
        info!(name, "storing volume");
        self.repository.store(&name, Role::Volume, plain)
    }
}

/// Tar members of a set's volumes, fetched one volume at a time.
///
/// Volumes that fail their hash check or cannot be parsed are skipped and counted.
pub struct VolumeMembers<'a> {
    repository: &'a Repository,
    pending: vec::IntoIter<VolumeCheck>,
    current: Option<TarReader<BufReader<File>>>,
    errors: ErrorCount,
}

impl VolumeMembers<'_> {
    fn open_next(&mut self) -> Result<Option<()>> {
        let Some(check) = self.pending.next() else {
            return Ok(None);
        };
        match self.repository.fetch(&check.name, check.hash.as_ref()) {
            Ok(plain) => {
                let file = Repository::open_fetched(&plain)?;
                self.current = Some(TarReader::new(BufReader::new(file)));
            }
            Err(err) if is_integrity(&err) => {
                warn!(name = %check.name, error = format!("{err:#}"), "skipping damaged volume");
                self.errors.add();
            }
            Err(err) => return Err(err),
        }
        Ok(Some(()))
    }
}

impl Iterator for VolumeMembers<'_> {
    type Item = Result<TarMember>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = &mut self.current {
                match reader.next() {
                    Some(Ok(member)) => return Some(Ok(member)),
                    Some(Err(err)) => {
                        warn!(error = format!("{err:#}"), "skipping rest of unreadable volume");
                        self.errors.add();
                        self.current = None;
                    }
                    None => self.current = None,
                }
                continue;
            }
            match self.open_next() {
                Ok(Some(())) => {}
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn is_integrity(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<Error>(),
            Some(Error::Integrity(_))
        )
    })
}

fn check_hash(name: &str, path: &Path, expected: &VolumeHash) -> Result<()> {
    if !expected.algorithm.eq_ignore_ascii_case(HASH_ALGORITHM) {
        warn!(name, algorithm = %expected.algorithm, "unsupported hash algorithm, not checked");
        return Ok(());
    }
    let mut hasher = HashingWriter::<_, Sha1>::new(io::sink());
    io::copy(&mut BufReader::new(File::open(path)?), &mut hasher)?;
    let (_, digest, _) = hasher.finish()?;
    let actual = hex::encode(digest);
    if !actual.eq_ignore_ascii_case(&expected.value) {
        return Err(Error::Integrity(format!(
            "{name} has hash {actual}, manifest records {}",
            expected.value
        ))
        .into());
    }
    Ok(())
}

/// Whether the restored content equals the file at `path`.
fn compare_data(restored: RestoredEntry, path: &Path) -> Result<bool> {
    let Some(mut content) = restored.content else {
        return Ok(restored.entry.size == 0 && fs_err::metadata(path)?.len() == 0);
    };
    let mut file = BufReader::new(File::open(path)?);
    loop {
        let mut expected = Vec::new();
        (&mut content).take(COMPARE_CHUNK_LEN).read_to_end(&mut expected)?;
        let mut found = Vec::new();
        (&mut file).take(COMPARE_CHUNK_LEN).read_to_end(&mut found)?;
        if expected != found {
            return Ok(false);
        }
        if expected.is_empty() {
            return Ok(true);
        }
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
        crate::{backend::open_backend, crypto::Cipher, retry::RetryPolicy},
        filetime::{FileTime, set_file_mtime},
        fs_err::{read, write},
        heddle_protocol::credentials::EncryptionKey,
        std::os::unix::fs::symlink,
    };

    struct Fixture {
        dir: TempDir,
        repository: Repository,
    }

    impl Fixture {
        fn new(encrypted: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let target = dir.path().join("remote").display().to_string();
            let encryptor: Option<Arc<dyn Encryptor>> = encrypted
                .then(|| Arc::new(Cipher::new(&EncryptionKey::generate().unwrap())) as _);
            let repository = Repository::open(
                &target,
                open_backend(&target, RetryPolicy::default()).unwrap(),
                encryptor,
                RepositoryOptions {
                    volume_size: 64 * 1024,
                    compact_names: false,
                    compression: true,
                    allow_source_mismatch: false,
                    archive_dir: dir.path().join("cache"),
                },
            )
            .unwrap();
            create_dir_all(dir.path().join("source/sub")).unwrap();
            Self { dir, repository }
        }

        fn source(&self) -> PathBuf {
            self.dir.path().join("source")
        }

        fn write(&self, path: &str, content: &[u8], mtime: i64) {
            let path = self.source().join(path);
            write(&path, content).unwrap();
            set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
        }

        fn backup(&self, mode: BackupMode) -> SessionStats {
            self.repository
                .backup(
                    &BackupSource {
                        path: self.source(),
                        rules: Rules::default(),
                        hostname: "host".into(),
                    },
                    mode,
                )
                .unwrap()
        }

        fn restore(&self, name: &str, time: Option<DateTimeUtc>) -> (PathBuf, RestoreSummary) {
            let target = self.dir.path().join(name);
            let summary = self
                .repository
                .restore(&target, time, &Index::root())
                .unwrap();
            (target, summary)
        }

        fn remote_dir(&self) -> PathBuf {
            self.dir.path().join("remote")
        }

        fn set_root_mtime(&self, mtime: i64) {
            set_file_mtime(self.source(), FileTime::from_unix_time(mtime, 0)).unwrap();
        }

        fn restore_err(&self) -> anyhow::Error {
            self.repository
                .restore(&self.dir.path().join("x"), None, &Index::root())
                .unwrap_err()
        }
    }

    fn auto() -> BackupMode {
        BackupMode::Auto {
            full_if_older_than: None,
        }
    }

    #[test]
    fn empty_directory() {
        let fixture = Fixture::new(false);
        fs_err::remove_dir(fixture.source().join("sub")).unwrap();
        let stats = fixture.backup(auto());
        assert_eq!(stats.source_files, 1);
        let status = fixture.repository.collection_status().unwrap();
        assert_eq!(status.all_backup_chains().len(), 1);
        assert!(status.all_backup_chains()[0].incs().is_empty());
        assert!(status.matched_chain_pair().is_some());
    }

    #[test]
    fn full_incremental_and_restore() {
        let fixture = Fixture::new(true);
        let big: Vec<u8> = (0..300_000_u32).map(|i| (i * 7 % 251) as u8).collect();
        fixture.write("big", &big, 1_000);
        fixture.write("sub/a", b"first", 1_000);
        fixture.write("gone", b"bye", 1_000);
        symlink("big", fixture.source().join("link")).unwrap();
        fixture.set_root_mtime(1_000);

        let stats = fixture.backup(auto());
        assert_eq!(stats.new_files, 6);
        let first_time = fixture
            .repository
            .collection_status()
            .unwrap()
            .latest_time()
            .unwrap();

        let mut changed = big.clone();
        changed[150_000] ^= 1;
        fixture.write("big", &changed, 2_000);
        fs_err::remove_file(fixture.source().join("gone")).unwrap();
        fixture.set_root_mtime(2_000);
        let stats = fixture.backup(auto());
        // The root directory and "big".
        assert_eq!(stats.changed_files, 2);
        assert_eq!(stats.unchanged_files, 3);
        assert_eq!(stats.deleted_files, 1);
        assert!(stats.delta_bytes < 20_000);

        let status = fixture.repository.collection_status().unwrap();
        assert_eq!(status.all_backup_chains()[0].incs().len(), 1);
        assert!(status.get_extraneous().is_empty());

        let (latest, summary) = fixture.restore("latest", None);
        assert_eq!(summary.errors, 0);
        assert_eq!(read(latest.join("big")).unwrap(), changed);
        assert_eq!(read(latest.join("sub/a")).unwrap(), b"first");
        assert!(!latest.join("gone").exists());
        assert_eq!(
            fs_err::read_link(latest.join("link")).unwrap(),
            PathBuf::from("big")
        );

        let (earlier, _) = fixture.restore("earlier", Some(first_time));
        assert_eq!(read(earlier.join("big")).unwrap(), big);
        assert_eq!(read(earlier.join("gone")).unwrap(), b"bye");

        let listed: Vec<_> = fixture
            .repository
            .list_current_files(None)
            .unwrap()
            .into_iter()
            .map(|entry| entry.index.to_string())
            .collect();
        assert_eq!(listed, [".", "big", "link", "sub", "sub/a"]);

        let summary = fixture
            .repository
            .verify(&fixture.source(), Rules::default(), None, &Index::root())
            .unwrap();
        assert_eq!(summary.differences, 0);
        assert_eq!(summary.compared, 5);
        fixture.write("sub/a", b"other", 1_000);
        let summary = fixture
            .repository
            .verify(&fixture.source(), Rules::default(), None, &Index::root())
            .unwrap();
        assert_eq!(summary.differences, 1);

        for check in fixture.repository.volume_checks().unwrap() {
            fixture.repository.check_volume(&check).unwrap();
        }
    }

    #[test]
    fn prefix_restore() {
        let fixture = Fixture::new(false);
        fixture.write("sub/a", b"inner", 1_000);
        fixture.write("top", b"outer", 1_000);
        fixture.backup(auto());
        let target = fixture.dir.path().join("only-sub");
        fixture
            .repository
            .restore(&target, None, &"sub".parse().unwrap())
            .unwrap();
        assert_eq!(read(target.join("a")).unwrap(), b"inner");
        assert!(!target.join("top").exists());
        fixture
            .repository
            .restore(&target, None, &"missing".parse().unwrap())
            .unwrap_err();
    }

    #[test]
    fn damaged_volume_is_skipped() {
        let fixture = Fixture::new(false);
        // Four chunks at this volume size; the second volume holds only the second one.
        let big: Vec<u8> = (0..200_000_u32).map(|i| (i % 13) as u8).collect();
        fixture.write("a", b"small", 1_000);
        fixture.write("big", &big, 1_000);
        fixture.write("z", b"after", 1_000);
        fixture.backup(BackupMode::Full);

        let status = fixture.repository.collection_status().unwrap();
        let full = status.all_backup_chains()[0].full();
        assert!(full.num_volumes() >= 3);
        let path = fixture.remote_dir().join(full.volume_name(2).unwrap());
        let mut stored = read(&path).unwrap();
        let middle = stored.len() / 2;
        stored[middle] ^= 0xff;
        write(&path, stored).unwrap();

        let (target, summary) = fixture.restore("out", None);
        assert_eq!(summary.errors, 1);
        assert_eq!(read(target.join("a")).unwrap(), b"small");
        assert_eq!(read(target.join("z")).unwrap(), b"after");
        assert!(target.join("sub").is_dir());
        assert!(!target.join("big").exists());
    }

    #[test]
    fn incremental_needs_chain() {
        let fixture = Fixture::new(false);
        fixture
            .repository
            .backup(
                &BackupSource {
                    path: fixture.source(),
                    rules: Rules::default(),
                    hostname: "host".into(),
                },
                BackupMode::Incremental,
            )
            .unwrap_err();
    }

    #[test]
    fn source_mismatch() {
        let fixture = Fixture::new(false);
        fixture.backup(auto());
        let err = fixture
            .repository
            .backup(
                &BackupSource {
                    path: fixture.source(),
                    rules: Rules::default(),
                    hostname: "other-host".into(),
                },
                auto(),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::SourceMismatch(_))
        ));
    }

    #[test]
    fn manifest_mismatch_is_integrity_error() {
        let fixture = Fixture::new(false);
        fixture.backup(auto());
        let status = fixture.repository.collection_status().unwrap();
        let local = status.all_backup_chains()[0]
            .full()
            .local_manifest_name()
            .unwrap()
            .to_owned();
        write(fixture.repository.archive_dir().join(local), "Hostname other\n").unwrap();
        let err = fixture.restore_err();
        assert!(is_integrity(&err));
    }

    #[test]
    fn retention() {
        let fixture = Fixture::new(false);
        fixture.write("a", b"1", 1_000);
        fixture.backup(auto());
        fixture.backup(BackupMode::Full);
        let files = fixture.repository.remove_all_but_n_full(1, false).unwrap();
        assert!(!files.remote.is_empty());
        assert_eq!(
            fixture.repository.collection_status().unwrap().all_backup_chains().len(),
            2
        );
        fixture.repository.remove_all_but_n_full(1, true).unwrap();
        let status = fixture.repository.collection_status().unwrap();
        assert_eq!(status.all_backup_chains().len(), 1);
        assert!(status.get_extraneous().is_empty());
    }
}

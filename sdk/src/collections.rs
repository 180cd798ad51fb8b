//! Reconstruction of backup sets and chains from a file listing.
//!
//! Nothing here is persisted: the state of a repository is always derived from the
//! names of the files in it (and in the local archive cache). Inputs are sorted before
//! they are grouped, so the result does not depend on listing order.

use {
    crate::backend::RemoteFile,
    anyhow::{Result, bail},
    heddle_protocol::{
        DateTimeUtc, Error,
        naming::{NameKind, ParsedName},
    },
    std::{collections::BTreeMap, iter, ptr},
    tracing::{debug, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SetType {
    Full,
    Incremental,
}

impl SetType {
    #[must_use]
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Full => "Full",
            Self::Incremental => "Incremental",
        }
    }
}

/// Files produced by one backup session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSet {
    pub set_type: SetType,
    pub start_time: DateTimeUtc,
    /// Session time. Equals `start_time` for full sets.
    pub end_time: DateTimeUtc,
    volumes: BTreeMap<u32, String>,
    manifest: Option<String>,
    local_manifest: Option<String>,
}

fn set_key(parsed: &ParsedName) -> Option<(SetType, DateTimeUtc, DateTimeUtc)> {
    match parsed.kind {
        NameKind::FullVolume { time, .. } | NameKind::FullManifest { time } => {
            Some((SetType::Full, time, time))
        }
        NameKind::IncVolume { start, end, .. } | NameKind::IncManifest { start, end } => {
            Some((SetType::Incremental, start, end))
        }
        NameKind::FullSignatures { .. }
        | NameKind::NewSignatures { .. }
        | NameKind::BlockVolume { .. }
        | NameKind::FileList { .. } => None,
    }
}

impl BackupSet {
    /// Starts a set from its first file. Returns `None` for files that are not part
    /// of a backup set.
    #[must_use]
    #[inline]
    pub fn from_file(name: &str, parsed: &ParsedName) -> Option<Self> {
        let (set_type, start_time, end_time) = set_key(parsed)?;
        let mut set = Self {
            set_type,
            start_time,
            end_time,
            volumes: BTreeMap::new(),
            manifest: None,
            local_manifest: None,
        };
        set.add_file(name, parsed).then_some(set)
    }

    /// Adds a file if it belongs to this set and does not duplicate a known one.
    #[inline]
    pub fn add_file(&mut self, name: &str, parsed: &ParsedName) -> bool {
        if set_key(parsed) != Some(self.key()) {
            return false;
        }
        if parsed.is_manifest() {
            if self.manifest.is_some() {
                return false;
            }
            self.manifest = Some(name.to_owned());
            return true;
        }
        let Some(volume) = parsed.volume_number() else {
            return false;
        };
        if self.volumes.contains_key(&volume) {
            return false;
        }
        self.volumes.insert(volume, name.to_owned());
        true
    }

    fn key(&self) -> (SetType, DateTimeUtc, DateTimeUtc) {
        (self.set_type, self.start_time, self.end_time)
    }

    /// A set is complete once its manifest is stored; the manifest is always written last.
    #[must_use]
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.manifest.is_some()
    }

    #[must_use]
    #[inline]
    pub fn time(&self) -> DateTimeUtc {
        self.end_time
    }

    #[must_use]
    #[inline]
    pub fn manifest_name(&self) -> Option<&str> {
        self.manifest.as_deref()
    }

    /// Name of the cached copy of the manifest in the local archive directory.
    #[must_use]
    #[inline]
    pub fn local_manifest_name(&self) -> Option<&str> {
        self.local_manifest.as_deref()
    }

    #[must_use]
    #[inline]
    pub fn volume_name(&self, volume: u32) -> Option<&str> {
        self.volumes.get(&volume).map(String::as_str)
    }

    #[inline]
    pub fn volume_names(&self) -> impl Iterator<Item = (u32, &str)> {
        self.volumes.iter().map(|(number, name)| (*number, name.as_str()))
    }

    #[must_use]
    #[inline]
    pub fn num_volumes(&self) -> usize {
        self.volumes.len()
    }

    /// Remote files of the set, manifest first so that an interrupted deletion
    /// leaves an incomplete set behind.
    #[must_use]
    #[inline]
    pub fn file_names(&self) -> Vec<String> {
        self.manifest
            .iter()
            .chain(self.volumes.values().rev())
            .cloned()
            .collect()
    }

    fn matches_local_manifest(&self, parsed: &ParsedName) -> bool {
        parsed.is_manifest() && set_key(parsed) == Some(self.key())
    }
}

/// A full set followed by the incremental sets based on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupChain {
    full: BackupSet,
    incs: Vec<BackupSet>,
}

impl BackupChain {
    #[inline]
    pub fn new(full: BackupSet) -> Result<Self> {
        if full.set_type != SetType::Full {
            bail!("backup chain must start with a full set");
        }
        Ok(Self {
            full,
            incs: Vec::new(),
        })
    }

    /// Appends an incremental set that starts where the chain ends.
    ///
    /// A set with the same start as the last one but a later end replaces it. Returns
    /// `false` if the set does not fit.
    #[inline]
    pub fn add_inc(&mut self, set: BackupSet) -> bool {
        if set.start_time == self.end_time() {
            debug!(start = %set.start_time, end = %set.end_time, "added incremental set");
            self.incs.push(set);
            return true;
        }
        if let Some(last) = self.incs.last_mut()
            && set.start_time == last.start_time
            && set.end_time > last.end_time
        {
            debug!(start = %set.start_time, end = %set.end_time, "preferring longer incremental set");
            *last = set;
            return true;
        }
        false
    }

    #[must_use]
    #[inline]
    pub fn start_time(&self) -> DateTimeUtc {
        self.full.start_time
    }

    #[must_use]
    #[inline]
    pub fn end_time(&self) -> DateTimeUtc {
        self.incs.last().unwrap_or(&self.full).end_time
    }

    #[must_use]
    #[inline]
    pub fn full(&self) -> &BackupSet {
        &self.full
    }

    #[must_use]
    #[inline]
    pub fn incs(&self) -> &[BackupSet] {
        &self.incs
    }

    #[inline]
    pub fn sets(&self) -> impl Iterator<Item = &BackupSet> {
        iter::once(&self.full).chain(&self.incs)
    }

    #[must_use]
    #[inline]
    pub fn last(&self) -> &BackupSet {
        self.incs.last().unwrap_or(&self.full)
    }

    /// Sets needed to restore the state at `time`, oldest first.
    #[must_use]
    #[inline]
    pub fn sets_at_time(&self, time: DateTimeUtc) -> Vec<&BackupSet> {
        self.sets()
            .enumerate()
            .filter(|(i, set)| *i == 0 || set.end_time <= time)
            .map(|(_, set)| set)
            .collect()
    }

    #[must_use]
    #[inline]
    pub fn num_volumes(&self) -> usize {
        self.sets().map(BackupSet::num_volumes).sum()
    }

    #[must_use]
    #[inline]
    pub fn short_desc(&self) -> String {
        format!("[{}]-[{}]", self.start_time(), self.end_time())
    }

    fn pop_inc(&mut self) -> Option<BackupSet> {
        self.incs.pop()
    }
}

/// A signature file of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigFile {
    pub name: String,
    pub end_time: DateTimeUtc,
}

/// A full signature file followed by the new-signature files of later sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureChain {
    local: bool,
    files: Vec<SigFile>,
    start_time: DateTimeUtc,
}

impl SignatureChain {
    #[must_use]
    #[inline]
    pub fn from_full(local: bool, name: &str, parsed: &ParsedName) -> Option<Self> {
        let NameKind::FullSignatures { time } = parsed.kind else {
            return None;
        };
        Some(Self {
            local,
            files: vec![SigFile {
                name: name.to_owned(),
                end_time: time,
            }],
            start_time: time,
        })
    }

    /// Appends a new-signatures file that continues the chain.
    #[inline]
    pub fn add_file(&mut self, name: &str, parsed: &ParsedName) -> bool {
        let NameKind::NewSignatures { start, end } = parsed.kind else {
            return false;
        };
        if start != self.end_time() {
            return false;
        }
        self.files.push(SigFile {
            name: name.to_owned(),
            end_time: end,
        });
        true
    }

    /// Whether the chain lives in the local archive directory.
    #[must_use]
    #[inline]
    pub fn is_local(&self) -> bool {
        self.local
    }

    #[must_use]
    #[inline]
    pub fn start_time(&self) -> DateTimeUtc {
        self.start_time
    }

    #[must_use]
    #[inline]
    pub fn end_time(&self) -> DateTimeUtc {
        self.files.last().map_or(self.start_time, |file| file.end_time)
    }

    /// Signature files oldest first.
    #[must_use]
    #[inline]
    pub fn files(&self) -> &[SigFile] {
        &self.files
    }

    /// Signature files describing the state at `time`.
    #[must_use]
    #[inline]
    pub fn files_at_time(&self, time: DateTimeUtc) -> Vec<&SigFile> {
        self.files
            .iter()
            .enumerate()
            .filter(|(i, file)| *i == 0 || file.end_time <= time)
            .map(|(_, file)| file)
            .collect()
    }

    #[must_use]
    #[inline]
    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().rev().map(|file| file.name.clone()).collect()
    }

    fn location(&self) -> &'static str {
        if self.local { "local" } else { "remote" }
    }

    fn same_range(&self, other: &SignatureChain) -> bool {
        self.start_time == other.start_time && self.end_time() == other.end_time()
    }
}

/// Files that do not belong to any usable chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraneous {
    pub remote: Vec<String>,
    pub local: Vec<String>,
}

impl Extraneous {
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remote.is_empty() && self.local.is_empty()
    }
}

/// Everything known about a repository and its local archive cache.
#[derive(Debug, Clone)]
pub struct CollectionStatus {
    /// Chains sorted by end time.
    all_backup_chains: Vec<BackupChain>,
    /// Index of the newest chain if a signature chain matches it.
    matched_chain: Option<usize>,
    matched_sig_chain: Option<SignatureChain>,
    other_sig_chains: Vec<SignatureChain>,
    orphaned_sig_names: Vec<(bool, String)>,
    orphaned_backup_sets: Vec<BackupSet>,
    incomplete_backup_sets: Vec<BackupSet>,
    stale_local_manifests: Vec<String>,
    num_remote_files: usize,
    newest_file_time: Option<DateTimeUtc>,
}

impl CollectionStatus {
    /// Builds the collection from the remote listing and the local cache listing.
    #[must_use]
    #[inline]
    pub fn new(remote: &[RemoteFile], local: &[String]) -> Self {
        let remote_names = parse_names(remote.iter().map(|file| file.name.as_str()));
        let local_names = parse_names(local.iter().map(String::as_str));
        debug!(remote = remote_names.len(), local = local_names.len(), "collating");
        let newest_file_time = remote_names
            .iter()
            .chain(&local_names)
            .filter_map(|(_, parsed)| parsed.end_time())
            .max();

        let (mut chains, orphaned_backup_sets, mut incomplete_backup_sets) =
            backup_chains(&remote_names);
        let mut stale_local_manifests = Vec::new();
        for (name, parsed) in local_names.iter().filter(|(_, parsed)| parsed.is_manifest()) {
            let set = chains
                .iter_mut()
                .flat_map(|chain| iter::once(&mut chain.full).chain(chain.incs.iter_mut()))
                .find(|set| set.matches_local_manifest(parsed));
            match set {
                Some(set) => set.local_manifest = Some(name.clone()),
                None => stale_local_manifests.push(name.clone()),
            }
        }

        let (local_chains, local_orphans) = signature_chains(true, &local_names);
        let (remote_chains, remote_orphans) = signature_chains(false, &remote_names);
        let orphaned_sig_names = local_orphans
            .into_iter()
            .map(|name| (true, name))
            .chain(remote_orphans.into_iter().map(|name| (false, name)))
            .collect();

        let mut sig_chains = local_chains;
        sig_chains.extend(remote_chains);
        sort_sig_chains(&mut sig_chains);
        let (matched_sig_chain, other_sig_chains) =
            match_chain_pair(sig_chains, &mut chains, &mut incomplete_backup_sets);
        let matched_chain = matched_sig_chain
            .as_ref()
            .and_then(|_| chains.len().checked_sub(1));

        let status = Self {
            all_backup_chains: chains,
            matched_chain,
            matched_sig_chain,
            other_sig_chains,
            orphaned_sig_names,
            orphaned_backup_sets,
            incomplete_backup_sets,
            stale_local_manifests,
            num_remote_files: remote.len(),
            newest_file_time,
        };
        status.warn();
        status
    }

    fn warn(&self) {
        if !self.orphaned_sig_names.is_empty() {
            let names: Vec<_> = self.orphaned_sig_names.iter().map(|(_, n)| n.as_str()).collect();
            warn!("found orphaned signature files: {}", names.join(", "));
        }
        if !self.other_sig_chains.is_empty() {
            if self.matched_chain.is_some() {
                debug!("found unnecessary signature chains");
            } else {
                warn!("found signatures but no corresponding backup files");
            }
        }
        if !self.incomplete_backup_sets.is_empty() {
            warn!("found incomplete backup sets, probably left from an aborted session");
        }
        if !self.orphaned_backup_sets.is_empty() {
            let times: Vec<_> = self
                .orphaned_backup_sets
                .iter()
                .map(|set| set.end_time.to_string())
                .collect();
            warn!("found orphaned backup sets: {}", times.join(", "));
        }
    }

    #[must_use]
    #[inline]
    pub fn all_backup_chains(&self) -> &[BackupChain] {
        &self.all_backup_chains
    }

    /// The newest chain and the signature chain matching it.
    #[must_use]
    #[inline]
    pub fn matched_chain_pair(&self) -> Option<(&SignatureChain, &BackupChain)> {
        let chain = self.all_backup_chains.get(self.matched_chain?)?;
        Some((self.matched_sig_chain.as_ref()?, chain))
    }

    /// Backup chains without a matching signature chain.
    #[inline]
    pub fn other_backup_chains(&self) -> impl Iterator<Item = &BackupChain> {
        self.all_backup_chains
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != self.matched_chain)
            .map(|(_, chain)| chain)
    }

    #[must_use]
    #[inline]
    pub fn other_sig_chains(&self) -> &[SignatureChain] {
        &self.other_sig_chains
    }

    #[must_use]
    #[inline]
    pub fn orphaned_backup_sets(&self) -> &[BackupSet] {
        &self.orphaned_backup_sets
    }

    #[must_use]
    #[inline]
    pub fn incomplete_backup_sets(&self) -> &[BackupSet] {
        &self.incomplete_backup_sets
    }

    #[must_use]
    #[inline]
    pub fn num_remote_files(&self) -> usize {
        self.num_remote_files
    }

    /// Time of the newest restorable session.
    #[must_use]
    #[inline]
    pub fn latest_time(&self) -> Option<DateTimeUtc> {
        self.all_backup_chains.last().map(BackupChain::end_time)
    }

    /// Newest session time found in any file name, complete or not.
    #[must_use]
    #[inline]
    pub fn newest_file_time(&self) -> Option<DateTimeUtc> {
        self.newest_file_time
    }

    /// The chain covering `time`, else the newest chain ending before it, else the
    /// oldest chain.
    #[inline]
    pub fn get_backup_chain_at_time(&self, time: DateTimeUtc) -> Result<&BackupChain> {
        let Some(first) = self.all_backup_chains.first() else {
            bail!("no backup chains found");
        };
        let mut covering = self
            .all_backup_chains
            .iter()
            .filter(|chain| chain.start_time() <= time && time <= chain.end_time());
        if let Some(chain) = covering.next() {
            if covering.next().is_some() {
                return Err(Error::Consistency(format!("two chains cover {time}")).into());
            }
            return Ok(chain);
        }
        Ok(self
            .all_backup_chains
            .iter()
            .rev()
            .find(|chain| chain.end_time() < time)
            .unwrap_or(first))
    }

    /// A signature chain for `chain` covering at least `time`, local preferred.
    #[must_use]
    #[inline]
    pub fn signature_chain_for(
        &self,
        chain: &BackupChain,
        time: DateTimeUtc,
    ) -> Option<&SignatureChain> {
        let wanted = chain.end_time().min(time);
        let mut candidates: Vec<_> = self
            .matched_sig_chain
            .iter()
            .chain(&self.other_sig_chains)
            .filter(|sig| sig.start_time == chain.start_time() && sig.end_time() >= wanted)
            .filter(|sig| {
                chain
                    .sets_at_time(time)
                    .iter()
                    .all(|set| sig.files.iter().any(|file| file.end_time == set.end_time))
            })
            .collect();
        candidates.sort_by_key(|sig| !sig.local);
        candidates.first().copied()
    }

    /// Files that are recognizably ours but not part of a complete set or the current
    /// signature chain.
    #[must_use]
    #[inline]
    pub fn get_extraneous(&self) -> Extraneous {
        let mut extraneous = Extraneous::default();
        for sig_chain in &self.other_sig_chains {
            let names = sig_chain.file_names();
            if sig_chain.local {
                extraneous.local.extend(names);
            } else {
                extraneous.remote.extend(names);
            }
        }
        for set in self.orphaned_backup_sets.iter().chain(&self.incomplete_backup_sets) {
            extraneous.remote.extend(set.file_names());
        }
        for (local, name) in &self.orphaned_sig_names {
            if *local {
                extraneous.local.push(name.clone());
            } else {
                extraneous.remote.push(name.clone());
            }
        }
        extraneous.local.extend(self.stale_local_manifests.iter().cloned());
        extraneous
    }

    #[inline]
    pub fn get_chains_older_than(&self, time: DateTimeUtc) -> impl Iterator<Item = &BackupChain> {
        self.all_backup_chains
            .iter()
            .filter(move |chain| chain.end_time() < time)
    }

    /// Whole chains ending before `time`, except the active one, as sets sorted by time.
    #[must_use]
    #[inline]
    pub fn get_older_than(&self, time: DateTimeUtc) -> Vec<&BackupSet> {
        let active = self.matched_chain_pair().map(|(_, chain)| chain);
        let mut sets: Vec<_> = self
            .get_chains_older_than(time)
            .filter(|chain| active.is_none_or(|active| !ptr::eq(*chain, active)))
            .flat_map(BackupChain::sets)
            .collect();
        sets.sort_by_key(|set| set.time());
        sets
    }

    /// Sets older than `time` that newer sets of the same chain still depend on.
    #[must_use]
    #[inline]
    pub fn get_older_than_required(&self, time: DateTimeUtc) -> Vec<&BackupSet> {
        let mut sets: Vec<_> = self
            .all_backup_chains
            .iter()
            .filter(|chain| chain.end_time() >= time)
            .flat_map(BackupChain::sets)
            .filter(|set| set.time() < time)
            .collect();
        sets.sort_by_key(|set| set.time());
        sets
    }

    /// Start of the `n`-th newest chain, counting from 1.
    #[must_use]
    #[inline]
    pub fn get_nth_last_full_backup_time(&self, n: usize) -> Option<DateTimeUtc> {
        let mut starts: Vec<_> = self
            .all_backup_chains
            .iter()
            .map(BackupChain::start_time)
            .collect();
        starts.sort_unstable_by(|a, b| b.cmp(a));
        starts.get(n.checked_sub(1)?).copied()
    }

    #[must_use]
    #[inline]
    pub fn get_last_full_backup_time(&self) -> Option<DateTimeUtc> {
        self.get_nth_last_full_backup_time(1)
    }
}

type Named = (String, ParsedName);

fn parse_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<Named> {
    let mut parsed: Vec<_> = names
        .filter_map(|name| Some((name.to_owned(), ParsedName::parse(name)?)))
        .collect();
    parsed.sort_by(|a, b| a.0.cmp(&b.0));
    parsed
}

/// Groups backup set files into sets and folds complete sets into chains.
///
/// Returns the chains sorted by end time, the orphaned sets and the incomplete sets.
fn backup_chains(names: &[Named]) -> (Vec<BackupChain>, Vec<BackupSet>, Vec<BackupSet>) {
    let mut sets: Vec<BackupSet> = Vec::new();
    for (name, parsed) in names.iter().filter(|(_, parsed)| parsed.is_backup_set_file()) {
        if sets.iter_mut().any(|set| set.add_file(name, parsed)) {
            continue;
        }
        match BackupSet::from_file(name, parsed) {
            Some(set) => sets.push(set),
            None => debug!(name, "ignoring file rejected by backup set"),
        }
    }
    let (mut complete, incomplete): (Vec<_>, Vec<_>) =
        sets.into_iter().partition(BackupSet::is_complete);
    complete.sort_by_key(|set| (set.end_time, set.start_time, set.set_type));

    let mut chains: Vec<BackupChain> = Vec::new();
    let mut orphaned = Vec::new();
    for set in complete {
        match set.set_type {
            SetType::Full => chains.push(BackupChain {
                full: set,
                incs: Vec::new(),
            }),
            SetType::Incremental => {
                let index = chains
                    .iter()
                    .position(|chain| chain.end_time() == set.start_time)
                    .or_else(|| {
                        chains.iter().position(|chain| {
                            chain.incs.last().is_some_and(|last| {
                                last.start_time == set.start_time && set.end_time > last.end_time
                            })
                        })
                    });
                let chain = index.and_then(|index| chains.get_mut(index));
                match chain {
                    Some(chain) => {
                        chain.add_inc(set);
                    }
                    None => {
                        debug!(start = %set.start_time, end = %set.end_time, "found orphaned set");
                        orphaned.push(set);
                    }
                }
            }
        }
    }
    chains.sort_by_key(|chain| (chain.end_time(), chain.start_time()));
    (chains, orphaned, incomplete)
}

/// Returns the signature chains and the new-signature files that fit no chain.
fn signature_chains(local: bool, names: &[Named]) -> (Vec<SignatureChain>, Vec<String>) {
    let mut chains: Vec<_> = names
        .iter()
        .filter_map(|(name, parsed)| SignatureChain::from_full(local, name, parsed))
        .collect();
    let mut new_sigs: Vec<_> = names
        .iter()
        .filter(|(_, parsed)| matches!(parsed.kind, NameKind::NewSignatures { .. }))
        .collect();
    new_sigs.sort_by_key(|(name, parsed)| (parsed.start_time(), parsed.end_time(), name.clone()));
    let mut orphaned = Vec::new();
    for (name, parsed) in new_sigs {
        if !chains.iter_mut().any(|chain| chain.add_file(name, parsed)) {
            orphaned.push(name.clone());
        }
    }
    (chains, orphaned)
}

/// Sorts by end time; on ties remote chains come before local ones.
fn sort_sig_chains(chains: &mut [SignatureChain]) {
    chains.sort_by(|a, b| {
        let key = |chain: &SignatureChain| {
            (
                chain.end_time(),
                chain.local,
                chain.start_time,
                chain.files.first().map(|file| file.name.clone()),
            )
        };
        key(a).cmp(&key(b))
    });
}

/// Finds the newest signature chain matching the newest backup chain.
///
/// If a signature chain only reaches the second to last set of that chain, the last
/// set is treated as an aborted session: it is moved to `incomplete` with a warning.
/// Returns the matched signature chain and the remaining ones.
fn match_chain_pair(
    mut sig_chains: Vec<SignatureChain>,
    chains: &mut [BackupChain],
    incomplete: &mut Vec<BackupSet>,
) -> (Option<SignatureChain>, Vec<SignatureChain>) {
    let Some(latest) = chains.last_mut() else {
        return (None, sig_chains);
    };
    let mut matched = None;
    for i in (0..sig_chains.len()).rev() {
        let Some(sig_chain) = sig_chains.get(i) else {
            continue;
        };
        if sig_chain.end_time() == latest.end_time() {
            matched = Some(i);
            break;
        }
        let previous_end = latest
            .incs
            .len()
            .checked_sub(2)
            .map_or(Some(latest.full.end_time), |i| {
                latest.incs.get(i).map(|set| set.end_time)
            });
        if !latest.incs.is_empty() && Some(sig_chain.end_time()) == previous_end {
            warn!("discarding last backup set, because of missing signature file");
            if let Some(set) = latest.pop_inc() {
                incomplete.push(set);
            }
            matched = Some(i);
            break;
        }
    }
    let Some(i) = matched else {
        return (None, sig_chains);
    };
    let matched = sig_chains.remove(i);
    debug!(
        location = matched.location(),
        chain = %latest.short_desc(),
        "matched signature chain"
    );
    sig_chains.retain(|other| !(other.local != matched.local && other.same_range(&matched)));
    (Some(matched), sig_chains)
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
        chrono::DateTime,
        heddle_protocol::naming::{Encoding, NameStyle},
        rand::seq::SliceRandom,
    };

    fn t(seconds: i64) -> DateTimeUtc {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn name(kind: NameKind) -> String {
        ParsedName::new(kind, Encoding::Encrypted, NameStyle::Verbose).generate()
    }

    fn full(time: i64, volumes: u32, manifest: bool) -> Vec<String> {
        let mut names: Vec<_> = (1..=volumes)
            .map(|volume| {
                name(NameKind::FullVolume {
                    time: t(time),
                    volume,
                })
            })
            .collect();
        if manifest {
            names.push(name(NameKind::FullManifest { time: t(time) }));
        }
        names
    }

    fn inc(start: i64, end: i64, manifest: bool) -> Vec<String> {
        let mut names = vec![name(NameKind::IncVolume {
            start: t(start),
            end: t(end),
            volume: 1,
        })];
        if manifest {
            names.push(name(NameKind::IncManifest {
                start: t(start),
                end: t(end),
            }));
        }
        names
    }

    fn full_sig(time: i64) -> String {
        name(NameKind::FullSignatures { time: t(time) })
    }

    fn new_sig(start: i64, end: i64) -> String {
        name(NameKind::NewSignatures {
            start: t(start),
            end: t(end),
        })
    }

    fn remote(names: &[String]) -> Vec<RemoteFile> {
        names
            .iter()
            .map(|name| RemoteFile {
                name: name.clone(),
                size: 1,
            })
            .collect()
    }

    fn repository() -> Vec<String> {
        let mut names = Vec::new();
        names.extend(full(0, 2, true));
        names.extend(inc(0, 10, true));
        names.extend(inc(10, 20, true));
        names.extend(full(100, 1, true));
        names.extend(inc(100, 110, true));
        names.extend(inc(110, 120, false));
        names.extend(inc(500, 510, true));
        names.push(full_sig(0));
        names.push(new_sig(0, 10));
        names.push(new_sig(10, 20));
        names.push(full_sig(100));
        names.push(new_sig(100, 110));
        names.push(new_sig(300, 310));
        names.push("unrelated.txt".into());
        names
    }

    #[test]
    fn chains_and_leftovers() {
        let status = CollectionStatus::new(&remote(&repository()), &[]);
        let chains = status.all_backup_chains();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].start_time(), t(0));
        assert_eq!(chains[0].end_time(), t(20));
        assert_eq!(chains[0].incs().len(), 2);
        assert_eq!(chains[0].num_volumes(), 4);
        assert_eq!(chains[1].end_time(), t(110));

        let (sig, chain) = status.matched_chain_pair().unwrap();
        assert_eq!(chain.start_time(), t(100));
        assert_eq!(sig.files().len(), 2);
        assert!(!sig.is_local());

        assert_eq!(status.orphaned_backup_sets().len(), 1);
        assert_eq!(status.orphaned_backup_sets()[0].start_time, t(500));
        assert_eq!(status.incomplete_backup_sets().len(), 1);
        assert_eq!(status.incomplete_backup_sets()[0].end_time, t(120));

        let extraneous = status.get_extraneous();
        let mut expected = vec![
            full_sig(0),
            new_sig(0, 10),
            new_sig(10, 20),
            new_sig(300, 310),
        ];
        expected.extend(inc(500, 510, true));
        expected.extend(inc(110, 120, false));
        let mut found = extraneous.remote.clone();
        found.sort();
        expected.sort();
        assert_eq!(found, expected);
        assert!(extraneous.local.is_empty());
    }

    #[test]
    fn listing_order_does_not_matter() {
        let names = repository();
        let expected = CollectionStatus::new(&remote(&names), &[]);
        let mut rng = rand::rng();
        for _ in 0..20 {
            let mut shuffled = names.clone();
            shuffled.shuffle(&mut rng);
            let status = CollectionStatus::new(&remote(&shuffled), &[]);
            assert_eq!(status.all_backup_chains(), expected.all_backup_chains());
            assert_eq!(status.get_extraneous().remote.len(), expected.get_extraneous().remote.len());
            assert_eq!(
                status.matched_chain_pair().map(|(s, _)| s.clone()),
                expected.matched_chain_pair().map(|(s, _)| s.clone())
            );
        }
    }

    #[test]
    fn chain_at_time() {
        let status = CollectionStatus::new(&remote(&repository()), &[]);
        let at = |s| status.get_backup_chain_at_time(t(s)).unwrap().start_time();
        assert_eq!(at(5), t(0));
        assert_eq!(at(20), t(0));
        assert_eq!(at(50), t(0));
        assert_eq!(at(105), t(100));
        assert_eq!(at(1000), t(100));
        assert_eq!(at(-50), t(0));

        let chain = status.get_backup_chain_at_time(t(15)).unwrap();
        let sets = chain.sets_at_time(t(15));
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1].end_time, t(10));

        let empty = CollectionStatus::new(&[], &[]);
        empty.get_backup_chain_at_time(t(0)).unwrap_err();
    }

    #[test]
    fn overlapping_chains_are_inconsistent() {
        let mut names = full(0, 1, true);
        names.extend(inc(0, 50, true));
        names.extend(full(20, 1, true));
        let status = CollectionStatus::new(&remote(&names), &[]);
        let err = status.get_backup_chain_at_time(t(20)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Consistency(_))
        ));
    }

    #[test]
    fn last_set_without_signature_is_discarded() {
        let mut names = full(0, 1, true);
        names.extend(inc(0, 10, true));
        names.extend(inc(10, 20, true));
        let local = vec![full_sig(0), new_sig(0, 10)];
        let status = CollectionStatus::new(&remote(&names), &local);
        let (sig, chain) = status.matched_chain_pair().unwrap();
        assert!(sig.is_local());
        assert_eq!(chain.end_time(), t(10));
        assert_eq!(status.incomplete_backup_sets().len(), 1);
        assert_eq!(status.incomplete_backup_sets()[0].end_time, t(20));
    }

    #[test]
    fn local_signatures_preferred() {
        let mut names = full(0, 1, true);
        names.push(full_sig(0));
        let local = vec![full_sig(0), name(NameKind::FullManifest { time: t(0) })];
        let status = CollectionStatus::new(&remote(&names), &local);
        let (sig, chain) = status.matched_chain_pair().unwrap();
        assert!(sig.is_local());
        assert!(chain.full().local_manifest_name().is_some());
        assert!(status.other_sig_chains().is_empty());
        assert!(status.get_extraneous().is_empty());
    }

    #[test]
    fn retention_queries() {
        let status = CollectionStatus::new(&remote(&repository()), &[]);
        let old = status.get_older_than(t(50));
        assert_eq!(old.len(), 3);
        assert!(old.windows(2).all(|w| w[0].time() <= w[1].time()));
        // The active chain is never returned.
        assert_eq!(status.get_older_than(t(1000)).len(), 3);
        let required = status.get_older_than_required(t(15));
        assert_eq!(required.len(), 2);
        assert_eq!(status.get_nth_last_full_backup_time(1), Some(t(100)));
        assert_eq!(status.get_nth_last_full_backup_time(2), Some(t(0)));
        assert_eq!(status.get_nth_last_full_backup_time(3), None);
        assert_eq!(status.get_nth_last_full_backup_time(0), None);
    }

    #[test]
    fn longer_incremental_replaces_last() {
        let mut chain = BackupChain::new(BackupSet::from_file(
            &full(0, 1, false)[0],
            &ParsedName::parse(&full(0, 1, false)[0]).unwrap(),
        )
        .unwrap())
        .unwrap();
        let set = |start, end| {
            let name = &inc(start, end, false)[0];
            BackupSet::from_file(name, &ParsedName::parse(name).unwrap()).unwrap()
        };
        assert!(chain.add_inc(set(0, 10)));
        assert!(chain.add_inc(set(0, 15)));
        assert_eq!(chain.end_time(), t(15));
        assert_eq!(chain.incs().len(), 1);
        assert!(!chain.add_inc(set(20, 30)));
    }
}

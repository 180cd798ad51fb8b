//! Per-session manifest: which volumes a backup set has, what index range each of
//! them covers and the hash of each stored volume file.
//!
//! Text format:
//!
//! ```text
//! Hostname host
//! Localdir "/home/user/my\x20files"
//! Volume 1:
//!     StartingPath     .
//!     EndingPath       dir/big 3
//!     Hash SHA1 0123abcd...
//! ```

use {
    crate::{error::Error, index::Index},
    std::{collections::BTreeMap, fmt::Write as _, str},
    tracing::warn,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHash {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub volume_number: u32,
    pub start_index: Index,
    /// Continuation chunk number if the volume starts inside a multivol entry.
    pub start_block: Option<u32>,
    pub end_index: Index,
    pub end_block: Option<u32>,
    pub hash: Option<VolumeHash>,
}

impl VolumeInfo {
    /// Whether some entry at or below `prefix` may be stored in this volume.
    #[must_use]
    #[inline]
    pub fn may_contain(&self, prefix: &Index) -> bool {
        let start = self.start_index.truncated(prefix.len());
        let end = self.end_index.truncated(prefix.len());
        start <= *prefix && *prefix <= end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub hostname: Option<String>,
    pub local_dir: Option<String>,
    volumes: BTreeMap<u32, VolumeInfo>,
}

impl Manifest {
    #[must_use]
    #[inline]
    pub fn new(hostname: Option<String>, local_dir: Option<String>) -> Self {
        Self {
            hostname,
            local_dir,
            volumes: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn add_volume_info(&mut self, info: VolumeInfo) {
        self.volumes.insert(info.volume_number, info);
    }

    #[inline]
    pub fn volumes(&self) -> impl Iterator<Item = &VolumeInfo> {
        self.volumes.values()
    }

    #[must_use]
    #[inline]
    pub fn volume(&self, number: u32) -> Option<&VolumeInfo> {
        self.volumes.get(&number)
    }

    #[must_use]
    #[inline]
    pub fn num_volumes(&self) -> usize {
        self.volumes.len()
    }

    /// Volumes that must be fetched to restore `prefix` and everything below it.
    #[must_use]
    #[inline]
    pub fn get_containing_volumes(&self, prefix: &Index) -> Vec<u32> {
        self.volumes
            .values()
            .filter(|info| info.may_contain(prefix))
            .map(|info| info.volume_number)
            .collect()
    }

    /// Fails if the manifest was written for another host or source directory.
    ///
    /// With `allow_mismatch` the difference is only logged.
    #[inline]
    pub fn check_dirinfo(
        &self,
        hostname: &str,
        local_dir: &str,
        allow_mismatch: bool,
    ) -> Result<(), Error> {
        let mut problems = Vec::new();
        if let Some(recorded) = &self.hostname
            && recorded != hostname
        {
            problems.push(format!(
                "backup was made on host {recorded:?}, current host is {hostname:?}"
            ));
        }
        if let Some(recorded) = &self.local_dir
            && recorded != local_dir
        {
            problems.push(format!(
                "backup source was {recorded:?}, current source is {local_dir:?}"
            ));
        }
        if problems.is_empty() {
            return Ok(());
        }
        let message = problems.join("; ");
        if allow_mismatch {
            warn!("{message}");
            Ok(())
        } else {
            Err(Error::SourceMismatch(message))
        }
    }

    /// Checks that volumes are numbered `1..=n` and cover monotonic index ranges.
    #[inline]
    pub fn check_contiguous(&self) -> Result<(), Error> {
        let mut previous: Option<&VolumeInfo> = None;
        for (expected, info) in (1..).zip(self.volumes.values()) {
            if info.volume_number != expected {
                return Err(Error::ManifestParse(format!(
                    "volume {expected} is missing from manifest"
                )));
            }
            if info.start_index > info.end_index {
                return Err(Error::ManifestParse(format!(
                    "volume {expected} starts after it ends"
                )));
            }
            if let Some(previous) = previous
                && previous.end_index > info.start_index
            {
                return Err(Error::ManifestParse(format!(
                    "volume {expected} overlaps volume {}",
                    previous.volume_number
                )));
            }
            previous = Some(info);
        }
        Ok(())
    }

    #[must_use]
    #[inline]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if let Some(hostname) = &self.hostname {
            let _ = writeln!(out, "Hostname {}", quote(hostname));
        }
        if let Some(local_dir) = &self.local_dir {
            let _ = writeln!(out, "Localdir {}", quote(local_dir));
        }
        for info in self.volumes.values() {
            let _ = writeln!(out, "Volume {}:", info.volume_number);
            let _ = writeln!(
                out,
                "    StartingPath     {}",
                path_with_block(&info.start_index, info.start_block)
            );
            let _ = writeln!(
                out,
                "    EndingPath       {}",
                path_with_block(&info.end_index, info.end_block)
            );
            if let Some(hash) = &info.hash {
                let _ = writeln!(out, "    Hash {} {}", hash.algorithm, hash.value);
            }
        }
        out
    }

    #[inline]
    pub fn from_text(text: &str) -> Result<Self, Error> {
        let mut manifest = Manifest::default();
        let mut current: Option<PartialVolume> = None;
        for (line_number, line) in (1..).zip(text.lines()) {
            let err = |message: &str| {
                Error::ManifestParse(format!("line {line_number}: {message}: {line:?}"))
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (keyword, rest) = trimmed
                .split_once(char::is_whitespace)
                .map_or((trimmed, ""), |(k, r)| (k, r.trim()));
            match keyword {
                "Hostname" => manifest.hostname = Some(unquote(rest).ok_or_else(|| err("bad value"))?),
                "Localdir" => manifest.local_dir = Some(unquote(rest).ok_or_else(|| err("bad value"))?),
                "Volume" => {
                    if let Some(volume) = current.take() {
                        manifest.add_volume_info(volume.finish()?);
                    }
                    let number = rest
                        .strip_suffix(':')
                        .and_then(|n| n.trim().parse::<u32>().ok())
                        .ok_or_else(|| err("bad volume number"))?;
                    current = Some(PartialVolume::new(number));
                }
                "StartingPath" | "EndingPath" => {
                    let volume = current.as_mut().ok_or_else(|| err("path outside of volume"))?;
                    let (index, block) =
                        parse_path_with_block(rest).ok_or_else(|| err("bad path"))?;
                    if keyword == "StartingPath" {
                        volume.start = Some((index, block));
                    } else {
                        volume.end = Some((index, block));
                    }
                }
                "Hash" => {
                    let volume = current.as_mut().ok_or_else(|| err("hash outside of volume"))?;
                    let (algorithm, value) = rest
                        .split_once(char::is_whitespace)
                        .ok_or_else(|| err("bad hash"))?;
                    volume.hash = Some(VolumeHash {
                        algorithm: algorithm.to_owned(),
                        value: value.trim().to_ascii_lowercase(),
                    });
                }
                _ => return Err(err("unknown keyword")),
            }
        }
        if let Some(volume) = current.take() {
            manifest.add_volume_info(volume.finish()?);
        }
        Ok(manifest)
    }
}

struct PartialVolume {
    number: u32,
    start: Option<(Index, Option<u32>)>,
    end: Option<(Index, Option<u32>)>,
    hash: Option<VolumeHash>,
}

impl PartialVolume {
    fn new(number: u32) -> Self {
        Self {
            number,
            start: None,
            end: None,
            hash: None,
        }
    }

    fn finish(self) -> Result<VolumeInfo, Error> {
        let missing =
            |what: &str| Error::ManifestParse(format!("volume {} has no {what}", self.number));
        let (start_index, start_block) = self.start.clone().ok_or_else(|| missing("start path"))?;
        let (end_index, end_block) = self.end.clone().ok_or_else(|| missing("end path"))?;
        Ok(VolumeInfo {
            volume_number: self.number,
            start_index,
            start_block,
            end_index,
            end_block,
            hash: self.hash,
        })
    }
}

fn path_with_block(index: &Index, block: Option<u32>) -> String {
    let path = quote(&index.to_string());
    match block {
        Some(block) => format!("{path} {block}"),
        None => path,
    }
}

fn parse_path_with_block(text: &str) -> Option<(Index, Option<u32>)> {
    let (path, block) = if text.starts_with('"') {
        let end = text.get(1..)?.find('"')?.checked_add(2)?;
        (text.get(..end)?, text.get(end..)?.trim())
    } else {
        match text.split_once(char::is_whitespace) {
            Some((path, block)) => (path, block.trim()),
            None => (text, ""),
        }
    };
    let index = unquote(path)?.parse().ok()?;
    let block = if block.is_empty() {
        None
    } else {
        Some(block.parse().ok()?)
    };
    Some((index, block))
}

fn needs_escape(c: char) -> bool {
    c.is_whitespace() || c.is_control() || c == '"' || c == '\\'
}

/// Escapes special characters as `\xNN` and wraps the value in double quotes.
/// Values without special characters are returned unchanged.
#[must_use]
#[inline]
pub fn quote(value: &str) -> String {
    if !value.chars().any(needs_escape) && !value.is_empty() {
        return value.to_owned();
    }
    let mut out = String::from("\"");
    for c in value.chars() {
        if needs_escape(c) {
            let mut buf = [0; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(out, "\\x{byte:02x}");
            }
        } else {
            out.push(c);
        }
    }
    out.push('"');
    out
}

/// Exact inverse of [`quote`].
#[must_use]
#[inline]
pub fn unquote(value: &str) -> Option<String> {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return Some(value.to_owned());
    };
    let mut bytes = Vec::with_capacity(inner.len());
    let mut rest = inner.as_bytes();
    while let Some((&first, tail)) = rest.split_first() {
        if first == b'\\' {
            let hex = tail.get(..3)?;
            if hex.first() != Some(&b'x') {
                return None;
            }
            let digits = str::from_utf8(hex.get(1..)?).ok()?;
            bytes.push(u8::from_str_radix(digits, 16).ok()?);
            rest = tail.get(3..)?;
        } else {
            bytes.push(first);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use super::*;

    fn i(s: &str) -> Index {
        s.parse().unwrap()
    }

    fn volume(number: u32, start: &str, end: &str) -> VolumeInfo {
        VolumeInfo {
            volume_number: number,
            start_index: i(start),
            start_block: None,
            end_index: i(end),
            end_block: None,
            hash: Some(VolumeHash {
                algorithm: "SHA1".into(),
                value: format!("{number:040x}"),
            }),
        }
    }

    fn sample() -> Manifest {
        let mut manifest =
            Manifest::new(Some("host".into()), Some("/home/me/my \"files\"".into()));
        manifest.add_volume_info(volume(1, "", "a/b"));
        let mut second = volume(2, "a/b", "b b/c");
        second.start_block = Some(2);
        second.end_block = Some(7);
        manifest.add_volume_info(second);
        manifest.add_volume_info(volume(3, "b b/c", "z"));
        manifest
    }

    #[test]
    fn text_round_trip() {
        let manifest = sample();
        let text = manifest.to_text();
        assert!(text.contains("Localdir \"/home/me/my\\x20\\x22files\\x22\"\n"));
        assert!(text.contains("    StartingPath     a/b 2\n"));
        assert!(text.contains("    EndingPath       \"b\\x20b/c\" 7\n"));
        assert_eq!(Manifest::from_text(&text).unwrap(), manifest);
        manifest.check_contiguous().unwrap();
    }

    #[test]
    fn quoting() {
        for value in ["", "plain", "two words", "tab\there", "q\"uote", "back\\slash", "ünï cödé"] {
            assert_eq!(unquote(&quote(value)).unwrap(), value);
        }
        assert_eq!(quote("plain"), "plain");
        assert_eq!(unquote("\"\\x4\""), None);
    }

    #[test]
    fn malformed() {
        for text in [
            "Volume x:\n",
            "StartingPath a\n",
            "Volume 1:\n    StartingPath a\n",
            "Frobnicate 1\n",
            "Volume 1:\n    StartingPath a\n    EndingPath b x\n",
        ] {
            assert!(matches!(
                Manifest::from_text(text),
                Err(Error::ManifestParse(_))
            ));
        }
    }

    #[test]
    fn containing_volumes() {
        let manifest = sample();
        assert_eq!(manifest.get_containing_volumes(&Index::root()), vec![1, 2, 3]);
        assert_eq!(manifest.get_containing_volumes(&i("a")), vec![1, 2]);
        assert_eq!(manifest.get_containing_volumes(&i("a/b")), vec![1, 2]);
        assert_eq!(manifest.get_containing_volumes(&i("b b")), vec![2, 3]);
        assert_eq!(manifest.get_containing_volumes(&i("c")), vec![3]);
    }

    #[test]
    fn dirinfo() {
        let manifest = sample();
        manifest
            .check_dirinfo("host", "/home/me/my \"files\"", false)
            .unwrap();
        assert!(matches!(
            manifest.check_dirinfo("other", "/home/me/my \"files\"", false),
            Err(Error::SourceMismatch(_))
        ));
        manifest.check_dirinfo("other", "/elsewhere", true).unwrap();
    }

    #[test]
    fn gaps_are_rejected() {
        let mut manifest = Manifest::default();
        manifest.add_volume_info(volume(1, "", "a"));
        manifest.add_volume_info(volume(3, "a", "b"));
        assert!(manifest.check_contiguous().is_err());
        let mut overlap = Manifest::default();
        overlap.add_volume_info(volume(1, "", "c"));
        overlap.add_volume_info(volume(2, "b", "d"));
        assert!(overlap.check_contiguous().is_err());
        let parsed = Manifest::from_text(&sample().to_text()).unwrap();
        assert_eq!(parsed.volume(2).unwrap().end_block, Some(7));
        assert_eq!(parsed.volumes().collect::<Vec<_>>()[0].volume_number, 1);
    }
}

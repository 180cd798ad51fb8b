//! Formats of the content-addressed block store.
//!
//! A file list volume holds two members: [`MANIFEST_MEMBER`] with [`ArchiveOptions`]
//! and [`FILELIST_MEMBER`], a JSON array of [`FileListEntry`]. Block volumes hold one
//! member per block, named by the block id in url-safe base64.

use {
    anyhow::{Context as _, Result, bail},
    base64::{Engine, prelude::BASE64_STANDARD},
    chrono::DateTime,
    serde::{Deserialize, Serialize},
};

pub const MANIFEST_MEMBER: &str = "manifest";
pub const FILELIST_MEMBER: &str = "filelist.json";

/// Length of a SHA-256 digest, the only supported block hash.
pub const BLOCK_HASH_LEN: u64 = 32;

/// Store-wide settings recorded in every file list volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveOptions {
    pub version: u32,
    pub blocksize: u64,
    pub block_hash: String,
    pub file_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

impl ArchiveOptions {
    #[must_use]
    #[inline]
    pub fn new(blocksize: u64) -> Self {
        Self {
            version: 1,
            blocksize,
            block_hash: "SHA256".into(),
            file_hash: "SHA256".into(),
            created: None,
        }
    }

    /// Number of block hashes one blocklist block holds.
    #[must_use]
    #[inline]
    pub fn hashes_per_block(&self) -> u64 {
        self.blocksize / BLOCK_HASH_LEN
    }

    #[inline]
    pub fn check_supported(&self) -> Result<()> {
        if !self.block_hash.eq_ignore_ascii_case("SHA256")
            || !self.file_hash.eq_ignore_ascii_case("SHA256")
        {
            bail!(
                "unsupported hash algorithms: block {}, file {}",
                self.block_hash,
                self.file_hash
            );
        }
        if self.blocksize < BLOCK_HASH_LEN {
            bail!("block size {} is too small", self.blocksize);
        }
        Ok(())
    }

    /// Byte offset of block `block_index` of blocklist `blocklist_index`.
    #[must_use]
    #[inline]
    pub fn block_offset(&self, blocklist_index: u64, block_index: u64) -> u64 {
        blocklist_index
            .saturating_mul(self.hashes_per_block())
            .saturating_mul(self.blocksize)
            .saturating_add(block_index.saturating_mul(self.blocksize))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileListEntryKind {
    File,
    Folder,
    Symlink,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListEntry {
    #[serde(rename = "type")]
    pub kind: FileListEntryKind,
    pub path: String,
    /// Standard base64 SHA-256 of the whole file. For single-block files this is
    /// also the id of the only block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocklists: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metahash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metasize: Option<u64>,
}

/// Metadata block contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    /// .NET ticks (100 ns since 0001-01-01 UTC) written by other producers.
    #[serde(
        rename = "CoreLastWritetime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub core_last_write_time: Option<String>,
    #[serde(
        rename = "unix:uid-gid-perm",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub uid_gid_perm: Option<String>,
}

const TICKS_PER_SECOND: i64 = 10_000_000;
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

impl FileMetadata {
    /// Modification time in unix seconds.
    #[inline]
    pub fn mtime_seconds(&self) -> Result<Option<i64>> {
        if let Some(mtime) = self.mtime {
            return Ok(Some(mtime));
        }
        let Some(ticks) = &self.core_last_write_time else {
            return Ok(None);
        };
        let ticks: i64 = ticks.trim().parse().context("invalid CoreLastWritetime")?;
        let seconds = ticks.saturating_sub(UNIX_EPOCH_TICKS) / TICKS_PER_SECOND;
        DateTime::from_timestamp(seconds, 0).context("CoreLastWritetime out of range")?;
        Ok(Some(seconds))
    }

    #[inline]
    pub fn ownership(&self) -> Result<Option<(u32, u32, u32)>> {
        let Some(text) = &self.uid_gid_perm else {
            return Ok(None);
        };
        let mut parts = text.split('-').map(str::parse::<u32>);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Ok(uid)), Some(Ok(gid)), Some(Ok(perm)), None) => Ok(Some((uid, gid, perm))),
            _ => bail!("invalid unix:uid-gid-perm value: {text:?}"),
        }
    }
}

/// Standard base64 id to the member name used inside block volumes.
#[must_use]
#[inline]
pub fn id_to_member_name(id: &str) -> String {
    id.replace('+', "-").replace('/', "_")
}

/// Inverse of [`id_to_member_name`].
#[must_use]
#[inline]
pub fn member_name_to_id(name: &str) -> String {
    name.replace('-', "+").replace('_', "/")
}

#[must_use]
#[inline]
pub fn encode_hash(hash: &[u8]) -> String {
    BASE64_STANDARD.encode(hash)
}

#[inline]
pub fn decode_hash(id: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(id)
        .with_context(|| format!("invalid block id {id:?}"))
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn offsets() {
        let options = ArchiveOptions::new(1024);
        assert_eq!(options.hashes_per_block(), 32);
        assert_eq!(options.block_offset(0, 0), 0);
        assert_eq!(options.block_offset(0, 5), 5 * 1024);
        assert_eq!(options.block_offset(2, 3), 2 * 32 * 1024 + 3 * 1024);
    }

    #[test]
    fn member_names() {
        let id = "ab+/cd==";
        assert_eq!(id_to_member_name(id), "ab-_cd==");
        assert_eq!(member_name_to_id(&id_to_member_name(id)), id);
    }

    #[test]
    fn metadata() {
        let meta: FileMetadata =
            serde_json::from_str(r#"{"mtime": 1700000000, "unix:uid-gid-perm": "1000-100-420"}"#)
                .unwrap();
        assert_eq!(meta.mtime_seconds().unwrap(), Some(1_700_000_000));
        assert_eq!(meta.ownership().unwrap(), Some((1000, 100, 0o644)));

        let ticks = 1_700_000_000 * TICKS_PER_SECOND + UNIX_EPOCH_TICKS;
        let meta: FileMetadata =
            serde_json::from_str(&format!(r#"{{"CoreLastWritetime": "{ticks}"}}"#)).unwrap();
        assert_eq!(meta.mtime_seconds().unwrap(), Some(1_700_000_000));
        assert_eq!(meta.ownership().unwrap(), None);

        let bad = FileMetadata {
            uid_gid_perm: Some("1-2".into()),
            ..FileMetadata::default()
        };
        bad.ownership().unwrap_err();
    }

    #[test]
    fn file_list() {
        let text = r#"[
            {"type":"Folder","path":"dir/","metahash":"m1"},
            {"type":"File","path":"dir/a","hash":"h","size":3,"metahash":"m2"},
            {"type":"Weird","path":"x"}
        ]"#;
        let entries: Vec<FileListEntry> = serde_json::from_str(text).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.get(1).unwrap().kind, FileListEntryKind::File);
        assert_eq!(entries.get(2).unwrap().kind, FileListEntryKind::Other);
    }
}

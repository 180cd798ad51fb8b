//! Reading and writing the tar streams inside volumes and signature files.
//!
//! Members are small (volume content is chunked), so both directions work with whole
//! members held in memory.

use {
    anyhow::{Context as _, Result, bail, ensure},
    heddle_protocol::{Device, DeviceKind, EntryKind, Stat},
    std::{
        borrow::Cow,
        io::{self, Read, Write},
    },
    tar::{Archive, Builder, Entry, EntryType, Header},
};

const BLOCK_LEN: u64 = 512;
/// Extended header key carrying the size of the file a signature member describes, or
/// the joined length of split content on its last chunk.
const FILE_SIZE_KEY: &str = "HEDDLE.filesize";

/// One member of a tar stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarMember {
    pub name: String,
    /// Never [`EntryKind::Deleted`]; tombstones are regular members with a `deleted/` name.
    pub kind: EntryKind,
    pub stat: Stat,
    pub data: Vec<u8>,
    /// Size of the described file, for members preceded by a file size record.
    pub file_size: Option<u64>,
}

/// Pull reader of tar members.
///
/// GNU long name and long link records are folded into the member that follows them.
/// Reading stops at the end-of-archive block or at a clean end of input, and after the
/// first error.
pub struct TarReader<R> {
    inner: R,
    finished: bool,
}

impl<R: Read> TarReader<R> {
    #[inline]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    fn next_member(&mut self) -> Result<Option<TarMember>> {
        loop {
            // Each archive reads one member and leaves the padding after its data unread.
            let mut archive = Archive::new(&mut self.inner);
            let (member, size) = {
                let Some(entry) = archive.entries()?.next() else {
                    return Ok(None);
                };
                let mut entry = entry?;
                let size = entry.size();
                let member = if entry.header().entry_type() == EntryType::XGlobalHeader {
                    io::copy(&mut entry, &mut io::sink())?;
                    None
                } else {
                    Some(read_member(&mut entry)?)
                };
                (member, size)
            };
            let padding = size.next_multiple_of(BLOCK_LEN).saturating_sub(size);
            io::copy(&mut archive.into_inner().take(padding), &mut io::sink())?;
            if let Some(member) = member {
                return Ok(Some(member));
            }
        }
    }
}

impl<R: Read> Iterator for TarReader<R> {
    type Item = Result<TarMember>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let result = self.next_member().transpose();
        if !matches!(result, Some(Ok(_))) {
            self.finished = true;
        }
        result
    }
}

#[expect(clippy::wildcard_enum_match_arm, reason = "other entry types are unsupported")]
fn read_member<R: Read>(entry: &mut Entry<'_, R>) -> Result<TarMember> {
    let mut file_size = None;
    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            if extension.key() == Ok(FILE_SIZE_KEY) {
                file_size = Some(extension.value()?.parse().context("invalid file size record")?);
            }
        }
    }
    let name = String::from_utf8(entry.path_bytes().into_owned())
        .context("tar member name is not valid UTF-8")?;
    let header = entry.header();
    let device = |kind| -> Result<EntryKind> {
        Ok(EntryKind::Device(Device {
            kind,
            major: header.device_major()?.unwrap_or_default(),
            minor: header.device_minor()?.unwrap_or_default(),
        }))
    };
    let kind = match header.entry_type() {
        EntryType::Regular | EntryType::Continuous => EntryKind::Regular,
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink(
            String::from_utf8(
                entry
                    .link_name_bytes()
                    .map(Cow::into_owned)
                    .unwrap_or_default(),
            )
            .context("symlink target is not valid UTF-8")?,
        ),
        EntryType::Fifo => EntryKind::Fifo,
        EntryType::Block => device(DeviceKind::Block)?,
        EntryType::Char => device(DeviceKind::Char)?,
        other => bail!("unsupported tar member type {other:?} for {name:?}"),
    };
    let stat = Stat {
        mode: header.mode()?,
        uid: u32::try_from(header.uid()?)?,
        gid: u32::try_from(header.gid()?)?,
        mtime: i64::try_from(header.mtime()?)?,
    };
    let size = entry.size();
    let mut data = Vec::with_capacity(usize::try_from(size)?);
    entry.read_to_end(&mut data)?;
    ensure!(u64::try_from(data.len())? == size, "truncated tar member {name:?}");
    Ok(TarMember {
        name,
        kind,
        stat,
        data,
        file_size,
    })
}

fn pax_record(key: &str, value: &str) -> String {
    let body_len = key.len().saturating_add(value.len()).saturating_add(3);
    let mut len = body_len;
    // The length prefix counts its own digits.
    while len != body_len.saturating_add(len.to_string().len()) {
        len = body_len.saturating_add(len.to_string().len());
    }
    format!("{len} {key}={value}\n")
}

/// Counts bytes passing through to the inner writer.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    #[inline]
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    #[must_use]
    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count = self
            .count
            .saturating_add(u64::try_from(n).unwrap_or(u64::MAX));
        Ok(n)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Tar stream writer that knows how many bytes it has produced.
pub struct TarWriter<W: Write> {
    builder: Builder<CountingWriter<W>>,
}

impl<W: Write> TarWriter<W> {
    #[inline]
    pub fn new(inner: W) -> Self {
        Self {
            builder: Builder::new(CountingWriter::new(inner)),
        }
    }

    /// Bytes written so far, not counting the end-of-archive blocks.
    #[must_use]
    #[inline]
    pub fn written(&self) -> u64 {
        self.builder.get_ref().count()
    }

    /// Appends a member. `data` must be empty for anything but regular members.
    #[inline]
    pub fn append(&mut self, name: &str, kind: &EntryKind, stat: &Stat, data: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_mode(stat.mode & 0o7777);
        header.set_uid(stat.uid.into());
        header.set_gid(stat.gid.into());
        header.set_mtime(u64::try_from(stat.mtime).unwrap_or(0));
        header.set_size(0);
        match kind {
            EntryKind::Regular => {
                header.set_entry_type(EntryType::Regular);
                header.set_size(u64::try_from(data.len())?);
            }
            EntryKind::Directory => header.set_entry_type(EntryType::Directory),
            EntryKind::Symlink(target) => {
                header.set_entry_type(EntryType::Symlink);
                self.builder.append_link(&mut header, name, target)?;
                return Ok(());
            }
            EntryKind::Fifo => header.set_entry_type(EntryType::Fifo),
            EntryKind::Device(device) => {
                header.set_entry_type(match device.kind {
                    DeviceKind::Block => EntryType::Block,
                    DeviceKind::Char => EntryType::Char,
                });
                header.set_device_major(device.major)?;
                header.set_device_minor(device.minor)?;
            }
            EntryKind::Deleted => bail!("tombstones have no tar type of their own"),
        }
        if *kind != EntryKind::Regular {
            ensure!(data.is_empty(), "{} member {name:?} with data", kind.name());
        }
        self.builder.append_data(&mut header, name, data)?;
        Ok(())
    }

    /// Records the size of the file described by the next member.
    #[inline]
    pub fn append_file_size(&mut self, size: u64) -> Result<()> {
        let record = pax_record(FILE_SIZE_KEY, &size.to_string());
        let mut header = Header::new_ustar();
        header.set_path("././@PaxHeader")?;
        header.set_entry_type(EntryType::XHeader);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_size(u64::try_from(record.len())?);
        header.set_cksum();
        self.builder.append(&header, record.as_bytes())?;
        Ok(())
    }

    /// Writes the end-of-archive blocks and returns the inner writer.
    #[inline]
    pub fn finish(self) -> Result<W> {
        Ok(self.builder.into_inner()?.into_inner())
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use {super::*, std::io::Cursor};

    fn stat(mode: u32) -> Stat {
        Stat {
            mode,
            uid: 1000,
            gid: 100,
            mtime: 1_700_000_000,
        }
    }

    #[test]
    fn members_survive() {
        let long_name = format!("snapshot/{}/file", "d".repeat(150));
        let long_target = "t".repeat(200);
        let members = vec![
            ("snapshot", EntryKind::Directory, stat(0o755), Vec::new()),
            ("snapshot/a", EntryKind::Regular, stat(0o644), b"hello".to_vec()),
            (long_name.as_str(), EntryKind::Regular, stat(0o600), vec![7; 1300]),
            ("snapshot/l", EntryKind::Symlink(long_target.clone()), stat(0o777), Vec::new()),
            ("snapshot/p", EntryKind::Fifo, stat(0o644), Vec::new()),
            (
                "snapshot/dev",
                EntryKind::Device(Device {
                    kind: DeviceKind::Char,
                    major: 1,
                    minor: 3,
                }),
                stat(0o666),
                Vec::new(),
            ),
            ("deleted/gone", EntryKind::Regular, Stat::default(), Vec::new()),
        ];
        let mut writer = TarWriter::new(Vec::new());
        for (name, kind, stat, data) in &members {
            if *name == "snapshot/a" {
                writer.append_file_size(123_456).unwrap();
            }
            writer.append(name, kind, stat, data).unwrap();
        }
        assert!(writer.written() > 0);
        let bytes = writer.finish().unwrap();
        assert_eq!(u64::try_from(bytes.len()).unwrap() % BLOCK_LEN, 0);

        let read: Vec<_> = TarReader::new(Cursor::new(bytes))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read.len(), members.len());
        for (member, (name, kind, stat, data)) in read.iter().zip(&members) {
            assert_eq!(member.name.trim_end_matches('/'), *name);
            assert_eq!(&member.kind, kind);
            assert_eq!(member.stat.perms(), stat.perms());
            assert_eq!(member.stat.mtime, stat.mtime);
            assert_eq!(&member.data, data);
            let expected_size = (*name == "snapshot/a").then_some(123_456);
            assert_eq!(member.file_size, expected_size);
        }
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let mut writer = TarWriter::new(Vec::new());
        writer
            .append("snapshot/a", &EntryKind::Regular, &stat(0o644), b"x")
            .unwrap();
        let mut bytes = writer.finish().unwrap();
        bytes[10] ^= 1;
        let mut reader = TarReader::new(Cursor::new(bytes));
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }

    #[test]
    fn pax_records() {
        for value in ["1", "12345", &"9".repeat(95)] {
            let record = pax_record("k", value);
            let (len, _) = record.split_once(' ').unwrap();
            assert_eq!(len.parse::<usize>().unwrap(), record.len());
            assert_eq!(record.strip_prefix(len).unwrap(), format!(" k={value}\n"));
        }
    }

    #[test]
    fn empty_input() {
        assert!(TarReader::new(Cursor::new(Vec::new())).next().is_none());
    }
}

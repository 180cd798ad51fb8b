//! Archive file names.
//!
//! Every file the engine stores remotely carries its role, session time(s), volume
//! number and encoding in its name, so the whole repository state can be rebuilt from a
//! directory listing. Two grammars exist: a verbose one with readable timestamps and a
//! compact one with base-36 fields. Names that match neither are not ours and parse as
//! `None`.

use {
    crate::{
        DateTimeUtc,
        time::{format_compact, format_verbose, from_base36, parse_compact, parse_verbose, to_base36},
    },
    once_cell::sync::Lazy,
    regex::{Captures, Regex},
    std::fmt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameStyle {
    Verbose,
    Compact,
}

/// How the stored bytes of a file are transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Plain,
    Gzip,
    Encrypted,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NameKind {
    FullVolume {
        time: DateTimeUtc,
        volume: u32,
    },
    FullManifest {
        time: DateTimeUtc,
    },
    IncVolume {
        start: DateTimeUtc,
        end: DateTimeUtc,
        volume: u32,
    },
    IncManifest {
        start: DateTimeUtc,
        end: DateTimeUtc,
    },
    FullSignatures {
        time: DateTimeUtc,
    },
    NewSignatures {
        start: DateTimeUtc,
        end: DateTimeUtc,
    },
    /// Content-addressed block volume of the block store.
    BlockVolume {
        id: String,
    },
    /// File list of one block store session.
    FileList {
        time: DateTimeUtc,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedName {
    pub kind: NameKind,
    pub encoding: Encoding,
    pub style: NameStyle,
}

impl ParsedName {
    #[must_use]
    #[inline]
    pub fn new(kind: NameKind, encoding: Encoding, style: NameStyle) -> Self {
        Self {
            kind,
            encoding,
            style,
        }
    }

    /// Parses a file name. Returns `None` for names this engine never produces.
    #[must_use]
    #[inline]
    pub fn parse(name: &str) -> Option<Self> {
        let (stem, encoding) = split_suffix(name);
        PATTERNS.iter().find_map(|pattern| {
            let captures = pattern.regex.captures(stem)?;
            let kind = (pattern.build)(&captures, pattern.style)?;
            Some(Self::new(kind, encoding, pattern.style))
        })
    }

    #[must_use]
    #[inline]
    pub fn generate(&self) -> String {
        let mut name = match self.style {
            NameStyle::Verbose => verbose_stem(&self.kind),
            NameStyle::Compact => compact_stem(&self.kind),
        };
        name.push_str(suffix(self.encoding, self.style));
        name
    }

    #[must_use]
    #[inline]
    pub fn is_manifest(&self) -> bool {
        matches!(
            self.kind,
            NameKind::FullManifest { .. } | NameKind::IncManifest { .. }
        )
    }

    #[must_use]
    #[inline]
    pub fn is_signature(&self) -> bool {
        matches!(
            self.kind,
            NameKind::FullSignatures { .. } | NameKind::NewSignatures { .. }
        )
    }

    /// Whether the name belongs to a full or incremental backup set.
    #[must_use]
    #[inline]
    pub fn is_backup_set_file(&self) -> bool {
        matches!(
            self.kind,
            NameKind::FullVolume { .. }
                | NameKind::FullManifest { .. }
                | NameKind::IncVolume { .. }
                | NameKind::IncManifest { .. }
        )
    }

    #[must_use]
    #[inline]
    pub fn volume_number(&self) -> Option<u32> {
        match self.kind {
            NameKind::FullVolume { volume, .. } | NameKind::IncVolume { volume, .. } => {
                Some(volume)
            }
            NameKind::FullManifest { .. }
            | NameKind::IncManifest { .. }
            | NameKind::FullSignatures { .. }
            | NameKind::NewSignatures { .. }
            | NameKind::BlockVolume { .. }
            | NameKind::FileList { .. } => None,
        }
    }

    /// Start of the covered time range. Equals [`Self::end_time`] for full sets.
    #[must_use]
    #[inline]
    pub fn start_time(&self) -> Option<DateTimeUtc> {
        match self.kind {
            NameKind::FullVolume { time, .. }
            | NameKind::FullManifest { time }
            | NameKind::FullSignatures { time }
            | NameKind::FileList { time } => Some(time),
            NameKind::IncVolume { start, .. }
            | NameKind::IncManifest { start, .. }
            | NameKind::NewSignatures { start, .. } => Some(start),
            NameKind::BlockVolume { .. } => None,
        }
    }

    #[must_use]
    #[inline]
    pub fn end_time(&self) -> Option<DateTimeUtc> {
        match self.kind {
            NameKind::FullVolume { time, .. }
            | NameKind::FullManifest { time }
            | NameKind::FullSignatures { time }
            | NameKind::FileList { time } => Some(time),
            NameKind::IncVolume { end, .. }
            | NameKind::IncManifest { end, .. }
            | NameKind::NewSignatures { end, .. } => Some(end),
            NameKind::BlockVolume { .. } => None,
        }
    }
}

impl fmt::Display for ParsedName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.generate())
    }
}

fn split_suffix(name: &str) -> (&str, Encoding) {
    let lower = name.to_ascii_lowercase();
    for (suffix, encoding) in [
        (".gpg", Encoding::Encrypted),
        (".gz", Encoding::Gzip),
        (".g", Encoding::Encrypted),
        (".z", Encoding::Gzip),
    ] {
        if lower.ends_with(suffix)
            && let Some(stem) = name.get(..name.len().saturating_sub(suffix.len()))
        {
            return (stem, encoding);
        }
    }
    (name, Encoding::Plain)
}

fn suffix(encoding: Encoding, style: NameStyle) -> &'static str {
    match (encoding, style) {
        (Encoding::Plain, _) => "",
        (Encoding::Gzip, NameStyle::Verbose) => ".gz",
        (Encoding::Gzip, NameStyle::Compact) => ".z",
        (Encoding::Encrypted, NameStyle::Verbose) => ".gpg",
        (Encoding::Encrypted, NameStyle::Compact) => ".g",
    }
}

fn verbose_stem(kind: &NameKind) -> String {
    let t = |time: &DateTimeUtc| format_verbose(*time);
    match kind {
        NameKind::FullVolume { time, volume } => {
            format!("duplicity-full.{}.vol{volume}.difftar", t(time))
        }
        NameKind::FullManifest { time } => format!("duplicity-full.{}.manifest", t(time)),
        NameKind::IncVolume { start, end, volume } => format!(
            "duplicity-inc.{}.to.{}.vol{volume}.difftar",
            t(start),
            t(end)
        ),
        NameKind::IncManifest { start, end } => {
            format!("duplicity-inc.{}.to.{}.manifest", t(start), t(end))
        }
        NameKind::FullSignatures { time } => {
            format!("duplicity-full-signatures.{}.sigtar", t(time))
        }
        NameKind::NewSignatures { start, end } => format!(
            "duplicity-new-signatures.{}.to.{}.sigtar",
            t(start),
            t(end)
        ),
        NameKind::BlockVolume { id } => format!("duplicity-blocks.{id}.dblock"),
        NameKind::FileList { time } => format!("duplicity-filelist.{}.dlist", t(time)),
    }
}

fn compact_stem(kind: &NameKind) -> String {
    let t = |time: &DateTimeUtc| format_compact(*time);
    let n = |volume: &u32| to_base36(u64::from(*volume));
    match kind {
        NameKind::FullVolume { time, volume } => format!("df.{}{}.dt", t(time), n(volume)),
        NameKind::FullManifest { time } => format!("df.{}.m", t(time)),
        NameKind::IncVolume { start, end, volume } => {
            format!("di.{}.{}{}.dt", t(start), t(end), n(volume))
        }
        NameKind::IncManifest { start, end } => format!("di.{}.{}.m", t(start), t(end)),
        NameKind::FullSignatures { time } => format!("dfs.{}.st", t(time)),
        NameKind::NewSignatures { start, end } => format!("dns.{}.{}.st", t(start), t(end)),
        NameKind::BlockVolume { id } => format!("db.{id}.db"),
        NameKind::FileList { time } => format!("dl.{}.dl", t(time)),
    }
}

type Build = fn(&Captures<'_>, NameStyle) -> Option<NameKind>;

struct Pattern {
    regex: Regex,
    style: NameStyle,
    build: Build,
}

const VERBOSE_TIME: &str = r"\d{8}t\d{6}z";
const COMPACT_TIME: &str = "[0-9a-z]{7}";

fn time(captures: &Captures<'_>, group: &str, style: NameStyle) -> Option<DateTimeUtc> {
    let text = captures.name(group)?.as_str();
    match style {
        NameStyle::Verbose => parse_verbose(text),
        NameStyle::Compact => parse_compact(text),
    }
}

fn volume(captures: &Captures<'_>, style: NameStyle) -> Option<u32> {
    let text = captures.name("n")?.as_str();
    let value = match style {
        NameStyle::Verbose => text.parse().ok()?,
        NameStyle::Compact => u32::try_from(from_base36(text)?).ok()?,
    };
    (value > 0).then_some(value)
}

fn full_volume(c: &Captures<'_>, style: NameStyle) -> Option<NameKind> {
    Some(NameKind::FullVolume {
        time: time(c, "t", style)?,
        volume: volume(c, style)?,
    })
}

fn full_manifest(c: &Captures<'_>, style: NameStyle) -> Option<NameKind> {
    Some(NameKind::FullManifest {
        time: time(c, "t", style)?,
    })
}

fn inc_volume(c: &Captures<'_>, style: NameStyle) -> Option<NameKind> {
    Some(NameKind::IncVolume {
        start: time(c, "t1", style)?,
        end: time(c, "t2", style)?,
        volume: volume(c, style)?,
    })
}

fn inc_manifest(c: &Captures<'_>, style: NameStyle) -> Option<NameKind> {
    Some(NameKind::IncManifest {
        start: time(c, "t1", style)?,
        end: time(c, "t2", style)?,
    })
}

fn full_signatures(c: &Captures<'_>, style: NameStyle) -> Option<NameKind> {
    Some(NameKind::FullSignatures {
        time: time(c, "t", style)?,
    })
}

fn new_signatures(c: &Captures<'_>, style: NameStyle) -> Option<NameKind> {
    Some(NameKind::NewSignatures {
        start: time(c, "t1", style)?,
        end: time(c, "t2", style)?,
    })
}

fn block_volume(c: &Captures<'_>, _style: NameStyle) -> Option<NameKind> {
    Some(NameKind::BlockVolume {
        id: c.name("id")?.as_str().to_ascii_lowercase(),
    })
}

fn file_list(c: &Captures<'_>, style: NameStyle) -> Option<NameKind> {
    Some(NameKind::FileList {
        time: time(c, "t", style)?,
    })
}

#[expect(clippy::unwrap_used, reason = "static patterns")]
fn pattern(style: NameStyle, body: &str, build: Build) -> Pattern {
    let (t, vol) = match style {
        NameStyle::Verbose => (VERBOSE_TIME, r"\.vol(?P<n>\d+)"),
        NameStyle::Compact => (COMPACT_TIME, "(?P<n>[0-9a-z]+)"),
    };
    let body = body
        .replace("{t}", &format!("(?P<t>{t})"))
        .replace("{t1}", &format!("(?P<t1>{t})"))
        .replace("{t2}", &format!("(?P<t2>{t})"))
        .replace("{n}", vol);
    Pattern {
        regex: Regex::new(&format!("(?i)^{body}$")).unwrap(),
        style,
        build,
    }
}

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    use NameStyle::{Compact, Verbose};
    vec![
        pattern(Verbose, r"duplicity-full\.{t}{n}\.difftar", full_volume),
        pattern(Verbose, r"duplicity-full\.{t}\.manifest", full_manifest),
        pattern(Verbose, r"duplicity-inc\.{t1}\.to\.{t2}{n}\.difftar", inc_volume),
        pattern(Verbose, r"duplicity-inc\.{t1}\.to\.{t2}\.manifest", inc_manifest),
        pattern(Verbose, r"duplicity-full-signatures\.{t}\.sigtar", full_signatures),
        pattern(Verbose, r"duplicity-new-signatures\.{t1}\.to\.{t2}\.sigtar", new_signatures),
        pattern(Verbose, r"duplicity-blocks\.(?P<id>[0-9a-f]+)\.dblock", block_volume),
        pattern(Verbose, r"duplicity-filelist\.{t}\.dlist", file_list),
        pattern(Compact, r"df\.{t}{n}\.dt", full_volume),
        pattern(Compact, r"df\.{t}\.m", full_manifest),
        pattern(Compact, r"di\.{t1}\.{t2}{n}\.dt", inc_volume),
        pattern(Compact, r"di\.{t1}\.{t2}\.m", inc_manifest),
        pattern(Compact, r"dfs\.{t}\.st", full_signatures),
        pattern(Compact, r"dns\.{t1}\.{t2}\.st", new_signatures),
        pattern(Compact, r"db\.(?P<id>[0-9a-f]+)\.db", block_volume),
        pattern(Compact, r"dl\.{t}\.dl", file_list),
    ]
});

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {super::*, chrono::DateTime};

    fn t(seconds: i64) -> DateTimeUtc {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn all_kinds() -> Vec<NameKind> {
        vec![
            NameKind::FullVolume {
                time: t(1_700_000_000),
                volume: 1,
            },
            NameKind::FullVolume {
                time: t(1_700_000_000),
                volume: 1234,
            },
            NameKind::FullManifest {
                time: t(1_700_000_000),
            },
            NameKind::IncVolume {
                start: t(1_700_000_000),
                end: t(1_700_086_400),
                volume: 37,
            },
            NameKind::IncManifest {
                start: t(1_700_000_000),
                end: t(1_700_086_400),
            },
            NameKind::FullSignatures {
                time: t(1_600_000_000),
            },
            NameKind::NewSignatures {
                start: t(1_600_000_000),
                end: t(1_600_000_001),
            },
            NameKind::BlockVolume {
                id: "0badc0ffee".into(),
            },
            NameKind::FileList {
                time: t(1_650_000_000),
            },
        ]
    }

    #[test]
    fn generate_then_parse_is_identity() {
        for kind in all_kinds() {
            for style in [NameStyle::Verbose, NameStyle::Compact] {
                for encoding in [Encoding::Plain, Encoding::Gzip, Encoding::Encrypted] {
                    let name = ParsedName::new(kind.clone(), encoding, style);
                    let text = name.generate();
                    assert_eq!(ParsedName::parse(&text), Some(name), "{text}");
                }
            }
        }
    }

    #[test]
    fn known_names() {
        let name = ParsedName::new(
            NameKind::IncVolume {
                start: t(1_700_000_000),
                end: t(1_700_086_400),
                volume: 2,
            },
            Encoding::Encrypted,
            NameStyle::Verbose,
        );
        assert_eq!(
            name.generate(),
            "duplicity-inc.20231114T221320Z.to.20231115T221320Z.vol2.difftar.gpg"
        );
        let manifest = ParsedName::new(
            NameKind::FullManifest {
                time: t(1_700_000_000),
            },
            Encoding::Plain,
            NameStyle::Compact,
        );
        assert_eq!(
            manifest.generate(),
            format!("df.{}.m", format_compact(t(1_700_000_000)))
        );
    }

    #[test]
    fn case_insensitive() {
        let parsed = ParsedName::parse("DUPLICITY-FULL.20231114T221320Z.VOL3.DIFFTAR.GZ").unwrap();
        assert_eq!(parsed.volume_number(), Some(3));
        assert_eq!(parsed.encoding, Encoding::Gzip);
    }

    #[test]
    fn foreign_names_are_ignored() {
        for name in [
            "",
            "README",
            "duplicity-full.2023.manifest",
            "duplicity-full.20231114T221320Z.vol0.difftar",
            "duplicity-full.20231114T221320Z.volx.difftar",
            "duplicity-inc.20231114T221320Z.manifest",
            "df.abc.m",
            "duplicity-verification.json",
        ] {
            assert_eq!(ParsedName::parse(name), None, "{name}");
        }
    }

    #[test]
    fn times() {
        let parsed = ParsedName::parse(
            "duplicity-new-signatures.20231114T221320Z.to.20231115T221320Z.sigtar.gpg",
        )
        .unwrap();
        assert!(parsed.is_signature());
        assert_eq!(parsed.start_time(), Some(t(1_700_000_000)));
        assert_eq!(parsed.end_time(), Some(t(1_700_086_400)));
        assert_eq!(parsed.encoding, Encoding::Encrypted);
    }
}

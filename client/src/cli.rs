use {
    anyhow::{Context as _, Result, format_err},
    byte_unit::Byte,
    chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc},
    clap::{Parser, Subcommand},
    heddle_protocol::{DateTimeUtc, time::parse_verbose},
    std::{path::PathBuf, str::FromStr},
};

/// Format of local times in messages and in `--time` arguments.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Config file. Defaults to `heddle.json5` in the user config directory.
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// Log file. Overrides `log_file` from the config.
    #[clap(long)]
    pub log_file: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Back up `source` to `target`: incremental if a chain exists, full otherwise.
    Backup {
        source: PathBuf,
        target: String,
        /// Start a new chain if the current one is older than this.
        #[arg(long)]
        full_if_older_than: Option<humantime::Duration>,
    },
    /// Start a new chain with a full backup.
    Full { source: PathBuf, target: String },
    /// Add an incremental backup to the current chain.
    Incremental { source: PathBuf, target: String },
    /// Restore the backup at `target` into `output`.
    Restore {
        target: String,
        output: PathBuf,
        #[arg(long)]
        time: Option<TimeArg>,
        /// Restore only this file or directory, relative to the backup root.
        #[arg(long)]
        path_prefix: Option<String>,
        /// Allow restoring into a non-empty directory.
        #[arg(long)]
        force: bool,
    },
    /// Compare the backup at `target` with the files in `source`.
    Verify {
        target: String,
        source: PathBuf,
        #[arg(long)]
        time: Option<TimeArg>,
        #[arg(long)]
        path_prefix: Option<String>,
    },
    /// Check the stored hash of every volume.
    VerifyVolumes { target: String },
    CollectionStatus { target: String },
    ListCurrentFiles {
        target: String,
        #[arg(long)]
        time: Option<TimeArg>,
    },
    /// Delete files that belong to no usable backup chain.
    Cleanup {
        target: String,
        #[arg(long)]
        force: bool,
    },
    /// Delete backup chains older than `time`.
    RemoveOlderThan {
        time: TimeArg,
        target: String,
        #[arg(long)]
        force: bool,
    },
    /// Delete all backup chains except the newest `count` ones.
    RemoveAllButNFull {
        count: usize,
        target: String,
        #[arg(long)]
        force: bool,
    },
    /// Store `source` in the block store at `target`.
    BlockBackup { source: PathBuf, target: String },
    /// Restore the newest file list of the block store at `target` into `output`.
    BlockRestore {
        target: String,
        output: PathBuf,
        /// Glob selecting the paths to restore.
        #[arg(long)]
        scope: Option<String>,
        /// Memory budget for decoded volumes. Overrides `max_cache_size`.
        #[arg(long)]
        max_cache_size: Option<Byte>,
    },
    /// Check the files listed in the verification file of a block store.
    VerifySidecar { target: String },
    /// Print a new random encryption key.
    GenerateKey,
}

/// A point in time given on the command line.
///
/// Accepts `now`, RFC 3339, `20231114T221320Z`, a local `2023-11-14` or
/// `2023-11-14_22:13:20`, or an age such as `3days` meaning that long ago.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeArg(pub DateTimeUtc);

impl TimeArg {
    #[inline]
    pub fn parse_at(input: &str, now: DateTimeUtc) -> Result<Self> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("now") {
            return Ok(Self(now));
        }
        if let Ok(time) = DateTime::parse_from_rfc3339(input) {
            return Ok(Self(time.with_timezone(&Utc)));
        }
        if let Some(time) = parse_verbose(input) {
            return Ok(Self(time));
        }
        let naive = NaiveDateTime::parse_from_str(input, DATE_TIME_FORMAT).ok().or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        });
        if let Some(naive) = naive {
            let local = Local
                .from_local_datetime(&naive)
                .single()
                .ok_or_else(|| format_err!("ambiguous local time: {input}"))?;
            return Ok(Self(local.with_timezone(&Utc)));
        }
        let age = humantime::parse_duration(input)
            .with_context(|| format!("invalid time: {input:?}"))?;
        let age = TimeDelta::from_std(age)?;
        now.checked_sub_signed(age)
            .map(Self)
            .ok_or_else(|| format_err!("time out of range: {input}"))
    }
}

impl FromStr for TimeArg {
    type Err = anyhow::Error;

    #[inline]
    fn from_str(input: &str) -> Result<Self> {
        Self::parse_at(input, Utc::now())
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::panic, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn time_args() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let parse = |input| TimeArg::parse_at(input, now).unwrap().0;
        assert_eq!(parse("now"), now);
        assert_eq!(parse("2023-11-14T22:13:20Z"), now);
        assert_eq!(parse("2023-11-14T23:13:20+01:00"), now);
        assert_eq!(parse("20231114T221320Z"), now);
        assert_eq!(parse("2days").timestamp(), 1_700_000_000 - 2 * 86_400);
        assert_eq!(parse("1h 30m").timestamp(), 1_700_000_000 - 5_400);
        let local = parse("2023-11-14");
        assert_eq!(
            local.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
            "2023-11-14 00:00"
        );
        TimeArg::parse_at("yesterday-ish", now).unwrap_err();
    }

    #[test]
    fn commands() {
        let cli = Cli::try_parse_from([
            "heddle",
            "restore",
            "file:///backup",
            "out",
            "--time",
            "20231114T221320Z",
            "--path-prefix",
            "a/b",
        ])
        .unwrap();
        let Command::Restore {
            time, path_prefix, force, ..
        } = cli.command
        else {
            panic!("unexpected command");
        };
        assert_eq!(time.unwrap().0.timestamp(), 1_700_000_000);
        assert_eq!(path_prefix.as_deref(), Some("a/b"));
        assert!(!force);

        let cli = Cli::try_parse_from(["heddle", "remove-all-but-n-full", "2", "dir", "--force"])
            .unwrap();
        assert_eq!(
            cli.command,
            Command::RemoveAllButNFull {
                count: 2,
                target: "dir".into(),
                force: true,
            }
        );
        Cli::try_parse_from(["heddle", "block-restore", "dir", "out", "--max-cache-size", "50 MB"])
            .unwrap();
    }
}

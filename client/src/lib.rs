//! Command line front end of the heddle backup engine.

pub mod cli;
pub mod config;
mod backup;
mod blocks;
mod cleanup;
mod counters;
mod info;
mod restore;
pub mod term;
mod verify;

use {
    anyhow::{Context as _, Result},
    cli::{Cli, Command},
    config::Config,
    counters::Counters,
    derivative::Derivative,
    fs_err::{OpenOptions, create_dir_all},
    heddle_protocol::{Error, credentials::EncryptionKey},
    heddle_sdk::{
        backend::open_backend,
        blockstore::{BlockIndex, BlockStore},
        crypto::{Cipher, Encryptor},
        repository::{BackupMode, Repository, backup_name},
    },
    std::{
        io::{self, Write},
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
    term::TermLayer,
    tokio::task::block_in_place,
    tracing::info,
    tracing_subscriber::{
        EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
    },
};

#[cfg(feature = "keyring")]
use tracing::warn;

/// State of one command invocation.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Ctx {
    pub config: Config,
    #[derivative(Debug = "ignore")]
    pub encryptor: Option<Arc<dyn Encryptor>>,
    pub counters: Counters,
}

impl Ctx {
    fn repository(&self, target: &str) -> Result<Repository> {
        Repository::open(
            target,
            open_backend(target, self.config.retry_policy())?,
            self.encryptor.clone(),
            self.config.repository_options()?,
        )
    }

    fn block_store(&self, target: &str) -> Result<BlockStore> {
        BlockStore::new(
            open_backend(target, self.config.retry_policy())?,
            self.encryptor.clone(),
            self.config.compact_names,
            self.config.compression,
        )
    }

    fn block_index(&self, target: &str) -> Result<BlockIndex> {
        let dir = self.config.archive_dir()?.join(backup_name(target));
        create_dir_all(&dir)?;
        BlockIndex::open(&dir.join("block-index"))
    }
}

/// How a command completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Some entries were skipped or restored with errors.
    PartialFailure(u64),
    /// Verification found differences.
    Differences(u64),
}

impl Outcome {
    #[inline]
    fn from_errors(errors: u64) -> Self {
        if errors == 0 {
            Self::Success
        } else {
            Self::PartialFailure(errors)
        }
    }

    #[must_use]
    #[inline]
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::PartialFailure(_) => 2,
            Self::Differences(_) => 3,
        }
    }
}

/// Exit code of a finished command: 0 on success, 1 on fatal errors, 2 on partial
/// failure and 3 when verification found differences.
#[must_use]
#[inline]
pub fn exit_code(result: &Result<Outcome>) -> u8 {
    match result {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => {
            if matches!(err.downcast_ref::<Error>(), Some(Error::PartialFailure(_))) {
                2
            } else {
                1
            }
        }
    }
}

const KEYRING_SERVICE: &str = "heddle";
const KEYRING_USER: &str = "heddle_encryption_key";

#[cfg(feature = "keyring")]
fn fetch_keyring_key() -> Result<EncryptionKey> {
    use keyring::{Entry, Error as KeyringError};

    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
    match entry.get_password() {
        Ok(value) => value.parse().context("invalid encryption key in keyring"),
        Err(KeyringError::NoEntry) => {
            info!("entry {KEYRING_USER:?} not found in keyring");
            let value = rpassword::prompt_password("Input encryption key: ")?;
            anyhow::ensure!(!value.is_empty(), "no value provided");
            let key = value.parse().context("invalid encryption key")?;
            match entry.set_password(&value) {
                Ok(()) => info!("entry {KEYRING_USER:?} saved to keyring"),
                Err(err) => warn!("failed to save secret in keyring: {err}"),
            }
            Ok(key)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(not(feature = "keyring"))]
fn fetch_keyring_key() -> Result<EncryptionKey> {
    anyhow::bail!(
        "`use_keyring` is set, but heddle was built without keyring support \
         (service {KEYRING_SERVICE:?}, user {KEYRING_USER:?})"
    )
}

fn load_encryptor(config: &Config) -> Result<Option<Arc<dyn Encryptor>>> {
    if !config.encrypt {
        return Ok(None);
    }
    let key = if config.use_keyring {
        fetch_keyring_key()?
    } else {
        config
            .encryption_key
            .clone()
            .context("missing `encryption_key` or `use_keyring` in config")?
    };
    Ok(Some(Arc::new(Cipher::new(&key))))
}

/// Runs one command.
#[inline]
pub async fn run(cli: Cli, config: Config) -> Result<Outcome> {
    if cli.command == Command::GenerateKey {
        let key = EncryptionKey::generate()?;
        info!("{}", key.display_unmasked());
        return Ok(Outcome::Success);
    }
    let ctx = Arc::new(Ctx {
        encryptor: load_encryptor(&config)?,
        config,
        counters: Counters::default(),
    });
    let result = handle_command(cli.command, &ctx).await;
    ctx.counters.report();
    result
}

async fn handle_command(command: Command, ctx: &Arc<Ctx>) -> Result<Outcome> {
    match command {
        Command::Backup {
            source,
            target,
            full_if_older_than,
        } => {
            let mode = BackupMode::Auto {
                full_if_older_than: full_if_older_than
                    .map(Into::into)
                    .or(ctx.config.full_if_older_than),
            };
            block_in_place(|| backup::backup(ctx, &source, &target, mode))
        }
        Command::Full { source, target } => {
            block_in_place(|| backup::backup(ctx, &source, &target, BackupMode::Full))
        }
        Command::Incremental { source, target } => {
            block_in_place(|| backup::backup(ctx, &source, &target, BackupMode::Incremental))
        }
        Command::Restore {
            target,
            output,
            time,
            path_prefix,
            force,
        } => block_in_place(|| {
            restore::restore(
                ctx,
                &target,
                &output,
                time.map(|time| time.0),
                path_prefix.as_deref(),
                force,
            )
        }),
        Command::Verify {
            target,
            source,
            time,
            path_prefix,
        } => block_in_place(|| {
            verify::verify(
                ctx,
                &target,
                &source,
                time.map(|time| time.0),
                path_prefix.as_deref(),
            )
        }),
        Command::VerifyVolumes { target } => verify::verify_volumes(ctx, &target).await,
        Command::CollectionStatus { target } => {
            block_in_place(|| info::collection_status(ctx, &target))
        }
        Command::ListCurrentFiles { target, time } => {
            block_in_place(|| restore::list_current_files(ctx, &target, time.map(|time| time.0)))
        }
        Command::Cleanup { target, force } => {
            block_in_place(|| cleanup::cleanup(ctx, &target, force))
        }
        Command::RemoveOlderThan {
            time,
            target,
            force,
        } => block_in_place(|| cleanup::remove_older_than(ctx, &target, time.0, force)),
        Command::RemoveAllButNFull {
            count,
            target,
            force,
        } => block_in_place(|| cleanup::remove_all_but_n_full(ctx, &target, count, force)),
        Command::BlockBackup { source, target } => {
            block_in_place(|| blocks::block_backup(ctx, &source, &target))
        }
        Command::BlockRestore {
            target,
            output,
            scope,
            max_cache_size,
        } => block_in_place(|| {
            blocks::block_restore(
                ctx,
                &target,
                &output,
                scope,
                max_cache_size.unwrap_or(ctx.config.max_cache_size).as_u64(),
            )
        }),
        Command::VerifySidecar { target } => {
            block_in_place(|| blocks::verify_sidecar(ctx, &target))
        }
        Command::GenerateKey => Ok(Outcome::Success),
    }
}

/// Opens the log file for appending, or stdout if there is none.
#[inline]
pub fn log_writer(path: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    let Some(path) = path else {
        return Ok(Box::new(io::stdout()));
    };
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(file))
}

#[inline]
pub fn default_log_path() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .context("cannot find data dir")?
        .join("heddle.log"))
}

#[inline]
pub fn setup_logger(log_file: Option<PathBuf>, log_filter: &str) -> Result<()> {
    // Falls back to stdout if `data_dir()` fails.
    let log_file = log_file.or_else(|| default_log_path().ok());
    let fmt_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(log_writer(log_file.as_deref())?));
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::try_new(log_filter)?)
        .with(TermLayer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {super::*, anyhow::anyhow};

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&Ok(Outcome::Success)), 0);
        assert_eq!(exit_code(&Ok(Outcome::from_errors(0))), 0);
        assert_eq!(exit_code(&Ok(Outcome::from_errors(3))), 2);
        assert_eq!(exit_code(&Ok(Outcome::Differences(1))), 3);
        assert_eq!(exit_code(&Err(anyhow!("broken"))), 1);
        assert_eq!(exit_code(&Err(Error::PartialFailure(2).into())), 2);
        assert_eq!(
            exit_code(&Err(Error::Integrity("bad hash".into()).into())),
            1
        );
    }

    #[test]
    fn log_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/heddle.log");
        log_writer(Some(&path)).unwrap().write_all(b"one\n").unwrap();
        log_writer(Some(&path)).unwrap().write_all(b"two\n").unwrap();
        assert_eq!(fs_err::read_to_string(&path).unwrap(), "one\ntwo\n");
    }
}

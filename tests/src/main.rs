//! Randomized end-to-end check: mutates a source tree, backs it up into both stores and
//! restores every saved state again.

mod diff;
mod shuffle;

use {
    anyhow::{Context as _, Result, bail},
    chrono::Utc,
    diff::diff,
    fs_err::{create_dir_all, read_dir, remove_dir_all},
    heddle::{
        Outcome,
        cli::{Cli, Command, TimeArg},
        config::Config,
        setup_logger,
        term::clear_status,
    },
    heddle_protocol::{DateTimeUtc, credentials::EncryptionKey},
    heddle_sdk::rules::{Rule, Rules},
    rand::Rng,
    regex::Regex,
    shuffle::shuffle,
    std::{
        env,
        path::{Path, PathBuf},
        process::ExitCode,
        time::Duration,
    },
    tempfile::TempDir,
    tokio::time::sleep,
    tracing::{error, info},
};

const DEFAULT_ITERATIONS: u32 = 30;

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    create_dir_all(dst)?;
    for entry in read_dir(src)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &dst.join(entry.file_name()))?;
        } else {
            fs_err::copy(entry.path(), dst.join(entry.file_name()))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let result = try_main().await;
    clear_status();
    if let Err(err) = result {
        error!("{err:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

struct Snapshot {
    time: DateTimeUtc,
    path: PathBuf,
}

struct Harness {
    dir: PathBuf,
    config: Config,
    source: PathBuf,
    target: String,
    block_target: String,
}

impl Harness {
    async fn run(&self, command: Command) -> Result<Outcome> {
        heddle::run(
            Cli {
                config: None,
                log_file: None,
                command,
            },
            self.config.clone(),
        )
        .await
    }

    async fn run_ok(&self, command: Command) -> Result<()> {
        let name = format!("{command:?}");
        match self.run(command).await? {
            Outcome::Success => Ok(()),
            outcome => bail!("{name} finished with {outcome:?}"),
        }
    }

    fn fresh_dir(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir.join(name);
        if path.exists() {
            remove_dir_all(&path)?;
        }
        Ok(path)
    }

    async fn check_restore(&self, expected: &Path, time: Option<DateTimeUtc>) -> Result<()> {
        info!("Checking restore at {time:?}");
        let output = self.fresh_dir("restored")?;
        self.run_ok(Command::Restore {
            target: self.target.clone(),
            output: output.clone(),
            time: time.map(TimeArg),
            path_prefix: None,
            force: false,
        })
        .await?;
        diff(expected, &output)
    }

    async fn check_blocks(&self) -> Result<()> {
        info!("Checking block store");
        self.run_ok(Command::BlockBackup {
            source: self.source.clone(),
            target: self.block_target.clone(),
        })
        .await?;
        let output = self.fresh_dir("block_restored")?;
        self.run_ok(Command::BlockRestore {
            target: self.block_target.clone(),
            output: output.clone(),
            scope: None,
            max_cache_size: None,
        })
        .await?;
        diff(&self.source, &output)
    }
}

async fn try_main() -> Result<()> {
    let iterations = match env::args().nth(1) {
        Some(value) => value.parse().context("invalid iteration count")?,
        None => DEFAULT_ITERATIONS,
    };
    // Left in place for inspection.
    let dir = TempDir::new()?.keep();
    setup_logger(Some(dir.join("heddle.log")), "info")?;
    info!("dir: {}", dir.display());

    let source = dir.join("source");
    create_dir_all(&source)?;
    let config = Config {
        encrypt: true,
        encryption_key: Some(EncryptionKey::generate()?),
        archive_dir: Some(dir.join("archive")),
        exclude: Rules(vec![
            Rule::NameEquals("target".into()),
            Rule::NameMatches(Regex::new("^build_")?),
        ]),
        ..Config::default()
    };
    let harness = Harness {
        target: dir.join("target_chain").to_string_lossy().into_owned(),
        block_target: dir.join("target_blocks").to_string_lossy().into_owned(),
        dir: dir.clone(),
        config,
        source: source.clone(),
    };

    let mut snapshots = Vec::<Snapshot>::new();
    for iteration in 0..iterations {
        shuffle(&source)?;
        let command = if iteration == 0 || rand::rng().random_bool(0.2) {
            Command::Full {
                source: source.clone(),
                target: harness.target.clone(),
            }
        } else {
            Command::Incremental {
                source: source.clone(),
                target: harness.target.clone(),
            }
        };
        info!("Iteration {iteration}: {command:?}");
        harness.run_ok(command).await?;
        let snapshot = Snapshot {
            time: Utc::now(),
            path: dir.join("snapshots").join(iteration.to_string()),
        };
        copy_dir_all(&source, &snapshot.path)?;
        snapshots.push(snapshot);
        // Session times have a resolution of one second.
        sleep(Duration::from_millis(1100)).await;

        harness.check_restore(&source, None).await?;
        let older = &snapshots[rand::rng().random_range(0..snapshots.len())];
        harness.check_restore(&older.path, Some(older.time)).await?;

        harness
            .run_ok(Command::Verify {
                target: harness.target.clone(),
                source: source.clone(),
                time: None,
                path_prefix: None,
            })
            .await?;
        if rand::rng().random_bool(0.3) {
            harness.check_blocks().await?;
        }
    }

    harness.check_blocks().await?;
    harness
        .run_ok(Command::VerifyVolumes {
            target: harness.target.clone(),
        })
        .await?;
    harness
        .run_ok(Command::VerifySidecar {
            target: harness.block_target.clone(),
        })
        .await?;
    harness
        .run_ok(Command::CollectionStatus {
            target: harness.target.clone(),
        })
        .await?;
    info!("All {iterations} iterations passed");
    Ok(())
}

fn is_ignored(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    name == "target" || name.starts_with("build_")
}

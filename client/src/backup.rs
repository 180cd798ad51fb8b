use {
    crate::{Ctx, Outcome, info::pretty_size, term::set_status},
    anyhow::{Context as _, Result, ensure},
    fs_err::canonicalize,
    heddle_sdk::repository::{BackupMode, BackupSource},
    rustix::system::uname,
    std::path::Path,
    tracing::info,
};

/// Name of this machine, recorded in manifests.
pub fn hostname() -> String {
    uname().nodename().to_string_lossy().into_owned()
}

pub fn backup(ctx: &Ctx, source: &Path, target: &str, mode: BackupMode) -> Result<Outcome> {
    ensure!(
        source.is_dir(),
        "backup source {} is not a directory",
        source.display()
    );
    let source = BackupSource {
        path: canonicalize(source).context("failed to resolve backup source")?,
        rules: ctx.config.exclude.clone(),
        hostname: hostname(),
    };
    let repository = ctx.repository(target)?;
    let _status = set_status(format!("Backing up {}", source.path.display()));
    let stats = repository.backup(&source, mode)?;
    info!(
        "Backup complete: {} files scanned, {} new, {} changed, {} deleted, {} unchanged, {} errors",
        stats.source_files,
        stats.new_files,
        stats.changed_files,
        stats.deleted_files,
        stats.unchanged_files,
        stats.errors
    );
    info!("Stored {} of volumes", pretty_size(stats.volume_bytes));
    Ok(Outcome::from_errors(stats.errors))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_node_name() {
        let name = hostname();
        assert!(!name.is_empty());
        if let Ok(kernel) = fs_err::read_to_string("/proc/sys/kernel/hostname") {
            assert_eq!(name, kernel.trim_end());
        }
    }
}

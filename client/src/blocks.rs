use {
    crate::{Ctx, Outcome, info::pretty_size, term::set_status},
    anyhow::{Result, ensure},
    heddle_sdk::blockstore::{BlockBackupOptions, BlockRestoreOptions, VolumeCache},
    std::path::Path,
    tracing::info,
};

pub fn block_backup(ctx: &Ctx, source: &Path, target: &str) -> Result<Outcome> {
    ensure!(
        source.is_dir(),
        "backup source {} is not a directory",
        source.display()
    );
    let store = ctx.block_store(target)?;
    let index = ctx.block_index(target)?;
    let cache = VolumeCache::with_budget(ctx.config.max_cache_size.as_u64(), 1);
    let options = BlockBackupOptions {
        volume_size: ctx.config.volume_size.as_u64(),
        ..BlockBackupOptions::default()
    };
    let _status = set_status(format!("Storing blocks of {}", source.display()));
    let summary = store.backup(source, ctx.config.exclude.clone(), &index, &cache, options)?;
    info!(
        "Block backup complete: {} files, {} folders, {} symlinks, {} new blocks, {} reused blocks, {} volumes, {} errors",
        summary.files,
        summary.folders,
        summary.symlinks,
        summary.new_blocks,
        summary.reused_blocks,
        summary.volumes,
        summary.errors
    );
    Ok(Outcome::from_errors(summary.errors))
}

pub fn block_restore(
    ctx: &Ctx,
    target: &str,
    output: &Path,
    scope: Option<String>,
    max_cache_bytes: u64,
) -> Result<Outcome> {
    let store = ctx.block_store(target)?;
    let index = ctx.block_index(target)?;
    info!("Using up to {} for decoded volumes", pretty_size(max_cache_bytes));
    let _status = set_status(format!("Restoring into {}", output.display()));
    let summary = store.restore_blocks(
        output,
        &index,
        &BlockRestoreOptions {
            scope,
            max_cache_bytes,
        },
    )?;
    info!(
        "Block restore complete: {} files restored, {} folders, {} symlinks skipped, {} errors",
        summary.restored, summary.folders, summary.symlinks, summary.errors
    );
    Ok(Outcome::from_errors(summary.errors))
}

pub fn verify_sidecar(ctx: &Ctx, target: &str) -> Result<Outcome> {
    let report = ctx.block_store(target)?.verify_sidecar()?;
    info!(
        "Verification complete: {} files checked, {} deleted, {} failures",
        report.checked,
        report.deleted,
        report.failures.len()
    );
    Ok(Outcome::from_errors(u64::try_from(report.failures.len())?))
}

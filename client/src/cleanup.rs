use {
    crate::{Ctx, Outcome},
    anyhow::Result,
    heddle_protocol::DateTimeUtc,
    heddle_sdk::collections::Extraneous,
    tracing::info,
};

fn report(files: &Extraneous, force: bool) {
    if files.is_empty() {
        info!("No files to delete.");
        return;
    }
    let verb = if force { "Deleted" } else { "Would delete" };
    for name in &files.remote {
        info!("{verb} {name}");
    }
    for name in &files.local {
        info!("{verb} local {name}");
    }
    if !force {
        info!("Run again with --force to delete these files.");
    }
}

pub fn cleanup(ctx: &Ctx, target: &str, force: bool) -> Result<Outcome> {
    let files = ctx.repository(target)?.cleanup(force)?;
    report(&files, force);
    Ok(Outcome::Success)
}

pub fn remove_older_than(
    ctx: &Ctx,
    target: &str,
    time: DateTimeUtc,
    force: bool,
) -> Result<Outcome> {
    let files = ctx.repository(target)?.remove_older_than(time, force)?;
    report(&files, force);
    Ok(Outcome::Success)
}

pub fn remove_all_but_n_full(
    ctx: &Ctx,
    target: &str,
    count: usize,
    force: bool,
) -> Result<Outcome> {
    let files = ctx.repository(target)?.remove_all_but_n_full(count, force)?;
    report(&files, force);
    Ok(Outcome::Success)
}

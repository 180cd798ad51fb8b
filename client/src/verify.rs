use {
    crate::{
        Ctx, Outcome,
        counters::Counters,
        restore::parse_prefix,
        term::{set_status, set_status_updater},
    },
    anyhow::Result,
    heddle_protocol::DateTimeUtc,
    std::{path::Path, sync::Arc},
    tokio::task::{JoinSet, block_in_place},
    tracing::{info, warn},
};

pub fn verify(
    ctx: &Ctx,
    target: &str,
    source: &Path,
    time: Option<DateTimeUtc>,
    prefix: Option<&str>,
) -> Result<Outcome> {
    let prefix = parse_prefix(prefix)?;
    let repository = ctx.repository(target)?;
    let _status = set_status(format!("Verifying against {}", source.display()));
    let summary = repository.verify(source, ctx.config.exclude.clone(), time, &prefix)?;
    Counters::add(&ctx.counters.errors, summary.errors);
    if summary.differences > 0 {
        Ok(Outcome::Differences(summary.differences))
    } else {
        Ok(Outcome::from_errors(summary.errors))
    }
}

/// Downloads every volume and checks it against the hash in its manifest, using up to
/// `parallelism` blocking workers.
pub async fn verify_volumes(ctx: &Arc<Ctx>, target: &str) -> Result<Outcome> {
    let repository = Arc::new(block_in_place(|| ctx.repository(target))?);
    let checks = block_in_place(|| repository.volume_checks())?;
    let total = checks.len();
    let parallelism = ctx.config.parallelism().get();
    info!("checking {total} volumes with {parallelism} workers");

    let status_ctx = Arc::clone(ctx);
    let _status = set_status_updater(move || status_ctx.counters.volume_status(total));
    let mut tasks = JoinSet::new();
    for check in checks {
        while tasks.len() >= parallelism {
            if let Some(result) = tasks.join_next().await {
                result?;
            }
        }
        let repository = Arc::clone(&repository);
        let ctx = Arc::clone(ctx);
        tasks.spawn_blocking(move || {
            let result = repository.check_volume(&check);
            Counters::add(&ctx.counters.checked_volumes, 1);
            if let Err(err) = result {
                warn!(name = %check.name, error = format!("{err:#}"), "volume check failed");
                Counters::add(&ctx.counters.failed_volumes, 1);
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result?;
    }

    let failed = Counters::get(&ctx.counters.failed_volumes);
    if failed == 0 {
        info!("All {total} volumes passed the check.");
    }
    Ok(Outcome::from_errors(failed))
}

use {
    crate::{Ctx, Outcome, cli::DATE_TIME_FORMAT},
    anyhow::Result,
    byte_unit::{Byte, UnitType},
    chrono::{DateTime, Local},
    heddle_protocol::DateTimeUtc,
    heddle_sdk::collections::{BackupChain, BackupSet, CollectionStatus},
    prettytable::{Table, format::FormatBuilder, row},
    std::fmt::Display,
    tracing::info,
};

#[inline]
pub fn pretty_time(value: DateTimeUtc) -> impl Display {
    DateTime::<Local>::from(value).format(DATE_TIME_FORMAT)
}

#[inline]
pub fn pretty_size(size: u64) -> impl Display {
    Byte::from_u64(size).get_appropriate_unit(UnitType::Binary)
}

fn new_table() -> Table {
    let mut table = Table::new();
    table.set_format(FormatBuilder::new().column_separator(' ').padding(0, 1).build());
    table
}

fn chain_table(chain: &BackupChain) -> Table {
    let mut table = new_table();
    table.add_row(row!["Type", "Time", "Volumes"]);
    for set in chain.sets() {
        table.add_row(row![
            set.set_type.name(),
            pretty_time(set.time()),
            set.num_volumes()
        ]);
    }
    table
}

fn sets_table(sets: &[BackupSet]) -> Table {
    let mut table = new_table();
    for set in sets {
        table.add_row(row![
            set.set_type.name(),
            pretty_time(set.time()),
            set.file_names().join(" ")
        ]);
    }
    table
}

fn log_chain(title: &str, chain: &BackupChain) {
    info!(
        "{title}: {} to {}, {} sets, {} volumes",
        pretty_time(chain.start_time()),
        pretty_time(chain.end_time()),
        chain.sets().count(),
        chain.num_volumes()
    );
    info!("{}", chain_table(chain));
}

fn report(status: &CollectionStatus) {
    info!("Found {} remote files", status.num_remote_files());
    match status.matched_chain_pair() {
        Some((sig_chain, chain)) => {
            log_chain("Active chain", chain);
            info!(
                "Signatures: {} files, {}",
                sig_chain.files().len(),
                if sig_chain.is_local() { "local" } else { "remote" }
            );
        }
        None => info!("No active backup chain with signatures"),
    }
    for chain in status.other_backup_chains() {
        log_chain("Other chain", chain);
    }
    if !status.orphaned_backup_sets().is_empty() {
        info!(
            "Found {} orphaned backup sets (no full backup before them):",
            status.orphaned_backup_sets().len()
        );
        info!("{}", sets_table(status.orphaned_backup_sets()));
    }
    if !status.incomplete_backup_sets().is_empty() {
        info!(
            "Found {} incomplete backup sets (no manifest):",
            status.incomplete_backup_sets().len()
        );
        info!("{}", sets_table(status.incomplete_backup_sets()));
    }
    let extraneous = status.get_extraneous();
    if !extraneous.local.is_empty() {
        info!("Extraneous local cache files: {}", extraneous.local.join(" "));
    }
    if !extraneous.remote.is_empty() {
        info!(
            "{} remote files belong to no usable chain, see `cleanup`",
            extraneous.remote.len()
        );
    }
}

pub fn collection_status(ctx: &Ctx, target: &str) -> Result<Outcome> {
    let repository = ctx.repository(target)?;
    info!("Collection status of {}", repository.location());
    info!("Archive dir: {}", repository.archive_dir().display());
    report(&repository.collection_status()?);
    Ok(Outcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(pretty_size(1536).to_string(), "1.5 KiB");
    }
}

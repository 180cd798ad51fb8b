use {
    crate::{Ctx, Outcome, info::pretty_time, term::set_status},
    anyhow::{Result, bail},
    fs_err::read_dir,
    heddle_protocol::{DateTimeUtc, Index},
    std::path::Path,
    tracing::info,
};

/// Parses a `--path-prefix` argument. No prefix means the whole backup.
pub fn parse_prefix(prefix: Option<&str>) -> Result<Index> {
    prefix.map_or_else(|| Ok(Index::root()), Index::from_relative_str)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(read_dir(path)?.next().is_none())
}

pub fn restore(
    ctx: &Ctx,
    target: &str,
    output: &Path,
    time: Option<DateTimeUtc>,
    prefix: Option<&str>,
    force: bool,
) -> Result<Outcome> {
    let prefix = parse_prefix(prefix)?;
    if !force && !is_empty_dir(output)? {
        bail!(
            "restore destination {} already exists and is not empty, use --force to restore into it",
            output.display()
        );
    }
    let repository = ctx.repository(target)?;
    let _status = set_status(format!("Restoring into {}", output.display()));
    let summary = repository.restore(output, time, &prefix)?;
    info!(
        "Restore complete: {} entries written, {} errors",
        summary.written, summary.errors
    );
    Ok(Outcome::from_errors(summary.errors))
}

pub fn list_current_files(ctx: &Ctx, target: &str, time: Option<DateTimeUtc>) -> Result<Outcome> {
    let repository = ctx.repository(target)?;
    for entry in repository.list_current_files(time)? {
        let mtime = DateTimeUtc::from_timestamp(entry.stat.mtime, 0).map_or_else(
            || entry.stat.mtime.to_string(),
            |mtime| pretty_time(mtime).to_string(),
        );
        info!("{mtime} {}", entry.index);
    }
    Ok(Outcome::Success)
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(parse_prefix(None).unwrap().is_root());
        assert_eq!(parse_prefix(Some("a/b/")).unwrap().to_relative_string(), "a/b");
        parse_prefix(Some("/abs")).unwrap_err();
    }

    #[test]
    fn empty_destination() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_empty_dir(dir.path()).unwrap());
        assert!(is_empty_dir(&dir.path().join("missing")).unwrap());
        fs_err::write(dir.path().join("file"), b"x").unwrap();
        assert!(!is_empty_dir(dir.path()).unwrap());
        assert!(!is_empty_dir(&dir.path().join("file")).unwrap());
    }
}

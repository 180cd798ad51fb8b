use {
    crate::is_ignored,
    anyhow::{Result, bail},
    fs_err::{read_dir, symlink_metadata},
    std::{fs::Metadata, os::unix::fs::PermissionsExt, path::Path},
};

fn mode(meta: &Metadata) -> u32 {
    meta.permissions().mode() & 0o7777
}

/// Compares a source tree with a restored one. Excluded entries may be missing from
/// either side.
pub fn diff(path1: &Path, path2: &Path) -> Result<()> {
    if is_ignored(path1) {
        return Ok(());
    }
    let meta1 = symlink_metadata(path1)?;
    let meta2 = symlink_metadata(path2)?;
    if meta1.is_dir() != meta2.is_dir() {
        bail!(
            "is_dir mismatch for {} ({}) <-> {} ({})",
            path1.display(),
            meta1.is_dir(),
            path2.display(),
            meta2.is_dir(),
        );
    }
    if meta1.is_dir() {
        let mut names1 = Vec::new();
        for entry in read_dir(path1)? {
            names1.push(entry?.file_name());
        }
        let mut names2 = Vec::new();
        for entry in read_dir(path2)? {
            names2.push(entry?.file_name());
        }
        for name2 in &names2 {
            if !names1.contains(name2) && !is_ignored(&path2.join(name2)) {
                bail!("unexpected {}", path2.join(name2).display());
            }
        }
        for name1 in &names1 {
            if names2.contains(name1) {
                diff(&path1.join(name1), &path2.join(name1))?;
            } else if !is_ignored(&path1.join(name1)) {
                bail!("missing {}", path2.join(name1).display());
            }
        }
    } else {
        let content1 = fs_err::read(path1)?;
        let content2 = fs_err::read(path2)?;
        if content1 != content2 {
            bail!(
                "content mismatch for {} <-> {}",
                path1.display(),
                path2.display()
            );
        }
        if mode(&meta1) != mode(&meta2) {
            bail!(
                "mode mismatch for {} ({:#o}) <-> {} ({:#o})",
                path1.display(),
                mode(&meta1),
                path2.display(),
                mode(&meta2),
            );
        }
    }
    Ok(())
}

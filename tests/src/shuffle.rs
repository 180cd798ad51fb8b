use {
    anyhow::{Context as _, Result},
    fs_err::{
        create_dir, read_dir, remove_dir_all, remove_file, rename, set_permissions,
        symlink_metadata, write,
    },
    rand::{
        Rng,
        distr::{Alphanumeric, Distribution, SampleString, weighted::WeightedIndex},
        seq::{IndexedMutRandom, IndexedRandom},
    },
    std::{
        fs::Permissions,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        thread::sleep,
        time::Duration,
    },
    tracing::debug,
};

fn find_paths_inner(
    dir: &Path,
    allow_files: bool,
    allow_dirs: bool,
    allow_root: bool,
    output: &mut Vec<PathBuf>,
) -> Result<()> {
    if allow_dirs && allow_root {
        output.push(dir.into());
    }
    for entry in read_dir(dir)? {
        let entry = entry?.path();
        if symlink_metadata(&entry)?.is_file() {
            if allow_files {
                output.push(entry);
            }
        } else {
            find_paths_inner(&entry, allow_files, allow_dirs, true, output)?;
        }
    }
    Ok(())
}

fn random_name() -> String {
    let mut rng = rand::rng();
    if rng.random_bool(0.05) {
        "target".into()
    } else if rng.random_bool(0.05) {
        format!("build_{}", rng.random_range(0..1000))
    } else {
        let len = rng.random_range(1..=10);
        Alphanumeric.sample_string(&mut rng, len)
    }
}

/// Up to 300 KB, so larger files span several delta blocks.
fn random_content() -> Vec<u8> {
    let mut rng = rand::rng();
    let len = if rng.random_bool(0.1) {
        rng.random_range(0..=300_000)
    } else {
        rng.random_range(0..=30_000)
    };
    let mut content = vec![0; len];
    rng.fill(content.as_mut_slice());
    content
}

pub fn choose_path(
    dir: &Path,
    allow_files: bool,
    allow_dirs: bool,
    allow_root: bool,
) -> Result<Option<PathBuf>> {
    let mut paths = Vec::new();
    find_paths_inner(dir, allow_files, allow_dirs, allow_root, &mut paths)?;
    Ok(paths.choose(&mut rand::rng()).cloned())
}

fn create(dir: &Path) -> Result<()> {
    let parent = choose_path(dir, false, true, true)?.context("no directory")?;
    let path = parent.join(random_name());
    if path.exists() {
        return Ok(());
    }
    if rand::rng().random_bool(0.1) {
        create_dir(&path)?;
        debug!("created dir {}", path.display());
    } else {
        write(&path, random_content())?;
        debug!("created file {}", path.display());
    }
    Ok(())
}

fn file_to_dir(dir: &Path) -> Result<()> {
    let Some(path) = choose_path(dir, true, false, false)? else {
        return Ok(());
    };
    remove_file(&path)?;
    create_dir(&path)?;
    debug!("replaced file with dir {}", path.display());
    Ok(())
}

fn dir_to_file(dir: &Path) -> Result<()> {
    let Some(path) = choose_path(dir, false, true, false)? else {
        return Ok(());
    };
    remove_dir_all(&path)?;
    write(&path, random_content())?;
    debug!("replaced dir with file {}", path.display());
    Ok(())
}

fn random_rename(dir: &Path) -> Result<()> {
    let Some(from) = choose_path(dir, true, true, false)? else {
        return Ok(());
    };
    let to = if rand::rng().random_bool(0.2) {
        choose_path(dir, false, true, true)?
            .context("no directory")?
            .join(random_name())
    } else {
        from.parent().context("no parent")?.join(random_name())
    };
    if !to.exists() && !to.starts_with(&from) {
        rename(&from, &to)?;
        debug!("renamed {} -> {}", from.display(), to.display());
    }
    Ok(())
}

fn edit(dir: &Path) -> Result<()> {
    let Some(path) = choose_path(dir, true, false, false)? else {
        return Ok(());
    };
    if symlink_metadata(&path)?.modified()?.elapsed()? < Duration::from_millis(50) {
        sleep(Duration::from_millis(50));
    }
    if rand::rng().random_bool(0.5) {
        // Small change in place, so the delta reuses most blocks.
        let mut content = fs_err::read(&path)?;
        if let Some(byte) = content.choose_mut(&mut rand::rng()) {
            *byte = byte.wrapping_add(1);
        } else {
            content.push(0);
        }
        content.extend_from_slice(b"appended");
        write(&path, content)?;
    } else {
        write(&path, random_content())?;
    }
    debug!("edited file {}", path.display());
    Ok(())
}

fn change_mode(dir: &Path) -> Result<()> {
    let Some(path) = choose_path(dir, true, false, false)? else {
        return Ok(());
    };
    let mode = [0o777, 0o774, 0o744, 0o700, 0o666, 0o664, 0o644, 0o600]
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(0o644);
    set_permissions(&path, Permissions::from_mode(mode))?;
    debug!("changed mode of file {} to {mode:#o}", path.display());
    Ok(())
}

fn delete(dir: &Path) -> Result<()> {
    if rand::rng().random_bool(0.1) {
        let Some(path) = choose_path(dir, false, true, false)? else {
            return Ok(());
        };
        remove_dir_all(&path)?;
        debug!("removed dir {}", path.display());
    } else {
        let Some(path) = choose_path(dir, true, false, false)? else {
            return Ok(());
        };
        remove_file(&path)?;
        debug!("removed file {}", path.display());
    }
    Ok(())
}

type Shuffler = fn(dir: &Path) -> Result<()>;

/// Applies a random number of random mutations to the tree under `dir`.
pub fn shuffle(dir: &Path) -> Result<()> {
    let num_mutations = rand::rng().random_range(1..=30);
    let shufflers: &[(Shuffler, u32)] = &[
        (create, 10),
        (random_rename, 5),
        (edit, 20),
        (delete, 10),
        (change_mode, 3),
        (file_to_dir, 3),
        (dir_to_file, 3),
    ];
    let distribution = WeightedIndex::new(shufflers.iter().map(|(_, weight)| weight))?;
    for _ in 0..num_mutations {
        let (shuffler, _) = shufflers[distribution.sample(&mut rand::rng())];
        shuffler(dir)?;
    }
    Ok(())
}


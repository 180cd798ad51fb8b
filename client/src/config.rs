use {
    anyhow::{Context as _, Result, ensure},
    byte_unit::Byte,
    derivative::Derivative,
    heddle_protocol::credentials::EncryptionKey,
    heddle_sdk::{
        repository::RepositoryOptions,
        retry::RetryPolicy,
        rules::Rules,
    },
    serde::{Deserialize, Serialize},
    std::{
        io,
        num::NonZeroUsize,
        path::{Path, PathBuf},
        thread,
        time::Duration,
    },
};

/// Settings loaded once at startup. Never modified afterwards.
#[derive(Derivative, Clone, Serialize, Deserialize)]
#[derivative(Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub volume_size: Byte,
    pub compact_names: bool,
    pub compression: bool,
    pub encrypt: bool,
    #[derivative(Debug = "ignore")]
    pub encryption_key: Option<EncryptionKey>,
    pub use_keyring: bool,
    pub archive_dir: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub full_if_older_than: Option<Duration>,
    pub allow_source_mismatch: bool,
    pub num_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub exclude: Rules,
    pub max_cache_size: Byte,
    pub parallelism: Option<NonZeroUsize>,
    pub log_file: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            volume_size: Byte::from_u64(25_000_000),
            compact_names: false,
            compression: true,
            encrypt: true,
            encryption_key: None,
            use_keyring: false,
            archive_dir: None,
            full_if_older_than: None,
            allow_source_mismatch: false,
            num_retries: 5,
            retry_delay: Duration::from_secs(10),
            exclude: Rules::default(),
            max_cache_size: Byte::from_u64(200_000_000),
            parallelism: None,
            log_file: None,
            log_filter: "info".into(),
        }
    }
}

impl Config {
    /// Reads the config file. A missing file at the default location means defaults.
    #[inline]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_owned(), true),
            None => (default_config_path()?, false),
        };
        let text = match fs_err::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if !explicit && err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !(self.use_keyring && self.encryption_key.is_some()),
            "invalid config: if `use_keyring` is true, `encryption_key` cannot be specified"
        );
        ensure!(
            self.volume_size.as_u64() >= 1024,
            "invalid config: `volume_size` must be at least 1 KiB"
        );
        Ok(())
    }

    #[inline]
    pub fn archive_dir(&self) -> Result<PathBuf> {
        match &self.archive_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::cache_dir()
                .context("cannot find cache dir")?
                .join("heddle")),
        }
    }

    #[must_use]
    #[inline]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            num_retries: self.num_retries,
            base_delay: self.retry_delay,
        }
    }

    #[inline]
    pub fn repository_options(&self) -> Result<RepositoryOptions> {
        Ok(RepositoryOptions {
            volume_size: self.volume_size.as_u64(),
            compact_names: self.compact_names,
            compression: self.compression,
            allow_source_mismatch: self.allow_source_mismatch,
            archive_dir: self.archive_dir()?,
        })
    }

    #[must_use]
    #[inline]
    pub fn parallelism(&self) -> NonZeroUsize {
        self.parallelism
            .or_else(|| thread::available_parallelism().ok())
            .unwrap_or(NonZeroUsize::MIN)
    }
}

#[inline]
pub fn default_config_path() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("cannot find config dir")?
        .join("heddle.json5"))
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use {super::*, heddle_protocol::Index};

    #[test]
    fn defaults_for_missing_fields() {
        let config: Config = json5::from_str("{}").unwrap();
        assert_eq!(config.volume_size.as_u64(), 25_000_000);
        assert!(config.encrypt);
        assert!(config.compression);
        assert_eq!(config.num_retries, 5);
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.full_if_older_than, None);
    }

    #[test]
    fn parse_full() {
        let config: Config = json5::from_str(
            r#"{
                volume_size: "10 MB",
                compact_names: true,
                encrypt: false,
                full_if_older_than: "30days",
                retry_delay: "1s",
                exclude: [{ name_equals: "target" }, { path_matches: "^tmp/" }],
                max_cache_size: "1 GB",
                parallelism: 3,
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.volume_size.as_u64(), 10_000_000);
        assert_eq!(
            config.full_if_older_than,
            Some(Duration::from_secs(30 * 86_400))
        );
        assert_eq!(config.retry_policy().base_delay, Duration::from_secs(1));
        assert!(config.exclude.excludes(&Index::from_relative_str("a/target").unwrap()));
        assert!(config.exclude.excludes(&Index::from_relative_str("tmp/x").unwrap()));
        assert_eq!(config.parallelism().get(), 3);
    }

    #[test]
    fn rejects_unknown_fields_and_conflicts() {
        json5::from_str::<Config>("{ volume: 1 }").unwrap_err();
        let key = EncryptionKey::generate().unwrap();
        let config = Config {
            use_keyring: true,
            encryption_key: Some(key),
            ..Config::default()
        };
        config.validate().unwrap_err();
    }

    #[test]
    fn missing_default_file() {
        let dir = tempfile::tempdir().unwrap();
        Config::load(Some(&dir.path().join("missing.json5"))).unwrap_err();
        let path = dir.path().join("heddle.json5");
        fs_err::write(&path, "{ compression: false }").unwrap();
        assert!(!Config::load(Some(&path)).unwrap().compression);
    }
}

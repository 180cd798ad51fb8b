use {
    std::sync::atomic::{AtomicU64, Ordering},
    tracing::info,
};

/// Progress of work shared between parallel workers.
#[derive(Debug, Default)]
pub struct Counters {
    pub checked_volumes: AtomicU64,
    pub failed_volumes: AtomicU64,
    pub errors: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    #[must_use]
    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Status line text for a run over `total` volumes.
    #[must_use]
    #[inline]
    pub fn volume_status(&self, total: usize) -> String {
        format!(
            "checked {} of {total} volumes, {} failed",
            Self::get(&self.checked_volumes),
            Self::get(&self.failed_volumes)
        )
    }

    #[inline]
    pub fn report(&self) {
        let checked_volumes = Self::get(&self.checked_volumes);
        let failed_volumes = Self::get(&self.failed_volumes);
        let errors = Self::get(&self.errors);
        if checked_volumes > 0 {
            info!("checked {checked_volumes} volumes");
        }
        if failed_volumes > 0 {
            info!("{failed_volumes} volumes failed the check");
        }
        if errors > 0 {
            info!("{errors} errors");
        }
    }
}

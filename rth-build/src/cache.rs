//! Artifact cache interface and the size-factor admission policy.

use std::path::PathBuf;

use tracing::{debug, info};
use walkdir::WalkDir;

use rth_common::types::BuildTarget;

/// The operations an artifact cache supports. Implementations live in the
/// host build tool; this crate only layers policy on top of them.
pub trait Cache {
    /// Stores the target's outputs against the given cache key.
    fn store(&self, target: &BuildTarget, key: &[u8]);
    /// Stores one additional file against the given cache key.
    fn store_extra(&self, target: &BuildTarget, key: &[u8], file: &str);
    /// Retrieves the target's outputs; true if they were found.
    fn retrieve(&self, target: &BuildTarget, key: &[u8]) -> bool;
    /// Retrieves one additional file; true if it was found.
    fn retrieve_extra(&self, target: &BuildTarget, key: &[u8], file: &str) -> bool;
    /// Removes any cached artifacts for the target.
    fn clean(&self, target: &BuildTarget);
    /// Flushes and shuts the cache down.
    fn shutdown(&self);
}

/// Wraps a real cache, refusing to store artifacts that are large relative
/// to how quickly they rebuild.
///
/// The size factor is total output bytes divided by build seconds (floored
/// at one second); targets at or above the limit skip the cache entirely.
/// Retrieval is unaffected.
pub struct SizeFactorLimit<C> {
    real_cache: C,
    limit: u64,
    repo_root: PathBuf,
}

impl<C: Cache> SizeFactorLimit<C> {
    pub fn new(real_cache: C, limit: u64, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            real_cache,
            limit,
            repo_root: repo_root.into(),
        }
    }

    fn size_factor(&self, target: &BuildTarget) -> u64 {
        // Floor the duration at one second so near-instant rebuilds don't
        // divide by zero.
        let duration = target.build_duration.as_secs().max(1);
        let out_dir = target.out_dir(&self.repo_root);
        let mut size = 0u64;
        for out in target.outputs() {
            for entry in WalkDir::new(out_dir.join(out)).into_iter().flatten() {
                if let Ok(metadata) = entry.metadata() {
                    size += metadata.len();
                }
            }
        }
        size / duration
    }

    fn should_store(&self, target: &BuildTarget) -> bool {
        let factor = self.size_factor(target);
        if factor < self.limit {
            debug!(
                "Will store {} in cache, size factor {} under limit",
                target.label, factor
            );
            true
        } else {
            info!(
                "Not storing {} in cache, size factor {} exceeds limit",
                target.label, factor
            );
            false
        }
    }
}

impl<C: Cache> Cache for SizeFactorLimit<C> {
    fn store(&self, target: &BuildTarget, key: &[u8]) {
        if self.should_store(target) {
            self.real_cache.store(target, key);
        }
    }

    fn store_extra(&self, target: &BuildTarget, key: &[u8], file: &str) {
        if self.should_store(target) {
            self.real_cache.store_extra(target, key, file);
        }
    }

    fn retrieve(&self, target: &BuildTarget, key: &[u8]) -> bool {
        self.real_cache.retrieve(target, key)
    }

    fn retrieve_extra(&self, target: &BuildTarget, key: &[u8], file: &str) -> bool {
        self.real_cache.retrieve_extra(target, key, file)
    }

    fn clean(&self, target: &BuildTarget) {
        self.real_cache.clean(target)
    }

    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    use rth_common::types::BuildLabel;

    #[derive(Default)]
    struct RecordingCache {
        stores: AtomicUsize,
        retrieves: AtomicUsize,
    }

    impl Cache for &RecordingCache {
        fn store(&self, _target: &BuildTarget, _key: &[u8]) {
            self.stores.fetch_add(1, Ordering::SeqCst);
        }
        fn store_extra(&self, _target: &BuildTarget, _key: &[u8], _file: &str) {
            self.stores.fetch_add(1, Ordering::SeqCst);
        }
        fn retrieve(&self, _target: &BuildTarget, _key: &[u8]) -> bool {
            self.retrieves.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn retrieve_extra(&self, _target: &BuildTarget, _key: &[u8], _file: &str) -> bool {
            self.retrieves.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn clean(&self, _target: &BuildTarget) {}
        fn shutdown(&self) {}
    }

    fn target_with_output(root: &TempDir, bytes: usize, secs: u64) -> BuildTarget {
        let mut target = BuildTarget::new(BuildLabel::new("pkg", "t"));
        target.add_output("blob.bin");
        target.build_duration = Duration::from_secs(secs);
        let out_dir = target.out_dir(root.path());
        fs::create_dir_all(&out_dir).unwrap();
        fs::write(out_dir.join("blob.bin"), vec![0u8; bytes]).unwrap();
        target
    }

    #[test]
    fn test_stores_small_artifacts() {
        let root = TempDir::new().unwrap();
        // 100 bytes over 10 seconds: factor 10, limit 100.
        let target = target_with_output(&root, 100, 10);
        let real = RecordingCache::default();
        let cache = SizeFactorLimit::new(&real, 100, root.path());
        cache.store(&target, b"key");
        cache.store_extra(&target, b"key", "extra.txt");
        assert_eq!(real.stores.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refuses_expensive_artifacts() {
        let root = TempDir::new().unwrap();
        // 10000 bytes in 1 second: factor 10000, limit 100.
        let target = target_with_output(&root, 10000, 1);
        let real = RecordingCache::default();
        let cache = SizeFactorLimit::new(&real, 100, root.path());
        cache.store(&target, b"key");
        assert_eq!(real.stores.load(Ordering::SeqCst), 0);
        // Retrieval still goes through.
        assert!(cache.retrieve(&target, b"key"));
        assert_eq!(real.retrieves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_duration_floors_to_one_second() {
        let root = TempDir::new().unwrap();
        let target = target_with_output(&root, 50, 0);
        let real = RecordingCache::default();
        let cache = SizeFactorLimit::new(&real, 100, root.path());
        // 50 / max(0, 1) = 50, under the limit.
        cache.store(&target, b"key");
        assert_eq!(real.stores.load(Ordering::SeqCst), 1);
    }
}

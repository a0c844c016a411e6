//! Memoised hashing of arbitrary paths for build incrementality.
//!
//! Builds are frequently bound by hashing, so digests are memoized per
//! repo-relative path. The memo is *almost* transparent: rebuilding a target
//! overwrites files in place, which is why callers can force recalculation
//! and why [`PathHasher::move_path_hash`] exists for the one legitimate case
//! of a hashed file relocating (tmp dir to out dir).

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use rth_common::types::{BuildTarget, TMP_DIR};

/// Marker byte mixed into the running hash wherever a symlink is found, so
/// that linked content hashes differently from the same bytes inlined. Part
/// of the on-disk hash schema; changing it invalidates every stored hash.
const LINK_MARKER: &[u8] = &[1];

#[derive(Debug, Error)]
pub enum HashError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error("output {path} links outside the build dir (to {target})")]
    LinkOutsideBuildDir { path: PathBuf, target: PathBuf },
}

/// Streaming digest over either hash algorithm a target can declare.
enum ContentHasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl ContentHasher {
    fn new(use_sha1: bool) -> Self {
        if use_sha1 {
            Self::Sha1(Sha1::new())
        } else {
            Self::Sha256(Sha256::new())
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

impl Write for ContentHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Concurrent, memoising hasher of files, directories and symlinks.
pub struct PathHasher {
    repo_root: PathBuf,
    memo: RwLock<HashMap<String, Vec<u8>>>,
}

impl PathHasher {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            memo: RwLock::new(HashMap::new()),
        }
    }

    /// Calculates the hash of a single path, which might be a file, a
    /// directory or a symlink.
    ///
    /// Unless `recalc` is true a previously memoized digest is returned
    /// verbatim. With `use_sha1` the digest is SHA-1, otherwise SHA-256;
    /// callers must not mix the two for the same path.
    pub fn path_hash(
        &self,
        path: &Path,
        recalc: bool,
        use_sha1: bool,
    ) -> Result<Vec<u8>, HashError> {
        let key = self.ensure_relative(path);
        if !recalc {
            let memo = self.memo.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = memo.get(&key) {
                return Ok(cached.clone());
            }
        }
        let result = self.compute(path, use_sha1)?;
        self.memo
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, result.clone());
        Ok(result)
    }

    /// As [`Self::path_hash`], picking the hash algorithm from the target's
    /// declared hashes.
    pub fn target_path_hash(
        &self,
        path: &Path,
        target: &BuildTarget,
    ) -> Result<Vec<u8>, HashError> {
        self.path_hash(path, false, Self::needs_sha1_hash(target))
    }

    /// As [`Self::path_hash`], but panics if the hash cannot be calculated.
    /// Only for paths the surrounding build has already guaranteed to exist.
    pub fn must_path_hash(&self, path: &Path, use_sha1: bool) -> Vec<u8> {
        match self.path_hash(path, false, use_sha1) {
            Ok(hash) => hash,
            Err(e) => panic!("failed to hash {}: {}", path.display(), e),
        }
    }

    /// As [`Self::target_path_hash`], but panics if the hash cannot be
    /// calculated.
    pub fn must_target_path_hash(&self, path: &Path, target: &BuildTarget) -> Vec<u8> {
        self.must_path_hash(path, Self::needs_sha1_hash(target))
    }

    /// Records that a hashed file moved from `old_path` to `new_path`, the
    /// only case in which the digest of a path legitimately changes.
    ///
    /// The memo entry is copied to the new key. When `keep_old` is false and
    /// the old path lies under the temporary build dir it will never be read
    /// again, so the old entry is evicted.
    pub fn move_path_hash(&self, old_path: &Path, new_path: &Path, keep_old: bool) {
        let old_key = self.ensure_relative(old_path);
        let new_key = self.ensure_relative(new_path);
        let mut memo = self.memo.write().unwrap_or_else(|e| e.into_inner());
        if let Some(hash) = memo.get(&old_key).cloned() {
            memo.insert(new_key, hash);
        }
        if !keep_old && old_key.starts_with(TMP_DIR) {
            memo.remove(&old_key);
        }
    }

    /// True for a target declaring any SHA-1 hash assertion.
    ///
    /// SHA-1 digests are 40 hex characters, SHA-256 are 64; a bare 40-char
    /// value therefore implies SHA-1. Mixing the two on one target is
    /// unsupported.
    pub fn needs_sha1_hash(target: &BuildTarget) -> bool {
        target.hashes.iter().any(|h| {
            h.starts_with("sha1:")
                || (canonical_hash(h).len() == 40 && !h.starts_with("sha256:"))
        })
    }

    /// Computes a fresh digest for one path, bypassing the memo.
    fn compute(&self, path: &Path, use_sha1: bool) -> Result<Vec<u8>, HashError> {
        let mut h = ContentHasher::new(use_sha1);
        let info = fs::symlink_metadata(path)?;
        if info.file_type().is_symlink() {
            // Mark the link itself, then hash whatever it resolves to, so a
            // link and an inlined copy of its target stay distinguishable.
            let deref = fs::canonicalize(path)?;
            h.update(LINK_MARKER);
            let target_hash = self.compute(&deref, use_sha1)?;
            h.update(&target_hash);
            return Ok(h.finalize());
        }
        if info.is_dir() {
            let root = fs::canonicalize(path)?;
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_symlink() {
                    let deref = fs::canonicalize(entry.path())?;
                    if !deref.starts_with(&root) {
                        return Err(HashError::LinkOutsideBuildDir {
                            path: entry.path().to_path_buf(),
                            target: deref,
                        });
                    }
                    // The linked content is inside the tree and will be
                    // hashed as a real file; following the link here could
                    // introduce a cycle. Still mark that a link exists.
                    h.update(LINK_MARKER);
                } else if entry.file_type().is_file() {
                    file_hash(&mut h, entry.path())?;
                }
            }
        } else {
            file_hash(&mut h, path)?;
        }
        Ok(h.finalize())
    }

    /// Normalises a path to be relative to the repo root, so absolute and
    /// relative forms of the same file share one memo entry.
    fn ensure_relative(&self, path: &Path) -> String {
        let path = path.to_string_lossy();
        let root = self.repo_root.to_string_lossy();
        match path.strip_prefix(root.as_ref()) {
            Some(rest) => rest.trim_start_matches('/').to_string(),
            None => path.into_owned(),
        }
    }
}

/// Streams one file's bytes into the running hash.
fn file_hash(h: &mut ContentHasher, path: &Path) -> io::Result<()> {
    let mut file = fs::File::open(path)?;
    io::copy(&mut file, h)?;
    Ok(())
}

/// Strips any algorithm prefix and surrounding whitespace from a declared
/// hash value.
fn canonical_hash(hash: &str) -> &str {
    let hash = hash.strip_prefix("sha1:").unwrap_or(hash);
    let hash = hash.strip_prefix("sha256:").unwrap_or(hash);
    hash.trim()
}

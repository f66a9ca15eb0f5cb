//! Per-root instance lock.
//!
//! Two mirror processes sharing one manifest would race each other's
//! compare-and-set claims and cursor writes, so an advisory file lock keyed
//! by sync root is held for the lifetime of a run.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs4::FileExt;

pub struct InstanceLock {
    // Held open so the advisory lock lives as long as the run.
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock for `root` under `state_dir`, failing fast if another
    /// cloudmirror process already holds it.
    pub fn acquire(state_dir: &Path, root: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(state_dir).with_context(|| {
            format!("Failed to create state directory {}", state_dir.display())
        })?;
        let path = state_dir.join(format!("{}.lock", crate::config::sanitize_root(root)));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create lock file {}", path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another cloudmirror instance is already syncing root '{}' (lock: {})",
                root,
                path.display()
            )
        })?;
        Ok(Self { _file: file, path })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

//! Periodic store maintenance.
//!
//! Two date-driven chores, both tracked in the configuration record:
//! defragmentation rewrites the backing files (and must be re-scheduled
//! after an own identity is deleted, so residual data is overwritten), and
//! score verification re-derives the whole score table from identities and
//! trusts. Defragmentation runs offline, before any subsystem opens the
//! store.

use std::path::{Path, PathBuf};

use tracing::info;

use weft_core::config::Configuration;
use weft_core::constants::{DEFAULT_DEFRAG_INTERVAL_SECS, DEFAULT_VERIFY_SCORES_INTERVAL_SECS};
use weft_core::error::WotError;
use weft_core::types::Timestamp;

/// Whether the defragmentation interval has elapsed (or never ran).
pub fn defrag_due(config: &Configuration, now: Timestamp) -> bool {
    match config.last_defrag {
        Some(last) => now - last >= DEFAULT_DEFRAG_INTERVAL_SECS,
        None => true,
    }
}

/// Whether the stored-score verification interval has elapsed.
pub fn verify_scores_due(config: &Configuration, now: Timestamp) -> bool {
    match config.last_score_verification {
        Some(last) => now - last >= DEFAULT_VERIFY_SCORES_INTERVAL_SECS,
        None => true,
    }
}

/// Rewrite the store into fresh backing files and swap them into place.
///
/// Must be called while the store is closed. Copies every tree into a
/// sibling directory, then renames it over the original, so a crash leaves
/// either the old or the new files intact, never a mix.
pub fn defragment<P: AsRef<Path>>(path: P) -> Result<(), WotError> {
    let path = path.as_ref();
    let tmp: PathBuf = sibling(path, ".defrag");
    let old: PathBuf = sibling(path, ".predefrag");
    let _ = std::fs::remove_dir_all(&tmp);
    let _ = std::fs::remove_dir_all(&old);

    {
        let src = sled::open(path).map_err(|e| WotError::Storage(e.to_string()))?;
        let dst = sled::open(&tmp).map_err(|e| WotError::Storage(e.to_string()))?;

        for name in src.tree_names() {
            if name.starts_with(b"__sled__") {
                continue;
            }
            let src_tree = src.open_tree(&name).map_err(|e| WotError::Storage(e.to_string()))?;
            let dst_tree = dst.open_tree(&name).map_err(|e| WotError::Storage(e.to_string()))?;
            for item in src_tree.iter() {
                let (k, v) = item.map_err(|e| WotError::Storage(e.to_string()))?;
                dst_tree
                    .insert(k, v)
                    .map_err(|e| WotError::Storage(e.to_string()))?;
            }
        }
        dst.flush().map_err(|e| WotError::Storage(e.to_string()))?;
        // Both handles drop here, releasing the directory locks.
    }

    std::fs::rename(path, &old).map_err(|e| WotError::Storage(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| WotError::Storage(e.to_string()))?;
    std::fs::remove_dir_all(&old).map_err(|e| WotError::Storage(e.to_string()))?;

    info!(path = %path.display(), "store defragmented");
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "weft-db".to_string());
    name.push_str(suffix);
    path.with_file_name(name)
}

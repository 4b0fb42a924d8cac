//! Central path resolution for Gangway data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `GANGWAY_DATA_DIR` env
//! > `~/.gangway`. Callsites use these helpers instead of constructing
//! paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `GANGWAY_DATA_DIR` env > `~/.gangway` default.
/// Panics if no valid path can be resolved.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("GANGWAY_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .expect("HOME directory not found")
            .join(".gangway")
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Falls back to `~/.gangway` when
/// `init_data_dir` has not run (tests, ad hoc tooling).
pub fn data_dir() -> PathBuf {
    if let Some(dir) = DATA_DIR.read().expect("DATA_DIR lock poisoned").clone() {
        return dir;
    }
    dirs::home_dir()
        .map(|h| h.join(".gangway"))
        .unwrap_or_else(|| PathBuf::from("/tmp/.gangway"))
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

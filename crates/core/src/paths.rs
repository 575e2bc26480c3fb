// crates/core/src/paths.rs
//! Centralized path functions for the on-disk data layout.
//!
//! Single source of truth — eliminates ad-hoc `data_dir.join(...)` scattered
//! across crates. The layout:
//!
//! ```text
//! <data>/
//!   angel.db                  <- catalog
//!   sessions/
//!     <mainSessionID>.db      <- one per main session
//!   sandbox/<sessionID>/...   <- per-session workspace for shell tools
//! ```

use std::path::{Path, PathBuf};

/// App data root: `~/.local/share/angel/` (Linux) or the platform equivalent.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("angel"))
}

/// Catalog database file: `<data>/angel.db`.
pub fn catalog_path(data_dir: &Path) -> PathBuf {
    data_dir.join("angel.db")
}

/// Directory holding one SQLite file per main session: `<data>/sessions/`.
pub fn sessions_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("sessions")
}

/// The SQLite file for one main session: `<data>/sessions/<id>.db`.
pub fn session_db_path(data_dir: &Path, main_session_id: &str) -> PathBuf {
    sessions_dir(data_dir).join(format!("{main_session_id}.db"))
}

/// Sandbox root: `<data>/sandbox/`.
pub fn sandbox_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("sandbox")
}

/// Per-session sandbox directory: `<data>/sandbox/<id>/`.
pub fn session_sandbox_dir(data_dir: &Path, session_id: &str) -> PathBuf {
    sandbox_dir(data_dir).join(session_id)
}

/// Extract the main session id from a session DB filename, if it is one.
pub fn main_id_from_db_path(path: &Path) -> Option<String> {
    if path.extension().map(|e| e != "db").unwrap_or(true) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let data = Path::new("/data");
        assert_eq!(catalog_path(data), Path::new("/data/angel.db"));
        assert_eq!(
            session_db_path(data, "AbCdEfGh"),
            Path::new("/data/sessions/AbCdEfGh.db")
        );
        assert_eq!(
            session_sandbox_dir(data, "AbCdEfGh.sub"),
            Path::new("/data/sandbox/AbCdEfGh.sub")
        );
    }

    #[test]
    fn test_main_id_from_db_path() {
        assert_eq!(
            main_id_from_db_path(Path::new("/data/sessions/AbCdEfGh.db")),
            Some("AbCdEfGh".to_string())
        );
        // Temporary sessions keep their dot prefix in the filename.
        assert_eq!(
            main_id_from_db_path(Path::new("/data/sessions/.tmpAbCd.db")),
            Some(".tmpAbCd".to_string())
        );
        assert_eq!(main_id_from_db_path(Path::new("/data/sessions/notes.txt")), None);
        assert_eq!(main_id_from_db_path(Path::new("/data/sessions/")), None);
    }

    #[test]
    fn test_default_data_dir() {
        let dir = default_data_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().to_string_lossy().contains("angel"));
    }
}

//! Path resolution for codexcord data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `CODEXCORD_DATA_DIR` env
//! > `~/.codexcord`, then passed around explicitly.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `explicit` wins; otherwise `~/.codexcord`. Clap already folded the env var
    /// into `explicit`.
    pub fn resolve(explicit: Option<&Path>) -> io::Result<Self> {
        if let Some(path) = explicit {
            return Ok(Self::new(path));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "HOME directory not found")
        })?;
        Ok(Self::new(home.join(".codexcord")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("codexcord.db")
    }

    /// Sidecar lock beside the database
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("codexcord.lock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

/// Default Codex sessions root: `$CODEX_HOME/sessions`, else `~/.codex/sessions`.
pub fn default_sessions_dir() -> Option<PathBuf> {
    if let Ok(codex_home) = std::env::var("CODEX_HOME") {
        if !codex_home.trim().is_empty() {
            return Some(PathBuf::from(codex_home).join("sessions"));
        }
    }
    dirs::home_dir().map(|home| home.join(".codex").join("sessions"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_live_under_the_root() {
        let paths = DataPaths::new("/var/lib/codexcord");
        assert_eq!(paths.db_path(), PathBuf::from("/var/lib/codexcord/codexcord.db"));
        assert_eq!(
            paths.lock_path(),
            PathBuf::from("/var/lib/codexcord/codexcord.lock")
        );
        assert_eq!(paths.log_dir(), PathBuf::from("/var/lib/codexcord/logs"));
    }

    #[test]
    fn ensure_dirs_creates_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DataPaths::new(dir.path().join("data"));
        paths.ensure_dirs().expect("ensure dirs");
        assert!(paths.log_dir().is_dir());
    }
}

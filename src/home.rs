//! Shuttle home directory layout.
//!
//! Persistent state lives under `$SHUTTLE_HOME` (default `~/.shuttle`):
//! `logs/` for the file log mode, `RespFiles/` for mock response bodies,
//! `dump/<record-id>/` for traffic captures.

use std::path::{Path, PathBuf};

use anyhow::Context;

pub const RESP_FILES_DIR: &str = "RespFiles";
pub const DUMP_DIR: &str = "dump";

#[derive(Debug, Clone)]
pub struct HomePaths {
    pub home: PathBuf,
    pub log_dir: PathBuf,
    pub resp_files: PathBuf,
    pub dump_dir: PathBuf,
}

impl HomePaths {
    pub fn resolve(log_dir_flag: &Path) -> anyhow::Result<HomePaths> {
        let home = match std::env::var_os("SHUTTLE_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => directories::BaseDirs::new()
                .context("cannot determine the user home directory")?
                .home_dir()
                .join(".shuttle"),
        };

        let log_dir = if log_dir_flag.is_absolute() {
            log_dir_flag.to_path_buf()
        } else {
            home.join(log_dir_flag)
        };

        let paths = HomePaths {
            resp_files: home.join(RESP_FILES_DIR),
            dump_dir: home.join(DUMP_DIR),
            log_dir,
            home,
        };

        for dir in [
            &paths.home,
            &paths.log_dir,
            &paths.resp_files,
            &paths.dump_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        Ok(paths)
    }

    /// Resolve a configured file name: absolute paths and files present in
    /// the working directory win; everything else lands in the home dir.
    pub fn resolve_file(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() || path.exists() {
            path.to_path_buf()
        } else {
            self.home.join(name)
        }
    }
}

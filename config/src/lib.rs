//! Load configuration from XDG `config.toml` and project `.env`, then apply to the
//! process environment with priority: **existing env > .env > XDG**.
//!
//! Also resolves the daemon's data directory (`daemon.pid`, `daemon.sock`,
//! `hearth.db` live there): `HEARTH_DATA_DIR` when set, else the platform data
//! dir plus `hearth`.

mod env_file;
mod xdg;

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    EnvFileRead(std::io::Error),
    #[error("no data directory available (set HEARTH_DATA_DIR)")]
    NoDataDir,
}

/// Loads config from XDG `config.toml` and optional project `.env`, then sets
/// environment variables only for keys that are **not** already set, so existing
/// env has highest priority.
///
/// Order of precedence when a key is missing in the process environment:
/// 1. Value from project `.env` (current directory or `override_dir` if given)
/// 2. Value from `$XDG_CONFIG_HOME/hearth/config.toml` `[env]` table
pub fn load_and_apply(override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_pairs = xdg::load_env_pairs("hearth")?;
    let file_pairs = env_file::load_env_pairs(override_dir).map_err(LoadError::EnvFileRead)?;

    // XDG first, then .env over it; existing process env always wins.
    for (key, value) in xdg_pairs.into_iter().chain(file_pairs) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(&key, value);
        }
    }
    Ok(())
}

/// The daemon's data directory: `HEARTH_DATA_DIR` override, else the platform
/// data dir (`~/.local/share` on Linux) plus `hearth`. Created if missing.
pub fn data_dir() -> Result<PathBuf, LoadError> {
    let dir = match std::env::var_os("HEARTH_DATA_DIR") {
        Some(d) => PathBuf::from(d),
        None => dirs::data_dir().ok_or(LoadError::NoDataDir)?.join("hearth"),
    };
    std::fs::create_dir_all(&dir).map_err(LoadError::XdgRead)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn existing_env_wins() {
        env::set_var("HEARTH_CONFIG_TEST_EXISTING", "from_env");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "HEARTH_CONFIG_TEST_EXISTING=from_dotenv\n",
        )
        .unwrap();
        load_and_apply(Some(dir.path())).unwrap();
        assert_eq!(
            env::var("HEARTH_CONFIG_TEST_EXISTING").as_deref(),
            Ok("from_env")
        );
        env::remove_var("HEARTH_CONFIG_TEST_EXISTING");
    }

    #[test]
    fn dotenv_applied_when_env_missing() {
        env::remove_var("HEARTH_CONFIG_TEST_DOTENV");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "HEARTH_CONFIG_TEST_DOTENV=hello\n").unwrap();
        load_and_apply(Some(dir.path())).unwrap();
        assert_eq!(
            env::var("HEARTH_CONFIG_TEST_DOTENV").as_deref(),
            Ok("hello")
        );
        env::remove_var("HEARTH_CONFIG_TEST_DOTENV");
    }

    #[test]
    fn load_and_apply_without_any_config_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_and_apply(Some(dir.path())).is_ok());
    }

    #[test]
    fn data_dir_override() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("custom-data");
        env::set_var("HEARTH_DATA_DIR", &target);
        let resolved = data_dir().unwrap();
        env::remove_var("HEARTH_DATA_DIR");
        assert_eq!(resolved, target);
        assert!(resolved.is_dir());
    }
}

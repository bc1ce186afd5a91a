//! Load the `[env]` table from `$XDG_CONFIG_HOME/<app>/config.toml`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::LoadError;

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn config_path(app: &str) -> Option<PathBuf> {
    // XDG_CONFIG_HOME is honored explicitly so tests can redirect it.
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    let path = base.join(app).join("config.toml");
    path.is_file().then_some(path)
}

/// Returns env pairs from the `[env]` section. Missing file or empty section
/// returns an empty list.
pub fn load_env_pairs(app: &str) -> Result<Vec<(String, String)>, LoadError> {
    let Some(path) = config_path(app) else {
        return Ok(Vec::new());
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let config: ConfigFile = toml::from_str(&content)?;
    Ok(config.env.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn missing_config_returns_empty() {
        let pairs = load_env_pairs("hearth-config-test-nonexistent-98765").unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn reads_env_table() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("hearth-test-app");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nHEARTH_XDG_TEST = \"from_toml\"\n",
        )
        .unwrap();

        let prev = env::var_os("XDG_CONFIG_HOME");
        env::set_var("XDG_CONFIG_HOME", dir.path());
        let result = load_env_pairs("hearth-test-app");
        match prev {
            Some(p) => env::set_var("XDG_CONFIG_HOME", p),
            None => env::remove_var("XDG_CONFIG_HOME"),
        }

        let pairs = result.unwrap();
        assert_eq!(
            pairs,
            vec![("HEARTH_XDG_TEST".to_string(), "from_toml".to_string())]
        );
    }
}

//! Typed daemon settings read from the environment at start and on SIGHUP.

use std::path::PathBuf;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Settings for one daemon run. Reloadable fields are re-read on SIGHUP via
/// [`DaemonConfig::from_env`].
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Data directory holding `daemon.pid`, `daemon.sock`, `hearth.db`.
    pub data_dir: PathBuf,
    /// OpenAI-compatible endpoint base URL; `None` uses the client default.
    pub llm_base_url: Option<String>,
    /// Chat model for gateway queries and swarm agents.
    pub chat_model: String,
    /// Model for summarization / extraction / exploration background work.
    pub utility_model: String,
    /// Embedding model and dimension.
    pub embed_model: String,
    pub embed_dim: usize,
    /// Cap on captured assistant output, bytes.
    pub max_output_bytes: usize,
    /// Outputs longer than this (chars) get an LLM summary for `summary`
    /// include mode.
    pub summary_threshold: usize,
    /// Wall-clock timeout for assigned swarm agents, seconds.
    pub agent_timeout_secs: u64,
}

impl DaemonConfig {
    /// Reads settings from the environment; `data_dir` is resolved by the
    /// caller (it is not reloadable).
    pub fn from_env(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            llm_base_url: env_opt("HEARTH_LLM_BASE_URL"),
            chat_model: env_opt("HEARTH_CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            utility_model: env_opt("HEARTH_UTILITY_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            embed_model: env_opt("HEARTH_EMBED_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            embed_dim: env_or("HEARTH_EMBED_DIM", 1536),
            max_output_bytes: env_or("HEARTH_MAX_OUTPUT_BYTES", 262_144),
            summary_threshold: env_or("HEARTH_SUMMARY_THRESHOLD", 2000),
            agent_timeout_secs: env_or("HEARTH_AGENT_TIMEOUT_SECS", 3600),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("hearth.db")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("daemon.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = DaemonConfig::from_env(PathBuf::from("/tmp/hearth-test"));
        assert_eq!(cfg.embed_dim, 1536);
        assert_eq!(cfg.max_output_bytes, 262_144);
        assert_eq!(cfg.summary_threshold, 2000);
        assert_eq!(cfg.agent_timeout_secs, 3600);
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/hearth-test/hearth.db"));
        assert_eq!(
            cfg.socket_path(),
            PathBuf::from("/tmp/hearth-test/daemon.sock")
        );
    }
}

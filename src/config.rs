//! Runtime configuration from environment variables.

use crate::index::IndexConfig;
use crate::sessions::Provider;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    /// Claude Code projects dir: ~/.claude/projects/
    pub claude_projects_dir: PathBuf,
    /// Codex CLI sessions dir: ~/.codex/sessions/
    pub codex_sessions_dir: PathBuf,
    /// Pi coding agent sessions dir: ~/.pi/agent/sessions/
    pub pi_sessions_dir: PathBuf,
    /// Index sidecars: ~/.session-sync/
    pub data_dir: PathBuf,
    pub port: u16,
    pub index_ttl: Duration,
    pub max_cached_directories: usize,
    /// Follower poll interval for incremental fetches
    pub poll_interval: Duration,
    pub watch_debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/home/user".to_string());
        Self {
            claude_projects_dir: PathBuf::from(&home).join(".claude").join("projects"),
            codex_sessions_dir: PathBuf::from(&home).join(".codex").join("sessions"),
            pi_sessions_dir: PathBuf::from(&home).join(".pi").join("agent").join("sessions"),
            data_dir: PathBuf::from(&home).join(".session-sync"),
            port: 4850,
            index_ttl: Duration::from_secs(30),
            max_cached_directories: 64,
            poll_interval: Duration::from_millis(1500),
            watch_debounce: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Defaults overridden by whichever variables are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);
        let millis = |key: &str, default: Duration| {
            parsed::<u64>(&lookup, key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            claude_projects_dir: path("CLAUDE_PROJECTS_DIR", defaults.claude_projects_dir),
            codex_sessions_dir: path("CODEX_SESSIONS_DIR", defaults.codex_sessions_dir),
            pi_sessions_dir: path("PI_SESSIONS_DIR", defaults.pi_sessions_dir),
            data_dir: path("SESSION_SYNC_DATA_DIR", defaults.data_dir),
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            index_ttl: millis("SESSION_SYNC_INDEX_TTL_MS", defaults.index_ttl),
            max_cached_directories: parsed(&lookup, "SESSION_SYNC_MAX_DIRS")
                .unwrap_or(defaults.max_cached_directories),
            poll_interval: millis("SESSION_SYNC_POLL_MS", defaults.poll_interval),
            watch_debounce: millis("SESSION_SYNC_DEBOUNCE_MS", defaults.watch_debounce),
        }
    }

    pub fn root(&self, provider: Provider) -> &Path {
        match provider {
            Provider::Claude => &self.claude_projects_dir,
            Provider::Codex => &self.codex_sessions_dir,
            Provider::Pi => &self.pi_sessions_dir,
        }
    }

    pub fn roots(&self) -> Vec<(Provider, PathBuf)> {
        [Provider::Claude, Provider::Codex, Provider::Pi]
            .into_iter()
            .map(|p| (p, self.root(p).to_path_buf()))
            .collect()
    }

    /// Directory holding a project's session logs.
    ///
    /// Claude and Pi project ids are directory names under the root. Codex
    /// project ids are day keys (`2026-02-03` → `2026/02/03`). Ids that would
    /// escape the root return None.
    pub fn session_dir(&self, provider: Provider, project_id: &str) -> Option<PathBuf> {
        let root = self.root(provider);
        if provider == Provider::Codex {
            let parts: Vec<&str> = project_id.split('-').collect();
            let is_day = parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
            return is_day.then(|| root.join(parts[0]).join(parts[1]).join(parts[2]));
        }
        let mut components = Path::new(project_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Some(root.join(name)),
            _ => None,
        }
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            data_dir: self.data_dir.clone(),
            ttl: self.index_ttl,
            max_directories: self.max_cached_directories,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn overrides_and_invalid_values() {
        let c = config(&[
            ("CLAUDE_PROJECTS_DIR", "/data/claude"),
            ("PORT", "9000"),
            ("SESSION_SYNC_INDEX_TTL_MS", "0"),
            ("SESSION_SYNC_MAX_DIRS", "lots"),
        ]);
        assert_eq!(c.claude_projects_dir, PathBuf::from("/data/claude"));
        assert_eq!(c.port, 9000);
        assert_eq!(c.index_ttl, Duration::ZERO);
        assert_eq!(c.max_cached_directories, Config::default().max_cached_directories);
    }

    #[test]
    fn session_dirs_per_provider() {
        let c = config(&[
            ("CLAUDE_PROJECTS_DIR", "/c"),
            ("CODEX_SESSIONS_DIR", "/x"),
            ("PI_SESSIONS_DIR", "/p"),
        ]);
        assert_eq!(c.session_dir(Provider::Claude, "-home-u-code"), Some(PathBuf::from("/c/-home-u-code")));
        assert_eq!(c.session_dir(Provider::Pi, "--home-u--"), Some(PathBuf::from("/p/--home-u--")));
        assert_eq!(c.session_dir(Provider::Codex, "2026-02-03"), Some(PathBuf::from("/x/2026/02/03")));
        assert_eq!(c.session_dir(Provider::Codex, "proj"), None);
        assert_eq!(c.session_dir(Provider::Claude, ".."), None);
        assert_eq!(c.session_dir(Provider::Claude, "a/b"), None);
    }
}

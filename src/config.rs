use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub ipc: IpcConfig,
    pub supervisor: SupervisorConfig,
    pub dispatch: DispatchConfig,
    pub extensions: ExtensionsConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shortcuts: Vec<ShortcutConfig>,
}

/// A keyword shortcut (keyword -> URL or script, optionally with `%s`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutConfig {
    pub keyword: String,
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub icon: Option<String>,
    /// Claim whole queries no keyword provider wants
    #[serde(default)]
    pub default_search: bool,
    /// Ignore any argument and always use `target` verbatim
    #[serde(default)]
    pub run_without_argument: bool,
}

/// Placeholder substituted with the query argument.
pub const PLACEHOLDER: &str = "%s";

impl ShortcutConfig {
    pub fn has_placeholder(&self) -> bool {
        self.target.contains(PLACEHOLDER)
    }

    pub fn resolve_target(&self, argument: &str) -> String {
        if self.has_placeholder() {
            self.target.replace(PLACEHOLDER, argument)
        } else {
            self.target.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Socket path; a per-process path in the runtime dir when unset
    pub socket_path: Option<String>,
    pub handshake_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Crashes tolerated inside `retry_window_secs` before disabling
    pub max_retries: u32,
    pub retry_window_secs: u64,
    /// Uptime after which a crash no longer counts against earlier ones
    pub stable_uptime_secs: u64,
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub deadline_ms: u64,
    pub max_results: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    pub directory: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    pub filter: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_retries: 5,
            retry_window_secs: 60,
            stable_uptime_secs: 30,
            stop_timeout_ms: 2_000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 400,
            max_results: 20,
        }
    }
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            directory: "~/.config/orbit/extensions".to_string(),
            enabled: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "orbit=info".to_string(),
        }
    }
}

impl IpcConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl SupervisorConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl DispatchConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl ExtensionsConfig {
    /// Extensions directory with `~` expanded
    pub fn directory_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.directory).as_ref())
    }
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
            })
            .join("orbit")
            .join("config.toml")
    }

    /// Load config from file, or return defaults if not found
    pub fn load() -> Self {
        let path = Self::config_path();

        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "Failed to parse config: {}", e);
                Self::default()
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to read config: {}", e);
                Self::default()
            }
        }
    }

    /// Parse and validate config from TOML text
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.validate();
        Ok(config)
    }

    /// Validate and clamp config values to acceptable ranges
    fn validate(&mut self) {
        self.ipc.handshake_timeout_ms = self.ipc.handshake_timeout_ms.clamp(100, 60_000);

        self.supervisor.backoff_base_ms = self.supervisor.backoff_base_ms.clamp(10, 60_000);
        self.supervisor.backoff_max_ms = self
            .supervisor
            .backoff_max_ms
            .clamp(self.supervisor.backoff_base_ms, 600_000);
        self.supervisor.retry_window_secs = self.supervisor.retry_window_secs.max(1);
        self.supervisor.stop_timeout_ms = self.supervisor.stop_timeout_ms.clamp(10, 30_000);

        // Deadline must stay short enough to keep typing responsive
        self.dispatch.deadline_ms = self.dispatch.deadline_ms.clamp(20, 10_000);
        self.dispatch.max_results = self.dispatch.max_results.clamp(1, 100);

        let before = self.shortcuts.len();
        self.shortcuts.retain(|shortcut| {
            let valid = !shortcut.keyword.is_empty()
                && !shortcut.keyword.chars().any(char::is_whitespace);
            if !valid {
                tracing::warn!(keyword = %shortcut.keyword, "Ignoring shortcut with invalid keyword");
            }
            valid
        });
        if self.shortcuts.len() != before {
            tracing::debug!("{} shortcuts dropped", before - self.shortcuts.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dispatch.deadline(), Duration::from_millis(400));
        assert_eq!(config.supervisor.max_retries, 5);
        assert!(config.shortcuts.is_empty());
    }

    #[test]
    fn test_parse_partial_config() {
        let config = Config::from_toml(
            r#"
[dispatch]
deadline_ms = 250

[[shortcuts]]
keyword = "g"
name = "Google"
target = "https://google.com/search?q=%s"
default_search = true
"#,
        )
        .unwrap();

        assert_eq!(config.dispatch.deadline_ms, 250);
        assert_eq!(config.dispatch.max_results, 20);
        assert_eq!(config.supervisor.backoff_base_ms, 500);
        assert_eq!(config.shortcuts.len(), 1);
        assert!(config.shortcuts[0].default_search);
        assert!(!config.shortcuts[0].run_without_argument);
    }

    #[test]
    fn test_validate_clamps() {
        let config = Config::from_toml(
            r#"
[dispatch]
deadline_ms = 0
max_results = 0

[supervisor]
backoff_base_ms = 1000
backoff_max_ms = 10

[[shortcuts]]
keyword = "two words"
name = "Broken"
target = "x"
"#,
        )
        .unwrap();

        assert_eq!(config.dispatch.deadline_ms, 20);
        assert_eq!(config.dispatch.max_results, 1);
        assert_eq!(config.supervisor.backoff_max_ms, 1000);
        assert!(config.shortcuts.is_empty());
    }

    #[test]
    fn test_resolve_target() {
        let shortcut = ShortcutConfig {
            keyword: "kw".into(),
            name: "name".into(),
            target: "https://site/?q=%s".into(),
            icon: None,
            default_search: false,
            run_without_argument: false,
        };
        assert!(shortcut.has_placeholder());
        assert_eq!(shortcut.resolve_target("test"), "https://site/?q=test");
    }
}

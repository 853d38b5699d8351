use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpaError};

/// Top-level rpaflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

/// What the interpreter does when traversal would revisit a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisitPolicy {
    /// Fail the run with `CycleDetected`.
    #[default]
    Fail,
    /// Stop traversal and report COMPLETED even though no end node was reached.
    Complete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub revisit_policy: RevisitPolicy,
}

/// Browser session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Path to a Chrome/Chromium binary. Auto-detected when unset.
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub launch_args: Vec<String>,
    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Default per-operation timeout for the page.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Extra attempts after a connection-loss failure.
    #[serde(default = "default_action_retries")]
    pub max_action_retries: u32,
    /// Extra attempts after a navigation timeout or closed target.
    #[serde(default = "default_navigation_retries")]
    pub max_navigation_retries: u32,
    #[serde(default = "default_navigation_backoff_ms")]
    pub navigation_backoff_ms: u64,
}

fn default_headless() -> bool {
    true
}

fn default_viewport_width() -> u32 {
    1280
}

fn default_viewport_height() -> u32 {
    800
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0 Safari/537.36 rpaflow/0.3"
        .into()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_action_retries() -> u32 {
    2
}

fn default_navigation_retries() -> u32 {
    2
}

fn default_navigation_backoff_ms() -> u64 {
    1000
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            executable: None,
            launch_args: Vec::new(),
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            user_agent: default_user_agent(),
            default_timeout_ms: default_timeout_ms(),
            max_action_retries: default_action_retries(),
            max_navigation_retries: default_navigation_retries(),
            navigation_backoff_ms: default_navigation_backoff_ms(),
        }
    }
}

impl BrowserConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn navigation_backoff(&self) -> Duration {
        Duration::from_millis(self.navigation_backoff_ms)
    }
}

/// Outbound HTTP settings for API_CALL nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_http_user_agent")]
    pub user_agent: String,
}

fn default_http_timeout() -> u64 {
    30
}

fn default_http_user_agent() -> String {
    "rpaflow/0.3".into()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_http_user_agent(),
        }
    }
}

/// Limits for the SCRIPT sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Statements + loop iterations a script may execute.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Maximum block/expression nesting depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_steps() -> u64 {
    10_000
}

fn default_max_depth() -> usize {
    64
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_depth: default_max_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| RpaError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| RpaError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_RPAFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_RPAFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_RPAFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_RPAFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_RPAFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.revisit_policy, RevisitPolicy::Fail);
        assert!(config.browser.headless);
        assert_eq!(config.browser.default_timeout_ms, 30_000);
        assert_eq!(config.browser.max_action_retries, 2);
        assert_eq!(config.browser.max_navigation_retries, 2);
        assert_eq!(config.browser.navigation_backoff(), Duration::from_secs(1));
        assert_eq!(config.http.timeout_secs, 30);
        assert_eq!(config.script.max_steps, 10_000);
        assert_eq!(config.events.capacity, 256);
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[engine]
revisit_policy = "complete"

[browser]
headless = false
viewport_width = 1920
launch_args = ["--start-maximized"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.revisit_policy, RevisitPolicy::Complete);
        assert!(!config.browser.headless);
        assert_eq!(config.browser.viewport_width, 1920);
        assert_eq!(config.browser.viewport_height, 800);
        assert_eq!(config.browser.launch_args, vec!["--start-maximized"]);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config =
            AppConfig::load_or_default(Path::new("/nonexistent/rpaflow.toml")).unwrap();
        assert_eq!(config.http.timeout_secs, 30);
    }
}

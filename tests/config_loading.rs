use std::io::Write;

use rpaflow_core::config::{AppConfig, RevisitPolicy};
use rpaflow_core::RpaError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
revisit_policy = "complete"

[browser]
headless = false
executable = "/usr/bin/chromium"
launch_args = ["--no-sandbox", "--disable-gpu"]
viewport_width = 1920
viewport_height = 1080
user_agent = "rpaflow-test"
default_timeout_ms = 10000
max_action_retries = 1
max_navigation_retries = 4
navigation_backoff_ms = 250

[http]
timeout_secs = 5
user_agent = "rpaflow-http-test"

[script]
max_steps = 500
max_depth = 16

[events]
capacity = 32
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.revisit_policy, RevisitPolicy::Complete);
    assert!(!config.browser.headless);
    assert_eq!(config.browser.executable.as_deref(), Some("/usr/bin/chromium"));
    assert_eq!(config.browser.launch_args, vec!["--no-sandbox", "--disable-gpu"]);
    assert_eq!(config.browser.viewport_width, 1920);
    assert_eq!(config.browser.viewport_height, 1080);
    assert_eq!(config.browser.user_agent, "rpaflow-test");
    assert_eq!(config.browser.default_timeout_ms, 10_000);
    assert_eq!(config.browser.max_action_retries, 1);
    assert_eq!(config.browser.max_navigation_retries, 4);
    assert_eq!(config.browser.navigation_backoff_ms, 250);
    assert_eq!(config.http.timeout_secs, 5);
    assert_eq!(config.http.user_agent, "rpaflow-http-test");
    assert_eq!(config.script.max_steps, 500);
    assert_eq!(config.script.max_depth, 16);
    assert_eq!(config.events.capacity, 32);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("RPAFLOW_TEST_CHROME", "/opt/chrome/chrome");

    let toml_content = r#"
[browser]
executable = "${RPAFLOW_TEST_CHROME}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.browser.executable.as_deref(), Some("/opt/chrome/chrome"));

    std::env::remove_var("RPAFLOW_TEST_CHROME");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = rpaflow_test_utils::config_file("[http]\ntimeout_secs = 12\n");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.http.timeout_secs, 12);
    assert_eq!(config.engine.revisit_policy, RevisitPolicy::Fail);
    assert!(config.browser.headless);
    assert!(config.browser.executable.is_none());
    assert_eq!(config.browser.default_timeout_ms, 30_000);
    assert_eq!(config.script.max_steps, 10_000);
    assert_eq!(config.events.capacity, 256);
}

#[test]
fn test_invalid_config_is_reported() {
    let tmp = rpaflow_test_utils::config_file("[engine]\nrevisit_policy = \"loop\"\n");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, RpaError::Config(_)));

    let err = AppConfig::load(std::path::Path::new("/nonexistent/rpaflow.toml")).unwrap_err();
    assert!(matches!(err, RpaError::ConfigNotFound(_)));
}

use std::sync::Arc;

use rpaflow_browser::{BrowserError, BrowserSessionManager, SessionStatus};
use rpaflow_core::config::BrowserConfig;
use rpaflow_core::{BrowserActionSpec, BrowserActionType};
use rpaflow_test_utils::{MockBrowserBackend, MockOp};
use serde_json::json;

fn session_manager(backend: &MockBrowserBackend) -> BrowserSessionManager {
    let config = BrowserConfig {
        navigation_backoff_ms: 0,
        ..BrowserConfig::default()
    };
    BrowserSessionManager::new(Arc::new(backend.clone()), config)
}

async fn wait_for_status(manager: &BrowserSessionManager, expected: SessionStatus) {
    for _ in 0..100 {
        if manager.status().await == expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("session never became {expected}");
}

#[tokio::test]
async fn test_first_acquire_launches_once() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);
    assert_eq!(manager.status().await, SessionStatus::Uninitialized);

    let first = manager.acquire().await.unwrap();
    let again = manager.acquire().await.unwrap();
    assert_eq!(first, again);
    assert_eq!(backend.launches(), 1);
    assert_eq!(manager.status().await, SessionStatus::Ready);
}

#[tokio::test]
async fn test_reacquire_after_disconnect_closes_old_handles_once() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);

    let first = manager.acquire().await.unwrap();
    let old = backend.latest_session().unwrap();
    old.disconnect();
    wait_for_status(&manager, SessionStatus::Disconnected).await;

    // A failing close must not stop the others or surface from acquire.
    backend.fail(
        MockOp::CloseContext,
        BrowserError::Protocol("context already gone".into()),
    );
    let second = manager.acquire().await.unwrap();

    assert_ne!(first, second);
    assert_eq!(backend.launches(), 2);
    assert_eq!(old.page_closes(), 1);
    assert_eq!(old.context_closes(), 1);
    assert_eq!(old.process_closes(), 1);
    assert_eq!(manager.status().await, SessionStatus::Ready);

    let new = backend.latest_session().unwrap();
    assert_eq!(new.page_closes(), 0);
}

#[tokio::test]
async fn test_stale_disconnect_observer_is_ignored() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);

    manager.acquire().await.unwrap();
    let old = backend.latest_session().unwrap();
    old.close_page_externally();
    manager.acquire().await.unwrap();
    assert_eq!(backend.launches(), 2);

    // The first session's process reports termination late.
    old.disconnect();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(manager.status().await, SessionStatus::Ready);
}

#[tokio::test]
async fn test_unusable_launch_retried_once() {
    let backend = MockBrowserBackend::new();
    backend.launch_unusable(1);
    let manager = session_manager(&backend);
    manager.acquire().await.unwrap();
    assert_eq!(backend.launches(), 2);
    assert_eq!(backend.session(0).unwrap().process_closes(), 1);

    let backend = MockBrowserBackend::new();
    backend.launch_unusable(2);
    let manager = session_manager(&backend);
    assert!(matches!(
        manager.acquire().await.unwrap_err(),
        BrowserError::Unusable
    ));
}

#[tokio::test]
async fn test_navigate_adds_scheme() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);

    let result = manager
        .perform_action(&BrowserActionSpec::navigate("example.com"))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.get_str("url"), Some("https://example.com"));
    assert_eq!(result.get_str("title"), Some("Mock Page"));
    assert_eq!(result.get("status"), Some(&json!(200)));
    assert!(result.get("warning").is_none());
    assert_eq!(
        backend.latest_session().unwrap().calls(),
        vec!["goto https://example.com"]
    );
}

#[tokio::test]
async fn test_navigate_bad_status_is_success_with_warning() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);

    backend.set_navigation_status(Some(404));
    let result = manager
        .perform_action(&BrowserActionSpec::navigate("https://example.com/missing"))
        .await;
    assert!(result.success);
    assert_eq!(result.get("status"), Some(&json!(404)));
    assert!(result.get_str("warning").unwrap().contains("404"));

    backend.set_navigation_status(None);
    let result = manager
        .perform_action(&BrowserActionSpec::navigate("https://example.com"))
        .await;
    assert!(result.success);
    assert!(result.get("status").is_none());
    assert!(result.get("warning").is_some());
}

#[tokio::test]
async fn test_navigate_retries_timeouts_in_place() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);
    backend
        .fail(MockOp::Goto, BrowserError::Timeout("goto".into()))
        .fail(MockOp::Goto, BrowserError::Timeout("goto".into()));

    let result = manager
        .perform_action(&BrowserActionSpec::navigate("example.com"))
        .await;
    assert!(result.success);
    assert_eq!(backend.launches(), 1);
}

#[tokio::test]
async fn test_navigate_invalid_url_not_retried() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);

    let result = manager
        .perform_action(&BrowserActionSpec::navigate("exa mple.com"))
        .await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("Invalid URL"));
    assert_eq!(backend.launches(), 0);
}

#[tokio::test]
async fn test_handler_failure_becomes_result() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);
    backend.fail(
        MockOp::Click,
        BrowserError::ElementNotFound("#submit".into()),
    );

    let spec = BrowserActionSpec::new(BrowserActionType::Click).with_selector("#submit");
    let result = manager.perform_action(&spec).await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Element not found: #submit"));
    assert_eq!(backend.launches(), 1);
}

#[tokio::test]
async fn test_connection_loss_relaunches_and_retries() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);
    backend.fail(
        MockOp::Click,
        BrowserError::from_message("Protocol error: Target closed."),
    );

    let spec = BrowserActionSpec::new(BrowserActionType::Click).with_selector("#go");
    let result = manager.perform_action(&spec).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(backend.launches(), 2);
    let first = backend.session(0).unwrap();
    assert_eq!(first.page_closes(), 1);
    assert_eq!(first.context_closes(), 1);
    assert_eq!(first.process_closes(), 1);
    assert_eq!(
        backend.session(1).unwrap().calls(),
        vec!["wait #go", "click #go"]
    );
}

#[tokio::test]
async fn test_connection_loss_retries_are_bounded() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);
    for _ in 0..3 {
        backend.fail(
            MockOp::WaitForSelector,
            BrowserError::ConnectionLost("socket dropped".into()),
        );
    }

    let spec = BrowserActionSpec::new(BrowserActionType::WaitForSelector).with_selector("#x");
    let result = manager.perform_action(&spec).await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("socket dropped"));
    // initial attempt plus two retries, each on a fresh session
    assert_eq!(backend.launches(), 3);
    assert_eq!(manager.status().await, SessionStatus::Disconnected);
}

#[tokio::test]
async fn test_type_and_select_require_text() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);

    let spec = BrowserActionSpec::new(BrowserActionType::Type).with_selector("#q");
    let result = manager.perform_action(&spec).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("non-empty text"));

    let spec = BrowserActionSpec::new(BrowserActionType::Select)
        .with_selector("#country")
        .with_text("NZ");
    assert!(manager.perform_action(&spec).await.success);
    assert_eq!(
        backend.latest_session().unwrap().calls(),
        vec!["wait #country", "select #country NZ"]
    );
}

#[tokio::test]
async fn test_screenshot_is_base64() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);

    let spec = BrowserActionSpec::new(BrowserActionType::Screenshot).with_option("fullPage", json!(true));
    let result = manager.perform_action(&spec).await;

    assert!(result.success);
    assert_eq!(result.get_str("screenshot"), Some("iVBORyBtb2Nr"));
    assert_eq!(
        backend.latest_session().unwrap().calls(),
        vec!["screenshot full_page=true"]
    );
}

#[tokio::test]
async fn test_extract_data() {
    let backend = MockBrowserBackend::new();
    backend.set_extract_data(vec![json!("Alpha"), json!("Beta")]);
    let manager = session_manager(&backend);

    let spec = BrowserActionSpec::new(BrowserActionType::ExtractData)
        .with_selector("li.item")
        .with_option("textOnly", json!(true));
    let result = manager.perform_action(&spec).await;

    assert!(result.success);
    assert_eq!(result.get("data"), Some(&json!(["Alpha", "Beta"])));
    assert_eq!(
        backend.latest_session().unwrap().calls(),
        vec!["wait li.item", "extract li.item text_only=true"]
    );
}

#[tokio::test]
async fn test_wait_for_navigation_reports_url() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);

    manager
        .perform_action(&BrowserActionSpec::navigate("example.com/login"))
        .await;
    let result = manager
        .perform_action(&BrowserActionSpec::new(BrowserActionType::WaitForNavigation))
        .await;
    assert!(result.success);
    assert_eq!(result.get_str("url"), Some("https://example.com/login"));
}

#[tokio::test]
async fn test_shutdown_then_relaunch() {
    let backend = MockBrowserBackend::new();
    let manager = session_manager(&backend);

    manager.acquire().await.unwrap();
    backend.fail(
        MockOp::ClosePage,
        BrowserError::Protocol("page already closed".into()),
    );
    manager.shutdown().await;

    let first = backend.session(0).unwrap();
    assert_eq!(first.page_closes(), 1);
    assert_eq!(first.context_closes(), 1);
    assert_eq!(first.process_closes(), 1);
    assert_eq!(manager.status().await, SessionStatus::Closed);

    // Shutting down twice is harmless.
    manager.shutdown().await;
    assert_eq!(first.process_closes(), 1);

    let result = manager
        .perform_action(&BrowserActionSpec::navigate("example.com"))
        .await;
    assert!(result.success);
    assert_eq!(backend.launches(), 2);
}

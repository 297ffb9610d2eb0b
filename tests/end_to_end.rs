//! Query round trips through real extension processes.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{demo_manifest, shortcut, test_config, wait_for_state};
use orbit::core::{DispatchEvent, ProviderId};
use orbit::{ConnectionState, ExtensionHost, LogNotifier, OrbitError, ResultAction};
use tempfile::TempDir;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_weather_query_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let host = ExtensionHost::start(
        &config,
        vec![demo_manifest("weather", "wttr", &[])],
        Vec::new(),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    assert!(wait_for_state(&host, "weather", ConnectionState::Connected, CONNECT_TIMEOUT).await);

    let stream = host.dispatch_query("wttr oslo").await.unwrap();
    assert_eq!(stream.correlation_id().as_str(), "C1");

    let items = stream.finished().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Oslo: 14°C");
    assert_eq!(items[0].source, ProviderId::Extension("weather".to_string()));
    assert_eq!(
        items[0].action,
        ResultAction::Copy {
            text: "Oslo: 14°C".to_string()
        }
    );

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reply_without_extension_id_is_accepted() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let host = ExtensionHost::start(
        &config,
        vec![demo_manifest("weather", "wttr", &["--bare"])],
        Vec::new(),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    assert!(wait_for_state(&host, "weather", ConnectionState::Connected, CONNECT_TIMEOUT).await);

    let mut stream = host.dispatch_query("wttr oslo").await.unwrap();
    assert_eq!(stream.correlation_id().as_str(), "C1");

    let mut batches = 0;
    let items = loop {
        match stream.next().await.unwrap() {
            DispatchEvent::Batch { .. } => batches += 1,
            DispatchEvent::Complete { items, timed_out } => {
                assert!(timed_out.is_empty());
                break items;
            }
            DispatchEvent::Superseded => panic!("dispatch was superseded"),
        }
    };
    assert_eq!(batches, 1);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Oslo: 14°C");
    assert_eq!(items[0].source, ProviderId::Extension("weather".to_string()));
    assert_eq!(
        host.state("weather").await.unwrap(),
        Some(ConnectionState::Connected)
    );

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batches_arrive_before_completion() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config
        .shortcuts
        .push(shortcut("wttr", "https://wttr.in/%s", false));
    let shortcuts = orbit::services::ShortcutProvider::from_config(&config);
    let host = ExtensionHost::start(
        &config,
        vec![demo_manifest("weather", "wttr", &[])],
        shortcuts,
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    assert!(wait_for_state(&host, "weather", ConnectionState::Connected, CONNECT_TIMEOUT).await);

    let mut stream = host.dispatch_query("wttr paris").await.unwrap();
    let mut batches = Vec::new();
    let complete = loop {
        match stream.next().await.unwrap() {
            DispatchEvent::Batch { provider, .. } => batches.push(provider),
            DispatchEvent::Complete { items, timed_out } => break (items, timed_out),
            DispatchEvent::Superseded => panic!("dispatch was superseded"),
        }
    };

    assert_eq!(batches.len(), 2);
    let (items, timed_out) = complete;
    assert!(timed_out.is_empty());
    // Shortcuts come first regardless of arrival order
    assert_eq!(items[0].source, ProviderId::Shortcut("wttr".to_string()));
    assert_eq!(
        items[0].action,
        ResultAction::Open {
            url: "https://wttr.in/paris".to_string()
        }
    );
    assert_eq!(items[1].title, "Paris: 14°C");

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_search_only_without_keyword_match() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config
        .shortcuts
        .push(shortcut("g", "https://google.com/search?q=%s", true));
    let shortcuts = orbit::services::ShortcutProvider::from_config(&config);
    let host = ExtensionHost::start(
        &config,
        vec![demo_manifest("weather", "wttr", &[])],
        shortcuts,
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    assert!(wait_for_state(&host, "weather", ConnectionState::Connected, CONNECT_TIMEOUT).await);

    let items = host
        .dispatch_query("hello world")
        .await
        .unwrap()
        .finished()
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].source, ProviderId::Shortcut("g".to_string()));

    let items = host
        .dispatch_query("wttr oslo")
        .await
        .unwrap()
        .finished()
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].source, ProviderId::Extension("weather".to_string()));

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_extension_times_out() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.dispatch.deadline_ms = 200;
    let host = ExtensionHost::start(
        &config,
        vec![demo_manifest("weather", "wttr", &["--silent"])],
        Vec::new(),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    assert!(wait_for_state(&host, "weather", ConnectionState::Connected, CONNECT_TIMEOUT).await);

    let mut stream = host.dispatch_query("wttr oslo").await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        DispatchEvent::Complete {
            items: Vec::new(),
            timed_out: vec![ProviderId::Extension("weather".to_string())],
        }
    );
    // Still healthy: a slow answer is not a crash
    assert_eq!(
        host.state("weather").await.unwrap(),
        Some(ConnectionState::Connected)
    );

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_newer_query_supersedes_older() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let host = ExtensionHost::start(
        &config,
        vec![demo_manifest("weather", "wttr", &["--silent"])],
        Vec::new(),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    assert!(wait_for_state(&host, "weather", ConnectionState::Connected, CONNECT_TIMEOUT).await);

    let mut first = host.dispatch_query("wttr osl").await.unwrap();
    let second = host.dispatch_query("wttr oslo").await.unwrap();
    assert_ne!(first.correlation_id(), second.correlation_id());

    assert_eq!(first.next().await, Some(DispatchEvent::Superseded));
    assert_eq!(first.next().await, None);

    // Separate sessions do not interfere
    let other = host.dispatch_query_in(7, "wttr bergen").await.unwrap();
    let third = host.dispatch_query("wttr tromso").await.unwrap();
    drop(third);
    drop(other);

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_error_reply_settles_dispatch() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.dispatch.deadline_ms = 10_000;
    let host = ExtensionHost::start(
        &config,
        vec![demo_manifest("weather", "wttr", &["--fail"])],
        Vec::new(),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    assert!(wait_for_state(&host, "weather", ConnectionState::Connected, CONNECT_TIMEOUT).await);

    let stream = host.dispatch_query("wttr oslo").await.unwrap();
    let items = tokio::time::timeout(Duration::from_secs(5), stream.finished())
        .await
        .unwrap()
        .unwrap();
    assert!(items.is_empty());
    assert_eq!(
        host.state("weather").await.unwrap(),
        Some(ConnectionState::Connected)
    );

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_announced_triggers_replace_manifest_triggers() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let host = ExtensionHost::start(
        &config,
        vec![demo_manifest("weather", "wttr", &["--announce", "weather"])],
        Vec::new(),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    assert!(wait_for_state(&host, "weather", ConnectionState::Connected, CONNECT_TIMEOUT).await);

    // The announcement may land just after the handshake
    let mut items = Vec::new();
    for _ in 0..50 {
        items = host
            .dispatch_query("weather oslo")
            .await
            .unwrap()
            .finished()
            .await
            .unwrap();
        if !items.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Oslo: 14°C");

    let items = host
        .dispatch_query("wttr oslo")
        .await
        .unwrap()
        .finished()
        .await
        .unwrap();
    assert!(items.is_empty());

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_query_completes_immediately() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config
        .shortcuts
        .push(shortcut("g", "https://google.com/search?q=%s", true));
    let shortcuts = orbit::services::ShortcutProvider::from_config(&config);
    let host = ExtensionHost::start(&config, Vec::new(), shortcuts, Arc::new(LogNotifier))
        .await
        .unwrap();

    let mut stream = host.dispatch_query("   ").await.unwrap();
    assert_eq!(
        stream.next().await,
        Some(DispatchEvent::Complete {
            items: Vec::new(),
            timed_out: Vec::new(),
        })
    );

    host.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handle_fails_after_shutdown() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let host = ExtensionHost::start(
        &config,
        vec![demo_manifest("weather", "wttr", &[])],
        Vec::new(),
        Arc::new(LogNotifier),
    )
    .await
    .unwrap();
    assert!(wait_for_state(&host, "weather", ConnectionState::Connected, CONNECT_TIMEOUT).await);

    tokio::time::timeout(Duration::from_secs(5), host.shutdown())
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        host.dispatch_query("wttr oslo").await,
        Err(OrbitError::HostStopped)
    ));
    assert!(matches!(host.states().await, Err(OrbitError::HostStopped)));
}

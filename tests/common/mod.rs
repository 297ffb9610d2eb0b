//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use orbit::config::ShortcutConfig;
use orbit::notify::NotifyResult;
use orbit::{Config, ConnectionState, ExtensionManifest, HostHandle, Notifier};
use tempfile::TempDir;

pub const DEMO_EXTENSION: &str = env!("CARGO_BIN_EXE_orbit-demo-extension");

/// Config with a private socket and short timings.
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.ipc.socket_path = Some(
        dir.path()
            .join("orbit.sock")
            .to_string_lossy()
            .into_owned(),
    );
    config.supervisor.backoff_base_ms = 20;
    config.supervisor.backoff_max_ms = 100;
    config.supervisor.stop_timeout_ms = 500;
    config.dispatch.deadline_ms = 2_000;
    config.extensions.enabled = false;
    config
}

pub fn demo_manifest(id: &str, trigger: &str, args: &[&str]) -> ExtensionManifest {
    ExtensionManifest {
        id: id.to_string(),
        name: "Weather".to_string(),
        triggers: vec![trigger.to_string()],
        executable: PathBuf::from(DEMO_EXTENSION),
        args: args.iter().map(|arg| arg.to_string()).collect(),
        permissions: Vec::new(),
    }
}

/// Write `<root>/<dir>/manifest.json` for the demo extension.
pub fn write_demo_extension(root: &Path, dir: &str, id: &str, trigger: &str) {
    let ext_dir = root.join(dir);
    std::fs::create_dir_all(&ext_dir).unwrap();
    let manifest = serde_json::json!({
        "id": id,
        "name": "Weather",
        "triggers": [trigger],
        "executable": DEMO_EXTENSION,
    });
    std::fs::write(
        ext_dir.join(orbit::extensions::MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

/// Config that loads extensions from `<dir>/extensions`.
pub fn directory_config(dir: &TempDir) -> (Config, PathBuf) {
    let root = dir.path().join("extensions");
    std::fs::create_dir_all(&root).unwrap();
    let mut config = test_config(dir);
    config.extensions.enabled = true;
    config.extensions.directory = root.to_string_lossy().into_owned();
    (config, root)
}

/// Number of results a query settles with.
pub async fn result_count(host: &HostHandle, text: &str) -> usize {
    host.dispatch_query(text)
        .await
        .unwrap()
        .finished()
        .await
        .unwrap()
        .len()
}

pub fn command_manifest(id: &str, program: &str, args: &[&str]) -> ExtensionManifest {
    ExtensionManifest {
        id: id.to_string(),
        name: id.to_string(),
        triggers: vec![id.to_string()],
        executable: PathBuf::from(program),
        args: args.iter().map(|arg| arg.to_string()).collect(),
        permissions: Vec::new(),
    }
}

pub fn shortcut(keyword: &str, target: &str, default_search: bool) -> ShortcutConfig {
    ShortcutConfig {
        keyword: keyword.to_string(),
        name: format!("Search {}", keyword),
        target: target.to_string(),
        icon: None,
        default_search,
        run_without_argument: false,
    }
}

/// Poll until `id` reaches `expected`. Returns whether it did in time.
pub async fn wait_for_state(
    host: &HostHandle,
    id: &str,
    expected: ConnectionState,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(state)) = host.state(id).await {
            if state == expected {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Notifier that keeps every notification for later inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    notes: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    pub fn notes(&self) -> Vec<(String, String)> {
        self.notes.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn show_notification(&self, title: &str, body: &str) -> NotifyResult {
        self.notes
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
        Ok(())
    }
}

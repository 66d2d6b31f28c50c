use std::path::PathBuf;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{
    EventKind,
    RecommendedWatcher,
    RecursiveMode,
    Watcher,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::manager::ForwardManager;

/// Observes the config file and drives the manager's reload path when it
/// changes on disk.
///
/// Raw notify events are collapsed on a 500 ms poll; the shared
/// `skip_next` flag (set by the manager around its own saves) suppresses
/// self-triggered reloads.
pub struct ConfigWatcher {
    path: PathBuf,
    skip_next: Arc<AtomicBool>,
    watcher: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, skip_next: Arc<AtomicBool>) -> Self {
        Self {
            path,
            skip_next,
            watcher: None,
            task: None,
            cancel: None,
        }
    }

    pub fn start(&mut self, manager: Arc<ForwardManager>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = RecommendedWatcher::new(
            move |result| {
                let _ = tx.blocking_send(result);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        self.watcher = Some(watcher);

        // Saves made before watching began never produce events; start
        // with a clean slate so the first real edit is not swallowed.
        self.skip_next.store(false, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let skip_next = Arc::clone(&self.skip_next);
        let path = self.path.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = sleep(Duration::from_millis(500)) => {}
                }

                let mut modified = false;
                while let Ok(event) = rx.try_recv() {
                    if let Ok(event) = event {
                        if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            modified = true;
                        }
                    }
                }

                if modified && !skip_next.swap(false, Ordering::Relaxed) {
                    info!(path = %path.display(), "config file changed on disk");
                    manager.reload_config().await;
                }
            }
        });

        self.cancel = Some(cancel);
        self.task = Some(task);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            let _ = watcher.unwatch(&self.path);
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.task.take();
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use kubeportal_commons::{
        ConfigStore,
        ForwardDefinition,
        SocketForward,
    };
    use kubeportal_portforward::{
        KubeCache,
        KubeconfigClientFactory,
    };

    use super::*;

    fn socket_def(name: &str, local_port: u16) -> ForwardDefinition {
        ForwardDefinition::Socket(SocketForward {
            name: name.to_string(),
            group: "default".to_string(),
            local_port,
            enabled: false,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 9,
        })
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if predicate() {
                return true;
            }
            sleep(Duration::from_millis(100)).await;
        }
        predicate()
    }

    #[tokio::test]
    async fn test_out_of_band_edit_triggers_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(path.clone());

        let manager = Arc::new(ForwardManager::new(
            ConfigStore::new(path.clone()),
            Arc::new(KubeCache::new(Arc::new(KubeconfigClientFactory))),
            CancellationToken::new(),
        ));
        manager.initialize().await;
        assert!(manager.get_all().is_empty());

        let mut watcher = ConfigWatcher::new(path, manager.watch_suppress());
        watcher.start(Arc::clone(&manager)).unwrap();

        // Give the watcher a poll cycle to flush the startup events.
        sleep(Duration::from_millis(700)).await;

        let mut definitions = HashMap::new();
        definitions.insert("external".to_string(), socket_def("external", 15432));
        store.save(&definitions).await.unwrap();

        let converged = wait_for(
            || manager.get_by_name("external").is_some(),
            Duration::from_secs(5),
        )
        .await;
        assert!(converged, "manager did not pick up the out-of-band edit");

        watcher.stop();
    }

    #[tokio::test]
    async fn test_skip_flag_suppresses_one_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"forwards": {}}"#).unwrap();

        let skip = Arc::new(AtomicBool::new(false));
        let manager = Arc::new(ForwardManager::new(
            ConfigStore::new(path.clone()),
            Arc::new(KubeCache::new(Arc::new(KubeconfigClientFactory))),
            CancellationToken::new(),
        ));

        let mut watcher = ConfigWatcher::new(path.clone(), Arc::clone(&skip));
        watcher.start(Arc::clone(&manager)).unwrap();
        sleep(Duration::from_millis(700)).await;

        // Pretend the next write is the manager's own save.
        skip.store(true, Ordering::Relaxed);
        std::fs::write(
            &path,
            serde_json::json!({
                "forwards": {
                    "own-save": {
                        "type": "socket",
                        "name": "own-save",
                        "localPort": 15432,
                        "remoteHost": "127.0.0.1",
                        "remotePort": 9,
                    }
                }
            })
            .to_string(),
        )
        .unwrap();

        sleep(Duration::from_millis(1200)).await;
        assert!(manager.get_by_name("own-save").is_none());
        assert!(!skip.load(Ordering::Relaxed), "flag should be consumed");

        watcher.stop();
    }
}

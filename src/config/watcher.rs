//! Route configuration hot reload.
//!
//! The parent directory is watched rather than the file itself, so editors
//! that save by writing a temporary file and renaming it over the original
//! keep triggering reloads.
//!
//! ```text
//! notify callback ──(file touched)──▶ changes ──▶ reload task
//!                                                   │ wait for a quiet period
//!                                                   │ skip identical content
//!                                                   ▼
//!                                              RouterConfig updates
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::loader::parse_config;
use crate::config::schema::RouterConfig;

/// Quiet period after the last change before the file is reloaded.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches one route configuration file.
#[derive(Debug, Clone)]
pub struct ConfigWatcher {
    path: PathBuf,
    debounce: Duration,
}

/// Keeps the file watch and the reload task alive; dropping it stops both.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start watching. The receiver only sees configurations that parsed,
    /// passed validation and differ from the last accepted file content.
    ///
    /// `current` is the content already in use. Must be called within a
    /// Tokio runtime.
    pub fn spawn(
        self,
        current: String,
    ) -> Result<(WatchHandle, mpsc::UnboundedReceiver<RouterConfig>), notify::Error> {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let file_name = self.path.file_name().map(OsString::from).unwrap_or_default();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if touches(&event, &file_name) => {
                    let _ = change_tx.send(());
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, debounce_ms = self.debounce.as_millis() as u64, "Config watcher started");

        let task = tokio::spawn(reload_loop(self.path, self.debounce, current, change_rx, update_tx));
        Ok((
            WatchHandle {
                _watcher: watcher,
                task,
            },
            update_rx,
        ))
    }
}

/// Whether a filesystem event wrote to the watched file.
fn touches(event: &Event, file_name: &OsString) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

/// Turn bursts of change notifications into at most one reload each.
async fn reload_loop(
    path: PathBuf,
    debounce: Duration,
    mut current: String,
    mut changes: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<RouterConfig>,
) {
    while changes.recv().await.is_some() {
        loop {
            match tokio::time::timeout(debounce, changes.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Failed to read config. Keeping current routes.");
                continue;
            }
        };
        if content == current {
            tracing::debug!(path = ?path, "Config content unchanged");
            continue;
        }

        match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = ?path, routes = config.routes.len(), "Config change accepted");
                current = content;
                if updates.send(config).is_err() {
                    return;
                }
            }
            Err(e) => tracing::error!(path = ?path, "Failed to reload config: {}. Keeping current routes.", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind};

    const ONE_ROUTE: &str = "[[routes]]\npath = \"/a\"\n";
    const TWO_ROUTES: &str = "[[routes]]\npath = \"/a\"\n\n[[routes]]\npath = \"/b\"\n";

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    struct Harness {
        dir: tempfile::TempDir,
        changes: mpsc::UnboundedSender<()>,
        updates: mpsc::UnboundedReceiver<RouterConfig>,
    }

    impl Harness {
        fn start(initial: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("routes.toml");
            std::fs::write(&path, initial).unwrap();

            let (changes, change_rx) = mpsc::unbounded_channel();
            let (update_tx, updates) = mpsc::unbounded_channel();
            tokio::spawn(reload_loop(
                path,
                Duration::from_millis(20),
                initial.to_string(),
                change_rx,
                update_tx,
            ));
            Self { dir, changes, updates }
        }

        fn write(&self, content: &str) {
            std::fs::write(self.dir.path().join("routes.toml"), content).unwrap();
            self.changes.send(()).unwrap();
        }

        async fn next(&mut self) -> Option<RouterConfig> {
            tokio::time::timeout(Duration::from_millis(200), self.updates.recv())
                .await
                .ok()
                .flatten()
        }
    }

    #[test]
    fn test_only_writes_to_the_watched_file_count() {
        let name = OsString::from("routes.toml");
        let modify = EventKind::Modify(ModifyKind::Any);

        assert!(touches(&event(modify, "/etc/app/routes.toml"), &name));
        assert!(touches(&event(EventKind::Create(CreateKind::File), "/etc/app/routes.toml"), &name));
        assert!(!touches(&event(modify, "/etc/app/.routes.toml.swp"), &name));
        assert!(!touches(&event(EventKind::Remove(RemoveKind::File), "/etc/app/routes.toml"), &name));
    }

    #[tokio::test]
    async fn test_burst_of_writes_reloads_once() {
        let mut harness = Harness::start(ONE_ROUTE);
        harness.write("[[routes]]\npath = \"/partial\"\n");
        harness.write(TWO_ROUTES);

        let config = harness.next().await.expect("reload after the burst");
        assert_eq!(config.routes.len(), 2);
        assert!(harness.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_and_invalid_content_skipped() {
        let mut harness = Harness::start(ONE_ROUTE);

        harness.write(ONE_ROUTE);
        assert!(harness.next().await.is_none());

        harness.write("routes = 3");
        assert!(harness.next().await.is_none());

        // Valid again after the rejected version
        harness.write(TWO_ROUTES);
        assert_eq!(harness.next().await.map(|c| c.routes.len()), Some(2));
    }
}

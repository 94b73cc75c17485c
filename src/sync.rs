/// Keeps the settings applied to the hardware in step with the remote store.
///
/// Pairs with the staleness watcher: `is_stale` compares the store's current
/// revision with the last applied one, and `update` re-fetches and publishes.
/// A store that fails or returns no data leaves the applied settings as they
/// are; an outage never clears them.
use crate::settings::{Revision, SettingsSnapshot, SettingsStore, UnitSettings};
use crate::watcher::{FailurePolicy, WatchError, WatchHandle, WatchSpec};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Publication point for the settings currently in effect.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<Option<SettingsSnapshot>>>);

impl SharedSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, snapshot: SettingsSnapshot) {
        *self.0.write().await = Some(snapshot);
    }

    /// Revision of the applied settings, `None` before the first update.
    pub async fn revision(&self) -> Option<Revision> {
        self.0.read().await.as_ref().map(|s| s.revision.clone())
    }

    pub async fn unit(&self, unit_id: &str) -> Option<UnitSettings> {
        self.0.read().await.as_ref().and_then(|s| s.unit(unit_id))
    }
}

pub struct SettingsSync<S> {
    store: Arc<S>,
    published: SharedSettings,
}

impl<S> Clone for SettingsSync<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            published: self.published.clone(),
        }
    }
}

impl<S: SettingsStore + 'static> SettingsSync<S> {
    pub fn new(store: Arc<S>, published: SharedSettings) -> Self {
        Self { store, published }
    }

    /// True when the store holds a revision other than the applied one.
    pub async fn is_stale(&self) -> bool {
        match self.store.get_settings().await {
            Ok(Some(snapshot)) => {
                let applied = self.published.revision().await;
                let stale = applied.as_ref() != Some(&snapshot.revision);
                if stale {
                    tracing::debug!(
                        applied = ?applied.as_ref().map(Revision::as_str),
                        current = %snapshot.revision,
                        "settings revision changed"
                    );
                }
                stale
            }
            Ok(None) => {
                tracing::debug!(adapter = self.store.name(), "store has no settings, keeping current");
                false
            }
            Err(e) => {
                tracing::warn!(
                    adapter = self.store.name(),
                    error = %e,
                    "could not check settings revision, keeping current"
                );
                false
            }
        }
    }

    /// Re-fetch the settings and publish them along with their revision.
    pub async fn update(&self) {
        match self.store.get_settings().await {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    adapter = self.store.name(),
                    revision = %snapshot.revision,
                    units = snapshot.data.len(),
                    "applying user settings"
                );
                self.published.publish(snapshot).await;
            }
            Ok(None) => {
                tracing::debug!(adapter = self.store.name(), "store has no settings, keeping current");
            }
            Err(e) => {
                tracing::warn!(
                    adapter = self.store.name(),
                    error = %e,
                    "could not load user settings, keeping current"
                );
            }
        }
    }

    /// Start a watch session that runs this sync every `interval`.
    pub fn watch(&self, interval: Duration, on_failure: FailurePolicy) -> Result<WatchHandle, WatchError> {
        let check = self.clone();
        let apply = self.clone();
        WatchSpec::new(
            move || {
                let sync = check.clone();
                async move { Ok::<bool, Infallible>(sync.is_stale().await) }
            },
            move || {
                let sync = apply.clone();
                async move {
                    sync.update().await;
                    Ok::<(), Infallible>(())
                }
            },
            interval,
        )
        .on_failure(on_failure)
        .start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{FileStore, SettingsError};
    use serde_json::{json, Value};
    use std::path::Path;
    use tempfile::tempdir;

    /// Store that is always unreachable.
    struct DownStore;

    impl SettingsStore for DownStore {
        fn name(&self) -> &str {
            "down"
        }

        async fn get_settings(&self) -> Result<Option<SettingsSnapshot>, SettingsError> {
            Err(SettingsError::Status {
                status: 503,
                body: "service unavailable".to_string(),
            })
        }

        async fn set_data(&self, _key: &str, _value: Value, _root: &str) -> Result<(), SettingsError> {
            Err(SettingsError::Status {
                status: 503,
                body: "service unavailable".to_string(),
            })
        }
    }

    fn write_settings(path: &Path, settings: Value) {
        std::fs::write(path, json!({ "settings": settings }).to_string()).unwrap();
    }

    fn file_sync(path: &Path) -> SettingsSync<FileStore> {
        SettingsSync::new(Arc::new(FileStore::new(path, "settings")), SharedSettings::new())
    }

    #[tokio::test]
    async fn test_stale_until_applied() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        write_settings(&path, json!({ "1": { "chime": 0 } }));
        let sync = file_sync(&path);

        assert!(sync.is_stale().await);
        sync.update().await;
        assert!(!sync.is_stale().await);
        assert!(sync.published.revision().await.is_some());
        assert!(!sync.published.unit("1").await.unwrap().should_ring_bell);
    }

    #[tokio::test]
    async fn test_change_in_store_makes_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        write_settings(&path, json!({ "1": { "chime": 0 } }));
        let sync = file_sync(&path);
        sync.update().await;

        write_settings(&path, json!({ "1": { "chime": 1 } }));
        assert!(sync.is_stale().await);
        sync.update().await;
        assert!(sync.published.unit("1").await.unwrap().should_ring_bell);
    }

    #[tokio::test]
    async fn test_empty_store_keeps_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        write_settings(&path, json!({ "1": { "chime": 0 } }));
        let sync = file_sync(&path);
        sync.update().await;
        let applied = sync.published.revision().await;

        std::fs::remove_file(&path).unwrap();
        assert!(!sync.is_stale().await);
        sync.update().await;
        assert_eq!(sync.published.revision().await, applied);
        assert!(sync.published.unit("1").await.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_not_stale() {
        let sync = SettingsSync::new(Arc::new(DownStore), SharedSettings::new());
        assert!(!sync.is_stale().await);
        sync.update().await;
        assert_eq!(sync.published.revision().await, None);
    }

    #[tokio::test]
    async fn test_watch_applies_and_follows_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        write_settings(&path, json!({ "1": { "chime": 0 } }));
        let sync = file_sync(&path);

        let handle = sync
            .watch(Duration::from_millis(5), FailurePolicy::Stop)
            .unwrap();

        let published = sync.published.clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            while published.unit("1").await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first check should apply settings");
        assert!(!published.unit("1").await.unwrap().should_ring_bell);

        write_settings(&path, json!({ "1": { "chime": 1, "recipients": { "bob": true } } }));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !published.unit("1").await.unwrap().should_ring_bell {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("changed settings should be applied");
        assert_eq!(published.unit("1").await.unwrap().recipients, vec!["bob"]);

        assert_eq!(handle.updates(), 2);
        assert!(handle.last_error().is_none());
        handle.shutdown().await;
    }
}

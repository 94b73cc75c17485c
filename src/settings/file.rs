use super::{Revision, SettingsError, SettingsSnapshot, SettingsStore};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Distinguishes temp files of writes from the same process.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Settings kept in a local JSON document, one top-level key per root.
///
/// Handy on a bench without network access. The revision is a digest of
/// the data under the settings root, so editing the file is picked up by the
/// watcher like a remote change.
pub struct FileStore {
    path: PathBuf,
    root: String,
    /// Held across read-modify-write so concurrent writes don't drop keys.
    writes: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, root: &str) -> Self {
        Self {
            path: path.into(),
            root: root.to_string(),
            writes: Mutex::new(()),
        }
    }

    /// Temp file next to the target, unique per target name and per write.
    fn temp_path(&self) -> PathBuf {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let name = self
            .path
            .file_name()
            .map_or_else(|| "settings".into(), |n| n.to_string_lossy());
        dir.join(format!(
            ".{name}.tmp.{}.{}",
            std::process::id(),
            WRITE_SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    /// Read the whole document; a missing file is an empty document.
    async fn read_document(&self) -> Result<Map<String, Value>, SettingsError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        match serde_json::from_str(&contents)? {
            Value::Object(map) => Ok(map),
            _ => Err(SettingsError::NotAnObject {
                root: "/".to_string(),
            }),
        }
    }

    /// Write the document via temp file + rename so readers never see half of it.
    async fn write_document(&self, document: &Map<String, Value>) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(document)?;
        let tmp_path = self.temp_path();

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .map_err(|e| SettingsError::Io {
                path: tmp_path.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| SettingsError::Io {
                path: self.path.clone(),
                source: e,
            })
    }
}

impl SettingsStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_settings(&self) -> Result<Option<SettingsSnapshot>, SettingsError> {
        let mut document = self.read_document().await?;
        match document.remove(&self.root) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(data)) => {
                let revision = Revision::digest(&data);
                Ok(Some(SettingsSnapshot::new(revision, data)))
            }
            Some(_) => Err(SettingsError::NotAnObject {
                root: self.root.clone(),
            }),
        }
    }

    async fn set_data(&self, key: &str, value: Value, root: &str) -> Result<(), SettingsError> {
        let _write = self.writes.lock().await;
        let mut document = self.read_document().await?;
        let section = document
            .entry(root.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }
        if let Value::Object(section) = section {
            section.insert(key.to_string(), value);
        }
        self.write_document(&document).await?;
        tracing::debug!(path = %self.path.display(), root, key, "wrote file settings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_has_no_settings() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("settings.json"), "settings");
        assert_eq!(store.get_settings().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reads_settings_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"settings": {"1": {"chime": 0}}, "systemSettings": {"units": {"1": 1}}}"#,
        )
        .unwrap();

        let snapshot = FileStore::new(&path, "settings").get_settings().await.unwrap().unwrap();
        assert_eq!(snapshot.data.len(), 1);
        assert!(!snapshot.unit("1").unwrap().should_ring_bell);
    }

    #[tokio::test]
    async fn test_revision_changes_with_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = FileStore::new(&path, "settings");

        store.set_data("1", json!({ "chime": 1 }), "settings").await.unwrap();
        let first = store.get_settings().await.unwrap().unwrap().revision;
        let again = store.get_settings().await.unwrap().unwrap().revision;
        assert_eq!(first, again);

        store.set_data("1", json!({ "chime": 0 }), "settings").await.unwrap();
        let changed = store.get_settings().await.unwrap().unwrap().revision;
        assert_ne!(first, changed);
    }

    #[tokio::test]
    async fn test_set_data_keeps_other_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"settings": {"1": {"chime": 1}}}"#).unwrap();
        let store = FileStore::new(&path, "settings");

        store.set_data("2", json!({ "chime": 0 }), "settings").await.unwrap();
        store.set_data("units", json!({ "1": 1 }), "systemSettings").await.unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["settings"]["1"]["chime"], 1);
        assert_eq!(doc["settings"]["2"]["chime"], 0);
        assert_eq!(doc["systemSettings"]["units"]["1"], 1);
    }

    #[tokio::test]
    async fn test_non_object_root_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"settings": 7}"#).unwrap();

        let err = FileStore::new(&path, "settings").get_settings().await.unwrap_err();
        assert!(matches!(err, SettingsError::NotAnObject { .. }));
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();

        let err = FileStore::new(&path, "settings").get_settings().await.unwrap_err();
        assert!(matches!(err, SettingsError::Json { .. }));
    }

    #[test]
    fn test_temp_paths_are_unique() {
        let dir = tempdir().unwrap();
        let a = FileStore::new(dir.path().join("a.json"), "settings");
        let b = FileStore::new(dir.path().join("b.json"), "settings");

        let first = a.temp_path();
        assert_eq!(first.parent(), Some(dir.path()));
        assert!(first.file_name().unwrap().to_string_lossy().starts_with(".a.json.tmp."));
        assert_ne!(first, a.temp_path());
        assert!(b.temp_path().file_name().unwrap().to_string_lossy().starts_with(".b.json.tmp."));
    }

    #[tokio::test]
    async fn test_concurrent_writes_keep_every_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let other_path = dir.path().join("other.json");
        let store = FileStore::new(&path, "settings");
        let other = FileStore::new(&other_path, "settings");

        let (a, b, c) = tokio::join!(
            store.set_data("1", json!({ "chime": 1 }), "settings"),
            store.set_data("2", json!({ "chime": 0 }), "settings"),
            other.set_data("9", json!({ "chime": 1 }), "settings"),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["settings"]["1"]["chime"], 1);
        assert_eq!(doc["settings"]["2"]["chime"], 0);
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&other_path).unwrap()).unwrap();
        assert_eq!(doc["settings"]["9"]["chime"], 1);

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}

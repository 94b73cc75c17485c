pub mod file;
pub mod firebase;

use crate::config::{Backend, SettingsConfig};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

pub use file::FileStore;
pub use firebase::FirebaseStore;

/// Root under which system-level (not per-user) settings are written.
pub const SYSTEM_ROOT: &str = "systemSettings";

/// Opaque marker of a settings version, used to detect changes without
/// comparing full contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Revision(value.into())
    }

    /// Revision derived from the settings content itself.
    pub fn digest(data: &Map<String, Value>) -> Self {
        let mut hasher = DefaultHasher::new();
        // Map is ordered by key, so equal data serializes identically.
        Value::Object(data.clone()).to_string().hash(&mut hasher);
        Revision(format!("{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything stored under the settings root at one revision.
///
/// `data` maps unit id to that unit's user settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    pub revision: Revision,
    pub data: Map<String, Value>,
}

impl SettingsSnapshot {
    pub fn new(revision: Revision, data: Map<String, Value>) -> Self {
        Self { revision, data }
    }

    /// Settings for one unit, or `None` if the store has nothing for it.
    pub fn unit(&self, unit_id: &str) -> Option<UnitSettings> {
        self.data.get(unit_id).map(UnitSettings::from_value)
    }
}

/// What the residents of one unit asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSettings {
    pub should_ring_bell: bool,
    pub recipients: Vec<String>,
}

impl UnitSettings {
    /// Parse `{ "chime": 0|1, "recipients": { name: ... } }`.
    ///
    /// A missing `chime` means ring; recipients are the keys of `recipients`.
    fn from_value(value: &Value) -> Self {
        let should_ring_bell = match value.get("chime") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64() != Some(0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Null) => false,
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        };
        let recipients = value
            .get("recipients")
            .and_then(Value::as_object)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        Self {
            should_ring_bell,
            recipients,
        }
    }
}

/// A remote settings backend.
pub trait SettingsStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Fetch the current snapshot. `Ok(None)` means the store holds no data.
    fn get_settings(
        &self,
    ) -> impl Future<Output = Result<Option<SettingsSnapshot>, SettingsError>> + Send;

    /// Write `value` at `root/key`, replacing what was there.
    fn set_data(
        &self,
        key: &str,
        value: Value,
        root: &str,
    ) -> impl Future<Output = Result<(), SettingsError>> + Send;
}

/// The configured backend, chosen once at startup.
pub enum Store {
    Firebase(FirebaseStore),
    File(FileStore),
}

impl Store {
    pub fn from_config(config: &SettingsConfig) -> Result<Self, SettingsError> {
        match config.backend {
            Backend::Firebase => {
                let url = config
                    .url
                    .as_deref()
                    .ok_or(SettingsError::Misconfigured("firebase backend needs a url"))?;
                Ok(Store::Firebase(FirebaseStore::new(
                    url,
                    config.auth.clone(),
                    &config.root,
                    config.timeout(),
                )?))
            }
            Backend::File => Ok(Store::File(FileStore::new(&config.path, &config.root))),
        }
    }
}

impl SettingsStore for Store {
    fn name(&self) -> &str {
        match self {
            Store::Firebase(s) => s.name(),
            Store::File(s) => s.name(),
        }
    }

    async fn get_settings(&self) -> Result<Option<SettingsSnapshot>, SettingsError> {
        match self {
            Store::Firebase(s) => s.get_settings().await,
            Store::File(s) => s.get_settings().await,
        }
    }

    async fn set_data(&self, key: &str, value: Value, root: &str) -> Result<(), SettingsError> {
        match self {
            Store::Firebase(s) => s.set_data(key, value, root).await,
            Store::File(s) => s.set_data(key, value, root).await,
        }
    }
}

/// Look up one unit's settings straight from the store.
///
/// Store failures are logged and reported as `None`, like a unit with no data.
pub async fn unit_settings<S: SettingsStore>(store: &S, unit_id: &str) -> Option<UnitSettings> {
    tracing::info!(adapter = store.name(), unit = unit_id, "getting user settings");
    match store.get_settings().await {
        Ok(snapshot) => snapshot.and_then(|s| s.unit(unit_id)),
        Err(e) => {
            tracing::warn!(adapter = store.name(), error = %e, "could not load user settings");
            None
        }
    }
}

/// Register the wired units with the store and return the fresh snapshot.
///
/// Writes `systemSettings/units = { "<id>": 1, ... }`.
pub async fn init_data<S: SettingsStore>(
    store: &S,
    unit_ids: &[&str],
) -> Result<Option<SettingsSnapshot>, SettingsError> {
    let units: Map<String, Value> = unit_ids
        .iter()
        .map(|id| (id.to_string(), Value::from(1)))
        .collect();
    tracing::info!(adapter = store.name(), units = unit_ids.len(), "initialising system settings");
    store.set_data("units", Value::Object(units), SYSTEM_ROOT).await?;
    store.get_settings().await
}

/// Errors produced by settings stores.
#[derive(Debug)]
pub enum SettingsError {
    Http {
        source: reqwest::Error,
    },
    Status {
        status: u16,
        body: String,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Json {
        source: serde_json::Error,
    },
    /// The data under `root` is not a JSON object.
    NotAnObject {
        root: String,
    },
    Misconfigured(&'static str),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Http { source } => write!(f, "HTTP error: {source}"),
            SettingsError::Status { status, body } => {
                write!(f, "settings store returned {status}: {body}")
            }
            SettingsError::Io { path, source } => {
                write!(f, "I/O error on {}: {source}", path.display())
            }
            SettingsError::Json { source } => write!(f, "invalid settings JSON: {source}"),
            SettingsError::NotAnObject { root } => {
                write!(f, "settings under {root:?} are not a JSON object")
            }
            SettingsError::Misconfigured(msg) => write!(f, "misconfigured settings store: {msg}"),
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Http { source } => Some(source),
            SettingsError::Io { source, .. } => Some(source),
            SettingsError::Json { source } => Some(source),
            SettingsError::Status { .. }
            | SettingsError::NotAnObject { .. }
            | SettingsError::Misconfigured(_) => None,
        }
    }
}

impl From<reqwest::Error> for SettingsError {
    fn from(e: reqwest::Error) -> Self {
        SettingsError::Http { source: e }
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(e: serde_json::Error) -> Self {
        SettingsError::Json { source: e }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_unit_settings_defaults_to_ringing() {
        let snapshot = SettingsSnapshot::new(Revision::new("r1"), object(json!({ "1": {} })));
        assert_eq!(
            snapshot.unit("1"),
            Some(UnitSettings {
                should_ring_bell: true,
                recipients: vec![],
            })
        );
    }

    #[test]
    fn test_unit_settings_chime_and_recipients() {
        let snapshot = SettingsSnapshot::new(
            Revision::new("r1"),
            object(json!({
                "1": { "chime": 0, "recipients": { "alice": true, "bob": "sms" } },
                "2": { "chime": 1 },
                "3": { "chime": false },
            })),
        );
        let one = snapshot.unit("1").unwrap();
        assert!(!one.should_ring_bell);
        assert_eq!(one.recipients, vec!["alice", "bob"]);
        assert!(snapshot.unit("2").unwrap().should_ring_bell);
        assert!(!snapshot.unit("3").unwrap().should_ring_bell);
    }

    #[test]
    fn test_unknown_unit_has_no_settings() {
        let snapshot = SettingsSnapshot::new(Revision::new("r1"), object(json!({ "1": {} })));
        assert_eq!(snapshot.unit("9"), None);
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = object(json!({ "1": { "chime": 1 } }));
        let b = object(json!({ "1": { "chime": 0 } }));
        assert_eq!(Revision::digest(&a), Revision::digest(&a.clone()));
        assert_ne!(Revision::digest(&a), Revision::digest(&b));
        assert_eq!(Revision::digest(&a).as_str().len(), 16);
    }

    #[test]
    fn test_store_from_config_requires_url() {
        let config = SettingsConfig::default();
        let err = Store::from_config(&config).err().unwrap();
        assert!(matches!(err, SettingsError::Misconfigured(_)));
    }

    #[test]
    fn test_store_from_config_selects_backend() {
        let config = SettingsConfig {
            backend: Backend::File,
            ..Default::default()
        };
        let store = Store::from_config(&config).unwrap();
        assert_eq!(store.name(), "file");

        let config = SettingsConfig {
            url: Some("https://gate.firebaseio.com".to_string()),
            ..Default::default()
        };
        let store = Store::from_config(&config).unwrap();
        assert_eq!(store.name(), "firebase");
    }

    #[tokio::test]
    async fn test_init_data_registers_units() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"settings": {"1": {"chime": 1}}}"#).unwrap();
        let store = FileStore::new(&path, "settings");

        let snapshot = init_data(&store, &["1", "2"]).await.unwrap().unwrap();
        assert!(snapshot.unit("1").is_some());

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["systemSettings"]["units"], json!({ "1": 1, "2": 1 }));
    }

    #[tokio::test]
    async fn test_unit_settings_swallows_store_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        let store = FileStore::new(&path, "settings");

        assert_eq!(unit_settings(&store, "1").await, None);
    }
}

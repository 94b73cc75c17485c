use super::{Revision, SettingsError, SettingsSnapshot, SettingsStore};
use serde_json::Value;
use std::time::Duration;

/// Firebase Realtime Database over its REST API.
///
/// Reads ask for an ETag (`X-Firebase-ETag: true`), which becomes the
/// snapshot revision. Without one, the revision falls back to a digest of
/// the returned data.
pub struct FirebaseStore {
    client: reqwest::Client,
    url: String,
    auth: Option<String>,
    root: String,
}

impl FirebaseStore {
    pub fn new(
        url: &str,
        auth: Option<String>,
        root: &str,
        timeout: Duration,
    ) -> Result<Self, SettingsError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            auth,
            root: root.to_string(),
        })
    }

    /// REST endpoint for a database path, e.g. `{url}/settings.json`.
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}.json", self.url, path.trim_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(auth) => request.query(&[("auth", auth)]),
            None => request,
        }
    }

    /// Turn a non-2xx response into an error, keeping the body for the log.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SettingsError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SettingsError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

impl SettingsStore for FirebaseStore {
    fn name(&self) -> &str {
        "firebase"
    }

    async fn get_settings(&self) -> Result<Option<SettingsSnapshot>, SettingsError> {
        let request = self
            .client
            .get(self.endpoint(&self.root))
            .header("X-Firebase-ETag", "true");
        let response = Self::check(self.authorize(request).send().await?).await?;

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let value: Value = response.json().await?;

        let data = match value {
            Value::Null => return Ok(None),
            Value::Object(map) => map,
            _ => {
                return Err(SettingsError::NotAnObject {
                    root: self.root.clone(),
                })
            }
        };
        let revision = etag
            .map(Revision::new)
            .unwrap_or_else(|| Revision::digest(&data));
        tracing::debug!(%revision, units = data.len(), "fetched firebase settings");
        Ok(Some(SettingsSnapshot::new(revision, data)))
    }

    async fn set_data(&self, key: &str, value: Value, root: &str) -> Result<(), SettingsError> {
        let path = format!("{}/{}", root.trim_matches('/'), key.trim_matches('/'));
        let request = self.client.put(self.endpoint(&path)).json(&value);
        Self::check(self.authorize(request).send().await?).await?;
        tracing::debug!(path = %path, "wrote firebase settings");
        Ok(())
    }
}

use std::time::Duration;

use serde::Deserialize;

/// Client for the object-storage sidecar. The gateway never serves file
/// bytes itself: uploads stream the decoded payload to the sidecar, reads
/// mint a time-limited signed URL, deletes remove the stored object after
/// the metadata record is gone.
#[derive(Clone)]
pub struct StorageClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug)]
pub enum StorageError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Timeout => write!(f, "storage request timed out"),
            StorageError::Http(err) => write!(f, "storage HTTP error: {}", err),
            StorageError::BadStatus(status) => write!(f, "storage returned status {}", status),
            StorageError::InvalidResponse => write!(f, "storage returned invalid JSON response"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<reqwest::Error> for StorageError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            StorageError::Timeout
        } else {
            StorageError::Http(value)
        }
    }
}

#[derive(Deserialize)]
struct SignResponse {
    url: String,
}

impl StorageClient {
    pub fn new(
        base_url: String,
        timeout: Duration,
        token: Option<String>,
    ) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(StorageError::Http)?;

        Ok(Self {
            base_url,
            token,
            http,
        })
    }

    pub async fn ready(&self) -> Result<(), StorageError> {
        let url = format!("{}/healthz", self.base_url.trim_end_matches('/'));
        let resp = self.authorized(self.http.get(url)).send().await?;
        if !resp.status().is_success() {
            return Err(StorageError::BadStatus(resp.status()));
        }
        Ok(())
    }

    pub async fn put_object(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let url = self.object_url(path);
        let resp = self.authorized(self.http.put(url)).body(bytes).send().await?;
        if !resp.status().is_success() {
            return Err(StorageError::BadStatus(resp.status()));
        }
        Ok(())
    }

    pub async fn delete_object(&self, path: &str) -> Result<(), StorageError> {
        let url = self.object_url(path);
        let resp = self.authorized(self.http.delete(url)).send().await?;
        // Idempotent: a missing object is already the desired state.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::BadStatus(resp.status()));
        }
        Ok(())
    }

    pub async fn signed_get_url(
        &self,
        path: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let url = format!("{}/v1/sign", self.base_url.trim_end_matches('/'));
        let resp = self
            .authorized(self.http.post(url))
            .json(&serde_json::json!({
                "path": path,
                "method": "GET",
                "ttl_secs": ttl.as_secs(),
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(StorageError::BadStatus(resp.status()));
        }

        let decoded = resp
            .json::<SignResponse>()
            .await
            .map_err(|_| StorageError::InvalidResponse)?;

        Ok(decoded.url)
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/v1/objects/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

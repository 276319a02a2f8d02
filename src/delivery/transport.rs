use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{debug, info};

use crate::error_handling::types::TransportError;

use super::envelope::Envelope;

/// Status and headers of a sent envelope. Header names are lowercase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
}

impl TransportResponse {
    pub fn new(status_code: Option<u16>, headers: HashMap<String, String>) -> Self {
        Self {
            status_code,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Some(200), HashMap::new())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// A response without a status code counts as success.
    pub fn is_success(&self) -> bool {
        self.status_code
            .map(|code| (200..300).contains(&code))
            .unwrap_or(true)
    }
}

/// Sends serialized envelopes to the collection backend.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<TransportResponse, TransportError>;
}

/// Posts envelopes to an HTTP endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("replay-recorder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: &Envelope) -> Result<TransportResponse, TransportError> {
        let body = envelope
            .to_bytes()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        debug!("Posting {} byte envelope to {}", body.len(), self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/x-sentry-envelope")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        Ok(TransportResponse::new(Some(response.status().as_u16()), headers))
    }
}

/// Writes each envelope to its own file under a directory.
pub struct FileTransport {
    dir: PathBuf,
    sent: AtomicU64,
}

impl FileTransport {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, TransportError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        info!("Writing replay envelopes to {}", dir.display());
        Ok(Self {
            dir,
            sent: AtomicU64::new(0),
        })
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn send(&self, envelope: &Envelope) -> Result<TransportResponse, TransportError> {
        let body = envelope
            .to_bytes()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let index = self.sent.fetch_add(1, Ordering::SeqCst);
        let path = self
            .dir
            .join(format!("{}-{:04}.envelope", envelope.header.event_id, index));
        tokio::fs::write(&path, &body).await?;
        debug!("Wrote {} byte envelope to {}", body.len(), path.display());
        Ok(TransportResponse::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn response_headers_are_case_insensitive() {
        let response = TransportResponse::new(
            Some(204),
            HashMap::from([("Retry-After".to_string(), "5".to_string())]),
        );
        assert_eq!(response.header("retry-after"), Some("5"));
        assert_eq!(response.header("RETRY-AFTER"), Some("5"));
        assert!(response.is_success());
        assert!(!TransportResponse::new(Some(413), HashMap::new()).is_success());
    }

    #[tokio::test]
    async fn file_transport_writes_one_file_per_envelope() {
        let dir = TempDir::new().unwrap();
        let transport = FileTransport::new(dir.path()).unwrap();
        let envelope = Envelope::new("abc".into(), "2024-01-01T00:00:00Z".into(), None);

        transport.send(&envelope).await.unwrap();
        transport.send(&envelope).await.unwrap();
        assert_eq!(transport.sent_count(), 2);
        assert!(dir.path().join("abc-0001.envelope").exists());
    }
}

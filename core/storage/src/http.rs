//! HTTP remote store client.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use anchorsync_common::{Digest, Error, Result};

use crate::provider::{ColumnInfo, RemoteFile, RemoteRecord, RemoteStore, UploadRecord};

/// Characters escaped inside one path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Timeout for metadata and record exchanges.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for record pulls, which may carry the whole history.
const LOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Remote store reached over HTTP.
pub struct HttpRemote {
    http: Client,
    base: Url,
}

impl HttpRemote {
    /// Create a new client for the given base URL.
    ///
    /// # Errors
    /// - Invalid base URL
    /// - HTTP client construction failure
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid remote URL '{}': {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent("AnchorSync/0.1")
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolve a relative endpoint against the base URL.
    fn endpoint(&self, relative: &str) -> Result<Url> {
        self.base
            .join(relative)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint '{}': {}", relative, e)))
    }

    /// URL of a file: its path relative to the base, every segment
    /// percent-encoded.
    fn file_url(&self, path: &str) -> Result<Url> {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        if segments.iter().any(|s| matches!(*s, "" | "." | "..")) {
            return Err(Error::InvalidInput(format!("Invalid file path '{}'", path)));
        }

        let encoded: Vec<String> = segments
            .into_iter()
            .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
            .collect();
        self.endpoint(&encoded.join("/"))
    }

    fn digest_query(expected: Option<Digest>) -> [(&'static str, String); 1] {
        [("digest", expected.map(|d| d.to_hex()).unwrap_or_default())]
    }

    /// Map a non-success response onto the error taxonomy.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT => Err(Error::Conflict(body)),
            StatusCode::NOT_FOUND => Err(Error::NotFound(body)),
            _ => Err(Error::RemoteRejected {
                status: status.as_u16(),
                message: body,
            }),
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
    }
}

fn network(context: &str, e: reqwest::Error) -> Error {
    Error::Network(format!("{}: {}", context, e))
}

#[async_trait]
impl RemoteStore for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        let response = self
            .http
            .get(self.endpoint("files.json")?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| network("Failed to list files", e))?;

        Self::handle_response(response).await
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        debug!("GET {}", path);
        let response = self
            .http
            .get(self.file_url(path)?)
            .send()
            .await
            .map_err(|e| network("Failed to download file", e))?;

        let bytes = Self::check_status(response)
            .await?
            .bytes()
            .await
            .map_err(|e| network("Failed to read file body", e))?;
        Ok(bytes.to_vec())
    }

    async fn upload_file(&self, path: &str, data: Vec<u8>, expected: Option<Digest>) -> Result<()> {
        debug!("PUT {} ({} bytes)", path, data.len());
        let response = self
            .http
            .put(self.file_url(path)?)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .query(&Self::digest_query(expected))
            .body(data)
            .send()
            .await
            .map_err(|e| network("Failed to upload file", e))?;

        Self::check_status(response).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str, expected: Option<Digest>) -> Result<()> {
        debug!("DELETE {}", path);
        let response = self
            .http
            .delete(self.file_url(path)?)
            .query(&Self::digest_query(expected))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| network("Failed to delete file", e))?;

        match Self::check_status(response).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn sync_records(&self, uploads: Vec<UploadRecord>) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint("records/sync")?)
            .json(&uploads)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| network("Failed to upload records", e))?;

        Self::check_status(response).await?;
        Ok(())
    }

    async fn load_columns(&self, anchor: i64) -> Result<Vec<ColumnInfo>> {
        let response = self
            .http
            .get(self.endpoint("records/columns")?)
            .query(&[("anchor", anchor)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| network("Failed to load columns", e))?;

        Self::handle_response(response).await
    }

    async fn load_records(&self, anchor: i64) -> Result<Vec<RemoteRecord>> {
        let response = self
            .http
            .get(self.endpoint("records/load")?)
            .query(&[("anchor", anchor)])
            .timeout(LOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| network("Failed to load records", e))?;

        Self::handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let remote = HttpRemote::new("https://example.org/demo").unwrap();
        assert_eq!(remote.base_url().as_str(), "https://example.org/demo/");
    }

    #[test]
    fn test_file_url_encodes_segments() {
        let remote = HttpRemote::new("https://example.org/demo/").unwrap();
        let url = remote.file_url("/docs/my report#1.pdf").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.org/demo/docs/my%20report%231.pdf"
        );

        // A colon in the first segment must not read as a URL scheme.
        let url = remote.file_url("notes:today.txt").unwrap();
        assert_eq!(url.as_str(), "https://example.org/demo/notes%3Atoday.txt");
    }

    #[test]
    fn test_file_url_rejects_dot_segments() {
        let remote = HttpRemote::new("https://example.org/demo/").unwrap();
        assert!(matches!(remote.file_url("../secret"), Err(Error::InvalidInput(_))));
        assert!(matches!(remote.file_url("a//b"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpRemote::new("not a url"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_digest_query() {
        let query = HttpRemote::digest_query(None);
        assert_eq!(query[0], ("digest", String::new()));
    }
}

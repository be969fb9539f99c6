use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::delete::DeleteReport;
use crate::listing::encode_path;
use crate::paths::RelPath;
use crate::upload::{Transport, TransferError, UploadItem};

pub const UPLOAD_KEY_HEADER: &str = "X-Upload-Key";
pub const DELETE_KEY_HEADER: &str = "X-Delete-Key";

/// HTTP client for a running server.
#[derive(Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    base: String,
}

impl HttpClient {
    pub fn new(base: &str) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("fileshelf/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(network)?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Ask the server whether `key` may write into `dir` before sending
    /// anything.
    pub async fn validate_upload_key(&self, dir: &RelPath, key: &str) -> Result<(), TransferError> {
        let response = self
            .http
            .post(self.url("api/validate-upload-key"))
            .json(&json!({ "path": dir.as_str(), "key": key }))
            .send()
            .await
            .map_err(network)?;
        ensure_success(response.status().as_u16())
    }

    /// Entry names of `dir`, as the server lists them.
    pub async fn list_names(&self, dir: &RelPath) -> Result<Vec<String>, TransferError> {
        #[derive(Deserialize)]
        struct Entry {
            name: String,
        }
        #[derive(Deserialize)]
        struct Listing {
            entries: Vec<Entry>,
        }

        let response = self
            .http
            .get(self.url("api/list"))
            .query(&[("path", dir.as_str())])
            .send()
            .await
            .map_err(network)?;
        ensure_success(response.status().as_u16())?;
        let listing: Listing = decode(response).await?;
        Ok(listing.entries.into_iter().map(|e| e.name).collect())
    }

    /// A 207 still carries a full report.
    pub async fn delete_items(&self, items: &[String], key: &str) -> Result<DeleteReport, TransferError> {
        let response = self
            .http
            .post(self.url("api/delete-items"))
            .header(DELETE_KEY_HEADER, key)
            .json(&json!({ "items_to_delete": items }))
            .send()
            .await
            .map_err(network)?;
        match response.status().as_u16() {
            200 | 207 => decode(response).await,
            status => Err(TransferError::Rejected(status)),
        }
    }
}

impl Transport for HttpClient {
    async fn send_file(
        &self,
        item: &UploadItem,
        target: &RelPath,
        key: &str,
        progress: mpsc::UnboundedSender<u64>,
    ) -> Result<u16, TransferError> {
        let file = tokio::fs::File::open(&item.source).await?;
        let mut sent = 0u64;
        let body = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                let _ = progress.send(sent);
            }
            chunk
        });

        debug!(target = %target, size = item.size, "Sending file");
        let response = self
            .http
            .post(self.url(&format!("upload/{}", encode_path(target))))
            .header(UPLOAD_KEY_HEADER, key)
            .header(CONTENT_LENGTH, item.size)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(network)?;
        Ok(response.status().as_u16())
    }

    async fn set_protection(&self, path: &RelPath, password: &str, key: &str) -> Result<(), TransferError> {
        let response = self
            .http
            .post(self.url("api/set-path-protection"))
            .json(&json!({ "path": path.as_str(), "password": password, "key": key }))
            .send()
            .await
            .map_err(network)?;
        ensure_success(response.status().as_u16())
    }
}

fn network(e: reqwest::Error) -> TransferError {
    TransferError::Network(e.to_string())
}

fn ensure_success(status: u16) -> Result<(), TransferError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(TransferError::Rejected(status))
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransferError> {
    response.json::<T>().await.map_err(network)
}

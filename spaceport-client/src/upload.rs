//! File uploads and reinsertion of their handles into argument trees.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use spaceport_core::blob::{
    Blob, BlobContent, BlobRef, PayloadValue, update_at_path, uploaded_replacement,
};
use tracing::{debug, warn};

/// Errors from a single upload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UploadError {
    #[error("Upload request failed: {message}")]
    Request { message: String },

    #[error("Upload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Upload response was not understood: {message}")]
    InvalidResponse { message: String },
}

/// Sends one file to the app and returns the server's handle for it.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, root: &str, blob: &Blob, token: Option<&str>)
    -> Result<Value, UploadError>;
}

/// Multipart upload to `{root}/upload`.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    http: reqwest::Client,
}

impl HttpUploader {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        root: &str,
        blob: &Blob,
        token: Option<&str>,
    ) -> Result<Value, UploadError> {
        let part = reqwest::multipart::Part::bytes(blob.data.to_vec())
            .file_name(blob.name.clone().unwrap_or_else(|| "blob".to_string()))
            .mime_str(blob.mime_or_default())
            .map_err(|e| UploadError::Request {
                message: format!("MIME error: {e}"),
            })?;
        let form = reqwest::multipart::Form::new().part("files", part);

        let url = format!("{}/upload", root.trim_end_matches('/'));
        let mut request = self.http.post(&url).multipart(form);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| UploadError::Request {
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let handles: Vec<Value> =
            response
                .json()
                .await
                .map_err(|e| UploadError::InvalidResponse {
                    message: e.to_string(),
                })?;
        handles
            .into_iter()
            .next()
            .ok_or_else(|| UploadError::InvalidResponse {
                message: "empty handle list".to_string(),
            })
    }
}

/// Outcome of resolving one extracted leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Inline(String),
    Uploaded(Value),
    Failed(UploadError),
}

/// Upload every leaf that needs it, concurrently. Results line up with `refs`.
pub async fn resolve_blobs(
    uploader: &dyn Uploader,
    root: &str,
    refs: &[BlobRef],
    token: Option<&str>,
) -> Vec<Resolution> {
    let pending = refs.iter().map(|blob_ref| async move {
        match &blob_ref.content {
            BlobContent::Inline(text) => Resolution::Inline(text.clone()),
            BlobContent::Upload(blob) => match uploader.upload(root, blob, token).await {
                Ok(handle) => Resolution::Uploaded(handle),
                Err(e) => {
                    warn!(error = %e, "Blob upload failed");
                    Resolution::Failed(e)
                }
            },
        }
    });
    join_all(pending).await
}

/// Build the wire argument list: a JSON skeleton of `args` with each binary
/// leaf replaced by its resolution. A failed upload leaves its error message
/// at the leaf's position.
pub fn reinsert(args: &[PayloadValue], refs: &[BlobRef], resolutions: Vec<Resolution>) -> Vec<Value> {
    let mut root = PayloadValue::Array(args.to_vec()).to_skeleton();
    for (blob_ref, resolution) in refs.iter().zip(resolutions) {
        let replacement = match resolution {
            Resolution::Inline(text) => Value::String(text),
            Resolution::Uploaded(handle) => uploaded_replacement(blob_ref, handle),
            Resolution::Failed(e) => Value::String(e.to_string()),
        };
        if !update_at_path(&mut root, &blob_ref.path, replacement) {
            debug!(path = ?blob_ref.path, "Blob path vanished from skeleton");
        }
    }
    match root {
        Value::Array(items) => items,
        other => vec![other],
    }
}

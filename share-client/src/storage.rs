//! Storage collaborators: the durable worker (upload/delete by URL) and public external hosts.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use share_core::OutgoingFile;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("storage is not configured")]
    NotConfigured,
    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Rejected(String),
    #[error("storage returned no url")]
    EmptyResponse,
    #[error("unexpected response: {0}")]
    BadResponse(String),
}

#[async_trait]
pub trait DurableStorage: Send + Sync {
    fn is_configured(&self) -> bool;
    fn max_file_size(&self) -> u64;
    async fn upload(&self, file: &OutgoingFile) -> Result<String, UploadError>;
    async fn delete(&self, reference: &str) -> Result<bool, UploadError>;
}

#[async_trait]
pub trait ExternalStorage: Send + Sync {
    fn name(&self) -> &str;
    async fn upload(&self, file: &OutgoingFile) -> Result<String, UploadError>;
}

fn file_part(file: &OutgoingFile) -> Result<Form, UploadError> {
    let part = Part::bytes(file.data.clone())
        .file_name(file.name.clone())
        .mime_str(&file.content_type)?;
    Ok(Form::new().part("file", part))
}

/// HTTP storage worker: `POST /upload` (multipart `file`), `DELETE /delete-file`.
pub struct WorkerStorage {
    client: reqwest::Client,
    base_url: Option<String>,
    max_size: u64,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    url: Option<String>,
    error: Option<String>,
}

impl WorkerStorage {
    pub fn new(base_url: Option<String>, max_size: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            max_size,
        }
    }

    fn endpoint(&self, path: &str) -> Result<String, UploadError> {
        self.base_url
            .as_deref()
            .map(|b| format!("{}/{}", b, path))
            .ok_or(UploadError::NotConfigured)
    }
}

#[async_trait]
impl DurableStorage for WorkerStorage {
    fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    fn max_file_size(&self) -> u64 {
        self.max_size
    }

    async fn upload(&self, file: &OutgoingFile) -> Result<String, UploadError> {
        let url = self.endpoint("upload")?;
        if file.size() > self.max_size {
            return Err(UploadError::TooLarge {
                size: file.size(),
                limit: self.max_size,
            });
        }
        let resp = self
            .client
            .post(&url)
            .multipart(file_part(file)?)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(UploadError::Rejected(format!("{}: {}", status, body.trim())));
        }
        let url = parse_worker_response(&body)?;
        info!(file = %file.name, %url, "uploaded to storage worker");
        Ok(url)
    }

    async fn delete(&self, reference: &str) -> Result<bool, UploadError> {
        let url = self.endpoint("delete-file")?;
        let resp = self
            .client
            .delete(&url)
            .json(&json!({ "fileId": reference }))
            .send()
            .await?;
        debug!(file_id = %reference, status = %resp.status(), "storage delete");
        Ok(resp.status().is_success())
    }
}

fn parse_worker_response(body: &str) -> Result<String, UploadError> {
    let parsed: UploadResponse =
        serde_json::from_str(body).map_err(|e| UploadError::BadResponse(e.to_string()))?;
    if !parsed.success {
        return Err(UploadError::Rejected(
            parsed.error.unwrap_or_else(|| "upload failed".into()),
        ));
    }
    parsed
        .url
        .filter(|u| !u.is_empty())
        .ok_or(UploadError::EmptyResponse)
}

/// 0x0.st: multipart `file`, plain-text URL in the body.
pub struct ZeroXZero {
    client: reqwest::Client,
    url: String,
}

impl Default for ZeroXZero {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: "https://0x0.st".into(),
        }
    }
}

#[async_trait]
impl ExternalStorage for ZeroXZero {
    fn name(&self) -> &str {
        "0x0.st"
    }

    async fn upload(&self, file: &OutgoingFile) -> Result<String, UploadError> {
        let resp = self
            .client
            .post(&self.url)
            .multipart(file_part(file)?)
            .send()
            .await?
            .error_for_status()?;
        parse_text_url(&resp.text().await?)
    }
}

fn parse_text_url(body: &str) -> Result<String, UploadError> {
    let url = body.trim();
    if url.is_empty() {
        return Err(UploadError::EmptyResponse);
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(UploadError::BadResponse(url.chars().take(80).collect()));
    }
    Ok(url.to_string())
}

/// file.io: multipart `file`, JSON body with `link`.
pub struct FileIo {
    client: reqwest::Client,
    url: String,
}

impl Default for FileIo {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: "https://file.io/".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileIoResponse {
    link: Option<String>,
}

#[async_trait]
impl ExternalStorage for FileIo {
    fn name(&self) -> &str {
        "file.io"
    }

    async fn upload(&self, file: &OutgoingFile) -> Result<String, UploadError> {
        let resp = self
            .client
            .post(&self.url)
            .multipart(file_part(file)?)
            .send()
            .await?
            .error_for_status()?;
        parse_file_io(&resp.text().await?)
    }
}

fn parse_file_io(body: &str) -> Result<String, UploadError> {
    let parsed: FileIoResponse =
        serde_json::from_str(body).map_err(|e| UploadError::BadResponse(e.to_string()))?;
    parsed
        .link
        .filter(|l| !l.is_empty())
        .ok_or(UploadError::EmptyResponse)
}

/// The public hosts in fallback order.
pub fn default_external() -> Vec<Box<dyn ExternalStorage>> {
    vec![Box::new(ZeroXZero::default()), Box::new(FileIo::default())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_response_variants() {
        assert_eq!(
            parse_worker_response(r#"{"success":true,"url":"https://w/files/1"}"#).unwrap(),
            "https://w/files/1"
        );
        assert!(matches!(
            parse_worker_response(r#"{"success":false,"error":"too big"}"#),
            Err(UploadError::Rejected(e)) if e == "too big"
        ));
        assert!(matches!(
            parse_worker_response(r#"{"success":true}"#),
            Err(UploadError::EmptyResponse)
        ));
        assert!(matches!(
            parse_worker_response("<html>"),
            Err(UploadError::BadResponse(_))
        ));
    }

    #[test]
    fn external_response_parsing() {
        assert_eq!(parse_text_url("https://0x0.st/abc.txt\n").unwrap(), "https://0x0.st/abc.txt");
        assert!(matches!(parse_text_url("  \n"), Err(UploadError::EmptyResponse)));
        assert!(matches!(parse_text_url("error"), Err(UploadError::BadResponse(_))));
        assert_eq!(
            parse_file_io(r#"{"success":true,"link":"https://file.io/x"}"#).unwrap(),
            "https://file.io/x"
        );
        assert!(matches!(parse_file_io("{}"), Err(UploadError::EmptyResponse)));
    }

    #[tokio::test]
    async fn unconfigured_worker_refuses_without_network() {
        let w = WorkerStorage::new(Some(String::new()), 10);
        assert!(!w.is_configured());
        let file = OutgoingFile::new("a", "text/plain", vec![0; 4]);
        assert!(matches!(w.upload(&file).await, Err(UploadError::NotConfigured)));
        assert!(matches!(w.delete("x").await, Err(UploadError::NotConfigured)));
    }

    #[tokio::test]
    async fn oversized_upload_is_refused_locally() {
        let w = WorkerStorage::new(Some("http://127.0.0.1:9".into()), 3);
        let file = OutgoingFile::new("a", "text/plain", vec![0; 4]);
        assert!(matches!(
            w.upload(&file).await,
            Err(UploadError::TooLarge { size: 4, limit: 3 })
        ));
    }
}

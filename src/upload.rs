use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::trace::Span;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct UploadError {
    pub code: String,
    pub message: String,
    pub file_name: String,
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for UploadError {}

fn err(code: &str, message: impl Into<String>, file_name: &str) -> UploadError {
    UploadError {
        code: code.to_string(),
        message: message.into(),
        file_name: file_name.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub content_type: String,
    pub correlation_id: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileRef {
    pub url: String,
}

#[derive(Debug, Serialize)]
struct PresignReq<'a> {
    filename: &'a str,
    content_type: &'a str,
    correlation_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct PresignResp {
    url: String,
}

pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn upload(
        &self,
        req: UploadRequest,
        progress: ProgressFn,
    ) -> Result<RemoteFileRef, UploadError>;
}

pub struct HttpUploadCoordinator {
    client: Client,
    api_base: String,
    chunk_bytes: usize,
    data_dir: PathBuf,
    session_id: String,
}

impl HttpUploadCoordinator {
    pub fn new(
        client: Client,
        api_base: String,
        chunk_bytes: usize,
        data_dir: PathBuf,
        session_id: String,
    ) -> Self {
        Self {
            client,
            api_base,
            chunk_bytes: chunk_bytes.max(1),
            data_dir,
            session_id,
        }
    }
}

fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent.min(total) * 100) / total) as u8
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{head}...(truncated)")
}

fn object_url(presigned: &str) -> String {
    presigned
        .split('?')
        .next()
        .unwrap_or(presigned)
        .to_string()
}

#[async_trait]
impl UploadApi for HttpUploadCoordinator {
    async fn upload(
        &self,
        req: UploadRequest,
        progress: ProgressFn,
    ) -> Result<RemoteFileRef, UploadError> {
        let span = Span::start(
            &self.data_dir,
            Some(&self.session_id),
            "Upload",
            "UPLOAD.transfer",
            Some(serde_json::json!({
                "file_name": req.file_name,
                "content_type": req.content_type,
                "correlation_id": req.correlation_id,
                "bytes": req.bytes.len(),
            })),
        );

        let out = self.upload_inner(req, progress).await;
        match &out {
            Ok(v) => span.ok(Some(serde_json::json!({ "remote_url": v.url }))),
            Err(e) => span.err("http", &e.code, &e.message, None),
        }
        out
    }
}

impl HttpUploadCoordinator {
    async fn upload_inner(
        &self,
        req: UploadRequest,
        progress: ProgressFn,
    ) -> Result<RemoteFileRef, UploadError> {
        let file_name = req.file_name.clone();

        // Phase 1: ask the backend for a write target.
        let issue_url = format!("{}/get_presigned_url", self.api_base);
        let resp = self
            .client
            .post(issue_url)
            .json(&PresignReq {
                filename: &req.file_name,
                content_type: &req.content_type,
                correlation_id: &req.correlation_id,
            })
            .send()
            .await
            .map_err(|e| {
                err(
                    "E_UPLOAD_TARGET_HTTP_SEND",
                    format!("presigned url request failed: {e}"),
                    &file_name,
                )
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            err(
                "E_UPLOAD_TARGET_PARSE",
                format!("read presigned url response failed: {e}"),
                &file_name,
            )
        })?;
        if !status.is_success() {
            let code = format!("E_UPLOAD_TARGET_HTTP_STATUS_{}", status.as_u16());
            return Err(err(
                &code,
                truncate_chars(&body, MAX_ERROR_BODY_CHARS),
                &file_name,
            ));
        }
        let target: PresignResp = serde_json::from_str(&body).map_err(|e| {
            err(
                "E_UPLOAD_TARGET_PARSE",
                format!("invalid presigned url response: {e}"),
                &file_name,
            )
        })?;

        // Phase 2: raw byte transfer to the issued target. Progress is derived
        // from this phase only and is monotonically non-decreasing.
        let total = req.bytes.len();
        let put = self
            .client
            .put(&target.url)
            .header(CONTENT_TYPE, &req.content_type)
            .header(CONTENT_LENGTH, total as u64);

        let put = if total == 0 {
            progress(100);
            put.body(Vec::new())
        } else {
            let chunks: Vec<Result<Vec<u8>, std::io::Error>> = req
                .bytes
                .chunks(self.chunk_bytes)
                .map(|c| Ok(c.to_vec()))
                .collect();
            let mut sent = 0usize;
            let mut last = 0u8;
            let progress2 = progress.clone();
            let stream = futures_util::stream::iter(chunks).inspect(move |chunk| {
                if let Ok(c) = chunk {
                    sent += c.len();
                    let pct = percent(sent, total);
                    if pct > last {
                        last = pct;
                        (progress2)(pct);
                    }
                }
            });
            put.body(reqwest::Body::wrap_stream(stream))
        };

        let resp = put.send().await.map_err(|e| {
            err(
                "E_UPLOAD_PUT_HTTP_SEND",
                format!("upload transfer failed: {e}"),
                &file_name,
            )
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let code = format!("E_UPLOAD_HTTP_STATUS_{}", status.as_u16());
            return Err(err(
                &code,
                truncate_chars(&body, MAX_ERROR_BODY_CHARS),
                &file_name,
            ));
        }

        Ok(RemoteFileRef {
            url: object_url(&target.url),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_monotone_over_a_chunk_walk() {
        let total = 10_000usize;
        let chunk = 768usize;
        let mut sent = 0usize;
        let mut last = 0u8;
        while sent < total {
            sent = (sent + chunk).min(total);
            let pct = percent(sent, total);
            assert!(pct >= last);
            assert!(pct <= 100);
            last = pct;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn percent_handles_empty_payload() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(5, 10), 50);
    }

    #[test]
    fn object_url_strips_presign_query() {
        assert_eq!(
            object_url("https://bucket.s3.example/key.mp3?X-Amz-Signature=abc"),
            "https://bucket.s3.example/key.mp3"
        );
        assert_eq!(object_url("https://plain/no-query"), "https://plain/no-query");
    }

    #[test]
    fn upload_error_display_carries_code_and_message() {
        let e = err("E_UPLOAD_HTTP_STATUS_500", "boom", "notes.pdf");
        assert_eq!(e.file_name, "notes.pdf");
        assert_eq!(format!("{e}"), "E_UPLOAD_HTTP_STATUS_500: boom");
    }
}

//! 多文件流式上传：先读取目标路径字段，再逐个把文件分段交给 [`process_part`]。
//!
//! 请求体不会被整体缓存；每次只持有当前分段的一个数据块。

use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{Extension, Multipart};
use axum::http::{StatusCode, header};
use axum::response::Json as JsonResponse;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::admission::UploadGate;
use crate::batch::{BatchResult, NoFilesError, UploadResponse};
use crate::error::ApiError;
use crate::part::{PartOutcome, process_part};
use crate::sandbox::PathSandbox;
use crate::storage::Storage;

/// 指定上传目录的表单字段名。
pub const PATH_FIELD: &str = "path";
const MAX_PATH_FIELD_LEN: usize = 4096;

#[derive(Debug)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub max_request_size: u64,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// 读取 multipart 流本身失败；分段边界已不可信。
#[derive(Debug, Error)]
enum StreamError {
    #[error("{}", .0.body_text())]
    Multipart(#[from] MultipartError),
    #[error("timed out waiting for request data")]
    TimedOut,
}

impl StreamError {
    fn into_api_error(self) -> ApiError {
        match &self {
            StreamError::Multipart(err) if err.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                ApiError::PayloadTooLarge(self.to_string())
            }
            _ => ApiError::BadRequest(format!("failed to read upload request: {self}")),
        }
    }
}

/// 处理 `multipart/form-data` 上传请求。
pub async fn upload_files(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    Extension(gate): Extension<Arc<UploadGate>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let multipart = multipart.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "invalid multipart request");
        ApiError::BadRequest(format!("invalid upload request: {}", rejection.body_text()))
    })?;
    let _permit = gate.acquire().await?;
    let response = ingest(storage.sandbox(), &upload, multipart).await?;
    Ok(JsonResponse(response))
}

/// 驱动整个上传流程：等待目标路径 → 逐个写入文件 → 结束。
pub async fn ingest(
    sandbox: &PathSandbox,
    config: &UploadConfig,
    mut multipart: Multipart,
) -> Result<UploadResponse, ApiError> {
    let mut requested: Option<String> = None;
    let first = loop {
        let field = next_part(&mut multipart, config)
            .await
            .map_err(StreamError::into_api_error)?;
        let Some(field) = field else {
            break None;
        };
        if is_file(&field) {
            break Some(field);
        }
        if field.name() == Some(PATH_FIELD) {
            requested = Some(read_path_field(field, config).await?);
        }
    };

    let requested = requested
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| ".".to_string());
    let destination = sandbox.resolve(&requested).map_err(|err| {
        warn!(path = %requested, error = %err, "upload path rejected");
        ApiError::from(err)
    })?;
    let Some(first) = first else {
        warn!(path = %requested, "upload request contained no files");
        return Err(NoFilesError.into());
    };

    fs::create_dir_all(&destination).await.map_err(|err| {
        error!(path = ?destination, error = %err, "failed to create upload directory");
        ApiError::Internal("failed to create destination directory".into())
    })?;
    let relative = sandbox.relative(&destination);
    info!(path = %relative, "upload started");

    let mut batch = BatchResult::new(relative);
    batch.record(dispatch(first, &destination, config).await);
    loop {
        match next_part(&mut multipart, config).await {
            Ok(Some(field)) => {
                if !is_file(&field) {
                    continue;
                }
                batch.record(dispatch(field, &destination, config).await);
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, files = batch.file_count(), "upload stream interrupted");
                batch.interrupt(format!("upload stream interrupted: {err}"));
                break;
            }
        }
    }

    let response = batch.finish()?;
    if response.success {
        info!(path = %response.path, "upload complete");
    } else {
        warn!(path = %response.path, errors = ?response.errors, "upload finished with errors");
    }
    Ok(response)
}

/// 只有带非空文件名的分段才是文件；空文件名按普通字段处理。
fn is_file(field: &Field<'_>) -> bool {
    field.file_name().is_some_and(|name| !name.is_empty())
}

async fn next_part<'a>(
    multipart: &'a mut Multipart,
    config: &UploadConfig,
) -> Result<Option<Field<'a>>, StreamError> {
    match timeout(config.read_timeout, multipart.next_field()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StreamError::TimedOut),
    }
}

async fn read_path_field(mut field: Field<'_>, config: &UploadConfig) -> Result<String, ApiError> {
    let mut value = Vec::new();
    loop {
        let chunk = timeout(config.read_timeout, field.chunk())
            .await
            .map_err(|_| StreamError::TimedOut)
            .and_then(|chunk| chunk.map_err(StreamError::from))
            .map_err(StreamError::into_api_error)?;
        let Some(chunk) = chunk else {
            break;
        };
        if value.len() + chunk.len() > MAX_PATH_FIELD_LEN {
            return Err(ApiError::BadRequest("path field is too long".into()));
        }
        value.extend_from_slice(&chunk);
    }
    String::from_utf8(value).map_err(|_| ApiError::BadRequest("path field is not valid UTF-8".into()))
}

async fn dispatch(field: Field<'_>, destination: &Path, config: &UploadConfig) -> PartOutcome {
    let raw_name = field.file_name().unwrap_or_default().to_string();
    let declared_len = field
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    process_part(&raw_name, declared_len, field, destination, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::extract::FromRequest;
    use axum::http::Request;
    use bytes::Bytes;
    use futures_util::{StreamExt, stream};

    use crate::admission::AdmissionPolicy;
    use crate::storage::tests::make_storage;

    const BOUNDARY: &str = "----fileuploader-test-boundary";

    enum TestPart<'a> {
        Field(&'a str, &'a str),
        File {
            name: &'a str,
            content: Vec<u8>,
            declared_len: Option<u64>,
        },
    }

    fn file(name: &str, content: impl Into<Vec<u8>>) -> TestPart<'_> {
        TestPart::File {
            name,
            content: content.into(),
            declared_len: None,
        }
    }

    fn encode(parts: &[TestPart<'_>], close: bool) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                TestPart::Field(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                TestPart::File {
                    name,
                    content,
                    declared_len,
                } => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n"
                        )
                        .as_bytes(),
                    );
                    if let Some(len) = declared_len {
                        body.extend_from_slice(format!("Content-Length: {len}\r\n").as_bytes());
                    }
                    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
                    body.extend_from_slice(content);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        if close {
            body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        }
        body
    }

    async fn multipart(body: Vec<u8>) -> Multipart {
        multipart_from(AxumBody::from(body)).await
    }

    /// 按 `chunk` 字节切分请求体，每块间隔 `delay` 送达。
    async fn trickled(body: Vec<u8>, chunk: usize, delay: Duration) -> Multipart {
        let chunks = body
            .chunks(chunk)
            .map(Bytes::copy_from_slice)
            .collect::<Vec<_>>();
        let stream = stream::iter(chunks).then(move |chunk| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, std::io::Error>(chunk)
        });
        multipart_from(AxumBody::from_stream(stream)).await
    }

    async fn multipart_from(body: AxumBody) -> Multipart {
        let request = Request::builder()
            .method("POST")
            .uri("/api/file/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(body)
            .expect("request");
        Multipart::from_request(request, &())
            .await
            .unwrap_or_else(|_| panic!("multipart extraction failed"))
    }

    fn config(max_file_size: u64) -> UploadConfig {
        UploadConfig {
            max_file_size,
            max_request_size: 1024 * 1024,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }

    async fn tree_paths(root: &Path) -> Vec<String> {
        let mut paths = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.expect("read dir");
            while let Some(entry) = entries.next_entry().await.expect("next entry") {
                let path = entry.path();
                paths.push(
                    path.strip_prefix(root)
                        .expect("under root")
                        .to_string_lossy()
                        .replace('\\', "/"),
                );
                if entry.file_type().await.expect("file type").is_dir() {
                    pending.push(path);
                }
            }
        }
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn mixed_batch_reports_oversize_file() {
        let (_temp, storage) = make_storage().await;
        let body = encode(
            &[
                TestPart::Field("path", "docs/reports"),
                file("a.txt", vec![b'a'; 10]),
                file("b.txt", vec![b'b'; 17]),
            ],
            true,
        );

        let response = ingest(storage.sandbox(), &config(16), multipart(body).await)
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        assert!(!response.success);
        assert_eq!(response.path, "docs/reports");
        let errors = response.errors.expect("errors");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("b.txt "));

        let root = storage.sandbox().root();
        let saved = fs::read(root.join("docs/reports/a.txt")).await.expect("a.txt");
        assert_eq!(saved.len(), 10);
        assert!(!root.join("docs/reports/b.txt").exists());
        assert_eq!(
            tree_paths(root).await,
            vec!["docs", "docs/reports", "docs/reports/a.txt"]
        );
    }

    #[tokio::test]
    async fn escaping_destination_is_rejected_without_side_effects() {
        let (_temp, storage) = make_storage().await;
        let body = encode(
            &[TestPart::Field("path", "../../etc"), file("passwd", "x")],
            true,
        );

        let result = ingest(storage.sandbox(), &config(16), multipart(body).await).await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(tree_paths(storage.sandbox().root()).await.is_empty());
    }

    #[tokio::test]
    async fn fields_only_request_has_no_files() {
        let (_temp, storage) = make_storage().await;
        let body = encode(
            &[
                TestPart::Field("path", "new/dir"),
                TestPart::Field("comment", "hello"),
            ],
            true,
        );

        let result = ingest(storage.sandbox(), &config(16), multipart(body).await).await;

        assert!(matches!(result, Err(ApiError::BadRequest(msg)) if msg.contains("no files")));
        assert!(tree_paths(storage.sandbox().root()).await.is_empty());
    }

    #[tokio::test]
    async fn empty_body_has_no_files() {
        let (_temp, storage) = make_storage().await;
        let result = ingest(
            storage.sandbox(),
            &config(16),
            multipart(encode(&[], true)).await,
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn default_destination_is_root() {
        let (_temp, storage) = make_storage().await;
        let body = encode(&[file("a.txt", "hello")], true);

        let response = ingest(storage.sandbox(), &config(16), multipart(body).await)
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        assert!(response.success);
        assert_eq!(response.path, ".");
        assert!(response.errors.is_none());
        assert!(storage.sandbox().root().join("a.txt").is_file());
    }

    #[tokio::test]
    async fn later_files_are_processed_after_a_failure() {
        let (_temp, storage) = make_storage().await;
        let root = storage.sandbox().root();
        fs::create_dir_all(root.join("dest/blocked.txt"))
            .await
            .expect("seed directory");
        let body = encode(
            &[
                TestPart::Field("path", "dest"),
                file("blocked.txt", "cannot replace a directory"),
                file("..", "bad name"),
                TestPart::Field("ignored", "between files"),
                file("ok.txt", "fine"),
            ],
            true,
        );

        let response = ingest(storage.sandbox(), &config(64), multipart(body).await)
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        assert!(!response.success);
        let errors = response.errors.expect("errors");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("blocked.txt "));
        assert_eq!(
            fs::read(root.join("dest/ok.txt")).await.expect("ok.txt"),
            b"fine"
        );
        assert_eq!(
            tree_paths(root).await,
            vec!["dest", "dest/blocked.txt", "dest/ok.txt"]
        );
    }

    #[tokio::test]
    async fn file_names_are_reduced_to_base_name() {
        let (_temp, storage) = make_storage().await;
        let body = encode(
            &[
                TestPart::Field("path", "inbox"),
                file("a/../../etc/passwd", "x"),
            ],
            true,
        );

        let response = ingest(storage.sandbox(), &config(16), multipart(body).await)
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        assert!(response.success);
        assert_eq!(
            tree_paths(storage.sandbox().root()).await,
            vec!["inbox", "inbox/passwd"]
        );
    }

    #[tokio::test]
    async fn declared_size_is_not_trusted() {
        let (_temp, storage) = make_storage().await;
        let body = encode(
            &[TestPart::File {
                name: "liar.bin",
                content: vec![0; 32],
                declared_len: Some(4),
            }],
            true,
        );

        let response = ingest(storage.sandbox(), &config(16), multipart(body).await)
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        assert!(!response.success);
        assert!(tree_paths(storage.sandbox().root()).await.is_empty());
    }

    #[tokio::test]
    async fn truncated_stream_keeps_earlier_files() {
        let (_temp, storage) = make_storage().await;
        let body = encode(&[file("a.txt", "complete"), file("b.txt", "cut off")], false);

        let response = ingest(storage.sandbox(), &config(64), multipart(body).await)
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        assert!(!response.success);
        let errors = response.errors.expect("errors");
        assert!(!errors.is_empty());
        let root = storage.sandbox().root();
        assert_eq!(fs::read(root.join("a.txt")).await.expect("a.txt"), b"complete");
        assert!(!root.join("b.txt").exists());
        assert_eq!(tree_paths(root).await, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn empty_file_input_counts_as_no_files() {
        let (_temp, storage) = make_storage().await;
        let body = encode(&[TestPart::Field("path", "newdir"), file("", "")], true);

        let result = ingest(storage.sandbox(), &config(16), multipart(body).await).await;

        assert!(matches!(result, Err(ApiError::BadRequest(msg)) if msg.contains("no files")));
        assert!(tree_paths(storage.sandbox().root()).await.is_empty());
    }

    #[tokio::test]
    async fn empty_file_input_after_files_is_ignored() {
        let (_temp, storage) = make_storage().await;
        let body = encode(&[file("a.txt", "x"), file("", "")], true);

        let response = ingest(storage.sandbox(), &config(16), multipart(body).await)
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        assert!(response.success);
        assert!(response.errors.is_none());
        assert_eq!(tree_paths(storage.sandbox().root()).await, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn rejected_file_does_not_stop_later_files() {
        let (_temp, storage) = make_storage().await;
        let body = encode(
            &[
                file("big.bin", vec![b'x'; 40]),
                file("..", "bad name"),
                file("ok.txt", "fine"),
            ],
            true,
        );

        let response = ingest(storage.sandbox(), &config(8), multipart(body).await)
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        assert!(!response.success);
        let errors = response.errors.expect("errors");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("big.bin "));
        let root = storage.sandbox().root();
        assert_eq!(fs::read(root.join("ok.txt")).await.expect("ok.txt"), b"fine");
        assert_eq!(tree_paths(root).await, vec!["ok.txt"]);
    }

    #[tokio::test]
    async fn slow_oversize_file_does_not_stop_later_files() {
        let (_temp, storage) = make_storage().await;
        let mut config = config(8);
        config.read_timeout = Duration::from_millis(300);
        let body = encode(
            &[file("big.bin", vec![b'x'; 1280]), file("ok.txt", "fine")],
            true,
        );

        let multipart = trickled(body, 32, Duration::from_millis(20)).await;
        let response = ingest(storage.sandbox(), &config, multipart)
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        let errors = response.errors.expect("errors");
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].starts_with("big.bin "));
        let root = storage.sandbox().root();
        assert_eq!(fs::read(root.join("ok.txt")).await.expect("ok.txt"), b"fine");
    }

    #[tokio::test]
    async fn handler_rejects_when_gate_is_full() {
        let (_temp, storage) = make_storage().await;
        let gate = Arc::new(UploadGate::new(
            1,
            AdmissionPolicy::Reject,
            Duration::from_secs(1),
        ));
        let _held = gate.acquire().await.expect("hold slot");
        let body = encode(&[file("a.txt", "x")], true);

        let result = upload_files(
            Extension(Arc::new(storage)),
            Extension(Arc::new(config(16))),
            Extension(gate),
            Ok(multipart(body).await),
        )
        .await;

        assert!(matches!(result, Err(ApiError::TooManyRequests(_))));
    }

    #[tokio::test]
    async fn handler_returns_batch_response() {
        let (_temp, storage) = make_storage().await;
        let storage = Arc::new(storage);
        let gate = Arc::new(UploadGate::new(
            1,
            AdmissionPolicy::Reject,
            Duration::from_secs(1),
        ));
        let body = encode(
            &[
                TestPart::Field("path", "x"),
                file("one.txt", "1"),
                file("two.txt", "22"),
            ],
            true,
        );

        let JsonResponse(response) = upload_files(
            Extension(storage.clone()),
            Extension(Arc::new(config(16))),
            Extension(gate.clone()),
            Ok(multipart(body).await),
        )
        .await
        .unwrap_or_else(|err| panic!("upload failed: {err:?}"));

        assert!(response.success);
        assert_eq!(response.path, "x");
        assert!(gate.acquire().await.expect("slot released").is_some());
    }
}

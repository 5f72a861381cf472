//! 单个文件分段的落盘：限额流式拷贝，失败时清理半成品。

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::io;
use std::path::Path;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::atomic::AtomicFile;
use crate::sandbox::sanitize_file_name;
use crate::upload::UploadConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    Success,
    Oversize,
    FilesystemError,
}

/// 单个文件的处理结果。
#[derive(Debug, Clone)]
pub struct PartOutcome {
    pub filename: String,
    pub bytes_written: u64,
    pub status: PartStatus,
    pub detail: Option<String>,
    /// 失败发生在读取分段内容时；此时底层 multipart 流可能已不可用。
    pub read_failed: bool,
}

impl PartOutcome {
    fn success(filename: &str, bytes_written: u64) -> Self {
        Self {
            filename: filename.to_string(),
            bytes_written,
            status: PartStatus::Success,
            detail: None,
            read_failed: false,
        }
    }

    fn failed(filename: &str, bytes_written: u64, error: &CopyError) -> Self {
        let status = match error {
            CopyError::Oversize { .. } => PartStatus::Oversize,
            _ => PartStatus::FilesystemError,
        };
        Self {
            filename: filename.to_string(),
            bytes_written,
            status,
            detail: Some(error.to_string()),
            read_failed: matches!(error, CopyError::Read(_) | CopyError::ReadTimeout),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PartStatus::Success
    }

    /// 面向用户的失败描述，以文件名开头。
    pub fn failure_message(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        let detail = self.detail.as_deref().unwrap_or("failed");
        Some(format!("{} {}", self.filename, detail))
    }
}

#[derive(Debug, Error)]
enum CopyError {
    #[error("is not a valid file name")]
    InvalidName,
    #[error("is too large (exceeds {limit} bytes)")]
    Oversize { limit: u64 },
    #[error("could not be created: {0}")]
    Create(io::Error),
    #[error("could not be read: {0}")]
    Read(String),
    #[error("could not be read: timed out waiting for data")]
    ReadTimeout,
    #[error("could not be written: {0}")]
    Write(io::Error),
    #[error("could not be written: timed out")]
    WriteTimeout,
    #[error("could not be saved: {0}")]
    Commit(io::Error),
}

/// 把一个文件分段写入 `dest_dir`。
///
/// `declared_len` 来自客户端，只用于提前拒绝；限额按实际写入的字节数判定。
/// 被拒绝的分段若仍可读取，剩余内容会在返回前读完丢弃，每块都受读取超时约束。
/// `body` 在任何返回路径上都会被消费并释放。
pub async fn process_part<S, E>(
    raw_name: &str,
    declared_len: Option<u64>,
    body: S,
    dest_dir: &Path,
    config: &UploadConfig,
) -> PartOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let outcome = write_part(raw_name, declared_len, body.as_mut(), dest_dir, config).await;
    if !outcome.is_success() && !outcome.read_failed {
        drain(body, config).await;
    }
    outcome
}

async fn write_part<S, E>(
    raw_name: &str,
    declared_len: Option<u64>,
    body: Pin<&mut S>,
    dest_dir: &Path,
    config: &UploadConfig,
) -> PartOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let Some(filename) = sanitize_file_name(raw_name) else {
        let outcome = PartOutcome::failed(raw_name, 0, &CopyError::InvalidName);
        warn!(name = raw_name, "rejected upload with invalid file name");
        return outcome;
    };
    debug!(file = filename, declared_len, "processing file part");

    if let Some(declared) = declared_len
        && declared > config.max_file_size
    {
        let error = CopyError::Oversize {
            limit: config.max_file_size,
        };
        warn!(file = filename, declared, "declared size exceeds limit");
        return PartOutcome::failed(filename, 0, &error);
    }

    let target = dest_dir.join(filename);
    let mut file = match AtomicFile::create(&target).await {
        Ok(file) => file,
        Err(err) => {
            let error = CopyError::Create(err);
            warn!(file = filename, error = %error, "failed to create upload file");
            return PartOutcome::failed(filename, 0, &error);
        }
    };

    let mut written = 0;
    let copied = copy_limited(body, &mut file, config, &mut written).await;
    let result = match copied {
        Ok(()) => file.commit().await.map_err(CopyError::Commit),
        Err(err) => {
            file.discard().await;
            Err(err)
        }
    };

    match result {
        Ok(()) => {
            info!(file = filename, bytes = written, path = ?target, "file uploaded");
            PartOutcome::success(filename, written)
        }
        Err(error) => {
            warn!(file = filename, bytes = written, error = %error, "file upload failed");
            PartOutcome::failed(filename, written, &error)
        }
    }
}

/// 逐块拷贝，累计量超过上限的那一块不会被写入。
async fn copy_limited<S, E>(
    mut body: Pin<&mut S>,
    file: &mut AtomicFile,
    config: &UploadConfig,
    written: &mut u64,
) -> Result<(), CopyError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    loop {
        let next = timeout(config.read_timeout, body.next())
            .await
            .map_err(|_| CopyError::ReadTimeout)?;
        let Some(chunk) = next else {
            return Ok(());
        };
        let chunk = chunk.map_err(|err| CopyError::Read(err.to_string()))?;
        if chunk.is_empty() {
            continue;
        }
        let len = chunk.len() as u64;
        if written.saturating_add(len) > config.max_file_size {
            return Err(CopyError::Oversize {
                limit: config.max_file_size,
            });
        }
        timeout(config.write_timeout, file.file_mut().write_all(&chunk))
            .await
            .map_err(|_| CopyError::WriteTimeout)?
            .map_err(CopyError::Write)?;
        *written += len;
    }
}

/// 丢弃被拒绝分段的剩余内容，每次读取单独计时。
///
/// 读取出错或超时即停止；流本身的问题由下一次取分段时报告。
async fn drain<S, E>(mut body: Pin<&mut S>, config: &UploadConfig)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut discarded = 0u64;
    loop {
        match timeout(config.read_timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => discarded += chunk.len() as u64,
            Ok(Some(Err(err))) => {
                debug!(discarded, error = %err, "stopped draining rejected part");
                return;
            }
            Ok(None) => {
                debug!(discarded, "drained rejected part");
                return;
            }
            Err(_) => {
                debug!(discarded, "timed out draining rejected part");
                return;
            }
        }
    }
}

//! 上传并发准入：固定容量的计数闸门。

use clap::ValueEnum;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::warn;

use crate::config::UPLOAD_RETRY_AFTER_SECS;
use crate::error::ApiError;

/// 闸门已满时的处理方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AdmissionPolicy {
    /// 排队等待空位，最长等待 `wait_timeout`。
    Wait,
    /// 立即返回 429。
    Reject,
}

#[derive(Debug)]
pub struct UploadGate {
    permits: Option<Arc<Semaphore>>,
    policy: AdmissionPolicy,
    wait_timeout: Duration,
}

impl UploadGate {
    /// `capacity` 为 0 表示不限制。
    pub fn new(capacity: u64, policy: AdmissionPolicy, wait_timeout: Duration) -> Self {
        let permits = (capacity > 0).then(|| {
            let capacity = usize::try_from(capacity)
                .unwrap_or(Semaphore::MAX_PERMITS)
                .min(Semaphore::MAX_PERMITS);
            Arc::new(Semaphore::new(capacity))
        });
        Self {
            permits,
            policy,
            wait_timeout,
        }
    }

    /// 获取一个上传名额；返回的许可在请求结束时释放。
    pub async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, ApiError> {
        let Some(permits) = &self.permits else {
            return Ok(None);
        };
        match self.policy {
            AdmissionPolicy::Reject => match permits.clone().try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => {
                    warn!("upload rejected: concurrency limit reached");
                    Err(ApiError::TooManyRequests(UPLOAD_RETRY_AFTER_SECS))
                }
            },
            AdmissionPolicy::Wait => {
                match time::timeout(self.wait_timeout, permits.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(Some(permit)),
                    Ok(Err(_)) => Err(ApiError::Internal("upload gate closed".into())),
                    Err(_) => {
                        warn!(
                            wait_secs = self.wait_timeout.as_secs(),
                            "upload rejected: timed out waiting for a slot"
                        );
                        Err(ApiError::TooManyRequests(UPLOAD_RETRY_AFTER_SECS))
                    }
                }
            }
        }
    }
}

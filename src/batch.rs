//! 批量上传结果汇总。

use serde::Serialize;
use thiserror::Error;

use crate::part::PartOutcome;

#[derive(Debug, Error)]
#[error("no files found in upload")]
pub struct NoFilesError;

/// 上传接口的响应体。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

/// 按到达顺序记录每个文件的结果，以及可能中断整批的流错误。
#[derive(Debug)]
pub struct BatchResult {
    destination: String,
    outcomes: Vec<PartOutcome>,
    interrupted: bool,
    interruption: Option<String>,
}

impl BatchResult {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            outcomes: Vec::new(),
            interrupted: false,
            interruption: None,
        }
    }

    pub fn record(&mut self, outcome: PartOutcome) {
        self.outcomes.push(outcome);
    }

    /// 记录导致整批停止的流错误。
    ///
    /// 若上一个文件已因读取失败被记录，这是同一个错误，不再重复报告。
    pub fn interrupt(&mut self, reason: impl Into<String>) {
        if self.interrupted {
            return;
        }
        self.interrupted = true;
        if !self.outcomes.last().is_some_and(|outcome| outcome.read_failed) {
            self.interruption = Some(reason.into());
        }
    }

    pub fn file_count(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_success(&self) -> bool {
        !self.outcomes.is_empty()
            && !self.interrupted
            && self.outcomes.iter().all(PartOutcome::is_success)
    }

    pub fn finish(self) -> Result<UploadResponse, NoFilesError> {
        if self.outcomes.is_empty() {
            return Err(NoFilesError);
        }

        let success = self.is_success();
        let mut errors = self
            .outcomes
            .iter()
            .filter_map(PartOutcome::failure_message)
            .collect::<Vec<_>>();
        if let Some(reason) = self.interruption {
            errors.push(reason);
        }

        let total = self.outcomes.len();
        let failed = self
            .outcomes
            .iter()
            .filter(|outcome| !outcome.is_success())
            .count();
        let message = if success {
            format!("uploaded {total} file(s) to {}", self.destination)
        } else {
            format!(
                "upload finished with errors: {} of {total} file(s) saved to {}",
                total - failed,
                self.destination
            )
        };

        Ok(UploadResponse {
            success,
            message,
            path: self.destination,
            errors: if errors.is_empty() { None } else { Some(errors) },
        })
    }
}

//! 目录浏览与文件管理处理器。

use axum::extract::rejection::FormRejection;
use axum::extract::{Extension, Form, Path};
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::storage::{FileEntry, Storage};

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub path: String,
    pub files: Vec<FileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TreeResponse {
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> JsonResponse<Self> {
        JsonResponse(Self {
            message: message.into(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateDirForm {
    parent_path: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SymlinkForm {
    parent_path: String,
    name: String,
    target: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenameForm {
    old_path: String,
    new_name: String,
}

fn parse_form<T>(form: Result<Form<T>, FormRejection>) -> Result<T, ApiError> {
    form.map(|Form(value)| value).map_err(|rejection| {
        warn!(error = %rejection.body_text(), "invalid form body");
        ApiError::BadRequest(format!("invalid form body: {}", rejection.body_text()))
    })
}

fn require(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} is required")));
    }
    Ok(())
}

/// 列出根目录。
pub async fn list_root(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<ListResponse>, ApiError> {
    list(&storage, "").await
}

/// 列出指定目录。
pub async fn list_directory(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<ListResponse>, ApiError> {
    list(&storage, &path).await
}

async fn list(storage: &Storage, path: &str) -> Result<JsonResponse<ListResponse>, ApiError> {
    let files = storage.list_dir(path).await?;
    info!(path, count = files.len(), "list directory");
    let message = files.is_empty().then(|| "directory is empty".to_string());
    Ok(JsonResponse(ListResponse {
        path: if path.is_empty() { "." } else { path }.to_string(),
        files,
        message,
    }))
}

pub async fn directory_tree(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<TreeResponse>, ApiError> {
    let files = storage.tree().await?;
    info!(count = files.len(), "directory tree");
    Ok(JsonResponse(TreeResponse { files }))
}

pub async fn create_directory(
    Extension(storage): Extension<Arc<Storage>>,
    form: Result<Form<CreateDirForm>, FormRejection>,
) -> Result<JsonResponse<MessageResponse>, ApiError> {
    let form = parse_form(form)?;
    require(&form.name, "name")?;
    let created = storage.create_dir(&form.parent_path, &form.name).await?;
    let relative = storage.sandbox().relative(&created);
    info!(path = %relative, "directory created");
    Ok(MessageResponse::new(format!("directory {relative} created")))
}

pub async fn create_symlink(
    Extension(storage): Extension<Arc<Storage>>,
    form: Result<Form<SymlinkForm>, FormRejection>,
) -> Result<JsonResponse<MessageResponse>, ApiError> {
    let form = parse_form(form)?;
    require(&form.name, "name")?;
    require(&form.target, "target")?;
    let link = storage
        .create_symlink(&form.parent_path, &form.name, &form.target)
        .await?;
    let relative = storage.sandbox().relative(&link);
    info!(path = %relative, target = %form.target, "symlink created");
    Ok(MessageResponse::new(format!(
        "symlink {relative} -> {} created",
        form.target
    )))
}

pub async fn rename_entry(
    Extension(storage): Extension<Arc<Storage>>,
    form: Result<Form<RenameForm>, FormRejection>,
) -> Result<JsonResponse<MessageResponse>, ApiError> {
    let form = parse_form(form)?;
    require(&form.old_path, "oldPath")?;
    require(&form.new_name, "newName")?;
    let renamed = storage.rename(&form.old_path, &form.new_name).await?;
    let relative = storage.sandbox().relative(&renamed);
    info!(from = %form.old_path, to = %relative, "entry renamed");
    Ok(MessageResponse::new(format!(
        "{} renamed to {relative}",
        form.old_path
    )))
}

/// 删除文件、软链接或整个目录。
pub async fn delete_entry(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<MessageResponse>, ApiError> {
    require(&path, "path")?;
    let removed = storage.delete(&path).await?;
    let relative = storage.sandbox().relative(&removed);
    info!(path = %relative, "entry deleted");
    Ok(MessageResponse::new(format!("{relative} deleted")))
}

pub async fn delete_missing_path() -> ApiError {
    ApiError::BadRequest("path is required".into())
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

//! 根目录下的文件操作：列目录、目录树、建目录、软链接、重命名与删除。
//!
//! 每个操作都先经过 [`PathSandbox::resolve`] 再访问文件系统。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::sandbox::{PathError, PathSandbox, sanitize_file_name};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("path is not a directory")]
    NotADirectory,
    #[error("invalid name")]
    InvalidName,
    #[error("symlink target must start with {0}")]
    SymlinkTargetNotAllowed(String),
    #[error("the root directory cannot be modified")]
    RootProtected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug)]
pub struct StorageOptions {
    /// 软链接目标必须以此前缀开头。
    pub symlink_target_prefix: String,
    /// 目录树中跳过名字以此开头（忽略大小写）的条目及其子树。
    pub tree_hidden_prefix: String,
}

#[derive(Clone, Debug)]
pub struct Storage {
    sandbox: PathSandbox,
    options: StorageOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub mod_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
}

impl Storage {
    pub fn new(sandbox: PathSandbox, options: StorageOptions) -> Self {
        Self { sandbox, options }
    }

    pub fn sandbox(&self) -> &PathSandbox {
        &self.sandbox
    }

    pub async fn list_dir(&self, requested: &str) -> Result<Vec<FileEntry>, StorageError> {
        let target = self.sandbox.resolve(requested)?;
        if !fs::metadata(&target).await?.is_dir() {
            return Err(StorageError::NotADirectory);
        }

        let mut dir = fs::read_dir(&target).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(path = ?path, error = %err, "skip unreadable entry");
                    continue;
                }
            };
            entries.push(self.describe(&path, &metadata).await);
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });
        Ok(entries)
    }

    /// 先序遍历整个根目录，不跟随软链接。
    pub async fn tree(&self) -> Result<Vec<FileEntry>, StorageError> {
        let hidden = self.options.tree_hidden_prefix.to_lowercase();
        let mut files = Vec::new();
        let mut pending = self.sorted_children(self.sandbox.root()).await?;
        pending.reverse();

        while let Some(path) = pending.pop() {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !hidden.is_empty() && name.starts_with(&hidden) {
                continue;
            }
            let metadata = fs::symlink_metadata(&path).await?;
            files.push(self.describe(&path, &metadata).await);
            if metadata.is_dir() {
                let mut children = self.sorted_children(&path).await?;
                children.reverse();
                pending.extend(children);
            }
        }
        Ok(files)
    }

    /// 在 `parent` 下创建目录（含缺失的父级），`name` 只取最后一段。
    pub async fn create_dir(&self, parent: &str, name: &str) -> Result<PathBuf, StorageError> {
        let name = sanitize_file_name(name).ok_or(StorageError::InvalidName)?;
        let target = self.sandbox.resolve(parent)?.join(name);
        fs::create_dir_all(&target).await?;
        Ok(target)
    }

    pub async fn create_symlink(
        &self,
        parent: &str,
        name: &str,
        link_target: &str,
    ) -> Result<PathBuf, StorageError> {
        if !link_target.starts_with(&self.options.symlink_target_prefix) {
            return Err(StorageError::SymlinkTargetNotAllowed(
                self.options.symlink_target_prefix.clone(),
            ));
        }
        let name = sanitize_file_name(name).ok_or(StorageError::InvalidName)?;
        let link = self.sandbox.resolve(parent)?.join(name);

        make_symlink(link_target, &link).await?;
        Ok(link)
    }

    /// 在原目录内改名，新名字只取最后一段；目标已存在时拒绝。
    pub async fn rename(&self, old_path: &str, new_name: &str) -> Result<PathBuf, StorageError> {
        let source = self.sandbox.resolve(old_path)?;
        if source == self.sandbox.root() {
            return Err(StorageError::RootProtected);
        }
        let new_name = sanitize_file_name(new_name).ok_or(StorageError::InvalidName)?;
        let parent = source.parent().ok_or(StorageError::RootProtected)?;
        let destination = self.sandbox.resolve(parent.join(new_name))?;
        fs::symlink_metadata(&source).await?;
        if fs::symlink_metadata(&destination).await.is_ok() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{new_name} already exists"),
            )));
        }
        fs::rename(&source, &destination).await?;
        Ok(destination)
    }

    /// 目录递归删除，文件与软链接单独删除。
    pub async fn delete(&self, requested: &str) -> Result<PathBuf, StorageError> {
        let target = self.sandbox.resolve(requested)?;
        if target == self.sandbox.root() {
            return Err(StorageError::RootProtected);
        }
        let metadata = fs::symlink_metadata(&target).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        Ok(target)
    }

    async fn sorted_children(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(dir).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry.path());
        }
        children.sort();
        Ok(children)
    }

    async fn describe(&self, path: &Path, metadata: &Metadata) -> FileEntry {
        let is_symlink = metadata.file_type().is_symlink();
        let symlink_target = if is_symlink {
            fs::read_link(path)
                .await
                .ok()
                .map(|target| target.to_string_lossy().to_string())
        } else {
            None
        };
        FileEntry {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: self.sandbox.relative(path),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            is_symlink,
            mod_time: metadata
                .modified()
                .ok()
                .map(|modified| DateTime::<Utc>::from(modified).timestamp())
                .unwrap_or_default(),
            symlink_target,
        }
    }
}

#[cfg(unix)]
async fn make_symlink(target: &str, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn make_symlink(_target: &str, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

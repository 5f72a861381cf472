//! 路径沙箱：把不可信的路径字符串限制在固定的根目录之内。
//!
//! 检查是纯词法的：解析过程中不访问文件系统，也不跟随符号链接。
//! 因此根目录内已经存在、且指向根目录之外的符号链接可以被穿越，
//! 这是已知的信任边界，不在此处修补。

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// 路径解析失败的原因。
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    #[error("path is outside the allowed directory")]
    Escape,
    #[error("invalid path")]
    Invalid,
}

/// 以固定根目录为界的路径解析器。
#[derive(Clone, Debug)]
pub struct PathSandbox {
    root: PathBuf,
}

impl PathSandbox {
    /// `root` 必须是已规范化的绝对路径，进程生命周期内不变。
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// 创建根目录并取其规范路径。
    pub async fn open(root: impl AsRef<Path>) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(root.as_ref()).await?;
        let root = tokio::fs::canonicalize(root.as_ref()).await?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析请求路径：空串与 `.` 即根目录，相对路径拼接到根目录下，
    /// 绝对路径原样使用但同样要落在根目录内。
    pub fn resolve(&self, requested: impl AsRef<Path>) -> Result<PathBuf, PathError> {
        let requested = requested.as_ref();
        if requested.as_os_str().as_encoded_bytes().contains(&0) {
            return Err(PathError::Invalid);
        }

        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };
        let cleaned = lexical_clean(&joined);
        if !cleaned.is_absolute() {
            return Err(PathError::Invalid);
        }

        // strip_prefix 按组件比较，`/srv/files2` 不会被当成 `/srv/files` 的子路径。
        match cleaned.strip_prefix(&self.root) {
            Ok(_) => Ok(cleaned),
            Err(_) => Err(PathError::Escape),
        }
    }

    /// 已解析路径相对根目录的 `/` 分隔形式，根目录本身为 `.`。
    pub fn relative(&self, resolved: &Path) -> String {
        let Ok(rest) = resolved.strip_prefix(&self.root) else {
            return ".".to_string();
        };
        let parts = rest
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            ".".to_string()
        } else {
            parts.join("/")
        }
    }
}

/// 只保留客户端给出文件名的最后一个组件。
///
/// `/` 与 `\` 都视为分隔符；空名、`.`、`..` 以及含 NUL 的名字返回 `None`。
pub fn sanitize_file_name(raw: &str) -> Option<&str> {
    let base = raw
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return None;
    }
    Some(base)
}

/// 不访问文件系统地消去 `.` 与 `..`；位于文件系统根时 `..` 保持不动。
fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => cleaned.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(cleaned.components().next_back(), Some(Component::Normal(_))) {
                    cleaned.pop();
                }
            }
            Component::Normal(segment) => cleaned.push(segment),
        }
    }
    cleaned
}

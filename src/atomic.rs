//! 上传临时文件：写入同目录下的隐藏文件，成功后原子改名到目标路径。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tracing::warn;
use uuid::Uuid;

/// 上传成功后文件的访问权限。
#[cfg(unix)]
const UPLOADED_FILE_MODE: u32 = 0o644;

/// 可原子替换目标文件的临时文件。
///
/// 在 `commit` 之前被丢弃（包括请求被取消时）会同步删除临时文件。
pub struct AtomicFile {
    target: PathBuf,
    file: File,
    guard: TempGuard,
}

impl AtomicFile {
    /// 在目标路径所在目录新建临时文件，已存在同名文件时失败而不是追加。
    pub async fn create(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let temp_path = parent.join(format!(".{}.uploading", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        Ok(Self {
            target: target.to_path_buf(),
            file,
            guard: TempGuard(Some(temp_path)),
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃写入并删除临时文件。
    pub async fn discard(self) {
        let AtomicFile {
            file, mut guard, ..
        } = self;
        drop(file);
        if let Some(path) = guard.disarm() {
            let _ = fs::remove_file(&path).await;
        }
    }

    /// 落盘、设置权限并改名为目标文件。
    pub async fn commit(self) -> io::Result<()> {
        let AtomicFile {
            target,
            mut file,
            mut guard,
        } = self;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        file.sync_all().await?;
        drop(file);

        let Some(temp_path) = guard.path() else {
            return Err(io::Error::other("temporary file already released"));
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) =
                fs::set_permissions(temp_path, std::fs::Permissions::from_mode(UPLOADED_FILE_MODE))
                    .await
            {
                warn!(path = ?target, error = %err, "failed to set file permissions");
            }
        }

        fs::rename(temp_path, &target).await?;
        guard.disarm();

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

/// 持有临时文件路径，析构时若未解除则删除该文件。
struct TempGuard(Option<PathBuf>);

impl TempGuard {
    fn path(&self) -> Option<&Path> {
        self.0.as_deref()
    }

    fn disarm(&mut self) -> Option<PathBuf> {
        self.0.take()
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

//! FileTaskStore - JSON ファイルの台帳
//!
//! # 書き込み
//! 1. 同じディレクトリに一時ファイルを作る
//! 2. インデント 2 の JSON を書いて fsync
//! 3. rename で台帳に置き換える
//!
//! 読み手は常に「前の版」か「新しい版」のどちらか完全なものを見ます。
//! fsync と rename はブロッキングなので spawn_blocking で実行します。

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::domain::{CoordinatorError, TaskSet};
use crate::ports::TaskStore;

#[derive(Debug, Clone)]
pub struct FileTaskStore {
    path: PathBuf,
}

impl FileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, source: io::Error) -> CoordinatorError {
        CoordinatorError::StoreUnavailable {
            location: self.location(),
            source,
        }
    }
}

/// Parent directory for the temporary file; a bare file name lives in `.`.
fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut temp_file = NamedTempFile::new_in(parent_dir(path))?;
    temp_file.write_all(contents)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn load(&self) -> Result<TaskSet, CoordinatorError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.unavailable(e))?;

        let tasks: TaskSet =
            serde_json::from_slice(&raw).map_err(|e| CoordinatorError::StoreCorrupt {
                location: self.location(),
                detail: e.to_string(),
            })?;
        debug!(ledger = %self.path.display(), tasks = tasks.len(), "ledger loaded");
        Ok(tasks)
    }

    async fn save(&self, tasks: &TaskSet) -> Result<(), CoordinatorError> {
        let contents =
            serde_json::to_vec_pretty(tasks).map_err(|e| self.unavailable(io::Error::other(e)))?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &contents))
            .await
            .map_err(|e| CoordinatorError::Join(e.to_string()))?
            .map_err(|e| self.unavailable(e))?;

        debug!(ledger = %self.path.display(), tasks = tasks.len(), "ledger saved");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

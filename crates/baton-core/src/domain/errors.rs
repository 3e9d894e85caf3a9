//! Errors - エラー型と分類
//!
//! 業務上の拒否（`Refusal`）はエラーではなく結果として返します。
//! ここにあるのは「判断そのものができなかった」ハードエラーだけです。

use std::path::PathBuf;

use thiserror::Error;

use super::ids::TaskId;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（台帳ファイル・ロックファイルの障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// CoordinatorError は validate / transition のハードエラー
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("ledger unavailable at {location}: {source}")]
    StoreUnavailable {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger at {location} is corrupt: {detail}")]
    StoreCorrupt { location: String, detail: String },

    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("could not acquire the ledger lock after {attempts} attempts")]
    LockTimeout { attempts: u32 },

    #[error("lock file {path}: {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("background task failed: {0}")]
    Join(String),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::LockTimeout { .. } => ErrorKind::Transient,
            CoordinatorError::NotFound(_) => ErrorKind::Permanent,
            CoordinatorError::StoreUnavailable { .. }
            | CoordinatorError::StoreCorrupt { .. }
            | CoordinatorError::LockIo { .. }
            | CoordinatorError::Join(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::timeout(CoordinatorError::LockTimeout { attempts: 5 }, ErrorKind::Transient)]
    #[case::not_found(CoordinatorError::NotFound(TaskId::new("T9")), ErrorKind::Permanent)]
    #[case::corrupt(
        CoordinatorError::StoreCorrupt { location: "t.json".into(), detail: "eof".into() },
        ErrorKind::Infrastructure
    )]
    fn errors_are_classified(#[case] error: CoordinatorError, #[case] kind: ErrorKind) {
        assert_eq!(error.kind(), kind);
        assert_eq!(error.is_retryable(), kind == ErrorKind::Transient);
    }

    #[test]
    fn not_found_names_the_task() {
        let error = CoordinatorError::NotFound(TaskId::new("MCP_404"));
        assert_eq!(error.to_string(), "Task MCP_404 not found");
    }
}

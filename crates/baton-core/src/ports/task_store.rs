//! TaskStore port - 台帳（ledger）の読み書き
//!
//! 台帳が唯一の正本（source of truth）です。
//! 排他制御はここでは行いません。書き込みの直列化は ExclusionLock の仕事です。

use async_trait::async_trait;

use crate::domain::{CoordinatorError, TaskSet};

/// TaskStore は台帳全体を読み書きする
///
/// # 契約
/// - `load`: 存在しない / 読めない → `StoreUnavailable`、解析できない → `StoreCorrupt`
/// - `save`: 読み手から見て原子的（途中の状態は見えない）
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load(&self) -> Result<TaskSet, CoordinatorError>;

    async fn save(&self, tasks: &TaskSet) -> Result<(), CoordinatorError>;

    /// ログやエラーメッセージ用の場所表示
    fn location(&self) -> String;
}

//! InMemoryTaskStore - テスト・組み込み用の台帳
//!
//! ファイルを使わずに Coordinator を動かすための実装です。
//! `saves()` で書き込み回数を数えられます（修復が永続化されたかの確認用）。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{CoordinatorError, TaskSet};
use crate::ports::TaskStore;

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<Option<TaskSet>>,
    saves: AtomicUsize,
}

impl InMemoryTaskStore {
    pub fn new(tasks: TaskSet) -> Self {
        Self {
            tasks: Mutex::new(Some(tasks)),
            saves: AtomicUsize::new(0),
        }
    }

    /// A store whose ledger does not exist yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Option<TaskSet> {
        self.tasks.lock().await.clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn load(&self) -> Result<TaskSet, CoordinatorError> {
        self.tasks
            .lock()
            .await
            .clone()
            .ok_or_else(|| CoordinatorError::StoreUnavailable {
                location: self.location(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no ledger"),
            })
    }

    async fn save(&self, tasks: &TaskSet) -> Result<(), CoordinatorError> {
        *self.tasks.lock().await = Some(tasks.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

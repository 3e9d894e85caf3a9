//! baton-core
//!
//! 複数のエージェントが 1 つのタスク台帳（ledger）を共有するための
//! claim / validate 協調レイヤー。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state machine, dependency, decision, errors, events）
//! - **ports**: 抽象化レイヤー（TaskStore, ExclusionLock, Clock, IdGenerator, EventSink）
//! - **impls**: ports の実装（FileTaskStore, FileLock, InMemory 系）
//! - **app**: Coordinator（validate / transition）、builder、status / doctor
//! - **config**: 環境変数からの設定読み込み

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{Coordinator, CoordinatorBuilder};
pub use config::CoordinatorConfig;
pub use domain::{
    AgentId, CoordinatorError, Decision, Refusal, Task, TaskId, TaskSet, TaskStatus,
    TransitionOutcome,
};

//! App - アプリケーション層
//!
//! ports を組み合わせて協調ロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Coordinator**: validate / transition / reclaim_stale / ready / status / doctor
//! - **CoordinatorBuilder**: 構築とワイヤリング（fail-fast）
//! - **status**: LedgerStatus, DoctorReport, ReclaimReport

pub mod builder;
pub mod coordinator;
pub mod status;

pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::coordinator::Coordinator;
pub use self::status::{
    ActiveClaim, DoctorReport, Finding, LedgerCounts, LedgerStatus, ReclaimReport, ReclaimedEntry,
};

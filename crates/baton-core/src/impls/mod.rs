//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **FileTaskStore** / **FileLock**: 共有ファイルシステム上の台帳とロック（本番用）
//! - **InMemoryTaskStore** / **InProcessLock** / **MemoryEventSink**: テスト・組み込み用

pub mod file_lock;
pub mod file_store;
pub mod inmem_lock;
pub mod inmem_store;
pub mod memory_sink;

pub use self::file_lock::{FileLock, LeaseRecord, DEFAULT_LEASE_TTL_SECS};
pub use self::file_store::FileTaskStore;
pub use self::inmem_lock::InProcessLock;
pub use self::inmem_store::InMemoryTaskStore;
pub use self::memory_sink::MemoryEventSink;

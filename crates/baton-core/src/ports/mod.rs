//! Ports - 抽象化レイヤー
//!
//! Coordinator はこれらの trait だけに依存します。
//! 台帳はファイル（本番）かメモリ（テスト・組み込み）のどちらでも動きます。

pub mod clock;
pub mod event_sink;
pub mod exclusion_lock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink, TracingEventSink};
pub use self::exclusion_lock::{ExclusionLock, LeaseToken, LockGuard, LockRetryPolicy};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;

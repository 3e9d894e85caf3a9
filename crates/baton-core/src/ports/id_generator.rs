//! IdGenerator port - lease ID 生成の抽象化
//!
//! ロックを取るたびに新しい LeaseId を発行し、sentinel に書き込みます。
//! release 時にはこの ID が一致するときだけ sentinel を消します。

use ulid::Ulid;

use crate::domain::ids::LeaseId;
use crate::ports::Clock;

/// IdGenerator は複数プロセスで衝突しない ID を生成
///
/// # ULID の特性
/// - 時刻でソート可能
/// - 分散環境で生成可能（調整不要）
pub trait IdGenerator: Send + Sync {
    fn generate_lease_id(&self) -> LeaseId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// タイムスタンプ部分は Clock から取るので、FixedClock で決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_lease_id(&self) -> LeaseId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        LeaseId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

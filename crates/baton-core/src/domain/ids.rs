//! Domain identifiers (strongly-typed IDs).
//!
//! 2 種類の ID を扱います。
//!
//! ## 台帳由来の ID（`Key<T>`）
//! TaskId / AgentId は台帳や呼び出し元から渡される不透明な文字列です。
//! 形式は外部が決めるので、こちらでは検証も正規化もしません。
//!
//! ## baton が発行する ID（`Id<T>`）
//! LeaseId はロックの所有権を表す ULID です。
//! 時刻でソートでき、調整なしに複数プロセスで生成できます。
//!
//! どちらも Phantom type パターンで、実行時コストなしに
//! 「TaskId と AgentId を取り違える」ことをコンパイル時に防ぎます。

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// KeyMarker は文字列 ID 型のマーカー trait
pub trait KeyMarker: Send + Sync + 'static {
    /// エラーメッセージなどで使う種類名（"task", "agent"）
    fn kind() -> &'static str;
}

/// 外部から与えられる不透明な文字列 ID
///
/// JSON 上ではただの文字列として読み書きされます。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key<T: KeyMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: KeyMarker> Key<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_inner(self) -> String {
        self.value
    }

    /// マーカーの種類名（"task" / "agent"）
    pub fn kind_name() -> &'static str {
        T::kind()
    }
}

impl<T: KeyMarker> fmt::Display for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: KeyMarker> From<&str> for Key<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: KeyMarker> From<String> for Key<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: KeyMarker> Borrow<str> for Key<T> {
    fn borrow(&self) -> &str {
        &self.value
    }
}

impl<T: KeyMarker> PartialEq<str> for Key<T> {
    fn eq(&self, other: &str) -> bool {
        self.value == other
    }
}

impl<T: KeyMarker> PartialEq<&str> for Key<T> {
    fn eq(&self, other: &&str) -> bool {
        self.value == *other
    }
}

/// IdMarker は ULID ID 型のマーカー trait
///
/// Display で使うプレフィックス（"lease-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ULID ベースのジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl KeyMarker for Task {
    fn kind() -> &'static str {
        "task"
    }
}

/// Agent のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Agent {}

impl KeyMarker for Agent {
    fn kind() -> &'static str {
        "agent"
    }
}

/// Lease のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

// ========================================
// Type Alias
// ========================================

/// Identifier of a task in the ledger.
pub type TaskId = Key<Task>;

/// Identifier of an agent (trusted, never authenticated).
pub type AgentId = Key<Agent>;

/// Identifier of one exclusion-lock lease.
pub type LeaseId = Id<Lease>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_serialize_as_plain_strings() {
        let task = TaskId::new("V9_002");
        let json = serde_json::to_string(&task).unwrap();
        assert_eq!(json, "\"V9_002\"");

        let back: AgentId = serde_json::from_str("\"Agent_Test_A\"").unwrap();
        assert_eq!(back, "Agent_Test_A");
        assert_eq!(AgentId::kind_name(), "agent");
    }

    #[test]
    fn keys_can_be_looked_up_by_str() {
        use std::collections::HashSet;

        let mut ids: HashSet<TaskId> = HashSet::new();
        ids.insert(TaskId::new("T0"));
        assert!(ids.contains("T0"));
        assert!(!ids.contains("T1"));
    }

    #[test]
    fn lease_ids_have_prefix_and_roundtrip() {
        let lease = LeaseId::from_ulid(Ulid::new());
        assert!(lease.to_string().starts_with("lease-"));

        let json = serde_json::to_string(&lease).unwrap();
        let back: LeaseId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lease);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<LeaseId>(), size_of::<Ulid>());
        assert_eq!(size_of::<TaskId>(), size_of::<String>());
    }
}

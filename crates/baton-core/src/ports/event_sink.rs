//! EventSink port - イベント記録の抽象化
//!
//! - NoopEventSink: 何もしない（デフォルト）
//! - TracingEventSink: `tracing` の info イベントとして出す
//! - MemoryEventSink（impls）: テスト用に溜める

use async_trait::async_trait;
use tracing::info;

use crate::domain::DomainEvent;

/// EventSink はドメインイベントを記録
///
/// 記録の失敗で台帳の更新を巻き戻すことはないので、戻り値はありません。
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &DomainEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _event: &DomainEvent) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: &DomainEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        info!(
            event = event.name(),
            task_id = %event.task_id(),
            payload = %payload,
            "domain event"
        );
    }
}

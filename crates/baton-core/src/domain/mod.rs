//! Domain model (ids, ledger records, state machine, gating, decisions).

pub mod decision;
pub mod dependency;
pub mod errors;
pub mod events;
pub mod ids;
pub mod state;
pub mod task;
pub mod timestamp;

pub use decision::{Decision, Refusal, TransitionOutcome};
pub use dependency::{DependencyGraph, Gate, UnmetDependency};
pub use errors::{CoordinatorError, ErrorKind};
pub use events::{Broadcast, DomainEvent};
pub use ids::{AgentId, LeaseId, TaskId};
pub use state::{Applied, ClaimPolicy, Effect, ReclaimedClaim, STALE_CLAIM_AFTER_SECS};
pub use task::{ParseStatusError, Task, TaskSet, TaskStatus};

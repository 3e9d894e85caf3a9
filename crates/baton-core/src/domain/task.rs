//! Ledger records: Task and TaskSet.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de, ser};
use serde_json::{Map, Value};
use thiserror::Error;

use super::ids::{AgentId, TaskId};
use super::timestamp;

/// Task status as stored in the ledger.
///
/// State transitions:
/// - Pending -> InProgress (claim)
/// - InProgress -> InProgress (re-entrant claim by the owner)
/// - InProgress -> Pending (stale reclaim, system only)
/// - Pending | InProgress -> Completed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status '{0}' (expected pending, in_progress or completed)")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// One unit of work in the ledger.
///
/// Fields the coordinator does not know about (title, owner notes, ...) are
/// kept in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    #[serde(default)]
    pub status: TaskStatus,

    /// Written as `null` when unclaimed.
    #[serde(default)]
    pub claimed_by: Option<AgentId>,

    #[serde(default, with = "timestamp::option")]
    pub claimed_at: Option<DateTime<Utc>>,

    #[serde(default, with = "timestamp::option_date")]
    pub completed_date: Option<NaiveDate>,

    /// Opaque annotations; any entry prevents claiming.
    #[serde(default)]
    pub blockers: Vec<String>,

    /// Tasks that must be completed before this one can be claimed.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// A fresh pending task with no blockers or dependencies.
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            completed_date: None,
            blockers: Vec::new(),
            dependencies: Vec::new(),
            last_updated: None,
            extra: Map::new(),
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_blocker(mut self, blocker: impl Into<String>) -> Self {
        self.blockers.push(blocker.into());
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Put the task in progress under `agent` as of `at`.
    pub fn with_claim(mut self, agent: impl Into<AgentId>, at: DateTime<Utc>) -> Self {
        self.status = TaskStatus::InProgress;
        self.claimed_by = Some(agent.into());
        self.claimed_at = Some(at);
        self
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    /// Is this task claimed by someone other than `agent`?
    ///
    /// With no agent given, any claim counts as foreign.
    pub fn is_claimed_by_other(&self, agent: Option<&AgentId>) -> bool {
        match (&self.claimed_by, agent) {
            (Some(holder), Some(agent)) => holder != agent,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub(crate) fn set_claim(&mut self, agent: AgentId, at: DateTime<Utc>) {
        self.claimed_by = Some(agent);
        self.claimed_at = Some(at);
    }

    pub(crate) fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
    }
}

/// The whole ledger: ordered tasks plus a set-wide `last_updated`.
///
/// The key order of the file it was read from is remembered, so a rewrite
/// keeps every object in its original shape.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    pub last_updated: Option<DateTime<Utc>>,
    pub tasks: Vec<Task>,
    pub extra: Map<String, Value>,
    layout: KeyLayout,
}

// key order は見た目だけなので比較しない
impl PartialEq for TaskSet {
    fn eq(&self, other: &Self) -> bool {
        self.last_updated == other.last_updated
            && self.tasks == other.tasks
            && self.extra == other.extra
    }
}

#[derive(Serialize)]
struct LedgerOut<'a> {
    #[serde(with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
    tasks: &'a [Task],
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

#[derive(Deserialize)]
struct LedgerIn {
    #[serde(default, with = "timestamp::option")]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Serialize for TaskSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let written = serde_json::to_value(LedgerOut {
            last_updated: self.last_updated,
            tasks: &self.tasks,
            extra: &self.extra,
        })
        .map_err(ser::Error::custom)?;
        self.layout.arrange(written).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let layout = KeyLayout::capture(&raw);
        let ledger: LedgerIn = serde_json::from_value(raw).map_err(de::Error::custom)?;
        Ok(Self {
            last_updated: ledger.last_updated,
            tasks: ledger.tasks,
            extra: ledger.extra,
            layout,
        })
    }
}

/// Key order of the top-level object and of each task object, as read.
#[derive(Debug, Clone, Default)]
struct KeyLayout {
    top: Vec<String>,
    tasks: HashMap<TaskId, Vec<String>>,
}

impl KeyLayout {
    fn capture(raw: &Value) -> Self {
        let Some(object) = raw.as_object() else {
            return Self::default();
        };
        let mut tasks = HashMap::new();
        if let Some(Value::Array(items)) = object.get("tasks") {
            for fields in items.iter().filter_map(Value::as_object) {
                if let Some(id) = fields.get("id").and_then(Value::as_str) {
                    // 重複 id は先頭のものに合わせる
                    tasks
                        .entry(TaskId::new(id))
                        .or_insert_with(|| fields.keys().cloned().collect());
                }
            }
        }
        Self {
            top: object.keys().cloned().collect(),
            tasks,
        }
    }

    fn arrange(&self, mut written: Value) -> Value {
        if let Value::Object(top) = &mut written {
            if let Some(Value::Array(items)) = top.get_mut("tasks") {
                for item in items.iter_mut() {
                    if let Value::Object(fields) = item
                        && let Some(order) = fields
                            .get("id")
                            .and_then(Value::as_str)
                            .and_then(|id| self.tasks.get(id))
                    {
                        *fields = reorder(std::mem::take(fields), order);
                    }
                }
            }
            *top = reorder(std::mem::take(top), &self.top);
        }
        written
    }
}

/// Keys named in `order` first, in that order; new keys keep their relative
/// order after them.
fn reorder(fields: Map<String, Value>, order: &[String]) -> Map<String, Value> {
    let mut entries: Vec<(String, Value)> = fields.into_iter().collect();
    entries.sort_by_key(|(key, _)| {
        order
            .iter()
            .position(|known| known == key)
            .unwrap_or(order.len())
    });
    entries.into_iter().collect()
}

impl TaskSet {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            last_updated: None,
            tasks,
            extra: Map::new(),
            layout: KeyLayout::default(),
        }
    }

    /// First task with the given id (ids are expected to be unique).
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stamp a mutation on the task and on the set.
    pub(crate) fn touch(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(task) = self.get_mut(id) {
            task.last_updated = Some(now);
        }
        self.last_updated = Some(now);
    }
}

//! Persistence contract.
//!
//! Backends persist four tables — `<prefix>_dag`, `<prefix>_task`,
//! `<prefix>_dag_instance`, `<prefix>_task_instance` — keyed by `id` with
//! secondary lookups by `worker`, `status` and `dagInsId`. Batch operations
//! may be implemented as sequential singletons.
//!
//! Contract guarantees:
//! - create-then-read of the same id returns the written row;
//! - updates are last-writer-wins on the patched fields;
//! - a lookup miss is [`Error::NotFound`](crate::Error::NotFound), distinct
//!   from transport failures;
//! - every row's `updatedAt` never moves backwards;
//! - `update_dag_ins` (and its batch variant) publish
//!   [`DagInstanceUpdated`](crate::event::DagInstanceUpdated) after success,
//!   `patch_dag_ins` publishes
//!   [`DagInstancePatched`](crate::event::DagInstancePatched) with the
//!   explicit field list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{
    Dag, DagInstance, DagInstanceStatus, TaskInstance, TaskInstanceStatus,
};
use crate::Result;

/// Fields of a [`DagInstance`] that `patch_dag_ins` may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DagInsField {
    Status,
    Worker,
    ShareData,
    Cmd,
    Reason,
}

/// Fields of a [`TaskInstance`] that `patch_task_ins` may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskInsField {
    Status,
    Reason,
    Traces,
}

/// Filter for `list_dag_instance`. Results are ordered by `updatedAt DESC`.
#[derive(Debug, Clone, Default)]
pub struct ListDagInstanceInput {
    pub status: Vec<DagInstanceStatus>,
    pub worker: Option<String>,
    /// Only rows with `updatedAt <= updated_end`.
    pub updated_end: Option<i64>,
    /// Only rows with (or without) a pending command.
    pub has_cmd: Option<bool>,
    pub limit: Option<usize>,
}

/// Filter for `list_task_instance`.
#[derive(Debug, Clone, Default)]
pub struct ListTaskInstanceInput {
    pub ids: Vec<String>,
    pub status: Vec<TaskInstanceStatus>,
    pub dag_ins_id: Option<String>,
    /// Only rows with `updatedAt <= now - 5s`.
    pub expired: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Identifies the backend in logs.
    fn name(&self) -> &str;

    // Dag templates. Create and update validate that the task list forms a
    // DAG before persisting anything.
    async fn create_dag(&self, dag: &mut Dag) -> Result<()>;
    async fn update_dag(&self, dag: &mut Dag) -> Result<()>;
    async fn get_dag(&self, id: &str) -> Result<Dag>;
    async fn batch_delete_dag(&self, ids: &[String]) -> Result<()>;

    // Dag instances.
    async fn create_dag_ins(&self, ins: &mut DagInstance) -> Result<()>;
    /// Full-row update. Publishes `DagInstanceUpdated` after success.
    async fn update_dag_ins(&self, ins: &mut DagInstance) -> Result<()>;
    async fn batch_update_dag_ins(&self, ins: &mut [DagInstance]) -> Result<()>;
    /// Writes only `fields`. Publishes `DagInstancePatched` carrying them.
    async fn patch_dag_ins(&self, ins: &DagInstance, fields: &[DagInsField]) -> Result<()>;
    /// The claim primitive: atomically sets `worker` and moves the instance
    /// to `Scheduled` iff the row is unowned and still claimable
    /// (`Init`/`Scheduled`, or `Blocked` so a re-claimed owner can serve its
    /// pending command). Returns `false` when the race was lost.
    async fn claim_dag_ins(&self, id: &str, worker: &str) -> Result<bool>;
    async fn get_dag_instance(&self, id: &str) -> Result<DagInstance>;
    async fn list_dag_instance(&self, input: &ListDagInstanceInput) -> Result<Vec<DagInstance>>;
    async fn batch_delete_dag_ins(&self, ids: &[String]) -> Result<()>;

    // Task instances.
    async fn create_task_ins(&self, ins: &mut TaskInstance) -> Result<()>;
    async fn batch_creat_task_ins(&self, ins: &mut [TaskInstance]) -> Result<()>;
    /// Writes only `fields`.
    async fn patch_task_ins(&self, ins: &TaskInstance, fields: &[TaskInsField]) -> Result<()>;
    async fn batch_update_task_ins(&self, ins: &mut [TaskInstance]) -> Result<()>;
    async fn get_task_ins(&self, id: &str) -> Result<TaskInstance>;
    async fn list_task_instance(&self, input: &ListTaskInstanceInput) -> Result<Vec<TaskInstance>>;
    async fn batch_delete_task_ins(&self, ids: &[String]) -> Result<()>;
}

//! Persisted entities.
//!
//! Field names serialize in camelCase so that backends mapping rows to JSON
//! documents keep the `<prefix>_dag` / `<prefix>_dag_instance` /
//! `<prefix>_task_instance` table shape stable across implementations.

mod dag;
mod instance;

pub use self::dag::{Dag, DagStatus, DagVar, DagVars, PreCheck, PreCheckAct, PreCheckCondition, PreCheckOp, PreCheckSource, Task, Trigger};
pub use self::instance::{
    Command, CommandName, CommandOptions, DagInstance, DagInstanceStatus, InstanceVar, ShareData,
    TaskInstance, TaskInstanceStatus, TaskTrace,
};

use serde::{Deserialize, Serialize};

/// Returns the current wall clock as unix seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Identity and timestamps embedded by every persisted entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "createdAt")]
    pub created_at: i64,
    #[serde(default, rename = "updatedAt")]
    pub updated_at: i64,
}

impl BaseInfo {
    /// Assigns an id when empty and stamps both timestamps. Called by stores
    /// on create.
    pub fn initial(&mut self) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        let now = now_secs();
        self.created_at = now;
        self.updated_at = now;
    }

    /// Advances `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        self.updated_at = self.updated_at.max(now_secs());
    }
}

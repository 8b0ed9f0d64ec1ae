use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{now_secs, BaseInfo, Task, Trigger};
use crate::{Error, Result};

/// One execution of a dag template.
///
/// An instance is owned by at most one worker at a time; `worker` is the
/// ownership field and is claimed through a CAS on the store. Reaching
/// `Success` or `Failed` clears ownership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DagInstance {
    #[serde(flatten)]
    pub base: BaseInfo,
    #[serde(rename = "dagId")]
    pub dag_id: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub vars: HashMap<String, InstanceVar>,
    #[serde(default, rename = "shareData")]
    pub share_data: ShareData,
    pub status: DagInstanceStatus,
    #[serde(default)]
    pub worker: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Command>,
    #[serde(default, rename = "cmdOptions", skip_serializing_if = "Option::is_none")]
    pub cmd_options: Option<CommandOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceVar {
    #[serde(default)]
    pub value: String,
}

/// Key/value data shared by the tasks of one instance, mutable during the
/// run. Access inside the owning worker is serialized by the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareData {
    #[serde(default)]
    pub dict: HashMap<String, String>,
}

impl ShareData {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.dict.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.dict.insert(key.into(), value.into());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DagInstanceStatus {
    #[default]
    Init,
    Scheduled,
    Running,
    Blocked,
    Success,
    Failed,
}

impl DagInstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl DagInstance {
    /// Whether `name` may be attached right now. At most one command can be
    /// pending, `Cancel` needs something left to cancel, `Retry` is the one
    /// command that may revive a `Failed` instance, and `Continue` only
    /// makes sense while tasks can be blocked.
    pub fn can_accept_cmd(&self, name: CommandName) -> bool {
        if self.cmd.is_some() {
            return false;
        }
        match name {
            CommandName::Cancel => !self.status.is_terminal(),
            CommandName::Retry => matches!(
                self.status,
                DagInstanceStatus::Running | DagInstanceStatus::Blocked | DagInstanceStatus::Failed
            ),
            CommandName::Continue => matches!(
                self.status,
                DagInstanceStatus::Running | DagInstanceStatus::Blocked
            ),
        }
    }

    fn attach_cmd(&mut self, cmd: Command) -> Result<()> {
        if !self.can_accept_cmd(cmd.name) {
            return Err(Error::Conflict(format!(
                "dag instance `{}` cannot accept {:?} (status {:?}, pending cmd: {})",
                self.base.id,
                cmd.name,
                self.status,
                self.cmd.is_some(),
            )));
        }
        self.cmd = Some(cmd);
        Ok(())
    }

    /// Attaches a `Cancel` command. Empty targets cancel every non-terminal
    /// task of the instance.
    pub fn cancel(&mut self, target_task_ins_ids: Vec<String>) -> Result<()> {
        self.attach_cmd(Command {
            name: CommandName::Cancel,
            target_task_ins_ids,
        })
    }

    /// Attaches a `Retry` command for failed tasks.
    pub fn retry(&mut self, target_task_ins_ids: Vec<String>) -> Result<()> {
        self.attach_cmd(Command {
            name: CommandName::Retry,
            target_task_ins_ids,
        })
    }

    /// Attaches a `Continue` command for blocked tasks.
    pub fn continue_run(&mut self, target_task_ins_ids: Vec<String>) -> Result<()> {
        self.attach_cmd(Command {
            name: CommandName::Continue,
            target_task_ins_ids,
        })
    }

    /// Resolves a variable reference the way the templating pass does:
    /// instance value first, nothing else.
    pub fn var_value(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|v| v.value.as_str())
    }
}

/// A user-issued control signal carried inline on the instance row. The
/// dispatcher consumes and clears it before making any new dispatch
/// decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: CommandName,
    #[serde(default, rename = "targetTaskInsIDs")]
    pub target_task_ins_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandName {
    Retry,
    Cancel,
    Continue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One execution of a template task within a dag instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInstance {
    #[serde(flatten)]
    pub base: BaseInfo,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "dagInsId")]
    pub dag_ins_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "actionName")]
    pub action_name: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, rename = "timeoutSecs")]
    pub timeout_secs: u64,
    #[serde(default, rename = "dependOn")]
    pub depend_on: Vec<String>,
    pub status: TaskInstanceStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub traces: Vec<TaskTrace>,
    #[serde(default, rename = "preChecks", skip_serializing_if = "HashMap::is_empty")]
    pub pre_checks: HashMap<String, super::PreCheck>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskInstanceStatus {
    #[default]
    Init,
    Running,
    Ending,
    Retrying,
    Success,
    Failed,
    Canceled,
    Blocked,
    Skipped,
}

impl TaskInstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Canceled | Self::Skipped
        )
    }

    /// In-flight states the dispatcher must leave alone.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Running | Self::Ending | Self::Retrying)
    }
}

/// An append-only execution note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTrace {
    pub ts: i64,
    pub message: String,
}

impl TaskInstance {
    /// Materializes a task instance from its template declaration. `params`
    /// are expected to be rendered already.
    pub fn from_task(dag_ins_id: &str, task: &Task, params: serde_json::Value) -> Self {
        Self {
            base: BaseInfo::default(),
            task_id: task.id.clone(),
            dag_ins_id: dag_ins_id.to_string(),
            name: if task.name.is_empty() {
                task.id.clone()
            } else {
                task.name.clone()
            },
            action_name: task.action_name.clone(),
            params,
            timeout_secs: task.timeout_secs,
            depend_on: task.depend_on.clone(),
            status: TaskInstanceStatus::Init,
            reason: String::new(),
            traces: Vec::new(),
            pre_checks: task.pre_checks.clone(),
        }
    }

    pub fn append_trace(&mut self, message: impl Into<String>) {
        self.traces.push(TaskTrace {
            ts: now_secs(),
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_attachment_is_exclusive() {
        let mut ins = DagInstance {
            status: DagInstanceStatus::Running,
            ..Default::default()
        };

        ins.cancel(vec![]).unwrap();
        assert!(ins.retry(vec![]).is_err());

        ins.cmd = None;
        ins.retry(vec!["t1".into()]).unwrap();
        assert_eq!(
            ins.cmd.as_ref().unwrap().name,
            CommandName::Retry
        );
    }

    #[test]
    fn terminal_instance_rejects_most_commands() {
        let mut ins = DagInstance {
            status: DagInstanceStatus::Success,
            ..Default::default()
        };
        assert!(ins.cancel(vec![]).is_err());
        assert!(ins.retry(vec![]).is_err());

        // Retry alone may revive a failed instance.
        ins.status = DagInstanceStatus::Failed;
        assert!(ins.continue_run(vec![]).is_err());
        ins.retry(vec![]).unwrap();
    }

    #[test]
    fn status_classification() {
        assert!(TaskInstanceStatus::Skipped.is_terminal());
        assert!(TaskInstanceStatus::Ending.is_in_flight());
        assert!(!TaskInstanceStatus::Blocked.is_terminal());
        assert!(!TaskInstanceStatus::Blocked.is_in_flight());
    }
}

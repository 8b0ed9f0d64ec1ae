use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{BaseInfo, DagInstance, DagInstanceStatus, InstanceVar, ShareData};
use crate::{Result, ValidationError};

/// A dag template. Instances are executed from it; the template itself never
/// changes during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dag {
    #[serde(flatten)]
    pub base: BaseInfo,
    pub name: String,
    #[serde(default)]
    pub vars: DagVars,
    pub status: DagStatus,
    pub tasks: Vec<Task>,
}

pub type DagVars = HashMap<String, DagVar>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagVar {
    #[serde(default, rename = "defaultValue")]
    pub default_value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DagStatus {
    #[default]
    Normal,
    Stopped,
}

/// How a dag instance came to be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Manual,
    Cron,
}

impl Dag {
    /// Builds a runnable instance of this template.
    ///
    /// Per-run `vars` override the template defaults; names the template does
    /// not declare are carried through untouched so that ad-hoc variables can
    /// still be referenced from task params. A stopped template refuses to
    /// run.
    pub fn run(
        &self,
        trigger: Trigger,
        vars: Option<HashMap<String, String>>,
    ) -> Result<DagInstance> {
        if self.status == DagStatus::Stopped {
            return Err(ValidationError::DagStopped(self.base.id.clone()).into());
        }

        let mut merged: HashMap<String, InstanceVar> = self
            .vars
            .iter()
            .map(|(name, var)| {
                (
                    name.clone(),
                    InstanceVar {
                        value: var.default_value.clone(),
                    },
                )
            })
            .collect();
        if let Some(overrides) = vars {
            for (name, value) in overrides {
                merged.insert(name, InstanceVar { value });
            }
        }

        Ok(DagInstance {
            base: BaseInfo::default(),
            dag_id: self.base.id.clone(),
            trigger,
            vars: merged,
            share_data: ShareData::default(),
            status: DagInstanceStatus::Init,
            worker: String::new(),
            reason: String::new(),
            cmd: None,
            cmd_options: None,
        })
    }
}

/// A task declaration inside a dag template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
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
    #[serde(default, rename = "preChecks", skip_serializing_if = "HashMap::is_empty")]
    pub pre_checks: HashMap<String, PreCheck>,
}

/// A guard evaluated right before a task would be enqueued. When every
/// condition holds, `act` is applied instead of running the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreCheck {
    pub act: PreCheckAct,
    #[serde(default)]
    pub conditions: Vec<PreCheckCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreCheckAct {
    Block,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreCheckCondition {
    pub source: PreCheckSource,
    pub op: PreCheckOp,
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreCheckSource {
    Vars,
    ShareData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreCheckOp {
    In,
    NotIn,
}

impl PreCheckCondition {
    /// Evaluates the condition against a resolved value for `key`.
    pub fn matches(&self, value: Option<&str>) -> bool {
        let contained = value.map_or(false, |v| self.values.iter().any(|want| want == v));
        match self.op {
            PreCheckOp::In => contained,
            PreCheckOp::NotIn => !contained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Dag {
        Dag {
            base: BaseInfo {
                id: "dag-1".into(),
                ..Default::default()
            },
            name: "demo".into(),
            vars: HashMap::from([(
                "region".to_string(),
                DagVar {
                    default_value: "eu-west-1".into(),
                },
            )]),
            status: DagStatus::Normal,
            tasks: vec![Task {
                id: "t1".into(),
                action_name: "noop".into(),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn run_applies_defaults_and_overrides() {
        let dag = template();

        let ins = dag.run(Trigger::Manual, None).unwrap();
        assert_eq!(ins.vars["region"].value, "eu-west-1");
        assert_eq!(ins.status, DagInstanceStatus::Init);
        assert_eq!(ins.dag_id, "dag-1");

        let ins = dag
            .run(
                Trigger::Manual,
                Some(HashMap::from([("region".to_string(), "us-east-2".to_string())])),
            )
            .unwrap();
        assert_eq!(ins.vars["region"].value, "us-east-2");
    }

    #[test]
    fn stopped_template_refuses_to_run() {
        let mut dag = template();
        dag.status = DagStatus::Stopped;
        let err = dag.run(Trigger::Manual, None).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Validation(ValidationError::DagStopped(_))
        ));
    }

    #[test]
    fn pre_check_condition_ops() {
        let cond = PreCheckCondition {
            source: PreCheckSource::Vars,
            op: PreCheckOp::In,
            key: "env".into(),
            values: vec!["prod".into(), "staging".into()],
        };
        assert!(cond.matches(Some("prod")));
        assert!(!cond.matches(Some("dev")));
        assert!(!cond.matches(None));

        let cond = PreCheckCondition {
            op: PreCheckOp::NotIn,
            ..cond
        };
        assert!(!cond.matches(Some("prod")));
        assert!(cond.matches(Some("dev")));
        assert!(cond.matches(None));
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use dagrun_core::entity::{now_secs, Dag, DagInstance, DagInstanceStatus, TaskInstance};
use dagrun_core::event::{DagInstancePatched, DagInstanceUpdated, Event, EventBus};
use dagrun_core::graph::TaskGraph;
use dagrun_core::store::{
    DagInsField, ListDagInstanceInput, ListTaskInstanceInput, Store, TaskInsField,
};
use dagrun_core::{Error, Result};
use parking_lot::RwLock;

const EXPIRED_AFTER_SECS: i64 = 5;

#[derive(Default)]
struct Tables {
    dags: HashMap<String, Dag>,
    dag_ins: HashMap<String, DagInstance>,
    task_ins: HashMap<String, TaskInstance>,
}

/// A store backed by process memory.
///
/// Rows are deep-cloned on the way in and out, so callers never share
/// mutable state with the tables. Every contract event is published on the
/// bus handed in at construction; engines must subscribe to that same bus.
pub struct MemStore {
    tables: RwLock<Tables>,
    bus: EventBus,
}

impl MemStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            bus,
        }
    }

    fn updated_event(ins: &DagInstance) -> Event {
        Event::DagInstanceUpdated(DagInstanceUpdated {
            id: ins.base.id.clone(),
            worker: ins.worker.clone(),
            status: ins.status,
        })
    }
}

#[async_trait]
impl Store for MemStore {
    fn name(&self) -> &str {
        "mem"
    }

    async fn create_dag(&self, dag: &mut Dag) -> Result<()> {
        // Reject anything that is not a DAG before a single row lands.
        TaskGraph::build(&dag.tasks)?;
        dag.base.initial();

        let mut tables = self.tables.write();
        if tables.dags.contains_key(&dag.base.id) {
            return Err(Error::Conflict(format!("dag `{}` already exists", dag.base.id)));
        }
        tables.dags.insert(dag.base.id.clone(), dag.clone());
        Ok(())
    }

    async fn update_dag(&self, dag: &mut Dag) -> Result<()> {
        TaskGraph::build(&dag.tasks)?;

        let mut tables = self.tables.write();
        let stored = tables
            .dags
            .get(&dag.base.id)
            .ok_or_else(|| Error::not_found("dag", &dag.base.id))?;
        dag.base.created_at = stored.base.created_at;
        dag.base.updated_at = stored.base.updated_at.max(now_secs());
        tables.dags.insert(dag.base.id.clone(), dag.clone());
        Ok(())
    }

    async fn get_dag(&self, id: &str) -> Result<Dag> {
        self.tables
            .read()
            .dags
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("dag", id))
    }

    async fn batch_delete_dag(&self, ids: &[String]) -> Result<()> {
        let mut tables = self.tables.write();
        for id in ids {
            tables.dags.remove(id);
        }
        Ok(())
    }

    async fn create_dag_ins(&self, ins: &mut DagInstance) -> Result<()> {
        ins.base.initial();
        let mut tables = self.tables.write();
        if tables.dag_ins.contains_key(&ins.base.id) {
            return Err(Error::Conflict(format!(
                "dag instance `{}` already exists",
                ins.base.id
            )));
        }
        tables.dag_ins.insert(ins.base.id.clone(), ins.clone());
        Ok(())
    }

    async fn update_dag_ins(&self, ins: &mut DagInstance) -> Result<()> {
        {
            let mut tables = self.tables.write();
            let stored = tables
                .dag_ins
                .get(&ins.base.id)
                .ok_or_else(|| Error::not_found("dag instance", &ins.base.id))?;
            ins.base.created_at = stored.base.created_at;
            ins.base.updated_at = stored.base.updated_at.max(now_secs());
            tables.dag_ins.insert(ins.base.id.clone(), ins.clone());
        }
        self.bus.publish(Self::updated_event(ins));
        Ok(())
    }

    async fn batch_update_dag_ins(&self, ins: &mut [DagInstance]) -> Result<()> {
        for ins in ins {
            self.update_dag_ins(ins).await?;
        }
        Ok(())
    }

    async fn patch_dag_ins(&self, ins: &DagInstance, fields: &[DagInsField]) -> Result<()> {
        let patched = {
            let mut tables = self.tables.write();
            let stored = tables
                .dag_ins
                .get_mut(&ins.base.id)
                .ok_or_else(|| Error::not_found("dag instance", &ins.base.id))?;
            for field in fields {
                match field {
                    DagInsField::Status => stored.status = ins.status,
                    DagInsField::Worker => stored.worker = ins.worker.clone(),
                    DagInsField::ShareData => stored.share_data = ins.share_data.clone(),
                    DagInsField::Cmd => {
                        stored.cmd = ins.cmd.clone();
                        stored.cmd_options = ins.cmd_options.clone();
                    }
                    DagInsField::Reason => stored.reason = ins.reason.clone(),
                }
            }
            stored.base.updated_at = stored.base.updated_at.max(now_secs());
            stored.worker.clone()
        };

        self.bus.publish(Event::DagInstancePatched(DagInstancePatched {
            id: ins.base.id.clone(),
            worker: patched,
            fields: fields.to_vec(),
        }));
        Ok(())
    }

    async fn claim_dag_ins(&self, id: &str, worker: &str) -> Result<bool> {
        let claimed = {
            let mut tables = self.tables.write();
            let stored = tables
                .dag_ins
                .get_mut(id)
                .ok_or_else(|| Error::not_found("dag instance", id))?;

            if !stored.worker.is_empty() {
                return Ok(false);
            }
            match stored.status {
                DagInstanceStatus::Init | DagInstanceStatus::Scheduled => {
                    stored.status = DagInstanceStatus::Scheduled;
                }
                // A blocked instance, or a failed one with a command pending,
                // needs a serving worker but keeps its status.
                DagInstanceStatus::Blocked => {}
                DagInstanceStatus::Failed if stored.cmd.is_some() => {}
                _ => return Ok(false),
            }
            stored.worker = worker.to_string();
            stored.base.updated_at = stored.base.updated_at.max(now_secs());
            stored.clone()
        };

        self.bus.publish(Self::updated_event(&claimed));
        Ok(true)
    }

    async fn get_dag_instance(&self, id: &str) -> Result<DagInstance> {
        self.tables
            .read()
            .dag_ins
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("dag instance", id))
    }

    async fn list_dag_instance(&self, input: &ListDagInstanceInput) -> Result<Vec<DagInstance>> {
        let tables = self.tables.read();
        let mut out: Vec<DagInstance> = tables
            .dag_ins
            .values()
            .filter(|ins| input.status.is_empty() || input.status.contains(&ins.status))
            .filter(|ins| input.worker.as_ref().map_or(true, |w| &ins.worker == w))
            .filter(|ins| input.updated_end.map_or(true, |end| ins.base.updated_at <= end))
            .filter(|ins| input.has_cmd.map_or(true, |want| ins.cmd.is_some() == want))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.base.updated_at.cmp(&a.base.updated_at));
        if let Some(limit) = input.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn batch_delete_dag_ins(&self, ids: &[String]) -> Result<()> {
        let mut tables = self.tables.write();
        for id in ids {
            tables.dag_ins.remove(id);
        }
        Ok(())
    }

    async fn create_task_ins(&self, ins: &mut TaskInstance) -> Result<()> {
        ins.base.initial();
        let mut tables = self.tables.write();
        if tables.task_ins.contains_key(&ins.base.id) {
            return Err(Error::Conflict(format!(
                "task instance `{}` already exists",
                ins.base.id
            )));
        }
        tables.task_ins.insert(ins.base.id.clone(), ins.clone());
        Ok(())
    }

    async fn batch_creat_task_ins(&self, ins: &mut [TaskInstance]) -> Result<()> {
        for ins in ins {
            self.create_task_ins(ins).await?;
        }
        Ok(())
    }

    async fn patch_task_ins(&self, ins: &TaskInstance, fields: &[TaskInsField]) -> Result<()> {
        let mut tables = self.tables.write();
        let stored = tables
            .task_ins
            .get_mut(&ins.base.id)
            .ok_or_else(|| Error::not_found("task instance", &ins.base.id))?;
        for field in fields {
            match field {
                TaskInsField::Status => stored.status = ins.status,
                TaskInsField::Reason => stored.reason = ins.reason.clone(),
                TaskInsField::Traces => stored.traces = ins.traces.clone(),
            }
        }
        stored.base.updated_at = stored.base.updated_at.max(now_secs());
        Ok(())
    }

    async fn batch_update_task_ins(&self, ins: &mut [TaskInstance]) -> Result<()> {
        let mut tables = self.tables.write();
        for ins in ins {
            let stored = tables
                .task_ins
                .get(&ins.base.id)
                .ok_or_else(|| Error::not_found("task instance", &ins.base.id))?;
            ins.base.created_at = stored.base.created_at;
            ins.base.updated_at = stored.base.updated_at.max(now_secs());
            tables.task_ins.insert(ins.base.id.clone(), ins.clone());
        }
        Ok(())
    }

    async fn get_task_ins(&self, id: &str) -> Result<TaskInstance> {
        self.tables
            .read()
            .task_ins
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("task instance", id))
    }

    async fn list_task_instance(&self, input: &ListTaskInstanceInput) -> Result<Vec<TaskInstance>> {
        let cutoff = now_secs() - EXPIRED_AFTER_SECS;
        let tables = self.tables.read();
        let mut out: Vec<TaskInstance> = tables
            .task_ins
            .values()
            .filter(|ti| input.ids.is_empty() || input.ids.contains(&ti.base.id))
            .filter(|ti| input.status.is_empty() || input.status.contains(&ti.status))
            .filter(|ti| {
                input
                    .dag_ins_id
                    .as_ref()
                    .map_or(true, |id| &ti.dag_ins_id == id)
            })
            .filter(|ti| !input.expired || ti.base.updated_at <= cutoff)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.base.updated_at.cmp(&a.base.updated_at));
        Ok(out)
    }

    async fn batch_delete_task_ins(&self, ids: &[String]) -> Result<()> {
        let mut tables = self.tables.write();
        for id in ids {
            tables.task_ins.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dagrun_core::entity::{Task, Trigger};
    use dagrun_core::ValidationError;

    use super::*;

    fn store() -> MemStore {
        MemStore::new(EventBus::default())
    }

    fn dag(id: &str, tasks: Vec<Task>) -> Dag {
        let mut dag = Dag {
            name: id.to_string(),
            tasks,
            ..Default::default()
        };
        dag.base.id = id.to_string();
        dag
    }

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.into(),
            action_name: "noop".into(),
            depend_on: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_read_roundtrips() {
        let store = store();
        let mut dag = dag("d1", vec![task("a", &[])]);
        store.create_dag(&mut dag).await.unwrap();

        let read = store.get_dag("d1").await.unwrap();
        assert_eq!(read.name, "d1");
        assert!(read.base.created_at > 0);
    }

    #[tokio::test]
    async fn cyclic_dag_persists_nothing() {
        let store = store();
        let mut bad = dag("d1", vec![task("a", &["b"]), task("b", &["a"])]);

        let err = store.create_dag(&mut bad).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::CycleDetected(_))
        ));
        assert!(store.get_dag("d1").await.is_err());
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let store = store();
        let mut dag = dag("d1", vec![task("a", &[])]);
        store.create_dag(&mut dag).await.unwrap();
        let mut ins = dag.run(Trigger::Manual, None).unwrap();
        store.create_dag_ins(&mut ins).await.unwrap();

        assert!(store.claim_dag_ins(&ins.base.id, "w1").await.unwrap());
        assert!(!store.claim_dag_ins(&ins.base.id, "w2").await.unwrap());

        let read = store.get_dag_instance(&ins.base.id).await.unwrap();
        assert_eq!(read.worker, "w1");
        assert_eq!(read.status, DagInstanceStatus::Scheduled);
    }

    #[tokio::test]
    async fn patch_touches_only_named_fields() {
        let store = store();
        let mut dag = dag("d1", vec![task("a", &[])]);
        store.create_dag(&mut dag).await.unwrap();
        let mut ins = dag.run(Trigger::Manual, None).unwrap();
        ins.reason = "original".into();
        store.create_dag_ins(&mut ins).await.unwrap();

        let mut patch = ins.clone();
        patch.status = DagInstanceStatus::Running;
        patch.reason = "should not land".into();
        store
            .patch_dag_ins(&patch, &[DagInsField::Status])
            .await
            .unwrap();

        let read = store.get_dag_instance(&ins.base.id).await.unwrap();
        assert_eq!(read.status, DagInstanceStatus::Running);
        assert_eq!(read.reason, "original");
    }

    #[tokio::test]
    async fn list_dag_instance_filters_and_orders() {
        let store = store();
        let mut dag = dag("d1", vec![task("a", &[])]);
        store.create_dag(&mut dag).await.unwrap();

        let mut first = dag.run(Trigger::Manual, None).unwrap();
        store.create_dag_ins(&mut first).await.unwrap();
        let mut second = dag.run(Trigger::Manual, None).unwrap();
        store.create_dag_ins(&mut second).await.unwrap();
        assert!(store.claim_dag_ins(&second.base.id, "w1").await.unwrap());

        let unowned = store
            .list_dag_instance(&ListDagInstanceInput {
                worker: Some(String::new()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unowned.len(), 1);
        assert_eq!(unowned[0].base.id, first.base.id);

        let scheduled = store
            .list_dag_instance(&ListDagInstanceInput {
                status: vec![DagInstanceStatus::Scheduled],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].base.id, second.base.id);

        let none_with_cmd = store
            .list_dag_instance(&ListDagInstanceInput {
                has_cmd: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none_with_cmd.is_empty());

        let limited = store
            .list_dag_instance(&ListDagInstanceInput {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn updated_at_never_moves_backwards() {
        let store = store();
        let mut dag = dag("d1", vec![task("a", &[])]);
        store.create_dag(&mut dag).await.unwrap();
        let mut ins = dag.run(Trigger::Manual, None).unwrap();
        store.create_dag_ins(&mut ins).await.unwrap();

        let before = store.get_dag_instance(&ins.base.id).await.unwrap();
        store.update_dag_ins(&mut ins).await.unwrap();
        let after = store.get_dag_instance(&ins.base.id).await.unwrap();
        assert!(after.base.updated_at >= before.base.updated_at);
    }
}

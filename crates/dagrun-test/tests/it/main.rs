use dagrun_core::entity::{Dag, DagVar, Task};

mod basic;
mod commands;
mod failover;
mod failure;
mod shutdown;
mod validation;

pub fn dag(name: &str, tasks: Vec<Task>) -> Dag {
    Dag {
        name: name.to_string(),
        tasks,
        ..Default::default()
    }
}

pub fn dag_with_var(name: &str, var: (&str, &str), tasks: Vec<Task>) -> Dag {
    let mut dag = dag(name, tasks);
    dag.vars.insert(
        var.0.to_string(),
        DagVar {
            default_value: var.1.to_string(),
        },
    );
    dag
}

pub fn task(id: &str, action: &str, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        action_name: action.to_string(),
        depend_on: deps.iter().map(|d| d.to_string()).collect(),
        ..Default::default()
    }
}

pub fn task_with_params(id: &str, action: &str, deps: &[&str], params: serde_json::Value) -> Task {
    Task {
        params,
        ..task(id, action, deps)
    }
}

pub fn sleep_task(id: &str, deps: &[&str], millis: u64) -> Task {
    task_with_params(id, dagrun_test::SLEEP, deps, serde_json::json!({ "millis": millis }))
}

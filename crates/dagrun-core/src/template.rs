//! Parameter templating.
//!
//! Before task params are handed to an action they are rendered by replacing
//! `{{name}}` references in string values with the instance's variables.
//! Rendering is a single pass: substituted text is never re-scanned, so
//! variables cannot expand into further references.

use std::collections::HashMap;

use serde_json::Value;

use crate::entity::{Dag, DagInstance};

/// The resolved variable table for one instance: instance value first,
/// template default otherwise.
pub fn resolve_vars(dag: &Dag, ins: &DagInstance) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = dag
        .vars
        .iter()
        .map(|(name, var)| (name.clone(), var.default_value.clone()))
        .collect();
    for (name, var) in &ins.vars {
        vars.insert(name.clone(), var.value.clone());
    }
    vars
}

/// Renders every string inside `params`, walking arrays and objects.
///
/// Unknown names render to the empty string and are reported through
/// `unresolved` so the caller can leave a trace.
pub fn render_params(
    params: &Value,
    vars: &HashMap<String, String>,
    unresolved: &mut Vec<String>,
) -> Value {
    match params {
        Value::String(s) => Value::String(render_str(s, vars, unresolved)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_params(item, vars, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), render_params(item, vars, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_str(input: &str, vars: &HashMap<String, String>, unresolved: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => unresolved.push(name.to_string()),
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated reference: keep the text verbatim.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

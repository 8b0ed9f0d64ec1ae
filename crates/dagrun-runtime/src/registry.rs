//! Process-wide action registry.
//!
//! Written once before the engine starts, read-only afterwards. Templates
//! referencing an unregistered name fail validation at parse time.

use std::collections::BTreeMap;
use std::sync::Arc;

use dagrun_core::action::Action;
use parking_lot::RwLock;

static ACTIONS: RwLock<BTreeMap<String, Arc<dyn Action>>> = RwLock::new(BTreeMap::new());

/// Registers actions under their `name()`.
///
/// Call before any engine starts. Registering two actions under the same
/// name is a programming error and panics.
pub fn register_actions<I>(actions: I)
where
    I: IntoIterator<Item = Arc<dyn Action>>,
{
    let mut registry = ACTIONS.write();
    for action in actions {
        let name = action.name().to_string();
        if registry.insert(name.clone(), action).is_some() {
            panic!("action `{name}` registered twice");
        }
    }
}

pub(crate) fn get_action(name: &str) -> Option<Arc<dyn Action>> {
    ACTIONS.read().get(name).cloned()
}

pub(crate) fn has_action(name: &str) -> bool {
    ACTIONS.read().contains_key(name)
}

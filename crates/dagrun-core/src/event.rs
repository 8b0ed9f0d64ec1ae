//! In-process event bus.
//!
//! Couples store mutations to parser/dispatcher wake-ups without hot
//! polling. Fan-out is synchronous on publish; subscribers must not block —
//! they schedule work. A lagged subscriber receives
//! [`tokio::sync::broadcast::error::RecvError::Lagged`] and is expected to
//! fall back to a full sweep.

use tokio::sync::broadcast;

use crate::entity::{DagInstanceStatus, TaskInstanceStatus};
use crate::store::DagInsField;

#[derive(Debug, Clone)]
pub enum Event {
    /// Published after every successful `UpdateDagIns` (and batch variant).
    DagInstanceUpdated(DagInstanceUpdated),

    /// Published after every successful `PatchDagIns`, carrying the explicit
    /// must-patch field list so the dispatcher knows what changed.
    DagInstancePatched(DagInstancePatched),

    /// Published by the executor when a task instance finished a transition.
    TaskInstanceUpdated(TaskInstanceUpdated),
}

#[derive(Debug, Clone)]
pub struct DagInstanceUpdated {
    pub id: String,
    pub worker: String,
    pub status: DagInstanceStatus,
}

#[derive(Debug, Clone)]
pub struct DagInstancePatched {
    pub id: String,
    pub worker: String,
    pub fields: Vec<DagInsField>,
}

#[derive(Debug, Clone)]
pub struct TaskInstanceUpdated {
    pub id: String,
    pub dag_ins_id: String,
    pub status: TaskInstanceStatus,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    /// Publishes to every current subscriber. A bus without subscribers
    /// swallows the event; that is fine, nothing is running that would care.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::TaskInstanceUpdated(TaskInstanceUpdated {
            id: "ti".into(),
            dag_ins_id: "di".into(),
            status: TaskInstanceStatus::Success,
        }));

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                Event::TaskInstanceUpdated(ev) => assert_eq!(ev.dag_ins_id, "di"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::default();
        bus.publish(Event::DagInstanceUpdated(DagInstanceUpdated {
            id: "x".into(),
            worker: String::new(),
            status: DagInstanceStatus::Init,
        }));
    }
}

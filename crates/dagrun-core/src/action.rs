//! The user-supplied unit of work bound to a task by name.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::entity::TaskInstance;
use crate::Result;

/// How a trace should be persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TraceOp {
    /// Buffer in memory. Buffered traces are flushed together with any
    /// persist-after-action trace, and always when the task fails.
    #[default]
    Buffered,
    /// Flush the accumulated buffer once the action returns.
    PersistAfterAction,
}

/// The execution environment handed to every action stage.
///
/// All methods observe the task's cancellation; share-data access is
/// serialized per dag instance by the executor and writes are persisted
/// through the store before returning.
#[async_trait]
pub trait ExecuteContext: Send + Sync {
    /// Appends a buffered trace.
    fn trace(&self, message: &str) {
        self.trace_with(message, TraceOp::Buffered);
    }

    fn trace_with(&self, message: &str, op: TraceOp);

    /// Reads one key of the owning instance's share data.
    async fn share_get(&self, key: &str) -> Result<Option<String>>;

    /// Writes one key of the owning instance's share data and persists it.
    async fn share_set(&self, key: &str, value: &str) -> Result<()>;

    /// Resolves an instance variable the way params templating does.
    fn var_value(&self, name: &str) -> Option<String>;

    /// Cancelled when the task is being torn down. Long-running stages must
    /// observe it and return promptly.
    fn cancellation(&self) -> CancellationToken;

    /// The task instance being executed.
    fn task(&self) -> &TaskInstance;
}

/// An action as the process-wide registry sees it.
///
/// `params` arrive rendered (templating applied) but undeserialized; most
/// implementations want [`TypedAction`] instead and get this for free via
/// [`Typed`].
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    async fn run_before(&self, _ctx: &dyn ExecuteContext, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &dyn ExecuteContext, params: &Value) -> anyhow::Result<()>;

    async fn run_after(&self, _ctx: &dyn ExecuteContext, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An action with a typed parameter struct.
///
/// A fresh `Params` value is deserialized from the rendered task params for
/// each stage, replacing hand-rolled parameter plumbing with serde.
#[async_trait]
pub trait TypedAction: Send + Sync {
    type Params: DeserializeOwned + Send + Sync;

    fn name(&self) -> &str;

    async fn run_before(
        &self,
        _ctx: &dyn ExecuteContext,
        _params: &Self::Params,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &dyn ExecuteContext, params: &Self::Params) -> anyhow::Result<()>;

    async fn run_after(
        &self,
        _ctx: &dyn ExecuteContext,
        _params: &Self::Params,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Adapter registering a [`TypedAction`] as an [`Action`].
pub struct Typed<A>(pub A);

impl<A: TypedAction> Typed<A> {
    fn params(&self, params: &Value) -> anyhow::Result<A::Params> {
        serde_json::from_value(params.clone()).map_err(|e| {
            anyhow::anyhow!("action `{}`: params did not deserialize: {e}", self.0.name())
        })
    }
}

#[async_trait]
impl<A: TypedAction> Action for Typed<A> {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn run_before(&self, ctx: &dyn ExecuteContext, params: &Value) -> anyhow::Result<()> {
        let params = self.params(params)?;
        self.0.run_before(ctx, &params).await
    }

    async fn run(&self, ctx: &dyn ExecuteContext, params: &Value) -> anyhow::Result<()> {
        let params = self.params(params)?;
        self.0.run(ctx, &params).await
    }

    async fn run_after(&self, ctx: &dyn ExecuteContext, params: &Value) -> anyhow::Result<()> {
        let params = self.params(params)?;
        self.0.run_after(ctx, &params).await
    }
}

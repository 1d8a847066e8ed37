use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use agenthost_core::message::Msg;

use crate::context::{RequestContext, Resources};

/// Replies of one turn, forwarded to the caller as they are produced.
pub type MessageStream = BoxStream<'static, anyhow::Result<Msg>>;

/// The application hosted by the runtime.
#[async_trait]
pub trait AgentApp: Send + Sync {
    /// Runs once after every resource is open and before the first request.
    async fn on_startup(&self, _resources: &Resources) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handles one incoming message.
    ///
    /// The returned stream may keep using `ctx` until it ends. Mutations made
    /// through `ctx.state()` are persisted only when the stream completes
    /// without error.
    fn handle(self: Arc<Self>, msg: Msg, ctx: RequestContext) -> MessageStream;
}

/// Builds the hosted app once resources are available.
pub trait AppFactory: Send + Sync {
    fn create(&self, resources: &Resources) -> anyhow::Result<Arc<dyn AgentApp>>;
}

impl<F> AppFactory for F
where
    F: Fn(&Resources) -> anyhow::Result<Arc<dyn AgentApp>> + Send + Sync,
{
    fn create(&self, resources: &Resources) -> anyhow::Result<Arc<dyn AgentApp>> {
        self(resources)
    }
}

//! Built-in chat application served when no other app is linked in.
//!
//! Keeps the conversation under the `memory` state module and answers through
//! the `main` model (or the first configured one). Without any model it
//! echoes the incoming text.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::info;

use agenthost_agent::{AgentApp, MessageStream, RequestContext, Resources};
use agenthost_core::message::Msg;

pub const MEMORY_MODULE: &str = "memory";
const PREFERRED_MODEL: &str = "main";

pub struct ChatApp {
    model: Option<String>,
}

impl ChatApp {
    pub fn from_resources(resources: &Resources) -> Self {
        let model = if resources.models.contains(PREFERRED_MODEL) {
            Some(PREFERRED_MODEL.to_string())
        } else {
            resources.models.list_names().into_iter().next()
        };
        Self { model }
    }
}

pub fn factory(resources: &Resources) -> anyhow::Result<Arc<dyn AgentApp>> {
    Ok(Arc::new(ChatApp::from_resources(resources)))
}

#[async_trait]
impl AgentApp for ChatApp {
    async fn on_startup(&self, resources: &Resources) -> anyhow::Result<()> {
        info!(
            event_name = "chat.app.started",
            correlation_id = "bootstrap",
            model = self.model.as_deref().unwrap_or("echo"),
            tools = resources.tools.len(),
            "built-in chat app ready"
        );
        Ok(())
    }

    fn handle(self: Arc<Self>, msg: Msg, ctx: RequestContext) -> MessageStream {
        async_stream::try_stream! {
            let mut history: Vec<Msg> = match ctx.state().await.get(MEMORY_MODULE).cloned() {
                Some(memory) => serde_json::from_value(memory)?,
                None => Vec::new(),
            };
            history.push(msg.clone());

            let reply = match self.model.as_deref() {
                None => {
                    let reply = Msg::assistant(msg.text());
                    yield reply.clone();
                    reply
                }
                Some(name) => {
                    let model = Arc::clone(ctx.resources().model(name)?);
                    let mut chunks = model.stream(&history).await?;
                    let mut reply = Msg::assistant(String::new());
                    let mut text = String::new();

                    while let Some(chunk) = chunks.next().await {
                        let chunk = chunk?;
                        if chunk.delta.is_empty() {
                            continue;
                        }
                        text.push_str(&chunk.delta);
                        let mut part = Msg::assistant(chunk.delta);
                        part.id = reply.id.clone();
                        yield part;
                    }

                    reply.content = text.into();
                    reply
                }
            };

            history.push(reply);
            ctx.state().await.insert(MEMORY_MODULE, serde_json::to_value(&history)?);
        }
        .boxed()
    }
}

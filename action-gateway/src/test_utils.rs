use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::context::RequestContext;
use crate::error::InvokeError;
use crate::invoke::ActionInvoker;
use crate::invoke::ActionResponse;
use crate::invoke::Invoker;
use crate::json_ext::Value;

type Handler = dyn Fn(&str, &Value) -> Result<Value, InvokeError> + Send + Sync;

/// Backend double recording every invocation it receives.
#[derive(Clone)]
pub(crate) struct RecordingInvoker {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    callers: Arc<Mutex<Vec<String>>>,
    handler: Arc<Handler>,
    delay: Option<Duration>,
}

impl RecordingInvoker {
    pub(crate) fn new(
        handler: impl Fn(&str, &Value) -> Result<Value, InvokeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Default::default(),
            callers: Default::default(),
            handler: Arc::new(handler),
            delay: None,
        }
    }

    /// Replies `{"action": .., "params": ..}` to every call.
    pub(crate) fn echo() -> Self {
        Self::new(|action, params| Ok(serde_json::json!({"action": action, "params": params})))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    /// Identity of the principal behind each call, in call order.
    pub(crate) fn callers(&self) -> Vec<String> {
        self.callers.lock().clone()
    }

    pub(crate) fn invoker(&self) -> Invoker {
        Invoker::new(Arc::new(self.clone()), Duration::from_secs(5))
    }
}

#[async_trait]
impl ActionInvoker for RecordingInvoker {
    async fn invoke(
        &self,
        action: &str,
        params: Value,
        context: &RequestContext,
    ) -> Result<ActionResponse, InvokeError> {
        self.calls.lock().push((action.to_string(), params.clone()));
        self.callers.lock().push(context.identity().to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(action, &params).map(ActionResponse::Json)
    }
}

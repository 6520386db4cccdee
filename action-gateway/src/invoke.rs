//! The backend invocation seam.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tower::BoxError;

use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::error::InvokeError;
use crate::json_ext::Value;

/// Streamed response body.
pub type ByteStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// What an action returned.
pub enum ActionResponse {
    Json(Value),
    Bytes(Bytes),
    Stream(ByteStream),
}

impl fmt::Debug for ActionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionResponse::Json(value) => f.debug_tuple("Json").field(value).finish(),
            ActionResponse::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            ActionResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Value> for ActionResponse {
    fn from(value: Value) -> Self {
        ActionResponse::Json(value)
    }
}

impl ActionResponse {
    /// The JSON result. Binary results cannot be embedded in a JSON response.
    pub fn into_json(self, action: &str) -> Result<Value, GatewayError> {
        match self {
            ActionResponse::Json(value) => Ok(value),
            ActionResponse::Bytes(_) | ActionResponse::Stream(_) => Err(InvokeError::new(
                action,
                "returned a binary body where a JSON value was expected",
            )
            .into()),
        }
    }
}

/// The RPC transport used to call actions.
#[async_trait]
pub trait ActionInvoker: Send + Sync + 'static {
    async fn invoke(
        &self,
        action: &str,
        params: Value,
        context: &RequestContext,
    ) -> Result<ActionResponse, InvokeError>;
}

/// An [`ActionInvoker`] made of a closure.
pub struct InvokerFn<F>(F);

/// Builds an [`ActionInvoker`] from a closure returning a future.
pub fn invoker_fn<F, Fut>(f: F) -> InvokerFn<F>
where
    F: Fn(String, Value, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionResponse, InvokeError>> + Send + 'static,
{
    InvokerFn(f)
}

#[async_trait]
impl<F, Fut> ActionInvoker for InvokerFn<F>
where
    F: Fn(String, Value, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionResponse, InvokeError>> + Send + 'static,
{
    async fn invoke(
        &self,
        action: &str,
        params: Value,
        context: &RequestContext,
    ) -> Result<ActionResponse, InvokeError> {
        (self.0)(action.to_string(), params, context.clone()).await
    }
}

/// Calls the backend under the request timeout.
#[derive(Clone)]
pub(crate) struct Invoker {
    inner: Arc<dyn ActionInvoker>,
    default_timeout: Duration,
}

impl Invoker {
    pub(crate) fn new(inner: Arc<dyn ActionInvoker>, default_timeout: Duration) -> Self {
        Self {
            inner,
            default_timeout,
        }
    }

    /// The request timeout, or the configured default.
    pub(crate) fn timeout_for(&self, context: &RequestContext) -> Duration {
        context.timeout().unwrap_or(self.default_timeout)
    }

    pub(crate) async fn call(
        &self,
        action: &str,
        params: Value,
        context: &RequestContext,
    ) -> Result<ActionResponse, GatewayError> {
        let timeout = self.timeout_for(context);
        tracing::debug!(action, "invoking action");
        match tokio::time::timeout(timeout, self.inner.invoke(action, params, context)).await {
            Ok(result) => result.map_err(GatewayError::from),
            Err(_) => Err(GatewayError::Timeout {
                action: action.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub(crate) async fn call_json(
        &self,
        action: &str,
        params: Value,
        context: &RequestContext,
    ) -> Result<Value, GatewayError> {
        self.call(action, params, context).await?.into_json(action)
    }
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoker")
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let invoker = Invoker::new(
            Arc::new(invoker_fn(|_, _, _| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, InvokeError>(ActionResponse::Json(json!(null)))
            })),
            Duration::from_secs(1),
        );

        let error = invoker
            .call("slow.action", json!({}), &RequestContext::default())
            .await
            .unwrap_err();
        assert_eq!(
            error,
            GatewayError::Timeout {
                action: "slow.action".to_string(),
                timeout_ms: 1000
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_overrides_the_default() {
        let invoker = Invoker::new(
            Arc::new(invoker_fn(|_, _, _| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, InvokeError>(ActionResponse::Json(json!("done")))
            })),
            Duration::from_millis(100),
        );
        let context = RequestContext::builder()
            .timeout(Duration::from_secs(1))
            .build();

        let value = invoker.call_json("a", json!({}), &context).await.unwrap();
        assert_eq!(value, json!("done"));
    }

    #[tokio::test]
    async fn binary_results_are_not_json() {
        let invoker = Invoker::new(
            Arc::new(invoker_fn(|_, _, _| async {
                Ok::<_, InvokeError>(ActionResponse::Bytes(Bytes::from_static(b"raw")))
            })),
            Duration::from_secs(1),
        );
        let error = invoker
            .call_json("file.get", json!({}), &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(error, GatewayError::Invoke(_)));
    }
}

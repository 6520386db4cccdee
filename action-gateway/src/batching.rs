//! Coalescing of concurrent field resolutions into one multi-key call.
//!
//! Every resolution of a field whose resolver declares batched parameters registers a waiter
//! with the [`BatchCoordinator`]. The first waiter of a batch yields once in its own task and
//! then closes the batch, so the waiters its task registers in the meantime share one batch:
//! the batched values are deduplicated, sent in one downstream invocation as
//! positionally aligned arrays, and each waiter receives the entry of the reply at the
//! position of its key.
//!
//! Parameters that are not batched are part of the batch identity, as is the calling
//! principal, so resolutions that differ by one of them never share an invocation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::invoke::Invoker;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::json_ext::canonical_json;
use crate::json_ext::fingerprint;

/// Marker of a failed entry in a batch reply.
pub const BATCH_ERROR: &str = "batchError";

/// One resolution taking part in a batch.
#[derive(Clone, Debug)]
pub struct BatchRequest {
    /// Identifies the resolver, such as `User.posts`.
    pub resolver: String,
    pub action: String,
    /// Fully resolved parameters; batched parameters hold this resolution's single value.
    pub params: Object,
    pub batched: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BatchId {
    resolver: String,
    action: String,
    base: String,
    identity: String,
}

type Waiter = oneshot::Sender<Result<Value, GatewayError>>;

struct PendingBatch {
    batched: Vec<String>,
    base: Object,
    /// Distinct key tuples by canonical form, in arrival order.
    keys: IndexMap<String, Vec<Value>>,
    waiters: Vec<(usize, Waiter)>,
    context: RequestContext,
}

/// Closes its batch when dropped, whether or not the first waiter is still awaited.
struct ClosingBatch {
    coordinator: BatchCoordinator,
    id: Option<BatchId>,
}

impl Drop for ClosingBatch {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.coordinator.flush(id);
        }
    }
}

/// Collects batched resolutions and flushes them once per scheduling tick.
#[derive(Clone)]
pub struct BatchCoordinator {
    invoker: Invoker,
    max_batch_size: Option<usize>,
    pending: Arc<Mutex<HashMap<BatchId, PendingBatch>>>,
}

impl fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("max_batch_size", &self.max_batch_size)
            .field("pending", &self.pending.try_lock().map(|pending| pending.len()))
            .finish()
    }
}

impl BatchCoordinator {
    pub(crate) fn new(invoker: Invoker, max_batch_size: Option<usize>) -> Self {
        Self {
            invoker,
            max_batch_size: max_batch_size.filter(|size| *size > 0),
            pending: Default::default(),
        }
    }

    /// Schedules one resolution and waits for its entry of the batch reply.
    ///
    /// The wait is bounded by the request timeout. Dropping the returned future only
    /// releases this waiter.
    pub async fn schedule_batched(
        &self,
        request: BatchRequest,
        context: &RequestContext,
    ) -> Result<Value, GatewayError> {
        let BatchRequest {
            resolver,
            action,
            mut params,
            batched,
        } = request;

        let key: Vec<Value> = batched
            .iter()
            .map(|name| params.remove(name).unwrap_or(Value::Null))
            .collect();
        let key_id = canonical_json(&Value::Array(key.clone()));
        let id = BatchId {
            resolver: resolver.clone(),
            action: action.clone(),
            base: fingerprint(&Value::Object(params.clone())),
            identity: context.identity().to_string(),
        };

        let (sender, receiver) = oneshot::channel();
        let closing = {
            let mut pending = self.pending.lock();
            let first = !pending.contains_key(&id);
            let batch = pending.entry(id.clone()).or_insert_with(|| PendingBatch {
                batched,
                base: params,
                keys: IndexMap::new(),
                waiters: Vec::new(),
                context: context.clone(),
            });
            let slot = match batch.keys.get_index_of(&key_id) {
                Some(slot) => slot,
                None => batch.keys.insert_full(key_id, key).0,
            };
            batch.waiters.push((slot, sender));
            first.then(|| ClosingBatch {
                coordinator: self.clone(),
                id: Some(id),
            })
        };

        if let Some(closing) = closing {
            // siblings polled by this task before it resumes join the batch
            tokio::task::yield_now().await;
            drop(closing);
        }

        let timeout = self.invoker.timeout_for(context);
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::BatchEntry {
                resolver,
                message: "the batch was dropped before replying".to_string(),
                data: None,
            }),
            Err(_) => Err(GatewayError::Timeout {
                action,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn flush(&self, id: BatchId) {
        let Some(batch) = self.pending.lock().remove(&id) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(resolver = %id.resolver, "no runtime left to flush the batch");
            return;
        };
        let span = tracing::debug_span!(
            "batch flush",
            resolver = %id.resolver,
            action = %id.action,
            keys = batch.keys.len(),
            waiters = batch.waiters.len(),
        );
        let coordinator = self.clone();
        runtime.spawn(async move { coordinator.dispatch(id, batch).await }.instrument(span));
    }

    async fn dispatch(&self, id: BatchId, batch: PendingBatch) {
        let PendingBatch {
            batched,
            base,
            keys,
            waiters,
            context,
        } = batch;
        let keys: Vec<Vec<Value>> = keys.into_values().collect();
        let chunk_size = self.max_batch_size.unwrap_or(keys.len()).max(1);

        let calls = keys.chunks(chunk_size).map(|chunk| {
            let mut params = base.clone();
            for (position, name) in batched.iter().enumerate() {
                let values = chunk.iter().map(|key| key[position].clone()).collect();
                params.insert(name.clone(), Value::Array(values));
            }
            let invoker = &self.invoker;
            let context = &context;
            let id = &id;
            async move {
                let reply = invoker
                    .call_json(&id.action, Value::Object(params), context)
                    .await;
                demultiplex(&id.resolver, chunk.len(), reply)
            }
        });
        let results: Vec<Result<Value, GatewayError>> = futures::future::join_all(calls)
            .await
            .into_iter()
            .flatten()
            .collect();

        tracing::debug!(calls = keys.len().div_ceil(chunk_size), "batch flushed");
        for (slot, waiter) in waiters {
            let result = results.get(slot).cloned().unwrap_or_else(|| {
                Err(GatewayError::BatchEntry {
                    resolver: id.resolver.clone(),
                    message: "missing batch entry".to_string(),
                    data: None,
                })
            });
            // the waiter may have been cancelled
            let _ = waiter.send(result);
        }
    }
}

/// Splits one downstream reply into per-key results.
fn demultiplex(
    resolver: &str,
    expected: usize,
    reply: Result<Value, GatewayError>,
) -> Vec<Result<Value, GatewayError>> {
    let entry_error = |message: String, data: Option<Value>| GatewayError::BatchEntry {
        resolver: resolver.to_string(),
        message,
        data,
    };
    match reply {
        Err(error) => {
            tracing::error!(resolver, %error, "batched invocation failed");
            vec![Err(error); expected]
        }
        Ok(Value::Array(entries)) if entries.len() == expected => entries
            .into_iter()
            .map(|entry| {
                if entry.get(BATCH_ERROR).and_then(Value::as_bool) == Some(true) {
                    let message = entry
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("batch entry failed")
                        .to_string();
                    Err(entry_error(message, entry.get("data").cloned()))
                } else {
                    Ok(entry)
                }
            })
            .collect(),
        Ok(reply) => {
            let message = match &reply {
                Value::Array(entries) => format!(
                    "expected {expected} results aligned with the keys, got {}",
                    entries.len()
                ),
                _ => format!("expected an array of {expected} results"),
            };
            tracing::warn!(resolver, %message, "misaligned batch reply");
            vec![Err(entry_error(message, None)); expected]
        }
    }
}

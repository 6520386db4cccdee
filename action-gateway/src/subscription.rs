//! Event subscription routing.
//!
//! Subscribers open a stream on a `Subscription` field. Every published event is matched
//! against the patterns of the field's subscription resolver, passed through its optional
//! filter with the subscriber's own arguments, then either delivered as `{eventName, payload}`
//! or used to invoke the resolver's target action whose result is delivered instead.
//!
//! Direct listeners opened with [`SubscriptionRouter::listen`] see every matching event,
//! including events whose payload carries `"$stopPropagation": true`. Such events are never
//! delivered to subscribers.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use dashmap::DashMap;
use futures::Stream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::configuration::SubscriptionSettings;
use crate::context::ProtocolContext;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::error::ValidationError;
use crate::glob::Glob;
use crate::guard::GuardEvaluator;
use crate::invoke::Invoker;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::params;
use crate::params::SourceBundle;
use crate::registry::MappingRegistry;
use crate::registry::Resolver;
use crate::registry::RoutingKey;
use crate::registry::SubscriptionResolver;

/// Payload key withholding an event from subscribers.
pub const STOP_PROPAGATION: &str = "$stopPropagation";

/// An emitted event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn stops_propagation(&self) -> bool {
        self.payload.get(STOP_PROPAGATION).and_then(Value::as_bool) == Some(true)
    }

    /// The `{eventName, payload}` pair delivered to subscribers and bound to `$` in the
    /// target action's parameter mapping.
    pub fn to_value(&self) -> Value {
        json!({
            "eventName": self.name,
            "payload": self.payload,
        })
    }
}

/// What a matched subscriber receives.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// The raw `{eventName, payload}` pair.
    Raw(Value),
    /// The result of invoking `action` with `params`.
    Invoke { action: String, params: Object },
    /// Parameters of the target action could not be resolved.
    Failed(GatewayError),
}

/// One subscriber matched by an event.
#[derive(Clone, Debug)]
pub struct Route {
    pub subscriber: u64,
    pub resolver: SubscriptionResolver,
    pub delivery: Delivery,
}

type Item = Result<Value, GatewayError>;

struct Subscriber {
    field: String,
    args: Object,
    context: RequestContext,
    sender: mpsc::Sender<Item>,
}

struct Listener {
    pattern: Glob,
    sender: mpsc::Sender<Event>,
}

/// Routes events to subscribers and listeners.
pub struct SubscriptionRouter {
    registry: Arc<MappingRegistry>,
    guard: Arc<GuardEvaluator>,
    invoker: Invoker,
    settings: SubscriptionSettings,
    next_id: AtomicU64,
    /// Held while checking the subscription limit and inserting a subscriber.
    admission: Mutex<()>,
    subscribers: Arc<DashMap<u64, Arc<Subscriber>>>,
    listeners: Arc<DashMap<u64, Listener>>,
}

impl SubscriptionRouter {
    pub(crate) fn new(
        registry: Arc<MappingRegistry>,
        guard: Arc<GuardEvaluator>,
        invoker: Invoker,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            registry,
            guard,
            invoker,
            settings,
            next_id: AtomicU64::new(1),
            admission: Mutex::new(()),
            subscribers: Default::default(),
            listeners: Default::default(),
        }
    }

    /// Opens a subscription on the `Subscription` field `field`.
    ///
    /// The action owning the field is authorized with `args` as parameters before the stream
    /// opens.
    pub async fn subscribe(
        &self,
        field: &str,
        args: Object,
        context: &RequestContext,
    ) -> Result<SubscriptionStream, GatewayError> {
        let matched = self
            .registry
            .lookup(&RoutingKey::field("Subscription", field))?;
        if !matches!(matched.resolver(), Some(Resolver::Subscription(_))) {
            return Err(GatewayError::NotFound {
                routing_key: format!("Subscription.{field}"),
            });
        }
        self.ensure_capacity()?;
        self.guard
            .ensure(&matched.mapping.name, &args, context)
            .await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.settings.queue_capacity.max(1));
        {
            // other subscriptions may have opened while the guard ran
            let _admission = self.admission.lock();
            self.ensure_capacity()?;
            self.subscribers.insert(
                id,
                Arc::new(Subscriber {
                    field: field.to_string(),
                    args,
                    context: context.clone(),
                    sender,
                }),
            );
        }
        tracing::debug!(field, subscriber = id, "subscription opened");
        Ok(SubscriptionStream {
            id,
            inner: ReceiverStream::new(receiver),
            subscribers: self.subscribers.clone(),
        })
    }

    fn ensure_capacity(&self) -> Result<(), GatewayError> {
        match self.settings.max_opened_subscriptions {
            Some(max_opened_subscriptions) if self.subscribers.len() >= max_opened_subscriptions => {
                Err(GatewayError::LimitExceeded {
                    reason: "can't open new subscription, limit reached".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Receives every event matching `pattern`, regardless of `$stopPropagation`.
    pub fn listen(&self, pattern: &str) -> Result<EventStream, GatewayError> {
        let pattern = Glob::new(pattern)
            .map_err(|error| ValidationError::new("pattern", error.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.settings.queue_capacity.max(1));
        self.listeners.insert(id, Listener { pattern, sender });
        Ok(EventStream {
            id,
            inner: ReceiverStream::new(receiver),
            listeners: self.listeners.clone(),
        })
    }

    /// Matches `event` against every open subscription.
    ///
    /// A subscriber matches when one of its resolver's patterns matches the event name and its
    /// filter, if any, accepts the event. A failing filter does not match.
    pub fn route(&self, event: &Event) -> Vec<Route> {
        let subscribers: Vec<(u64, Arc<Subscriber>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut resolvers: HashMap<String, Option<SubscriptionResolver>> = HashMap::new();
        let mut routes = Vec::new();
        for (id, subscriber) in subscribers {
            let resolver = resolvers
                .entry(subscriber.field.clone())
                .or_insert_with(|| self.resolver(&subscriber.field));
            let Some(resolver) = resolver.as_ref() else {
                continue;
            };
            if !resolver.matches(&event.name) {
                continue;
            }
            if let Some(filter) = &resolver.filter {
                match filter.filter(event, &subscriber.args, &subscriber.context) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(error) => {
                        tracing::warn!(
                            event = %event.name,
                            field = %resolver.field,
                            filter = resolver.filter_name.as_deref().unwrap_or_default(),
                            %error,
                            "subscription filter failed"
                        );
                        continue;
                    }
                }
            }

            let delivery = match &resolver.action {
                None => Delivery::Raw(event.to_value()),
                Some(action) => {
                    let sources = SourceBundle::new()
                        .with_source(event.to_value())
                        .with_args(subscriber.args.clone());
                    match params::resolve(&resolver.params, &sources, &subscriber.context) {
                        Ok(params) => Delivery::Invoke {
                            action: action.clone(),
                            params,
                        },
                        Err(error) => Delivery::Failed(error),
                    }
                }
            };
            routes.push(Route {
                subscriber: id,
                resolver: resolver.clone(),
                delivery,
            });
        }
        routes
    }

    /// Publishes an event. Returns the number of subscribers it was delivered to.
    pub async fn publish(&self, event: Event) -> usize {
        let span = tracing::debug_span!("publish", event = %event.name);
        async {
            self.notify_listeners(&event);
            if event.stops_propagation() {
                tracing::debug!("event propagation stopped");
                return 0;
            }

            let deliveries = self.route(&event).into_iter().map(|route| {
                let event = &event;
                async move {
                    let item = match route.delivery {
                        Delivery::Raw(value) => Ok(value),
                        Delivery::Failed(error) => Err(error),
                        Delivery::Invoke { action, params } => {
                            self.invoke(route.subscriber, event, &action, params).await
                        }
                    };
                    (route.subscriber, item)
                }
            });
            let mut delivered = 0;
            for (id, item) in futures::future::join_all(deliveries).await {
                if self.deliver(id, item) {
                    delivered += 1;
                }
            }
            tracing::debug!(delivered, "event published");
            delivered
        }
        .instrument(span)
        .await
    }

    /// Ends every open subscription and listener.
    pub fn close_all(&self) {
        self.subscribers.clear();
        self.listeners.clear();
    }

    /// Number of open subscriptions.
    pub fn opened_subscriptions(&self) -> usize {
        self.subscribers.len()
    }

    fn resolver(&self, field: &str) -> Option<SubscriptionResolver> {
        let matched = self
            .registry
            .lookup(&RoutingKey::field("Subscription", field))
            .ok()?;
        match matched.resolver() {
            Some(Resolver::Subscription(resolver)) => Some(resolver.clone()),
            _ => None,
        }
    }

    async fn invoke(&self, subscriber: u64, event: &Event, action: &str, params: Object) -> Item {
        let Some(context) = self
            .subscribers
            .get(&subscriber)
            .map(|entry| entry.context.clone())
        else {
            return Err(GatewayError::NotFound {
                routing_key: format!("subscriber {subscriber}"),
            });
        };
        let context = context.with_protocol(ProtocolContext::Event {
            name: event.name.clone(),
        });
        self.guard.ensure(action, &params, &context).await?;
        self.invoker
            .call_json(action, Value::Object(params), &context)
            .await
    }

    fn deliver(&self, id: u64, item: Item) -> bool {
        let Some(sender) = self.subscribers.get(&id).map(|entry| entry.sender.clone()) else {
            return false;
        };
        match sender.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "subscriber queue is full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.subscribers.remove(&id);
                false
            }
        }
    }

    fn notify_listeners(&self, event: &Event) {
        let mut closed = Vec::new();
        for listener in self.listeners.iter() {
            if !listener.pattern.matches(&event.name) {
                continue;
            }
            match listener.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        pattern = %listener.pattern,
                        event = %event.name,
                        "listener queue is full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*listener.key()),
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }
}

/// Values delivered to one subscriber. Dropping the stream closes the subscription.
pub struct SubscriptionStream {
    id: u64,
    inner: ReceiverStream<Item>,
    subscribers: Arc<DashMap<u64, Arc<Subscriber>>>,
}

impl SubscriptionStream {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Stream for SubscriptionStream {
    type Item = Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        if self.subscribers.remove(&self.id).is_some() {
            tracing::debug!(subscriber = self.id, "subscription closed");
        }
    }
}

/// Events received by a direct listener. Dropping the stream stops listening.
pub struct EventStream {
    id: u64,
    inner: ReceiverStream<Event>,
    listeners: Arc<DashMap<u64, Listener>>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.listeners.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tower::BoxError;

    use super::*;
    use crate::configuration::ActionConfig;
    use crate::configuration::ConflictPolicy;
    use crate::configuration::GuardCacheConfig;
    use crate::guard::GuardRequest;
    use crate::registry::Callbacks;
    use crate::registry::GuardPredicate;
    use crate::registry::filter_fn;
    use crate::test_utils::RecordingInvoker;

    fn router_with(
        callbacks: Callbacks,
        actions: Vec<(&str, Value)>,
        backend: &RecordingInvoker,
        settings: SubscriptionSettings,
    ) -> SubscriptionRouter {
        let registry = Arc::new(MappingRegistry::new(ConflictPolicy::Reject, callbacks));
        for (action, config) in actions {
            let config: ActionConfig = serde_json::from_value(config).unwrap();
            registry.register(action, config).unwrap();
        }
        let guard = Arc::new(GuardEvaluator::new(
            registry.clone(),
            &GuardCacheConfig::default(),
            backend.invoker(),
        ));
        SubscriptionRouter::new(registry, guard, backend.invoker(), settings)
    }

    fn on(field: &str, events: &[&str]) -> Value {
        json!({"graphql": {"kind": "subscription", "field": field, "events": events}})
    }

    #[tokio::test]
    async fn patterns_select_subscribers() {
        let backend = RecordingInvoker::echo();
        let router = router_with(
            Callbacks::new(),
            vec![
                ("events.all_users", on("allUsers", &["user.**"])),
                ("events.user_created", on("userCreated", &["user.created"])),
                ("events.anything_created", on("anythingCreated", &["*.created"])),
                ("events.user_updated", on("userUpdated", &["user.updated"])),
                ("events.order_created", on("orderCreated", &["order.created"])),
            ],
            &backend,
            SubscriptionSettings::default(),
        );

        let context = RequestContext::default();
        let mut streams = Vec::new();
        for field in ["allUsers", "userCreated", "anythingCreated", "userUpdated", "orderCreated"] {
            streams.push(router.subscribe(field, Object::new(), &context).await.unwrap());
        }

        let mut matched: Vec<String> = router
            .route(&Event::new("user.created", json!({"id": 1})))
            .into_iter()
            .map(|route| route.resolver.field)
            .collect();
        matched.sort();
        assert_eq!(matched, vec!["allUsers", "anythingCreated", "userCreated"]);
    }

    #[tokio::test]
    async fn raw_events_are_delivered() {
        let backend = RecordingInvoker::echo();
        let router = router_with(
            Callbacks::new(),
            vec![("events.all_users", on("allUsers", &["user.**"]))],
            &backend,
            SubscriptionSettings::default(),
        );
        let mut stream = router
            .subscribe("allUsers", Object::new(), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(router.publish(Event::new("user.created", json!({"id": 1}))).await, 1);
        assert_eq!(
            stream.next().await,
            Some(Ok(json!({"eventName": "user.created", "payload": {"id": 1}})))
        );
        assert!(backend.calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn filters_see_subscriber_arguments() {
        let backend = RecordingInvoker::echo();
        let callbacks = Callbacks::new().filter(
            "same_id",
            filter_fn(|event, args, _| {
                let id = args.get("id").ok_or("missing id argument")?;
                Ok(event.payload.get("id") == Some(id))
            }),
        );
        let router = router_with(
            callbacks,
            vec![(
                "events.user_changed",
                json!({"graphql": {"kind": "subscription", "field": "userChanged", "events": ["user.*"], "filter": "same_id"}}),
            )],
            &backend,
            SubscriptionSettings::default(),
        );
        let context = RequestContext::default();
        let args = |value: Value| value.as_object().cloned().unwrap();
        let _first = router.subscribe("userChanged", args(json!({"id": 1})), &context).await.unwrap();
        let second = router.subscribe("userChanged", args(json!({"id": 2})), &context).await.unwrap();
        // fails its filter
        let _broken = router.subscribe("userChanged", Object::new(), &context).await.unwrap();

        let routes = router.route(&Event::new("user.updated", json!({"id": 2})));
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].subscriber, second.id());
    }

    #[tokio::test]
    async fn target_actions_receive_event_params() {
        let backend = RecordingInvoker::new(|_, params| Ok(json!({"user": params["userId"]})));
        let router = router_with(
            Callbacks::new(),
            vec![(
                "events.user_created",
                json!({"graphql": {
                    "kind": "subscription",
                    "field": "userCreated",
                    "events": ["user.created"],
                    "action": "iam.user.get",
                    "params": {"userId": "$.payload.id:number", "fields": "@.fields"}
                }}),
            )],
            &backend,
            SubscriptionSettings::default(),
        );
        let mut stream = router
            .subscribe(
                "userCreated",
                json!({"fields": ["name"]}).as_object().cloned().unwrap(),
                &RequestContext::default(),
            )
            .await
            .unwrap();

        router.publish(Event::new("user.created", json!({"id": "7"}))).await;
        assert_eq!(stream.next().await, Some(Ok(json!({"user": 7}))));
        assert_eq!(
            backend.calls(),
            vec![(
                "iam.user.get".to_string(),
                json!({"userId": 7, "fields": ["name"]})
            )]
        );
    }

    #[tokio::test]
    async fn stopped_events_only_reach_listeners() {
        let backend = RecordingInvoker::echo();
        let router = router_with(
            Callbacks::new(),
            vec![("events.all_users", on("allUsers", &["user.**"]))],
            &backend,
            SubscriptionSettings::default(),
        );
        let _stream = router
            .subscribe("allUsers", Object::new(), &RequestContext::default())
            .await
            .unwrap();
        let mut listener = router.listen("user.*").unwrap();

        let event = Event::new("user.deleted", json!({"id": 1, "$stopPropagation": true}));
        assert_eq!(router.publish(event.clone()).await, 0);
        assert_eq!(listener.next().await, Some(event));
    }

    #[tokio::test]
    async fn dropping_a_stream_unsubscribes() {
        let backend = RecordingInvoker::echo();
        let router = router_with(
            Callbacks::new(),
            vec![("events.all_users", on("allUsers", &["user.**"]))],
            &backend,
            SubscriptionSettings::default(),
        );
        let stream = router
            .subscribe("allUsers", Object::new(), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(router.opened_subscriptions(), 1);
        drop(stream);
        assert_eq!(router.opened_subscriptions(), 0);
        assert_eq!(router.publish(Event::new("user.created", json!({}))).await, 0);
    }

    #[test_log::test(tokio::test)]
    async fn full_queues_drop_events() {
        let backend = RecordingInvoker::echo();
        let router = router_with(
            Callbacks::new(),
            vec![("events.all_users", on("allUsers", &["user.**"]))],
            &backend,
            SubscriptionSettings {
                queue_capacity: 1,
                max_opened_subscriptions: None,
            },
        );
        let mut stream = router
            .subscribe("allUsers", Object::new(), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(router.publish(Event::new("user.created", json!(1))).await, 1);
        assert_eq!(router.publish(Event::new("user.created", json!(2))).await, 0);
        assert_eq!(
            stream.next().await,
            Some(Ok(json!({"eventName": "user.created", "payload": 1})))
        );
    }

    #[tokio::test]
    async fn subscription_limit() {
        let backend = RecordingInvoker::echo();
        let router = router_with(
            Callbacks::new(),
            vec![("events.all_users", on("allUsers", &["user.**"]))],
            &backend,
            SubscriptionSettings {
                queue_capacity: 8,
                max_opened_subscriptions: Some(1),
            },
        );
        let context = RequestContext::default();
        let _open = router.subscribe("allUsers", Object::new(), &context).await.unwrap();
        let error = router
            .subscribe("allUsers", Object::new(), &context)
            .await
            .err()
            .unwrap();
        assert!(matches!(error, GatewayError::LimitExceeded { .. }));
    }

    /// Allows every subscription after giving other tasks a chance to run.
    struct Yielding;

    #[async_trait]
    impl GuardPredicate for Yielding {
        fn uses_call(&self) -> bool {
            true
        }

        async fn check(&self, _request: GuardRequest<'_>) -> Result<bool, BoxError> {
            tokio::task::yield_now().await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn concurrent_subscriptions_respect_the_limit() {
        let backend = RecordingInvoker::echo();
        let router = router_with(
            Callbacks::new().guard("yielding", Yielding),
            vec![
                ("events.all_users", on("allUsers", &["user.**"])),
                (
                    "events.guard",
                    json!({"guard": {"pattern": "events.**", "predicate": "yielding"}}),
                ),
            ],
            &backend,
            SubscriptionSettings {
                queue_capacity: 8,
                max_opened_subscriptions: Some(2),
            },
        );
        let context = RequestContext::default();

        let results = futures::future::join_all(
            (0..5).map(|_| router.subscribe("allUsers", Object::new(), &context)),
        )
        .await;

        let (opened, refused): (Vec<_>, Vec<_>) = results.into_iter().partition(Result::is_ok);
        assert_eq!(opened.len(), 2);
        assert_eq!(router.opened_subscriptions(), 2);
        for error in refused {
            assert!(matches!(error, Err(GatewayError::LimitExceeded { .. })));
        }
    }

    #[tokio::test]
    async fn unknown_fields_are_not_found() {
        let backend = RecordingInvoker::echo();
        let router = router_with(Callbacks::new(), vec![], &backend, SubscriptionSettings::default());
        let error = router
            .subscribe("nothing", Object::new(), &RequestContext::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(error, GatewayError::NotFound { .. }));
    }

    #[tokio::test]
    async fn close_all_ends_streams() {
        let backend = RecordingInvoker::echo();
        let router = router_with(
            Callbacks::new(),
            vec![("events.all_users", on("allUsers", &["user.**"]))],
            &backend,
            SubscriptionSettings::default(),
        );
        let mut stream = router
            .subscribe("allUsers", Object::new(), &RequestContext::default())
            .await
            .unwrap();
        let mut listener = router.listen("**").unwrap();

        router.close_all();
        let ended = tokio::time::timeout(Duration::from_secs(1), async {
            (stream.next().await, listener.next().await)
        })
        .await
        .unwrap();
        assert_eq!(ended, (None, None));
    }
}

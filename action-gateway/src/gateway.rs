//! The request pipeline.
//!
//! A REST request or GraphQL field goes through the same steps: the registry finds the mapping
//! serving it, the parameter resolver computes the call parameters, the guard authorizes the
//! call, the action is invoked (through the batch coordinator when the resolver declares
//! batched parameters) and the response adapter shapes the outcome.

use std::sync::Arc;
use std::task::Poll;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::CONTENT_TYPE;
use tower::BoxError;
use tower::Service;
use tracing::Instrument;

use crate::batching::BatchCoordinator;
use crate::batching::BatchRequest;
use crate::configuration::Configuration;
use crate::context::FieldContext;
use crate::context::ProtocolContext;
use crate::context::RequestContext;
use crate::context::RestContext;
use crate::error::GatewayError;
use crate::error::InvokeError;
use crate::error::ValidationError;
use crate::graphql;
use crate::guard::Authorization;
use crate::guard::GuardEvaluator;
use crate::invoke::ActionInvoker;
use crate::invoke::ActionResponse;
use crate::invoke::Invoker;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::params;
use crate::params::SourceBundle;
use crate::registry::Callbacks;
use crate::registry::MappingRegistry;
use crate::registry::Resolver;
use crate::registry::RoutingKey;
use crate::response::FieldPolicy;
use crate::response::RestResponse;
use crate::response::adapt_field;
use crate::response::adapt_rest;
use crate::subscription::Event;
use crate::subscription::EventStream;
use crate::subscription::SubscriptionRouter;
use crate::subscription::SubscriptionStream;

/// One GraphQL field to resolve, as handed over by the execution runtime.
#[derive(Clone, Debug, Default)]
pub struct FieldRequest {
    pub type_name: String,
    pub field_name: String,
    /// The parent object.
    pub source: Value,
    pub args: Object,
    /// Response path of the field, attached to its errors.
    pub path: Path,
}

#[buildstructor::buildstructor]
impl FieldRequest {
    #[builder(visibility = "pub")]
    fn new(
        type_name: String,
        field_name: String,
        source: Option<Value>,
        args: Option<Object>,
        path: Option<Path>,
    ) -> Self {
        Self {
            type_name,
            field_name,
            source: source.unwrap_or_default(),
            args: args.unwrap_or_default(),
            path: path.unwrap_or_default(),
        }
    }
}

/// The routing engine.
///
/// Cloning is cheap and every clone shares the same registry, guard cache, batches and
/// subscriptions.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<MappingRegistry>,
    guard: Arc<GuardEvaluator>,
    batching: BatchCoordinator,
    subscriptions: Arc<SubscriptionRouter>,
    invoker: Invoker,
}

impl Gateway {
    /// Builds the engine. `invoker` is the transport used to call actions and `callbacks` are
    /// the callbacks mapping configurations may refer to.
    pub fn new(
        configuration: Configuration,
        invoker: impl ActionInvoker,
        callbacks: Callbacks,
    ) -> Self {
        let invoker: Arc<dyn ActionInvoker> = Arc::new(invoker);
        let invoker = Invoker::new(invoker, configuration.invocation.timeout);
        let registry = Arc::new(MappingRegistry::new(
            configuration.registry.conflict_policy,
            callbacks,
        ));
        let guard = Arc::new(GuardEvaluator::new(
            registry.clone(),
            &configuration.guard,
            invoker.clone(),
        ));
        let batching =
            BatchCoordinator::new(invoker.clone(), configuration.batching.max_batch_size);
        let subscriptions = Arc::new(SubscriptionRouter::new(
            registry.clone(),
            guard.clone(),
            invoker.clone(),
            configuration.subscription.clone(),
        ));
        Self {
            registry,
            guard,
            batching,
            subscriptions,
            invoker,
        }
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionRouter {
        &self.subscriptions
    }

    /// Runs the guard of `action` without invoking it.
    pub async fn authorize(
        &self,
        action: &str,
        params: &Object,
        context: &RequestContext,
    ) -> Authorization {
        self.guard.authorize(action, params, context).await
    }

    /// Handles one REST request. Failures are answered with their classified status and a JSON
    /// error body.
    pub async fn handle_rest(
        &self,
        request: http::Request<Bytes>,
        context: RequestContext,
    ) -> RestResponse {
        let span = tracing::debug_span!(
            "rest request",
            method = %request.method(),
            path = %request.uri().path(),
            action = tracing::field::Empty,
        );
        async move {
            let (parts, body) = request.into_parts();
            let context = context.with_protocol(ProtocolContext::Rest(RestContext::new(
                parts.method.clone(),
                parts.uri.path(),
                parts.headers.clone(),
            )));
            let result = self.rest_invoke(&parts, body, &context).await;
            if let Err(error) = &result {
                tracing::debug!(%error, "rest request failed");
            }
            adapt_rest(result, &context.response().snapshot())
        }
        .instrument(span)
        .await
    }

    async fn rest_invoke(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
        context: &RequestContext,
    ) -> Result<ActionResponse, GatewayError> {
        let matched = self
            .registry
            .lookup(&RoutingKey::rest(parts.method.clone(), parts.uri.path()))?;
        let action = matched.mapping.name.as_str();
        tracing::Span::current().record("action", action);
        let alias = matched.alias().ok_or_else(|| GatewayError::NotFound {
            routing_key: format!("{} {}", parts.method, parts.uri.path()),
        })?;

        let sources = SourceBundle::new()
            .with_path_params(matched.path_params.clone())
            .with_query_string(parts.uri.query().unwrap_or_default())
            .with_body(parse_body(parts, &body)?);
        let params = params::resolve(&alias.params, &sources, context)?;
        self.guard.ensure(action, &params, context).await?;
        self.invoker
            .call(action, Value::Object(params), context)
            .await
    }

    /// Resolves one GraphQL field.
    pub async fn resolve_field(
        &self,
        request: FieldRequest,
        context: &RequestContext,
    ) -> Result<Value, graphql::Error> {
        let span = tracing::debug_span!(
            "graphql field",
            type_name = %request.type_name,
            field = %request.field_name,
        );
        async {
            let matched = self
                .registry
                .lookup(&RoutingKey::field(
                    request.type_name.as_str(),
                    request.field_name.as_str(),
                ))
                .map_err(|error| error.to_graphql_error(Some(request.path.clone())))?;
            let context = context.with_protocol(ProtocolContext::GraphQL(FieldContext {
                parent_type: request.type_name.clone(),
                field_name: request.field_name.clone(),
                source: request.source.clone(),
                args: request.args.clone(),
                path: request.path.clone(),
            }));
            let action = matched.mapping.name.as_str();

            match matched.resolver() {
                Some(Resolver::Action(resolver)) => {
                    let policy = FieldPolicy {
                        ignore_error: resolver.ignore_error,
                        nullable: resolver.nullable,
                        path: Some(request.path.clone()),
                    };
                    let result = async {
                        let sources = SourceBundle::new()
                            .with_args(request.args.clone())
                            .with_source(request.source.clone());
                        let params = params::resolve(&resolver.params, &sources, &context)?;
                        self.guard.ensure(action, &params, &context).await?;
                        if resolver.batched_params.is_empty() {
                            self.invoker
                                .call_json(action, Value::Object(params), &context)
                                .await
                        } else {
                            let batch = BatchRequest {
                                resolver: format!("{}.{}", resolver.type_name, resolver.field),
                                action: action.to_string(),
                                params,
                                batched: resolver.batched_params.clone(),
                            };
                            self.batching.schedule_batched(batch, &context).await
                        }
                    }
                    .await;
                    adapt_field(result, &policy)
                }
                Some(Resolver::Callback(resolver)) => {
                    let policy = FieldPolicy {
                        ignore_error: resolver.ignore_error,
                        nullable: resolver.nullable,
                        path: Some(request.path.clone()),
                    };
                    let result = async {
                        self.guard.ensure(action, &request.args, &context).await?;
                        resolver
                            .resolver
                            .resolve(&request.source, &request.args, &context)
                            .await
                            .map_err(|error| {
                                GatewayError::from(InvokeError::new(action, error.to_string()))
                            })
                    }
                    .await;
                    adapt_field(result, &policy)
                }
                // the execution runtime hands every delivered value over as the source
                Some(Resolver::Subscription(_)) => Ok(request.source.clone()),
                None => Err(GatewayError::NotFound {
                    routing_key: format!("{}.{}", request.type_name, request.field_name),
                }
                .to_graphql_error(Some(request.path.clone()))),
            }
        }
        .instrument(span)
        .await
    }

    /// Opens a subscription on a `Subscription` field.
    pub async fn subscribe(
        &self,
        field: &str,
        args: Object,
        context: &RequestContext,
    ) -> Result<SubscriptionStream, GatewayError> {
        self.subscriptions.subscribe(field, args, context).await
    }

    /// Publishes an event to subscribers and listeners. Returns the number of subscribers it
    /// was delivered to.
    pub async fn publish(&self, name: &str, payload: Value) -> usize {
        self.subscriptions.publish(Event::new(name, payload)).await
    }

    /// Receives every event matching `pattern`.
    pub fn listen(&self, pattern: &str) -> Result<EventStream, GatewayError> {
        self.subscriptions.listen(pattern)
    }

    /// The REST pipeline as a [`tower::Service`].
    ///
    /// The [`RequestContext`] is taken from the request extensions, or defaults to an
    /// anonymous context.
    pub fn rest_service(&self) -> RestService {
        RestService {
            gateway: self.clone(),
        }
    }

    /// Forgets cached guard decisions and ends every subscription.
    pub fn shutdown(&self) {
        self.guard.invalidate_all();
        self.subscriptions.close_all();
        tracing::debug!("gateway shut down");
    }
}

fn parse_body(parts: &http::request::Parts, body: &Bytes) -> Result<Value, GatewayError> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    let form = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));
    if form {
        let text = std::str::from_utf8(body)
            .map_err(|error| ValidationError::new("body", error.to_string()))?;
        return Ok(Value::Object(params::parse_query(text)));
    }
    serde_json::from_slice(body)
        .map_err(|error| ValidationError::new("body", format!("invalid JSON body: {error}")).into())
}

/// [`tower::Service`] answering REST requests.
#[derive(Clone)]
pub struct RestService {
    gateway: Gateway,
}

impl Service<http::Request<Bytes>> for RestService {
    type Response = RestResponse;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Bytes>) -> Self::Future {
        let gateway = self.gateway.clone();
        let context = request
            .extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(gateway.handle_rest(request, context).await) })
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::configuration::ActionConfig;
    use crate::context::Principal;
    use crate::invoke::invoker_fn;
    use crate::registry::guard_fn;
    use crate::registry::resolver_fn;
    use crate::test_utils::RecordingInvoker;

    fn gateway(backend: &RecordingInvoker, callbacks: Callbacks) -> Gateway {
        Gateway::new(Configuration::default(), backend.clone(), callbacks)
    }

    fn register(gateway: &Gateway, action: &str, config: Value) {
        let config: ActionConfig = serde_json::from_value(config).unwrap();
        gateway.registry().register(action, config).unwrap();
    }

    fn get(uri: &str) -> http::Request<Bytes> {
        http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Bytes::new())
            .unwrap()
    }

    fn body(response: &RestResponse) -> Value {
        serde_json::from_slice(response.body().as_bytes().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn rest_requests_invoke_the_mapped_action() {
        let backend = RecordingInvoker::echo();
        let gateway = gateway(&backend, Callbacks::new());
        register(
            &gateway,
            "post.create",
            json!({"rest": [{"method": "POST", "path": "/users/:userId/posts", "params": {
                "authorId": "$path.userId:number",
                "title": "$body.title",
                "draft": "$query.draft:boolean",
            }}]}),
        );

        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/users/7/posts?draft=true")
            .header(CONTENT_TYPE, "application/json")
            .body(Bytes::from_static(br#"{"title": "hello", "ignored": 1}"#))
            .unwrap();
        let response = gateway.handle_rest(request, RequestContext::default()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body(&response)["params"],
            json!({"authorId": 7, "title": "hello", "draft": true})
        );
    }

    #[tokio::test]
    async fn form_bodies_are_decoded() {
        let backend = RecordingInvoker::echo();
        let gateway = gateway(&backend, Callbacks::new());
        register(
            &gateway,
            "auth.login",
            json!({"rest": [{"method": "POST", "path": "/login", "params": {"user": "$body.user"}}]}),
        );

        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/login")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Bytes::from_static(b"user=ada&password=secret"))
            .unwrap();
        let response = gateway.handle_rest(request, RequestContext::default()).await;
        assert_eq!(body(&response)["params"], json!({"user": "ada"}));
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let backend = RecordingInvoker::echo();
        let gateway = gateway(&backend, Callbacks::new());

        let response = gateway.handle_rest(get("/nowhere"), RequestContext::default()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(&response)["type"], json!("NOT_FOUND"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_json_bodies_are_rejected() {
        let backend = RecordingInvoker::echo();
        let gateway = gateway(&backend, Callbacks::new());
        register(
            &gateway,
            "post.create",
            json!({"rest": [{"method": "POST", "path": "/posts"}]}),
        );

        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/posts")
            .body(Bytes::from_static(b"{not json"))
            .unwrap();
        let response = gateway.handle_rest(request, RequestContext::default()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(backend.calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn guards_see_resolved_params() {
        let backend = RecordingInvoker::echo();
        let callbacks = Callbacks::new().guard(
            "owner_only",
            guard_fn(|request| {
                let principal = request.context().principal().ok_or("no principal")?;
                Ok(request.params().get("id") == Some(&json!(principal.id)))
            }),
        );
        let gateway = gateway(&backend, callbacks);
        register(
            &gateway,
            "iam.user.get",
            json!({
                "rest": [{"method": "GET", "path": "/users/:id", "params": {"id": "$.id"}}],
                "guard": {"predicate": "owner_only"},
            }),
        );

        let anonymous = gateway.handle_rest(get("/users/u-1"), RequestContext::default()).await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let other = RequestContext::builder().principal(Principal::new("u-2")).build();
        let forbidden = gateway.handle_rest(get("/users/u-1"), other).await;
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let owner = RequestContext::builder().principal(Principal::new("u-1")).build();
        let allowed = gateway.handle_rest(get("/users/u-1"), owner).await;
        assert_eq!(allowed.status(), StatusCode::OK);
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn handlers_shape_the_rest_response() {
        let gateway = Gateway::new(
            Configuration::default(),
            invoker_fn(|_, _, context| async move {
                context.response().set_status(StatusCode::CREATED);
                context.response().redirect("/posts/9");
                Ok::<_, InvokeError>(ActionResponse::Json(json!({"id": 9})))
            }),
            Callbacks::new(),
        );
        register(
            &gateway,
            "post.create",
            json!({"rest": [{"method": "POST", "path": "/posts"}]}),
        );

        let request = http::Request::builder()
            .method(Method::POST)
            .uri("/posts")
            .body(Bytes::new())
            .unwrap();
        let response = gateway.handle_rest(request, RequestContext::default()).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[http::header::LOCATION], "/posts/9");
    }

    #[tokio::test]
    async fn graphql_fields_ignore_the_side_channel() {
        let gateway = Gateway::new(
            Configuration::default(),
            invoker_fn(|_, params, context| async move {
                context.response().set_status(StatusCode::CREATED);
                Ok::<_, InvokeError>(ActionResponse::Json(params))
            }),
            Callbacks::new(),
        );
        register(
            &gateway,
            "iam.user.get",
            json!({"graphql": {"kind": "action", "type": "Query", "field": "user", "params": {"id": "@.id:number"}}}),
        );

        let value = gateway
            .resolve_field(
                FieldRequest::builder()
                    .type_name("Query")
                    .field_name("user")
                    .args(json!({"id": "3"}).as_object().cloned().unwrap())
                    .build(),
                &RequestContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"id": 3}));
    }

    #[tokio::test]
    async fn ignored_errors_resolve_to_null() {
        let backend = RecordingInvoker::new(|action, _| {
            Err(InvokeError::new(action, "unavailable").with_kind("ServiceNotAvailable"))
        });
        let gateway = gateway(&backend, Callbacks::new());
        register(
            &gateway,
            "stats.get",
            json!({"graphql": {"kind": "action", "type": "Query", "field": "stats", "ignoreError": true}}),
        );
        register(
            &gateway,
            "stats.strict",
            json!({"graphql": {"kind": "action", "type": "Query", "field": "strictStats", "ignoreError": true, "nullable": false}}),
        );

        let field = |name: &str| {
            FieldRequest::builder()
                .type_name("Query")
                .field_name(name)
                .path(Path::from(name))
                .build()
        };
        let context = RequestContext::default();
        assert_eq!(gateway.resolve_field(field("stats"), &context).await, Ok(Value::Null));

        let error = gateway
            .resolve_field(field("strictStats"), &context)
            .await
            .unwrap_err();
        assert_eq!(error.extension_code(), Some("INVOKE_ERROR"));
        assert_eq!(error.extensions.get("kind"), Some(&json!("ServiceNotAvailable")));
        assert_eq!(error.path, Some(Path::from("strictStats")));
    }

    #[tokio::test]
    async fn callback_resolvers_run_inline() {
        let backend = RecordingInvoker::echo();
        let callbacks = Callbacks::new().resolver(
            "full_name",
            resolver_fn(|source, _, _| {
                Ok(json!(format!(
                    "{} {}",
                    source["first"].as_str().unwrap_or_default(),
                    source["last"].as_str().unwrap_or_default()
                )))
            }),
        );
        let gateway = gateway(&backend, callbacks);
        gateway
            .registry()
            .register_service(
                serde_json::from_value(json!({
                    "name": "iam",
                    "types": {"User": ["fullName"]},
                    "actions": {"iam.user.full_name": {"graphql": {"kind": "callback", "type": "User", "field": "fullName", "callback": "full_name"}}},
                }))
                .unwrap(),
            )
            .unwrap();

        let value = gateway
            .resolve_field(
                FieldRequest::builder()
                    .type_name("User")
                    .field_name("fullName")
                    .source(json!({"first": "Ada", "last": "Lovelace"}))
                    .build(),
                &RequestContext::default(),
            )
            .await;
        assert_eq!(value, Ok(json!("Ada Lovelace")));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn rest_service_reads_the_context_from_extensions() {
        let backend = RecordingInvoker::echo();
        let callbacks = Callbacks::new().guard(
            "authenticated",
            guard_fn(|request| Ok(request.context().principal().is_some())),
        );
        let gateway = gateway(&backend, callbacks);
        register(
            &gateway,
            "iam.me",
            json!({
                "rest": [{"method": "GET", "path": "/me"}],
                "guard": {"predicate": "authenticated"},
            }),
        );

        let mut request = get("/me");
        request
            .extensions_mut()
            .insert(RequestContext::builder().principal(Principal::new("u-1")).build());
        let response = gateway.rest_service().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = gateway.rest_service().oneshot(get("/me")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn shutdown_closes_subscriptions() {
        let backend = RecordingInvoker::echo();
        let gateway = gateway(&backend, Callbacks::new());
        register(
            &gateway,
            "events.users",
            json!({"graphql": {"kind": "subscription", "field": "users", "events": ["user.*"]}}),
        );
        let _stream = gateway
            .subscribe("users", Object::new(), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(gateway.subscriptions().opened_subscriptions(), 1);

        gateway.shutdown();
        assert_eq!(gateway.subscriptions().opened_subscriptions(), 0);
        assert_eq!(gateway.publish("user.created", json!({})).await, 0);
    }
}

//! Named callbacks referenced by mapping configurations.
//!
//! Guard predicates, subscription filters and inline field resolvers are plain Rust values
//! registered under a name. Mapping configurations refer to them by that name and the
//! registry resolves the reference when the action is registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tower::BoxError;

use crate::context::RequestContext;
use crate::guard::GuardRequest;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::subscription::Event;

/// Authorization predicate of a guard.
#[async_trait]
pub trait GuardPredicate: Send + Sync + 'static {
    /// Whether the predicate calls other actions through [`GuardRequest::call`].
    ///
    /// Such predicates are evaluated on every request and their decisions are never cached.
    fn uses_call(&self) -> bool {
        false
    }

    /// Returns `true` to allow the invocation. An error denies it.
    async fn check(&self, request: GuardRequest<'_>) -> Result<bool, BoxError>;
}

/// Decides whether an event is delivered to one subscriber.
pub trait EventFilter: Send + Sync + 'static {
    /// `args` are the field arguments of the subscriber.
    fn filter(
        &self,
        event: &Event,
        args: &Object,
        context: &RequestContext,
    ) -> Result<bool, BoxError>;
}

/// Resolves a GraphQL field without going through an action.
#[async_trait]
pub trait FieldResolver: Send + Sync + 'static {
    async fn resolve(
        &self,
        source: &Value,
        args: &Object,
        context: &RequestContext,
    ) -> Result<Value, BoxError>;
}

/// A [`GuardPredicate`] made of a synchronous closure.
pub struct GuardFn<F>(F);

pub fn guard_fn<F>(f: F) -> GuardFn<F>
where
    F: Fn(&GuardRequest<'_>) -> Result<bool, BoxError> + Send + Sync + 'static,
{
    GuardFn(f)
}

#[async_trait]
impl<F> GuardPredicate for GuardFn<F>
where
    F: Fn(&GuardRequest<'_>) -> Result<bool, BoxError> + Send + Sync + 'static,
{
    async fn check(&self, request: GuardRequest<'_>) -> Result<bool, BoxError> {
        (self.0)(&request)
    }
}

/// An [`EventFilter`] made of a closure.
pub struct FilterFn<F>(F);

pub fn filter_fn<F>(f: F) -> FilterFn<F>
where
    F: Fn(&Event, &Object, &RequestContext) -> Result<bool, BoxError> + Send + Sync + 'static,
{
    FilterFn(f)
}

impl<F> EventFilter for FilterFn<F>
where
    F: Fn(&Event, &Object, &RequestContext) -> Result<bool, BoxError> + Send + Sync + 'static,
{
    fn filter(
        &self,
        event: &Event,
        args: &Object,
        context: &RequestContext,
    ) -> Result<bool, BoxError> {
        (self.0)(event, args, context)
    }
}

/// A [`FieldResolver`] made of a synchronous closure.
pub struct ResolverFn<F>(F);

pub fn resolver_fn<F>(f: F) -> ResolverFn<F>
where
    F: Fn(&Value, &Object, &RequestContext) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    ResolverFn(f)
}

#[async_trait]
impl<F> FieldResolver for ResolverFn<F>
where
    F: Fn(&Value, &Object, &RequestContext) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    async fn resolve(
        &self,
        source: &Value,
        args: &Object,
        context: &RequestContext,
    ) -> Result<Value, BoxError> {
        (self.0)(source, args, context)
    }
}

/// Callbacks available to mapping configurations, by name.
#[derive(Clone, Default)]
pub struct Callbacks {
    guards: HashMap<String, Arc<dyn GuardPredicate>>,
    filters: HashMap<String, Arc<dyn EventFilter>>,
    resolvers: HashMap<String, Arc<dyn FieldResolver>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, name: impl Into<String>, predicate: impl GuardPredicate) -> Self {
        self.guards.insert(name.into(), Arc::new(predicate));
        self
    }

    pub fn filter(mut self, name: impl Into<String>, filter: impl EventFilter) -> Self {
        self.filters.insert(name.into(), Arc::new(filter));
        self
    }

    pub fn resolver(mut self, name: impl Into<String>, resolver: impl FieldResolver) -> Self {
        self.resolvers.insert(name.into(), Arc::new(resolver));
        self
    }

    /// Adds every callback of `other`, replacing callbacks registered under the same name.
    pub fn extend(&mut self, other: Callbacks) {
        self.guards.extend(other.guards);
        self.filters.extend(other.filters);
        self.resolvers.extend(other.resolvers);
    }

    pub(crate) fn get_guard(&self, name: &str) -> Option<Arc<dyn GuardPredicate>> {
        self.guards.get(name).cloned()
    }

    pub(crate) fn get_filter(&self, name: &str) -> Option<Arc<dyn EventFilter>> {
        self.filters.get(name).cloned()
    }

    pub(crate) fn get_resolver(&self, name: &str) -> Option<Arc<dyn FieldResolver>> {
        self.resolvers.get(name).cloned()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("guards", &self.guards.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("resolvers", &self.resolvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

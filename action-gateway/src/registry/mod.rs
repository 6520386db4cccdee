//! The mapping registry.
//!
//! Registration compiles an [`ActionConfig`] into an [`ActionMapping`] and indexes it by
//! routing key. All validation happens here, so a malformed configuration is rejected before
//! any request can reach it. Every registration works on a copy of the current state that
//! replaces it only once the whole registration succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use derivative::Derivative;
use http::Method;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::configuration::ActionConfig;
use crate::configuration::ActionResolverConfig;
use crate::configuration::AliasConfig;
use crate::configuration::CallbackResolverConfig;
use crate::configuration::ConflictPolicy;
use crate::configuration::GuardConfig;
use crate::configuration::ResolverConfig;
use crate::configuration::ServiceDefinition;
use crate::configuration::SubscriptionConfig;
use crate::error::GatewayError;
use crate::error::RegistrationError;
use crate::error::ValidationError;
use crate::glob::Glob;
use crate::guard::GuardRule;
use crate::guard::GuardSet;
use crate::json_ext::Object;
use crate::params::ParamMappingRule;
use crate::params::Protocol;

mod callbacks;
mod path;

pub use callbacks::Callbacks;
pub use callbacks::EventFilter;
pub use callbacks::FieldResolver;
pub use callbacks::FilterFn;
pub use callbacks::GuardFn;
pub use callbacks::GuardPredicate;
pub use callbacks::ResolverFn;
pub use callbacks::filter_fn;
pub use callbacks::guard_fn;
pub use callbacks::resolver_fn;
pub use path::PathPattern;

/// Types every schema has.
pub const ROOT_TYPES: [&str; 3] = ["Query", "Mutation", "Subscription"];

const METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// A compiled REST alias.
#[derive(Clone, Debug)]
pub struct Alias {
    /// `None` for `*`.
    pub method: Option<Method>,
    pub path: PathPattern,
    pub params: ParamMappingRule,
}

impl Alias {
    fn overlaps(&self, other: &Alias) -> bool {
        let methods = match (&self.method, &other.method) {
            (Some(left), Some(right)) => left == right,
            _ => true,
        };
        methods && self.path.shape() == other.path.shape()
    }

    fn routing_key(&self) -> String {
        let method = self.method.as_ref().map(Method::as_str).unwrap_or("*");
        format!("{method} {}", self.path.shape())
    }
}

/// A field resolver bound to the action.
#[derive(Clone, Debug)]
pub struct ActionResolver {
    pub type_name: String,
    pub field: String,
    pub params: ParamMappingRule,
    pub batched_params: Vec<String>,
    pub ignore_error: bool,
    pub nullable: bool,
}

/// A field resolved by a registered callback.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct CallbackResolver {
    pub type_name: String,
    pub field: String,
    pub name: String,
    #[derivative(Debug = "ignore")]
    pub resolver: Arc<dyn FieldResolver>,
    pub ignore_error: bool,
    pub nullable: bool,
}

/// A `Subscription` field fed by events.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct SubscriptionResolver {
    pub field: String,
    pub events: Vec<Glob>,
    pub filter_name: Option<String>,
    #[derivative(Debug = "ignore")]
    pub filter: Option<Arc<dyn EventFilter>>,
    pub action: Option<String>,
    pub params: ParamMappingRule,
}

impl SubscriptionResolver {
    pub fn matches(&self, event_name: &str) -> bool {
        self.events.iter().any(|pattern| pattern.matches(event_name))
    }
}

#[derive(Clone, Debug)]
pub enum Resolver {
    Action(ActionResolver),
    Callback(CallbackResolver),
    Subscription(SubscriptionResolver),
}

impl Resolver {
    pub fn type_name(&self) -> &str {
        match self {
            Resolver::Action(resolver) => &resolver.type_name,
            Resolver::Callback(resolver) => &resolver.type_name,
            Resolver::Subscription(_) => "Subscription",
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Resolver::Action(resolver) => &resolver.field,
            Resolver::Callback(resolver) => &resolver.field,
            Resolver::Subscription(resolver) => &resolver.field,
        }
    }

    fn routing_key(&self) -> FieldKey {
        (self.type_name().to_string(), self.field().to_string())
    }
}

/// Everything registered for one action.
#[derive(Clone, Debug)]
pub struct ActionMapping {
    pub name: String,
    /// The service that registered the action, if any.
    pub service: Option<String>,
    pub config: ActionConfig,
    pub aliases: Vec<Alias>,
    pub resolver: Option<Resolver>,
    pub guard: Option<Arc<GuardRule>>,
}

/// What a request is routed by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingKey {
    Rest { method: Method, path: String },
    Field { type_name: String, field: String },
}

impl RoutingKey {
    pub fn rest(method: Method, path: impl Into<String>) -> Self {
        RoutingKey::Rest {
            method,
            path: path.into(),
        }
    }

    pub fn field(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        RoutingKey::Field {
            type_name: type_name.into(),
            field: field.into(),
        }
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingKey::Rest { method, path } => write!(f, "{method} {path}"),
            RoutingKey::Field { type_name, field } => write!(f, "{type_name}.{field}"),
        }
    }
}

/// Result of a successful lookup.
#[derive(Clone, Debug)]
pub struct Matched {
    pub mapping: Arc<ActionMapping>,
    /// Index of the matched alias, for REST lookups.
    pub alias: Option<usize>,
    /// Named path segments, for REST lookups.
    pub path_params: Object,
}

impl Matched {
    pub fn alias(&self) -> Option<&Alias> {
        self.alias.and_then(|index| self.mapping.aliases.get(index))
    }

    pub fn resolver(&self) -> Option<&Resolver> {
        self.mapping.resolver.as_ref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    Replaced,
    /// The same configuration was already registered.
    Unchanged,
}

type FieldKey = (String, String);

#[derive(Clone, Debug)]
struct RestRoute {
    action: String,
    alias: usize,
}

#[derive(Clone, Debug, Default)]
struct RegistryState {
    actions: IndexMap<String, Arc<ActionMapping>>,
    services: HashMap<String, ServiceDefinition>,
    rest: Vec<RestRoute>,
    fields: HashMap<FieldKey, String>,
    guards: GuardSet,
}

impl RegistryState {
    fn alias(&self, route: &RestRoute) -> Option<&Alias> {
        self.actions
            .get(&route.action)
            .and_then(|mapping| mapping.aliases.get(route.alias))
    }

    /// Fields declared for `type_name`, or `None` when no service declares the type. Root
    /// types accept any field.
    fn declared_fields(
        &self,
        type_name: &str,
        pending: Option<&ServiceDefinition>,
    ) -> Option<Vec<String>> {
        if ROOT_TYPES.contains(&type_name) {
            return Some(Vec::new());
        }
        let pending = pending.and_then(|service| service.types.get(type_name));
        let registered = self
            .services
            .values()
            .filter_map(|definition| definition.types.get(type_name));
        let mut found = false;
        let mut fields = Vec::new();
        for declared in pending.into_iter().chain(registered) {
            found = true;
            fields.extend(declared.iter().cloned());
        }
        found.then_some(fields)
    }

    fn remove_action(&mut self, name: &str) -> Option<Arc<ActionMapping>> {
        let mapping = self.actions.shift_remove(name)?;
        self.rest.retain(|route| route.action != name);
        self.fields.retain(|_, action| action != name);
        self.guards.remove_owner(name);
        Some(mapping)
    }
}

/// Compiled mappings of every registered action.
pub struct MappingRegistry {
    policy: ConflictPolicy,
    callbacks: RwLock<Callbacks>,
    state: RwLock<Arc<RegistryState>>,
}

impl MappingRegistry {
    pub fn new(policy: ConflictPolicy, callbacks: Callbacks) -> Self {
        Self {
            policy,
            callbacks: RwLock::new(callbacks),
            state: RwLock::new(Arc::default()),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Makes more callbacks available to later registrations.
    pub fn add_callbacks(&self, callbacks: Callbacks) {
        self.callbacks.write().extend(callbacks);
    }

    /// Registers one action.
    pub fn register(
        &self,
        action: &str,
        config: ActionConfig,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let callbacks = self.callbacks.read().clone();
        let mut state = self.state.write();
        let mut next = RegistryState::clone(&state);
        let outcome = self.apply(&mut next, &callbacks, None, None, action, config)?;
        *state = Arc::new(next);
        Ok(outcome)
    }

    /// Registers a service with its declared types and every action it publishes. Actions the
    /// service published before and no longer declares are removed. Nothing is registered if
    /// any action fails.
    pub fn register_service(
        &self,
        service: ServiceDefinition,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        if service.name.is_empty() {
            return Err(ValidationError::new("name", "service name cannot be empty").into());
        }
        let callbacks = self.callbacks.read().clone();
        let mut state = self.state.write();
        let previous = state.services.get(&service.name).cloned();
        if previous.as_ref() == Some(&service) {
            return Ok(RegistrationOutcome::Unchanged);
        }

        let mut next = RegistryState::clone(&state);
        if let Some(previous) = &previous {
            for action in previous.actions.keys() {
                if !service.actions.contains_key(action) {
                    next.remove_action(action);
                }
            }
        }
        for (action, config) in &service.actions {
            self.apply(
                &mut next,
                &callbacks,
                Some(&service.name),
                Some(&service),
                action,
                config.clone(),
            )
            .map_err(|error| match error {
                RegistrationError::Validation(error) => {
                    error.within(&format!("actions.{action}")).into()
                }
                other => other,
            })?;
        }
        let actions = service.actions.len();
        tracing::debug!(service = %service.name, actions, "service registered");
        next.services.insert(service.name.clone(), service);
        *state = Arc::new(next);

        Ok(if previous.is_some() {
            RegistrationOutcome::Replaced
        } else {
            RegistrationOutcome::Registered
        })
    }

    /// Removes an action and every routing key, guard and subscription it owns.
    pub fn unregister(&self, action: &str) -> bool {
        let mut state = self.state.write();
        if !state.actions.contains_key(action) {
            return false;
        }
        let mut next = RegistryState::clone(&state);
        next.remove_action(action);
        for definition in next.services.values_mut() {
            definition.actions.shift_remove(action);
        }
        *state = Arc::new(next);
        true
    }

    /// Removes a service, its declared types and all of its actions.
    pub fn unregister_service(&self, name: &str) -> bool {
        let mut state = self.state.write();
        let Some(definition) = state.services.get(name).cloned() else {
            return false;
        };
        let mut next = RegistryState::clone(&state);
        for action in definition.actions.keys() {
            if next
                .actions
                .get(action)
                .is_some_and(|mapping| mapping.service.as_deref() == Some(name))
            {
                next.remove_action(action);
            }
        }
        next.services.remove(name);
        *state = Arc::new(next);
        tracing::debug!(service = name, "service unregistered");
        true
    }

    /// Finds the mapping serving `key`.
    ///
    /// REST lookups prefer literal segments over named ones, then an exact method over `*`.
    pub fn lookup(&self, key: &RoutingKey) -> Result<Matched, GatewayError> {
        let state = self.state.read().clone();
        let not_found = || GatewayError::NotFound {
            routing_key: key.to_string(),
        };
        match key {
            RoutingKey::Rest { method, path } => {
                let (route, path_params, _) = state
                    .rest
                    .iter()
                    .filter_map(|route| {
                        let alias = state.alias(route)?;
                        if alias.method.as_ref().is_some_and(|m| m != method) {
                            return None;
                        }
                        let params = alias.path.matches(path)?;
                        Some((
                            route,
                            params,
                            (alias.path.precedence(), alias.method.is_some()),
                        ))
                    })
                    .max_by(|left, right| left.2.cmp(&right.2))
                    .ok_or_else(not_found)?;
                let mapping = state.actions.get(&route.action).cloned().ok_or_else(not_found)?;
                Ok(Matched {
                    mapping,
                    alias: Some(route.alias),
                    path_params,
                })
            }
            RoutingKey::Field { type_name, field } => {
                let mapping = state
                    .fields
                    .get(&(type_name.clone(), field.clone()))
                    .and_then(|action| state.actions.get(action))
                    .cloned()
                    .ok_or_else(not_found)?;
                Ok(Matched {
                    mapping,
                    alias: None,
                    path_params: Object::new(),
                })
            }
        }
    }

    pub fn mapping(&self, action: &str) -> Option<Arc<ActionMapping>> {
        self.state.read().actions.get(action).cloned()
    }

    /// Names of the registered actions, in registration order.
    pub fn actions(&self) -> Vec<String> {
        self.state.read().actions.keys().cloned().collect()
    }

    /// The most specific guard matching `action`.
    pub fn select_guard(&self, action: &str) -> Option<Arc<GuardRule>> {
        self.state.read().guards.select(action)
    }

    fn apply(
        &self,
        state: &mut RegistryState,
        callbacks: &Callbacks,
        service: Option<&str>,
        pending: Option<&ServiceDefinition>,
        name: &str,
        config: ActionConfig,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        validate_action_name(name)?;

        let mut outcome = RegistrationOutcome::Registered;
        if let Some(existing) = state.actions.get(name) {
            if existing.config == config && existing.service.as_deref() == service {
                return Ok(RegistrationOutcome::Unchanged);
            }
            let new_version = existing.service.as_deref() == service
                && existing.config.version.is_some()
                && config.version.is_some()
                && existing.config.version != config.version;
            if !new_version {
                let owner = |service: Option<&str>| match service {
                    Some(service) => format!("service '{service}'"),
                    None => format!("action '{name}'"),
                };
                self.resolve_conflict(
                    name,
                    &owner(existing.service.as_deref()),
                    &owner(service),
                )?;
            }
            outcome = RegistrationOutcome::Replaced;
        }

        let mapping = compile(state, callbacks, service, pending, name, config)?;
        state.remove_action(name);

        for (index, alias) in mapping.aliases.iter().enumerate() {
            if let Some(other) = mapping.aliases[..index]
                .iter()
                .find(|other| other.overlaps(alias))
            {
                return Err(ValidationError::new(
                    format!("rest[{index}]"),
                    format!("duplicates '{}'", other.routing_key()),
                )
                .into());
            }
            let claimed: Vec<usize> = state
                .rest
                .iter()
                .enumerate()
                .filter(|(_, route)| {
                    state
                        .alias(route)
                        .is_some_and(|existing| existing.overlaps(alias))
                })
                .map(|(position, _)| position)
                .collect();
            for position in &claimed {
                let route = &state.rest[*position];
                let routing_key = state
                    .alias(route)
                    .map(Alias::routing_key)
                    .unwrap_or_default();
                self.resolve_conflict(&routing_key, &route.action, name)?;
            }
            for position in claimed.into_iter().rev() {
                state.rest.remove(position);
            }
            state.rest.push(RestRoute {
                action: name.to_string(),
                alias: index,
            });
        }

        if let Some(resolver) = &mapping.resolver {
            let key = resolver.routing_key();
            if let Some(owner) = state.fields.get(&key).cloned() {
                self.resolve_conflict(&format!("{}.{}", key.0, key.1), &owner, name)?;
            }
            state.fields.insert(key, name.to_string());
        }

        if let Some(guard) = &mapping.guard {
            state
                .guards
                .insert(GuardRule::clone(guard))
                .map_err(RegistrationError::from)?;
        }

        tracing::debug!(action = name, ?outcome, "action registered");
        state.actions.insert(name.to_string(), Arc::new(mapping));
        Ok(outcome)
    }

    /// Applies the conflict policy to a routing key claimed by `existing`.
    fn resolve_conflict(
        &self,
        routing_key: &str,
        existing: &str,
        incoming: &str,
    ) -> Result<(), RegistrationError> {
        match self.policy {
            ConflictPolicy::Reject => Err(RegistrationError::Conflict {
                routing_key: routing_key.to_string(),
                existing: existing.to_string(),
                incoming: incoming.to_string(),
            }),
            ConflictPolicy::PreferLatest => {
                tracing::warn!(
                    routing_key,
                    existing,
                    incoming,
                    "routing key taken over by the latest registration"
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for MappingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingRegistry")
            .field("policy", &self.policy)
            .field("actions", &self.actions())
            .finish()
    }
}

fn validate_action_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.split('.').any(str::is_empty) || name.contains(['*', ' ']) {
        return Err(ValidationError::new(
            "name",
            format!("'{name}' is not a dotted action name"),
        ));
    }
    Ok(())
}

fn compile(
    state: &RegistryState,
    callbacks: &Callbacks,
    service: Option<&str>,
    pending: Option<&ServiceDefinition>,
    name: &str,
    config: ActionConfig,
) -> Result<ActionMapping, ValidationError> {
    let aliases = config
        .rest
        .iter()
        .enumerate()
        .map(|(index, alias)| {
            compile_alias(alias).map_err(|error| error.within(&format!("rest[{index}]")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let resolver = config
        .graphql
        .as_ref()
        .map(|resolver| compile_resolver(state, callbacks, pending, resolver))
        .transpose()
        .map_err(|error| error.within("graphql"))?;

    let guard = config
        .guard
        .as_ref()
        .map(|guard| compile_guard(callbacks, name, guard))
        .transpose()?;

    Ok(ActionMapping {
        name: name.to_string(),
        service: service.map(str::to_string),
        config,
        aliases,
        resolver,
        guard: guard.map(Arc::new),
    })
}

fn compile_alias(alias: &AliasConfig) -> Result<Alias, ValidationError> {
    let method = match alias.method.to_ascii_uppercase().as_str() {
        "*" => None,
        method if METHODS.contains(&method) => Some(
            Method::from_bytes(method.as_bytes())
                .map_err(|error| ValidationError::new("method", error.to_string()))?,
        ),
        _ => {
            return Err(ValidationError::new(
                "method",
                format!("unknown HTTP method '{}'", alias.method),
            ));
        }
    };
    Ok(Alias {
        method,
        path: PathPattern::parse(&alias.path)?,
        params: ParamMappingRule::compile(&alias.params, Protocol::Rest)
            .map_err(|error| error.within("params"))?,
    })
}

fn compile_resolver(
    state: &RegistryState,
    callbacks: &Callbacks,
    pending: Option<&ServiceDefinition>,
    resolver: &ResolverConfig,
) -> Result<Resolver, ValidationError> {
    match resolver {
        ResolverConfig::Action(ActionResolverConfig {
            type_name,
            field,
            params,
            batched_params,
            ignore_error,
            nullable,
        }) => {
            validate_field(state, pending, type_name, field)?;
            let params = ParamMappingRule::compile(params, Protocol::GraphQL)
                .map_err(|error| error.within("params"))?;
            for (index, batched) in batched_params.iter().enumerate() {
                if !params.declares(batched) {
                    return Err(ValidationError::new(
                        format!("batchedParams[{index}]"),
                        format!("'{batched}' is not a declared parameter"),
                    ));
                }
            }
            Ok(Resolver::Action(ActionResolver {
                type_name: type_name.clone(),
                field: field.clone(),
                params,
                batched_params: batched_params.clone(),
                ignore_error: *ignore_error,
                nullable: *nullable,
            }))
        }
        ResolverConfig::Callback(CallbackResolverConfig {
            type_name,
            field,
            callback,
            ignore_error,
            nullable,
        }) => {
            validate_field(state, pending, type_name, field)?;
            let resolver = callbacks.get_resolver(callback).ok_or_else(|| {
                ValidationError::new("callback", format!("no resolver registered as '{callback}'"))
            })?;
            Ok(Resolver::Callback(CallbackResolver {
                type_name: type_name.clone(),
                field: field.clone(),
                name: callback.clone(),
                resolver,
                ignore_error: *ignore_error,
                nullable: *nullable,
            }))
        }
        ResolverConfig::Subscription(SubscriptionConfig {
            field,
            events,
            filter,
            action,
            params,
        }) => {
            if field.is_empty() {
                return Err(ValidationError::new("field", "cannot be empty"));
            }
            if events.is_empty() {
                return Err(ValidationError::new("events", "at least one pattern is required"));
            }
            let events = events
                .iter()
                .enumerate()
                .map(|(index, pattern)| {
                    Glob::new(pattern).map_err(|error| {
                        ValidationError::new(format!("events[{index}]"), error.to_string())
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let filter_callback = filter
                .as_ref()
                .map(|name| {
                    callbacks.get_filter(name).ok_or_else(|| {
                        ValidationError::new("filter", format!("no filter registered as '{name}'"))
                    })
                })
                .transpose()?;
            if let Some(action) = action {
                validate_action_name(action)
                    .map_err(|error| ValidationError::new("action", error.reason))?;
            }
            Ok(Resolver::Subscription(SubscriptionResolver {
                field: field.clone(),
                events,
                filter_name: filter.clone(),
                filter: filter_callback,
                action: action.clone(),
                params: ParamMappingRule::compile(params, Protocol::GraphQL)
                    .map_err(|error| error.within("params"))?,
            }))
        }
    }
}

fn validate_field(
    state: &RegistryState,
    pending: Option<&ServiceDefinition>,
    type_name: &str,
    field: &str,
) -> Result<(), ValidationError> {
    if field.is_empty() {
        return Err(ValidationError::new("field", "cannot be empty"));
    }
    if type_name == "Subscription" {
        return Err(ValidationError::new(
            "type",
            "Subscription fields must use a subscription resolver",
        ));
    }
    let Some(fields) = state.declared_fields(type_name, pending) else {
        return Err(ValidationError::new(
            "type",
            format!("type '{type_name}' is not declared"),
        ));
    };
    if !fields.is_empty() && !fields.iter().any(|declared| declared == field) {
        return Err(ValidationError::new(
            "field",
            format!("'{type_name}' has no field '{field}'"),
        ));
    }
    Ok(())
}

fn compile_guard(
    callbacks: &Callbacks,
    owner: &str,
    guard: &GuardConfig,
) -> Result<GuardRule, ValidationError> {
    let pattern = guard.pattern.as_deref().unwrap_or(owner);
    let pattern = Glob::new(pattern)
        .map_err(|error| ValidationError::new("guard.pattern", error.to_string()))?;
    let predicate = callbacks.get_guard(&guard.predicate).ok_or_else(|| {
        ValidationError::new(
            "guard.predicate",
            format!("no guard predicate registered as '{}'", guard.predicate),
        )
    })?;
    Ok(GuardRule {
        owner: owner.to_string(),
        pattern,
        predicate_name: guard.predicate.clone(),
        predicate,
    })
}

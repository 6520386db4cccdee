//! Guard evaluation.
//!
//! The guard applying to an action is the most specific registered rule whose pattern matches
//! the action name. Its predicate decides whether the invocation may proceed:
//!
//! * an error raised by the predicate denies the request,
//! * decisions of predicates that do not call other actions are cached per action, caller
//!   identity and parameters for `guard.cache_ttl`,
//! * predicates declaring [`uses_call`](crate::registry::GuardPredicate::uses_call) are
//!   evaluated on every request. Each evaluation may cost one or more backend round trips.

use std::sync::Arc;

use moka::sync::Cache;
use tower::BoxError;

use crate::configuration::GuardCacheConfig;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::glob;
use crate::invoke::Invoker;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::json_ext::fingerprint;
use crate::registry::MappingRegistry;

mod rules;

pub use rules::GuardRule;
pub use rules::GuardSet;

/// Outcome of a guard evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Authorization {
    Allow,
    Deny { reason: String },
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allow)
    }
}

/// What a guard predicate gets to look at.
pub struct GuardRequest<'a> {
    action: &'a str,
    params: &'a Object,
    context: &'a RequestContext,
    caller: Option<&'a Invoker>,
}

impl<'a> GuardRequest<'a> {
    /// The action being authorized.
    pub fn action(&self) -> &'a str {
        self.action
    }

    /// The resolved parameters of the invocation.
    pub fn params(&self) -> &'a Object {
        self.params
    }

    pub fn context(&self) -> &'a RequestContext {
        self.context
    }

    /// Matches the action name against a glob pattern.
    pub fn matches(&self, pattern: &str) -> bool {
        glob::matches(self.action, pattern)
    }

    /// Calls another action. Only available to predicates declaring
    /// [`GuardPredicate::uses_call`](crate::registry::GuardPredicate::uses_call).
    pub async fn call(&self, action: &str, params: Value) -> Result<Value, BoxError> {
        let caller = self
            .caller
            .ok_or("guard predicate did not declare the call capability")?;
        Ok(caller.call_json(action, params, self.context).await?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DecisionKey {
    action: String,
    identity: String,
    params: String,
    pattern: String,
    owner: String,
}

/// Evaluates guards with a bounded lifetime decision cache.
pub struct GuardEvaluator {
    registry: Arc<MappingRegistry>,
    invoker: Invoker,
    decisions: Cache<DecisionKey, Authorization>,
}

impl GuardEvaluator {
    pub(crate) fn new(
        registry: Arc<MappingRegistry>,
        config: &GuardCacheConfig,
        invoker: Invoker,
    ) -> Self {
        Self {
            registry,
            invoker,
            decisions: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(config.cache_ttl)
                .build(),
        }
    }

    /// Decides whether `action` may be invoked with `params`. Actions without a matching
    /// guard are allowed.
    pub async fn authorize(
        &self,
        action: &str,
        params: &Object,
        context: &RequestContext,
    ) -> Authorization {
        let Some(rule) = self.registry.select_guard(action) else {
            return Authorization::Allow;
        };
        self.evaluate(&rule, action, params, context).await
    }

    /// [`authorize`](Self::authorize) as a `Result`.
    pub(crate) async fn ensure(
        &self,
        action: &str,
        params: &Object,
        context: &RequestContext,
    ) -> Result<(), GatewayError> {
        match self.authorize(action, params, context).await {
            Authorization::Allow => Ok(()),
            Authorization::Deny { reason } => Err(GatewayError::GuardDenied {
                action: action.to_string(),
                reason,
                authenticated: context.principal().is_some(),
            }),
        }
    }

    async fn evaluate(
        &self,
        rule: &GuardRule,
        action: &str,
        params: &Object,
        context: &RequestContext,
    ) -> Authorization {
        let uses_call = rule.predicate.uses_call();
        let key = (!uses_call).then(|| DecisionKey {
            action: action.to_string(),
            identity: context.identity().to_string(),
            params: fingerprint(&Value::Object(params.clone())),
            pattern: rule.pattern.as_str().to_string(),
            owner: rule.owner.clone(),
        });
        if let Some(decision) = key.as_ref().and_then(|key| self.decisions.get(key)) {
            tracing::trace!(action, pattern = %rule.pattern, "cached guard decision");
            return decision;
        }

        let request = GuardRequest {
            action,
            params,
            context,
            caller: uses_call.then_some(&self.invoker),
        };
        let decision = match rule.predicate.check(request).await {
            Ok(true) => Authorization::Allow,
            Ok(false) => Authorization::Deny {
                reason: format!("denied by guard '{}'", rule.pattern),
            },
            Err(error) => {
                tracing::warn!(
                    action,
                    pattern = %rule.pattern,
                    predicate = %rule.predicate_name,
                    %error,
                    "guard predicate failed"
                );
                return Authorization::Deny {
                    reason: format!("guard '{}' failed", rule.pattern),
                };
            }
        };
        tracing::debug!(action, pattern = %rule.pattern, allowed = decision.is_allowed(), "guard evaluated");
        if let Some(key) = key {
            self.decisions.insert(key, decision.clone());
        }
        decision
    }

    /// Forgets every cached decision.
    pub fn invalidate_all(&self) {
        self.decisions.invalidate_all();
    }
}

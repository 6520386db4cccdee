//! Mapping configuration supplied by service loaders at registration time.
//!
//! These types only describe what a service declares. They are validated and compiled by
//! the [`MappingRegistry`](crate::registry::MappingRegistry), which rejects malformed
//! configurations synchronously.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::json_ext::Value;

/// Target parameter name to value source declaration, in declaration order.
///
/// See [`ParamMappingRule`](crate::params::ParamMappingRule) for the accepted syntax.
pub type ParamsConfig = IndexMap<String, Value>;

fn default_true() -> bool {
    true
}

/// Everything one action exposes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
pub struct ActionConfig {
    /// Version of this configuration. Registering the same action again with identical
    /// content is a no-op.
    pub version: Option<String>,
    /// REST aliases
    pub rest: Vec<AliasConfig>,
    /// GraphQL resolver
    pub graphql: Option<ResolverConfig>,
    /// Authorization guard
    pub guard: Option<GuardConfig>,
}

/// A REST route bound to the action.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AliasConfig {
    /// HTTP method, or `*` for every method
    pub method: String,
    /// Path pattern such as `/users/:id`
    pub path: String,
    /// Parameter mapping. Unmapped request values are not forwarded.
    #[serde(default)]
    pub params: ParamsConfig,
}

impl AliasConfig {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            params: ParamsConfig::default(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, source: impl Into<Value>) -> Self {
        self.params.insert(name.into(), source.into());
        self
    }
}

/// GraphQL resolver kinds, discriminated by `kind`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverConfig {
    /// The field invokes the action it is declared on.
    Action(ActionResolverConfig),
    /// The field is resolved by a callback registered under `callback`.
    Callback(CallbackResolverConfig),
    /// A `Subscription` root field fed by events.
    Subscription(SubscriptionConfig),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ActionResolverConfig {
    /// Parent type of the field
    #[serde(rename = "type")]
    pub type_name: String,
    pub field: String,
    #[serde(default)]
    pub params: ParamsConfig,
    /// Parameters whose concurrent values are coalesced into one call
    #[serde(default)]
    pub batched_params: Vec<String>,
    /// Resolve to `null` instead of failing when the field is nullable
    #[serde(default)]
    pub ignore_error: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CallbackResolverConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    pub field: String,
    /// Name of a registered field resolver callback
    pub callback: String,
    #[serde(default)]
    pub ignore_error: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

/// Event subscription bound to a `Subscription` field.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SubscriptionConfig {
    pub field: String,
    /// Event name patterns, tried in order
    pub events: Vec<String>,
    /// Name of a registered event filter callback
    #[serde(default)]
    pub filter: Option<String>,
    /// Action invoked for each matched event. Without it the raw
    /// `{eventName, payload}` pair is delivered.
    #[serde(default)]
    pub action: Option<String>,
    /// Parameters of the target action, with `$` bound to `{eventName, payload}`
    #[serde(default)]
    pub params: ParamsConfig,
}

/// Authorization guard declared by an action.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GuardConfig {
    /// Action name pattern the guard applies to; defaults to the declaring action
    #[serde(default)]
    pub pattern: Option<String>,
    /// Name of a registered guard predicate
    pub predicate: String,
}

/// A service and every action it publishes, registered atomically.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub name: String,
    pub version: Option<String>,
    /// Declared GraphQL object types and their fields
    pub types: IndexMap<String, Vec<String>>,
    pub actions: IndexMap<String, ActionConfig>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolvers_are_discriminated_by_kind() {
        let config: ActionConfig = serde_json::from_value(json!({
            "version": "2",
            "rest": [{"method": "GET", "path": "/users/:id", "params": {"id": "$.id:number"}}],
            "graphql": {
                "kind": "action",
                "type": "User",
                "field": "posts",
                "params": {"userId": "$.id"},
                "batchedParams": ["userId"]
            },
            "guard": {"predicate": "isAdmin"}
        }))
        .unwrap();

        assert_eq!(
            config.rest,
            vec![AliasConfig::new("GET", "/users/:id").with_param("id", "$.id:number")]
        );
        let Some(ResolverConfig::Action(resolver)) = &config.graphql else {
            panic!("expected an action resolver, got {:?}", config.graphql)
        };
        assert_eq!(resolver.type_name, "User");
        assert_eq!(resolver.batched_params, vec!["userId".to_string()]);
        assert!(resolver.nullable);
        assert!(!resolver.ignore_error);
        assert_eq!(config.guard.unwrap().pattern, None);
    }

    #[test]
    fn subscription_resolver_from_yaml() {
        let config: ResolverConfig = serde_yaml::from_str(
            r#"
kind: subscription
field: userEvents
events: ["user.**"]
filter: sameTenant
"#,
        )
        .unwrap();
        let ResolverConfig::Subscription(subscription) = config else {
            panic!("expected a subscription resolver")
        };
        assert_eq!(subscription.events, vec!["user.**".to_string()]);
        assert_eq!(subscription.filter.as_deref(), Some("sameTenant"));
        assert_eq!(subscription.action, None);
    }

    #[test]
    fn unknown_members_are_rejected() {
        let error = serde_json::from_value::<ActionConfig>(json!({
            "rest": [{"method": "GET", "path": "/", "parms": {}}]
        }))
        .unwrap_err();
        assert!(error.to_string().contains("unknown field `parms`"), "{error}");
    }
}

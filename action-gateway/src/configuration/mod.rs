//! Engine configuration.
//!
//! The [`Configuration`] tunes the engine itself (conflict policy, cache lifetimes, limits).
//! The per-action mapping configuration supplied at registration time lives in [`mapping`].

use std::str::FromStr;
use std::time::Duration;

use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use schemars::schema::RootSchema;
use serde::Deserialize;
use serde::Serialize;

pub mod mapping;

pub use mapping::ActionConfig;
pub use mapping::ActionResolverConfig;
pub use mapping::AliasConfig;
pub use mapping::CallbackResolverConfig;
pub use mapping::GuardConfig;
pub use mapping::ParamsConfig;
pub use mapping::ResolverConfig;
pub use mapping::ServiceDefinition;
pub use mapping::SubscriptionConfig;

const DEFAULT_GUARD_CACHE_TTL: Duration = Duration::from_millis(2500);
const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);

fn default_guard_cache_ttl() -> Duration {
    DEFAULT_GUARD_CACHE_TTL
}

fn default_guard_cache_capacity() -> u64 {
    10_000
}

fn default_invocation_timeout() -> Duration {
    DEFAULT_INVOCATION_TIMEOUT
}

fn default_queue_capacity() -> usize {
    128
}

/// The engine configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Mapping registry settings
    pub registry: RegistryConfig,
    /// Guard evaluation settings
    pub guard: GuardCacheConfig,
    /// Batch coordinator settings
    pub batching: BatchingConfig,
    /// Backend invocation settings
    pub invocation: InvocationConfig,
    /// Event subscription settings
    pub subscription: SubscriptionSettings,
}

impl FromStr for Configuration {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

/// What happens when two actions claim the same routing key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The most recently registered action takes the routing key over.
    #[default]
    PreferLatest,
    /// The incoming registration fails with a conflict.
    Reject,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct RegistryConfig {
    /// Policy applied to conflicting registrations (default: prefer_latest)
    pub conflict_policy: ConflictPolicy,
}

/// Guard decision cache
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct GuardCacheConfig {
    /// Lifetime of a cached guard decision in human-readable format; defaults to 2500ms
    #[serde(with = "humantime_serde", default = "default_guard_cache_ttl")]
    #[schemars(with = "String", default = "default_guard_cache_ttl")]
    pub cache_ttl: Duration,
    /// Maximum number of cached decisions
    #[serde(default = "default_guard_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for GuardCacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_guard_cache_ttl(),
            cache_capacity: default_guard_cache_capacity(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct BatchingConfig {
    /// Maximum number of keys sent in one downstream call. A larger tick is split into
    /// several calls. By default there is no limit.
    pub max_batch_size: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct InvocationConfig {
    /// Timeout of every backend call unless the request context overrides it; defaults to 30s
    #[serde(with = "humantime_serde", default = "default_invocation_timeout")]
    #[schemars(with = "String", default = "default_invocation_timeout")]
    pub timeout: Duration,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout: default_invocation_timeout(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct SubscriptionSettings {
    /// Capacity of the in memory queue of each subscriber. Events are dropped when it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum number of opened subscriptions at the same time. By default there is no limit.
    pub max_opened_subscriptions: Option<usize>,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_opened_subscriptions: None,
        }
    }
}

/// JSON schema of the engine configuration.
pub fn generate_config_schema() -> RootSchema {
    let settings = SchemaSettings::draft07().with(|s| {
        s.option_nullable = true;
        s.option_add_null_type = false;
        s.inline_subschemas = true;
    });
    settings
        .into_generator()
        .into_root_schema_for::<Configuration>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let configuration = Configuration::default();
        assert_eq!(
            configuration.registry.conflict_policy,
            ConflictPolicy::PreferLatest
        );
        assert_eq!(configuration.guard.cache_ttl, Duration::from_millis(2500));
        assert_eq!(configuration.invocation.timeout, Duration::from_secs(30));
        assert_eq!(configuration.subscription.queue_capacity, 128);
        assert_eq!(configuration.batching.max_batch_size, None);
    }

    #[test]
    fn parses_yaml() {
        let configuration = Configuration::from_str(
            r#"
registry:
  conflict_policy: reject
guard:
  cache_ttl: 1s
batching:
  max_batch_size: 50
subscription:
  max_opened_subscriptions: 10
"#,
        )
        .unwrap();
        assert_eq!(configuration.registry.conflict_policy, ConflictPolicy::Reject);
        assert_eq!(configuration.guard.cache_ttl, Duration::from_secs(1));
        assert_eq!(configuration.guard.cache_capacity, 10_000);
        assert_eq!(configuration.batching.max_batch_size, Some(50));
        assert_eq!(configuration.subscription.max_opened_subscriptions, Some(10));
        assert_eq!(configuration.subscription.queue_capacity, 128);
    }

    #[test]
    fn rejects_unknown_fields() {
        let error = Configuration::from_str("guard:\n  cache_tll: 1s\n").unwrap_err();
        assert!(error.to_string().contains("unknown field"), "{error}");
    }

    #[test]
    fn schema_lists_sections() {
        let schema = serde_json::to_value(generate_config_schema()).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        for section in ["registry", "guard", "batching", "invocation", "subscription"] {
            assert!(properties.contains_key(section), "{section}");
        }
    }
}

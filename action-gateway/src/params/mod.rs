//! Parameter resolution.
//!
//! A [`ParamMappingRule`] is compiled once per alias or resolver. At request time
//! [`resolve`] walks every declared parameter and collects candidate values in a fixed order:
//!
//! 1. the manual literal, if configured,
//! 2. explicit sources, sorted by the priority of their kind for the protocol,
//! 3. implicit same-name matches, in the same priority order.
//!
//! Objects coming from several candidates are deep-merged with earlier keys winning. As soon
//! as a scalar (or an array) meets another candidate the earlier value wins and the remaining
//! candidates are skipped.

use crate::configuration::ParamsConfig;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::error::ValidationError;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;

mod source;

pub use source::Cast;
pub use source::Protocol;
pub use source::SourceKind;
pub use source::ValueSource;

const FULL_FORM_KEYS: [&str; 4] = ["$value", "$from", "$cast", "$default"];

/// How one target parameter is resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub manual: Option<Value>,
    /// Explicit sources, already in priority order.
    pub sources: Vec<ValueSource>,
    /// Cast applied to the final value.
    pub cast: Option<Cast>,
    /// Used when no candidate resolved.
    pub default: Option<Value>,
}

/// Compiled parameter mapping of one alias, resolver or subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamMappingRule {
    protocol: Protocol,
    params: Vec<ParamSpec>,
}

impl ParamMappingRule {
    /// Compiles a mapping. Validation errors name the offending parameter.
    pub fn compile(config: &ParamsConfig, protocol: Protocol) -> Result<Self, ValidationError> {
        let params = config
            .iter()
            .map(|(name, declaration)| {
                if name.is_empty() {
                    return Err(ValidationError::new("", "parameter names cannot be empty"));
                }
                compile_param(name, declaration, protocol).map_err(|error| error.within(name))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { protocol, params })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn declares(&self, name: &str) -> bool {
        self.params.iter().any(|spec| spec.name == name)
    }

    fn uses_context(&self) -> bool {
        self.protocol == Protocol::GraphQL
            || self.params.iter().any(|spec| {
                spec.sources
                    .iter()
                    .any(|source| source.kind == SourceKind::Context)
            })
    }
}

fn compile_param(
    name: &str,
    declaration: &Value,
    protocol: Protocol,
) -> Result<ParamSpec, ValidationError> {
    let mut spec = ParamSpec {
        name: name.to_string(),
        manual: None,
        sources: Vec::new(),
        cast: None,
        default: None,
    };

    match declaration {
        Value::String(expression) if source::is_expression(expression) => {
            spec.sources = source::parse_expression(expression, protocol)?;
        }
        Value::Array(items) if !items.is_empty() && items.iter().all(is_expression_value) => {
            for (index, item) in items.iter().enumerate() {
                let expression = item.as_str().unwrap_or_default();
                let sources = source::parse_expression(expression, protocol)
                    .map_err(|error| error.within(&format!("[{index}]")))?;
                spec.sources.extend(sources);
            }
        }
        Value::Object(object) if is_full_form(object) => {
            for key in object.keys() {
                if !FULL_FORM_KEYS.contains(&key.as_str()) {
                    return Err(ValidationError::new(
                        key.as_str(),
                        format!("unknown key, expected one of {}", FULL_FORM_KEYS.join(", ")),
                    ));
                }
            }
            spec.manual = object.get("$value").filter(|value| !value.is_null()).cloned();
            spec.default = object.get("$default").cloned();
            if let Some(cast) = object.get("$cast") {
                let cast = cast
                    .as_str()
                    .ok_or_else(|| ValidationError::new("$cast", "must be a string"))?;
                spec.cast = Some(
                    cast.trim_start_matches(':')
                        .parse()
                        .map_err(|reason: String| ValidationError::new("$cast", reason))?,
                );
            }
            match object.get("$from") {
                None | Some(Value::Null) => {}
                Some(Value::String(expression)) => {
                    spec.sources = source::parse_expression(expression, protocol)
                        .map_err(|error| error.within("$from"))?;
                }
                Some(Value::Array(items)) => {
                    for (index, item) in items.iter().enumerate() {
                        let expression = item.as_str().ok_or_else(|| {
                            ValidationError::new(format!("$from[{index}]"), "must be a string")
                        })?;
                        let sources = source::parse_expression(expression, protocol)
                            .map_err(|error| error.within(&format!("$from[{index}]")))?;
                        spec.sources.extend(sources);
                    }
                }
                Some(_) => {
                    return Err(ValidationError::new(
                        "$from",
                        "must be an expression or a list of expressions",
                    ));
                }
            }
        }
        literal => spec.manual = Some(literal.clone()),
    }

    spec.sources.sort_by_key(|source| source.kind.rank(protocol));
    Ok(spec)
}

fn is_expression_value(value: &Value) -> bool {
    value.as_str().is_some_and(source::is_expression)
}

fn is_full_form(object: &Object) -> bool {
    !object.is_empty() && object.keys().all(|key| key.starts_with('$'))
}

/// The raw values available for one resolution.
#[derive(Clone, Debug, Default)]
pub struct SourceBundle {
    path: Value,
    query: Value,
    body: Value,
    args: Value,
    source: Value,
}

impl SourceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Named path segments of the matched alias.
    pub fn with_path_params(mut self, params: Object) -> Self {
        self.path = Value::Object(params);
        self
    }

    pub fn with_query(mut self, query: Object) -> Self {
        self.query = Value::Object(query);
        self
    }

    /// Parses an `application/x-www-form-urlencoded` query string. Repeated keys collect
    /// into arrays.
    pub fn with_query_string(self, query: &str) -> Self {
        self.with_query(parse_query(query))
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_args(mut self, args: Object) -> Self {
        self.args = Value::Object(args);
        self
    }

    /// The GraphQL parent object, or `{eventName, payload}` for subscriptions.
    pub fn with_source(mut self, source: Value) -> Self {
        self.source = source;
        self
    }

    fn root<'a>(&'a self, kind: SourceKind, properties: &'a Value) -> &'a Value {
        match kind {
            SourceKind::Context => properties,
            SourceKind::Path => &self.path,
            SourceKind::Body => &self.body,
            SourceKind::Query => &self.query,
            SourceKind::FieldArgument => &self.args,
            SourceKind::SourceObject => &self.source,
        }
    }
}

pub(crate) fn parse_query(query: &str) -> Object {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
    let mut object = Object::new();
    for (key, value) in pairs {
        match object.get_mut(&key) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                object.insert(key, Value::String(value));
            }
        }
    }
    object
}

/// Resolves the parameter object of one invocation.
///
/// Parameters that resolve to nothing and have no default are omitted.
pub fn resolve(
    rule: &ParamMappingRule,
    sources: &SourceBundle,
    context: &RequestContext,
) -> Result<Object, GatewayError> {
    let properties = if rule.uses_context() {
        context.properties()
    } else {
        Value::Null
    };

    let mut params = Object::new();
    for spec in &rule.params {
        if let Some(value) = resolve_param(rule.protocol, spec, sources, &properties)? {
            params.insert(spec.name.clone(), value);
        }
    }
    Ok(params)
}

fn resolve_param(
    protocol: Protocol,
    spec: &ParamSpec,
    sources: &SourceBundle,
    properties: &Value,
) -> Result<Option<Value>, GatewayError> {
    let type_cast = |cast: Cast, value: &Value| GatewayError::TypeCast {
        param: spec.name.clone(),
        cast: cast.to_string(),
        value: value.to_string(),
    };

    let same_name = Path::key(spec.name.as_str());
    let explicit = spec
        .sources
        .iter()
        .map(|source| (source.kind, &source.path, source.cast));
    let implicit = SourceKind::implicit(protocol)
        .iter()
        .map(|kind| (*kind, &same_name, None));

    let mut accumulator = spec.manual.clone().filter(|value| !value.is_null());
    for (kind, path, cast) in explicit.chain(implicit) {
        if accumulator.as_ref().is_some_and(|value| !value.is_composite()) {
            break;
        }
        let Some(found) = sources
            .root(kind, properties)
            .get_path(path)
            .filter(|value| !value.is_null())
        else {
            continue;
        };
        let found = match cast {
            Some(cast) => cast
                .apply(found.clone())
                .ok_or_else(|| type_cast(cast, found))?,
            None => found.clone(),
        };
        match accumulator.as_mut() {
            None => accumulator = Some(found),
            Some(value) if found.is_composite() => value.merge_under(found),
            Some(_) => break,
        }
    }

    let value = match accumulator {
        Some(value) => value,
        None => match &spec.default {
            Some(default) => default.clone(),
            None => return Ok(None),
        },
    };
    match spec.cast {
        Some(cast) => cast
            .apply(value.clone())
            .map(Some)
            .ok_or_else(|| type_cast(cast, &value)),
        None => Ok(Some(value)),
    }
}

//! Provide a [`RequestContext`] for one inbound request or GraphQL field.
//!
//! The context carries the authenticated principal, the locale, the protocol specific
//! sub-context and two shared channels: [`Meta`] entries passed back and forth along the
//! invocation pipeline, and the [`ResponseChannel`] an action handler may populate to shape
//! a REST response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use http::Method;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;

mod meta;
mod response;

pub use meta::Meta;
pub use response::ResponseChannel;
pub use response::ResponseMeta;

/// Identity of the authenticated caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Principal {
    /// Stable identifier, used for guard cache keys.
    pub id: String,
    pub roles: Vec<String>,
    /// Free form claims (scopes, tenant, ...).
    pub claims: Object,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// REST specific part of the context.
#[derive(Clone, Debug)]
pub struct RestContext {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub cookies: HashMap<String, String>,
}

impl RestContext {
    /// Builds the REST context, parsing the `Cookie` headers.
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap) -> Self {
        let cookies = headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| cookie::Cookie::split_parse(value.to_string()))
            .filter_map(Result::ok)
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect();
        Self {
            method,
            path: path.into(),
            headers,
            cookies,
        }
    }
}

/// GraphQL specific part of the context.
#[derive(Clone, Debug, Default)]
pub struct FieldContext {
    pub parent_type: String,
    pub field_name: String,
    /// The parent object the field is resolved on.
    pub source: Value,
    pub args: Object,
    /// Response path of the field.
    pub path: Path,
}

/// Protocol the request arrived through.
#[derive(Clone, Debug, Default)]
pub enum ProtocolContext {
    Rest(RestContext),
    GraphQL(FieldContext),
    Event { name: String },
    #[default]
    Internal,
}

/// Per-invocation context.
///
/// Cloning is cheap: meta entries and the response channel are shared between clones, so a
/// context derived with [`RequestContext::with_protocol`] still reports to the same request.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    principal: Option<Arc<Principal>>,
    locale: Option<String>,
    protocol: Arc<ProtocolContext>,
    timeout: Option<Duration>,
    meta: Meta,
    response: ResponseChannel,
}

#[buildstructor::buildstructor]
impl RequestContext {
    #[builder(visibility = "pub")]
    fn new(
        principal: Option<Principal>,
        locale: Option<String>,
        protocol: Option<ProtocolContext>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            principal: principal.map(Arc::new),
            locale,
            protocol: Arc::new(protocol.unwrap_or_default()),
            timeout,
            meta: Meta::default(),
            response: ResponseChannel::default(),
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_deref()
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn protocol(&self) -> &ProtocolContext {
        &self.protocol
    }

    /// Timeout applied to external calls made on behalf of this request, if overridden.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The `$response` side channel.
    pub fn response(&self) -> &ResponseChannel {
        &self.response
    }

    /// A context for the same request seen through another protocol sub-context.
    pub fn with_protocol(&self, protocol: ProtocolContext) -> Self {
        Self {
            protocol: Arc::new(protocol),
            ..self.clone()
        }
    }

    /// Identity used to key cached guard decisions.
    pub fn identity(&self) -> &str {
        self.principal
            .as_deref()
            .map(|principal| principal.id.as_str())
            .unwrap_or("anonymous")
    }

    /// The properties addressable with the `#` root of a value source.
    pub fn properties(&self) -> Value {
        let mut properties = json!({
            "principal": self.principal.as_deref(),
            "locale": self.locale,
            "meta": self.meta.to_object(),
        });
        if let (ProtocolContext::Rest(rest), Some(object)) =
            (self.protocol(), properties.as_object_mut())
        {
            let headers: Object = rest
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), Value::from(value)))
                })
                .collect();
            let cookies: Object = rest
                .cookies
                .iter()
                .map(|(name, value)| (name.clone(), Value::from(value.as_str())))
                .collect();
            object.insert("headers".to_string(), Value::Object(headers));
            object.insert("cookies".to_string(), Value::Object(cookies));
        }
        properties
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn derived_contexts_share_meta_and_response() {
        let context = RequestContext::builder()
            .principal(Principal::new("u-1").with_role("admin"))
            .locale("fr")
            .build();
        let field = context.with_protocol(ProtocolContext::GraphQL(FieldContext::default()));

        field.meta().insert("tenant", "acme").unwrap();
        field.response().set_status(http::StatusCode::CREATED);

        assert_eq!(context.meta().get::<_, String>("tenant").unwrap(), Some("acme".to_string()));
        assert_eq!(
            context.response().snapshot().status,
            Some(http::StatusCode::CREATED)
        );
        assert!(matches!(context.protocol(), ProtocolContext::Internal));
        assert_eq!(field.identity(), "u-1");
        assert!(field.principal().unwrap().has_role("admin"));
    }

    #[test]
    fn properties_expose_principal_meta_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_static("session=s1; theme=dark"),
        );
        let context = RequestContext::builder()
            .principal(Principal::new("u-1"))
            .protocol(ProtocolContext::Rest(RestContext::new(
                Method::GET,
                "/users",
                headers,
            )))
            .build();
        context.meta().insert("tenant", "acme").unwrap();

        let properties = context.properties();
        assert_eq!(properties["principal"]["id"], json!("u-1"));
        assert_eq!(properties["locale"], Value::Null);
        assert_eq!(properties["meta"]["tenant"], json!("acme"));
        assert_eq!(properties["headers"]["x-request-id"], json!("abc"));
        assert_eq!(properties["cookies"]["theme"], json!("dark"));
    }

    #[test]
    fn anonymous_identity() {
        assert_eq!(RequestContext::default().identity(), "anonymous");
    }
}

//! Gateway errors.
//!
//! Configuration-time failures ([`ValidationError`], [`RegistrationError`]) are returned by
//! registration and never deferred to request time. Request-time failures are
//! [`GatewayError`]s attached to the single resolution or waiter they affect.
use displaydoc::Display;
use http::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// Trait used to get the `code` extension of an error.
pub trait ErrorExtension
where
    Self: Sized,
{
    fn extension_code(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// invalid configuration at '{field}': {reason}
#[derive(Clone, Debug, Display, Error, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Dotted path of the offending configuration field, such as `rest[0].path`.
    pub field: String,
    /// What is wrong with it.
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Prefixes the field path with `parent`.
    pub(crate) fn within(mut self, parent: &str) -> Self {
        self.field = if self.field.is_empty() {
            parent.to_string()
        } else if self.field.starts_with('[') {
            format!("{parent}{}", self.field)
        } else {
            format!("{parent}.{}", self.field)
        };
        self
    }
}

/// Error types for registration.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistrationError {
    /// {0}
    Validation(#[from] ValidationError),

    /// routing key '{routing_key}' is already claimed by '{existing}', rejected '{incoming}'
    Conflict {
        /// The routing key both registrations claim.
        routing_key: String,
        /// The action that currently owns the key.
        existing: String,
        /// The action that was rejected.
        incoming: String,
    },
}

/// Failure reported by the backend for one action invocation.
#[derive(Clone, Debug, Display, Error, PartialEq, Serialize, Deserialize)]
/// action '{action}' failed: {message}
pub struct InvokeError {
    /// The invoked action.
    pub action: String,
    /// Human readable message.
    pub message: String,
    /// Status-like code reported by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Backend classification of the error (`ServiceNotAvailable`, `EntityNotFound`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Extra data attached by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InvokeError {
    pub fn new(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            message: message.into(),
            code: None,
            kind: None,
            data: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Error types for request processing.
///
/// Each variant is classified so that REST can map it to a status code and GraphQL to a
/// field error with a `code` extension.
#[derive(Clone, Debug, Display, Error, PartialEq)]
#[non_exhaustive]
pub enum GatewayError {
    /// no route matches '{routing_key}'
    NotFound { routing_key: String },

    /// {0}
    Validation(ValidationError),

    /// cannot cast parameter '{param}' value {value} to {cast}
    TypeCast {
        param: String,
        cast: String,
        value: String,
    },

    /// access to '{action}' denied: {reason}
    GuardDenied {
        action: String,
        reason: String,
        /// Whether the request carried a principal.
        authenticated: bool,
    },

    /// batch entry for '{resolver}' failed: {message}
    BatchEntry {
        resolver: String,
        message: String,
        data: Option<Value>,
    },

    /// {0}
    Invoke(InvokeError),

    /// action '{action}' timed out after {timeout_ms}ms
    Timeout { action: String, timeout_ms: u64 },

    /// {reason}
    LimitExceeded { reason: String },
}

impl From<ValidationError> for GatewayError {
    fn from(error: ValidationError) -> Self {
        GatewayError::Validation(error)
    }
}

impl From<InvokeError> for GatewayError {
    fn from(error: InvokeError) -> Self {
        GatewayError::Invoke(error)
    }
}

impl ErrorExtension for GatewayError {
    fn extension_code(&self) -> String {
        match self {
            GatewayError::NotFound { .. } => "NOT_FOUND",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::TypeCast { .. } => "TYPE_CAST_ERROR",
            GatewayError::GuardDenied { .. } => "GUARD_DENIED",
            GatewayError::BatchEntry { .. } => "BATCH_ENTRY_ERROR",
            GatewayError::Invoke(_) => "INVOKE_ERROR",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
        }
        .to_string()
    }
}

impl GatewayError {
    /// Name used in REST error bodies.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayError::NotFound { .. } => "NotFoundError",
            GatewayError::Validation(_) => "ValidationError",
            GatewayError::TypeCast { .. } => "TypeCastError",
            GatewayError::GuardDenied { .. } => "GuardDenied",
            GatewayError::BatchEntry { .. } => "BatchEntryError",
            GatewayError::Invoke(_) => "InvokeError",
            GatewayError::Timeout { .. } => "TimeoutError",
            GatewayError::LimitExceeded { .. } => "LimitExceeded",
        }
    }

    /// HTTP status used when the error is surfaced over REST.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Validation(_) | GatewayError::TypeCast { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::GuardDenied {
                authenticated: false,
                ..
            } => StatusCode::UNAUTHORIZED,
            GatewayError::GuardDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::BatchEntry { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Invoke(error) => error
                .code
                .filter(|code| (400..600).contains(code))
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn data(&self) -> Option<&Value> {
        match self {
            GatewayError::BatchEntry { data, .. } => data.as_ref(),
            GatewayError::Invoke(error) => error.data.as_ref(),
            _ => None,
        }
    }

    /// Machine readable REST error body.
    pub fn to_rest_body(&self) -> Value {
        let mut body = json!({
            "name": self.name(),
            "message": self.to_string(),
            "code": self.status_code().as_u16(),
            "type": self.extension_code(),
        });
        if let (Some(data), Some(object)) = (self.data(), body.as_object_mut()) {
            object.insert("data".to_string(), data.clone());
        }
        body
    }

    /// Convert the error to a GraphQL field error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> graphql::Error {
        let mut extensions = Object::new();
        match self {
            GatewayError::TypeCast { param, cast, .. } => {
                extensions.insert("param".to_string(), param.clone().into());
                extensions.insert("cast".to_string(), cast.clone().into());
            }
            GatewayError::GuardDenied { action, .. } | GatewayError::Timeout { action, .. } => {
                extensions.insert("action".to_string(), action.clone().into());
            }
            GatewayError::BatchEntry { resolver, .. } => {
                extensions.insert("resolver".to_string(), resolver.clone().into());
            }
            GatewayError::Invoke(error) => {
                extensions.insert("action".to_string(), error.action.clone().into());
                if let Some(kind) = &error.kind {
                    extensions.insert("kind".to_string(), kind.clone().into());
                }
                if let Some(code) = error.code {
                    extensions.insert("http".to_string(), json!({ "status": code }));
                }
            }
            GatewayError::Validation(error) => {
                extensions.insert("field".to_string(), error.field.clone().into());
            }
            GatewayError::NotFound { .. } | GatewayError::LimitExceeded { .. } => {}
        }
        if let Some(data) = self.data() {
            extensions.insert("data".to_string(), data.clone());
        }

        let mut error = graphql::Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extension_code(self.extension_code())
            .build();
        for (key, value) in extensions {
            error = error.with_extension(key, value);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_json_snapshot;

    use super::*;

    #[test]
    fn guard_denied_status_depends_on_principal() {
        let denied = |authenticated| GatewayError::GuardDenied {
            action: "iam.user.get".to_string(),
            reason: "not an admin".to_string(),
            authenticated,
        };
        assert_eq!(denied(false).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(denied(true).status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn invoke_error_keeps_backend_status_when_valid() {
        let error = GatewayError::Invoke(InvokeError::new("post.get", "no such post").with_code(404));
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);

        let error = GatewayError::Invoke(InvokeError::new("post.get", "weird").with_code(42));
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn rest_body_is_machine_readable() {
        let error = GatewayError::Invoke(
            InvokeError::new("post.get", "no such post")
                .with_code(404)
                .with_kind("EntityNotFound")
                .with_data(json!({"id": 7})),
        );
        assert_json_snapshot!(error.to_rest_body(), @r###"
        {
          "name": "InvokeError",
          "message": "action 'post.get' failed: no such post",
          "code": 404,
          "type": "INVOKE_ERROR",
          "data": {
            "id": 7
          }
        }
        "###);
    }

    #[test]
    fn graphql_error_carries_classification() {
        let error = GatewayError::TypeCast {
            param: "id".to_string(),
            cast: "number".to_string(),
            value: "\"abc\"".to_string(),
        }
        .to_graphql_error(Some(Path::from("user")));

        assert_eq!(error.extension_code(), Some("TYPE_CAST_ERROR"));
        assert_eq!(error.extensions.get("param"), Some(&json!("id")));
        assert_eq!(error.message, "cannot cast parameter 'id' value \"abc\" to number");
        assert_eq!(error.path, Some(Path::from("user")));
    }

    #[test]
    fn validation_error_field_paths_nest() {
        let error = ValidationError::new("path", "must start with '/'")
            .within("[0]")
            .within("rest");
        assert_eq!(error.field, "rest[0].path");
        assert_eq!(
            error.to_string(),
            "invalid configuration at 'rest[0].path': must start with '/'"
        );
    }
}

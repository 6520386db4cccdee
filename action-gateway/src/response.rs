//! Shaping of action results into protocol responses.

use std::fmt;

use bytes::Bytes;
use http::HeaderValue;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use http::header::LOCATION;
use mime::APPLICATION_JSON;
use mime::APPLICATION_OCTET_STREAM;

use crate::context::ResponseMeta;
use crate::error::GatewayError;
use crate::graphql;
use crate::invoke::ActionResponse;
use crate::invoke::ByteStream;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::params::Protocol;

/// Body of a REST response.
pub enum RestBody {
    Empty,
    Bytes(Bytes),
    Stream(ByteStream),
}

impl RestBody {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RestBody::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RestBody::Empty => true,
            RestBody::Bytes(bytes) => bytes.is_empty(),
            RestBody::Stream(_) => false,
        }
    }
}

impl fmt::Debug for RestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestBody::Empty => f.write_str("Empty"),
            RestBody::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            RestBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

pub type RestResponse = http::Response<RestBody>;

/// How a failed field resolution is surfaced.
#[derive(Clone, Debug, Default)]
pub struct FieldPolicy {
    pub ignore_error: bool,
    pub nullable: bool,
    /// Response path attached to field errors.
    pub path: Option<Path>,
}

#[derive(Debug)]
pub enum ProtocolResponse {
    Rest(RestResponse),
    Field(Result<Value, graphql::Error>),
}

/// Shapes an action result for the protocol the request came through.
pub fn adapt(
    protocol: Protocol,
    result: Result<ActionResponse, GatewayError>,
    side_channel: &ResponseMeta,
    policy: &FieldPolicy,
) -> ProtocolResponse {
    match protocol {
        Protocol::Rest => ProtocolResponse::Rest(adapt_rest(result, side_channel)),
        Protocol::GraphQL => {
            let result = result.and_then(|response| response.into_json(""));
            ProtocolResponse::Field(adapt_field(result, policy))
        }
    }
}

/// Builds the REST response of an invocation.
///
/// The side channel overrides the default `200 OK` JSON response of a successful result. A
/// redirect location answers `302 Found` unless a 3xx status was set. Errors always answer
/// their classified status with a JSON error body.
pub fn adapt_rest(
    result: Result<ActionResponse, GatewayError>,
    side_channel: &ResponseMeta,
) -> RestResponse {
    let response = match result {
        Ok(response) => response,
        Err(error) => return error_response(&error),
    };

    let (body, default_type) = match response {
        ActionResponse::Json(Value::Null) => (RestBody::Empty, None),
        ActionResponse::Json(Value::String(text))
            if side_channel
                .content_type
                .as_deref()
                .is_some_and(|content_type| !content_type.contains("json")) =>
        {
            (RestBody::Bytes(Bytes::from(text)), None)
        }
        ActionResponse::Json(value) => (
            json_body(&value),
            Some(HeaderValue::from_static(APPLICATION_JSON.essence_str())),
        ),
        ActionResponse::Bytes(bytes) => (
            RestBody::Bytes(bytes),
            Some(HeaderValue::from_static(APPLICATION_OCTET_STREAM.essence_str())),
        ),
        ActionResponse::Stream(stream) => (
            RestBody::Stream(stream),
            Some(HeaderValue::from_static(APPLICATION_OCTET_STREAM.essence_str())),
        ),
    };

    let mut response = http::Response::new(body);
    if let Some(default_type) = default_type {
        response.headers_mut().insert(CONTENT_TYPE, default_type);
    }
    for (name, value) in &side_channel.headers {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    if let Some(content_type) = &side_channel.content_type {
        match HeaderValue::from_str(content_type) {
            Ok(value) => {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            Err(_) => tracing::warn!(%content_type, "ignoring invalid content type override"),
        }
    }

    *response.status_mut() = side_channel.status.unwrap_or(StatusCode::OK);
    if let Some(location) = &side_channel.location {
        match HeaderValue::from_str(location) {
            Ok(value) => {
                response.headers_mut().insert(LOCATION, value);
                if !response.status().is_redirection() {
                    *response.status_mut() = StatusCode::FOUND;
                }
            }
            Err(_) => tracing::warn!(%location, "ignoring invalid redirect location"),
        }
    }
    response
}

/// Resolves a GraphQL field from an invocation result.
///
/// With `ignore_error` set, a nullable field resolves to `null` on error. Non-nullable fields
/// always propagate the error.
pub fn adapt_field(
    result: Result<Value, GatewayError>,
    policy: &FieldPolicy,
) -> Result<Value, graphql::Error> {
    match result {
        Ok(value) => Ok(value),
        Err(error) if policy.ignore_error && policy.nullable => {
            tracing::debug!(%error, "field error ignored");
            Ok(Value::Null)
        }
        Err(error) => Err(error.to_graphql_error(policy.path.clone())),
    }
}

fn json_body(value: &Value) -> RestBody {
    match serde_json::to_vec(value) {
        Ok(bytes) => RestBody::Bytes(bytes.into()),
        Err(error) => {
            tracing::error!(%error, "cannot serialize response body");
            RestBody::Empty
        }
    }
}

fn error_response(error: &GatewayError) -> RestResponse {
    let mut response = http::Response::new(json_body(&error.to_rest_body()));
    *response.status_mut() = error.status_code();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(APPLICATION_JSON.essence_str()),
    );
    response
}

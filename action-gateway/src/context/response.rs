use std::sync::Arc;

use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::StatusCode;
use parking_lot::Mutex;

/// What an action handler asked for through the `$response` side channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseMeta {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub location: Option<String>,
    pub content_type: Option<String>,
}

impl ResponseMeta {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.headers.is_empty()
            && self.location.is_none()
            && self.content_type.is_none()
    }
}

/// Shared handle on the `$response` side channel of one request.
///
/// Only the REST adapter reads it. GraphQL resolution ignores whatever was written.
#[derive(Clone, Debug, Default)]
pub struct ResponseChannel {
    inner: Arc<Mutex<ResponseMeta>>,
}

impl ResponseChannel {
    pub fn set_status(&self, status: StatusCode) {
        self.inner.lock().status = Some(status);
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.inner.lock().headers.insert(name, value);
    }

    /// Requests a redirect. Without an explicit 3xx status the adapter answers `302 Found`.
    pub fn redirect(&self, location: impl Into<String>) {
        self.inner.lock().location = Some(location.into());
    }

    pub fn set_content_type(&self, content_type: impl Into<String>) {
        self.inner.lock().content_type = Some(content_type.into());
    }

    pub fn snapshot(&self) -> ResponseMeta {
        self.inner.lock().clone()
    }

    pub fn is_populated(&self) -> bool {
        !self.inner.lock().is_empty()
    }
}

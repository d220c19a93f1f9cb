//! Document handlers: the ways a request can be answered.

mod cgi;
mod fastcgi;
mod static_files;

pub use self::cgi::CgiHandler;
pub use self::fastcgi::FastCgiHandler;
pub use self::static_files::StaticHandler;

use crate::request::GatewayRequest;
use anyhow::Result;
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};

pub const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

/// Something that turns a routed request into a response.
///
/// Handlers for named applications live for the whole server run and are
/// shared between connection tasks.
#[async_trait]
pub trait DocumentHandler: Send + Sync {
    /// Human readable name used in logs.
    fn name(&self) -> &str;

    /// One-time setup before the first request.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, request: GatewayRequest) -> Result<Response<Body>>;

    /// Teardown at shutdown.
    async fn dispose(&self) {}
}

/// A UTF-8 HTML response with an exact `Content-Length`.
pub fn html_response(status: StatusCode, content: impl Into<String>) -> Response<Body> {
    let content = content.into();
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content.len()));
    *response.body_mut() = Body::from(content);
    response
}

/// Escape text for HTML element content and attribute values.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

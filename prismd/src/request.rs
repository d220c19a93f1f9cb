use anyhow::Result;
use hyper::body::HttpBody as _;
use hyper::{Body, HeaderMap, Method, Request, Uri, Version};
use percent_encoding::percent_decode_str;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

/// Path and query of a request as seen by routing.
///
/// The path is percent-decoded; the query is kept as received, without `?`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestUrl {
    pub path: String,
    pub query: Option<String>,
}

impl RequestUrl {
    pub fn new(path: impl Into<String>, query: Option<String>) -> Self {
        Self {
            path: path.into(),
            query,
        }
    }

    pub fn from_uri(uri: &Uri) -> Self {
        let path = percent_decode_str(uri.path())
            .decode_utf8_lossy()
            .into_owned();
        let path = if path.is_empty() {
            "/".to_string()
        } else {
            path
        };
        Self {
            path,
            query: uri.query().map(str::to_string),
        }
    }

    /// Extension of the requested document without the dot.
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.path)
            .extension()
            .and_then(|ext| ext.to_str())
    }
}

impl fmt::Display for RequestUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.query.as_deref() {
            Some(query) => write!(f, "{}?{}", self.path, query),
            None => f.write_str(&self.path),
        }
    }
}

/// One inbound request on its way through the gateway.
///
/// Owned by the task handling it. Routing stages hand back an updated value
/// through [`GatewayRequest::with_url`] and [`GatewayRequest::with_path_info`].
#[derive(Debug)]
pub struct GatewayRequest {
    pub method: Method,
    pub version: Version,
    /// URI as received, before any rewriting.
    pub uri: Uri,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub url: RequestUrl,
    pub path_info: String,
    pub unique_id: String,
    pub span: tracing::Span,
    body: Body,
}

impl GatewayRequest {
    pub fn from_hyper(
        req: Request<Body>,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        let (parts, body) = req.into_parts();
        let unique_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "request",
            id = %unique_id,
            method = %parts.method,
            uri = %parts.uri,
        );
        let content_length = parts
            .headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .or_else(|| body.size_hint().exact().filter(|n| *n > 0));
        let url = RequestUrl::from_uri(&parts.uri);

        Self {
            method: parts.method,
            version: parts.version,
            uri: parts.uri,
            headers: parts.headers,
            content_length,
            remote_addr,
            local_addr,
            url,
            path_info: String::new(),
            unique_id,
            span,
            body,
        }
    }

    pub fn with_url(mut self, url: RequestUrl) -> Self {
        self.url = url;
        self
    }

    pub fn with_path_info(mut self, url: RequestUrl, path_info: String) -> Self {
        self.url = url;
        self.path_info = path_info;
        self
    }

    /// Whether the client declared a non-empty body.
    pub fn has_body(&self) -> bool {
        self.content_length.is_some_and(|n| n > 0)
    }

    /// Take the request body. Without a declared length the body is buffered
    /// first so `content_length` reflects what will be sent to the backend.
    pub async fn take_body(&mut self) -> Result<Body> {
        let body = std::mem::take(&mut self.body);
        if self.content_length.is_some() {
            return Ok(body);
        }
        let bytes = hyper::body::to_bytes(body).await?;
        if !bytes.is_empty() {
            self.content_length = Some(bytes.len() as u64);
        }
        Ok(Body::from(bytes))
    }

    /// Value of a header as text, if present and valid.
    pub fn header_str(&self, name: impl hyper::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn server_protocol(&self) -> &'static str {
        match self.version {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/1.1",
        }
    }
}

impl fmt::Display for GatewayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{}] {}", self.unique_id, self.method, self.uri)
    }
}

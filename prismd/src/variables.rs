use crate::request::GatewayRequest;
use std::collections::HashMap;
use std::path::PathBuf;

/// Keys the builder sets itself. A header normalizing to one of these is not
/// passed on as `HTTP_*`, even when the key itself ends up omitted.
const RESERVED_KEYS: &[&str] = &[
    "CONTENT_LENGTH",
    "CONTENT_TYPE",
    "GATEWAY_INTERFACE",
    "PATH_INFO",
    "PATH_TRANSLATED",
    "QUERY_STRING",
    "REMOTE_ADDR",
    "REMOTE_HOST",
    "REQUEST_METHOD",
    "SCRIPT_NAME",
    "SERVER_NAME",
    "SERVER_PORT",
    "SERVER_PROTOCOL",
    "SERVER_SOFTWARE",
    "DOCUMENT_ROOT",
    "REMOTE_PORT",
    "REQUEST_URI",
    "UNIQUE_ID",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayInterface {
    Cgi,
    FastCgi,
}

impl GatewayInterface {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cgi => "CGI/1.1",
            Self::FastCgi => "FastCGI/1.0",
        }
    }
}

/// Server-wide values that end up in every request's variables.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub document_root: PathBuf,
    /// `SERVER_PORT` for requests that carry no local address.
    pub port: u16,
    pub software: String,
}

/// Build the RFC 3875 variable set for `request`.
///
/// Variables whose source is empty or absent are left out instead of being
/// set to an empty value.
pub fn build_gateway_variables(
    request: &GatewayRequest,
    context: &ServerContext,
    interface: GatewayInterface,
) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let mut set = |key: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            vars.insert(key.to_string(), value);
        }
    };

    let path_translated = context
        .document_root
        .join(request.url.path.trim_start_matches('/'))
        .to_string_lossy()
        .into_owned();
    let remote_ip = request.remote_addr.map(|addr| addr.ip().to_string());
    let port = request
        .local_addr
        .map(|addr| addr.port())
        .unwrap_or(context.port);

    set(
        "CONTENT_LENGTH",
        request
            .content_length
            .filter(|n| *n > 0)
            .map(|n| n.to_string()),
    );
    set(
        "CONTENT_TYPE",
        request
            .header_str(hyper::header::CONTENT_TYPE)
            .map(str::to_string),
    );
    set("GATEWAY_INTERFACE", Some(interface.as_str().to_string()));
    set("PATH_INFO", Some(request.path_info.clone()));
    set("QUERY_STRING", request.url.query.clone());
    set("REMOTE_ADDR", remote_ip.clone());
    set("REMOTE_HOST", remote_ip);
    set(
        "REMOTE_PORT",
        request.remote_addr.map(|addr| addr.port().to_string()),
    );
    set("REQUEST_METHOD", Some(request.method.to_string()));
    set("REQUEST_URI", Some(request_uri(request)));
    set("SCRIPT_NAME", Some(request.url.path.clone()));
    set("SERVER_NAME", server_name(request, port));
    set("SERVER_PORT", Some(port.to_string()));
    set(
        "SERVER_PROTOCOL",
        Some(request.server_protocol().to_string()),
    );
    set("SERVER_SOFTWARE", Some(context.software.clone()));
    set(
        "DOCUMENT_ROOT",
        Some(context.document_root.to_string_lossy().into_owned()),
    );
    set("UNIQUE_ID", Some(request.unique_id.clone()));
    if interface == GatewayInterface::FastCgi {
        set("SCRIPT_FILENAME", Some(path_translated.clone()));
    }
    set("PATH_TRANSLATED", Some(path_translated));

    for name in request.headers.keys() {
        let normalized = name.as_str().to_ascii_uppercase().replace('-', "_");
        if normalized.is_empty() || RESERVED_KEYS.contains(&normalized.as_str()) {
            continue;
        }
        let values: Vec<&str> = request
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            continue;
        }
        vars.insert(format!("HTTP_{normalized}"), values.join(", "));
    }

    tracing::debug!(parent: &request.span, variables = ?vars, "generated gateway variables");
    vars
}

fn request_uri(request: &GatewayRequest) -> String {
    let mut uri = format!("{}{}", request.url.path, request.path_info);
    if let Some(query) = request.url.query.as_deref().filter(|q| !q.is_empty()) {
        uri.push('?');
        uri.push_str(query);
    }
    uri
}

/// Host header with a `:<port>` suffix for the listening port removed, or the
/// local socket address when the client sent no host.
fn server_name(request: &GatewayRequest, port: u16) -> Option<String> {
    let host = request.header_str(hyper::header::HOST);
    match host.filter(|h| !h.is_empty()) {
        Some(host) => {
            let suffix = format!(":{port}");
            let name = host.strip_suffix(suffix.as_str()).unwrap_or(host);
            Some(name.to_string())
        }
        None => request.local_addr.map(|addr| addr.ip().to_string()),
    }
}

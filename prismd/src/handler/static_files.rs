use super::{escape_html, html_response, DocumentHandler};
use crate::request::GatewayRequest;
use crate::SERVER_SOFTWARE;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Characters escaped in generated directory links.
const LINK_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Serves files and directory listings from the document root. Also the
/// gateway's 404 responder.
#[derive(Debug, Clone)]
pub struct StaticHandler {
    document_root: PathBuf,
}

impl StaticHandler {
    pub fn new(document_root: impl Into<PathBuf>) -> Self {
        Self {
            document_root: document_root.into(),
        }
    }

    fn local_path(&self, url_path: &str) -> Option<PathBuf> {
        let relative = url_path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") {
            return None;
        }
        Some(self.document_root.join(relative))
    }

    async fn list_directory(&self, web_path: &str, local: &Path) -> Result<Response<Body>> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(local)
            .await
            .with_context(|| format!("cannot list {}", local.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                dirs.push(name);
            } else {
                files.push(name);
            }
        }
        dirs.sort();
        files.sort();

        let base = if web_path.ends_with('/') {
            web_path.to_string()
        } else {
            format!("{web_path}/")
        };
        let title = escape_html(web_path);
        let mut page = format!(
            "<html>\n<head>\n<title>Index of {title}</title>\n</head>\n<body>\n\
             <h1>Index of {title}</h1>\n<ul>\n"
        );
        if local != self.document_root {
            let parent = parent_path(web_path);
            let _ = writeln!(page, "<li><a href=\"{}\">⤴ ..</a></li>", link(&parent));
        }
        for dir in &dirs {
            let _ = writeln!(
                page,
                "<li><a href=\"{}\">📁 {}</a></li>",
                link(&format!("{base}{dir}")),
                escape_html(dir)
            );
        }
        page.push_str("</ul>\n<ul>\n");
        for file in &files {
            let _ = writeln!(
                page,
                "<li><a href=\"{}\">📄 {}</a></li>",
                link(&format!("{base}{file}")),
                escape_html(file)
            );
        }
        let _ = write!(
            page,
            "</ul>\n<hr>\n<p>{}</p>\n</body>\n</html>\n",
            escape_html(SERVER_SOFTWARE)
        );
        Ok(html_response(StatusCode::OK, page))
    }

    async fn send_file(&self, local: &Path) -> Result<Response<Body>> {
        let content = tokio::fs::read(local)
            .await
            .with_context(|| format!("cannot read {}", local.display()))?;
        let mime = mime_guess::from_path(local).first_or_octet_stream();
        let mut response = Response::new(Body::empty());
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(mime.as_ref())?);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(content.len()));
        *response.body_mut() = Body::from(content);
        Ok(response)
    }
}

#[async_trait]
impl DocumentHandler for StaticHandler {
    fn name(&self) -> &str {
        "static"
    }

    async fn handle(&self, request: GatewayRequest) -> Result<Response<Body>> {
        let web_path = request.url.path.as_str();
        let Some(local) = self.local_path(web_path) else {
            debug!(parent: &request.span, path = %web_path, "rejecting path with parent segment");
            return Ok(not_found());
        };
        match tokio::fs::metadata(&local).await {
            Ok(meta) if meta.is_dir() => self.list_directory(web_path, &local).await,
            Ok(meta) if meta.is_file() => self.send_file(&local).await,
            _ => Ok(not_found()),
        }
    }
}

fn not_found() -> Response<Body> {
    html_response(StatusCode::NOT_FOUND, "")
}

fn parent_path(web_path: &str) -> String {
    let trimmed = web_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => trimmed[..i].to_string(),
    }
}

fn link(path: &str) -> String {
    escape_html(&utf8_percent_encode(path, LINK_ESCAPES).to_string())
}

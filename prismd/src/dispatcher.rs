use crate::error::GatewayError;
use crate::handler::{
    escape_html, html_response, CgiHandler, DocumentHandler, FastCgiHandler, StaticHandler,
};
use crate::path_info::resolve_path_info;
use crate::request::{GatewayRequest, RequestUrl};
use crate::rewrite::RewriteEngine;
use crate::variables::ServerContext;
use crate::SERVER_SOFTWARE;
use anyhow::{anyhow, Context, Result};
use hyper::{Body, Response, StatusCode};
use prism_core::config::Config;
use prism_core::observability::ACCESS_LOG_TARGET;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, Instrument};

const CGI_BIN_PREFIX: &str = "/cgi-bin/";
const CGI_EXTENSION: &str = "cgi";

/// Routing tables derived from the configuration.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    pub extensions: HashMap<String, String>,
    pub paths: Vec<(String, String)>,
    pub rewrite: RewriteEngine,
}

impl RouteTable {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            extensions: config.invoke_on_extension.clone(),
            paths: config
                .invoke_on_path
                .iter()
                .map(|route| (route.prefix.clone(), route.application.clone()))
                .collect(),
            rewrite: RewriteEngine::new(&config.rewrite_rules)?,
        })
    }

    /// Application of the first path route whose prefix starts `path`.
    pub fn application_for_path(&self, path: &str) -> Option<&str> {
        self.paths
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, application)| application.as_str())
    }

    pub fn application_for_extension(&self, extension: &str) -> Option<&str> {
        self.extensions.get(extension).map(String::as_str)
    }
}

/// Owns the handlers and runs every request through rewrite, handler
/// selection, invocation and error translation.
pub struct Dispatcher {
    config: Arc<Config>,
    routes: RouteTable,
    context: Arc<ServerContext>,
    handlers: BTreeMap<String, Arc<dyn DocumentHandler>>,
    static_handler: Arc<dyn DocumentHandler>,
}

impl Dispatcher {
    /// Build the route table and the named application handlers. FastCGI
    /// handlers are only created for applications some route refers to.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let routes = RouteTable::from_config(&config)?;
        let context = Arc::new(ServerContext {
            document_root: config.document_root.clone(),
            port: config.effective_port(),
            software: SERVER_SOFTWARE.to_string(),
        });

        let mut handlers: BTreeMap<String, Arc<dyn DocumentHandler>> = BTreeMap::new();
        for (name, application) in &config.cgi_applications {
            handlers.insert(
                name.clone(),
                Arc::new(CgiHandler::new(name, application.clone(), context.clone())),
            );
        }
        let routed: Vec<&str> = config.routed_applications().collect();
        for (name, application) in &config.fastcgi_applications {
            if !routed.contains(&name.as_str()) {
                debug!(application = %name, "FastCGI application is not routed, skipping");
                continue;
            }
            let handler = FastCgiHandler::new(name, application, context.clone())
                .with_context(|| format!("FastCGI application {name}"))?;
            handlers.insert(name.clone(), Arc::new(handler));
        }

        Ok(Self {
            static_handler: Arc::new(StaticHandler::new(&config.document_root)),
            config,
            routes,
            context,
            handlers,
        })
    }

    /// Replace or add a named handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn DocumentHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Run every named handler's one-time setup. The first failure aborts.
    pub async fn initialize(&self) -> Result<()> {
        for (name, handler) in &self.handlers {
            debug!(application = %name, handler = handler.name(), "initializing handler");
            handler
                .initialize()
                .await
                .with_context(|| format!("initializing application {name}"))?;
        }
        Ok(())
    }

    pub async fn dispose(&self) {
        for (name, handler) in &self.handlers {
            debug!(application = %name, "disposing handler");
            handler.dispose().await;
        }
    }

    /// Answer `request`. Handler failures become a 500 page; this never fails.
    pub async fn dispatch(&self, request: GatewayRequest) -> Response<Body> {
        let span = request.span.clone();
        self.dispatch_in_span(request).instrument(span).await
    }

    async fn dispatch_in_span(&self, mut request: GatewayRequest) -> Response<Body> {
        let started = Instant::now();
        let request_id = request.unique_id.clone();
        let method = request.method.clone();
        let uri = request.uri.clone();
        let remote = request
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string());

        let rewritten = self.routes.rewrite.rewrite(&request.url);
        request = request.with_url(rewritten);
        debug!(request = %request, url = %request.url, "incoming request");

        let mut handler_name = String::from("-");
        let outcome = match self.select(request) {
            Ok((handler, request)) => {
                handler_name = handler.name().to_string();
                debug!(
                    handler = %handler_name,
                    url = %request.url,
                    path_info = %request.path_info,
                    "selected handler"
                );
                handler.handle(request).await
            }
            Err(e) => Err(e),
        };

        let response = outcome.unwrap_or_else(|e| {
            error!(
                request_id = %request_id,
                handler = %handler_name,
                error = ?e,
                "request handling failed"
            );
            internal_error_page(&e)
        });

        let elapsed = started.elapsed();
        info!(
            target: ACCESS_LOG_TARGET,
            remote = %remote,
            method = %method,
            uri = %uri,
            status = u64::from(response.status().as_u16()),
            handler = %handler_name,
            request_id = %request_id,
            latency_ms = elapsed.as_secs_f64() * 1000.0,
            "{} took {}ms",
            request_id,
            elapsed.as_millis()
        );
        response
    }

    fn select(
        &self,
        mut request: GatewayRequest,
    ) -> Result<(Arc<dyn DocumentHandler>, GatewayRequest)> {
        if request.url.path.split('/').any(|segment| segment == "..") {
            return Ok((self.static_handler.clone(), request));
        }

        if self.config.enable_cgi_bin && request.url.path.starts_with(CGI_BIN_PREFIX) {
            request = self.apply_path_info(request);
            let script = self.local_path(&request.url.path);
            if !script.is_file() {
                return Ok((self.static_handler.clone(), request));
            }
            let handler: Arc<dyn DocumentHandler> =
                Arc::new(CgiHandler::for_script(&script, self.context.clone()));
            return Ok((handler, request));
        }

        if let Some(application) = self.routes.application_for_path(&request.url.path) {
            return Ok((self.named(application)?, request));
        }

        if self.config.allow_path_info {
            request = self.apply_path_info(request);
        }

        let local = self.local_path(&request.url.path);
        if let Some(handler) = self.from_extension(&request.url, &local)? {
            return Ok((handler, request));
        }

        if local.is_dir() {
            let document = self
                .config
                .default_documents
                .iter()
                .find(|document| local.join(document.as_str()).is_file());
            if let Some(document) = document {
                let path = format!("{}/{}", request.url.path.trim_end_matches('/'), document);
                let url = RequestUrl::new(path, request.url.query.clone());
                request = request.with_url(url);
                let local = self.local_path(&request.url.path);
                let handler = self
                    .from_extension(&request.url, &local)?
                    .unwrap_or_else(|| self.static_handler.clone());
                return Ok((handler, request));
            }
        }

        Ok((self.static_handler.clone(), request))
    }

    fn from_extension(
        &self,
        url: &RequestUrl,
        local: &Path,
    ) -> Result<Option<Arc<dyn DocumentHandler>>> {
        let Some(extension) = url.extension() else {
            return Ok(None);
        };
        if self.config.cgi_extension && extension == CGI_EXTENSION {
            let handler = CgiHandler::for_script(local, self.context.clone());
            return Ok(Some(Arc::new(handler)));
        }
        self.routes
            .application_for_extension(extension)
            .map(|application| self.named(application))
            .transpose()
    }

    fn named(&self, application: &str) -> Result<Arc<dyn DocumentHandler>> {
        self.handlers.get(application).cloned().ok_or_else(|| {
            anyhow!(GatewayError::Setup(format!(
                "no handler for application {application}"
            )))
        })
    }

    fn apply_path_info(&self, request: GatewayRequest) -> GatewayRequest {
        let split = resolve_path_info(&self.config.document_root, &request.url.path);
        let url = RequestUrl::new(split.script_path, request.url.query.clone());
        request.with_path_info(url, split.path_info)
    }

    fn local_path(&self, url_path: &str) -> PathBuf {
        self.config
            .document_root
            .join(url_path.trim_start_matches('/'))
    }
}

fn internal_error_page(error: &anyhow::Error) -> Response<Body> {
    let page = format!(
        "<html>\n<head>\n<title>Internal error</title>\n</head>\n<body>\n\
         <h1>Internal error</h1>\n<p>{}</p>\n<pre>{}</pre>\n</body>\n</html>\n",
        escape_html(&format!("{error:#}")),
        escape_html(&format!("{error:?}")),
    );
    html_response(StatusCode::INTERNAL_SERVER_ERROR, page)
}

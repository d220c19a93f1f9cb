use super::DocumentHandler;
use crate::cgi::CgiExecutor;
use crate::request::GatewayRequest;
use crate::variables::{build_gateway_variables, GatewayInterface, ServerContext};
use anyhow::Result;
use async_trait::async_trait;
use hyper::{Body, Response};
use prism_core::config::ApplicationConfig;
use std::path::Path;
use std::sync::Arc;

/// Runs a CGI application per request.
pub struct CgiHandler {
    name: String,
    executor: CgiExecutor,
    context: Arc<ServerContext>,
}

impl CgiHandler {
    pub fn new(name: &str, application: ApplicationConfig, context: Arc<ServerContext>) -> Self {
        Self {
            name: format!("CGI: {name}"),
            executor: CgiExecutor::new(application),
            context,
        }
    }

    /// Handler that executes the script file itself, as used for `/cgi-bin/`
    /// and `.cgi` documents.
    pub fn for_script(script: &Path, context: Arc<ServerContext>) -> Self {
        let application = ApplicationConfig {
            path: script.to_path_buf(),
            ..Default::default()
        };
        Self::new(&script.display().to_string(), application, context)
    }
}

#[async_trait]
impl DocumentHandler for CgiHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, mut request: GatewayRequest) -> Result<Response<Body>> {
        let body = request.take_body().await?;
        let body = request.has_body().then_some(body);
        let variables = build_gateway_variables(&request, &self.context, GatewayInterface::Cgi);
        self.executor
            .execute(&variables, body, &request.span)
            .await?
            .into_response()
    }
}

use super::DocumentHandler;
use crate::error::GatewayError;
use crate::fastcgi::record::{FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS};
use crate::fastcgi::supervisor::STARTUP_WINDOW;
use crate::fastcgi::{FastCgiAddress, FastCgiTarget, Supervisor};
use crate::request::GatewayRequest;
use crate::variables::{build_gateway_variables, GatewayInterface, ServerContext};
use anyhow::Result;
use async_trait::async_trait;
use hyper::{Body, Response};
use prism_core::config::{ApplicationConfig, FastCgiApplicationConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error};

/// Forwards requests to a FastCGI responder, optionally launching it first.
pub struct FastCgiHandler {
    application: String,
    name: String,
    target: FastCgiTarget,
    launch: Option<ApplicationConfig>,
    supervisor: OnceCell<Supervisor>,
    context: Arc<ServerContext>,
}

impl FastCgiHandler {
    pub fn new(
        application: &str,
        config: &FastCgiApplicationConfig,
        context: Arc<ServerContext>,
    ) -> Result<Self, GatewayError> {
        let address = FastCgiAddress::parse(&config.socket)?;
        Ok(Self {
            application: application.to_string(),
            name: format!("FastCGI: {address}"),
            target: FastCgiTarget::new(address),
            launch: config.launch.clone(),
            supervisor: OnceCell::new(),
            context,
        })
    }

    async fn handshake(&self) -> Result<()> {
        let values = match self.target.query_values().await {
            Ok(values) => values,
            Err(e) => {
                if let Some(GatewayError::Connection { .. }) = e.downcast_ref::<GatewayError>() {
                    return Err(GatewayError::Setup(format!(
                        "FastCGI application {} on {} is not available: {e:#}",
                        self.application,
                        self.target.address()
                    ))
                    .into());
                }
                return Err(e);
            }
        };
        let Some(values) = values else {
            return Ok(());
        };
        debug!(
            application = %self.application,
            max_conns = value_of(&values, FCGI_MAX_CONNS),
            max_reqs = value_of(&values, FCGI_MAX_REQS),
            mpxs_conns = value_of(&values, FCGI_MPXS_CONNS),
            "FastCGI backend limits"
        );
        if value_of(&values, FCGI_MPXS_CONNS) == "1" {
            return Err(GatewayError::Setup(format!(
                "FastCGI application {} multiplexes connections (FCGI_MPXS_CONNS=1), \
                 which is not supported",
                self.application
            ))
            .into());
        }
        Ok(())
    }
}

fn value_of<'a>(values: &'a HashMap<String, String>, key: &str) -> &'a str {
    values.get(key).map(String::as_str).unwrap_or("")
}

#[async_trait]
impl DocumentHandler for FastCgiHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        if let Some(launch) = &self.launch {
            let supervisor = self
                .supervisor
                .get_or_try_init(|| async { Supervisor::launch(launch, &self.application) })
                .await?;
            if let Err(e) = supervisor
                .wait_until_responsive(&self.target, STARTUP_WINDOW)
                .await
            {
                error!(
                    application = %self.application,
                    error = %e,
                    "FastCGI backend did not come up"
                );
                supervisor.shutdown().await;
                return Err(e);
            }
        }
        self.handshake().await
    }

    async fn handle(&self, mut request: GatewayRequest) -> Result<Response<Body>> {
        let body = request.take_body().await?;
        let body = request.has_body().then_some(body);
        let params = build_gateway_variables(&request, &self.context, GatewayInterface::FastCgi);
        self.target
            .execute(&params, body, &request.span)
            .await?
            .into_response()
    }

    async fn dispose(&self) {
        if let Some(supervisor) = self.supervisor.get() {
            supervisor.shutdown().await;
        }
    }
}

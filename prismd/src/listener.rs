use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::request::GatewayRequest;
use anyhow::Result;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Bind an HTTP listener, reporting privilege and address-in-use failures
/// with a hint on how to resolve them.
pub async fn bind(address: &str) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(address)
        .await
        .map_err(|err| GatewayError::bind(address, err))
}

/// Accept connections until `shutdown` flips to `true`. Each connection is
/// served on its own task; requests on it go to `dispatcher`.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "listening");
    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = ?err, "accept failed");
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(address = %local_addr, "listener stopped");
                    return Ok(());
                }
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                handle_request(req, dispatcher.clone(), remote_addr, local_addr)
            });
            if let Err(err) = Http::new().serve_connection(stream, service).await {
                debug!(error = ?err, remote = %remote_addr, "connection closed with error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Body>,
    dispatcher: Arc<Dispatcher>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    let request = GatewayRequest::from_hyper(req, Some(remote_addr), Some(local_addr));
    Ok(dispatcher.dispatch(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::config::Config;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn address_in_use_is_reported() {
        let first = bind("127.0.0.1:0").await.unwrap();
        let address = first.local_addr().unwrap().to_string();
        let err = bind(&address).await.unwrap_err();
        assert!(err.to_string().contains("already in use"), "{err}");
    }

    #[tokio::test]
    async fn serves_requests_until_shutdown() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("hello.txt"), "hello").unwrap();
        let config = Config {
            document_root: root.path().to_path_buf(),
            ..Default::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(config)).unwrap());
        let listener = bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (stop, stopped) = watch::channel(false);
        let server = tokio::spawn(serve(listener, dispatcher, stopped));

        let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
        stream
            .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK"), "{reply}");
        assert!(reply.ends_with("hello"), "{reply}");

        stop.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}

use super::record::{
    begin_request_body, encode_params, read_record, write_chunks, write_record, write_stream,
    EndRequestBody, Record, RecordType, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS,
    FCGI_NULL_REQUEST_ID, FCGI_RESPONDER,
};
use crate::cgi_response::{parse_cgi_output, CgiResponse};
use crate::error::GatewayError;
use anyhow::{anyhow, Result};
use bytes::BytesMut;
use hyper::body::HttpBody as _;
use hyper::Body;
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, error, warn};

/// Where a FastCGI backend accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastCgiAddress {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl FastCgiAddress {
    /// Parse `host:port` (an IP socket address) or a Unix socket path, given
    /// either as `unix:///run/app.sock` or as a plain path containing `/`.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let raw = raw.trim();
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Ok(Self::Tcp(addr));
        }
        let path = raw
            .strip_prefix("unix://")
            .or_else(|| raw.contains('/').then_some(raw));
        match path {
            #[cfg(unix)]
            Some(path) if !path.is_empty() => Ok(Self::Unix(PathBuf::from(path))),
            _ => Err(GatewayError::Setup(format!(
                "socket {raw} is not a valid socket (expected ip:port or a unix socket path)"
            ))),
        }
    }
}

impl fmt::Display for FastCgiAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A connection to a FastCGI backend.
#[derive(Debug)]
pub enum FastCgiStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for FastCgiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FastCgiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Values reported by a backend in reply to `FCGI_GET_VALUES`.
pub type BackendValues = HashMap<String, String>;

/// One FastCGI backend. Every request uses a fresh connection, so request ids
/// only need to be unique per target.
#[derive(Debug)]
pub struct FastCgiTarget {
    address: FastCgiAddress,
    request_ids: AtomicU32,
}

impl FastCgiTarget {
    pub fn new(address: FastCgiAddress) -> Self {
        Self {
            address,
            request_ids: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> &FastCgiAddress {
        &self.address
    }

    /// Next request id. Wraps from `u32::MAX` to 1; zero is reserved for
    /// management records and never returned.
    pub fn next_request_id(&self) -> u32 {
        let previous = self
            .request_ids
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(following_request_id(id))
            })
            .unwrap_or_else(|id| id);
        following_request_id(previous)
    }

    pub async fn connect(&self) -> Result<FastCgiStream, GatewayError> {
        let connection_error = |source| GatewayError::Connection {
            address: self.address.to_string(),
            source,
        };
        match &self.address {
            FastCgiAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(connection_error)?;
                let _ = stream.set_nodelay(true);
                Ok(FastCgiStream::Tcp(stream))
            }
            #[cfg(unix)]
            FastCgiAddress::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(connection_error)?;
                Ok(FastCgiStream::Unix(stream))
            }
        }
    }

    /// Send one responder request and collect the backend's reply.
    ///
    /// Stdout records are concatenated and parsed as CGI output; stderr
    /// records are logged line by line in `span`. Records for other request
    /// ids are skipped. One corrupt record is tolerated per request.
    pub async fn execute(
        &self,
        params: &HashMap<String, String>,
        body: Option<Body>,
        span: &tracing::Span,
    ) -> Result<CgiResponse> {
        let request_id = wire_request_id(self.next_request_id());
        debug!(parent: span, request_id, backend = %self.address, "sending FastCGI request");

        let mut stream = self.connect().await?;
        write_record(
            &mut stream,
            RecordType::BeginRequest,
            request_id,
            &begin_request_body(FCGI_RESPONDER, 0),
        )
        .await?;
        let pairs = params.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        let encoded = encode_params(pairs);
        write_stream(&mut stream, RecordType::Params, request_id, &encoded).await?;
        if let Some(mut body) = body {
            while let Some(chunk) = body.data().await {
                write_chunks(&mut stream, RecordType::Stdin, request_id, &chunk?).await?;
            }
        }
        write_record(&mut stream, RecordType::Stdin, request_id, &[]).await?;
        stream.flush().await?;

        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();
        let mut corrupt_seen = false;
        loop {
            let record = match read_record(&mut stream).await {
                Ok(record) => record,
                Err(e) if !corrupt_seen && GatewayError::is_protocol_corruption(&e) => {
                    error!(
                        parent: span,
                        request_id,
                        error = %e,
                        "corrupt FastCGI record, reading the next one"
                    );
                    corrupt_seen = true;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(record) = record else {
                warn!(
                    parent: span,
                    request_id,
                    "FastCGI backend closed the connection before END_REQUEST"
                );
                break;
            };
            if record.request_id != request_id {
                debug!(
                    parent: span,
                    request_id,
                    other_id = record.request_id,
                    record_type = ?record.record_type,
                    "discarding record for another request"
                );
                continue;
            }
            match record.record_type {
                RecordType::Stdout => stdout.extend_from_slice(&record.content),
                RecordType::Stderr => stderr.extend_from_slice(&record.content),
                RecordType::EndRequest => {
                    let end = EndRequestBody::decode(&record.content)?;
                    debug!(
                        parent: span,
                        request_id,
                        app_status = end.app_status,
                        protocol_status = end.protocol_status,
                        "FastCGI request ended"
                    );
                    break;
                }
                other => debug!(parent: span, request_id, record_type = ?other, "ignoring record"),
            }
        }

        for line in String::from_utf8_lossy(&stderr).lines() {
            error!(parent: span, line = %line, "FastCGI error output");
        }
        parse_cgi_output(&mut Cursor::new(stdout.freeze()))
    }

    /// Ask the backend for its connection limits with `FCGI_GET_VALUES`.
    ///
    /// Returns `None` when the backend answers with something other than
    /// `FCGI_GET_VALUES_RESULT`.
    pub async fn query_values(&self) -> Result<Option<BackendValues>> {
        let mut stream = self.connect().await?;
        let query = encode_params([
            (FCGI_MAX_CONNS, ""),
            (FCGI_MAX_REQS, ""),
            (FCGI_MPXS_CONNS, ""),
        ]);
        write_record(
            &mut stream,
            RecordType::GetValues,
            FCGI_NULL_REQUEST_ID,
            &query,
        )
        .await?;
        stream.flush().await?;

        match read_record(&mut stream).await? {
            Some(Record {
                record_type: RecordType::GetValuesResult,
                content,
                ..
            }) => Ok(Some(super::record::decode_params(&content)?)),
            Some(other) => {
                error!(
                    backend = %self.address,
                    record_type = ?other.record_type,
                    "expected GET_VALUES_RESULT"
                );
                Ok(None)
            }
            None => Err(anyhow!(
                "FastCGI backend {} closed the connection during GET_VALUES",
                self.address
            )),
        }
    }
}

fn following_request_id(id: u32) -> u32 {
    if id == u32::MAX {
        1
    } else {
        id + 1
    }
}

/// Fold a request id into the 16-bit header field, skipping zero.
pub fn wire_request_id(id: u32) -> u16 {
    (id.wrapping_sub(1) % u32::from(u16::MAX)) as u16 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_unix_addresses() {
        assert_eq!(
            FastCgiAddress::parse("127.0.0.1:9000").unwrap(),
            FastCgiAddress::Tcp("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(
            FastCgiAddress::parse("[::1]:9000").unwrap(),
            FastCgiAddress::Tcp("[::1]:9000".parse().unwrap())
        );
        #[cfg(unix)]
        {
            assert_eq!(
                FastCgiAddress::parse("/run/php/fpm.sock").unwrap(),
                FastCgiAddress::Unix(PathBuf::from("/run/php/fpm.sock"))
            );
            assert_eq!(
                FastCgiAddress::parse("unix:///tmp/app.sock").unwrap(),
                FastCgiAddress::Unix(PathBuf::from("/tmp/app.sock"))
            );
        }
        assert!(matches!(
            FastCgiAddress::parse("not a socket"),
            Err(GatewayError::Setup(_))
        ));
    }

    #[test]
    fn request_ids_start_at_one_and_skip_zero() {
        let target = FastCgiTarget::new(FastCgiAddress::Tcp("127.0.0.1:9".parse().unwrap()));
        assert_eq!(target.next_request_id(), 1);
        assert_eq!(target.next_request_id(), 2);

        target.request_ids.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(target.next_request_id(), u32::MAX);
        assert_eq!(target.next_request_id(), 1);
    }

    #[test]
    fn wire_ids_are_never_zero() {
        assert_eq!(wire_request_id(1), 1);
        assert_eq!(wire_request_id(65535), 65535);
        assert_eq!(wire_request_id(65536), 1);
        assert_eq!(wire_request_id(u32::MAX), 65535);
        assert_ne!(wire_request_id(0), 0);
    }

    #[tokio::test]
    async fn wrapped_request_id_restarts_at_one_on_the_wire() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut id = 0;
                while let Some(record) = read_record(&mut stream).await.unwrap() {
                    match record.record_type {
                        RecordType::BeginRequest => id = record.request_id,
                        RecordType::Stdin if record.content.is_empty() => break,
                        _ => {}
                    }
                }
                seen_tx.send(id).unwrap();
                write_record(&mut stream, RecordType::Stdout, id, b"Status: 204\r\n\r\n")
                    .await
                    .unwrap();
                write_record(&mut stream, RecordType::EndRequest, id, &[0; 8])
                    .await
                    .unwrap();
            }
        });

        let target = FastCgiTarget::new(FastCgiAddress::Tcp(addr));
        target.request_ids.store(u32::MAX - 1, Ordering::Relaxed);
        for expected in [65535u16, 1] {
            let response = target
                .execute(&HashMap::new(), None, &tracing::Span::none())
                .await
                .unwrap();
            assert_eq!(response.status, Some(204));
            assert_eq!(seen_rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = FastCgiTarget::new(FastCgiAddress::Tcp(addr));
        let err = target.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection { .. }));
    }
}

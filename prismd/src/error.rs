use std::io;
use thiserror::Error;

/// Failures with a distinct meaning for startup or request handling.
///
/// Anything else a handler returns is a plain `anyhow::Error` and ends up as a
/// 500 response.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Prevents the server from starting.
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("cannot connect to {address}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    /// A FastCGI record could not be decoded.
    #[error("corrupt FastCGI record: {0}")]
    ProtocolCorruption(String),

    #[error("cannot listen on {address}: {reason}")]
    Bind {
        address: String,
        reason: &'static str,
        #[source]
        source: io::Error,
    },
}

impl GatewayError {
    pub fn bind(address: impl Into<String>, source: io::Error) -> Self {
        let reason = match source.kind() {
            io::ErrorKind::PermissionDenied => {
                "binding this address requires elevated privileges \
                 (use a port above 1024 or run with the required capability)"
            }
            io::ErrorKind::AddrInUse => {
                "the address is already in use by another process (stop it or pick another port)"
            }
            io::ErrorKind::AddrNotAvailable => "the address is not available on this host",
            _ => "bind failed",
        };
        Self::Bind {
            address: address.into(),
            reason,
            source,
        }
    }

    pub fn is_protocol_corruption(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::ProtocolCorruption(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_errors_have_specific_messages() {
        let denied = GatewayError::bind(
            "0.0.0.0:80",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(denied.to_string().contains("elevated privileges"));

        let in_use = GatewayError::bind(
            "127.0.0.1:8080",
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        assert!(in_use.to_string().contains("already in use"));
        assert!(in_use.to_string().starts_with("cannot listen on 127.0.0.1:8080"));
    }

    #[test]
    fn protocol_corruption_is_detected_through_anyhow() {
        let err = anyhow::Error::new(GatewayError::ProtocolCorruption("bad version".into()));
        assert!(GatewayError::is_protocol_corruption(&err));
        let other = anyhow::anyhow!("something else");
        assert!(!GatewayError::is_protocol_corruption(&other));
    }
}

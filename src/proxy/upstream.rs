//! Upstream connection and request forwarding
//!
//! Dials the authority a request was resolved to, sends the rewritten
//! request and relays the upstream's bytes back to the client. Upgrade
//! requests (WebSocket) become a bidirectional tunnel.

use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use bytes::BytesMut;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Default buffer size for streaming
const BUFFER_SIZE: usize = 8192;

/// Headers that only make sense on a single hop
const HOP_BY_HOP: [&str; 5] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "Upgrade",
];

/// Failures that happen before any upstream byte reached the client
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream authority '{0}'")]
    InvalidAuthority(String),

    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("failed to connect to {0}: {1}")]
    Connect(String, #[source] std::io::Error),

    #[error("TLS handshake with {0} failed: {1}")]
    Tls(String, #[source] std::io::Error),

    #[error("upstream {0} did not respond in time")]
    ResponseTimeout(String),

    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpstreamError {
    /// Response sent to the client in place of the upstream's
    pub fn to_response(&self) -> Response {
        let status = match self {
            UpstreamError::ConnectTimeout(_) | UpstreamError::ResponseTimeout(_) => {
                StatusCode::GatewayTimeout
            }
            _ => StatusCode::BadGateway,
        };

        Response::json_error(status, &self.to_string())
    }
}

/// Where a resolved authority points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Path component of the authority without trailing slash, often empty
    pub base_path: String,
}

impl UpstreamTarget {
    pub fn parse(authority: &str) -> Result<Self, UpstreamError> {
        let invalid = || UpstreamError::InvalidAuthority(authority.to_string());

        let url = url::Url::parse(authority).map_err(|_| invalid())?;
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return Err(invalid()),
        };
        let host = url.host_str().ok_or_else(invalid)?.to_string();
        let port = url.port_or_known_default().ok_or_else(invalid)?;
        let base_path = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            host,
            port,
            tls,
            base_path,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// TLS server name; IP literals become IP names without brackets
    pub fn server_name(&self) -> Result<ServerName<'static>, UpstreamError> {
        let bare = self.host.trim_start_matches('[').trim_end_matches(']');

        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(ServerName::IpAddress(ip.into()));
        }

        ServerName::try_from(bare.to_string())
            .map_err(|_| UpstreamError::InvalidAuthority(self.host.clone()))
    }
}

/// Any duplex byte stream to an upstream, plain or TLS
pub trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamStream for T {}

/// Forwards resolved requests to their upstream
pub struct ProxyHandler {
    tls: TlsConnector,

    /// Covers TCP connect and TLS handshake
    connection_timeout: Duration,

    /// Covers sending the request and waiting for the first response bytes
    response_timeout: Duration,
}

impl ProxyHandler {
    /// Create a proxy handler trusting the system root certificates
    pub fn new(connection_timeout: Duration, response_timeout: Duration) -> Self {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            tracing::warn!("Certificate load error: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        tracing::debug!(added, ignored, "Loaded system root certificates");

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
            connection_timeout,
            response_timeout,
        }
    }

    /// Forward `request` to `authority` and relay the answer into `client`.
    ///
    /// `pending` holds client bytes already read past the request; they are
    /// passed on for upgraded connections and dropped otherwise. An `Err` means nothing has been
    /// written to the client yet. Failures once relaying started are logged
    /// and end the exchange.
    pub async fn forward<C>(
        &self,
        client: &mut C,
        request: &Request,
        authority: &str,
        pending: &[u8],
    ) -> Result<(), UpstreamError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let target = UpstreamTarget::parse(authority)?;
        let mut upstream = self.connect(&target).await?;

        let request_bytes = self.build_http_request(request, &target);

        tracing::debug!(
            upstream = %target.addr(),
            method = request.method.as_str(),
            upgrade = request.is_upgrade(),
            "Forwarding request"
        );

        if request.is_upgrade() {
            return self.tunnel(client, upstream, &request_bytes, pending, &target).await;
        }

        // The client connection closes after the relayed response
        if !pending.is_empty() {
            tracing::debug!(
                upstream = %target.addr(),
                bytes = pending.len(),
                "Discarding pipelined client bytes"
            );
        }

        // Send the request and wait for the head of the response
        let mut head = BytesMut::with_capacity(BUFFER_SIZE);
        let n = timeout(self.response_timeout, async {
            upstream.write_all(&request_bytes).await?;
            upstream.flush().await?;
            upstream.read_buf(&mut head).await
        })
        .await
        .map_err(|_| UpstreamError::ResponseTimeout(target.addr()))??;

        if n == 0 {
            return Err(UpstreamError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed before responding",
            )));
        }

        // From here on the client has seen upstream bytes; errors are only logged
        if let Err(e) = relay(client, &mut upstream, &head).await {
            tracing::warn!(upstream = %target.addr(), error = %e, "Relaying response failed");
        }

        Ok(())
    }

    async fn connect(&self, target: &UpstreamTarget) -> Result<Box<dyn UpstreamStream>, UpstreamError> {
        let addr = target.addr();

        let connecting = async {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| UpstreamError::Connect(addr.clone(), e))?;

            tracing::trace!(upstream = %addr, "Connected to upstream");

            if !target.tls {
                return Ok(Box::new(stream) as Box<dyn UpstreamStream>);
            }

            let server_name = target.server_name()?;
            let stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| UpstreamError::Tls(addr.clone(), e))?;

            Ok::<_, UpstreamError>(Box::new(stream) as Box<dyn UpstreamStream>)
        };

        timeout(self.connection_timeout, connecting)
            .await
            .map_err(|_| UpstreamError::ConnectTimeout(addr.clone()))?
    }

    async fn tunnel<C>(
        &self,
        client: &mut C,
        mut upstream: Box<dyn UpstreamStream>,
        request_bytes: &[u8],
        pending: &[u8],
        target: &UpstreamTarget,
    ) -> Result<(), UpstreamError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        upstream.write_all(request_bytes).await?;
        if !pending.is_empty() {
            upstream.write_all(pending).await?;
        }
        upstream.flush().await?;

        match tokio::io::copy_bidirectional(client, &mut upstream).await {
            Ok((sent, received)) => {
                tracing::debug!(upstream = %target.addr(), sent, received, "Tunnel closed");
            }
            Err(e) => {
                tracing::warn!(upstream = %target.addr(), error = %e, "Tunnel failed");
            }
        }

        Ok(())
    }

    /// Build HTTP request bytes to send upstream
    ///
    /// The request must already be resolved: its `Host` header and
    /// credential are sent as they are.
    pub fn build_http_request(&self, request: &Request, target: &UpstreamTarget) -> Vec<u8> {
        let mut buffer = Vec::new();

        let path = if request.path.is_empty() {
            "/"
        } else {
            &request.path
        };

        buffer.extend_from_slice(
            format!(
                "{} {}{} {}\r\n",
                request.method.as_str(),
                target.base_path,
                path,
                request.version
            )
            .as_bytes(),
        );

        let mut request = request.clone();
        if request.header("Host").is_none() {
            let host = match (target.tls, target.port) {
                (true, 443) | (false, 80) => target.host.clone(),
                _ => target.addr(),
            };
            request.set_header("Host", host);
        }

        if !request.is_upgrade() {
            for header in HOP_BY_HOP {
                request.remove_header(header);
            }
            request.set_header("Connection", "close");
        }

        if !request.body.is_empty() || request.header("Content-Length").is_some() {
            request.set_header("Content-Length", request.body.len().to_string());
        }

        for (key, value) in &request.headers {
            buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }

        // End of headers
        buffer.extend_from_slice(b"\r\n");

        if !request.body.is_empty() {
            buffer.extend_from_slice(&request.body);
        }

        buffer
    }
}

/// Write `head` to the client, then copy the rest of the upstream stream.
async fn relay<C>(client: &mut C, upstream: &mut Box<dyn UpstreamStream>, head: &[u8]) -> std::io::Result<u64>
where
    C: AsyncWrite + Unpin,
{
    client.write_all(head).await?;
    let copied = tokio::io::copy(upstream, client).await?;
    client.flush().await?;

    Ok(head.len() as u64 + copied)
}

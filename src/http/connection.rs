use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::http::parser::{parse_http_request, ParseError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::proxy::resolver::Resolver;
use crate::proxy::upstream::ProxyHandler;

pub struct Connection<S> {
    stream: S,
    buffer: Vec<u8>,
    state: ConnectionState,
    resolver: Resolver,
    proxy: Arc<ProxyHandler>,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Forwarding(Request, String), // resolved request + upstream authority
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, resolver: Resolver, proxy: Arc<ProxyHandler>) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            resolver,
            proxy,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await {
                        Ok(Some(req)) => ConnectionState::Processing(req),
                        Ok(None) => ConnectionState::Closed,
                        Err(e) => {
                            tracing::warn!(error = %e, "Rejecting malformed request");
                            let writer = ResponseWriter::new(&Response::bad_request(), false);
                            ConnectionState::Writing(writer, false)
                        }
                    };
                }

                ConnectionState::Processing(mut req) => {
                    let keep_alive = req.keep_alive();

                    // A failed resolution never reaches the upstream
                    self.state = match self.resolver.resolve(&mut req) {
                        Ok(resolution) => ConnectionState::Forwarding(req, resolution.authority),
                        Err(e) => {
                            tracing::debug!(error = %e, "Resolution failed");
                            let writer = ResponseWriter::new(&Response::internal_error(), keep_alive);
                            ConnectionState::Writing(writer, keep_alive)
                        }
                    };
                }

                ConnectionState::Forwarding(req, authority) => {
                    let pending = std::mem::take(&mut self.buffer);

                    self.state = match self
                        .proxy
                        .forward(&mut self.stream, &req, &authority, &pending)
                        .await
                    {
                        Ok(()) => ConnectionState::Closed,
                        Err(e) => {
                            tracing::warn!(upstream = %authority, error = %e, "Proxy error");
                            ConnectionState::Writing(ResponseWriter::new(&e.to_response(), false), false)
                        }
                    };
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn read_request(&mut self) -> anyhow::Result<Option<Request>> {
        loop {
            // Try parsing whatever we already have
            match parse_http_request(&self.buffer) {
                Ok((request, consumed)) => {
                    // Remove consumed bytes
                    self.buffer.drain(..consumed);
                    return Ok(Some(request));
                }

                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                }

                Err(e) => {
                    // Malformed request → protocol error
                    return Err(anyhow::anyhow!("HTTP parse error: {:?}", e));
                }
            }

            // Read more data
            let mut temp = [0u8; 1024];
            let n = self.stream.read(&mut temp).await?;

            if n == 0 {
                // Client closed connection
                return Ok(None);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}

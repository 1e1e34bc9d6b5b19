use std::error::Error as StdError;
use std::fmt;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use super::{BodyStream, Connecting, Connection, Destination, SendError, Sending, Transport};
use crate::error::BoxError;

/// HTTP/1.1 over plain TCP.
///
/// Each connection is driven by its own task on the current tokio runtime.
/// Secured targets are refused: this transport does not negotiate TLS.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    nodelay: bool,
}

impl Default for HttpTransport {
    fn default() -> HttpTransport {
        HttpTransport::new()
    }
}

impl HttpTransport {
    pub fn new() -> HttpTransport {
        HttpTransport { nodelay: true }
    }

    /// Set `TCP_NODELAY` on new connections. Enabled by default.
    pub fn tcp_nodelay(mut self, enabled: bool) -> HttpTransport {
        self.nodelay = enabled;
        self
    }
}

impl Transport for HttpTransport {
    fn connect(&self, dst: &Destination) -> Connecting {
        Box::pin(connect(dst.clone(), self.nodelay))
    }
}

async fn connect(dst: Destination, nodelay: bool) -> Result<Box<dyn Connection>, BoxError> {
    if dst.scheme() != "http" {
        return Err(Box::new(UnsupportedScheme(dst.scheme().to_owned())));
    }

    log::trace!("connecting to {dst:?}");
    let stream = TcpStream::connect((dst.host(), dst.port())).await?;
    stream.set_nodelay(nodelay)?;

    let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            log::debug!("connection error: {err}");
        }
    });

    Ok(Box::new(HttpConnection { sender }))
}

struct HttpConnection {
    sender: SendRequest<Full<Bytes>>,
}

impl Connection for HttpConnection {
    fn send(&mut self, request: http::Request<Bytes>) -> Sending<'_> {
        Box::pin(async move {
            // a closed connection has not seen a byte of this request
            self.sender
                .ready()
                .await
                .map_err(|e| SendError::new(e, false))?;

            let response = self
                .sender
                .try_send_request(request.map(Full::new))
                .await
                .map_err(|mut e| {
                    let written = e.take_message().is_none();
                    SendError::new(e.into_error(), written)
                })?;

            Ok(response.map(|body| {
                Box::pin(body.into_data_stream().map_err(BoxError::from)) as BodyStream
            }))
        })
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[derive(Debug)]
struct UnsupportedScheme(String);

impl fmt::Display for UnsupportedScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported scheme: {}", self.0)
    }
}

impl StdError for UnsupportedScheme {}

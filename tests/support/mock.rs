//! An in-memory transport, for driving the client without sockets.

use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use ferry::transport::{
    BodyStream, Connecting, Connection, Destination, SendError, Sending, Transport,
};

type Respond =
    dyn Fn(usize, &http::Request<Bytes>) -> Result<http::Response<Bytes>, SendError> + Send + Sync;

/// Answers every exchange with `respond(n, request)`, `n` counting the
/// exchanges sent so far on any connection.
#[derive(Clone)]
pub struct MockTransport {
    respond: Arc<Respond>,
    refuse_connect: bool,
    pub connects: Arc<AtomicUsize>,
    pub sends: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new<F>(respond: F) -> MockTransport
    where
        F: Fn(usize, &http::Request<Bytes>) -> Result<http::Response<Bytes>, SendError>
            + Send
            + Sync
            + 'static,
    {
        MockTransport {
            respond: Arc::new(respond),
            refuse_connect: false,
            connects: Arc::new(AtomicUsize::new(0)),
            sends: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A transport whose every connection attempt is refused.
    pub fn refusing() -> MockTransport {
        MockTransport {
            refuse_connect: true,
            ..MockTransport::new(|_, _| Err(SendError::new("unreachable", false)))
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn connect(&self, _dst: &Destination) -> Connecting {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refuse = self.refuse_connect;
        let conn = MockConnection {
            respond: self.respond.clone(),
            sends: self.sends.clone(),
        };
        Box::pin(async move {
            if refuse {
                return Err(Box::<dyn StdError + Send + Sync>::from("connection refused"));
            }
            Ok(Box::new(conn) as Box<dyn Connection>)
        })
    }
}

struct MockConnection {
    respond: Arc<Respond>,
    sends: Arc<AtomicUsize>,
}

impl Connection for MockConnection {
    fn send(&mut self, request: http::Request<Bytes>) -> Sending<'_> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        let result = (self.respond)(n, &request);
        Box::pin(async move {
            let response = result?;
            Ok(response.map(|body| {
                Box::pin(futures_util::stream::iter(vec![Ok(body)])) as BodyStream
            }))
        })
    }

    fn is_open(&self) -> bool {
        true
    }
}

pub fn ok(body: &'static str) -> http::Response<Bytes> {
    http::Response::new(Bytes::from_static(body.as_bytes()))
}

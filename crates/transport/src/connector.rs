//! Ways of opening a framed session to the control plane.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use futures::stream::BoxStream;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::protocol::{self, Inbound, Outbound};
use crate::TransportError;

pub type FrameStream = BoxStream<'static, Result<Inbound, TransportError>>;
pub type FrameSink = Pin<Box<dyn Sink<Outbound, Error = TransportError> + Send>>;

/// One live connection: decoded inbound frames and an outbound frame sink.
pub struct Session {
    pub inbound: FrameStream,
    pub outbound: FrameSink,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Session, TransportError>;
}

/// Newline-delimited JSON over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    max_frame: usize,
}

impl Default for TcpConnector {
    fn default() -> Self { Self { max_frame: 16 * 1024 * 1024 } }
}

impl TcpConnector {
    pub fn new(max_frame: usize) -> Self { Self { max_frame } }
}

fn lines_err(e: LinesCodecError) -> TransportError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => TransportError::Codec("frame exceeds maximum length".into()),
        LinesCodecError::Io(e) => TransportError::Io(e.to_string()),
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Session, TransportError> {
        let addr = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
        let stream = TcpStream::connect(addr).await.map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(self.max_frame));
        let (sink, stream) = framed.split();
        let inbound = stream
            .map(|r| match r {
                Ok(line) => protocol::decode(&line),
                Err(e) => Err(lines_err(e)),
            })
            .boxed();
        let outbound = sink
            .sink_map_err(lines_err)
            .with(|frame: Outbound| futures::future::ready(protocol::encode(&frame)));
        Ok(Session { inbound, outbound: Box::pin(outbound) })
    }
}

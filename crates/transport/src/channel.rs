//! In-process control-plane pairing for tests: the agent side is a
//! [`Connector`], the other side scripts sessions frame by frame.

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::connector::{Connector, Session};
use crate::protocol::{Inbound, Outbound};
use crate::TransportError;

enum Offer {
    Accept(Session),
    Refuse(String),
}

/// In-process connector: each `connect` takes the next session offered by
/// the paired [`ChannelPeer`], waiting until one is offered.
pub struct ChannelConnector {
    offers: Mutex<fmpsc::UnboundedReceiver<Offer>>,
}

/// Control-plane side of a [`ChannelConnector`].
#[derive(Clone)]
pub struct ChannelPeer {
    offers: fmpsc::UnboundedSender<Offer>,
}

/// One accepted in-process connection as seen by the control plane.
pub struct PeerSession {
    to_agent: fmpsc::UnboundedSender<Result<Inbound, TransportError>>,
    from_agent: fmpsc::UnboundedReceiver<Outbound>,
}

impl ChannelConnector {
    pub fn pair() -> (Self, ChannelPeer) {
        let (tx, rx) = fmpsc::unbounded();
        (Self { offers: Mutex::new(rx) }, ChannelPeer { offers: tx })
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Session, TransportError> {
        match self.offers.lock().await.next().await {
            Some(Offer::Accept(s)) => Ok(s),
            Some(Offer::Refuse(reason)) => Err(TransportError::Connect(reason)),
            None => Err(TransportError::Connect("peer gone".into())),
        }
    }
}

impl ChannelPeer {
    /// Queue a session for the next connect attempt.
    pub fn accept(&self) -> PeerSession {
        let (to_agent, inbound) = fmpsc::unbounded();
        let (outbound, from_agent) = fmpsc::unbounded();
        let session = Session {
            inbound: inbound.boxed(),
            outbound: Box::pin(outbound.sink_map_err(|e| TransportError::Io(e.to_string()))),
        };
        let _ = self.offers.unbounded_send(Offer::Accept(session));
        PeerSession { to_agent, from_agent }
    }

    /// Make the next connect attempt fail.
    pub fn refuse(&self, reason: &str) { let _ = self.offers.unbounded_send(Offer::Refuse(reason.to_string())); }
}

impl PeerSession {
    pub fn send(&self, frame: Inbound) -> bool { self.to_agent.unbounded_send(Ok(frame)).is_ok() }

    /// Deliver a frame the agent cannot decode.
    pub fn send_garbage(&self, reason: &str) -> bool {
        self.to_agent.unbounded_send(Err(TransportError::Codec(reason.to_string()))).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Outbound> { self.from_agent.next().await }

    /// Drop the connection from the control-plane side.
    pub fn close(self) {}
}

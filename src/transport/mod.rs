//! Register transaction primitive.
//!
//! A transport executes one read or write at a time against a bus unit or a
//! network peer and reports a terminal outcome later, through
//! [`Transport::poll_completion`]. Transports that can be addressed by a
//! remote controller also hand inbound requests to the caller through
//! [`Transport::serve_inbound`].

pub mod channel;
pub mod modbus;
pub mod sim;

pub use channel::{ChannelTransport, WorkerHandle};
pub use sim::SimulatedDevice;

use crate::config::DeviceRole;
use crate::transaction::{Completion, Endpoint, InboundOp, InboundReply, Request};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport already has a transaction in flight")]
    Busy,
    #[error("transport is not started")]
    NotStarted,
    #[error("operation not available in this role")]
    Unsupported,
    #[error("transport worker is gone")]
    Disconnected,
    #[error("i/o error: {0}")]
    Io(String),
}

pub trait Transport {
    /// Bind the transport to a role: controller transports issue requests,
    /// responder transports only answer them.
    fn start(&mut self, role: DeviceRole) -> Result<(), TransportError>;

    /// Hand one request to the transport. Never blocks; the outcome arrives
    /// through [`Transport::poll_completion`].
    fn submit(&mut self, request: Request) -> Result<(), TransportError>;

    /// Next terminal outcome, in issue order.
    fn poll_completion(&mut self) -> Option<Completion>;

    /// Answer every inbound request waiting on this transport. Returns how many
    /// were served.
    fn serve_inbound(&mut self, handler: &mut dyn FnMut(&InboundOp) -> InboundReply) -> usize;

    /// Begin connecting to a peer. `Ok(true)` means the link is up already.
    fn open(&mut self, _endpoint: &Endpoint) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn close(&mut self) {}
}

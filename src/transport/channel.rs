//! Synchronous transport façade over an async worker task.
//!
//! The control loop owns a [`ChannelTransport`]; a tokio task owns the matching
//! [`WorkerHandle`] and does the actual I/O. Every method on the loop side uses
//! `try_recv`/unbounded sends, so a slow link never stalls a tick.

use super::{Transport, TransportError};
use crate::config::DeviceRole;
use crate::transaction::{Completion, Endpoint, InboundOp, InboundReply, Request, TransactionId};
use heapless::Deque;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const COMPLETION_BACKLOG: usize = 8;

#[derive(Debug)]
pub enum WorkerCommand {
    Submit(Request),
    Open(Endpoint),
    Close,
}

#[derive(Debug)]
pub enum WorkerEvent {
    Completed(Completion),
    Connected(Endpoint),
    ConnectFailed(Endpoint, String),
    Disconnected,
}

/// A request from a remote controller, waiting for the control loop to answer
/// it from the register image.
#[derive(Debug)]
pub struct InboundRequest {
    pub op: InboundOp,
    pub reply: oneshot::Sender<InboundReply>,
}

/// Worker side of a channel transport.
#[derive(Debug)]
pub struct WorkerHandle {
    pub commands: mpsc::UnboundedReceiver<WorkerCommand>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub inbound: mpsc::UnboundedSender<InboundRequest>,
}

impl WorkerHandle {
    pub fn complete(&self, completion: Completion) {
        let _ = self.events.send(WorkerEvent::Completed(completion));
    }

    pub fn notify(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Debug)]
pub struct ChannelTransport {
    name: &'static str,
    role: Option<DeviceRole>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    inbound: mpsc::UnboundedReceiver<InboundRequest>,
    in_flight: Option<TransactionId>,
    completed: Deque<Completion, COMPLETION_BACKLOG>,
    connected: bool,
}

impl ChannelTransport {
    pub fn pair(name: &'static str) -> (Self, WorkerHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Self {
            name,
            role: None,
            commands: command_tx,
            events: event_rx,
            inbound: inbound_rx,
            in_flight: None,
            completed: Deque::new(),
            connected: false,
        };
        let handle = WorkerHandle {
            commands: command_rx,
            events: event_tx,
            inbound: inbound_tx,
        };
        (transport, handle)
    }

    fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                WorkerEvent::Completed(completion) => {
                    if self.in_flight == Some(completion.id()) {
                        self.in_flight = None;
                    }
                    if let Err(dropped) = self.completed.push_back(completion) {
                        warn!("{}: completion backlog full, dropping #{}", self.name, dropped.id());
                    }
                }
                WorkerEvent::Connected(endpoint) => {
                    debug!("{}: connected to {}", self.name, endpoint);
                    self.connected = true;
                }
                WorkerEvent::ConnectFailed(endpoint, reason) => {
                    warn!("{}: connect to {} failed: {}", self.name, endpoint, reason);
                    self.connected = false;
                }
                WorkerEvent::Disconnected => {
                    self.connected = false;
                }
            }
        }
    }
}

impl Transport for ChannelTransport {
    fn start(&mut self, role: DeviceRole) -> Result<(), TransportError> {
        self.role = Some(role);
        Ok(())
    }

    fn submit(&mut self, request: Request) -> Result<(), TransportError> {
        if self.role.is_none() {
            return Err(TransportError::NotStarted);
        }
        self.pump();
        if self.in_flight.is_some() {
            return Err(TransportError::Busy);
        }
        let id = request.id;
        self.commands
            .send(WorkerCommand::Submit(request))
            .map_err(|_| TransportError::Disconnected)?;
        self.in_flight = Some(id);
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<Completion> {
        self.pump();
        self.completed.pop_front()
    }

    fn serve_inbound(&mut self, handler: &mut dyn FnMut(&InboundOp) -> InboundReply) -> usize {
        let mut served = 0;
        while let Ok(request) = self.inbound.try_recv() {
            let reply = handler(&request.op);
            // The remote side may have given up already.
            let _ = request.reply.send(reply);
            served += 1;
        }
        served
    }

    fn open(&mut self, endpoint: &Endpoint) -> Result<bool, TransportError> {
        self.pump();
        if self.connected {
            return Ok(true);
        }
        self.commands
            .send(WorkerCommand::Open(*endpoint))
            .map_err(|_| TransportError::Disconnected)?;
        Ok(false)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        let _ = self.commands.send(WorkerCommand::Close);
        self.connected = false;
    }
}

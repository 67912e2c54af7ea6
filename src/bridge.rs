//! Dual-mode protocol bridge.
//!
//! The bridge owns the register image and both transport bindings. As a
//! controller it issues fire-and-poll transactions toward the inverter on the
//! bus and toward the peer gateway on the network, and mirrors the shared
//! register block between them. As a responder it answers inbound requests on
//! either transport straight from the image.
//!
//! Nothing here blocks: [`ProtocolBridge::task`] moves completions from the
//! transports into a mailbox, and callers pick their outcome up with
//! [`ProtocolBridge::poll`].

use crate::config::{DeviceRole, PersistedConfig, Tunables};
use crate::registers::{ImageError, RegisterImage, MIRROR_COUNT, MIRROR_START};
use crate::transaction::{
    values_from_slice, Completion, Endpoint, InboundException, InboundOp, InboundReply,
    RegisterOp, RegisterValues, Request, Side, Target, TransactionId, TxCode, MAX_TX_REGISTERS,
};
use crate::transport::{Transport, TransportError};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

const MAILBOX_CAPACITY: usize = 8;
const ABANDONED_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub device_unit: u8,
    pub peer: Option<Endpoint>,
    pub reconnect_interval_ms: u64,
    pub step_timeout_ms: u64,
    pub link_health_window_ms: u64,
}

impl TransportConfig {
    pub fn from_config(config: &PersistedConfig, tunables: &Tunables) -> Self {
        Self {
            device_unit: tunables.device_unit,
            peer: config
                .peer_ip()
                .map(|ip| SocketAddr::new(IpAddr::V4(ip), tunables.modbus_tcp_port)),
            reconnect_interval_ms: tunables.reconnect_interval_ms,
            step_timeout_ms: tunables.device_step_timeout_ms,
            link_health_window_ms: tunables.link_health_window_ms,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_config(&PersistedConfig::default(), &Tunables::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge has not been started")]
    NotStarted,
    #[error("operation not allowed in {0} role")]
    RoleMismatch(DeviceRole),
    #[error("{0:?} side already has a transaction in flight")]
    Busy(Side),
    #[error("no connection to the peer")]
    NotConnected,
    #[error("register count must be 1..=16")]
    InvalidRange,
    #[error("unknown transaction #{0}")]
    UnknownTransaction(TransactionId),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BridgeError {
    /// Outcome code a caller should attribute to a call that never got issued.
    pub fn code(&self) -> TxCode {
        match self {
            BridgeError::RoleMismatch(_)
            | BridgeError::InvalidRange
            | BridgeError::Transport(TransportError::Unsupported) => TxCode::NotSupported,
            _ => TxCode::Timeout,
        }
    }
}

/// Rate-limited outbound connection to one endpoint. An attempt is made only
/// once the retry interval has elapsed since the previous attempt; a skipped
/// call leaves the timer alone and a successful connect clears it.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    interval_ms: u64,
    last_attempt_ms: Option<u64>,
    attempts: u32,
    skipped: u32,
}

impl ConnectionManager {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_attempt_ms: None,
            attempts: 0,
            skipped: 0,
        }
    }

    pub fn connect<T: Transport>(&mut self, now_ms: u64, link: &mut T, endpoint: &Endpoint) -> bool {
        if link.is_connected() {
            self.last_attempt_ms = None;
            return true;
        }
        if let Some(last) = self.last_attempt_ms {
            if now_ms.saturating_sub(last) < self.interval_ms {
                self.skipped += 1;
                return false;
            }
        }
        self.last_attempt_ms = Some(now_ms);
        self.attempts += 1;
        info!("connecting to peer {} (attempt {})", endpoint, self.attempts);
        match link.open(endpoint) {
            Ok(true) => {
                info!("connected to peer {}", endpoint);
                self.last_attempt_ms = None;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("connect to {} failed: {}", endpoint, e);
                false
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_attempt_ms = None;
    }

    pub fn last_attempt_ms(&self) -> Option<u64> {
        self.last_attempt_ms
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    pub issued: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub abandoned: u32,
    pub late_completions: u32,
    pub inbound_served: u32,
    pub role_rejections: u32,
    pub mirror_cycles: u32,
    pub mirror_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHealth {
    pub bus: bool,
    pub network: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct SideActivity {
    last_result_ms: Option<u64>,
    last_ok: bool,
    last_served_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum MirrorState {
    #[default]
    Idle,
    ReadBus,
    WaitBus { id: TransactionId, since_ms: u64 },
    WriteNet,
    WaitNet { id: TransactionId, since_ms: u64 },
}

#[derive(Debug, Default)]
struct MirrorCycle {
    state: MirrorState,
    pending: bool,
    values: RegisterValues,
}

pub struct ProtocolBridge<B: Transport, N: Transport> {
    bus: B,
    net: N,
    role: Option<DeviceRole>,
    config: TransportConfig,
    image: RegisterImage,
    connection: ConnectionManager,
    next_id: TransactionId,
    bus_in_flight: Option<TransactionId>,
    net_in_flight: Option<TransactionId>,
    mailbox: Vec<Completion, MAILBOX_CAPACITY>,
    abandoned: Vec<TransactionId, ABANDONED_CAPACITY>,
    bus_activity: SideActivity,
    net_activity: SideActivity,
    mirror: MirrorCycle,
    stats: BridgeStats,
}

impl<B: Transport, N: Transport> ProtocolBridge<B, N> {
    pub fn new(bus: B, net: N) -> Self {
        let config = TransportConfig::default();
        Self {
            bus,
            net,
            role: None,
            connection: ConnectionManager::new(config.reconnect_interval_ms),
            config,
            image: RegisterImage::new(),
            next_id: 1,
            bus_in_flight: None,
            net_in_flight: None,
            mailbox: Vec::new(),
            abandoned: Vec::new(),
            bus_activity: SideActivity::default(),
            net_activity: SideActivity::default(),
            mirror: MirrorCycle::default(),
            stats: BridgeStats::default(),
        }
    }

    /// Start both transports in `role`.
    pub fn begin(&mut self, role: DeviceRole, config: TransportConfig) -> Result<(), BridgeError> {
        self.bus.start(role)?;
        self.net.start(role)?;
        self.connection = ConnectionManager::new(config.reconnect_interval_ms);
        self.config = config;
        self.role = Some(role);
        info!(
            "bridge started as {} (unit {}, peer {})",
            role,
            self.config.device_unit,
            self.config
                .peer
                .map_or_else(|| "none".to_string(), |p| p.to_string())
        );
        Ok(())
    }

    pub fn role(&self) -> Option<DeviceRole> {
        self.role
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn device_target(&self) -> Target {
        Target::Bus {
            unit: self.config.device_unit,
        }
    }

    pub fn peer(&self) -> Option<Endpoint> {
        self.config.peer
    }

    /// Per-tick transport work: collect completions, serve inbound requests and
    /// keep the peer connection up.
    pub fn task(&mut self, now_ms: u64) {
        while let Some(completion) = self.bus.poll_completion() {
            self.settle(Side::Bus, completion, now_ms);
        }
        while let Some(completion) = self.net.poll_completion() {
            self.settle(Side::Network, completion, now_ms);
        }
        self.serve_inbound(now_ms);

        if self.role == Some(DeviceRole::Controller) && self.config.peer.is_some() {
            self.connect(now_ms);
        }
    }

    fn settle(&mut self, side: Side, completion: Completion, now_ms: u64) {
        let id = completion.id();
        let in_flight = match side {
            Side::Bus => &mut self.bus_in_flight,
            Side::Network => &mut self.net_in_flight,
        };
        if *in_flight == Some(id) {
            *in_flight = None;
        }

        let activity = match side {
            Side::Bus => &mut self.bus_activity,
            Side::Network => &mut self.net_activity,
        };
        let ok = completion.outcome.code.is_success();
        activity.last_result_ms = Some(now_ms);
        activity.last_ok = ok;

        if let Some(pos) = self.abandoned.iter().position(|a| *a == id) {
            self.abandoned.remove(pos);
            self.stats.late_completions += 1;
            debug!("late completion #{} ({}) ignored", id, completion.outcome.code);
            return;
        }

        if ok {
            self.stats.succeeded += 1;
            self.image.complete(id, &completion.values);
        } else {
            self.stats.failed += 1;
            self.image.release(id);
            debug!("transaction #{} on {:?} failed: {}", id, side, completion.outcome.code);
        }

        if self.mailbox.is_full() {
            let dropped = self.mailbox.remove(0);
            warn!("mailbox full, dropping unclaimed outcome #{}", dropped.id());
        }
        let _ = self.mailbox.push(completion);
    }

    fn serve_inbound(&mut self, now_ms: u64) {
        let role = self.role;
        let image = &mut self.image;
        let mut handler = |op: &InboundOp| match role {
            Some(DeviceRole::Responder) => image.serve(op),
            _ => InboundReply::Exception(InboundException::IllegalFunction),
        };
        let bus_served = self.bus.serve_inbound(&mut handler);
        let net_served = self.net.serve_inbound(&mut handler);

        if bus_served > 0 {
            self.bus_activity.last_served_ms = Some(now_ms);
        }
        if net_served > 0 {
            self.net_activity.last_served_ms = Some(now_ms);
        }
        self.stats.inbound_served += (bus_served + net_served) as u32;
    }

    fn allocate_id(&mut self) -> TransactionId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    fn issue(&mut self, target: Target, op: RegisterOp) -> Result<TransactionId, BridgeError> {
        let role = self.role.ok_or(BridgeError::NotStarted)?;
        if role != DeviceRole::Controller {
            self.stats.role_rejections += 1;
            warn!("remote {} rejected in {} role", if op.is_write() { "write" } else { "read" }, role);
            return Err(BridgeError::RoleMismatch(role));
        }
        if op.count() == 0 || usize::from(op.count()) > MAX_TX_REGISTERS {
            return Err(BridgeError::InvalidRange);
        }
        let side = target.side();
        let busy = match side {
            Side::Bus => self.bus_in_flight.is_some(),
            Side::Network => self.net_in_flight.is_some(),
        };
        if busy {
            return Err(BridgeError::Busy(side));
        }
        if side == Side::Network && !self.net.is_connected() {
            return Err(BridgeError::NotConnected);
        }

        let id = self.allocate_id();
        self.image.reserve(id, &op)?;
        let request = Request { id, target, op };
        let submitted = match side {
            Side::Bus => self.bus.submit(request),
            Side::Network => self.net.submit(request),
        };
        if let Err(e) = submitted {
            self.image.release(id);
            return Err(e.into());
        }
        match side {
            Side::Bus => self.bus_in_flight = Some(id),
            Side::Network => self.net_in_flight = Some(id),
        }
        self.stats.issued += 1;
        Ok(id)
    }

    pub fn read_remote(&mut self, target: Target, address: u16, count: u16) -> Result<TransactionId, BridgeError> {
        self.issue(target, RegisterOp::Read { address, count })
    }

    pub fn write_remote(&mut self, target: Target, address: u16, values: &[u16]) -> Result<TransactionId, BridgeError> {
        let values = values_from_slice(values).ok_or(BridgeError::InvalidRange)?;
        self.issue(target, RegisterOp::Write { address, values })
    }

    /// Terminal outcome of `id`, once. `WouldBlock` while it is in flight.
    pub fn poll(&mut self, id: TransactionId) -> nb::Result<Completion, BridgeError> {
        if let Some(pos) = self.mailbox.iter().position(|c| c.id() == id) {
            return Ok(self.mailbox.remove(pos));
        }
        if self.bus_in_flight == Some(id) || self.net_in_flight == Some(id) {
            return Err(nb::Error::WouldBlock);
        }
        Err(nb::Error::Other(BridgeError::UnknownTransaction(id)))
    }

    /// Give up on `id`. Its completion, if it ever arrives, is consumed and
    /// never applied to the image.
    pub fn abandon(&mut self, id: TransactionId) {
        if let Some(pos) = self.mailbox.iter().position(|c| c.id() == id) {
            self.mailbox.remove(pos);
            return;
        }
        self.image.release(id);
        let mut tracked = false;
        if self.bus_in_flight == Some(id) {
            self.bus_in_flight = None;
            tracked = true;
        }
        if self.net_in_flight == Some(id) {
            self.net_in_flight = None;
            tracked = true;
        }
        if tracked {
            self.stats.abandoned += 1;
            if self.abandoned.is_full() {
                self.abandoned.remove(0);
            }
            let _ = self.abandoned.push(id);
        }
    }

    pub fn get_local(&self, address: u16) -> Result<u16, ImageError> {
        self.image.get(address)
    }

    pub fn set_local(&mut self, address: u16, value: u16) -> Result<(), ImageError> {
        self.image.set(address, value)
    }

    pub fn image(&self) -> &RegisterImage {
        &self.image
    }

    /// Bring the peer connection up, subject to the retry interval. Only
    /// meaningful for a controller with a configured peer.
    pub fn connect(&mut self, now_ms: u64) -> bool {
        let Some(peer) = self.config.peer else {
            return false;
        };
        if self.role != Some(DeviceRole::Controller) {
            return false;
        }
        self.connection.connect(now_ms, &mut self.net, &peer)
    }

    pub fn disconnect(&mut self) {
        if self.net.is_connected() {
            info!("disconnecting from peer");
        }
        self.net.close();
    }

    pub fn is_connected(&self) -> bool {
        self.net.is_connected()
    }

    /// Replace the peer endpoint; the current connection is dropped and the
    /// next connect goes to the new address.
    pub fn set_peer(&mut self, peer: Option<Endpoint>) {
        if self.config.peer == peer {
            return;
        }
        self.disconnect();
        self.connection.reset();
        self.config.peer = peer;
        info!("peer set to {:?}", peer);
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn link_health(&self, now_ms: u64) -> LinkHealth {
        let window = self.config.link_health_window_ms;
        let recent = |at: Option<u64>| at.is_some_and(|t| now_ms.saturating_sub(t) <= window);
        match self.role {
            Some(DeviceRole::Controller) => LinkHealth {
                bus: self.bus_activity.last_ok && recent(self.bus_activity.last_result_ms),
                network: self.net.is_connected(),
            },
            Some(DeviceRole::Responder) => LinkHealth {
                bus: recent(self.bus_activity.last_served_ms),
                network: recent(self.net_activity.last_served_ms),
            },
            None => LinkHealth {
                bus: false,
                network: false,
            },
        }
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn trigger_mirror(&mut self) {
        if self.role == Some(DeviceRole::Controller) && self.config.peer.is_some() {
            self.mirror.pending = true;
        }
    }

    pub fn mirror_wants_bus(&self) -> bool {
        self.mirror.pending || self.mirror.state != MirrorState::Idle
    }

    /// Advance the mirror cycle by one step: read the shared block from the
    /// device, then push it to the peer. Returns true while the cycle holds
    /// the bus or the network link.
    pub fn step_mirror(&mut self, now_ms: u64) -> bool {
        let timeout = self.config.step_timeout_ms;
        match self.mirror.state {
            MirrorState::Idle => {
                if !self.mirror.pending {
                    return false;
                }
                self.mirror.pending = false;
                self.mirror.state = MirrorState::ReadBus;
            }
            MirrorState::ReadBus => {
                let target = self.device_target();
                match self.read_remote(target, MIRROR_START, MIRROR_COUNT) {
                    Ok(id) => self.mirror.state = MirrorState::WaitBus { id, since_ms: now_ms },
                    Err(e) => self.mirror_failed("bus read", &e.to_string()),
                }
            }
            MirrorState::WaitBus { id, since_ms } => match self.poll(id) {
                Ok(c) if c.outcome.code.is_success() => {
                    self.mirror.values = c.values;
                    self.mirror.state = MirrorState::WriteNet;
                }
                Ok(c) => self.mirror_failed("bus read", &c.outcome.code.to_string()),
                Err(nb::Error::Other(e)) => self.mirror_failed("bus read", &e.to_string()),
                Err(nb::Error::WouldBlock) if now_ms.saturating_sub(since_ms) > timeout => {
                    self.abandon(id);
                    self.mirror_failed("bus read", "step timeout");
                }
                Err(nb::Error::WouldBlock) => {}
            },
            MirrorState::WriteNet => {
                let Some(peer) = self.config.peer else {
                    self.mirror.state = MirrorState::Idle;
                    return false;
                };
                let values = self.mirror.values.clone();
                match self.write_remote(Target::Network(peer), MIRROR_START, &values) {
                    Ok(id) => self.mirror.state = MirrorState::WaitNet { id, since_ms: now_ms },
                    Err(e) => self.mirror_failed("peer write", &e.to_string()),
                }
            }
            MirrorState::WaitNet { id, since_ms } => match self.poll(id) {
                Ok(c) if c.outcome.code.is_success() => {
                    self.stats.mirror_cycles += 1;
                    self.mirror.state = MirrorState::Idle;
                }
                Ok(c) => self.mirror_failed("peer write", &c.outcome.code.to_string()),
                Err(nb::Error::Other(e)) => self.mirror_failed("peer write", &e.to_string()),
                Err(nb::Error::WouldBlock) if now_ms.saturating_sub(since_ms) > timeout => {
                    self.abandon(id);
                    self.mirror_failed("peer write", "step timeout");
                }
                Err(nb::Error::WouldBlock) => {}
            },
        }
        self.mirror.state != MirrorState::Idle
    }

    fn mirror_failed(&mut self, step: &str, reason: &str) {
        self.stats.mirror_failures += 1;
        debug!("mirror {} failed: {}", step, reason);
        self.mirror.state = MirrorState::Idle;
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn net_mut(&mut self) -> &mut N {
        &mut self.net
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_codes() {
        assert_eq!(BridgeError::RoleMismatch(DeviceRole::Responder).code(), TxCode::NotSupported);
        assert_eq!(BridgeError::NotConnected.code(), TxCode::Timeout);
        assert_eq!(BridgeError::Busy(Side::Bus).code(), TxCode::Timeout);
    }

    #[test]
    fn test_transport_config_resolves_peer() {
        let config = TransportConfig::default();
        assert_eq!(config.peer, Some("172.168.99.100:502".parse().unwrap()));
        assert_eq!(config.reconnect_interval_ms, 5000);
    }
}

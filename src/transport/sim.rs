//! In-process inverter model.
//!
//! Answers register transactions from its own register map one poll after
//! they are submitted, and can be scripted to misbehave: fail the next N
//! transactions with a given code, swallow requests so the caller's step
//! timeout fires, ignore writes to a register, or refuse network connections.

use super::{Transport, TransportError};
use crate::config::DeviceRole;
use crate::registers::{HR_ACT_PWR_LIM_VL, HR_ACT_PWR_OUT, HR_SYS_TIME, MIRROR_START};
use crate::transaction::{
    u32_to_words, words_to_u32, Completion, Endpoint, InboundOp, InboundReply, RegisterOp,
    RegisterValues, Request, Side, TxCode,
};
use heapless::{Deque, LinearMap, Vec};
use serde::{Deserialize, Serialize};
use tracing::trace;

const DEVICE_REGISTERS: usize = 32;
const INBOUND_BACKLOG: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Misbehaviour {
    Fail(TxCode),
    Swallow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStats {
    pub reads: u32,
    pub writes: u32,
    pub failed: u32,
    pub swallowed: u32,
    pub open_attempts: u32,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    name: &'static str,
    role: Option<DeviceRole>,
    registers: LinearMap<u16, u16, DEVICE_REGISTERS>,
    pending: Option<(Request, u32)>,
    ready: Option<Completion>,
    latency_polls: u32,
    misbehaviour: Option<(Misbehaviour, u32)>,
    read_only: Vec<u16, 4>,
    reachable: bool,
    connected: bool,
    inbound: Deque<InboundOp, INBOUND_BACKLOG>,
    replies: Vec<InboundReply, INBOUND_BACKLOG>,
    stats: SimulationStats,
    writes_by_address: LinearMap<u16, u32, DEVICE_REGISTERS>,
}

impl SimulatedDevice {
    /// Inverter with the gateway's register set, all zero.
    pub fn new(name: &'static str) -> Self {
        let mut device = Self {
            name,
            role: None,
            registers: LinearMap::new(),
            pending: None,
            ready: None,
            latency_polls: 0,
            misbehaviour: None,
            read_only: Vec::new(),
            reachable: true,
            connected: false,
            inbound: Deque::new(),
            replies: Vec::new(),
            stats: SimulationStats::default(),
            writes_by_address: LinearMap::new(),
        };
        for address in [MIRROR_START, HR_SYS_TIME, HR_SYS_TIME + 1, HR_ACT_PWR_LIM_VL, HR_ACT_PWR_OUT, HR_ACT_PWR_OUT + 1] {
            let _ = device.registers.insert(address, 0);
        }
        device
    }

    /// A device that answers like the inverter in the field: time set, limit
    /// unrestricted, some output.
    pub fn inverter(name: &'static str, epoch: u32) -> Self {
        let mut device = Self::new(name);
        device.set_u32(HR_SYS_TIME, epoch);
        device.set_register(HR_ACT_PWR_LIM_VL, 750);
        device.set_u32(HR_ACT_PWR_OUT, 42_500);
        device
    }

    pub fn set_register(&mut self, address: u16, value: u16) {
        let _ = self.registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.registers.get(&address).copied()
    }

    pub fn set_u32(&mut self, address: u16, value: u32) {
        let [hi, lo] = u32_to_words(value);
        self.set_register(address, hi);
        self.set_register(address.wrapping_add(1), lo);
    }

    pub fn u32_at(&self, address: u16) -> Option<u32> {
        Some(words_to_u32(
            self.register(address)?,
            self.register(address.wrapping_add(1))?,
        ))
    }

    /// Fail the next `count` transactions with `code`.
    pub fn fail_next(&mut self, count: u32, code: TxCode) {
        self.misbehaviour = Some((Misbehaviour::Fail(code), count));
    }

    /// Accept the next `count` transactions and never answer them.
    pub fn swallow_next(&mut self, count: u32) {
        self.misbehaviour = Some((Misbehaviour::Swallow, count));
    }

    /// Hold every completion for `polls` extra polls.
    pub fn set_latency(&mut self, polls: u32) {
        self.latency_polls = polls;
    }

    /// Writes to `address` report success but leave the value unchanged.
    pub fn ignore_writes_to(&mut self, address: u16) {
        let _ = self.read_only.push(address);
    }

    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
        if !reachable {
            self.connected = false;
        }
    }

    pub fn inject_inbound(&mut self, op: InboundOp) -> bool {
        self.inbound.push_back(op).is_ok()
    }

    pub fn take_replies(&mut self) -> Vec<InboundReply, INBOUND_BACKLOG> {
        core::mem::take(&mut self.replies)
    }

    pub fn stats(&self) -> SimulationStats {
        self.stats
    }

    pub fn writes_to(&self, address: u16) -> u32 {
        self.writes_by_address.get(&address).copied().unwrap_or(0)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some() || self.ready.is_some()
    }

    fn next_misbehaviour(&mut self) -> Option<Misbehaviour> {
        let (kind, remaining) = self.misbehaviour.as_mut()?;
        let kind = *kind;
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.misbehaviour = None;
        }
        Some(kind)
    }

    fn execute(&mut self, request: &Request) -> Completion {
        if request.target.side() == Side::Network && !self.connected {
            return Completion::failed(request.id, TxCode::Timeout);
        }
        match &request.op {
            RegisterOp::Read { address, count } => {
                self.stats.reads += 1;
                let mut values = RegisterValues::new();
                for offset in 0..*count {
                    let value = address
                        .checked_add(offset)
                        .and_then(|a| self.registers.get(&a).copied());
                    match value {
                        Some(v) if values.push(v).is_ok() => {}
                        _ => return Completion::failed(request.id, TxCode::RemoteError),
                    }
                }
                Completion::success(request.id, values)
            }
            RegisterOp::Write { address, values } => {
                self.stats.writes += 1;
                let mapped = (0..values.len() as u16).all(|offset| {
                    address
                        .checked_add(offset)
                        .is_some_and(|a| self.registers.contains_key(&a))
                });
                if !mapped {
                    return Completion::failed(request.id, TxCode::RemoteError);
                }
                for (offset, value) in values.iter().enumerate() {
                    let target = address.wrapping_add(offset as u16);
                    let count = self.writes_by_address.get(&target).copied().unwrap_or(0);
                    let _ = self.writes_by_address.insert(target, count + 1);
                    if !self.read_only.contains(&target) {
                        let _ = self.registers.insert(target, *value);
                    }
                }
                Completion::success(request.id, RegisterValues::new())
            }
        }
    }
}

impl Transport for SimulatedDevice {
    fn start(&mut self, role: DeviceRole) -> Result<(), TransportError> {
        self.role = Some(role);
        Ok(())
    }

    fn submit(&mut self, request: Request) -> Result<(), TransportError> {
        if self.role.is_none() {
            return Err(TransportError::NotStarted);
        }
        if self.has_pending() {
            return Err(TransportError::Busy);
        }
        trace!("{}: submit #{} {:?}", self.name, request.id, request.op);
        match self.next_misbehaviour() {
            Some(Misbehaviour::Swallow) => {
                self.stats.swallowed += 1;
            }
            Some(Misbehaviour::Fail(code)) => {
                self.stats.failed += 1;
                self.ready = Some(Completion::failed(request.id, code));
            }
            None => {
                self.pending = Some((request, self.latency_polls));
            }
        }
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<Completion> {
        if let Some(completion) = self.ready.take() {
            return Some(completion);
        }
        let (request, wait) = self.pending.as_mut()?;
        if *wait > 0 {
            *wait -= 1;
            return None;
        }
        let request = request.clone();
        self.pending = None;
        Some(self.execute(&request))
    }

    fn serve_inbound(&mut self, handler: &mut dyn FnMut(&InboundOp) -> InboundReply) -> usize {
        let mut served = 0;
        while let Some(op) = self.inbound.pop_front() {
            let reply = handler(&op);
            let _ = self.replies.push(reply);
            served += 1;
        }
        served
    }

    fn open(&mut self, endpoint: &Endpoint) -> Result<bool, TransportError> {
        self.stats.open_attempts += 1;
        trace!("{}: open {} (reachable: {})", self.name, endpoint, self.reachable);
        self.connected = self.reachable;
        Ok(self.connected)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Target;

    fn read(id: u16, address: u16, count: u16) -> Request {
        Request {
            id,
            target: Target::Bus { unit: 1 },
            op: RegisterOp::Read { address, count },
        }
    }

    #[test]
    fn test_completes_one_poll_later() {
        let mut device = SimulatedDevice::inverter("inv", 1_700_000_000);
        device.start(DeviceRole::Controller).unwrap();
        device.submit(read(1, HR_SYS_TIME, 2)).unwrap();
        assert_eq!(device.submit(read(2, HR_SYS_TIME, 2)), Err(TransportError::Busy));

        let completion = device.poll_completion().unwrap();
        assert!(completion.outcome.code.is_success());
        assert_eq!(words_to_u32(completion.values[0], completion.values[1]), 1_700_000_000);
        assert!(device.poll_completion().is_none());
    }

    #[test]
    fn test_scripted_failures_run_out() {
        let mut device = SimulatedDevice::new("inv");
        device.start(DeviceRole::Controller).unwrap();
        device.fail_next(1, TxCode::RemoteError);

        device.submit(read(1, MIRROR_START, 1)).unwrap();
        assert_eq!(device.poll_completion().unwrap().outcome.code, TxCode::RemoteError);
        device.submit(read(2, MIRROR_START, 1)).unwrap();
        assert_eq!(device.poll_completion().unwrap().outcome.code, TxCode::Success);
    }

    #[test]
    fn test_unmapped_register_is_remote_error() {
        let mut device = SimulatedDevice::new("inv");
        device.start(DeviceRole::Controller).unwrap();
        device.submit(read(1, 0x4000, 1)).unwrap();
        assert_eq!(device.poll_completion().unwrap().outcome.code, TxCode::RemoteError);
    }
}

//! Register transaction vocabulary shared by the bridge, the transports and
//! every state machine that talks to the inverter.
//!
//! A transaction is one read or one write of a contiguous holding-register
//! range. It is issued once, then polled until it reaches a terminal
//! [`TxCode`]. Nothing here blocks.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Largest register count carried by one transaction.
pub const MAX_TX_REGISTERS: usize = 16;

pub type RegisterValues = Vec<u16, MAX_TX_REGISTERS>;
pub type TransactionId = u16;
pub type Endpoint = SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxCode {
    Success,
    Timeout,
    RemoteError,
    NotSupported,
}

impl TxCode {
    pub fn is_success(self) -> bool {
        matches!(self, TxCode::Success)
    }
}

impl core::fmt::Display for TxCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TxCode::Success => write!(f, "success"),
            TxCode::Timeout => write!(f, "timeout"),
            TxCode::RemoteError => write!(f, "remote error"),
            TxCode::NotSupported => write!(f, "not supported"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub code: TxCode,
    pub id: TransactionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bus,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Device on the serial bus, addressed by unit id.
    Bus { unit: u8 },
    /// Peer gateway reached over TCP.
    Network(Endpoint),
}

impl Target {
    pub fn side(&self) -> Side {
        match self {
            Target::Bus { .. } => Side::Bus,
            Target::Network(_) => Side::Network,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOp {
    Read { address: u16, count: u16 },
    Write { address: u16, values: RegisterValues },
}

impl RegisterOp {
    pub fn address(&self) -> u16 {
        match self {
            RegisterOp::Read { address, .. } | RegisterOp::Write { address, .. } => *address,
        }
    }

    pub fn count(&self) -> u16 {
        match self {
            RegisterOp::Read { count, .. } => *count,
            RegisterOp::Write { values, .. } => values.len() as u16,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, RegisterOp::Write { .. })
    }
}

/// One transaction as handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: TransactionId,
    pub target: Target,
    pub op: RegisterOp,
}

/// Terminal result of a transaction. `values` holds the registers read on a
/// successful read and is empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub outcome: TransactionOutcome,
    pub values: RegisterValues,
}

impl Completion {
    pub fn success(id: TransactionId, values: RegisterValues) -> Self {
        Self {
            outcome: TransactionOutcome { code: TxCode::Success, id },
            values,
        }
    }

    pub fn failed(id: TransactionId, code: TxCode) -> Self {
        Self {
            outcome: TransactionOutcome { code, id },
            values: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.outcome.id
    }
}

/// Request served from the register image on behalf of a remote controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOp {
    Read { address: u16, count: u16 },
    Write { address: u16, values: RegisterValues },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundReply {
    Registers(RegisterValues),
    Written { address: u16, count: u16 },
    Exception(InboundException),
}

/// Copy a slice into fixed-capacity register storage. Returns `None` when the
/// slice does not fit in one transaction.
pub fn values_from_slice(values: &[u16]) -> Option<RegisterValues> {
    Vec::from_slice(values).ok()
}

/// Two holding registers, high word first.
pub fn words_to_u32(hi: u16, lo: u16) -> u32 {
    (u32::from(hi) << 16) | u32::from(lo)
}

pub fn u32_to_words(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, (value & 0xFFFF) as u16]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_order_is_high_first() {
        assert_eq!(words_to_u32(0x0001, 0x0002), 0x0001_0002);
        assert_eq!(u32_to_words(946_684_800), [0x386D, 0x4380]);
        let [hi, lo] = u32_to_words(3_124_223_999);
        assert_eq!(words_to_u32(hi, lo), 3_124_223_999);
    }

    #[test]
    fn test_values_from_slice_rejects_oversized() {
        assert!(values_from_slice(&[0; MAX_TX_REGISTERS]).is_some());
        assert!(values_from_slice(&[0; MAX_TX_REGISTERS + 1]).is_none());
    }
}

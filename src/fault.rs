use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};

const MAX_FAULT_HISTORY: usize = 64;
const DETAIL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    TransportTimeout,
    TransportRemoteError,
    /// An operation the current role does not allow.
    RoleMismatch,
    /// Time candidate outside the device's accepted range.
    RangeRejected,
    VerifyMismatch,
    PersistenceUnavailable,
}

impl core::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            FaultKind::TransportTimeout => "transport timeout",
            FaultKind::TransportRemoteError => "transport remote error",
            FaultKind::RoleMismatch => "role mismatch",
            FaultKind::RangeRejected => "range rejected",
            FaultKind::VerifyMismatch => "verification mismatch",
            FaultKind::PersistenceUnavailable => "persistence unavailable",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: u32,
    pub kind: FaultKind,
    pub timestamp_ms: u64,
    pub detail: ArrayString<DETAIL_CAPACITY>,
}

/// Bounded fault history; the oldest record is evicted when full.
#[derive(Debug)]
pub struct FaultLog {
    history: Vec<FaultRecord, MAX_FAULT_HISTORY>,
    next_fault_id: u32,
}

impl FaultLog {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            next_fault_id: 1,
        }
    }

    pub fn record(&mut self, kind: FaultKind, timestamp_ms: u64, detail: &str) -> u32 {
        let id = self.next_fault_id;
        self.next_fault_id = self.next_fault_id.wrapping_add(1);

        let mut text = ArrayString::new();
        for c in detail.chars() {
            if text.try_push(c).is_err() {
                break;
            }
        }

        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(FaultRecord {
            id,
            kind,
            timestamp_ms,
            detail: text,
        });
        id
    }

    pub fn history(&self) -> &[FaultRecord] {
        &self.history
    }

    pub fn last(&self) -> Option<&FaultRecord> {
        self.history.last()
    }

    pub fn count_of(&self, kind: FaultKind) -> usize {
        self.history.iter().filter(|r| r.kind == kind).count()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}

//! Cooperative state machines that drive the inverter through the bridge.
//!
//! Each service is an explicit state enum plus the fields of the cycle in
//! flight, advanced by one `step` per control-loop tick. A service that is
//! waiting on a transaction polls it; a step that outlives its timeout abandons
//! the transaction and fails the same way an explicit error would.

pub mod power_monitor;
pub mod program;
pub mod timesync;

pub use power_monitor::PowerMonitor;
pub use program::ProgramEvaluator;
pub use timesync::TimeReconciler;

use crate::bridge::{BridgeError, ProtocolBridge};
use crate::fault::FaultKind;
use crate::transaction::{Completion, TransactionId, TxCode};
use crate::transport::Transport;

/// State of a transaction a service is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Awaited {
    Pending,
    Succeeded(Completion),
    Failed(TxCode),
}

/// Poll `id`, failing it with [`TxCode::Timeout`] once `timeout_ms` has passed
/// since `entered_ms`.
pub fn await_transaction<B: Transport, N: Transport>(
    bridge: &mut ProtocolBridge<B, N>,
    id: TransactionId,
    entered_ms: u64,
    now_ms: u64,
    timeout_ms: u64,
) -> Awaited {
    match bridge.poll(id) {
        Ok(completion) if completion.outcome.code.is_success() => Awaited::Succeeded(completion),
        Ok(completion) => Awaited::Failed(completion.outcome.code),
        Err(nb::Error::Other(e)) => Awaited::Failed(e.code()),
        Err(nb::Error::WouldBlock) => {
            if now_ms.saturating_sub(entered_ms) >= timeout_ms {
                bridge.abandon(id);
                Awaited::Failed(TxCode::Timeout)
            } else {
                Awaited::Pending
            }
        }
    }
}

/// Fault category of a failed transaction.
pub fn fault_for(code: TxCode) -> FaultKind {
    match code {
        TxCode::RemoteError | TxCode::NotSupported => FaultKind::TransportRemoteError,
        TxCode::Timeout | TxCode::Success => FaultKind::TransportTimeout,
    }
}

/// Fault category of a transaction the bridge refused to issue.
pub fn fault_for_refusal(error: &BridgeError) -> FaultKind {
    match error {
        BridgeError::RoleMismatch(_) => FaultKind::RoleMismatch,
        other => fault_for(other.code()),
    }
}

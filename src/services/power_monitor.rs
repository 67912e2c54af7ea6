use super::{await_transaction, Awaited};
use crate::bridge::ProtocolBridge;
use crate::registers::HR_ACT_PWR_OUT;
use crate::telemetry::{PowerReading, StatusSink};
use crate::transaction::{words_to_u32, TransactionId};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Idle,
    RequestRead,
    WaitRead,
    Publish,
    Done,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PowerMonitorStats {
    pub polls: u32,
    pub stale: u32,
}

/// Periodic read of the inverter's active power output.
#[derive(Debug)]
pub struct PowerMonitor {
    state: PowerState,
    step_timeout_ms: u64,
    entered_ms: u64,
    trigger_pending: bool,
    tx: Option<TransactionId>,
    raw: Option<u32>,
    stats: PowerMonitorStats,
}

impl PowerMonitor {
    pub fn new(step_timeout_ms: u64) -> Self {
        Self {
            state: PowerState::Idle,
            step_timeout_ms,
            entered_ms: 0,
            trigger_pending: false,
            tx: None,
            raw: None,
            stats: PowerMonitorStats::default(),
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn stats(&self) -> PowerMonitorStats {
        self.stats
    }

    pub fn trigger(&mut self) {
        self.trigger_pending = true;
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.state, PowerState::Idle | PowerState::Done)
    }

    pub fn wants_bus(&self) -> bool {
        self.trigger_pending || self.is_busy()
    }

    fn enter(&mut self, state: PowerState, now_ms: u64) {
        self.state = state;
        self.entered_ms = now_ms;
    }

    pub fn step<B, N, K>(&mut self, now_ms: u64, bridge: &mut ProtocolBridge<B, N>, sink: &mut K) -> bool
    where
        B: Transport,
        N: Transport,
        K: StatusSink + ?Sized,
    {
        match self.state {
            PowerState::Idle | PowerState::Done => {
                if !self.trigger_pending {
                    self.state = PowerState::Idle;
                    return false;
                }
                self.trigger_pending = false;
                self.raw = None;
                self.stats.polls += 1;
                self.enter(PowerState::RequestRead, now_ms);
            }
            PowerState::RequestRead => {
                let target = bridge.device_target();
                match bridge.read_remote(target, HR_ACT_PWR_OUT, 2) {
                    Ok(id) => {
                        self.tx = Some(id);
                        self.enter(PowerState::WaitRead, now_ms);
                    }
                    Err(e) => {
                        debug!("power read not issued: {}", e);
                        self.enter(PowerState::Publish, now_ms);
                    }
                }
            }
            PowerState::WaitRead => {
                let Some(id) = self.tx else {
                    self.enter(PowerState::Publish, now_ms);
                    return true;
                };
                match await_transaction(bridge, id, self.entered_ms, now_ms, self.step_timeout_ms) {
                    Awaited::Pending => {}
                    Awaited::Succeeded(completion) => {
                        self.tx = None;
                        if let [hi, lo, ..] = completion.values.as_slice() {
                            self.raw = Some(words_to_u32(*hi, *lo));
                        }
                        self.enter(PowerState::Publish, now_ms);
                    }
                    Awaited::Failed(code) => {
                        self.tx = None;
                        debug!("power read failed: {}", code);
                        self.enter(PowerState::Publish, now_ms);
                    }
                }
            }
            PowerState::Publish => {
                let reading = match self.raw {
                    Some(raw) => PowerReading::from_raw(raw, now_ms),
                    None => {
                        self.stats.stale += 1;
                        PowerReading::stale(now_ms)
                    }
                };
                sink.publish_power(reading);
                self.enter(PowerState::Done, now_ms);
            }
        }
        self.is_busy()
    }
}

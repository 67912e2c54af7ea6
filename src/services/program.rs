//! Calendar power-limit enforcement.
//!
//! Once per minute boundary the evaluator selects the program in force,
//! reads the inverter's active power limit and writes the desired value only
//! when it differs. Every write is followed by a verification read. Failed
//! steps restart the read-modify-write from the read, up to the retry budget.

use super::{await_transaction, fault_for, fault_for_refusal, Awaited};
use crate::bridge::ProtocolBridge;
use crate::calendar::{desired_register, Calendar, ScheduleEvaluation};
use crate::config::Tunables;
use crate::fault::FaultKind;
use crate::registers::HR_ACT_PWR_LIM_VL;
use crate::telemetry::{StatusEvent, StatusSink};
use crate::transaction::TransactionId;
use crate::transport::Transport;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramState {
    Idle,
    EvaluatePrograms,
    RequestRead,
    WaitRead,
    RequestWrite,
    WaitWrite,
    VerifyRead,
    WaitVerify,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSettings {
    pub step_timeout_ms: u64,
    pub retries: u8,
    pub rated_power_w: u32,
}

impl ProgramSettings {
    pub fn from_tunables(tunables: &Tunables) -> Self {
        Self {
            step_timeout_ms: tunables.device_step_timeout_ms,
            retries: tunables.program_retries,
            rated_power_w: tunables.rated_power_w,
        }
    }
}

impl Default for ProgramSettings {
    fn default() -> Self {
        Self::from_tunables(&Tunables::default())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramStatus {
    pub active: Option<ScheduleEvaluation>,
    pub desired: Option<u16>,
    pub last_read: Option<u16>,
    pub evaluations: u32,
    pub reads: u32,
    pub writes: u32,
    pub failures: u32,
}

#[derive(Debug)]
pub struct ProgramEvaluator {
    state: ProgramState,
    calendar: Calendar<'static>,
    settings: ProgramSettings,
    entered_ms: u64,
    trigger_pending: bool,
    last_minute: Option<i64>,
    desired: u16,
    program_id: u8,
    attempt: u8,
    tx: Option<TransactionId>,
    status: ProgramStatus,
}

impl ProgramEvaluator {
    pub fn new(calendar: Calendar<'static>, settings: ProgramSettings) -> Self {
        Self {
            state: ProgramState::Idle,
            calendar,
            settings,
            entered_ms: 0,
            trigger_pending: false,
            last_minute: None,
            desired: 0,
            program_id: 0,
            attempt: 0,
            tx: None,
            status: ProgramStatus::default(),
        }
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn status(&self) -> &ProgramStatus {
        &self.status
    }

    pub fn calendar(&self) -> &Calendar<'static> {
        &self.calendar
    }

    pub fn trigger(&mut self) {
        self.trigger_pending = true;
    }

    /// Arm an evaluation when the wall-clock minute differs from the one seen
    /// last time. Returns true when it did.
    pub fn check_minute(&mut self, wall: &NaiveDateTime) -> bool {
        let minute = wall.and_utc().timestamp().div_euclid(60);
        if self.last_minute == Some(minute) {
            return false;
        }
        self.last_minute = Some(minute);
        self.trigger();
        true
    }

    pub fn is_busy(&self) -> bool {
        !matches!(
            self.state,
            ProgramState::Idle | ProgramState::Done | ProgramState::Error
        )
    }

    pub fn wants_bus(&self) -> bool {
        self.trigger_pending || self.is_busy()
    }

    fn enter(&mut self, state: ProgramState, now_ms: u64) {
        debug!("program {:?} -> {:?}", self.state, state);
        self.state = state;
        self.entered_ms = now_ms;
    }

    /// Advance one step. `wall` is the local wall time the calendar is
    /// evaluated against. Returns true while a cycle is in progress.
    pub fn step<B, N, K>(
        &mut self,
        now_ms: u64,
        wall: &NaiveDateTime,
        bridge: &mut ProtocolBridge<B, N>,
        sink: &mut K,
    ) -> bool
    where
        B: Transport,
        N: Transport,
        K: StatusSink + ?Sized,
    {
        match self.state {
            ProgramState::Idle | ProgramState::Done | ProgramState::Error => {
                if !self.trigger_pending {
                    self.state = ProgramState::Idle;
                    return false;
                }
                self.trigger_pending = false;
                self.attempt = 0;
                self.enter(ProgramState::EvaluatePrograms, now_ms);
            }

            ProgramState::EvaluatePrograms => {
                let evaluation = self.calendar.select(wall);
                self.program_id = evaluation.program.id;
                self.desired = desired_register(evaluation.program.power_w, self.settings.rated_power_w);
                if !evaluation.matched {
                    debug!("no program matches {}, applying zero-power default", wall);
                }
                self.status.evaluations += 1;
                self.status.active = Some(evaluation);
                self.status.desired = Some(self.desired);
                self.enter(ProgramState::RequestRead, now_ms);
            }

            ProgramState::RequestRead | ProgramState::VerifyRead => {
                let next = if self.state == ProgramState::RequestRead {
                    ProgramState::WaitRead
                } else {
                    ProgramState::WaitVerify
                };
                let target = bridge.device_target();
                match bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 1) {
                    Ok(id) => {
                        self.tx = Some(id);
                        self.status.reads += 1;
                        self.enter(next, now_ms);
                    }
                    Err(e) => self.failed(now_ms, sink, fault_for_refusal(&e), &e.to_string()),
                }
            }

            ProgramState::RequestWrite => {
                let target = bridge.device_target();
                match bridge.write_remote(target, HR_ACT_PWR_LIM_VL, &[self.desired]) {
                    Ok(id) => {
                        self.tx = Some(id);
                        self.status.writes += 1;
                        self.enter(ProgramState::WaitWrite, now_ms);
                    }
                    Err(e) => self.failed(now_ms, sink, fault_for_refusal(&e), &e.to_string()),
                }
            }

            ProgramState::WaitRead | ProgramState::WaitWrite | ProgramState::WaitVerify => {
                let Some(id) = self.tx else {
                    self.enter(ProgramState::RequestRead, now_ms);
                    return true;
                };
                match await_transaction(bridge, id, self.entered_ms, now_ms, self.settings.step_timeout_ms) {
                    Awaited::Pending => {}
                    Awaited::Failed(code) => {
                        self.tx = None;
                        self.failed(now_ms, sink, fault_for(code), &format!("{:?}: {}", self.state, code));
                    }
                    Awaited::Succeeded(completion) => {
                        self.tx = None;
                        let value = completion.values.first().copied();
                        self.settle(now_ms, sink, value);
                    }
                }
            }
        }
        self.is_busy()
    }

    fn settle<K: StatusSink + ?Sized>(&mut self, now_ms: u64, sink: &mut K, value: Option<u16>) {
        match self.state {
            ProgramState::WaitWrite => self.enter(ProgramState::VerifyRead, now_ms),
            ProgramState::WaitRead => {
                let Some(current) = value else {
                    self.failed(now_ms, sink, FaultKind::TransportRemoteError, "empty read");
                    return;
                };
                self.status.last_read = Some(current);
                if current == self.desired {
                    debug!("power limit already {} (program {:#04x})", current, self.program_id);
                    self.applied(now_ms, sink, false);
                } else {
                    info!(
                        "program {:#04x}: power limit {} -> {}",
                        self.program_id, current, self.desired
                    );
                    self.enter(ProgramState::RequestWrite, now_ms);
                }
            }
            ProgramState::WaitVerify => {
                self.status.last_read = value;
                if value == Some(self.desired) {
                    self.applied(now_ms, sink, true);
                } else {
                    let detail = format!("power limit reads {:?} after writing {}", value, self.desired);
                    self.failed(now_ms, sink, FaultKind::VerifyMismatch, &detail);
                }
            }
            _ => {}
        }
    }

    fn applied<K: StatusSink + ?Sized>(&mut self, now_ms: u64, sink: &mut K, written: bool) {
        sink.report(
            now_ms,
            StatusEvent::ProgramApplied {
                program_id: self.program_id,
                value: self.desired,
                written,
            },
        );
        self.enter(ProgramState::Done, now_ms);
    }

    fn failed<K: StatusSink + ?Sized>(&mut self, now_ms: u64, sink: &mut K, kind: FaultKind, detail: &str) {
        sink.fault(now_ms, kind, detail);
        if kind != FaultKind::RoleMismatch && self.attempt < self.settings.retries {
            self.attempt += 1;
            debug!("program step failed ({}), retry {}", detail, self.attempt);
            self.enter(ProgramState::RequestRead, now_ms);
            return;
        }
        warn!("program {:#04x} not applied: {}", self.program_id, detail);
        self.status.failures += 1;
        sink.report(
            now_ms,
            StatusEvent::ProgramFailed {
                program_id: self.program_id,
                reason: detail.to_string(),
            },
        );
        self.enter(ProgramState::Error, now_ms);
    }
}

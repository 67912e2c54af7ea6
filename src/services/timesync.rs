//! Time reconciliation.
//!
//! One cycle resolves the wall-clock time from the network time source,
//! retrying it a configured number of times before falling back to the
//! inverter's own clock register. A candidate is committed to the local clock
//! only when it lies inside the device's accepted epoch range, and the commit
//! is then verified by asking the same source again. A failed verification is
//! reported and the committed time stays as it is.

use super::{await_transaction, fault_for, fault_for_refusal, Awaited};
use crate::bridge::ProtocolBridge;
use crate::clock::{NetworkTimeSource, Rtc};
use crate::config::Tunables;
use crate::fault::FaultKind;
use crate::registers::HR_SYS_TIME;
use crate::telemetry::{StatusEvent, StatusSink};
use crate::transaction::{words_to_u32, TransactionId};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    Network,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSyncState {
    Idle,
    RequestNetworkTime,
    WaitNetworkTime,
    RequestDeviceTime,
    WaitDeviceTime,
    ValidateRange,
    SetClock,
    VerifyRequest,
    VerifyWait,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    pub epoch: u64,
    pub source: TimeSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSyncSettings {
    pub network_timeout_ms: u64,
    pub device_timeout_ms: u64,
    pub network_retries: u8,
    pub tolerance_s: u64,
    pub unix_min: u64,
    pub unix_max: u64,
}

impl TimeSyncSettings {
    pub fn from_tunables(tunables: &Tunables) -> Self {
        Self {
            network_timeout_ms: tunables.network_time_timeout_ms,
            device_timeout_ms: tunables.device_step_timeout_ms,
            network_retries: tunables.network_time_retries,
            tolerance_s: tunables.verify_tolerance_s,
            unix_min: tunables.unix_min,
            unix_max: tunables.unix_max,
        }
    }

    pub fn in_range(&self, epoch: u64) -> bool {
        (self.unix_min..=self.unix_max).contains(&epoch)
    }
}

impl Default for TimeSyncSettings {
    fn default() -> Self {
        Self::from_tunables(&Tunables::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    Synced,
    /// Committed, but the re-read disagreed.
    Unverified,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSyncStatus {
    pub last_outcome: Option<SyncOutcome>,
    pub last_source: Option<TimeSource>,
    pub last_committed: Option<u64>,
    pub cycles: u32,
    pub commits: u32,
    pub rejections: u32,
    pub failures: u32,
}

#[derive(Debug)]
pub struct TimeReconciler {
    state: TimeSyncState,
    settings: TimeSyncSettings,
    entered_ms: u64,
    network_attempts: u8,
    trigger_pending: bool,
    sample: Option<TimeSample>,
    tx: Option<TransactionId>,
    status: TimeSyncStatus,
}

impl TimeReconciler {
    pub fn new(settings: TimeSyncSettings) -> Self {
        Self {
            state: TimeSyncState::Idle,
            settings,
            entered_ms: 0,
            network_attempts: 0,
            trigger_pending: false,
            sample: None,
            tx: None,
            status: TimeSyncStatus::default(),
        }
    }

    pub fn state(&self) -> TimeSyncState {
        self.state
    }

    pub fn status(&self) -> &TimeSyncStatus {
        &self.status
    }

    /// Arm the next cycle. While a cycle runs the trigger waits; repeated
    /// triggers collapse into one.
    pub fn trigger(&mut self) {
        self.trigger_pending = true;
    }

    pub fn is_busy(&self) -> bool {
        !matches!(
            self.state,
            TimeSyncState::Idle | TimeSyncState::Done | TimeSyncState::Error
        )
    }

    pub fn wants_bus(&self) -> bool {
        self.trigger_pending || self.is_busy()
    }

    fn enter(&mut self, state: TimeSyncState, now_ms: u64) {
        debug!("time sync {:?} -> {:?}", self.state, state);
        self.state = state;
        self.entered_ms = now_ms;
    }

    fn timed_out(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.entered_ms) >= timeout_ms
    }

    /// Advance one step. Returns true while a cycle is in progress.
    pub fn step<B, N, S, C, K>(
        &mut self,
        now_ms: u64,
        bridge: &mut ProtocolBridge<B, N>,
        network: &mut S,
        rtc: &mut C,
        sink: &mut K,
    ) -> bool
    where
        B: Transport,
        N: Transport,
        S: NetworkTimeSource + ?Sized,
        C: Rtc + ?Sized,
        K: StatusSink + ?Sized,
    {
        match self.state {
            TimeSyncState::Idle | TimeSyncState::Done | TimeSyncState::Error => {
                if !self.trigger_pending {
                    self.state = TimeSyncState::Idle;
                    return false;
                }
                self.trigger_pending = false;
                self.network_attempts = 0;
                self.sample = None;
                self.status.cycles += 1;
                self.enter(TimeSyncState::RequestNetworkTime, now_ms);
            }

            TimeSyncState::RequestNetworkTime => {
                self.network_attempts += 1;
                match network.request() {
                    Ok(()) => self.enter(TimeSyncState::WaitNetworkTime, now_ms),
                    Err(e) => self.network_failed(now_ms, &e.to_string()),
                }
            }

            TimeSyncState::WaitNetworkTime => match network.poll() {
                Ok(epoch) => {
                    self.sample = Some(TimeSample {
                        epoch,
                        source: TimeSource::Network,
                    });
                    self.enter(TimeSyncState::ValidateRange, now_ms);
                }
                Err(nb::Error::Other(e)) => self.network_failed(now_ms, &e.to_string()),
                Err(nb::Error::WouldBlock) => {
                    if self.timed_out(now_ms, self.settings.network_timeout_ms) {
                        self.network_failed(now_ms, "timeout");
                    }
                }
            },

            TimeSyncState::RequestDeviceTime => {
                let target = bridge.device_target();
                match bridge.read_remote(target, HR_SYS_TIME, 2) {
                    Ok(id) => {
                        self.tx = Some(id);
                        self.enter(TimeSyncState::WaitDeviceTime, now_ms);
                    }
                    Err(e) => {
                        self.fail(now_ms, sink, fault_for_refusal(&e), &format!("device time: {}", e));
                    }
                }
            }

            TimeSyncState::WaitDeviceTime => {
                let Some(id) = self.tx else {
                    self.enter(TimeSyncState::RequestDeviceTime, now_ms);
                    return true;
                };
                match await_transaction(bridge, id, self.entered_ms, now_ms, self.settings.device_timeout_ms) {
                    Awaited::Pending => {}
                    Awaited::Succeeded(completion) => {
                        self.tx = None;
                        match device_epoch(&completion.values) {
                            Some(epoch) => {
                                self.sample = Some(TimeSample {
                                    epoch,
                                    source: TimeSource::Device,
                                });
                                self.enter(TimeSyncState::ValidateRange, now_ms);
                            }
                            None => self.fail(now_ms, sink, FaultKind::TransportRemoteError, "short device time"),
                        }
                    }
                    Awaited::Failed(code) => {
                        self.tx = None;
                        self.fail(now_ms, sink, fault_for(code), &format!("device time: {}", code));
                    }
                }
            }

            TimeSyncState::ValidateRange => {
                let Some(sample) = self.sample else {
                    self.enter(TimeSyncState::Error, now_ms);
                    return true;
                };
                if self.settings.in_range(sample.epoch) {
                    self.enter(TimeSyncState::SetClock, now_ms);
                } else {
                    self.status.rejections += 1;
                    let detail = format!("{:?} time {} outside accepted range", sample.source, sample.epoch);
                    warn!("{}", detail);
                    sink.fault(now_ms, FaultKind::RangeRejected, &detail);
                    self.sample = None;
                    match sample.source {
                        TimeSource::Network => self.enter(TimeSyncState::RequestDeviceTime, now_ms),
                        TimeSource::Device => self.fail_quietly(now_ms, sink, "no acceptable time"),
                    }
                }
            }

            TimeSyncState::SetClock => {
                let Some(sample) = self.sample else {
                    self.enter(TimeSyncState::Error, now_ms);
                    return true;
                };
                match rtc.set(sample.epoch) {
                    Ok(()) => {
                        info!("clock set to {} from {:?} time", sample.epoch, sample.source);
                        self.status.commits += 1;
                        self.status.last_committed = Some(sample.epoch);
                        self.status.last_source = Some(sample.source);
                        sink.report(
                            now_ms,
                            StatusEvent::TimeSynced {
                                source: sample.source,
                                epoch: sample.epoch,
                            },
                        );
                        self.enter(TimeSyncState::VerifyRequest, now_ms);
                    }
                    Err(e) => self.fail_quietly(now_ms, sink, &format!("clock rejected time: {}", e)),
                }
            }

            TimeSyncState::VerifyRequest => {
                let source = self.sample.map_or(TimeSource::Device, |s| s.source);
                let issued = match source {
                    TimeSource::Network => network.request().map_err(|e| e.to_string()),
                    TimeSource::Device => {
                        let target = bridge.device_target();
                        bridge
                            .read_remote(target, HR_SYS_TIME, 2)
                            .map(|id| self.tx = Some(id))
                            .map_err(|e| e.to_string())
                    }
                };
                match issued {
                    Ok(()) => self.enter(TimeSyncState::VerifyWait, now_ms),
                    Err(reason) => self.unverified(now_ms, sink, &reason),
                }
            }

            TimeSyncState::VerifyWait => {
                let source = self.sample.map_or(TimeSource::Device, |s| s.source);
                let reread = match source {
                    TimeSource::Network => match network.poll() {
                        Ok(epoch) => Some(Ok(epoch)),
                        Err(nb::Error::Other(e)) => Some(Err(e.to_string())),
                        Err(nb::Error::WouldBlock) => {
                            if self.timed_out(now_ms, self.settings.network_timeout_ms) {
                                Some(Err("timeout".to_string()))
                            } else {
                                None
                            }
                        }
                    },
                    TimeSource::Device => match self.tx {
                        None => Some(Err("no verification read".to_string())),
                        Some(id) => match await_transaction(bridge, id, self.entered_ms, now_ms, self.settings.device_timeout_ms) {
                            Awaited::Pending => None,
                            Awaited::Succeeded(completion) => {
                                self.tx = None;
                                Some(device_epoch(&completion.values).ok_or_else(|| "short device time".to_string()))
                            }
                            Awaited::Failed(code) => {
                                self.tx = None;
                                Some(Err(code.to_string()))
                            }
                        },
                    },
                };
                match reread {
                    None => {}
                    Some(Ok(epoch)) => {
                        let clock = rtc.now();
                        if epoch.abs_diff(clock) <= self.settings.tolerance_s {
                            info!("clock verified against {:?} time", source);
                            self.status.last_outcome = Some(SyncOutcome::Synced);
                            self.enter(TimeSyncState::Done, now_ms);
                        } else {
                            self.unverified(
                                now_ms,
                                sink,
                                &format!("re-read {} differs from clock {}", epoch, clock),
                            );
                        }
                    }
                    Some(Err(reason)) => self.unverified(now_ms, sink, &reason),
                }
            }
        }
        self.is_busy()
    }

    fn network_failed(&mut self, now_ms: u64, reason: &str) {
        if self.network_attempts <= self.settings.network_retries {
            debug!("network time attempt {} failed: {}, retrying", self.network_attempts, reason);
            self.enter(TimeSyncState::RequestNetworkTime, now_ms);
        } else {
            warn!("network time unavailable ({}), falling back to device time", reason);
            self.enter(TimeSyncState::RequestDeviceTime, now_ms);
        }
    }

    fn fail<K: StatusSink + ?Sized>(&mut self, now_ms: u64, sink: &mut K, kind: FaultKind, detail: &str) {
        sink.fault(now_ms, kind, detail);
        self.fail_quietly(now_ms, sink, detail);
    }

    fn fail_quietly<K: StatusSink + ?Sized>(&mut self, now_ms: u64, sink: &mut K, reason: &str) {
        warn!("time sync failed: {}", reason);
        self.status.failures += 1;
        self.status.last_outcome = Some(SyncOutcome::Failed);
        sink.report(
            now_ms,
            StatusEvent::TimeSyncFailed {
                reason: reason.to_string(),
            },
        );
        self.enter(TimeSyncState::Error, now_ms);
    }

    fn unverified<K: StatusSink + ?Sized>(&mut self, now_ms: u64, sink: &mut K, reason: &str) {
        warn!("time sync verification failed: {}", reason);
        sink.fault(now_ms, FaultKind::VerifyMismatch, reason);
        self.status.failures += 1;
        self.status.last_outcome = Some(SyncOutcome::Unverified);
        self.enter(TimeSyncState::Error, now_ms);
    }
}

fn device_epoch(values: &[u16]) -> Option<u64> {
    match values {
        [hi, lo, ..] => Some(u64::from(words_to_u32(*hi, *lo))),
        _ => None,
    }
}

use pvgate::bridge::{ProtocolBridge, TransportConfig};
use pvgate::clock::{ManualRtc, Rtc, ScriptedTimeSource, TimeSourceError};
use pvgate::config::DeviceRole;
use pvgate::fault::FaultKind;
use pvgate::services::timesync::{SyncOutcome, TimeReconciler, TimeSource, TimeSyncSettings, TimeSyncState};
use pvgate::telemetry::{StatusEvent, TelemetryCollector};
use pvgate::transaction::TxCode;
use pvgate::transport::SimulatedDevice;

const EPOCH: u64 = 1_710_590_400;
const TICK_MS: u64 = 100;

struct Harness {
    bridge: ProtocolBridge<SimulatedDevice, SimulatedDevice>,
    sync: TimeReconciler,
    source: ScriptedTimeSource,
    rtc: ManualRtc,
    telemetry: TelemetryCollector,
    now_ms: u64,
}

impl Harness {
    fn new(device_epoch: u32, source: ScriptedTimeSource) -> Self {
        let mut bridge = ProtocolBridge::new(
            SimulatedDevice::inverter("inverter", device_epoch),
            SimulatedDevice::new("peer"),
        );
        let config = TransportConfig {
            peer: None,
            ..TransportConfig::default()
        };
        bridge.begin(DeviceRole::Controller, config).unwrap();
        Self {
            bridge,
            sync: TimeReconciler::new(TimeSyncSettings::default()),
            source,
            rtc: ManualRtc::new(0),
            telemetry: TelemetryCollector::new(),
            now_ms: 0,
        }
    }

    fn tick(&mut self) -> bool {
        self.bridge.task(self.now_ms);
        let busy = self.sync.step(
            self.now_ms,
            &mut self.bridge,
            &mut self.source,
            &mut self.rtc,
            &mut self.telemetry,
        );
        self.now_ms += TICK_MS;
        busy
    }

    /// Trigger one cycle and run it to completion.
    fn run_cycle(&mut self) {
        self.sync.trigger();
        self.tick();
        for _ in 0..200 {
            if !self.tick() {
                return;
            }
        }
        panic!("time sync did not finish, stuck in {:?}", self.sync.state());
    }
}

#[test]
fn test_network_time_committed_and_verified() {
    let mut h = Harness::new(EPOCH as u32, ScriptedTimeSource::new().answer(EPOCH).answer(EPOCH + 1));
    h.run_cycle();

    let status = h.sync.status();
    assert_eq!(status.last_outcome, Some(SyncOutcome::Synced));
    assert_eq!(status.last_source, Some(TimeSource::Network));
    assert_eq!(status.last_committed, Some(EPOCH));
    assert_eq!(h.rtc.now(), EPOCH);
    assert_eq!(h.rtc.commits, 1);
    assert_eq!(h.source.requests, 2);
    // The device was never read
    assert_eq!(h.bridge.bus_mut().stats().reads, 0);

    let events = h.telemetry.drain_events();
    assert!(events.iter().any(|e| e.event
        == StatusEvent::TimeSynced {
            source: TimeSource::Network,
            epoch: EPOCH
        }));
}

#[test]
fn test_network_unreachable_and_device_unreadable() {
    let mut h = Harness::new(EPOCH as u32, ScriptedTimeSource::new());
    h.bridge.bus_mut().fail_next(1, TxCode::Timeout);
    h.sync.trigger();

    let mut fallback_at = None;
    for _ in 0..200 {
        let at = h.now_ms;
        let busy = h.tick();
        if fallback_at.is_none() && h.sync.state() == TimeSyncState::RequestDeviceTime {
            fallback_at = Some(at);
        }
        if !busy && at > 0 {
            break;
        }
    }

    // Two network attempts of 3000 ms each before the device is asked
    assert!(fallback_at.unwrap() >= 6000);
    assert_eq!(h.source.requests, 2);
    assert_eq!(h.sync.state(), TimeSyncState::Error);
    assert_eq!(h.sync.status().last_outcome, Some(SyncOutcome::Failed));
    assert_eq!(h.rtc.commits, 0);
    assert_eq!(h.rtc.now(), 0);
    assert_eq!(h.telemetry.faults().count_of(FaultKind::TransportTimeout), 1);

    let events = h.telemetry.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e.event, StatusEvent::TimeSyncFailed { .. })));
}

#[test]
fn test_network_errors_fall_back_to_device() {
    let source = ScriptedTimeSource::new()
        .fail(TimeSourceError::NoReply)
        .fail(TimeSourceError::NoReply);
    let mut h = Harness::new(EPOCH as u32, source);
    h.run_cycle();

    let status = h.sync.status();
    assert_eq!(status.last_outcome, Some(SyncOutcome::Synced));
    assert_eq!(status.last_source, Some(TimeSource::Device));
    assert_eq!(h.rtc.now(), EPOCH);
    // Read for the sample, then again for the verification
    assert_eq!(h.bridge.bus_mut().stats().reads, 2);
    // Errors answer immediately, no timeout is waited out
    assert!(h.now_ms < 3000);
}

#[test]
fn test_out_of_range_network_time_uses_device() {
    let mut h = Harness::new(EPOCH as u32, ScriptedTimeSource::new().answer(100));
    h.run_cycle();

    let status = h.sync.status();
    assert_eq!(status.rejections, 1);
    assert_eq!(status.last_source, Some(TimeSource::Device));
    assert_eq!(status.last_outcome, Some(SyncOutcome::Synced));
    assert_eq!(h.rtc.now(), EPOCH);
    assert_eq!(h.telemetry.faults().count_of(FaultKind::RangeRejected), 1);
}

#[test]
fn test_no_acceptable_time_leaves_clock() {
    let mut h = Harness::new(5, ScriptedTimeSource::new().answer(100));
    h.run_cycle();

    let status = h.sync.status();
    assert_eq!(status.rejections, 2);
    assert_eq!(status.last_outcome, Some(SyncOutcome::Failed));
    assert_eq!(status.commits, 0);
    assert_eq!(h.rtc.commits, 0);
}

#[test]
fn test_only_in_range_epochs_are_committed() {
    let settings = TimeSyncSettings::default();
    let candidates = [
        0,
        settings.unix_min - 1,
        settings.unix_min,
        EPOCH,
        settings.unix_max,
        settings.unix_max + 1,
    ];
    for candidate in candidates {
        // The device clock is unusable so only the network sample can commit
        let mut h = Harness::new(5, ScriptedTimeSource::new().answer(candidate).answer(candidate));
        h.run_cycle();

        assert_eq!(h.rtc.commits > 0, settings.in_range(candidate), "epoch {}", candidate);
        if let Some(committed) = h.sync.status().last_committed {
            assert!(settings.in_range(committed));
        }
    }
}

#[test]
fn test_verification_mismatch_keeps_commit() {
    let mut h = Harness::new(EPOCH as u32, ScriptedTimeSource::new().answer(EPOCH).answer(EPOCH + 100));
    h.run_cycle();

    let status = h.sync.status();
    assert_eq!(status.last_outcome, Some(SyncOutcome::Unverified));
    assert_eq!(status.commits, 1);
    assert_eq!(h.rtc.now(), EPOCH);
    assert_eq!(h.telemetry.faults().count_of(FaultKind::VerifyMismatch), 1);
}

#[test]
fn test_verification_within_tolerance() {
    let mut h = Harness::new(EPOCH as u32, ScriptedTimeSource::new().answer(EPOCH).answer(EPOCH + 2));
    h.run_cycle();
    assert_eq!(h.sync.status().last_outcome, Some(SyncOutcome::Synced));
}

#[test]
fn test_triggers_collapse_into_one_cycle() {
    let mut h = Harness::new(EPOCH as u32, ScriptedTimeSource::new().answer(EPOCH).answer(EPOCH));
    h.sync.trigger();
    h.run_cycle();
    assert_eq!(h.sync.status().cycles, 1);
    assert!(!h.tick());
    assert_eq!(h.sync.state(), TimeSyncState::Idle);
}

use crate::bridge::{BridgeStats, LinkHealth};
use crate::config::DeviceRole;
use crate::fault::{FaultKind, FaultLog, FaultRecord};
use crate::services::timesync::TimeSource;
use heapless::Deque;
use serde::{Deserialize, Serialize};

const EVENT_BUFFER_SIZE: usize = 64;
const MAX_SEQUENCE_NUMBER: u32 = 65535;

/// Inverter active power as last polled. A failed poll publishes a reading
/// with `valid == false` and no value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub kw: Option<f32>,
    pub valid: bool,
    pub sampled_ms: u64,
}

impl PowerReading {
    pub fn from_raw(raw: u32, sampled_ms: u64) -> Self {
        Self {
            kw: Some(raw as f32 / 1000.0),
            valid: true,
            sampled_ms,
        }
    }

    pub fn stale(sampled_ms: u64) -> Self {
        Self {
            kw: None,
            valid: false,
            sampled_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    TimeSynced { source: TimeSource, epoch: u64 },
    TimeSyncFailed { reason: String },
    ProgramApplied { program_id: u8, value: u16, written: bool },
    ProgramFailed { program_id: u8, reason: String },
    Power(PowerReading),
    Fault { kind: FaultKind, detail: String },
    Link(LinkHealth),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub sequence_number: u32,
    pub at_ms: u64,
    #[serde(flatten)]
    pub event: StatusEvent,
}

/// Push-style observability channel the state machines report into.
pub trait StatusSink {
    fn publish_power(&mut self, reading: PowerReading);
    fn report(&mut self, at_ms: u64, event: StatusEvent);

    fn fault(&mut self, at_ms: u64, kind: FaultKind, detail: &str) {
        self.report(
            at_ms,
            StatusEvent::Fault {
                kind,
                detail: detail.to_string(),
            },
        );
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    pub events_reported: u32,
    pub events_dropped: u32,
    pub power_readings: u32,
    pub stale_readings: u32,
    pub faults: u32,
}

/// Snapshot served on the status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub role: DeviceRole,
    pub uptime_ms: u64,
    pub clock_epoch: u64,
    pub link: LinkHealth,
    pub connected: bool,
    pub power: Option<PowerReading>,
    pub active_program: Option<u8>,
    pub bridge: BridgeStats,
    pub last_fault: Option<FaultRecord>,
}

/// Keeps the latest power reading, a bounded backlog of status events for the
/// control port, and the fault history.
#[derive(Debug)]
pub struct TelemetryCollector {
    events: Deque<SequencedEvent, EVENT_BUFFER_SIZE>,
    latest_power: Option<PowerReading>,
    faults: FaultLog,
    sequence_number: u32,
    metrics: TelemetryMetrics,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self {
            events: Deque::new(),
            latest_power: None,
            faults: FaultLog::new(),
            sequence_number: 1,
            metrics: TelemetryMetrics::default(),
        }
    }

    fn push(&mut self, at_ms: u64, event: StatusEvent) {
        let sequenced = SequencedEvent {
            sequence_number: self.sequence_number,
            at_ms,
            event,
        };
        self.sequence_number = (self.sequence_number % MAX_SEQUENCE_NUMBER) + 1;
        if self.events.is_full() {
            self.events.pop_front();
            self.metrics.events_dropped += 1;
        }
        let _ = self.events.push_back(sequenced);
        self.metrics.events_reported += 1;
    }

    /// Events not yet handed out, oldest first.
    pub fn drain_events(&mut self) -> std::vec::Vec<SequencedEvent> {
        let mut drained = std::vec::Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop_front() {
            drained.push(event);
        }
        drained
    }

    pub fn latest_power(&self) -> Option<PowerReading> {
        self.latest_power
    }

    pub fn faults(&self) -> &FaultLog {
        &self.faults
    }

    pub fn metrics(&self) -> &TelemetryMetrics {
        &self.metrics
    }

    pub fn serialize_event(event: &SequencedEvent) -> Result<String, serde_json::Error> {
        serde_json::to_string(event)
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for TelemetryCollector {
    fn publish_power(&mut self, reading: PowerReading) {
        self.metrics.power_readings += 1;
        if !reading.valid {
            self.metrics.stale_readings += 1;
        }
        self.latest_power = Some(reading);
        self.push(reading.sampled_ms, StatusEvent::Power(reading));
    }

    fn report(&mut self, at_ms: u64, event: StatusEvent) {
        if let StatusEvent::Fault { kind, detail } = &event {
            self.faults.record(*kind, at_ms, detail);
            self.metrics.faults += 1;
        }
        self.push(at_ms, event);
    }
}

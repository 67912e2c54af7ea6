use crate::api::{self, ApiError, ConfigBackend, StatusReport};
use crate::bridge::{BridgeError, LinkHealth, ProtocolBridge, TransportConfig};
use crate::calendar::{local_time, Calendar};
use crate::clock::{NetworkTimeSource, Rtc};
use crate::config::{ConfigError, ConfigStore, DeviceRole, PersistedConfig, Tunables};
use crate::fault::FaultKind;
use crate::protocol::{Command, CommandResponse, CommandType, ProtocolError, ProtocolHandler, ResponseStatus};
use crate::scheduler::{TickFlag, TickScheduler};
use crate::services::program::ProgramSettings;
use crate::services::timesync::TimeSyncSettings;
use crate::services::{PowerMonitor, ProgramEvaluator, TimeReconciler};
use crate::telemetry::{GatewayStatus, SequencedEvent, StatusEvent, StatusSink, TelemetryCollector};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

/// State machine currently allowed to issue bus transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusOwner {
    TimeSync,
    Program,
    Power,
    Mirror,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub running: bool,
    pub ticks: u64,
    pub command_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Single owner of the gateway state. The daemon calls [`GatewayAgent::step`]
/// once per loop iteration; every service advances by one step from there.
pub struct GatewayAgent<B: Transport, N: Transport> {
    store: Box<dyn ConfigStore + Send>,
    persisted: PersistedConfig,
    tunables: Tunables,
    bridge: ProtocolBridge<B, N>,
    time_sync: TimeReconciler,
    program: ProgramEvaluator,
    power: PowerMonitor,
    ticker: TickScheduler,
    telemetry: TelemetryCollector,
    rtc: Box<dyn Rtc + Send>,
    time_source: Box<dyn NetworkTimeSource + Send>,
    protocol_handler: ProtocolHandler,
    bus_owner: Option<BusOwner>,
    last_link: Option<LinkHealth>,
    local_address: IpAddr,
    started_ms: u64,
    last_ms: u64,
    restart_requested: bool,
    state: AgentState,
}

impl<B: Transport, N: Transport> GatewayAgent<B, N> {
    /// Load the persisted record and wire the services. An unreadable record
    /// is reported and replaced by the factory default.
    pub fn new(
        mut store: Box<dyn ConfigStore + Send>,
        tunables: Tunables,
        bus: B,
        net: N,
        rtc: Box<dyn Rtc + Send>,
        time_source: Box<dyn NetworkTimeSource + Send>,
    ) -> Self {
        let mut telemetry = TelemetryCollector::new();
        let persisted = match store.load() {
            Ok(config) => config,
            Err(e) => {
                warn!("stored configuration unusable ({}), using factory defaults", e);
                telemetry.fault(0, FaultKind::PersistenceUnavailable, &e.to_string());
                PersistedConfig::default()
            }
        };

        Self {
            store,
            persisted,
            bridge: ProtocolBridge::new(bus, net),
            time_sync: TimeReconciler::new(TimeSyncSettings::from_tunables(&tunables)),
            program: ProgramEvaluator::new(Calendar::production(), ProgramSettings::from_tunables(&tunables)),
            power: PowerMonitor::new(tunables.device_step_timeout_ms),
            ticker: TickScheduler::new(&tunables, 0),
            telemetry,
            rtc,
            time_source,
            protocol_handler: ProtocolHandler::new(),
            bus_owner: None,
            last_link: None,
            local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            started_ms: 0,
            last_ms: 0,
            restart_requested: false,
            state: AgentState::default(),
            tunables,
        }
    }

    pub fn with_local_address(mut self, address: IpAddr) -> Self {
        self.local_address = address;
        self
    }

    /// Start the bridge in the persisted role and arm the periodic flags.
    pub fn start(&mut self, now_ms: u64) -> Result<(), AgentError> {
        let role = self.persisted.role;
        let transport = TransportConfig::from_config(&self.persisted, &self.tunables);
        self.bridge.begin(role, transport)?;
        self.ticker = TickScheduler::new(&self.tunables, now_ms);
        self.started_ms = now_ms;
        self.last_ms = now_ms;
        self.state.running = true;

        for (first, second) in self.program.calendar().overlaps() {
            warn!(
                "calendar programs {:#04x} and {:#04x} overlap; {:#04x} wins by table order",
                first, second, first
            );
        }
        info!("gateway running as {}", role);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.state.running = false;
        self.bridge.disconnect();
        info!("gateway stopped");
    }

    pub fn step(&mut self, now_ms: u64) {
        if !self.state.running {
            return;
        }
        self.last_ms = now_ms;
        self.state.ticks += 1;

        self.ticker.poll(now_ms);
        self.bridge.task(now_ms);
        self.report_link_changes(now_ms);

        if self.bridge.role() != Some(DeviceRole::Controller) {
            for flag in TickFlag::ALL {
                self.ticker.take(flag);
            }
            return;
        }

        self.feed_triggers();

        let owner = match self.bus_owner {
            Some(owner) => owner,
            None => match self.next_owner() {
                Some(owner) => owner,
                None => return,
            },
        };
        let busy = self.step_owner(owner, now_ms);
        self.bus_owner = busy.then_some(owner);
    }

    fn feed_triggers(&mut self) {
        if self.ticker.take(TickFlag::TimeSync) {
            self.time_sync.trigger();
        }
        if self.ticker.take(TickFlag::PowerPoll) {
            self.power.trigger();
        }
        if self.ticker.take(TickFlag::MinuteCheck) {
            if let Some(wall) = local_time(self.rtc.now()) {
                self.program.check_minute(&wall);
            }
        }
        if self.ticker.take(TickFlag::Mirror) && self.bridge.peer().is_some() {
            self.bridge.trigger_mirror();
        }
    }

    /// Highest-priority machine that wants the bus.
    fn next_owner(&self) -> Option<BusOwner> {
        if self.time_sync.wants_bus() {
            Some(BusOwner::TimeSync)
        } else if self.program.wants_bus() {
            Some(BusOwner::Program)
        } else if self.power.wants_bus() {
            Some(BusOwner::Power)
        } else if self.bridge.mirror_wants_bus() {
            Some(BusOwner::Mirror)
        } else {
            None
        }
    }

    fn step_owner(&mut self, owner: BusOwner, now_ms: u64) -> bool {
        match owner {
            BusOwner::TimeSync => self.time_sync.step(
                now_ms,
                &mut self.bridge,
                &mut *self.time_source,
                &mut *self.rtc,
                &mut self.telemetry,
            ),
            BusOwner::Program => {
                let Some(wall) = local_time(self.rtc.now()) else {
                    debug!("clock not representable, skipping evaluation");
                    return false;
                };
                self.program.step(now_ms, &wall, &mut self.bridge, &mut self.telemetry)
            }
            BusOwner::Power => self.power.step(now_ms, &mut self.bridge, &mut self.telemetry),
            BusOwner::Mirror => self.bridge.step_mirror(now_ms),
        }
    }

    fn report_link_changes(&mut self, now_ms: u64) {
        let link = self.bridge.link_health(now_ms);
        if self.last_link != Some(link) {
            if let Some(previous) = self.last_link {
                info!(
                    "link health bus {} -> {}, network {} -> {}",
                    previous.bus, link.bus, previous.network, link.network
                );
            }
            self.last_link = Some(link);
            self.telemetry.report(now_ms, StatusEvent::Link(link));
        }
    }

    pub fn handle_command(&mut self, command: &Command) -> CommandResponse {
        self.state.command_count += 1;
        let now_ms = self.last_ms;
        let handler = &self.protocol_handler;

        if let Err(e) = handler.validate_command(command) {
            return handler.create_response(command.id, now_ms, ResponseStatus::InvalidCommand, Some(&e.to_string()));
        }

        let controller_only = matches!(
            command.command_type,
            CommandType::TriggerTimeSync | CommandType::TriggerEvaluation
        );
        if controller_only && self.role() != DeviceRole::Controller {
            return handler.create_response(
                command.id,
                now_ms,
                ResponseStatus::Error,
                Some("services run only in controller role"),
            );
        }

        match &command.command_type {
            CommandType::Ping => handler.create_response(command.id, now_ms, ResponseStatus::Success, Some("pong")),
            CommandType::Status => self.data_response(command.id, &self.status()),
            CommandType::GetConfig => {
                handler.create_data_response(command.id, now_ms, api::redacted_config(&self.persisted))
            }
            CommandType::Discover => self.data_response(command.id, &api::discovery_info(&*self)),
            CommandType::ActiveProgram => self.data_response(command.id, self.program.status()),
            CommandType::TriggerTimeSync => {
                self.ticker.force(TickFlag::TimeSync);
                self.protocol_handler
                    .create_response(command.id, now_ms, ResponseStatus::Acknowledged, Some("time sync queued"))
            }
            CommandType::TriggerEvaluation => {
                self.program.trigger();
                self.protocol_handler
                    .create_response(command.id, now_ms, ResponseStatus::Acknowledged, Some("evaluation queued"))
            }
            CommandType::SetConfig { bearer, update } => {
                let (status, message) = match api::update_config(self, bearer.as_deref(), update) {
                    Ok(()) => (ResponseStatus::Success, "configuration saved, restarting".to_string()),
                    Err(ApiError::Unauthorized) => (ResponseStatus::Unauthorized, ApiError::Unauthorized.to_string()),
                    Err(e) => {
                        self.state.last_error = Some(e.to_string());
                        (ResponseStatus::Error, e.to_string())
                    }
                };
                self.protocol_handler.create_response(command.id, now_ms, status, Some(&message))
            }
        }
    }

    /// Parse and execute one control-port line, returning the serialized reply.
    pub fn handle_line(&mut self, line: &str) -> Result<String, AgentError> {
        let command = self.protocol_handler.parse_command(line)?;
        let response = self.handle_command(&command);
        Ok(self.protocol_handler.serialize_response(&response)?.to_string())
    }

    fn data_response<T: Serialize + ?Sized>(&self, id: u32, value: &T) -> CommandResponse {
        match serde_json::to_value(value) {
            Ok(data) => self.protocol_handler.create_data_response(id, self.last_ms, data),
            Err(e) => self
                .protocol_handler
                .create_response(id, self.last_ms, ResponseStatus::Error, Some(&e.to_string())),
        }
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            role: self.role(),
            uptime_ms: self.last_ms.saturating_sub(self.started_ms),
            clock_epoch: self.rtc.now(),
            link: self.bridge.link_health(self.last_ms),
            connected: self.bridge.is_connected(),
            power: self.telemetry.latest_power(),
            active_program: self.program.status().active.map(|e| e.program.id),
            bridge: self.bridge.stats(),
            last_fault: self.telemetry.faults().last().cloned(),
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.bridge.role().unwrap_or(self.persisted.role)
    }

    pub fn drain_events(&mut self) -> Vec<SequencedEvent> {
        self.telemetry.drain_events()
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    pub fn bus_owner(&self) -> Option<BusOwner> {
        self.bus_owner
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    pub fn time_sync(&self) -> &TimeReconciler {
        &self.time_sync
    }

    pub fn program(&self) -> &ProgramEvaluator {
        &self.program
    }

    pub fn power(&self) -> &PowerMonitor {
        &self.power
    }

    pub fn rtc(&self) -> &(dyn Rtc + Send) {
        &*self.rtc
    }

    pub fn bridge(&self) -> &ProtocolBridge<B, N> {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut ProtocolBridge<B, N> {
        &mut self.bridge
    }
}

impl<B: Transport, N: Transport> ConfigBackend for GatewayAgent<B, N> {
    fn persisted(&self) -> &PersistedConfig {
        &self.persisted
    }

    fn commit(&mut self, next: PersistedConfig) -> Result<(), ConfigError> {
        if let Err(e) = self.store.save(&next) {
            self.telemetry
                .fault(self.last_ms, FaultKind::PersistenceUnavailable, &e.to_string());
            return Err(e);
        }
        info!("configuration saved (role {}), restart requested", next.role);
        self.persisted = next;
        self.restart_requested = true;
        Ok(())
    }

    fn status_report(&self) -> StatusReport {
        let stats = self.bridge.stats();
        let settled = stats.succeeded + stats.failed + stats.abandoned;
        let link_quality = if settled == 0 {
            0
        } else {
            (u64::from(stats.succeeded) * 100 / u64::from(settled)) as u8
        };
        let link = self.bridge.link_health(self.last_ms);
        StatusReport {
            role: self.role(),
            local_address: self.local_address,
            link_quality,
            bus_link: link.bus,
            network_link: link.network,
        }
    }
}

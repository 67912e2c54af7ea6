use pvgate::agent::{AgentError, BusOwner, GatewayAgent};
use pvgate::api::ConfigBackend;
use pvgate::clock::{ManualRtc, NoTimeSource};
use pvgate::config::{DeviceRole, MemoryConfigStore, PersistedConfig, Tunables};
use pvgate::protocol::{CommandResponse, ResponseStatus};
use pvgate::registers::{HR_ACT_PWR_LIM_VL, MIRROR_START};
use pvgate::services::timesync::{SyncOutcome, TimeSource};
use pvgate::telemetry::{SequencedEvent, StatusEvent};
use pvgate::transaction::{values_from_slice, InboundOp, InboundReply};
use pvgate::transport::SimulatedDevice;

type Agent = GatewayAgent<SimulatedDevice, SimulatedDevice>;

// 2024-03-16 12:00:00, a Saturday
const EPOCH: u64 = 1_710_590_400;
const TICK_MS: u64 = 10;

fn agent(role: DeviceRole, bus: SimulatedDevice) -> Agent {
    let store = MemoryConfigStore {
        stored: Some(PersistedConfig {
            role,
            ..PersistedConfig::default()
        }),
        fail_saves: false,
    };
    let mut agent = GatewayAgent::new(
        Box::new(store),
        Tunables::default(),
        bus,
        SimulatedDevice::new("peer"),
        Box::new(ManualRtc::new(EPOCH)),
        Box::new(NoTimeSource),
    );
    agent.start(0).unwrap();
    agent
}

fn controller() -> Agent {
    agent(DeviceRole::Controller, SimulatedDevice::inverter("inverter", EPOCH as u32))
}

fn run(agent: &mut Agent, from_tick: u64, ticks: u64) -> Vec<SequencedEvent> {
    let mut events = Vec::new();
    for tick in from_tick..from_tick + ticks {
        agent.step(tick * TICK_MS);
        events.extend(agent.drain_events());
    }
    events
}

fn command(agent: &mut Agent, line: &str) -> CommandResponse {
    let reply = agent.handle_line(line).unwrap();
    serde_json::from_str(&reply).unwrap()
}

#[test]
fn test_controller_runs_every_service() {
    let mut agent = controller();
    let events = run(&mut agent, 0, 300);

    let sync = agent.time_sync().status();
    assert_eq!(sync.last_outcome, Some(SyncOutcome::Synced));
    assert_eq!(sync.last_source, Some(TimeSource::Device));
    assert_eq!(agent.rtc().now(), EPOCH);

    assert_eq!(agent.program().status().active.map(|e| e.program.id), Some(0x15));
    assert_eq!(agent.bridge_mut().bus_mut().register(HR_ACT_PWR_LIM_VL), Some(0));
    assert_eq!(agent.telemetry().latest_power().unwrap().kw, Some(42.5));
    assert!(agent.bridge().stats().mirror_cycles >= 1);

    let position = |wanted: fn(&StatusEvent) -> bool| events.iter().position(|e| wanted(&e.event));
    let synced = position(|e| matches!(e, StatusEvent::TimeSynced { .. })).unwrap();
    let applied = position(|e| matches!(e, StatusEvent::ProgramApplied { written: true, .. })).unwrap();
    let power = position(|e| matches!(e, StatusEvent::Power(_))).unwrap();
    assert!(synced < applied);
    assert!(applied < power);

    let status = agent.status();
    assert_eq!(status.role, DeviceRole::Controller);
    assert!(status.connected);
    assert_eq!(status.active_program, Some(0x15));
    assert_eq!(status.uptime_ms, 299 * TICK_MS);
}

#[test]
fn test_bus_has_one_owner_at_a_time() {
    let mut agent = controller();
    agent.step(0);
    assert_eq!(agent.bus_owner(), Some(BusOwner::TimeSync));

    for tick in 1..300 {
        agent.step(tick * TICK_MS);
        if agent.time_sync().is_busy() {
            assert_eq!(agent.program().status().reads, 0);
            assert_eq!(agent.power().stats().polls, 0);
            assert_eq!(agent.bridge().stats().mirror_cycles, 0);
        }
        if agent.program().is_busy() {
            assert_eq!(agent.power().stats().polls, 0);
        }
    }
    assert_eq!(agent.bus_owner(), None);
}

#[test]
fn test_mirror_reaches_peer() {
    let mut bus = SimulatedDevice::inverter("inverter", EPOCH as u32);
    bus.set_register(MIRROR_START, 77);
    let mut agent = agent(DeviceRole::Controller, bus);
    run(&mut agent, 0, 300);

    assert_eq!(agent.bridge_mut().net_mut().register(MIRROR_START), Some(77));
    assert_eq!(agent.bridge().get_local(MIRROR_START), Ok(77));
}

#[test]
fn test_link_changes_reported() {
    let mut agent = controller();
    let events = run(&mut agent, 0, 50);
    let links: Vec<_> = events
        .iter()
        .filter_map(|e| match e.event {
            StatusEvent::Link(link) => Some(link),
            _ => None,
        })
        .collect();
    assert!(!links.is_empty());
    let last = links.last().unwrap();
    assert!(last.bus);
    assert!(last.network);
}

#[test]
fn test_responder_only_serves() {
    let mut agent = agent(DeviceRole::Responder, SimulatedDevice::new("bus"));
    run(&mut agent, 0, 300);

    assert_eq!(agent.time_sync().status().cycles, 0);
    assert_eq!(agent.power().stats().polls, 0);
    assert_eq!(agent.program().status().evaluations, 0);
    assert_eq!(agent.bridge().stats().issued, 0);
    assert_eq!(agent.bridge_mut().bus_mut().stats().reads, 0);
    assert_eq!(agent.rtc().now(), EPOCH);

    agent.bridge_mut().set_local(MIRROR_START, 9).unwrap();
    agent.bridge_mut().net_mut().inject_inbound(InboundOp::Read {
        address: MIRROR_START,
        count: 1,
    });
    agent.step(300 * TICK_MS);
    assert_eq!(
        agent.bridge_mut().net_mut().take_replies().as_slice(),
        &[InboundReply::Registers(values_from_slice(&[9]).unwrap())]
    );
}

#[test]
fn test_control_commands() {
    let mut agent = controller();
    run(&mut agent, 0, 300);

    let pong = command(&mut agent, r#"{"id":1,"command_type":"Ping"}"#);
    assert_eq!(pong.status, ResponseStatus::Success);
    assert_eq!(pong.message.as_deref(), Some("pong"));

    let status = command(&mut agent, r#"{"id":2,"command_type":"Status"}"#);
    let data = status.data.unwrap();
    assert_eq!(data["role"], "Controller");
    assert_eq!(data["active_program"], 0x15);

    let program = command(&mut agent, r#"{"id":3,"command_type":"ActiveProgram"}"#);
    assert_eq!(program.data.unwrap()["desired"], 0);

    let config = command(&mut agent, r#"{"id":4,"command_type":"GetConfig"}"#);
    assert_eq!(config.data.unwrap()["token"], "********");

    let discover = command(&mut agent, r#"{"id":5,"command_type":"Discover"}"#);
    assert_eq!(discover.data.unwrap()["identity"], "pvgate");

    let invalid = command(&mut agent, r#"{"id":0,"command_type":"Ping"}"#);
    assert_eq!(invalid.status, ResponseStatus::InvalidCommand);

    assert!(matches!(agent.handle_line("not json"), Err(AgentError::Protocol(_))));
    assert_eq!(agent.state().command_count, 6);
}

#[test]
fn test_manual_triggers() {
    let mut agent = controller();
    run(&mut agent, 0, 300);
    assert_eq!(agent.time_sync().status().cycles, 1);
    let evaluations = agent.program().status().evaluations;

    let ack = command(&mut agent, r#"{"id":10,"command_type":"TriggerTimeSync"}"#);
    assert_eq!(ack.status, ResponseStatus::Acknowledged);
    let ack = command(&mut agent, r#"{"id":11,"command_type":"TriggerEvaluation"}"#);
    assert_eq!(ack.status, ResponseStatus::Acknowledged);

    run(&mut agent, 300, 100);
    assert_eq!(agent.time_sync().status().cycles, 2);
    assert_eq!(agent.program().status().evaluations, evaluations + 1);
    // Already at the desired limit, nothing written the second time
    assert_eq!(agent.program().status().writes, 1);
}

#[test]
fn test_set_config_over_control_port() {
    let mut agent = controller();
    agent.step(0);

    let empty = command(&mut agent, r#"{"id":20,"command_type":{"SetConfig":{"update":{}}}}"#);
    assert_eq!(empty.status, ResponseStatus::InvalidCommand);

    let saved = command(
        &mut agent,
        r#"{"id":21,"command_type":{"SetConfig":{"update":{"token":"n3w-token"}}}}"#,
    );
    assert_eq!(saved.status, ResponseStatus::Success);
    assert!(agent.restart_requested());

    let refused = command(
        &mut agent,
        r#"{"id":22,"command_type":{"SetConfig":{"bearer":"wrong","update":{"role":"Responder"}}}}"#,
    );
    assert_eq!(refused.status, ResponseStatus::Unauthorized);

    let accepted = command(
        &mut agent,
        r#"{"id":23,"command_type":{"SetConfig":{"bearer":"n3w-token","update":{"role":"Responder"}}}}"#,
    );
    assert_eq!(accepted.status, ResponseStatus::Success);
    assert_eq!(agent.persisted().role, DeviceRole::Responder);
    // The running role changes only after the restart
    assert_eq!(agent.role(), DeviceRole::Controller);
}

#[test]
fn test_responder_rejects_service_triggers() {
    let mut agent = agent(DeviceRole::Responder, SimulatedDevice::new("bus"));
    let reply = command(&mut agent, r#"{"id":1,"command_type":"TriggerTimeSync"}"#);
    assert_eq!(reply.status, ResponseStatus::Error);
    let reply = command(&mut agent, r#"{"id":2,"command_type":"TriggerEvaluation"}"#);
    assert_eq!(reply.status, ResponseStatus::Error);
}

#[test]
fn test_stopped_agent_does_nothing() {
    let mut agent = controller();
    agent.stop();
    run(&mut agent, 0, 50);
    assert_eq!(agent.state().ticks, 0);
    assert_eq!(agent.bridge().stats().issued, 0);
}

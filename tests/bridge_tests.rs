use pvgate::bridge::{BridgeError, ProtocolBridge, TransportConfig};
use pvgate::config::DeviceRole;
use pvgate::registers::{HR_ACT_PWR_LIM_VL, HR_SYS_TIME, MIRROR_START};
use pvgate::transaction::{values_from_slice, InboundException, InboundOp, InboundReply, Target, TxCode};
use pvgate::transport::SimulatedDevice;

const EPOCH: u32 = 1_710_590_400;

fn controller(peer: bool) -> ProtocolBridge<SimulatedDevice, SimulatedDevice> {
    let mut bridge = ProtocolBridge::new(SimulatedDevice::inverter("inverter", EPOCH), SimulatedDevice::new("peer"));
    let config = if peer {
        TransportConfig::default()
    } else {
        TransportConfig {
            peer: None,
            ..TransportConfig::default()
        }
    };
    bridge.begin(DeviceRole::Controller, config).unwrap();
    bridge
}

fn responder() -> ProtocolBridge<SimulatedDevice, SimulatedDevice> {
    let mut bridge = ProtocolBridge::new(SimulatedDevice::new("bus"), SimulatedDevice::new("net"));
    bridge.begin(DeviceRole::Responder, TransportConfig::default()).unwrap();
    bridge
}

#[test]
fn test_unreachable_peer_retries_on_interval() {
    let mut bridge = controller(true);
    bridge.net_mut().set_reachable(false);

    assert!(!bridge.connect(0));
    assert_eq!(bridge.connection().attempts(), 1);
    assert_eq!(bridge.connection().last_attempt_ms(), Some(0));

    // Inside the retry interval nothing is attempted and the timer is untouched
    assert!(!bridge.connect(1000));
    assert!(!bridge.connect(4999));
    assert_eq!(bridge.connection().attempts(), 1);
    assert_eq!(bridge.connection().skipped(), 2);
    assert_eq!(bridge.connection().last_attempt_ms(), Some(0));
    assert_eq!(bridge.net_mut().stats().open_attempts, 1);

    assert!(!bridge.connect(5000));
    assert_eq!(bridge.connection().attempts(), 2);
    assert_eq!(bridge.connection().last_attempt_ms(), Some(5000));

    bridge.net_mut().set_reachable(true);
    assert!(!bridge.connect(6000));
    assert!(bridge.connect(10_000));
    assert!(bridge.is_connected());
    assert_eq!(bridge.connection().last_attempt_ms(), None);
    assert_eq!(bridge.net_mut().stats().open_attempts, 3);
}

#[test]
fn test_task_connects_controller_to_peer() {
    let mut bridge = controller(true);
    assert!(!bridge.is_connected());
    bridge.task(0);
    assert!(bridge.is_connected());

    bridge.disconnect();
    assert!(!bridge.is_connected());
    bridge.task(10);
    assert!(bridge.is_connected());
}

#[test]
fn test_network_request_needs_connection() {
    let mut bridge = controller(true);
    let peer = bridge.peer().unwrap();
    assert!(matches!(
        bridge.read_remote(Target::Network(peer), MIRROR_START, 1),
        Err(BridgeError::NotConnected)
    ));
    assert_eq!(bridge.stats().issued, 0);
}

#[test]
fn test_device_read_settles_into_image() {
    let mut bridge = controller(false);
    let target = bridge.device_target();
    let id = bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 1).unwrap();
    assert_eq!(bridge.poll(id), Err(nb::Error::WouldBlock));

    bridge.task(10);
    let completion = bridge.poll(id).unwrap();
    assert_eq!(completion.outcome.code, TxCode::Success);
    assert_eq!(completion.values.as_slice(), &[750]);
    assert_eq!(bridge.get_local(HR_ACT_PWR_LIM_VL), Ok(750));

    // Each outcome is handed out once
    assert!(matches!(
        bridge.poll(id),
        Err(nb::Error::Other(BridgeError::UnknownTransaction(_)))
    ));
}

#[test]
fn test_one_transaction_per_side() {
    let mut bridge = controller(false);
    let target = bridge.device_target();
    bridge.read_remote(target, HR_SYS_TIME, 2).unwrap();
    assert!(matches!(
        bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 1),
        Err(BridgeError::Busy(_))
    ));
    assert!(matches!(bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 0), Err(BridgeError::InvalidRange)));
}

#[test]
fn test_failed_read_leaves_image() {
    let mut bridge = controller(false);
    bridge.bus_mut().fail_next(1, TxCode::RemoteError);
    let target = bridge.device_target();
    let id = bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 1).unwrap();
    bridge.task(10);

    let completion = bridge.poll(id).unwrap();
    assert_eq!(completion.outcome.code, TxCode::RemoteError);
    assert_eq!(bridge.get_local(HR_ACT_PWR_LIM_VL), Ok(0));
    assert_eq!(bridge.stats().failed, 1);
}

#[test]
fn test_local_write_wins_over_inflight_read() {
    let mut bridge = controller(false);
    bridge.bus_mut().set_latency(1);
    let target = bridge.device_target();
    let id = bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 1).unwrap();

    bridge.set_local(HR_ACT_PWR_LIM_VL, 5).unwrap();
    bridge.task(10);
    bridge.task(20);

    assert_eq!(bridge.poll(id).unwrap().values.as_slice(), &[750]);
    assert_eq!(bridge.get_local(HR_ACT_PWR_LIM_VL), Ok(5));
}

#[test]
fn test_abandoned_transaction_never_applies() {
    let mut bridge = controller(false);
    bridge.bus_mut().set_latency(2);
    let target = bridge.device_target();
    let id = bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 1).unwrap();

    bridge.abandon(id);
    for t in 1..=4 {
        bridge.task(t * 10);
    }

    let stats = bridge.stats();
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.late_completions, 1);
    assert_eq!(stats.succeeded, 0);
    assert_eq!(bridge.get_local(HR_ACT_PWR_LIM_VL), Ok(0));
    assert!(matches!(
        bridge.poll(id),
        Err(nb::Error::Other(BridgeError::UnknownTransaction(_)))
    ));
}

#[test]
fn test_swallowed_request_frees_side_after_abandon() {
    let mut bridge = controller(false);
    bridge.bus_mut().swallow_next(1);
    let target = bridge.device_target();
    let lost = bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 1).unwrap();
    bridge.task(10);
    assert_eq!(bridge.poll(lost), Err(nb::Error::WouldBlock));

    bridge.abandon(lost);
    let id = bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 1).unwrap();
    bridge.task(20);
    assert_eq!(bridge.poll(id).unwrap().outcome.code, TxCode::Success);
}

#[test]
fn test_responder_rejects_remote_calls() {
    let mut bridge = responder();
    let target = bridge.device_target();

    let err = bridge.read_remote(target, HR_ACT_PWR_LIM_VL, 1).unwrap_err();
    assert_eq!(err, BridgeError::RoleMismatch(DeviceRole::Responder));
    assert_eq!(err.code(), TxCode::NotSupported);

    let err = bridge.write_remote(target, HR_ACT_PWR_LIM_VL, &[1]).unwrap_err();
    assert_eq!(err.code(), TxCode::NotSupported);
    assert_eq!(bridge.stats().role_rejections, 2);
    assert_eq!(bridge.stats().issued, 0);
}

#[test]
fn test_responder_local_round_trip() {
    let mut bridge = responder();
    for value in [0, 1, 0x7FFF, u16::MAX] {
        bridge.set_local(MIRROR_START, value).unwrap();
        assert_eq!(bridge.get_local(MIRROR_START), Ok(value));
    }
    assert!(bridge.set_local(0x1234, 1).is_err());
}

#[test]
fn test_responder_serves_both_sides() {
    let mut bridge = responder();
    bridge.set_local(MIRROR_START, 321).unwrap();

    bridge.net_mut().inject_inbound(InboundOp::Read {
        address: MIRROR_START,
        count: 1,
    });
    bridge.bus_mut().inject_inbound(InboundOp::Write {
        address: HR_ACT_PWR_LIM_VL,
        values: values_from_slice(&[400]).unwrap(),
    });
    bridge.task(10);

    let replies = bridge.net_mut().take_replies();
    assert_eq!(replies.as_slice(), &[InboundReply::Registers(values_from_slice(&[321]).unwrap())]);
    let replies = bridge.bus_mut().take_replies();
    assert_eq!(
        replies.as_slice(),
        &[InboundReply::Written {
            address: HR_ACT_PWR_LIM_VL,
            count: 1
        }]
    );
    assert_eq!(bridge.get_local(HR_ACT_PWR_LIM_VL), Ok(400));
    assert_eq!(bridge.stats().inbound_served, 2);

    let health = bridge.link_health(20);
    assert!(health.bus);
    assert!(health.network);
}

#[test]
fn test_controller_refuses_inbound() {
    let mut bridge = controller(false);
    bridge.bus_mut().inject_inbound(InboundOp::Read {
        address: MIRROR_START,
        count: 1,
    });
    bridge.task(10);
    assert_eq!(
        bridge.bus_mut().take_replies().as_slice(),
        &[InboundReply::Exception(InboundException::IllegalFunction)]
    );
}

#[test]
fn test_mirror_copies_device_block_to_peer() {
    let mut bridge = controller(true);
    bridge.bus_mut().set_register(MIRROR_START, 1234);
    bridge.trigger_mirror();
    assert!(bridge.mirror_wants_bus());

    for t in 0..10 {
        bridge.task(t * 10);
        bridge.step_mirror(t * 10);
    }

    assert!(!bridge.mirror_wants_bus());
    assert_eq!(bridge.stats().mirror_cycles, 1);
    assert_eq!(bridge.net_mut().register(MIRROR_START), Some(1234));
    assert_eq!(bridge.get_local(MIRROR_START), Ok(1234));
}

#[test]
fn test_mirror_needs_peer() {
    let mut bridge = controller(false);
    bridge.trigger_mirror();
    assert!(!bridge.mirror_wants_bus());
}

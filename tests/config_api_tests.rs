use pvgate::api::{ConfigApi, ConfigBackend, Method};
use pvgate::clock::{ManualRtc, NoTimeSource};
use pvgate::config::{ConfigStore, DeviceRole, FileConfigStore, MemoryConfigStore, PersistedConfig, Tunables};
use pvgate::fault::FaultKind;
use pvgate::transport::SimulatedDevice;
use pvgate::GatewayAgent;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

type Agent = GatewayAgent<SimulatedDevice, SimulatedDevice>;

fn agent_with(store: Box<dyn ConfigStore + Send>) -> Agent {
    let mut agent = GatewayAgent::new(
        store,
        Tunables::default(),
        SimulatedDevice::inverter("inverter", 1_710_590_400),
        SimulatedDevice::new("peer"),
        Box::new(ManualRtc::new(1_710_590_400)),
        Box::new(NoTimeSource),
    )
    .with_local_address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)));
    agent.start(0).unwrap();
    agent
}

fn fresh_agent() -> Agent {
    agent_with(Box::new(MemoryConfigStore::default()))
}

fn temp_config(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("pvgate-{}-{}.json", name, std::process::id()))
}

#[test]
fn test_factory_token_bootstrap() {
    let mut agent = fresh_agent();

    let response = ConfigApi::route(
        &mut agent,
        Method::Post,
        "/api/config",
        None,
        r#"{"role":"Responder","token":"s3cret-token"}"#,
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.body["success"], true);
    assert!(agent.restart_requested());
    assert_eq!(agent.persisted().role, DeviceRole::Responder);
    assert_eq!(agent.persisted().token.as_str(), "s3cret-token");
}

#[test]
fn test_custom_token_required_after_bootstrap() {
    let mut agent = fresh_agent();
    let body = r#"{"token":"s3cret-token"}"#;
    assert!(ConfigApi::route(&mut agent, Method::Post, "/api/config", None, body).is_success());

    let change = r#"{"peer_address":"10.0.0.7"}"#;
    let missing = ConfigApi::route(&mut agent, Method::Post, "/api/config", None, change);
    assert_eq!(missing.status, 401);
    assert_eq!(missing.body["success"], false);

    let wrong = ConfigApi::route(&mut agent, Method::Post, "/api/config", Some("guess"), change);
    assert_eq!(wrong.status, 401);
    assert_eq!(agent.persisted().peer_address.as_str(), "172.168.99.100");

    let right = ConfigApi::route(&mut agent, Method::Post, "/api/config", Some("s3cret-token"), change);
    assert_eq!(right.status, 200);
    assert_eq!(agent.persisted().peer_address.as_str(), "10.0.0.7");
}

#[test]
fn test_token_never_returned() {
    let mut agent = fresh_agent();
    let response = ConfigApi::route(&mut agent, Method::Get, "/api/config", None, "");
    assert_eq!(response.status, 200);
    assert_ne!(response.body["token"], pvgate::config::FACTORY_TOKEN);
    assert_eq!(response.body["factory_token"], true);
    assert_eq!(response.body["role"], "Controller");
    assert_eq!(response.body["peer_address"], "172.168.99.100");
}

#[test]
fn test_invalid_input_rejected() {
    let mut agent = fresh_agent();

    let response = ConfigApi::route(&mut agent, Method::Post, "/api/config", None, r#"{"peer_address":"not-an-ip"}"#);
    assert_eq!(response.status, 400);

    let response = ConfigApi::route(&mut agent, Method::Post, "/api/config", None, r#"{"token":""}"#);
    assert_eq!(response.status, 400);

    let response = ConfigApi::route(&mut agent, Method::Post, "/api/config", None, "{role:");
    assert_eq!(response.status, 400);

    assert!(!agent.restart_requested());
    assert_eq!(agent.persisted(), &PersistedConfig::default());
}

#[test]
fn test_routes_and_not_found() {
    let mut agent = fresh_agent();

    assert_eq!(ConfigApi::route(&mut agent, Method::Get, "/api/nope", None, "").status, 404);
    assert_eq!(ConfigApi::route(&mut agent, Method::Other, "/api/config", None, "").status, 404);
    assert_eq!(ConfigApi::route(&mut agent, Method::Get, "/api/config/", None, "").status, 200);
    assert_eq!(ConfigApi::route(&mut agent, Method::Get, "/api/status?verbose=1", None, "").status, 200);

    let status = ConfigApi::route(&mut agent, Method::Get, "/api/status", None, "");
    assert_eq!(status.body["role"], "Controller");
    assert_eq!(status.body["local_address"], "192.168.1.20");
    assert_eq!(status.body["link_quality"], 0);

    let discover = ConfigApi::route(&mut agent, Method::Get, "/api/discover", None, "");
    assert_eq!(discover.body["identity"], "pvgate");
    assert_eq!(discover.body["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_save_failure_keeps_running_config() {
    let store = MemoryConfigStore {
        stored: None,
        fail_saves: true,
    };
    let mut agent = agent_with(Box::new(store));

    let response = ConfigApi::route(&mut agent, Method::Post, "/api/config", None, r#"{"role":"Responder"}"#);
    assert_eq!(response.status, 500);
    assert!(!agent.restart_requested());
    assert_eq!(agent.persisted().role, DeviceRole::Controller);
    assert_eq!(
        agent.telemetry().faults().count_of(FaultKind::PersistenceUnavailable),
        1
    );
}

#[test]
fn test_saved_config_survives_restart() {
    let path = temp_config("survives");
    let _ = std::fs::remove_file(&path);

    let mut agent = agent_with(Box::new(FileConfigStore::new(&path)));
    let response = ConfigApi::route(
        &mut agent,
        Method::Post,
        "/api/config",
        None,
        r#"{"role":"Responder","peer_address":"10.1.2.3"}"#,
    );
    assert!(response.is_success());

    let reloaded = FileConfigStore::new(&path).load().unwrap();
    assert_eq!(reloaded.role, DeviceRole::Responder);
    assert_eq!(reloaded.peer_address.as_str(), "10.1.2.3");

    let restarted = agent_with(Box::new(FileConfigStore::new(&path)));
    assert_eq!(restarted.role(), DeviceRole::Responder);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_corrupt_record_falls_back_to_defaults() {
    let path = temp_config("corrupt");
    std::fs::write(&path, "{ not json").unwrap();

    let agent = agent_with(Box::new(FileConfigStore::new(&path)));
    assert_eq!(agent.persisted(), &PersistedConfig::default());
    assert_eq!(
        agent.telemetry().faults().count_of(FaultKind::PersistenceUnavailable),
        1
    );
    let _ = std::fs::remove_file(&path);
}

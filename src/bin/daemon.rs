use axum::extract::State;
use axum::http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode, Uri};
use axum::{Json, Router};
use clap::{App, Arg, ArgMatches};
use pvgate::agent::GatewayAgent;
use pvgate::api::{bearer_from_header, ConfigApi, Method as ApiMethod};
use pvgate::clock::{NetworkTimeSource, NoTimeSource, SoftRtc};
use pvgate::config::{ConfigStore, DeviceRole, FileConfigStore, Tunables};
use pvgate::protocol::MAX_COMMAND_SIZE;
use pvgate::ntp::SntpClient;
use pvgate::telemetry::TelemetryCollector;
use pvgate::transport::modbus::{self, SerialSettings};
use pvgate::transport::{ChannelTransport, SimulatedDevice, Transport};
use serde_json::Value;
use std::error::Error;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LOOP_PERIOD_MS: u64 = 50;
const TELEMETRY_BROADCAST_BUFFER_SIZE: usize = 256;

type Shared<B, N> = Arc<Mutex<GatewayAgent<B, N>>>;

#[derive(Debug, Clone)]
struct DaemonSettings {
    config_path: PathBuf,
    tunables: Tunables,
    serial: SerialSettings,
    bind: IpAddr,
    advertise: IpAddr,
    http_port: u16,
    control_port: u16,
    ntp_server: Option<String>,
    simulate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown,
    Restart,
}

fn cli() -> App<'static, 'static> {
    App::new("pvgate-daemon")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Modbus RTU/TCP gateway and power-limit scheduler for PV inverters")
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("PATH")
                .default_value("pvgate.json")
                .help("Persisted gateway record"),
        )
        .arg(
            Arg::with_name("tunables")
                .long("tunables")
                .value_name("PATH")
                .help("JSON file overriding timing and range constants"),
        )
        .arg(
            Arg::with_name("serial")
                .long("serial")
                .value_name("DEVICE")
                .default_value("/dev/ttyUSB0")
                .help("RS-485 serial device"),
        )
        .arg(
            Arg::with_name("baud")
                .long("baud")
                .value_name("RATE")
                .default_value("9600"),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .default_value("0.0.0.0")
                .help("Address the HTTP, control and Modbus TCP listeners bind to"),
        )
        .arg(
            Arg::with_name("advertise")
                .long("advertise")
                .value_name("ADDR")
                .help("Local address reported by status and discovery"),
        )
        .arg(
            Arg::with_name("modbus-port")
                .long("modbus-port")
                .value_name("PORT")
                .help("Modbus TCP port [default: 502]"),
        )
        .arg(
            Arg::with_name("http-port")
                .long("http-port")
                .value_name("PORT")
                .default_value("80"),
        )
        .arg(
            Arg::with_name("control-port")
                .long("control-port")
                .value_name("PORT")
                .default_value("8080"),
        )
        .arg(
            Arg::with_name("ntp-server")
                .long("ntp-server")
                .value_name("HOST:PORT")
                .default_value("pool.ntp.org:123")
                .help("Network time server, or \"none\""),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Use an in-process inverter instead of the serial line and peer"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .value_name("FILTER")
                .default_value("info"),
        )
}

fn parse_arg<T>(matches: &ArgMatches<'_>, name: &str) -> Result<Option<T>, Box<dyn Error>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    matches
        .value_of(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| -> Box<dyn Error> { format!("invalid --{} {:?}: {}", name, raw, e).into() })
        })
        .transpose()
}

impl DaemonSettings {
    fn from_matches(matches: &ArgMatches<'_>) -> Result<Self, Box<dyn Error>> {
        let mut tunables = match matches.value_of("tunables") {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => Tunables::default(),
        };
        if let Some(port) = parse_arg::<u16>(matches, "modbus-port")? {
            tunables.modbus_tcp_port = port;
        }

        let bind = parse_arg::<IpAddr>(matches, "bind")?.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let advertise = match parse_arg::<IpAddr>(matches, "advertise")? {
            Some(address) => address,
            None if !bind.is_unspecified() => bind,
            None => outbound_address().unwrap_or(bind),
        };
        let ntp_server = matches
            .value_of("ntp-server")
            .filter(|server| !server.eq_ignore_ascii_case("none"))
            .map(ToString::to_string);

        Ok(Self {
            config_path: PathBuf::from(matches.value_of("config").unwrap_or("pvgate.json")),
            tunables,
            serial: SerialSettings {
                path: matches.value_of("serial").unwrap_or("/dev/ttyUSB0").to_string(),
                baud_rate: parse_arg::<u32>(matches, "baud")?.unwrap_or(9600),
            },
            bind,
            advertise,
            http_port: parse_arg::<u16>(matches, "http-port")?.unwrap_or(80),
            control_port: parse_arg::<u16>(matches, "control-port")?.unwrap_or(8080),
            ntp_server,
            simulate: matches.is_present("simulate"),
        })
    }
}

/// Address of the interface that routes outward. No packet is sent.
fn outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn host_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches = cli().get_matches();
    let settings = DaemonSettings::from_matches(&matches)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(matches.value_of("log-level").unwrap_or("info")))
        .init();

    info!(
        "pvgate {} starting (config {}, {})",
        env!("CARGO_PKG_VERSION"),
        settings.config_path.display(),
        if settings.simulate { "simulated inverter" } else { "hardware" }
    );

    let (telemetry_tx, _) = broadcast::channel(TELEMETRY_BROADCAST_BUFFER_SIZE);

    loop {
        let role = match FileConfigStore::new(&settings.config_path).load() {
            Ok(record) => record.role,
            Err(e) => {
                warn!("cannot read {}: {}", settings.config_path.display(), e);
                DeviceRole::Controller
            }
        };

        let mut workers = Vec::new();
        let time_source = spawn_time_source(&settings, &mut workers);
        let exit = if settings.simulate {
            let epoch = u32::try_from(host_epoch()).unwrap_or(u32::MAX);
            let bus = SimulatedDevice::inverter("inverter", epoch);
            let net = SimulatedDevice::new("peer");
            run_gateway(&settings, bus, net, time_source, telemetry_tx.clone()).await?
        } else {
            let (bus, net) = spawn_hardware(role, &settings, &mut workers);
            run_gateway(&settings, bus, net, time_source, telemetry_tx.clone()).await?
        };

        for worker in workers {
            worker.abort();
        }
        match exit {
            Exit::Shutdown => break,
            Exit::Restart => info!("restarting with the saved configuration"),
        }
    }

    info!("pvgate stopped");
    Ok(())
}

fn spawn_time_source(
    settings: &DaemonSettings,
    workers: &mut Vec<JoinHandle<()>>,
) -> Box<dyn NetworkTimeSource + Send> {
    match &settings.ntp_server {
        Some(server) => {
            let timeout = Duration::from_millis(settings.tunables.network_time_timeout_ms);
            let (client, worker) = SntpClient::spawn(server.clone(), timeout, settings.tunables.utc_offset_s);
            workers.push(worker);
            Box::new(client)
        }
        None => Box::new(NoTimeSource),
    }
}

fn spawn_hardware(
    role: DeviceRole,
    settings: &DaemonSettings,
    workers: &mut Vec<JoinHandle<()>>,
) -> (ChannelTransport, ChannelTransport) {
    let unit = settings.tunables.device_unit;
    let timeout = Duration::from_millis(settings.tunables.device_step_timeout_ms);
    match role {
        DeviceRole::Controller => {
            let (bus, bus_worker) = ChannelTransport::pair("rtu-client");
            workers.push(modbus::spawn_rtu_client(settings.serial.clone(), unit, bus_worker, timeout));
            let (net, net_worker) = ChannelTransport::pair("tcp-client");
            workers.push(modbus::spawn_tcp_client(unit, net_worker, timeout));
            (bus, net)
        }
        DeviceRole::Responder => {
            let (bus, bus_worker) = ChannelTransport::pair("rtu-server");
            workers.push(modbus::spawn_rtu_server(settings.serial.clone(), unit, bus_worker));
            let (net, net_worker) = ChannelTransport::pair("tcp-server");
            let bind = SocketAddr::new(settings.bind, settings.tunables.modbus_tcp_port);
            workers.push(modbus::spawn_tcp_server(bind, net_worker));
            (bus, net)
        }
    }
}

async fn run_gateway<B, N>(
    settings: &DaemonSettings,
    bus: B,
    net: N,
    time_source: Box<dyn NetworkTimeSource + Send>,
    telemetry_tx: broadcast::Sender<String>,
) -> Result<Exit, Box<dyn Error>>
where
    B: Transport + Send + 'static,
    N: Transport + Send + 'static,
{
    let store = Box::new(FileConfigStore::new(&settings.config_path));
    let rtc = Box::new(SoftRtc::new(settings.tunables.utc_offset_s));
    let mut agent = GatewayAgent::new(store, settings.tunables.clone(), bus, net, rtc, time_source)
        .with_local_address(settings.advertise);
    agent.start(0)?;
    let agent: Shared<B, N> = Arc::new(Mutex::new(agent));

    let http_addr = SocketAddr::new(settings.bind, settings.http_port);
    let http_agent = Arc::clone(&agent);
    let http_server = tokio::spawn(async move {
        if let Err(e) = serve_http(http_agent, http_addr).await {
            error!("HTTP server error: {}", e);
        }
    });

    let control_addr = SocketAddr::new(settings.bind, settings.control_port);
    let control_agent = Arc::clone(&agent);
    let control_tx = telemetry_tx.clone();
    let control_server = tokio::spawn(async move {
        if let Err(e) = start_control_server(control_agent, control_addr, control_tx).await {
            error!("control server error: {}", e);
        }
    });

    let started = Instant::now();
    let mut interval = time::interval(Duration::from_millis(LOOP_PERIOD_MS));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let exit = loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => break Exit::Shutdown,
        }
        let now_ms = started.elapsed().as_millis() as u64;

        let (events, restart) = {
            let mut agent_guard = agent.lock().await;
            agent_guard.step(now_ms);
            (agent_guard.drain_events(), agent_guard.restart_requested())
        };

        for event in events {
            match TelemetryCollector::serialize_event(&event) {
                // No subscribers is not an error.
                Ok(line) => {
                    let _ = telemetry_tx.send(line);
                }
                Err(e) => warn!("cannot serialize status event: {}", e),
            }
        }

        if restart {
            break Exit::Restart;
        }
    };

    agent.lock().await.stop();
    http_server.abort();
    control_server.abort();
    Ok(exit)
}

async fn serve_http<B, N>(agent: Shared<B, N>, addr: SocketAddr) -> Result<(), Box<dyn Error + Send + Sync>>
where
    B: Transport + Send + 'static,
    N: Transport + Send + 'static,
{
    let app = Router::new().fallback(handle_http::<B, N>).with_state(agent);
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP config surface on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_http<B, N>(
    State(agent): State<Shared<B, N>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>)
where
    B: Transport + Send + 'static,
    N: Transport + Send + 'static,
{
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let bearer = bearer_from_header(authorization);
    let response = {
        let mut agent_guard = agent.lock().await;
        ConfigApi::route(&mut *agent_guard, ApiMethod::parse(method.as_str()), uri.path(), bearer, &body)
    };
    info!("{} {} -> {}", method, uri.path(), response.status);
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body))
}

async fn start_control_server<B, N>(
    agent: Shared<B, N>,
    addr: SocketAddr,
    telemetry_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn Error + Send + Sync>>
where
    B: Transport + Send + 'static,
    N: Transport + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("control port listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("control client connected: {}", peer);
                let client_agent = Arc::clone(&agent);
                let client_telemetry_rx = telemetry_tx.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_agent, client_telemetry_rx).await {
                        warn!("control client {} error: {}", peer, e);
                    }
                    info!("control client {} disconnected", peer);
                });
            }
            Err(e) => error!("failed to accept control connection: {}", e),
        }
    }
}

async fn handle_client<B, N>(
    stream: TcpStream,
    agent: Shared<B, N>,
    mut telemetry_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn Error + Send + Sync>>
where
    B: Transport + Send + 'static,
    N: Transport + Send + 'static,
{
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let telemetry_writer = Arc::clone(&writer);
    let telemetry_task = tokio::spawn(async move {
        loop {
            let line = match telemetry_rx.recv().await {
                Ok(line) => line,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("control client lagging, {} status events skipped", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let mut writer_guard = telemetry_writer.lock().await;
            if writer_guard.write_all(line.as_bytes()).await.is_err()
                || writer_guard.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        match read_control_line(&mut buf_reader, &mut line).await? {
            ControlLine::Complete => {}
            ControlLine::Closed => break,
            ControlLine::TooLong => {
                warn!("control line longer than {} bytes, closing client", MAX_COMMAND_SIZE);
                let reply = serde_json::json!({
                    "id": 0,
                    "timestamp": host_epoch() * 1000,
                    "status": "InvalidCommand",
                    "message": "Message exceeds buffer size",
                })
                .to_string();
                let mut writer_guard = writer.lock().await;
                writer_guard.write_all(reply.as_bytes()).await?;
                writer_guard.write_all(b"\n").await?;
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let reply = {
            let mut agent_guard = agent.lock().await;
            agent_guard.handle_line(trimmed)
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!("rejected control line: {}", e);
                serde_json::json!({
                    "id": 0,
                    "timestamp": host_epoch() * 1000,
                    "status": "InvalidCommand",
                    "message": format!("Invalid command format: {}", e),
                })
                .to_string()
            }
        };

        let mut writer_guard = writer.lock().await;
        writer_guard.write_all(reply.as_bytes()).await?;
        writer_guard.write_all(b"\n").await?;
    }

    telemetry_task.abort();
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ControlLine {
    Complete,
    Closed,
    TooLong,
}

/// Reads one control line into `line`, never buffering more than
/// `MAX_COMMAND_SIZE` bytes plus the newline.
async fn read_control_line<R>(reader: &mut R, line: &mut String) -> io::Result<ControlLine>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let limit = MAX_COMMAND_SIZE as u64 + 1;
    let read = (&mut *reader).take(limit).read_line(line).await?;
    if read == 0 {
        return Ok(ControlLine::Closed);
    }
    if read as u64 == limit && !line.ends_with('\n') {
        return Ok(ControlLine::TooLong);
    }
    Ok(ControlLine::Complete)
}

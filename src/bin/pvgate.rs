use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use serde_json::{json, Value};
use std::error::Error;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches = App::new("pvgate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Operator console for the pvgate inverter gateway")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Gateway host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Gateway control port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("Check that the gateway answers"))
        .subcommand(SubCommand::with_name("status").about("Role, clock, links, power and bridge counters"))
        .subcommand(SubCommand::with_name("discover").about("Identity and address of the gateway"))
        .subcommand(SubCommand::with_name("program").about("Calendar program currently in force"))
        .subcommand(SubCommand::with_name("sync-time").about("Run a time reconciliation now"))
        .subcommand(SubCommand::with_name("evaluate").about("Re-evaluate the calendar now"))
        .subcommand(
            SubCommand::with_name("config")
                .about("Persisted gateway record")
                .subcommand(SubCommand::with_name("get").about("Show the record (token redacted)"))
                .subcommand(
                    SubCommand::with_name("set")
                        .about("Change the record; the gateway restarts on success")
                        .arg(
                            Arg::with_name("role")
                                .long("role")
                                .takes_value(true)
                                .possible_values(&["controller", "responder"]),
                        )
                        .arg(Arg::with_name("token").long("token").takes_value(true).help("New security token"))
                        .arg(
                            Arg::with_name("peer")
                                .long("peer")
                                .takes_value(true)
                                .help("Peer gateway IPv4 address, empty to clear"),
                        )
                        .arg(
                            Arg::with_name("bearer")
                                .long("bearer")
                                .takes_value(true)
                                .help("Current token (not needed while the factory token is set)"),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Follow the status event stream")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Monitor duration in seconds (default: infinite)")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "pvgate operator console".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    match matches.subcommand() {
        ("ping", _) => {
            let response = send_command(host, port, create_command(json!("Ping"))).await?;
            print_command_result("ping", &response, format);
        }
        ("status", _) => {
            let response = send_command(host, port, create_command(json!("Status"))).await?;
            print_status(&response, format);
        }
        ("discover", _) => {
            let response = send_command(host, port, create_command(json!("Discover"))).await?;
            print_data("Gateway", &response, format);
        }
        ("program", _) => {
            let response = send_command(host, port, create_command(json!("ActiveProgram"))).await?;
            print_program(&response, format);
        }
        ("sync-time", _) => {
            let response = send_command(host, port, create_command(json!("TriggerTimeSync"))).await?;
            print_command_result("time sync", &response, format);
        }
        ("evaluate", _) => {
            let response = send_command(host, port, create_command(json!("TriggerEvaluation"))).await?;
            print_command_result("evaluation", &response, format);
        }
        ("config", Some(sub_matches)) => handle_config(sub_matches, host, port, format).await?,
        ("monitor", Some(sub_matches)) => {
            let duration = sub_matches
                .value_of("duration")
                .map(str::parse::<u64>)
                .transpose()?
                .map(Duration::from_secs);
            monitor_events(host, port, format, duration).await?;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Test connection", "pvgate ping".bright_cyan());
            println!("  {} Gateway status", "pvgate status".bright_cyan());
            println!("  {} Follow status events", "pvgate monitor".bright_cyan());
        }
    }

    Ok(())
}

async fn handle_config(matches: &ArgMatches<'_>, host: &str, port: u16, format: &str) -> Result<(), Box<dyn Error>> {
    match matches.subcommand() {
        ("get", _) => {
            let response = send_command(host, port, create_command(json!("GetConfig"))).await?;
            print_data("Configuration", &response, format);
        }
        ("set", Some(set)) => {
            let mut update = serde_json::Map::new();
            if let Some(role) = set.value_of("role") {
                let role = if role == "responder" { "Responder" } else { "Controller" };
                update.insert("role".into(), json!(role));
            }
            if let Some(token) = set.value_of("token") {
                update.insert("token".into(), json!(token));
            }
            if let Some(peer) = set.value_of("peer") {
                update.insert("peer_address".into(), json!(peer));
            }
            if update.is_empty() {
                return Err("nothing to change: pass --role, --token or --peer".into());
            }
            let command = create_command(json!({
                "SetConfig": { "bearer": set.value_of("bearer"), "update": update }
            }));
            let response = send_command(host, port, command).await?;
            print_command_result("configuration", &response, format);
        }
        _ => println!("{}", "Use 'pvgate config get' or 'pvgate config set'".yellow()),
    }
    Ok(())
}

fn create_command(command_type: Value) -> String {
    json!({
        "id": (current_timestamp() % u64::from(u32::MAX)).max(1),
        "timestamp": current_timestamp(),
        "command_type": command_type,
    })
    .to_string()
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Send one command line and wait for the response with the same id. Status
/// events that arrive in between are skipped.
async fn send_command(host: &str, port: u16, command: String) -> Result<String, Box<dyn Error>> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to gateway at {}", "x".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Gateway is not running. Start it with:", "!".yellow());
                eprintln!("   {}", "pvgate-daemon --simulate".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "!".yellow(), e.to_string().bright_red());
            }
            return Err(e.into());
        }
    };
    let id = serde_json::from_str::<Value>(&command)?["id"].clone();

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let exchange = async {
        writer.write_all(command.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        while let Some(line) = lines.next_line().await? {
            let Ok(parsed) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if parsed.get("event").is_none() && (parsed["id"] == id || parsed["id"] == 0) {
                return Ok(line);
            }
        }
        Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "gateway closed connection"))
    };

    match tokio::time::timeout(COMMAND_TIMEOUT, exchange).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} Command timed out after 5 seconds", "!".yellow());
            Err("Command timeout".into())
        }
    }
}

fn print_command_result(action: &str, response: &str, format: &str) {
    match format {
        "json" => println!("{}", response),
        "compact" => {
            let status = serde_json::from_str::<Value>(response)
                .ok()
                .and_then(|v| v["status"].as_str().map(ToString::to_string))
                .unwrap_or_else(|| "Unknown".to_string());
            println!("{}", status);
        }
        _ => {
            let Ok(parsed) = serde_json::from_str::<Value>(response) else {
                println!("{} {}", "?".blue(), response);
                return;
            };
            let status = parsed["status"].as_str().unwrap_or("Unknown");
            let message = parsed["message"].as_str().unwrap_or("");
            match status {
                "Success" => println!("{} {} {}", "ok".green(), action.bright_white(), message.bright_green()),
                "Acknowledged" => println!("{} {} {}", "->".cyan(), action.bright_white(), message.bright_cyan()),
                "Unauthorized" => {
                    println!("{} {} rejected: {}", "x".red(), action.bright_white(), message.bright_red());
                    println!("{} Pass the current token with {}", "!".yellow(), "--bearer".bright_cyan());
                }
                _ => println!("{} {} {}: {}", "x".red(), action.bright_white(), status.bright_red(), message),
            }
        }
    }
}

fn print_data(title: &str, response: &str, format: &str) {
    if format == "json" {
        println!("{}", response);
        return;
    }
    let Ok(parsed) = serde_json::from_str::<Value>(response) else {
        println!("{}", response);
        return;
    };
    let Some(data) = parsed.get("data").and_then(Value::as_object) else {
        print_command_result(title, response, format);
        return;
    };
    println!("{}", title.bright_blue().bold());
    for (key, value) in data {
        println!("  {:<16} {}", format!("{}:", key).bright_white(), value);
    }
}

fn print_status(response: &str, format: &str) {
    if format != "table" {
        print_data("Status", response, format);
        return;
    }
    let Ok(parsed) = serde_json::from_str::<Value>(response) else {
        println!("{}", response);
        return;
    };
    let data = &parsed["data"];
    if data.is_null() {
        print_command_result("status", response, format);
        return;
    }
    let flag = |v: &Value| if v.as_bool().unwrap_or(false) { "UP".bright_green() } else { "DOWN".bright_red() };

    println!("{}", "Gateway Status".bright_blue().bold());
    println!("{}", "==============".bright_blue());
    println!("{:<14} {}", "Role:".bright_white(), data["role"].as_str().unwrap_or("?").bright_cyan());
    println!("{:<14} {} s", "Uptime:".bright_white(), data["uptime_ms"].as_u64().unwrap_or(0) / 1000);
    println!("{:<14} {}", "Clock epoch:".bright_white(), data["clock_epoch"]);
    println!("{:<14} {}", "Bus link:".bright_white(), flag(&data["link"]["bus"]));
    println!("{:<14} {}", "Network link:".bright_white(), flag(&data["link"]["network"]));
    match data["power"]["kw"].as_f64() {
        Some(kw) => println!("{:<14} {:.3} kW", "Power:".bright_white(), kw),
        None => println!("{:<14} {}", "Power:".bright_white(), "stale".yellow()),
    }
    match data["active_program"].as_u64() {
        Some(id) => println!("{:<14} {:#04x}", "Program:".bright_white(), id),
        None => println!("{:<14} {}", "Program:".bright_white(), "none yet".dimmed()),
    }
    let bridge = &data["bridge"];
    println!(
        "{:<14} issued {} / ok {} / failed {} / abandoned {}",
        "Bridge:".bright_white(),
        bridge["issued"],
        bridge["succeeded"],
        bridge["failed"],
        bridge["abandoned"]
    );
    if let Some(fault) = data["last_fault"].as_object() {
        println!(
            "{:<14} {} {}",
            "Last fault:".bright_white(),
            fault.get("kind").and_then(Value::as_str).unwrap_or("?").bright_red(),
            fault.get("detail").and_then(Value::as_str).unwrap_or("")
        );
    }
}

fn print_program(response: &str, format: &str) {
    if format != "table" {
        print_data("Program", response, format);
        return;
    }
    let Ok(parsed) = serde_json::from_str::<Value>(response) else {
        println!("{}", response);
        return;
    };
    let data = &parsed["data"];
    let active = &data["active"];
    if active.is_null() {
        println!("{}", "No evaluation has run yet".yellow());
        return;
    }
    let program = &active["program"];
    println!("{}", "Active Program".bright_blue().bold());
    println!("  {:<10} {:#04x}", "id:", program["id"].as_u64().unwrap_or(0));
    println!("  {:<10} {} - {}", "window:", hhmm(&program["start"]), hhmm(&program["end"]));
    println!("  {:<10} {} W", "power:", program["power_w"]);
    println!("  {:<10} {}", "matched:", active["matched"]);
    println!("  {:<10} {}", "desired:", data["desired"]);
    println!("  {:<10} {}", "read:", data["last_read"]);
}

fn hhmm(time: &Value) -> String {
    format!(
        "{:02}:{:02}",
        time["hour"].as_u64().unwrap_or(0),
        time["minute"].as_u64().unwrap_or(0)
    )
}

async fn monitor_events(host: &str, port: u16, format: &str, duration: Option<Duration>) -> Result<(), Box<dyn Error>> {
    let stream = TcpStream::connect((host, port)).await?;
    let mut lines = BufReader::new(stream).lines();

    if format == "table" {
        println!("{}", "seq     time(s)  event".bright_white());
    }

    let follow = async {
        while let Some(line) = lines.next_line().await? {
            match format {
                "json" => println!("{}", line),
                _ => {
                    let Ok(event) = serde_json::from_str::<Value>(&line) else {
                        continue;
                    };
                    print_event(&event, format == "compact");
                }
            }
        }
        Ok::<(), std::io::Error>(())
    };

    match duration {
        Some(limit) => {
            if tokio::time::timeout(limit, follow).await.is_err() {
                println!("{}", "monitor finished".dimmed());
            }
        }
        None => follow.await?,
    }
    Ok(())
}

fn print_event(event: &Value, compact: bool) {
    let kind = event["event"].as_str().unwrap_or("?");
    let detail = match kind {
        "power" => match event["kw"].as_f64() {
            Some(kw) => format!("{:.3} kW", kw).bright_green(),
            None => "stale".yellow(),
        },
        "time_synced" => format!("{} from {}", event["epoch"], event["source"]).bright_green(),
        "time_sync_failed" => event["reason"].as_str().unwrap_or("").bright_red(),
        "program_applied" => format!(
            "program {:#04x} value {} written {}",
            event["program_id"].as_u64().unwrap_or(0),
            event["value"],
            event["written"]
        )
        .bright_cyan(),
        "program_failed" => format!(
            "program {:#04x}: {}",
            event["program_id"].as_u64().unwrap_or(0),
            event["reason"].as_str().unwrap_or("")
        )
        .bright_red(),
        "fault" => format!("{} {}", event["kind"], event["detail"].as_str().unwrap_or("")).red(),
        "link" => format!("bus {} network {}", event["bus"], event["network"]).normal(),
        _ => event.to_string().normal(),
    };
    if compact {
        println!("[{}] {} {}", event["at_ms"].as_u64().unwrap_or(0) / 1000, kind, detail);
    } else {
        println!(
            "{:<7} {:>8}  {:<18} {}",
            event["sequence_number"],
            event["at_ms"].as_u64().unwrap_or(0) / 1000,
            kind.bright_white(),
            detail
        );
    }
}

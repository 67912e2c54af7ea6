use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub const TOKEN_CAPACITY: usize = 32;
pub const PEER_ADDRESS_CAPACITY: usize = 15;

/// Token shipped with every unit. While it is still persisted, the config
/// surface accepts a new token without checking the bearer.
pub const FACTORY_TOKEN: &str = "default_token_123456789012345678";
pub const FACTORY_PEER_ADDRESS: &str = "172.168.99.100";

const_assert!(FACTORY_TOKEN.len() == TOKEN_CAPACITY);
const_assert!(FACTORY_PEER_ADDRESS.len() <= PEER_ADDRESS_CAPACITY);

pub type Token = ArrayString<TOKEN_CAPACITY>;
pub type PeerAddress = ArrayString<PEER_ADDRESS_CAPACITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    /// Bus controller and network client: polls the inverter, pushes to the peer.
    Controller,
    /// Bus responder and network server: serves the register image.
    Responder,
}

impl core::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeviceRole::Controller => write!(f, "controller"),
            DeviceRole::Responder => write!(f, "responder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error("token must be 1..=32 printable characters")]
    InvalidToken,
    #[error("peer address must be an IPv4 address of at most 15 characters")]
    InvalidPeerAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub role: DeviceRole,
    pub token: Token,
    pub peer_address: PeerAddress,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        let mut token = Token::new();
        token.push_str(FACTORY_TOKEN);
        let mut peer_address = PeerAddress::new();
        peer_address.push_str(FACTORY_PEER_ADDRESS);
        Self {
            role: DeviceRole::Controller,
            token,
            peer_address,
        }
    }
}

/// Fields accepted by a configuration change. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub role: Option<DeviceRole>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub peer_address: Option<String>,
}

impl PersistedConfig {
    pub fn has_factory_token(&self) -> bool {
        self.token.as_str() == FACTORY_TOKEN
    }

    pub fn peer_ip(&self) -> Option<Ipv4Addr> {
        self.peer_address.parse().ok()
    }

    /// Validated copy with `update` applied.
    pub fn apply(&self, update: &ConfigUpdate) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(role) = update.role {
            next.role = role;
        }
        if let Some(token) = &update.token {
            next.token = parse_token(token)?;
        }
        if let Some(address) = &update.peer_address {
            next.peer_address = parse_peer_address(address)?;
        }
        Ok(next)
    }
}

pub fn parse_token(raw: &str) -> Result<Token, ConfigError> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ConfigError::InvalidToken);
    }
    Token::from(raw).map_err(|_| ConfigError::InvalidToken)
}

/// Empty clears the peer.
pub fn parse_peer_address(raw: &str) -> Result<PeerAddress, ConfigError> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.parse::<Ipv4Addr>().is_err() {
        return Err(ConfigError::InvalidPeerAddress);
    }
    PeerAddress::from(raw).map_err(|_| ConfigError::InvalidPeerAddress)
}

/// Timing and range constants of the control loop. Defaults are the values
/// the gateway ships with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub device_unit: u8,
    pub modbus_tcp_port: u16,
    pub reconnect_interval_ms: u64,
    pub mirror_period_ms: u64,
    pub device_step_timeout_ms: u64,
    pub network_time_timeout_ms: u64,
    pub network_time_retries: u8,
    pub verify_tolerance_s: u64,
    pub time_sync_period_s: u64,
    pub unix_min: u64,
    pub unix_max: u64,
    /// Applied to network (UTC) time to obtain the inverter's local epoch.
    pub utc_offset_s: i64,
    pub program_retries: u8,
    pub minute_check_period_ms: u64,
    pub rated_power_w: u32,
    pub power_poll_period_ms: u64,
    pub link_health_window_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            device_unit: 1,
            modbus_tcp_port: 502,
            reconnect_interval_ms: 5000,
            mirror_period_ms: 1000,
            device_step_timeout_ms: 800,
            network_time_timeout_ms: 3000,
            network_time_retries: 1,
            verify_tolerance_s: 2,
            time_sync_period_s: 600,
            // 2000-01-01 00:00:00 .. 2068-12-31 23:59:59
            unix_min: 946_684_800,
            unix_max: 3_124_223_999,
            utc_offset_s: 0,
            program_retries: 2,
            minute_check_period_ms: 1000,
            rated_power_w: 75_000,
            power_poll_period_ms: 5000,
            link_health_window_ms: 30_000,
        }
    }
}

pub trait ConfigStore {
    fn load(&mut self) -> Result<PersistedConfig, ConfigError>;
    fn save(&mut self, config: &PersistedConfig) -> Result<(), ConfigError>;
}

/// JSON file on disk. A missing file is a first boot.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&mut self) -> Result<PersistedConfig, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                serde_json::from_str(&text).map_err(|e| ConfigError::Corrupt(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no stored config at {}, using factory defaults", self.path.display());
                Ok(PersistedConfig::default())
            }
            Err(e) => Err(ConfigError::Unavailable(e.to_string())),
        }
    }

    fn save(&mut self, config: &PersistedConfig) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::Unavailable(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text).map_err(|e| ConfigError::Unavailable(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ConfigError::Unavailable(e.to_string()))
    }
}

/// Volatile store for simulation runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    pub stored: Option<PersistedConfig>,
    pub fail_saves: bool,
}

impl ConfigStore for MemoryConfigStore {
    fn load(&mut self) -> Result<PersistedConfig, ConfigError> {
        Ok(self.stored.clone().unwrap_or_default())
    }

    fn save(&mut self, config: &PersistedConfig) -> Result<(), ConfigError> {
        if self.fail_saves {
            return Err(ConfigError::Unavailable("storage offline".into()));
        }
        self.stored = Some(config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_record() {
        let config = PersistedConfig::default();
        assert!(config.has_factory_token());
        assert_eq!(config.role, DeviceRole::Controller);
        assert_eq!(config.peer_ip(), Some(Ipv4Addr::new(172, 168, 99, 100)));
    }

    #[test]
    fn test_apply_validates_fields() {
        let config = PersistedConfig::default();
        let too_long = "x".repeat(TOKEN_CAPACITY + 1);
        let update = ConfigUpdate { token: Some(too_long), ..ConfigUpdate::default() };
        assert_eq!(config.apply(&update), Err(ConfigError::InvalidToken));

        let update = ConfigUpdate {
            peer_address: Some("10.0.0.256".into()),
            ..ConfigUpdate::default()
        };
        assert_eq!(config.apply(&update), Err(ConfigError::InvalidPeerAddress));

        let update = ConfigUpdate {
            role: Some(DeviceRole::Responder),
            token: Some("s3cret".into()),
            peer_address: Some(String::new()),
        };
        let next = config.apply(&update).unwrap();
        assert_eq!(next.role, DeviceRole::Responder);
        assert_eq!(next.token.as_str(), "s3cret");
        assert!(next.peer_ip().is_none());
    }

    #[test]
    fn test_tunables_defaults_partial_json() {
        let tunables: Tunables = serde_json::from_str(r#"{"reconnect_interval_ms": 9000}"#).unwrap();
        assert_eq!(tunables.reconnect_interval_ms, 9000);
        assert_eq!(tunables.device_step_timeout_ms, 800);
        assert_eq!(tunables.unix_max, 3_124_223_999);
    }
}

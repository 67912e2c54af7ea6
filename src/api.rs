use crate::config::{ConfigError, ConfigUpdate, DeviceRole, PersistedConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;
use tracing::{info, warn};

pub const IDENTITY: &str = "pvgate";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const REDACTED: &str = "********";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            _ => Method::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("missing or wrong bearer token")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("not found")]
    NotFound,
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Unauthorized => 401,
            ApiError::BadRequest(_) | ApiError::Config(ConfigError::InvalidToken | ConfigError::InvalidPeerAddress) => 400,
            ApiError::Config(_) => 500,
            ApiError::NotFound => 404,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(error: &ApiError) -> Self {
        Self {
            status: error.status(),
            body: json!({ "success": false, "message": error.to_string() }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub role: DeviceRole,
    pub local_address: IpAddr,
    /// Share of settled bridge transactions that succeeded, in percent.
    pub link_quality: u8,
    pub bus_link: bool,
    pub network_link: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    pub identity: String,
    pub version: String,
    pub local_address: IpAddr,
    pub role: DeviceRole,
}

/// What the configuration surface needs from the running gateway.
pub trait ConfigBackend {
    fn persisted(&self) -> &PersistedConfig;
    /// Save `next` and schedule the restart that applies it.
    fn commit(&mut self, next: PersistedConfig) -> Result<(), ConfigError>;
    fn status_report(&self) -> StatusReport;
}

pub fn discovery_info<K: ConfigBackend + ?Sized>(backend: &K) -> DiscoveryInfo {
    let report = backend.status_report();
    DiscoveryInfo {
        identity: IDENTITY.to_string(),
        version: VERSION.to_string(),
        local_address: report.local_address,
        role: report.role,
    }
}

/// Serialized record with the token replaced.
pub fn redacted_config(config: &PersistedConfig) -> Value {
    json!({
        "role": config.role,
        "token": REDACTED,
        "peer_address": config.peer_address.as_str(),
        "factory_token": config.has_factory_token(),
    })
}

/// Accepts the bearer when it matches the persisted token, or unconditionally
/// while the factory token is still persisted (first-run bootstrap).
pub fn authorize(config: &PersistedConfig, bearer: Option<&str>) -> Result<(), ApiError> {
    if config.has_factory_token() {
        return Ok(());
    }
    match bearer {
        Some(token) if token == config.token.as_str() => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// Value of an `Authorization: Bearer <token>` header.
pub fn bearer_from_header(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}

/// Apply a configuration change: authorize, validate, save. The caller's
/// backend schedules the restart when the save succeeded.
pub fn update_config<K: ConfigBackend + ?Sized>(
    backend: &mut K,
    bearer: Option<&str>,
    update: &ConfigUpdate,
) -> Result<(), ApiError> {
    let current = backend.persisted().clone();
    authorize(&current, bearer)?;
    if current.has_factory_token() {
        info!("accepting configuration under the factory token");
    }
    let next = current.apply(update)?;
    backend.commit(next).map_err(|e| {
        warn!("configuration not saved: {}", e);
        ApiError::from(e)
    })
}

pub struct ConfigApi;

impl ConfigApi {
    pub fn route<K: ConfigBackend + ?Sized>(
        backend: &mut K,
        method: Method,
        path: &str,
        bearer: Option<&str>,
        body: &str,
    ) -> ApiResponse {
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        match (method, path) {
            (Method::Get, "/api/config") => ApiResponse::ok(redacted_config(backend.persisted())),
            (Method::Post, "/api/config") => {
                let update = match serde_json::from_str::<ConfigUpdate>(body) {
                    Ok(update) => update,
                    Err(e) => return ApiResponse::error(&ApiError::BadRequest(e.to_string())),
                };
                match update_config(backend, bearer, &update) {
                    Ok(()) => ApiResponse::ok(json!({
                        "success": true,
                        "message": "configuration saved, restarting",
                    })),
                    Err(e) => ApiResponse::error(&e),
                }
            }
            (Method::Get, "/api/status") => match serde_json::to_value(backend.status_report()) {
                Ok(body) => ApiResponse::ok(body),
                Err(e) => ApiResponse::error(&ApiError::BadRequest(e.to_string())),
            },
            (Method::Get, "/api/discover") => match serde_json::to_value(discovery_info(backend)) {
                Ok(body) => ApiResponse::ok(body),
                Err(e) => ApiResponse::error(&ApiError::BadRequest(e.to_string())),
            },
            _ => ApiResponse::error(&ApiError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_header() {
        assert_eq!(bearer_from_header(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_from_header(Some("bearer  abc ")), Some("abc"));
        assert_eq!(bearer_from_header(Some("Basic abc")), None);
        assert_eq!(bearer_from_header(None), None);
    }

    #[test]
    fn test_factory_token_bootstraps() {
        let config = PersistedConfig::default();
        assert!(authorize(&config, None).is_ok());

        let custom = config
            .apply(&ConfigUpdate {
                token: Some("s3cret".into()),
                ..ConfigUpdate::default()
            })
            .unwrap();
        assert_eq!(authorize(&custom, None), Err(ApiError::Unauthorized));
        assert_eq!(authorize(&custom, Some("wrong")), Err(ApiError::Unauthorized));
        assert!(authorize(&custom, Some("s3cret")).is_ok());
    }

    #[test]
    fn test_redaction() {
        let body = redacted_config(&PersistedConfig::default());
        assert_eq!(body["token"], REDACTED);
        assert_eq!(body["peer_address"], "172.168.99.100");
    }

    #[test]
    fn test_error_status() {
        assert_eq!(ApiError::Unauthorized.status(), 401);
        assert_eq!(ApiError::from(ConfigError::InvalidToken).status(), 400);
        assert_eq!(ApiError::from(ConfigError::Unavailable("disk".into())).status(), 500);
        assert_eq!(ApiError::NotFound.status(), 404);
    }
}

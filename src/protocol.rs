use crate::config::ConfigUpdate;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_COMMAND_SIZE: usize = 512;
pub const MAX_RESPONSE_SIZE: usize = 4096;

pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;

/// One JSON line on the control port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    #[serde(default)]
    pub timestamp: u64,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandType {
    Ping,
    Status,
    GetConfig,
    SetConfig {
        #[serde(default)]
        bearer: Option<String>,
        update: ConfigUpdate,
    },
    Discover,
    ActiveProgram,
    TriggerTimeSync,
    TriggerEvaluation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp: u64,
    pub status: ResponseStatus,
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Error,
    InvalidCommand,
    Unauthorized,
    /// Accepted; the result shows up on the telemetry stream.
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Message exceeds buffer size")]
    MessageTooLarge,
    #[error("Serialization failed")]
    SerializationError,
    #[error("Invalid command")]
    InvalidCommand,
    #[error("Invalid parameter")]
    InvalidParameter,
}

#[derive(Debug)]
pub struct ProtocolHandler {
    command_counter: u32,
    response_buffer: ResponseBuffer,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            command_counter: 0,
            response_buffer: ArrayString::new(),
        }
    }

    pub fn parse_command(&mut self, json_str: &str) -> Result<Command, ProtocolError> {
        if json_str.len() > MAX_COMMAND_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        serde_json::from_str::<Command>(json_str).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn validate_command(&self, command: &Command) -> Result<(), ProtocolError> {
        if command.id == 0 {
            return Err(ProtocolError::InvalidCommand);
        }
        if let CommandType::SetConfig { update, .. } = &command.command_type {
            if update.role.is_none() && update.token.is_none() && update.peer_address.is_none() {
                return Err(ProtocolError::InvalidParameter);
            }
        }
        Ok(())
    }

    pub fn serialize_response(&mut self, response: &CommandResponse) -> Result<&str, ProtocolError> {
        self.response_buffer.clear();
        let json_str = serde_json::to_string(response).map_err(|_| ProtocolError::SerializationError)?;
        if json_str.len() > MAX_RESPONSE_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        self.response_buffer.push_str(&json_str);
        Ok(&self.response_buffer)
    }

    pub fn create_response(
        &self,
        command_id: u32,
        timestamp: u64,
        status: ResponseStatus,
        message: Option<&str>,
    ) -> CommandResponse {
        CommandResponse {
            id: command_id,
            timestamp,
            status,
            message: message.map(ToString::to_string),
            data: None,
        }
    }

    pub fn create_data_response(&self, command_id: u32, timestamp: u64, data: Value) -> CommandResponse {
        CommandResponse {
            data: Some(data),
            ..self.create_response(command_id, timestamp, ResponseStatus::Success, None)
        }
    }

    pub fn next_command_id(&mut self) -> u32 {
        self.command_counter = self.command_counter.wrapping_add(1);
        if self.command_counter == 0 {
            self.command_counter = 1;
        }
        self.command_counter
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceRole;

    #[test]
    fn test_parse_unit_variant() {
        let mut handler = ProtocolHandler::new();
        let command = handler
            .parse_command(r#"{"id":1,"command_type":"Ping"}"#)
            .unwrap();
        assert!(matches!(command.command_type, CommandType::Ping));
        assert_eq!(command.timestamp, 0);
    }

    #[test]
    fn test_parse_set_config() {
        let mut handler = ProtocolHandler::new();
        let line = r#"{"id":7,"command_type":{"SetConfig":{"bearer":"abc","update":{"role":"Responder"}}}}"#;
        let command = handler.parse_command(line).unwrap();
        match command.command_type {
            CommandType::SetConfig { bearer, update } => {
                assert_eq!(bearer.as_deref(), Some("abc"));
                assert_eq!(update.role, Some(DeviceRole::Responder));
                assert!(update.token.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejects_garbage_and_oversize() {
        let mut handler = ProtocolHandler::new();
        assert_eq!(handler.parse_command("not json").unwrap_err(), ProtocolError::InvalidJson);
        let huge = "x".repeat(MAX_COMMAND_SIZE + 1);
        assert_eq!(handler.parse_command(&huge).unwrap_err(), ProtocolError::MessageTooLarge);
    }

    #[test]
    fn test_validation() {
        let handler = ProtocolHandler::new();
        let zero = Command {
            id: 0,
            timestamp: 0,
            command_type: CommandType::Ping,
        };
        assert_eq!(handler.validate_command(&zero), Err(ProtocolError::InvalidCommand));
        let empty = Command {
            id: 3,
            timestamp: 0,
            command_type: CommandType::SetConfig {
                bearer: None,
                update: ConfigUpdate::default(),
            },
        };
        assert_eq!(handler.validate_command(&empty), Err(ProtocolError::InvalidParameter));
    }

    #[test]
    fn test_response_serialization() {
        let mut handler = ProtocolHandler::new();
        let response = handler.create_response(4, 10, ResponseStatus::Acknowledged, Some("queued"));
        let json = handler.serialize_response(&response).unwrap();
        assert!(json.contains("\"status\":\"Acknowledged\""));
        assert!(!json.contains("\"data\""));
    }
}

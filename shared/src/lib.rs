//! Wire protocol spoken between the kiosk command center and its clients.
//!
//! Requests are JSON objects naming a command plus its parameters; every
//! response, solicited or not, travels in the same [`Response`] envelope.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8081;
pub const WELCOME_MESSAGE: &str = "Connected to VR Command Center";
/// How long a client waits for the response to one of its requests.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Request fields that are envelope metadata rather than command parameters.
const ENVELOPE_FIELDS: [&str; 5] = ["command", "type", "id", "timestamp", "params"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("command must be a JSON object")]
    NotAnObject,
    #[error("missing command name")]
    MissingCommand,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// Commands understood by the command center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    LaunchGame,
    EndSession,
    PauseSession,
    ResumeSession,
    GetStatus,
    Heartbeat,
    GetGames,
    SubmitRating,
}

impl CommandName {
    pub const ALL: [CommandName; 8] = [
        CommandName::LaunchGame,
        CommandName::EndSession,
        CommandName::PauseSession,
        CommandName::ResumeSession,
        CommandName::GetStatus,
        CommandName::Heartbeat,
        CommandName::GetGames,
        CommandName::SubmitRating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::LaunchGame => "launchGame",
            CommandName::EndSession => "endSession",
            CommandName::PauseSession => "pauseSession",
            CommandName::ResumeSession => "resumeSession",
            CommandName::GetStatus => "getStatus",
            CommandName::Heartbeat => "heartbeat",
            CommandName::GetGames => "getGames",
            CommandName::SubmitRating => "submitRating",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownCommand(s.to_string()))
    }
}

/// Command parameters, as received on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Reads an identifier-like field: a non-empty string or an integer.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            _ => None,
        }
    }

    /// Reads an integer field, accepting strings that hold an integer.
    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// One inbound command.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: String,
    /// Opaque token echoed back in the response.
    pub id: Value,
    pub params: Params,
}

impl Request {
    pub fn new(command: impl Into<String>, id: impl Into<Value>) -> Self {
        Self {
            command: command.into(),
            id: id.into(),
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Parses one text frame.
    ///
    /// The command name comes from `command` (or `type`, as sent by the
    /// browser kiosk). Parameters are the remaining top-level fields merged
    /// with the optional `params` object, which wins on conflicts.
    pub fn parse(text: &str) -> Result<Request, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let command = ["command", "type"]
            .iter()
            .find_map(|key| match object.get(*key) {
                Some(Value::String(name)) if !name.trim().is_empty() => {
                    Some(name.trim().to_string())
                }
                _ => None,
            })
            .ok_or(ProtocolError::MissingCommand)?;

        let id = object.remove("id").unwrap_or(Value::Null);
        let nested = match object.remove("params") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let mut params: Map<String, Value> = object
            .into_iter()
            .filter(|(key, _)| !ENVELOPE_FIELDS.contains(&key.as_str()))
            .collect();
        params.extend(nested);

        Ok(Request {
            command,
            id,
            params: Params(params),
        })
    }

    /// Best-effort recovery of the request id from a frame that failed to parse.
    pub fn extract_id(text: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(text).ok()? {
            Value::Object(mut object) => object.remove("id").filter(|id| !id.is_null()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        let mut object = Map::new();
        object.insert("id".into(), self.id.clone());
        object.insert("command".into(), Value::String(self.command.clone()));
        object.insert("params".into(), Value::Object(self.params.0.clone()));
        object.insert("timestamp".into(), Value::from(timestamp_millis()));
        Value::Object(object).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Outbound envelope shared by replies, broadcasts and welcome messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Value,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
}

impl Response {
    pub fn success(id: Value, data: Value) -> Self {
        Self {
            id,
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
            timestamp: timestamp_millis(),
        }
    }

    pub fn error(id: Value, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::Error,
            data: None,
            error: Some(message.into()),
            timestamp: timestamp_millis(),
        }
    }

    /// Unsolicited status update carrying a freshly generated id.
    pub fn status_update(status: &AggregateStatus) -> Self {
        Self::success(
            Value::String(generate_message_id()),
            serde_json::json!({ "status": status }),
        )
    }

    pub fn welcome(status: &AggregateStatus) -> Self {
        Self::success(
            Value::String(generate_message_id()),
            serde_json::json!({ "status": status, "message": WELCOME_MESSAGE }),
        )
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// The aggregate status carried in `data.status`, if any.
    pub fn aggregate_status(&self) -> Option<AggregateStatus> {
        let status = self.data.as_ref()?.get("status")?;
        serde_json::from_value(status.clone()).ok()
    }

    pub fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref()?.get(key)
    }
}

/// Combined snapshot of game, timer and host resources.
///
/// Assembled from independently synchronised components, so one snapshot may
/// mix values from just before and just after a concurrent update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStatus {
    pub connected: bool,
    pub active_game: Option<String>,
    pub active_game_id: Option<String>,
    pub game_running: bool,
    pub is_paused: bool,
    pub time_remaining: u32,
    pub session_duration: u32,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub disk_space: f64,
}

/// A launchable title from the game catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameDescriptor {
    pub id: String,
    pub title: String,
    pub executable_path: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_url: String,
    pub min_duration_seconds: u32,
    pub max_duration_seconds: u32,
}

impl GameDescriptor {
    pub fn allows_duration(&self, seconds: u32) -> bool {
        (self.min_duration_seconds..=self.max_duration_seconds).contains(&seconds)
    }

    pub fn argument_list(&self) -> Vec<String> {
        self.arguments
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// Current Unix time in milliseconds.
pub fn timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}

/// Id for messages the server originates: `<unix-millis>-<8 hex chars>`.
pub fn generate_message_id() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{:08x}", timestamp_millis(), suffix)
}

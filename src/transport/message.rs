//! Wire messages.
//!
//! Requests travel as one JSON object per frame: `{"command": <name>, ...args}`.
//! Replies are JSON objects; the fields the device layer looks at are
//! `success`, `error_description`, `data`, `not_found` and `timed_out`. Any
//! other fields are carried through untouched.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// BCS command names and the argument keys they take.
pub mod commands {
    /// Connectivity probe, no arguments.
    pub const TEST_CONNECTION: &str = "TestConnection";
    /// Read analog input channels. Args: `chans`.
    pub const GET_FREE_RUN: &str = "GetFreeRun";
    /// Full motor status records. Args: `motors`.
    pub const GET_MOTOR_FULL: &str = "GetMotorFull";
    /// Command motors to goal positions. Args: `motors`, `goals`.
    pub const MOVE_MOTOR: &str = "MoveMotor";
    /// Halt motors. Args: `motors`.
    pub const STOP_MOTOR: &str = "StopMotor";

    /// Argument key for channel names.
    pub const ARG_CHANNELS: &str = "chans";
    /// Argument key for motor names.
    pub const ARG_MOTORS: &str = "motors";
    /// Argument key for motor goal positions.
    pub const ARG_GOALS: &str = "goals";

    /// Status record key holding the motor state object.
    pub const MOTOR_STATE: &str = "Motor State";
    /// Key inside the motor state that flags completion.
    pub const MOVE_COMPLETE: &str = "Move Complete";
    /// Status record key holding the raw motor position.
    pub const RAW_MOTOR_POSITION: &str = "Raw Motor Position";
}

/// A command plus its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    command: String,
    args: Map<String, Value>,
    targets: Vec<String>,
}

impl Request {
    /// A request with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Map::new(),
            targets: Vec::new(),
        }
    }

    /// Add an argument.
    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    /// Add a list of device names under `key`; they also label the request in
    /// logs and timeout errors.
    pub fn targets(mut self, key: &str, names: &[&str]) -> Self {
        self.targets = names.iter().map(|n| n.to_string()).collect();
        self.arg(key, names.to_vec())
    }

    /// `TestConnection`
    pub fn test_connection() -> Self {
        Self::new(commands::TEST_CONNECTION)
    }

    /// `GetFreeRun` for the given analog channels.
    pub fn get_free_run(channels: &[&str]) -> Self {
        Self::new(commands::GET_FREE_RUN).targets(commands::ARG_CHANNELS, channels)
    }

    /// `GetMotorFull` for the given motors.
    pub fn get_motor_full(motors: &[&str]) -> Self {
        Self::new(commands::GET_MOTOR_FULL).targets(commands::ARG_MOTORS, motors)
    }

    /// `MoveMotor` with one goal per motor.
    pub fn move_motor(motors: &[&str], goals: &[f64]) -> Self {
        Self::new(commands::MOVE_MOTOR)
            .targets(commands::ARG_MOTORS, motors)
            .arg(commands::ARG_GOALS, goals.to_vec())
    }

    /// `StopMotor` for the given motors.
    pub fn stop_motor(motors: &[&str]) -> Self {
        Self::new(commands::STOP_MOTOR).targets(commands::ARG_MOTORS, motors)
    }

    /// Command name.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Arguments, excluding the command name.
    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    /// Device names the request addresses.
    pub fn target_names(&self) -> &[String] {
        &self.targets
    }

    /// Encode as the JSON object sent on the wire.
    pub fn to_json(&self) -> Value {
        let mut object = self.args.clone();
        object.insert("command".to_string(), Value::String(self.command.clone()));
        Value::Object(object)
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.to_json()).map_err(|e| BridgeError::InvalidResponse {
            target: self.command.clone(),
            message: format!("failed to encode request: {e}"),
        })
    }

    /// Decode wire bytes back into a request. Used by servers.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| BridgeError::InvalidResponse {
            target: "request".into(),
            message: e.to_string(),
        })?;
        let Value::Object(mut args) = value else {
            return Err(BridgeError::InvalidResponse {
                target: "request".into(),
                message: "request is not a JSON object".into(),
            });
        };
        let command = match args.remove("command") {
            Some(Value::String(command)) => command,
            _ => {
                return Err(BridgeError::InvalidResponse {
                    target: "request".into(),
                    message: "missing 'command'".into(),
                })
            }
        };
        let targets = [commands::ARG_MOTORS, commands::ARG_CHANNELS]
            .iter()
            .find_map(|key| args.get(*key))
            .map(string_list)
            .unwrap_or_default();
        Ok(Self {
            command,
            args,
            targets,
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.command, self.targets.join(","))
    }
}

/// A decoded server reply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response(Map<String, Value>);

impl Response {
    /// Successful reply with no data.
    pub fn ok() -> Self {
        let mut fields = Map::new();
        fields.insert("success".into(), Value::Bool(true));
        Self(fields)
    }

    /// Failed reply with the given description.
    pub fn failure(description: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("success".into(), Value::Bool(false));
        fields.insert(
            "error_description".into(),
            Value::String(description.into()),
        );
        Self(fields)
    }

    /// Set the `data` records.
    pub fn with_data(mut self, data: Vec<Value>) -> Self {
        self.0.insert("data".into(), Value::Array(data));
        self
    }

    /// Set the `not_found` names.
    pub fn with_not_found(mut self, names: Vec<String>) -> Self {
        self.0.insert("not_found".into(), names.into());
        self
    }

    /// Set the `timed_out` names.
    pub fn with_timed_out(mut self, names: Vec<String>) -> Self {
        self.0.insert("timed_out".into(), names.into());
        self
    }

    /// `success` field; absent counts as failure.
    pub fn success(&self) -> bool {
        self.0.get("success").and_then(Value::as_bool).unwrap_or(false)
    }

    /// `error_description`, or a placeholder when the server sent none.
    pub fn error_description(&self) -> String {
        self.0
            .get("error_description")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown error")
            .to_string()
    }

    /// `data` records; absent counts as empty.
    pub fn data(&self) -> &[Value] {
        self.0
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Names the server reported as unknown.
    pub fn not_found(&self) -> Vec<String> {
        self.0.get("not_found").map(string_list).unwrap_or_default()
    }

    /// Names whose command timed out on the server.
    pub fn timed_out(&self) -> Vec<String> {
        self.0.get("timed_out").map(string_list).unwrap_or_default()
    }

    /// Raw field access.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(|e| BridgeError::InvalidResponse {
            target: "response".into(),
            message: e.to_string(),
        })
    }

    /// Decode wire bytes; `context` labels the error.
    pub fn decode(bytes: &[u8], context: &str) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| BridgeError::InvalidResponse {
            target: context.to_string(),
            message: e.to_string(),
        })
    }
}

// `not_found` is sometimes a list and sometimes a single string
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

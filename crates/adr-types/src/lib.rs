//! Shared vocabulary for the ADR bridge.
//!
//! Everything that crosses a crate boundary lives here: the registry variable
//! names, the decoded status stream, the outbound device commands and the
//! single error type used across the workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Values
// ────────────────────────────────────────────────────────────────────────────

/// Storage type of a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PvKind {
    Int,
    Float,
    Text,
}

impl fmt::Display for PvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvKind::Int => write!(f, "int"),
            PvKind::Float => write!(f, "float"),
            PvKind::Text => write!(f, "text"),
        }
    }
}

/// A scalar held by a registry slot.
///
/// Serialised untagged so that JSON `1` reads back as [`Value::Int`] and
/// `0.075` as [`Value::Float`].  `Int` must stay the first variant for that
/// to hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> PvKind {
        match self {
            Value::Int(_) => PvKind::Int,
            Value::Float(_) => PvKind::Float,
            Value::Text(_) => PvKind::Text,
        }
    }

    /// Numeric view; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(_) => None,
        }
    }

    /// Integer view; floats only when they carry no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Non-zero numbers and non-empty text are truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry variable names
// ────────────────────────────────────────────────────────────────────────────

/// Every variable the bridge publishes or listens to.
///
/// | Name | Kind | Unit | Written by |
/// |---|---|---|---|
/// | `TEMP` | float | K | status stream |
/// | `TEMP_SP` | float | K | operator (sends `set_temp_sp_k`) |
/// | `TEMP_SP_RB` | float | K | status stream |
/// | `TEMP_RMS_UK` | float | uK | status stream |
/// | `ALT_TEMP` | float | K | status stream |
/// | `HEATER_OUT` | float | | status stream |
/// | `STATE` | text | | status stream, on change |
/// | `CYCLE_UID` | text | | status stream, on change |
/// | `PAUSE` | int | | operator (sends `pausePID` / `resumePID`) |
/// | `START_CYCLE` | int | | operator (sends `start_mag_cycle`) |
/// | `LINK_OK` | int | | bridge, on change |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PvName {
    #[serde(rename = "TEMP")]
    Temp,
    #[serde(rename = "TEMP_SP")]
    TempSp,
    #[serde(rename = "TEMP_SP_RB")]
    TempSpRb,
    #[serde(rename = "TEMP_RMS_UK")]
    TempRmsUk,
    #[serde(rename = "ALT_TEMP")]
    AltTemp,
    #[serde(rename = "HEATER_OUT")]
    HeaterOut,
    #[serde(rename = "STATE")]
    State,
    #[serde(rename = "CYCLE_UID")]
    CycleUid,
    #[serde(rename = "PAUSE")]
    Pause,
    #[serde(rename = "START_CYCLE")]
    StartCycle,
    #[serde(rename = "LINK_OK")]
    LinkOk,
}

impl PvName {
    pub const ALL: [PvName; 11] = [
        PvName::Temp,
        PvName::TempSp,
        PvName::TempSpRb,
        PvName::TempRmsUk,
        PvName::AltTemp,
        PvName::HeaterOut,
        PvName::State,
        PvName::CycleUid,
        PvName::Pause,
        PvName::StartCycle,
        PvName::LinkOk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PvName::Temp => "TEMP",
            PvName::TempSp => "TEMP_SP",
            PvName::TempSpRb => "TEMP_SP_RB",
            PvName::TempRmsUk => "TEMP_RMS_UK",
            PvName::AltTemp => "ALT_TEMP",
            PvName::HeaterOut => "HEATER_OUT",
            PvName::State => "STATE",
            PvName::CycleUid => "CYCLE_UID",
            PvName::Pause => "PAUSE",
            PvName::StartCycle => "START_CYCLE",
            PvName::LinkOk => "LINK_OK",
        }
    }

    pub fn kind(self) -> PvKind {
        match self {
            PvName::State | PvName::CycleUid => PvKind::Text,
            PvName::Pause | PvName::StartCycle | PvName::LinkOk => PvKind::Int,
            _ => PvKind::Float,
        }
    }

    pub fn initial_value(self) -> Value {
        match self {
            PvName::TempSp => Value::Float(0.050),
            _ => match self.kind() {
                PvKind::Float => Value::Float(0.0),
                PvKind::Int => Value::Int(0),
                PvKind::Text => Value::Text(String::new()),
            },
        }
    }

    /// Operators may only write the three command triggers.
    pub fn is_writable(self) -> bool {
        matches!(self, PvName::TempSp | PvName::Pause | PvName::StartCycle)
    }

    pub fn doc(self) -> &'static str {
        match self {
            PvName::Temp => "temperature in K",
            PvName::TempSp => "temperature setpoint",
            PvName::TempSpRb => "temperature setpoint readback",
            PvName::TempRmsUk => "temperature rms stability in uK",
            PvName::AltTemp => "2nd channel temperature",
            PvName::HeaterOut => "heater",
            PvName::State => "ADR mode",
            PvName::CycleUid => "cycle UID",
            PvName::Pause => "pause PID loop",
            PvName::StartCycle => "start cryo cycle",
            PvName::LinkOk => "1 while the status stream is live",
        }
    }

    pub fn unit(self) -> Option<&'static str> {
        match self {
            PvName::Temp | PvName::TempSp | PvName::TempSpRb | PvName::AltTemp => Some("K"),
            PvName::TempRmsUk => Some("uK"),
            _ => None,
        }
    }
}

impl fmt::Display for PvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PvName {
    type Err = AdrError;

    /// Bare names only; prefixes are stripped by the registry that owns them.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PvName::ALL
            .into_iter()
            .find(|pv| pv.as_str() == s)
            .ok_or_else(|| AdrError::UnknownVariable(s.to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Status stream
// ────────────────────────────────────────────────────────────────────────────

/// A recognised field of a device status message.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusField {
    Temperature(f64),
    AltTemp(f64),
    Heater(f64),
    StdDev(f64),
    TempSpReadback(f64),
    State(String),
    Uid(String),
}

impl StatusField {
    /// Build a field from a message key, `Ok(None)` for unknown keys.
    pub fn from_entry(key: &str, raw: &serde_json::Value) -> Result<Option<Self>, AdrError> {
        let real = |ctor: fn(f64) -> StatusField| {
            raw.as_f64().map(ctor).ok_or_else(|| AdrError::TypeMismatch {
                name: key.to_string(),
                expected: PvKind::Float,
                found: raw.to_string(),
            })
        };
        let text = |ctor: fn(String) -> StatusField| {
            raw.as_str()
                .map(|s| ctor(s.to_string()))
                .ok_or_else(|| AdrError::TypeMismatch {
                    name: key.to_string(),
                    expected: PvKind::Text,
                    found: raw.to_string(),
                })
        };
        let field = match key {
            "temperature" => real(StatusField::Temperature)?,
            "alt_temp" => real(StatusField::AltTemp)?,
            "heater" => real(StatusField::Heater)?,
            "stddev" => real(StatusField::StdDev)?,
            "temp_sp_rb" => real(StatusField::TempSpReadback)?,
            "state" => text(StatusField::State)?,
            "uid" => text(StatusField::Uid)?,
            _ => return Ok(None),
        };
        Ok(Some(field))
    }

    /// Registry variable this field is written to.
    pub fn target(&self) -> PvName {
        match self {
            StatusField::Temperature(_) => PvName::Temp,
            StatusField::AltTemp(_) => PvName::AltTemp,
            StatusField::Heater(_) => PvName::HeaterOut,
            StatusField::StdDev(_) => PvName::TempRmsUk,
            StatusField::TempSpReadback(_) => PvName::TempSpRb,
            StatusField::State(_) => PvName::State,
            StatusField::Uid(_) => PvName::CycleUid,
        }
    }

    /// Only written when the value differs from what is stored.
    pub fn is_change_suppressed(&self) -> bool {
        matches!(self, StatusField::State(_) | StatusField::Uid(_))
    }

    pub fn value(&self) -> Value {
        match self {
            StatusField::Temperature(v)
            | StatusField::AltTemp(v)
            | StatusField::Heater(v)
            | StatusField::StdDev(v)
            | StatusField::TempSpReadback(v) => Value::Float(*v),
            StatusField::State(s) | StatusField::Uid(s) => Value::Text(s.clone()),
        }
    }
}

/// Why a key of a status message was not turned into a [`StatusField`].
#[derive(Debug, Clone, PartialEq)]
pub enum Skipped {
    Unknown(String),
    WrongType { key: String, raw: String },
}

/// One decoded status message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusMessage {
    /// Recognised fields, in document order.
    pub fields: Vec<StatusField>,
    pub skipped: Vec<Skipped>,
}

impl StatusMessage {
    /// Decode a UTF-8 JSON object.
    ///
    /// # Errors
    ///
    /// [`AdrError::Decode`] when the payload is not JSON or its top level is
    /// not an object.  A badly typed known field only lands in
    /// [`StatusMessage::skipped`].
    pub fn decode(payload: &[u8]) -> Result<Self, AdrError> {
        let map: Map<String, serde_json::Value> = serde_json::from_slice(payload)
            .map_err(|e| AdrError::Decode(e.to_string()))?;

        let mut msg = StatusMessage::default();
        for (key, raw) in &map {
            match StatusField::from_entry(key, raw) {
                Ok(Some(field)) => msg.fields.push(field),
                Ok(None) => msg.skipped.push(Skipped::Unknown(key.clone())),
                Err(_) => msg.skipped.push(Skipped::WrongType {
                    key: key.clone(),
                    raw: raw.to_string(),
                }),
            }
        }
        Ok(msg)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// A command the bridge can send to the device's control endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceCommand {
    PausePid,
    ResumePid,
    StartMagCycle,
    SetTempSetpoint(f64),
}

impl DeviceCommand {
    pub fn method(&self) -> &'static str {
        match self {
            DeviceCommand::PausePid => "pausePID",
            DeviceCommand::ResumePid => "resumePID",
            DeviceCommand::StartMagCycle => "start_mag_cycle",
            DeviceCommand::SetTempSetpoint(_) => "set_temp_sp_k",
        }
    }

    pub fn to_request(&self) -> CommandRequest {
        let request = CommandRequest::new(self.method());
        match self {
            DeviceCommand::SetTempSetpoint(kelvin) => request.with_param(*kelvin),
            _ => request,
        }
    }
}

/// Wire form of a command: `{"method": .., "params": [..], "kwargs": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub method: String,
    pub params: Vec<serde_json::Value>,
    pub kwargs: Map<String, serde_json::Value>,
}

impl CommandRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_param(mut self, param: impl Into<serde_json::Value>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn to_json(&self) -> Result<String, AdrError> {
        serde_json::to_string(self).map_err(|e| AdrError::Serialization(e.to_string()))
    }
}

/// What became of a dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// Handed to the transport. Says nothing about the device acting on it.
    Sent,
    Failed(String),
    TimedOut,
}

/// Published on the dispatcher's outcome channel after every dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReport {
    pub command: DeviceCommand,
    pub outcome: CommandOutcome,
    pub timestamp: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Registry events
// ────────────────────────────────────────────────────────────────────────────

/// Who performed a registry write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOrigin {
    /// Value came from the device status stream.
    Device,
    /// Value was put by an operator on the supervisory network.
    Operator,
    /// Bookkeeping written by the bridge itself (e.g. `LINK_OK`).
    Bridge,
}

/// Broadcast by the registry after every successful write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableUpdate {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub name: PvName,
    pub value: Value,
    pub previous: Value,
    pub origin: WriteOrigin,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every crate in the workspace.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdrError {
    #[error("Transport Error on {endpoint}: {details}")]
    Transport { endpoint: String, details: String },

    #[error("Decode Error: {0}")]
    Decode(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Variable {0} is read-only")]
    ReadOnly(PvName),

    #[error("Type mismatch on {name}: expected {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: PvKind,
        found: String,
    },

    #[error("Configuration Error: {0}")]
    Config(String),
}

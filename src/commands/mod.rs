//! Command validation, normalization and routing.
//!
//! Envelopes are a closed set of typed variants; nothing stringly-typed
//! survives past the HTTP boundary. The wire shape is serde's external tag:
//! `{"l": {"c": "0000"}}`, one top-level key per instruction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::DBLayer;
use crate::error::AppError;
use crate::model::{Device, Position};
use crate::push::PushClient;
use crate::registry::ConnectionRegistry;

/// Commands a device accepts when registration names none.
pub const DEFAULT_ACCEPTS: &str = "elrth";

const MAX_MESSAGE_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Lock,
    Ring,
    Message,
    Erase,
    Track,
    Heartbeat,
    Quit,
}

impl CommandCode {
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'l' => Some(Self::Lock),
            'r' => Some(Self::Ring),
            'm' => Some(Self::Message),
            'e' => Some(Self::Erase),
            't' => Some(Self::Track),
            'h' => Some(Self::Heartbeat),
            'q' => Some(Self::Quit),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Lock => 'l',
            Self::Ring => 'r',
            Self::Message => 'm',
            Self::Erase => 'e',
            Self::Track => 't',
            Self::Heartbeat => 'h',
            Self::Quit => 'q',
        }
    }
}

/// A single outstanding instruction for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandEnvelope {
    #[serde(rename = "l")]
    Lock {
        #[serde(skip_serializing_if = "Option::is_none")]
        c: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        m: Option<String>,
    },
    #[serde(rename = "r")]
    Ring {
        #[serde(skip_serializing_if = "Option::is_none")]
        d: Option<i64>,
    },
    #[serde(rename = "m")]
    Message { m: String },
    #[serde(rename = "e")]
    Erase {},
    #[serde(rename = "t")]
    Track {
        #[serde(skip_serializing_if = "Option::is_none")]
        d: Option<i64>,
    },
    #[serde(rename = "h")]
    Heartbeat(Value),
    #[serde(rename = "q")]
    Quit {},
}

impl CommandEnvelope {
    pub fn code(&self) -> CommandCode {
        match self {
            Self::Lock { .. } => CommandCode::Lock,
            Self::Ring { .. } => CommandCode::Ring,
            Self::Message { .. } => CommandCode::Message,
            Self::Erase {} => CommandCode::Erase,
            Self::Track { .. } => CommandCode::Track,
            Self::Heartbeat(_) => CommandCode::Heartbeat,
            Self::Quit {} => CommandCode::Quit,
        }
    }
}

/// Result of trying to queue one command.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    Queued { code: char },
    /// The device does not accept this code; caller-correctable, not an error.
    Unacceptable { code: char },
}

pub struct CommandRouter {
    db: Arc<DBLayer>,
    registry: ConnectionRegistry,
    push: PushClient,
    config: Arc<Config>,
}

impl CommandRouter {
    pub fn new(
        db: Arc<DBLayer>,
        registry: ConnectionRegistry,
        push: PushClient,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            registry,
            push,
            config,
        }
    }

    /// Validate, normalize and store a command for a device, then get it
    /// moving: wake the live session if one exists, otherwise fire the push
    /// callback. The command stays durably stored even when the push fails.
    pub async fn queue(
        &self,
        device: &Device,
        code: char,
        args: &Value,
    ) -> Result<QueueOutcome, AppError> {
        let code = code.to_ascii_lowercase();
        if !device.accepts_code(code) {
            warn!(
                device_id = device.id.as_str(),
                unacceptable = %code,
                acceptable = device.accepts.as_str(),
                "device does not accept command"
            );
            return Ok(QueueOutcome::Unacceptable { code });
        }
        let Some(cmd) = CommandCode::from_char(code) else {
            return Err(AppError::Validation("Invalid Command".into()));
        };
        if cmd == CommandCode::Quit && !self.config.allow_quit {
            return Ok(QueueOutcome::Unacceptable { code });
        }

        let envelope = self.normalize(cmd, args);
        let wire = serde_json::to_string(&envelope).map_err(|e| AppError::Storage(e.into()))?;
        self.db.store_command(&device.id, code, &wire).await?;

        if self.registry.wake(&device.id) {
            info!(
                device_id = device.id.as_str(),
                code = %code,
                "command handed to live session"
            );
        } else {
            self.push.send(device).await?;
        }
        Ok(QueueOutcome::Queued { code })
    }

    fn normalize(&self, cmd: CommandCode, args: &Value) -> CommandEnvelope {
        let get = |key: &str| args.as_object().and_then(|m| m.get(key));
        match cmd {
            CommandCode::Lock => CommandEnvelope::Lock {
                c: get("c").map(|v| normalize_lock_code(v, self.config.lock_max)),
                m: get("m").map(normalize_message),
            },
            CommandCode::Ring => CommandEnvelope::Ring {
                d: get("d").map(|v| normalize_duration(v, self.config.track_max)),
            },
            CommandCode::Message => CommandEnvelope::Message {
                m: get("m").map(normalize_message).unwrap_or_default(),
            },
            CommandCode::Erase => CommandEnvelope::Erase {},
            CommandCode::Track => CommandEnvelope::Track {
                d: get("d").map(|v| normalize_duration(v, self.config.track_max)),
            },
            CommandCode::Heartbeat => CommandEnvelope::Heartbeat(args.clone()),
            CommandCode::Quit => CommandEnvelope::Quit {},
        }
    }

    /// Apply a device-reported status. Fields arrive as a flat map whose
    /// keys select by their first two letters (latitude, longitude,
    /// altitude, time, has-passcode).
    pub async fn handle_report(
        &self,
        device_id: &str,
        code: char,
        args: &Value,
    ) -> Result<(), AppError> {
        let Some(map) = args.as_object() else {
            // Bare acks (e.g. `"h": true`) still count as an exchange.
            self.db.touch(device_id).await?;
            return Ok(());
        };

        if let Some(ok) = map.get("ok") {
            if !is_true(ok) {
                // Device reports ok:false on errors; nothing to record.
                return Ok(());
            }
        }

        let mut position = Position {
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            time: 0,
        };
        let mut has_time = false;
        let mut passcode: Option<bool> = None;

        for (key, val) in map {
            let lower = key.to_lowercase();
            let Some(prefix) = lower.get(..2) else {
                continue;
            };
            match prefix {
                "la" => position.latitude = val.as_f64().unwrap_or(0.0),
                "lo" => position.longitude = val.as_f64().unwrap_or(0.0),
                "al" => position.altitude = val.as_f64().unwrap_or(0.0),
                "ti" => {
                    position.time = val.as_f64().unwrap_or(0.0) as i64;
                    has_time = true;
                }
                "ha" => passcode = Some(is_true(val)),
                _ => {}
            }
        }

        // A zero timestamp means "no fix"; the whole report is dropped.
        if has_time && position.time == 0 {
            return Ok(());
        }

        if let Some(state) = passcode {
            self.db.set_device_lock(device_id, state).await?;
        }
        if code == 't' && has_time {
            self.db.set_device_location(device_id, &position).await?;
        }
        self.db.touch(device_id).await?;
        Ok(())
    }
}

/// Collapse a registration `accepts` list to its code string. The heartbeat
/// code is always present in the result.
pub fn normalize_accepts(raw: Option<&Vec<String>>) -> String {
    let mut accepts: String = raw
        .map(|list| {
            list.iter()
                .filter_map(|entry| entry.chars().next())
                .map(|c| c.to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default();
    if accepts.is_empty() {
        accepts = DEFAULT_ACCEPTS.to_string();
    }
    if !accepts.contains('h') {
        accepts.push('h');
    }
    accepts
}

fn arg_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0)
            .to_string(),
        _ => String::new(),
    }
}

fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn ascii_only(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .collect()
}

fn range_check(s: &str, min: i64, max: i64) -> i64 {
    // Unparsable values become 0; clamping is the recovery, not an error.
    let val = s.parse::<i64>().unwrap_or_else(|_| {
        warn!(value = s, "unparsable range value, using 0");
        0
    });
    val.clamp(min, max)
}

/// Lock codes are what keeps a user out of (or in) their phone; anything
/// malformed collapses to a valid four digit string.
fn normalize_lock_code(v: &Value, max: i64) -> String {
    let raw = arg_string(v);
    let head: String = raw.chars().take(4).collect();
    format!("{:04}", range_check(&digits_only(&head), 0, max))
}

fn normalize_message(v: &Value) -> String {
    let mut text = ascii_only(&arg_string(v));
    text.truncate(MAX_MESSAGE_LEN);
    text
}

fn normalize_duration(v: &Value, max: i64) -> i64 {
    range_check(&digits_only(&arg_string(v)), 0, max)
}

fn is_true(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        _ => false,
    }
}

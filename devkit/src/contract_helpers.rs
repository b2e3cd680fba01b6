/*!
Helpers for the device wire formats

- Build command bodies as published on `devices/<serial>/commands`
- Validate telemetry and command bodies field by field
*/

use anyhow::{bail, Context, Result};
use fleet_kernel::models::{CommandMessage, TelemetrySample};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Builds command bodies, valid or deliberately broken.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: String,
    payload: Option<Value>,
    timestamp: Option<String>,
}

impl CommandBuilder {
    pub fn new<S: Into<String>>(command: S) -> Self {
        Self { command: command.into(), payload: None, timestamp: None }
    }

    pub fn restart() -> Self {
        Self::new("restart")
    }

    pub fn update_firmware<S: Into<String>>(version: S) -> Self {
        Self::new("updateFirmware").set_field("version", Value::String(version.into()))
    }

    /// Sets the whole payload
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets one payload field, creating the payload object if needed
    pub fn set_field<S: Into<String>>(mut self, field: S, value: Value) -> Self {
        let payload = self.payload.get_or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(obj) = payload {
            obj.insert(field.into(), value);
        }
        self
    }

    pub fn with_timestamp(mut self) -> Self {
        self.timestamp = Some(OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default());
        self
    }

    pub fn build(&self) -> Value {
        let mut body = Map::new();
        body.insert("command".into(), Value::String(self.command.clone()));
        if let Some(payload) = &self.payload {
            body.insert("payload".into(), payload.clone());
        }
        if let Some(timestamp) = &self.timestamp {
            body.insert("timestamp".into(), Value::String(timestamp.clone()));
        }
        Value::Object(body)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.build())?)
    }
}

/// Checks a telemetry body: status, firmware, integer metrics in 0..=100, RFC 3339 timestamp.
pub fn validate_telemetry(body: &Value) -> Result<TelemetrySample> {
    match body.get("status").and_then(Value::as_str) {
        Some("online") | Some("offline") => {}
        other => bail!("invalid status: {:?}", other),
    }
    if !body.get("firmwareVersion").map(Value::is_string).unwrap_or(false) {
        bail!("firmwareVersion missing or not a string");
    }
    for metric in ["cpu", "memory"] {
        let value = body
            .get("metrics")
            .and_then(|m| m.get(metric))
            .and_then(Value::as_u64)
            .with_context(|| format!("metrics.{} missing or not an integer", metric))?;
        if value > 100 {
            bail!("metrics.{} out of range: {}", metric, value);
        }
    }
    validate_timestamp(body)?;

    Ok(serde_json::from_value(body.clone())?)
}

/// Checks a command body: string verb, object payload if present, RFC 3339 timestamp.
pub fn validate_command(body: &Value) -> Result<CommandMessage> {
    if !body.get("command").map(Value::is_string).unwrap_or(false) {
        bail!("command missing or not a string");
    }
    if let Some(payload) = body.get("payload") {
        if !payload.is_object() {
            bail!("payload must be an object");
        }
    }
    validate_timestamp(body)?;

    Ok(serde_json::from_value(body.clone())?)
}

fn validate_timestamp(body: &Value) -> Result<()> {
    let timestamp = body
        .get("timestamp")
        .and_then(Value::as_str)
        .context("timestamp missing or not a string")?;
    OffsetDateTime::parse(timestamp, &Rfc3339).with_context(|| format!("timestamp not RFC 3339: {}", timestamp))?;
    Ok(())
}

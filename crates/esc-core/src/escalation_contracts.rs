use crate::redaction::RedactionPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const ESCALATION_EVENT_NAME: &str = "alert_escalation_requested";
pub const SEVERITY_FALLBACK: &str = "unknown";

const CORRELATION_ID_KEYS: [&str; 2] = ["correlationId", "correlation_id"];
const SEVERITY_KEYS: [&str; 1] = ["severity"];
const SOURCE_KEYS: [&str; 1] = ["source"];
const ENVIRONMENT_KEYS: [&str; 2] = ["environment", "env"];

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("event name cannot be empty")]
    EmptyEventName,
    #[error("escalation event {event_name} has no correlation id")]
    MissingCorrelationId { event_name: String },
    #[error("unknown severity: {0}")]
    UnknownSeverity(String),
    #[error("unknown delivery status: {0}")]
    UnknownDeliveryStatus(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "critical" | "crit" => Ok(Severity::Critical),
            other => Err(ContractError::UnknownSeverity(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Failed,
    Delivered,
    Canceled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Canceled => "canceled",
        }
    }

    /// Delivered and canceled rows are never attempted again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Canceled)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "failed" => Ok(DeliveryStatus::Failed),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "canceled" | "cancelled" => Ok(DeliveryStatus::Canceled),
            other => Err(ContractError::UnknownDeliveryStatus(other.to_string())),
        }
    }
}

/// An event as it arrives on the bus, before it is recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmittedEvent {
    pub event_name: String,
    #[serde(default)]
    pub payload: Value,
}

impl EmittedEvent {
    pub fn new(event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
        }
    }

    pub fn is_escalation(&self) -> bool {
        self.event_name == ESCALATION_EVENT_NAME
    }

    pub fn correlation_id(&self) -> Option<String> {
        payload_string(&self.payload, &CORRELATION_ID_KEYS)
    }

    /// Unrecognised severity strings are treated as absent.
    pub fn severity(&self) -> Option<Severity> {
        payload_string(&self.payload, &SEVERITY_KEYS).and_then(|value| value.parse().ok())
    }

    pub fn source(&self) -> Option<String> {
        payload_string(&self.payload, &SOURCE_KEYS)
    }

    pub fn environment(&self) -> Option<String> {
        payload_string(&self.payload, &ENVIRONMENT_KEYS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationalEvent {
    pub id: String,
    pub event_name: String,
    pub severity: Option<Severity>,
    pub source: Option<String>,
    pub correlation_id: Option<String>,
    pub environment: String,
    pub payload: Value,
    pub payload_hash: String,
    pub created_at: DateTime<Utc>,
}

impl OperationalEvent {
    /// Builds the persisted form of an emitted event. The payload is redacted
    /// before it is hashed, so the stored hash never covers sensitive values.
    pub fn record(
        emitted: &EmittedEvent,
        default_environment: &str,
        policy: &RedactionPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, ContractError> {
        let event_name = emitted.event_name.trim();
        if event_name.is_empty() {
            return Err(ContractError::EmptyEventName);
        }

        let payload = policy.redact_payload(&emitted.payload);
        let payload_hash = canonical_payload_hash(&payload)?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            event_name: event_name.to_string(),
            severity: emitted.severity(),
            source: emitted.source(),
            correlation_id: emitted.correlation_id(),
            environment: emitted
                .environment()
                .unwrap_or_else(|| default_environment.to_string()),
            payload,
            payload_hash,
            created_at: now,
        })
    }

    pub fn is_escalation(&self) -> bool {
        self.event_name == ESCALATION_EVENT_NAME
    }

    pub fn dedupe_key(&self) -> Result<String, ContractError> {
        let correlation_id = self.correlation_id.as_deref().ok_or_else(|| {
            ContractError::MissingCorrelationId {
                event_name: self.event_name.clone(),
            }
        })?;
        Ok(build_dedupe_key(
            &self.event_name,
            correlation_id,
            self.severity,
        ))
    }
}

/// `{eventName}:{correlationId}:{severity}`, with `unknown` standing in for a
/// missing severity.
pub fn build_dedupe_key(
    event_name: &str,
    correlation_id: &str,
    severity: Option<Severity>,
) -> String {
    format!(
        "{}:{}:{}",
        event_name,
        correlation_id,
        severity.map_or(SEVERITY_FALLBACK, |severity| severity.as_str())
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalationDelivery {
    pub id: String,
    pub event_id: String,
    pub dedupe_key: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EscalationDelivery {
    /// Creation data for a ledger row. Only persisted if no row holds the
    /// same dedupe key yet.
    pub fn pending(
        event_id: impl Into<String>,
        dedupe_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: event_id.into(),
            dedupe_key: dedupe_key.into(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            sent_at: None,
            created_at: now,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let json =
        serde_json::to_value(value).map_err(|err| ContractError::Serialization(err.to_string()))?;
    let canonical = canonicalize_value(json);
    serde_json::to_string(&canonical).map_err(|err| ContractError::Serialization(err.to_string()))
}

pub fn canonical_payload_hash<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let rendered = canonical_json(value)?;
    Ok(sha256_hex(rendered.as_bytes()))
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize_value).collect()),
        other => other,
    }
}

fn payload_string(payload: &Value, keys: &[&str]) -> Option<String> {
    let object = payload.as_object()?;
    for key in keys {
        if let Some(value) = object
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn dedupe_key_uses_event_correlation_and_severity() {
        let emitted = EmittedEvent::new(
            ESCALATION_EVENT_NAME,
            json!({ "correlationId": "corr-1", "severity": "warning" }),
        );
        let event = OperationalEvent::record(&emitted, "test", &RedactionPolicy::default(), ts())
            .expect("record");

        assert_eq!(
            event.dedupe_key().expect("key"),
            "alert_escalation_requested:corr-1:warning"
        );
    }

    #[test]
    fn dedupe_key_falls_back_when_severity_missing_or_unknown() {
        assert_eq!(
            build_dedupe_key("alert_escalation_requested", "corr-2", None),
            "alert_escalation_requested:corr-2:unknown"
        );

        let emitted = EmittedEvent::new(
            ESCALATION_EVENT_NAME,
            json!({ "correlationId": "corr-2", "severity": "sev0" }),
        );
        assert_eq!(emitted.severity(), None);
    }

    #[test]
    fn dedupe_key_requires_correlation_id() {
        let emitted = EmittedEvent::new(ESCALATION_EVENT_NAME, json!({ "severity": "critical" }));
        let event = OperationalEvent::record(&emitted, "test", &RedactionPolicy::default(), ts())
            .expect("record");

        assert!(matches!(
            event.dedupe_key(),
            Err(ContractError::MissingCorrelationId { .. })
        ));
    }

    #[test]
    fn record_rejects_blank_event_name() {
        let emitted = EmittedEvent::new("  ", json!({}));
        assert!(matches!(
            OperationalEvent::record(&emitted, "test", &RedactionPolicy::default(), ts()),
            Err(ContractError::EmptyEventName)
        ));
    }

    #[test]
    fn record_prefers_payload_environment_and_redacts_before_hashing() {
        let emitted = EmittedEvent::new(
            "call_failed",
            json!({ "environment": "production", "apiKey": "sk-live", "correlation_id": "c-9" }),
        );
        let event = OperationalEvent::record(&emitted, "staging", &RedactionPolicy::default(), ts())
            .expect("record");

        assert_eq!(event.environment, "production");
        assert_eq!(event.correlation_id.as_deref(), Some("c-9"));
        assert_eq!(event.payload["apiKey"], json!("[redacted]"));
        assert_eq!(
            event.payload_hash,
            canonical_payload_hash(&event.payload).expect("hash")
        );
        assert!(!event.is_escalation());
    }

    #[test]
    fn status_parsing_accepts_both_cancel_spellings() {
        assert_eq!(
            "cancelled".parse::<DeliveryStatus>().expect("parse"),
            DeliveryStatus::Canceled
        );
        assert!(DeliveryStatus::Canceled.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(!DeliveryStatus::Failed.is_terminal());
        assert!("unknown".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn canonical_json_sorts_nested_object_keys() {
        let rendered = canonical_json(&json!({ "z": { "b": 2, "a": 1 }, "a": [3] }))
            .expect("canonical json");
        assert_eq!(rendered, "{\"a\":[3],\"z\":{\"a\":1,\"b\":2}}");
    }
}

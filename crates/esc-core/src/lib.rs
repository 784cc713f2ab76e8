pub mod escalation_contracts;
pub mod metrics_contracts;
pub mod redaction;

pub use escalation_contracts::{
    build_dedupe_key, canonical_json, canonical_payload_hash, sha256_hex, ContractError,
    DeliveryStatus, EmittedEvent, EscalationDelivery, OperationalEvent, Severity,
    ESCALATION_EVENT_NAME, SEVERITY_FALLBACK,
};
pub use metrics_contracts::{
    BreakerSnapshot, BreakerState, CompactionReport, DeliveryCounters, MetricsRollup,
    MetricsSnapshot, RollupGranularity,
};
pub use redaction::{redact_url, RedactedUrl, RedactionPolicy};

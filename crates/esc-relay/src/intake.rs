//! In-process event bus and the escalation intake subscribed to it.

use crate::RelayError;
use chrono::{DateTime, Utc};
use esc_core::{ContractError, EmittedEvent, EscalationDelivery, OperationalEvent, RedactionPolicy};
use esc_storage::EscalationStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info};

type Handler = Arc<dyn Fn(&EmittedEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: BTreeMap<u64, Handler>,
}

/// Synchronous fan-out of emitted events to subscribers, in subscription order.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event_name: impl Into<String>, payload: Value) {
        let event = EmittedEvent::new(event_name, payload);
        let handlers = lock(&self.registry)
            .handlers
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EmittedEvent) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.insert(id, Arc::new(handler));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).handlers.len()
    }
}

/// Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).handlers.remove(&self.id);
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Persisted; not an escalation.
    Logged { event_id: String },
    Escalated {
        event_id: String,
        delivery: EscalationDelivery,
        inserted: bool,
    },
    /// Escalation without a correlation id; no ledger row.
    MissingCorrelation { event_id: String },
    /// Event persisted but the ledger upsert failed.
    LedgerFailed { event_id: String },
}

/// Records every emitted event and opens a ledger row for escalations.
pub struct EscalationIntake {
    store: Arc<EscalationStore>,
    policy: RedactionPolicy,
    environment: String,
}

impl EscalationIntake {
    pub fn new(
        store: Arc<EscalationStore>,
        policy: RedactionPolicy,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            store,
            policy,
            environment: environment.into(),
        }
    }

    /// Builds the intake and subscribes it to `bus`. Drop the returned
    /// [`Subscription`] to detach.
    pub fn subscribe(
        bus: &EventBus,
        store: Arc<EscalationStore>,
        policy: RedactionPolicy,
        environment: impl Into<String>,
    ) -> (Arc<Self>, Subscription) {
        let intake = Arc::new(Self::new(store, policy, environment));
        let handler_intake = intake.clone();
        let subscription = bus.subscribe(move |event| {
            if let Err(err) = handler_intake.record(event, Utc::now()) {
                error!(
                    event = "event_persist_failed",
                    event_name = %event.event_name,
                    error = %err
                );
            }
        });
        (intake, subscription)
    }

    /// Event persistence errors propagate. Ledger problems are logged and
    /// reported through the outcome.
    pub fn record(
        &self,
        emitted: &EmittedEvent,
        now: DateTime<Utc>,
    ) -> Result<IntakeOutcome, RelayError> {
        let event = OperationalEvent::record(emitted, &self.environment, &self.policy, now)?;
        self.store.insert_event(&event)?;

        if !event.is_escalation() {
            debug!(event = "event_logged", event_name = %event.event_name, event_id = %event.id);
            return Ok(IntakeOutcome::Logged { event_id: event.id });
        }

        let dedupe_key = match event.dedupe_key() {
            Ok(key) => key,
            Err(ContractError::MissingCorrelationId { .. }) => {
                error!(
                    event = "escalation_missing_correlation_id",
                    event_id = %event.id,
                    event_name = %event.event_name
                );
                return Ok(IntakeOutcome::MissingCorrelation { event_id: event.id });
            }
            Err(err) => return Err(err.into()),
        };

        let candidate = EscalationDelivery::pending(&event.id, dedupe_key, now);
        match self.store.upsert_delivery(&candidate) {
            Ok(upsert) => {
                if upsert.inserted {
                    info!(
                        event = "escalation_enqueued",
                        delivery_id = %upsert.delivery.id,
                        dedupe_key = %upsert.delivery.dedupe_key
                    );
                } else {
                    debug!(
                        event = "escalation_deduplicated",
                        delivery_id = %upsert.delivery.id,
                        dedupe_key = %upsert.delivery.dedupe_key,
                        status = %upsert.delivery.status.as_str()
                    );
                }
                Ok(IntakeOutcome::Escalated {
                    event_id: event.id,
                    delivery: upsert.delivery,
                    inserted: upsert.inserted,
                })
            }
            Err(err) => {
                error!(
                    event = "ledger_upsert_failed",
                    event_id = %event.id,
                    dedupe_key = %candidate.dedupe_key,
                    error = %err
                );
                Ok(IntakeOutcome::LedgerFailed { event_id: event.id })
            }
        }
    }
}

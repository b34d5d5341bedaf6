//! Metric Store: definition registry and per-instance metric materialization.
//!
//! The store does not aggregate at capture time — it validates sample shape
//! against the registered definition and hands the sample to the publisher
//! unchanged, preserving the raw samples and their summarization roles for
//! server/query-side aggregation.

use std::collections::HashMap;
use std::sync::Mutex;

use beacon_framing::{
    EventSchemaField, MetricDefinitionWire, MetricSampleKind, MetricSampleRecord,
    SummarizationRole, to_ticks,
};
use chrono::Utc;

use crate::errors::{AgentError, Result};
use crate::publisher::PublisherHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefinitionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricId(u128);

impl MetricId {
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

/// Fluent constructor replacing reflection-based attribute extraction
/// (design note): a metric definition is built in code, not discovered at
/// runtime.
#[derive(Debug, Clone)]
pub enum MetricShape {
    Event(Vec<EventSchemaField>),
    Sampled(SummarizationRole),
}

#[derive(Clone)]
struct RegisteredDefinition {
    id: DefinitionId,
    wire: MetricDefinitionWire,
}

type DefinitionKey = (String, String, String);

#[derive(Default)]
struct Inner {
    definitions: HashMap<DefinitionKey, RegisteredDefinition>,
    metrics: HashMap<(DefinitionId, String), MetricId>,
    next_definition_id: u64,
    next_metric_id: u128,
}

pub struct MetricStore {
    inner: Mutex<Inner>,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a definition, idempotent on an exact re-registration.
    /// Registering a different schema under the same (system, category,
    /// counter) key fails with [`AgentError::DefinitionConflict`].
    pub fn register(
        &self,
        system: &str,
        category: &str,
        counter: &str,
        shape: MetricShape,
    ) -> Result<DefinitionId> {
        let wire = match shape {
            MetricShape::Event(schema) => MetricDefinitionWire {
                system: system.to_string(),
                category: category.to_string(),
                counter: counter.to_string(),
                is_event: true,
                event_schema: schema,
                sampled_role: None,
            },
            MetricShape::Sampled(role) => MetricDefinitionWire {
                system: system.to_string(),
                category: category.to_string(),
                counter: counter.to_string(),
                is_event: false,
                event_schema: Vec::new(),
                sampled_role: Some(role),
            },
        };

        let key = (system.to_string(), category.to_string(), counter.to_string());
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.definitions.get(&key) {
            return if existing.wire == wire {
                Ok(existing.id)
            } else {
                Err(AgentError::DefinitionConflict {
                    system: system.to_string(),
                    category: category.to_string(),
                    counter: counter.to_string(),
                })
            };
        }

        let id = DefinitionId(inner.next_definition_id);
        inner.next_definition_id += 1;
        inner
            .definitions
            .insert(key, RegisteredDefinition { id, wire });
        Ok(id)
    }

    pub fn get_or_create_metric(&self, def_id: DefinitionId, instance_name: &str) -> MetricId {
        let mut inner = self.inner.lock().unwrap();
        let key = (def_id, instance_name.to_string());
        if let Some(existing) = inner.metrics.get(&key) {
            return *existing;
        }
        inner.next_metric_id += 1;
        let id = MetricId(inner.next_metric_id);
        inner.metrics.insert(key, id);
        id
    }

    /// Validate `sample`'s shape against the metric's definition.
    pub fn validate_sample(&self, def_id: DefinitionId, sample: &MetricSampleKind) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let def = inner
            .definitions
            .values()
            .find(|d| d.id == def_id)
            .ok_or_else(|| AgentError::ValidationFailed("unknown metric definition".to_string()))?;

        match (&def.wire.is_event, sample) {
            (true, MetricSampleKind::Event(_)) => Ok(()),
            (false, MetricSampleKind::Counter(_) | MetricSampleKind::Sampled(_)) => Ok(()),
            _ => Err(AgentError::ValidationFailed(
                "sample kind does not match its definition's shape".to_string(),
            )),
        }
    }

    /// Validate `sample` against `def_id`'s definition, then enqueue it to
    /// the publisher under `instance_name`. `metric_id` identifies the
    /// specific metric instance for the caller's own bookkeeping; the wire
    /// record itself carries `instance_name`, not the numeric id.
    pub fn record_sample(
        &self,
        publisher: &PublisherHandle,
        def_id: DefinitionId,
        metric_id: MetricId,
        sample: MetricSampleKind,
        instance_name: &str,
    ) -> Result<()> {
        let _ = metric_id;
        self.validate_sample(def_id, &sample)?;
        let wire = self
            .wire_definition(def_id)
            .ok_or_else(|| AgentError::ValidationFailed("unknown metric definition".to_string()))?;

        let record = MetricSampleRecord {
            sequence: 0,
            system: wire.system,
            category: wire.category,
            counter: wire.counter,
            instance_name: Some(instance_name.to_string()),
            timestamp_ticks: to_ticks(Utc::now()),
            kind: sample,
        };
        publisher.publish_metric(record, false)
    }

    pub fn wire_definition(&self, def_id: DefinitionId) -> Option<MetricDefinitionWire> {
        let inner = self.inner.lock().unwrap();
        inner
            .definitions
            .values()
            .find(|d| d.id == def_id)
            .map(|d| d.wire.clone())
    }
}

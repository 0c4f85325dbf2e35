//! Event subscription.
//!
//! Registers one listener per metric type in the catalog. Declarative types
//! forward the allowlisted subset of each raw payload; `memory` has a fixed
//! restructuring into process and system groups.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use elk_common::{MEMORY_METRIC, MappingDescriptor};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::catalog::MappingCatalog;
use crate::emitter::{EventSource, Listener};
use crate::publisher::PublisherHandle;

/// Raw payload key holding the sample time in epoch milliseconds.
const TIME_FIELD: &str = "time";

/// Copies the descriptor's top-level fields from the raw payload.
///
/// Values are forwarded verbatim; keys missing from the payload stay absent.
pub fn declared_fields(descriptor: &MappingDescriptor, raw: &Value) -> Map<String, Value> {
    let mut fields = Map::new();
    let Some(raw) = raw.as_object() else {
        return fields;
    };

    for name in descriptor.field_names() {
        if let Some(value) = raw.get(name) {
            fields.insert(name.to_string(), value.clone());
        }
    }
    fields
}

/// Restructures a raw memory payload.
///
/// ```text
/// { private, physical, virtual, physical_used, physical_total }
///   → { process: { private, physical, virtual },
///       system:  { physical: physical_used, total: physical_total } }
/// ```
pub fn memory_fields(raw: &Value) -> Map<String, Value> {
    let mut fields = Map::with_capacity(2);
    fields.insert(
        "process".to_string(),
        Value::Object(pick(
            raw,
            &[
                ("private", "private"),
                ("physical", "physical"),
                ("virtual", "virtual"),
            ],
        )),
    );
    fields.insert(
        "system".to_string(),
        Value::Object(pick(
            raw,
            &[("physical", "physical_used"), ("total", "physical_total")],
        )),
    );
    fields
}

/// Copies `from` keys of `raw` under their `to` names.
fn pick(raw: &Value, renames: &[(&str, &str)]) -> Map<String, Value> {
    renames
        .iter()
        .filter_map(|(to, from)| raw.get(*from).map(|v| (to.to_string(), v.clone())))
        .collect()
}

/// Sample time of a raw payload, or now if it carries none.
pub fn event_timestamp(raw: &Value) -> DateTime<Utc> {
    let millis = match raw.get(TIME_FIELD) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    };

    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

/// Wires event source listeners to the publisher.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    catalog: Arc<MappingCatalog>,
    publisher: PublisherHandle,
}

impl EventSubscriber {
    pub fn new(catalog: Arc<MappingCatalog>, publisher: PublisherHandle) -> Self {
        Self { catalog, publisher }
    }

    /// Registers a listener for every metric type in the catalog.
    ///
    /// Returns the subscribed event names. Types without a descriptor get no
    /// listener and their events are never published. This includes
    /// `memory`: its listener is registered only when the catalog holds a
    /// `memory` descriptor, otherwise memory events are dropped.
    pub fn subscribe<S: EventSource + ?Sized>(&self, source: &S) -> Vec<String> {
        let mut subscribed = Vec::with_capacity(self.catalog.len());

        for descriptor in self.catalog.declarative() {
            let descriptor = descriptor.clone();
            let publisher = self.publisher.clone();
            let metric_type = descriptor.metric_type.clone();

            let listener: Listener = Arc::new(move |raw: &Value| {
                publisher.record(
                    &descriptor.metric_type,
                    event_timestamp(raw),
                    declared_fields(&descriptor, raw),
                );
            });
            source.on(&metric_type, listener);
            debug!(metric = %metric_type, "Subscribed");
            subscribed.push(metric_type);
        }

        if self.catalog.contains(MEMORY_METRIC) {
            let publisher = self.publisher.clone();
            let listener: Listener = Arc::new(move |raw: &Value| {
                publisher.record(MEMORY_METRIC, event_timestamp(raw), memory_fields(raw));
            });
            source.on(MEMORY_METRIC, listener);
            debug!(metric = MEMORY_METRIC, "Subscribed");
            subscribed.push(MEMORY_METRIC.to_string());
        }

        info!(count = subscribed.len(), "Subscribed to metric events");
        subscribed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use elk_common::{
        DatastoreClient, DatastoreVersion, Envelope, FieldSpec, FieldType, InMemoryDatastore,
    };
    use serde_json::json;

    use crate::emitter::EventBus;
    use crate::publisher::{BatchPublisher, FlushOutcome, PublisherConfig};

    fn http_descriptor() -> MappingDescriptor {
        MappingDescriptor::new(
            "http",
            BTreeMap::from([
                ("requests".to_string(), FieldSpec::of(FieldType::Long)),
                ("url".to_string(), FieldSpec::of(FieldType::Keyword)),
            ]),
        )
    }

    fn memory_descriptor() -> MappingDescriptor {
        MappingDescriptor::new(
            "memory",
            BTreeMap::from([
                ("process".to_string(), FieldSpec::object(BTreeMap::new())),
                ("system".to_string(), FieldSpec::object(BTreeMap::new())),
            ]),
        )
    }

    #[test]
    fn test_declared_fields_allowlist() {
        let raw = json!({ "requests": 5, "extraneous": "x", "time": 1 });
        let fields = declared_fields(&http_descriptor(), &raw);

        assert_eq!(Value::Object(fields), json!({ "requests": 5 }));
    }

    #[test]
    fn test_declared_fields_forwarded_verbatim() {
        let raw = json!({ "requests": "five", "url": { "path": "/" } });
        let fields = declared_fields(&http_descriptor(), &raw);

        assert_eq!(
            Value::Object(fields),
            json!({ "requests": "five", "url": { "path": "/" } })
        );
    }

    #[test]
    fn test_declared_fields_non_object_payload() {
        assert!(declared_fields(&http_descriptor(), &json!(42)).is_empty());
    }

    #[test]
    fn test_memory_fields_restructured() {
        let raw = json!({
            "private": 10,
            "physical": 20,
            "virtual": 30,
            "physical_used": 40,
            "physical_total": 100,
            "time": 1_500_000_000_000i64
        });

        assert_eq!(
            Value::Object(memory_fields(&raw)),
            json!({
                "process": { "private": 10, "physical": 20, "virtual": 30 },
                "system": { "physical": 40, "total": 100 }
            })
        );
    }

    #[test]
    fn test_memory_fields_missing_keys_absent() {
        let raw = json!({ "physical": 20, "physical_total": 100 });

        assert_eq!(
            Value::Object(memory_fields(&raw)),
            json!({
                "process": { "physical": 20 },
                "system": { "total": 100 }
            })
        );
    }

    #[test]
    fn test_event_timestamp() {
        let raw = json!({ "time": 1_500_000_000_123i64 });
        assert_eq!(event_timestamp(&raw).timestamp_millis(), 1_500_000_000_123);

        let fractional = json!({ "time": 1_500_000_000_123.7 });
        assert_eq!(
            event_timestamp(&fractional).timestamp_millis(),
            1_500_000_000_123
        );

        let before = Utc::now();
        let fallback = event_timestamp(&json!({ "time": "yesterday" }));
        assert!(fallback >= before);
    }

    fn subscriber(
        catalog: MappingCatalog,
        store: &Arc<InMemoryDatastore>,
    ) -> (EventSubscriber, BatchPublisher) {
        let (publisher, handle) = BatchPublisher::new(
            PublisherConfig::default(),
            Arc::new(Envelope::new("host-a", 1, "tests")),
            DatastoreVersion::new(6),
            Arc::clone(store) as Arc<dyn DatastoreClient>,
        );
        (EventSubscriber::new(Arc::new(catalog), handle), publisher)
    }

    #[test]
    fn test_subscribe_only_catalog_types() {
        let store = Arc::new(InMemoryDatastore::default());
        let catalog = MappingCatalog::from_descriptors([http_descriptor()]);
        let (subscriber, _publisher) = subscriber(catalog, &store);
        let bus = EventBus::new();

        let subscribed = subscriber.subscribe(&bus);

        assert_eq!(subscribed, vec!["http".to_string()]);
        assert_eq!(bus.listener_count("http"), 1);
        assert_eq!(bus.listener_count("memory"), 0);
        assert_eq!(bus.emit("memory", &json!({ "private": 1 })), 0);
        assert_eq!(bus.emit("mqtt", &json!({ "topic": "a" })), 0);
    }

    #[test]
    fn test_memory_listener_requires_descriptor() {
        let store = Arc::new(InMemoryDatastore::default());
        let catalog = MappingCatalog::from_descriptors([http_descriptor(), memory_descriptor()]);
        let (subscriber, _publisher) = subscriber(catalog, &store);
        let bus = EventBus::new();

        let subscribed = subscriber.subscribe(&bus);

        assert_eq!(subscribed, vec!["http".to_string(), "memory".to_string()]);
        assert_eq!(bus.listener_count("memory"), 1);
    }

    #[tokio::test]
    async fn test_events_reach_publisher() {
        let store = Arc::new(InMemoryDatastore::default());
        let catalog = MappingCatalog::from_descriptors([http_descriptor(), memory_descriptor()]);
        let (subscriber, mut publisher) = subscriber(catalog, &store);
        let bus = EventBus::new();
        subscriber.subscribe(&bus);

        bus.emit("http", &json!({ "requests": 5, "extraneous": "x", "time": 1_000 }));
        bus.emit(
            "memory",
            &json!({ "private": 1, "physical_used": 2, "time": 2_000 }),
        );

        assert_eq!(
            publisher.flush().await,
            FlushOutcome::Written { count: 2, rejected: 0 }
        );

        let sources = store.bulk_sources();
        assert_eq!(sources[0]["type"], json!("http"));
        assert_eq!(sources[0]["http"], json!({ "requests": 5 }));
        assert_eq!(sources[0]["@timestamp"], json!("1970-01-01T00:00:01.000Z"));
        assert_eq!(sources[1]["type"], json!("memory"));
        assert_eq!(
            sources[1]["memory"],
            json!({ "process": { "private": 1 }, "system": { "physical": 2 } })
        );
    }
}

//! Version shim.
//!
//! Pure functions that turn version-agnostic mappings, saved objects and
//! metric documents into the shape a given datastore epoch accepts:
//!
//! | Epoch | Field types                    | Document type         | Saved objects            |
//! |-------|--------------------------------|-----------------------|--------------------------|
//! | ≤ 2   | `text`/`keyword` → `string`    | per metric type       | unprefixed id, unwrapped |
//! | 3-5   | as declared                    | per metric type       | unprefixed id, unwrapped |
//! | 6     | as declared                    | `doc`                 | generic                  |
//! | ≥ 7   | as declared                    | none (typeless)       | generic                  |
//!
//! Each function is applied exactly once per document per operation; none of
//! them mutate their input.

use std::collections::BTreeMap;

use elk_common::{
    BulkOperation, DatastoreVersion, FieldSpec, FieldType, IndexDocument, MappingDescriptor,
    MetricDocument, PutMapping, SavedObject,
};
use serde_json::{Map, Value, json};

/// Rewrites field declarations for the target epoch.
pub fn shim_properties(
    version: DatastoreVersion,
    properties: &BTreeMap<String, FieldSpec>,
) -> BTreeMap<String, FieldSpec> {
    if !version.uses_string_fields() {
        return properties.clone();
    }
    properties
        .iter()
        .map(|(name, spec)| (name.clone(), legacy_field(spec)))
        .collect()
}

fn legacy_field(spec: &FieldSpec) -> FieldSpec {
    let mut field = spec.clone();
    match spec.field_type {
        Some(FieldType::Keyword) => {
            field.field_type = Some(FieldType::String);
            field
                .extra
                .insert("index".to_string(), Value::String("not_analyzed".to_string()));
        }
        Some(FieldType::Text) => field.field_type = Some(FieldType::String),
        _ => {}
    }

    // nested and plain object fields alike
    if let Some(ref properties) = spec.properties {
        field.properties = Some(
            properties
                .iter()
                .map(|(name, child)| (name.clone(), legacy_field(child)))
                .collect(),
        );
    }
    field
}

/// Fields every metric document carries besides its own payload.
pub fn envelope_properties() -> BTreeMap<String, FieldSpec> {
    BTreeMap::from([
        ("type".to_string(), FieldSpec::of(FieldType::Keyword)),
        ("@timestamp".to_string(), FieldSpec::of(FieldType::Date)),
        ("host".to_string(), FieldSpec::of(FieldType::Keyword)),
        ("pid".to_string(), FieldSpec::of(FieldType::Integer)),
        ("app".to_string(), FieldSpec::of(FieldType::Keyword)),
    ])
}

/// Put-mapping request for one metric type.
///
/// The metric's declared fields live under an object named after the type,
/// next to the envelope fields.
pub fn mapping_request(
    version: DatastoreVersion,
    index: &str,
    descriptor: &MappingDescriptor,
) -> PutMapping {
    let mut properties = envelope_properties();
    properties.insert(
        descriptor.metric_type.clone(),
        FieldSpec::object(descriptor.properties.clone()),
    );

    PutMapping {
        index: index.to_string(),
        doc_type: version.document_type(&descriptor.metric_type),
        body: json!({ "properties": shim_properties(version, &properties) }),
    }
}

/// Index request for a saved object in the Kibana index.
pub fn saved_object_request(
    version: DatastoreVersion,
    kibana_index: &str,
    object: &SavedObject,
) -> IndexDocument {
    let (id, body) = if version.uses_per_document_types() {
        (object.unprefixed_id().to_string(), object.attributes.clone())
    } else {
        (object.id.clone(), object.generic_body())
    };

    IndexDocument {
        index: kibana_index.to_string(),
        doc_type: version.document_type(&object.kind),
        id: Some(id),
        body,
    }
}

/// Bulk action header and source for one metric document.
pub fn bulk_operation(
    version: DatastoreVersion,
    index: &str,
    document: &MetricDocument,
) -> BulkOperation {
    let mut meta = Map::with_capacity(2);
    meta.insert("_index".to_string(), Value::String(index.to_string()));
    if let Some(doc_type) = version.document_type(document.metric_type()) {
        meta.insert("_type".to_string(), Value::String(doc_type));
    }

    BulkOperation {
        action: json!({ "index": meta }),
        source: document.to_source(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use elk_common::{Envelope, MetricEvent};

    fn http_descriptor() -> MappingDescriptor {
        MappingDescriptor::new(
            "http",
            BTreeMap::from([
                ("url".to_string(), FieldSpec::of(FieldType::Keyword)),
                ("header".to_string(), FieldSpec::of(FieldType::Text)),
                ("duration".to_string(), FieldSpec::of(FieldType::Float)),
            ]),
        )
    }

    #[test]
    fn test_keyword_backported_on_v2() {
        let props = BTreeMap::from([("url".to_string(), FieldSpec::of(FieldType::Keyword))]);
        let shimmed = shim_properties(DatastoreVersion::new(2), &props);

        assert_eq!(
            serde_json::to_value(&shimmed["url"]).unwrap(),
            json!({ "type": "string", "index": "not_analyzed" })
        );
    }

    #[test]
    fn test_keyword_untouched_on_v6() {
        let props = BTreeMap::from([("url".to_string(), FieldSpec::of(FieldType::Keyword))]);
        let shimmed = shim_properties(DatastoreVersion::new(6), &props);

        assert_eq!(
            serde_json::to_value(&shimmed["url"]).unwrap(),
            json!({ "type": "keyword" })
        );
    }

    #[test]
    fn test_text_becomes_plain_string() {
        let props = BTreeMap::from([("header".to_string(), FieldSpec::of(FieldType::Text))]);
        let shimmed = shim_properties(DatastoreVersion::new(1), &props);

        assert_eq!(
            serde_json::to_value(&shimmed["header"]).unwrap(),
            json!({ "type": "string" })
        );
    }

    #[test]
    fn test_nested_fields_recursed() {
        let props = BTreeMap::from([(
            "request".to_string(),
            FieldSpec::nested(BTreeMap::from([
                ("method".to_string(), FieldSpec::of(FieldType::Keyword)),
                ("size".to_string(), FieldSpec::of(FieldType::Long)),
            ])),
        )]);
        let shimmed = shim_properties(DatastoreVersion::new(2), &props);

        assert_eq!(
            serde_json::to_value(&shimmed).unwrap(),
            json!({
                "request": {
                    "type": "nested",
                    "properties": {
                        "method": { "type": "string", "index": "not_analyzed" },
                        "size": { "type": "long" }
                    }
                }
            })
        );
    }

    #[test]
    fn test_shim_applied_twice_is_stable() {
        let props = BTreeMap::from([("url".to_string(), FieldSpec::of(FieldType::Keyword))]);
        let v2 = DatastoreVersion::new(2);

        let once = shim_properties(v2, &props);
        let twice = shim_properties(v2, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_other_types_unchanged() {
        let props = BTreeMap::from([
            ("count".to_string(), FieldSpec::of(FieldType::Long)),
            (
                "at".to_string(),
                FieldSpec::of(FieldType::Date).with_attribute("format", "epoch_millis"),
            ),
        ]);

        assert_eq!(shim_properties(DatastoreVersion::new(2), &props), props);
        assert_eq!(props["count"], FieldSpec::of(FieldType::Long));
    }

    #[test]
    fn test_unrecognised_type_passes_through() {
        let props = BTreeMap::from([(
            "where".to_string(),
            FieldSpec::of(FieldType::Other("geo_point".to_string())),
        )]);

        assert_eq!(shim_properties(DatastoreVersion::new(2), &props), props);
        assert_eq!(shim_properties(DatastoreVersion::new(7), &props), props);
    }

    #[test]
    fn test_mapping_request_v6() {
        let request = mapping_request(DatastoreVersion::new(6), "appmetrics", &http_descriptor());

        assert_eq!(request.index, "appmetrics");
        assert_eq!(request.doc_type.as_deref(), Some("doc"));
        assert_eq!(request.body["properties"]["http"]["properties"]["url"], json!({ "type": "keyword" }));
        assert_eq!(request.body["properties"]["@timestamp"], json!({ "type": "date" }));
        assert_eq!(request.body["properties"]["pid"], json!({ "type": "integer" }));
    }

    #[test]
    fn test_mapping_request_v2() {
        let request = mapping_request(DatastoreVersion::new(2), "appmetrics", &http_descriptor());

        assert_eq!(request.doc_type.as_deref(), Some("http"));
        assert_eq!(
            request.body["properties"]["http"]["properties"]["url"],
            json!({ "type": "string", "index": "not_analyzed" })
        );
        assert_eq!(
            request.body["properties"]["http"]["properties"]["header"],
            json!({ "type": "string" })
        );
        assert_eq!(
            request.body["properties"]["host"],
            json!({ "type": "string", "index": "not_analyzed" })
        );
    }

    #[test]
    fn test_mapping_request_v7_typeless() {
        let request = mapping_request(DatastoreVersion::new(7), "appmetrics", &http_descriptor());
        assert!(request.doc_type.is_none());
    }

    fn chart() -> SavedObject {
        SavedObject::new(
            "visualization:cpu",
            "visualization",
            json!({ "title": "CPU" }),
        )
    }

    #[test]
    fn test_saved_object_legacy_unwrapped() {
        let request = saved_object_request(DatastoreVersion::new(5), ".kibana", &chart());

        assert_eq!(request.index, ".kibana");
        assert_eq!(request.doc_type.as_deref(), Some("visualization"));
        assert_eq!(request.id.as_deref(), Some("cpu"));
        assert_eq!(request.body, json!({ "title": "CPU" }));
    }

    #[test]
    fn test_saved_object_generic_on_v6() {
        let request = saved_object_request(DatastoreVersion::new(6), ".kibana", &chart());

        assert_eq!(request.doc_type.as_deref(), Some("doc"));
        assert_eq!(request.id.as_deref(), Some("visualization:cpu"));
        assert_eq!(
            request.body,
            json!({ "type": "visualization", "visualization": { "title": "CPU" } })
        );
    }

    #[test]
    fn test_saved_object_typeless_on_v7() {
        let request = saved_object_request(DatastoreVersion::new(7), ".kibana", &chart());
        assert!(request.doc_type.is_none());
        assert_eq!(request.id.as_deref(), Some("visualization:cpu"));
    }

    fn cpu_document() -> MetricDocument {
        let mut fields = Map::new();
        fields.insert("system".to_string(), json!(0.5));
        MetricDocument::new(
            Arc::new(Envelope::new("host-a", 7, "app")),
            MetricEvent::new("cpu", Utc::now(), fields),
        )
    }

    #[test]
    fn test_bulk_operation_per_version() {
        let doc = cpu_document();

        let legacy = bulk_operation(DatastoreVersion::new(5), "appmetrics", &doc);
        assert_eq!(
            legacy.action,
            json!({ "index": { "_index": "appmetrics", "_type": "cpu" } })
        );

        let generic = bulk_operation(DatastoreVersion::new(6), "appmetrics", &doc);
        assert_eq!(
            generic.action,
            json!({ "index": { "_index": "appmetrics", "_type": "doc" } })
        );
        assert_eq!(generic.source["type"], json!("cpu"));
        assert_eq!(generic.source["cpu"]["system"], json!(0.5));

        let typeless = bulk_operation(DatastoreVersion::new(8), "appmetrics", &doc);
        assert_eq!(typeless.action, json!({ "index": { "_index": "appmetrics" } }));
    }
}

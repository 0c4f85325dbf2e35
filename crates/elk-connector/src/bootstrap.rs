//! One-shot provisioning at startup.
//!
//! ```text
//! info ──► version
//!            │
//!            ├──► metrics index exists? ──► create ──► put mappings
//!            │
//!            └──► probe UI index ──► (none) ──► index-pattern, charts, dashboards
//! ```
//!
//! The two chains run concurrently. Every failure is logged and counted in
//! the returned report; provisioning itself never fails.

use std::sync::Arc;

use elk_common::{
    DatastoreClient, DatastoreVersion, ElasticsearchError, SavedObject, SearchProbe,
};
use futures_util::future::join_all;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::{FixtureKind, Fixtures, MappingCatalog};
use crate::shim;

/// Saved object kind of an index pattern.
pub const INDEX_PATTERN_KIND: &str = "index-pattern";

/// Errors raised while preparing a saved object template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("saved object '{0}' attributes are not an object")]
    NotAnObject(String),

    #[error("chart '{0}' has no kibanaSavedObjectMeta.searchSourceJSON string")]
    MissingSearchSource(String),

    #[error("chart '{id}' has an invalid searchSourceJSON: {source}")]
    InvalidSearchSource {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Points an index-pattern template at the metrics index.
pub fn prepare_index_pattern(
    template: &SavedObject,
    index: &str,
) -> Result<SavedObject, TemplateError> {
    let mut pattern = template.clone();
    pattern.id = format!("{INDEX_PATTERN_KIND}:{index}");
    pattern
        .attributes
        .as_object_mut()
        .ok_or_else(|| TemplateError::NotAnObject(template.id.clone()))?
        .insert("title".to_string(), Value::String(index.to_string()));
    Ok(pattern)
}

/// Merges the metrics index into a chart's embedded search source.
pub fn prepare_chart(template: &SavedObject, index: &str) -> Result<SavedObject, TemplateError> {
    let mut chart = template.clone();
    let missing = || TemplateError::MissingSearchSource(template.id.clone());

    let search_source = chart
        .attributes
        .get_mut("kibanaSavedObjectMeta")
        .and_then(|meta| meta.get_mut("searchSourceJSON"))
        .ok_or_else(missing)?;
    let raw = search_source.as_str().ok_or_else(missing)?;

    let invalid = |source: serde_json::Error| TemplateError::InvalidSearchSource {
        id: template.id.clone(),
        source,
    };
    let mut search: Map<String, Value> = serde_json::from_str(raw).map_err(invalid)?;
    search.insert("index".to_string(), Value::String(index.to_string()));
    *search_source = Value::String(serde_json::to_string(&search).map_err(invalid)?);

    Ok(chart)
}

/// Outcome of a provisioning run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Detected datastore epoch; `None` when the info call failed.
    pub version: Option<DatastoreVersion>,
    pub index_created: bool,
    pub mappings_put: usize,
    /// Whether default UI objects were uploaded in this run.
    pub ui_provisioned: bool,
    pub saved_objects_put: usize,
    /// Steps that failed and were skipped.
    pub failures: usize,
}

impl ProvisionReport {
    /// Epoch the publisher should shape documents for.
    pub fn effective_version(&self) -> DatastoreVersion {
        self.version.unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct IndexStep {
    created: bool,
    mappings_put: usize,
    failures: usize,
}

#[derive(Debug, Default)]
struct UiStep {
    provisioned: bool,
    saved_objects_put: usize,
    failures: usize,
}

/// Creates the metrics index, its mappings and the default UI objects.
pub struct Provisioner {
    client: Arc<dyn DatastoreClient>,
    fixtures: Fixtures,
    catalog: Arc<MappingCatalog>,
    index: String,
    kibana_index: String,
}

impl Provisioner {
    pub fn new(
        client: Arc<dyn DatastoreClient>,
        fixtures: Fixtures,
        catalog: Arc<MappingCatalog>,
        index: impl Into<String>,
        kibana_index: impl Into<String>,
    ) -> Self {
        Self {
            client,
            fixtures,
            catalog,
            index: index.into(),
            kibana_index: kibana_index.into(),
        }
    }

    /// Runs every provisioning step.
    pub async fn run(&self) -> ProvisionReport {
        let version = match self.detect_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "Failed to query Elasticsearch version, skipping provisioning");
                return ProvisionReport {
                    failures: 1,
                    ..Default::default()
                };
            }
        };
        info!(version = %version, "Detected Elasticsearch version");

        let (index_step, ui_step) = tokio::join!(
            self.ensure_metrics_index(version),
            self.ensure_dashboards(version)
        );

        let report = ProvisionReport {
            version: Some(version),
            index_created: index_step.created,
            mappings_put: index_step.mappings_put,
            ui_provisioned: ui_step.provisioned,
            saved_objects_put: ui_step.saved_objects_put,
            failures: index_step.failures + ui_step.failures,
        };
        info!(
            index = %self.index,
            index_created = report.index_created,
            mappings = report.mappings_put,
            saved_objects = report.saved_objects_put,
            failures = report.failures,
            "Provisioning complete"
        );
        report
    }

    async fn detect_version(&self) -> Result<DatastoreVersion, ElasticsearchError> {
        self.client.info().await?.datastore_version()
    }

    async fn ensure_metrics_index(&self, version: DatastoreVersion) -> IndexStep {
        let mut step = IndexStep::default();

        match self.client.index_exists(&self.index).await {
            Ok(true) => debug!(index = %self.index, "Index exists"),
            Ok(false) => match self.client.create_index(&self.index).await {
                Ok(()) => {
                    info!(index = %self.index, "Created index");
                    step.created = true;
                }
                Err(e) => {
                    warn!(error = %e, index = %self.index, "Failed to create index");
                    step.failures += 1;
                    return step;
                }
            },
            Err(e) => {
                warn!(error = %e, index = %self.index, "Failed to check index");
                step.failures += 1;
                return step;
            }
        }

        let descriptors: Vec<_> = self.catalog.descriptors().collect();
        let requests: Vec<_> = descriptors
            .iter()
            .map(|descriptor| shim::mapping_request(version, &self.index, descriptor))
            .collect();
        let results = join_all(requests.iter().map(|r| self.client.put_mapping(r))).await;

        for (descriptor, result) in descriptors.iter().zip(results) {
            match result {
                Ok(()) => step.mappings_put += 1,
                Err(e) => {
                    warn!(error = %e, metric = %descriptor.metric_type, "Failed to put mapping");
                    step.failures += 1;
                }
            }
        }
        step
    }

    /// Probe for an index pattern titled after the metrics index.
    pub fn index_pattern_probe(&self, version: DatastoreVersion) -> SearchProbe {
        let (doc_type, title_field) = if version.uses_per_document_types() {
            (Some(INDEX_PATTERN_KIND.to_string()), "title".to_string())
        } else {
            (None, format!("{INDEX_PATTERN_KIND}.title"))
        };

        let mut phrase = Map::with_capacity(1);
        phrase.insert(title_field, Value::String(self.index.clone()));
        let mut query = Map::with_capacity(1);
        query.insert("match_phrase".to_string(), Value::Object(phrase));

        SearchProbe {
            index: self.kibana_index.clone(),
            doc_type,
            query: Value::Object(query),
        }
    }

    async fn ensure_dashboards(&self, version: DatastoreVersion) -> UiStep {
        let mut step = UiStep::default();

        let hits = match self.client.count_hits(&self.index_pattern_probe(version)).await {
            Ok(hits) => hits,
            Err(e) if e.is_index_not_found() => {
                if let Err(e) = self.client.create_index(&self.kibana_index).await {
                    warn!(error = %e, index = %self.kibana_index, "Failed to create Kibana index");
                    step.failures += 1;
                    return step;
                }
                info!(index = %self.kibana_index, "Created Kibana index");
                0
            }
            Err(e) => {
                error!(error = %e, index = %self.kibana_index, "Failed to query Kibana index");
                step.failures += 1;
                return step;
            }
        };

        if hits > 0 {
            debug!(index = %self.index, "Index pattern present, skipping dashboards");
            return step;
        }

        let (objects, template_failures) = self.saved_objects();
        step.failures += template_failures;

        let requests: Vec<_> = objects
            .iter()
            .map(|obj| shim::saved_object_request(version, &self.kibana_index, obj))
            .collect();
        let results = join_all(requests.iter().map(|r| self.client.index_document(r))).await;

        for (obj, result) in objects.iter().zip(results) {
            match result {
                Ok(()) => step.saved_objects_put += 1,
                Err(e) => {
                    warn!(error = %e, id = %obj.id, kind = %obj.kind, "Failed to put saved object");
                    step.failures += 1;
                }
            }
        }
        step.provisioned = true;
        step
    }

    /// Index patterns, then charts, then dashboards, each prepared for the
    /// metrics index. Returns the objects and the number of bad templates.
    fn saved_objects(&self) -> (Vec<SavedObject>, usize) {
        let mut objects = Vec::new();
        let mut failures = 0;

        let prepared = self
            .fixtures
            .load_saved_objects(FixtureKind::Indexes)
            .iter()
            .map(|t| prepare_index_pattern(t, &self.index))
            .chain(
                self.fixtures
                    .load_saved_objects(FixtureKind::Charts)
                    .iter()
                    .map(|t| prepare_chart(t, &self.index)),
            )
            .collect::<Vec<_>>();

        for result in prepared {
            match result {
                Ok(obj) => objects.push(obj),
                Err(e) => {
                    warn!(error = %e, "Skipping saved object template");
                    failures += 1;
                }
            }
        }

        objects.extend(self.fixtures.load_saved_objects(FixtureKind::Dashboards));
        (objects, failures)
    }
}

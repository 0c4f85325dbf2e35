//! In-memory datastore.
//!
//! Records every request instead of sending it. Backs the binary's dry-run
//! mode and the connector's tests; individual operations can be made to fail
//! to exercise error paths.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::elasticsearch::{
    BulkRequest, BulkResponse, ClusterInfo, DatastoreClient, ElasticsearchError, INDEX_NOT_FOUND,
    IndexDocument, PutMapping, SearchProbe,
};

#[derive(Debug, Default)]
struct State {
    indices: BTreeSet<String>,
    mappings: Vec<PutMapping>,
    documents: Vec<IndexDocument>,
    bulks: Vec<BulkRequest>,
}

/// Datastore that keeps every request in memory.
#[derive(Debug)]
pub struct InMemoryDatastore {
    version: String,
    state: Mutex<State>,
    fail_info: AtomicBool,
    fail_bulk: AtomicBool,
    fail_probe: AtomicBool,
}

impl InMemoryDatastore {
    /// Creates a datastore reporting the given version number.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            state: Mutex::new(State::default()),
            fail_info: AtomicBool::new(false),
            fail_bulk: AtomicBool::new(false),
            fail_probe: AtomicBool::new(false),
        }
    }

    /// Adds an index that exists before the connector starts.
    pub fn with_index(self, index: impl Into<String>) -> Self {
        self.state.lock().indices.insert(index.into());
        self
    }

    /// Makes the info call fail.
    pub fn fail_info(&self, fail: bool) {
        self.fail_info.store(fail, Ordering::Relaxed);
    }

    /// Makes bulk writes fail.
    pub fn fail_bulk(&self, fail: bool) {
        self.fail_bulk.store(fail, Ordering::Relaxed);
    }

    /// Makes search probes fail with a non index-not-found error.
    pub fn fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::Relaxed);
    }

    pub fn indices(&self) -> Vec<String> {
        self.state.lock().indices.iter().cloned().collect()
    }

    pub fn mappings(&self) -> Vec<PutMapping> {
        self.state.lock().mappings.clone()
    }

    pub fn documents(&self) -> Vec<IndexDocument> {
        self.state.lock().documents.clone()
    }

    pub fn bulks(&self) -> Vec<BulkRequest> {
        self.state.lock().bulks.clone()
    }

    /// Sources of every bulk-written document, in write order.
    pub fn bulk_sources(&self) -> Vec<Value> {
        self.state
            .lock()
            .bulks
            .iter()
            .flat_map(|bulk| bulk.operations.iter().map(|op| op.source.clone()))
            .collect()
    }

    fn missing_index(index: &str) -> ElasticsearchError {
        ElasticsearchError::api(404, INDEX_NOT_FOUND, format!("no such index [{index}]"))
    }
}

impl Default for InMemoryDatastore {
    fn default() -> Self {
        Self::new("6.8.0")
    }
}

fn is_index_pattern(doc: &IndexDocument) -> bool {
    doc.doc_type.as_deref() == Some("index-pattern")
        || doc.body.get("type").and_then(Value::as_str) == Some("index-pattern")
}

#[async_trait]
impl DatastoreClient for InMemoryDatastore {
    async fn info(&self) -> Result<ClusterInfo, ElasticsearchError> {
        if self.fail_info.load(Ordering::Relaxed) {
            return Err(ElasticsearchError::api(503, "unavailable", "info disabled"));
        }
        Ok(ClusterInfo::new(self.version.clone()))
    }

    async fn index_exists(&self, index: &str) -> Result<bool, ElasticsearchError> {
        Ok(self.state.lock().indices.contains(index))
    }

    async fn create_index(&self, index: &str) -> Result<(), ElasticsearchError> {
        let mut state = self.state.lock();
        if !state.indices.insert(index.to_string()) {
            return Err(ElasticsearchError::api(
                400,
                "resource_already_exists_exception",
                format!("index [{index}] already exists"),
            ));
        }
        debug!(index = %index, "In-memory index created");
        Ok(())
    }

    async fn put_mapping(&self, request: &PutMapping) -> Result<(), ElasticsearchError> {
        let mut state = self.state.lock();
        if !state.indices.contains(&request.index) {
            return Err(Self::missing_index(&request.index));
        }
        state.mappings.push(request.clone());
        Ok(())
    }

    async fn index_document(&self, request: &IndexDocument) -> Result<(), ElasticsearchError> {
        let mut state = self.state.lock();
        state.indices.insert(request.index.clone());
        state.documents.push(request.clone());
        Ok(())
    }

    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse, ElasticsearchError> {
        if self.fail_bulk.load(Ordering::Relaxed) {
            return Err(ElasticsearchError::api(
                503,
                "es_rejected_execution_exception",
                "bulk rejected",
            ));
        }

        self.state.lock().bulks.push(request.clone());
        debug!(operations = request.len(), "In-memory bulk recorded");

        Ok(BulkResponse {
            took: 0,
            items: request.len(),
            failed: 0,
        })
    }

    async fn count_hits(&self, probe: &SearchProbe) -> Result<u64, ElasticsearchError> {
        if self.fail_probe.load(Ordering::Relaxed) {
            return Err(ElasticsearchError::api(
                500,
                "search_phase_execution_exception",
                "probe disabled",
            ));
        }

        let state = self.state.lock();
        if !state.indices.contains(&probe.index) {
            return Err(Self::missing_index(&probe.index));
        }

        let hits = state
            .documents
            .iter()
            .filter(|doc| doc.index == probe.index && is_index_pattern(doc))
            .count();
        Ok(hits.min(1) as u64)
    }
}

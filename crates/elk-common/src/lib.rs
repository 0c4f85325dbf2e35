//! Shared types and datastore client for the appmetrics ELK connector.
//!
//! This crate contains:
//! - Metric event, envelope and document types
//! - Mapping descriptors and Kibana saved objects
//! - The datastore version epoch
//! - Elasticsearch client wrapper and an in-memory stand-in

pub mod elasticsearch;
pub mod memory;
pub mod types;

pub use elasticsearch::{
    BulkOperation, BulkRequest, BulkResponse, ClusterInfo, DatastoreClient, ElasticsearchClient,
    ElasticsearchConfig, ElasticsearchError, IndexDocument, PutMapping, SearchProbe,
};
pub use memory::InMemoryDatastore;
pub use types::*;

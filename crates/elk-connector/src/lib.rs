//! Appmetrics ELK connector.
//!
//! Forwards runtime metric events from a monitored process into an
//! Elasticsearch index, and provisions the index mappings and Kibana
//! dashboards needed to view them.
//!
//! ## Architecture
//!
//! - **Never-blocking record path**: listeners hand documents to an unbounded
//!   channel; a single publisher task owns the buffer
//! - **Periodic bulk writes**: one bulk request per flush interval
//! - **Version shim**: mappings, saved objects and bulk actions shaped once
//!   for the detected Elasticsearch epoch (≤2, ≤5, 6, ≥7)
//!
//! ## Modules
//!
//! - `config`: Configuration loading and CLI overrides
//! - `catalog`: Fixture loading and the mapping catalog
//! - `shim`: Version-specific document shaping
//! - `emitter`: Event source seam and in-process event bus
//! - `subscriber`: Per-metric listeners feeding the publisher
//! - `publisher`: Batch buffer and periodic bulk flush
//! - `bootstrap`: Index, mapping and dashboard provisioning
//! - `connector`: Wiring of the above

pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod connector;
pub mod emitter;
pub mod publisher;
pub mod shim;
pub mod subscriber;

pub use bootstrap::{ProvisionReport, Provisioner, TemplateError};
pub use catalog::{CatalogError, FixtureKind, Fixtures, MappingCatalog};
pub use config::ConnectorConfig;
pub use connector::{Connector, ConnectorError, RunningConnector};
pub use emitter::{EventBus, EventSource, Listener};
pub use publisher::{
    BatchPublisher, BulkBuffer, FlushOutcome, PublisherConfig, PublisherHandle,
    PublisherStatsSnapshot, spawn_publisher,
};
pub use subscriber::EventSubscriber;

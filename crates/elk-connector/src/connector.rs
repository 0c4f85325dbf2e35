//! Connector wiring.
//!
//! Loads the mapping catalog, provisions the datastore, then starts the
//! publisher and subscribes it to an event source.

use std::sync::Arc;

use elk_common::{
    DatastoreClient, DatastoreVersion, ElasticsearchClient, ElasticsearchError, Envelope,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bootstrap::{ProvisionReport, Provisioner};
use crate::catalog::{Fixtures, MappingCatalog};
use crate::config::ConnectorConfig;
use crate::emitter::EventSource;
use crate::publisher::{
    BatchPublisher, PublisherConfig, PublisherHandle, PublisherStatsSnapshot, spawn_publisher,
};
use crate::subscriber::EventSubscriber;

/// Errors that can occur while running the connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Elasticsearch client error: {0}")]
    Client(#[from] ElasticsearchError),

    #[error("Publisher task failed: {0}")]
    Publisher(#[from] tokio::task::JoinError),
}

/// Connects an event source to an Elasticsearch cluster.
pub struct Connector {
    config: ConnectorConfig,
    client: Arc<dyn DatastoreClient>,
}

impl Connector {
    /// Creates a connector backed by the HTTP client in `config.elasticsearch`.
    pub fn new(config: ConnectorConfig) -> Result<Self, ConnectorError> {
        let client = ElasticsearchClient::new(config.elasticsearch.clone())?;
        Ok(Self::with_client(config, Arc::new(client)))
    }

    pub fn with_client(config: ConnectorConfig, client: Arc<dyn DatastoreClient>) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Provisions, starts the publisher and subscribes it to `source`.
    ///
    /// The publisher stops with a final flush when `shutdown` fires. If the
    /// sender is dropped without firing, it keeps running until every
    /// publisher handle is gone.
    pub async fn start<S: EventSource + ?Sized>(
        &self,
        source: &S,
        shutdown: broadcast::Receiver<()>,
    ) -> RunningConnector {
        let fixtures = Fixtures::from_config(self.config.fixtures_dir.as_deref());
        let catalog = Arc::new(MappingCatalog::load(&fixtures));
        if catalog.is_empty() {
            error!(%fixtures, "No mapping fixtures loaded, nothing will be published");
        } else {
            info!(
                metric_types = catalog.len(),
                %fixtures,
                "Loaded mapping catalog"
            );
        }

        let report = Provisioner::new(
            Arc::clone(&self.client),
            fixtures,
            Arc::clone(&catalog),
            &self.config.index,
            &self.config.kibana_index,
        )
        .run()
        .await;
        let version = report.effective_version();

        let envelope = Arc::new(Envelope::current(self.config.app_name.clone()));
        info!(host = %envelope.host, pid = envelope.pid, app = %envelope.app, "Publishing as");

        let (publisher, handle) = BatchPublisher::new(
            PublisherConfig {
                index: self.config.index.clone(),
                flush_interval: self.config.flush_interval,
            },
            envelope,
            version,
            Arc::clone(&self.client),
        );
        let task = spawn_publisher(publisher, shutdown);

        let subscribed = EventSubscriber::new(catalog, handle.clone()).subscribe(source);

        RunningConnector {
            report,
            version,
            subscribed,
            handle,
            task,
        }
    }
}

/// A started connector.
pub struct RunningConnector {
    report: ProvisionReport,
    version: DatastoreVersion,
    subscribed: Vec<String>,
    handle: PublisherHandle,
    task: JoinHandle<()>,
}

impl RunningConnector {
    pub fn report(&self) -> &ProvisionReport {
        &self.report
    }

    /// Epoch documents are shaped for.
    pub fn version(&self) -> DatastoreVersion {
        self.version
    }

    pub fn subscribed(&self) -> &[String] {
        &self.subscribed
    }

    pub fn publisher(&self) -> &PublisherHandle {
        &self.handle
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.handle.stats_snapshot()
    }

    /// Waits for the publisher to stop and returns its final stats.
    pub async fn join(self) -> Result<PublisherStatsSnapshot, ConnectorError> {
        self.task.await?;
        Ok(self.handle.stats_snapshot())
    }
}

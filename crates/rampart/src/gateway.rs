//! The gateway service object.
//!
//! Owns the match cache, the plugin chain, both event buses, the handed-off
//! exchanges and the shutdown coordinator. Built explicitly by the binary (or a test) and
//! shared by reference; nothing here is global.

use std::sync::Arc;
use std::time::Duration;

use rampart_bus::{BusError, BusStats, Drain, EventBus, ShutdownCoordinator, ShutdownReport, SubmitError};
use rampart_cache::MatchCache;
use rampart_chain::{ConfigStore, Exchange, Plugin, PluginChain, PluginError, PluginList, SelectorData};
use rampart_telemetry::{log_startup, MetricsRegistry};
use thiserror::Error;

use crate::config::{ConfigError, GatewayConfig};
use crate::handlers::{RequestEvent, RequestHandler, ResponseEvent, ResponseHandler};
use crate::handoff::Handoffs;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("plugin setup failed: {0}")]
    Plugin(#[from] PluginError),

    #[error("the gateway must be started from within a tokio runtime")]
    NoRuntime,
}

pub struct Gateway {
    metrics: Arc<MetricsRegistry>,
    cache: Arc<MatchCache<SelectorData>>,
    store: Arc<dyn ConfigStore>,
    chain: Arc<PluginChain>,
    request_bus: Arc<EventBus<RequestEvent>>,
    response_bus: Arc<EventBus<ResponseEvent>>,
    handoffs: Arc<Handoffs>,
    coordinator: ShutdownCoordinator,
}

impl Gateway {
    /// Build the cache and chain, then start the response bus and the
    /// request bus. Handed-off exchanges run on the calling runtime.
    pub fn start(
        config: &GatewayConfig,
        store: Arc<dyn ConfigStore>,
        plugins: Vec<Arc<dyn Plugin>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| GatewayError::NoRuntime)?;

        let cache = Arc::new(MatchCache::new(config.cache.policy));
        store.attach_cache(Arc::clone(&cache));
        let chain = Arc::new(PluginChain::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.chain_settings(),
        ));
        chain.set_plugins(plugins);

        let response_bus = Arc::new(EventBus::start(
            config.response_bus(),
            Arc::new(ResponseHandler),
            Arc::clone(&metrics),
        )?);
        let handoffs = Arc::new(Handoffs::new(
            runtime,
            Arc::clone(&chain),
            Arc::clone(&response_bus),
        ));
        let request_bus = Arc::new(EventBus::start(
            config.request_bus(),
            Arc::new(RequestHandler::new(
                Arc::clone(&chain),
                Arc::clone(&response_bus),
                Arc::clone(&handoffs),
            )),
            Arc::clone(&metrics),
        )?);

        // Request workers start handoffs and both publish to the response
        // bus, so it drains last.
        let coordinator = ShutdownCoordinator::new(vec![
            Arc::clone(&request_bus) as Arc<dyn Drain>,
            Arc::clone(&handoffs) as Arc<dyn Drain>,
            Arc::clone(&response_bus) as Arc<dyn Drain>,
        ]);

        log_startup!(
            plugins = ?chain.plugins().names(),
            request_partitions = request_bus.partition_count(),
            response_partitions = response_bus.partition_count(),
            cache_policy = ?config.cache.policy,
            "gateway started"
        );

        Ok(Self {
            metrics,
            cache,
            store,
            chain,
            request_bus,
            response_bus,
            handoffs,
            coordinator,
        })
    }

    /// Hand an exchange to the request bus. Exchanges with the same
    /// `partition_key` are processed in submission order.
    pub fn submit(&self, partition_key: u64, exchange: Exchange) -> Result<(), SubmitError<Exchange>> {
        let event = RequestEvent {
            key: partition_key,
            exchange,
        };
        self.request_bus
            .submit(partition_key.to_be_bytes(), event)
            .map_err(|error| match error {
                SubmitError::Overloaded(event) => SubmitError::Overloaded(event.exchange),
                SubmitError::ShuttingDown(event) => SubmitError::ShuttingDown(event.exchange),
            })
    }

    /// Drop the cached selectors of one plugin.
    pub fn invalidate_cache(&self, plugin: &str) -> bool {
        self.cache.invalidate(plugin)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Replace the plugin list. Exchanges already stamped keep theirs.
    pub fn set_plugins(&self, plugins: Vec<Arc<dyn Plugin>>) {
        self.chain.set_plugins(plugins);
    }

    pub fn plugin_named(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.chain.plugin_named(name)
    }

    pub fn plugins(&self) -> Arc<PluginList> {
        self.chain.plugins()
    }

    pub fn is_accepting(&self) -> bool {
        self.request_bus.is_accepting()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<MatchCache<SelectorData>> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn chain(&self) -> &Arc<PluginChain> {
        &self.chain
    }

    pub fn request_stats(&self) -> BusStats {
        self.request_bus.stats()
    }

    pub fn response_stats(&self) -> BusStats {
        self.response_bus.stats()
    }

    /// Handed-off exchanges still waiting on their downstream call.
    pub fn handoffs_in_flight(&self) -> usize {
        self.handoffs.in_flight()
    }

    /// Drain the request bus, then running handoffs, then the response bus,
    /// within `timeout`.
    /// Repeated calls return the first report.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.coordinator.shutdown(timeout).await
    }
}

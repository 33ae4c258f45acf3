use crate::dispatch::TcpConnector;
use crate::health::HealthTable;
use crate::proxy::{Gateway, GatewayParts};
use pylon_core::config::GatewayConfig;
use pylon_core::router::Router;
use pylon_observability::metrics::MetricsAggregator;
use pylon_observability::prometheus_exporter::PrometheusExporter;
use pylon_plugin::registry::PluginRegistry;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// State shared across all worker threads.
///
/// Everything here is either immutable after startup or updated through
/// atomics (router version, health table version, metrics counters);
/// workers mirror what they need into thread-local state.
pub struct SharedState {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<Router>,
    pub registry: Arc<PluginRegistry>,
    pub metrics: Arc<MetricsAggregator>,
    pub prometheus: Arc<PrometheusExporter>,
    pub health: Arc<HealthTable>,
}

impl SharedState {
    pub fn new(
        config: GatewayConfig,
        router: Router,
        registry: PluginRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            router: Arc::new(router),
            registry: Arc::new(registry),
            metrics: Arc::new(MetricsAggregator::new()),
            prometheus: Arc::new(PrometheusExporter::default()),
            health: Arc::new(HealthTable::new()),
        })
    }
}

/// Spawn monoio worker threads, one per core by default.
///
/// Each thread runs an independent monoio runtime with its own TCP
/// listener (SO_REUSEPORT), event loop, and gateway state.
pub fn spawn_workers(
    shared: Arc<SharedState>,
    num_workers: usize,
) -> Vec<std::thread::JoinHandle<()>> {
    let listen_addr = shared.config.server.listen_addr();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let shared = Arc::clone(&shared);
        let addr = listen_addr.clone();

        let handle = std::thread::Builder::new()
            .name(format!("pylon-worker-{}", worker_id))
            .spawn(move || {
                let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("Failed to build monoio runtime");

                rt.block_on(worker_loop(worker_id, shared, addr));
            })
            .expect("Failed to spawn worker thread");

        handles.push(handle);
    }

    info!(workers = num_workers, addr = %listen_addr, "Workers spawned");
    handles
}

/// Main loop for a single worker thread.
async fn worker_loop(worker_id: usize, shared: Arc<SharedState>, addr: String) {
    use monoio::net::TcpListener;

    let listener = TcpListener::bind(&addr).unwrap_or_else(|e| {
        panic!("Worker {} failed to bind to {}: {}", worker_id, addr, e);
    });

    info!(worker = worker_id, addr = %addr, "Worker listening");

    let gateway = Gateway::new(GatewayParts {
        config: Arc::clone(&shared.config),
        router: Arc::clone(&shared.router),
        registry: Arc::clone(&shared.registry),
        metrics: Arc::clone(&shared.metrics),
        prometheus: Arc::clone(&shared.prometheus),
        health: Arc::clone(&shared.health),
        connector: TcpConnector,
    });
    gateway.init().await;

    // Background maintenance: idle-connection reaping and leak reports.
    {
        let gateway = Rc::clone(&gateway);
        monoio::spawn(async move {
            loop {
                monoio::time::sleep(Duration::from_secs(30)).await;
                gateway.housekeeping();
            }
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                // TCP_NODELAY: lowest latency for small responses.
                let _ = stream.set_nodelay(true);

                let gateway = Rc::clone(&gateway);
                monoio::spawn(async move {
                    if let Err(e) =
                        crate::connection::handle_connection(stream, peer_addr, gateway).await
                    {
                        tracing::debug!(error = %e, "Connection closed");
                    }
                });
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Accept error");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Pylon — sub-10ms HTTP reverse proxy / API gateway
//
//  Architecture: monoio thread-per-core + shared-nothing data plane
//  Control plane: health checker on a dedicated tokio thread
//  Config:       JSON file + PYLON_* environment overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use pylon_core::config::GatewayConfig;
use pylon_core::router::Router;
use pylon_plugin::registry::PluginRegistry;
use pylon_proxy::health::HealthChecker;
use pylon_proxy::worker::{self, SharedState};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Global shutdown flag, set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "pylon", version, about = "Pylon — HTTP reverse proxy / API gateway")]
struct Cli {
    /// Path to the JSON configuration file (CONFIG_PATH overrides)
    #[arg(short, long, default_value = "pylon.json")]
    config: PathBuf,

    /// Log level (LOG_LEVEL overrides)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    let log_level = std::env::var("LOG_LEVEL").unwrap_or(cli.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Pylon starting — monoio thread-per-core engine"
    );

    // ── Config ──
    let config_path = std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or(cli.config);
    let config = if config_path.exists() {
        info!(path = %config_path.display(), "Loading config file");
        GatewayConfig::load(Some(config_path.as_path()))?
    } else {
        info!("No config file found, using defaults");
        GatewayConfig::load(None)?
    };

    let num_workers = config.effective_workers();
    info!(
        workers = num_workers,
        environment = ?config.environment,
        "Worker count resolved"
    );

    // ── Plugin registry ──
    let mut registry = PluginRegistry::new();
    pylon_plugins::register_all(&mut registry);
    info!(plugins = registry.len(), "Plugins registered");

    // ── Router ──
    let router = Router::build(config.routes.clone());
    info!(entries = router.entry_count(), "Router built");

    // ── Shared state ──
    let shared = SharedState::new(config, router, registry);

    // ── Health checker on a dedicated tokio thread ──
    let checked_upstreams: Vec<_> = shared
        .config
        .upstreams
        .iter()
        .filter(|u| u.health_check.enabled)
        .cloned()
        .map(Arc::new)
        .collect();
    if !checked_upstreams.is_empty() {
        let table = Arc::clone(&shared.health);
        std::thread::Builder::new()
            .name("pylon-health".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("Failed to build tokio runtime for health checks");
                rt.block_on(async move {
                    let checker = HealthChecker::new(table);
                    let handles = checker.spawn_all(&checked_upstreams);
                    info!(probes = handles.len(), "Health checker running");
                    for handle in handles {
                        let _ = handle.await;
                    }
                });
            })
            .expect("Failed to spawn health thread");
    }

    // ── Spawn monoio worker threads ──
    let worker_handles = worker::spawn_workers(Arc::clone(&shared), num_workers);

    info!(
        workers = num_workers,
        listen = %shared.config.server.listen_addr(),
        "Pylon is ready — serving traffic"
    );

    // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    info!("Shutdown signal received, stopping...");

    // Workers run an infinite accept loop; on process exit all threads
    // and their sockets are reclaimed by the OS.
    drop(worker_handles);

    info!("Pylon stopped");
    Ok(())
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

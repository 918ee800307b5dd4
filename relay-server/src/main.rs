// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Relay Gateway — Zero-Overhead API Gateway
//
//  Architecture: monoio thread-per-core + shared-nothing data plane
//  Admin API:    axum on dedicated tokio thread
//  Config:       standalone YAML / etcd with watch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use relay_core::config::GatewayConfig;
use relay_core::router::Router;
use relay_plugin::registry::PluginRegistry;
use relay_proxy::worker::{self, SharedState};
use relay_store::cache::ConfigCache;
use relay_observability::Aggregator;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Global shutdown flag — checked by signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Relay Gateway — Zero-Overhead API Gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/relay/relay.yaml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to the JSON state file used for persistence (routes, upstreams, consumers).
    /// Data written via the Admin API is saved here and reloaded on restart.
    #[arg(long, default_value = "data/relay-state.json")]
    state_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Relay Gateway starting — monoio thread-per-core engine"
    );

    // ── Config ──
    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config file");
        GatewayConfig::load(&cli.config)?
    } else {
        info!("No config file found, using defaults");
        GatewayConfig::load("")?
    };

    let num_workers = config.effective_workers();
    info!(workers = num_workers, "Worker count");

    // ── Plugin registry ──
    let mut registry = PluginRegistry::new();
    relay_plugins::register_all(&mut registry);
    info!(plugins = registry.len(), "Plugins registered");

    // ── Config cache ──
    let cache = ConfigCache::new();

    // ── Restore persisted state (routes / upstreams / consumers) ──
    relay_admin::persist::load_state(&cli.state_file, &cache);

    // ── Initial router (built from persisted routes, or empty) ──
    let initial_routes = cache.all_routes();
    let router = Router::build(initial_routes, 0)?;

    // ── Metrics aggregator (shared between the data plane and the admin API) ──
    let metrics = Arc::new(Aggregator::new());

    // ── Shared state ──
    let shared = SharedState::new(router, registry, cache.clone(), config.clone(), Arc::clone(&metrics));

    // ── Admin API state ──
    let config_changed = Arc::new(Notify::new());
    let admin_state = Arc::new(relay_admin::server::AdminState {
        cache: cache.clone(),
        router_swap: Arc::clone(&shared.router),
        plugin_registry: Arc::clone(&shared.plugin_registry),
        config_changed: config_changed.clone(),
        state_file: Some(cli.state_file.clone()),
        metrics: Arc::clone(&metrics),
        history: Arc::new(relay_admin::history::MetricsHistory::new(360)),
        num_workers,
    });

    // ── Start admin API on a dedicated tokio thread ──
    let admin_config = config.admin.clone();
    if admin_config.enabled {
        let admin_state = Arc::clone(&admin_state);
        std::thread::Builder::new()
            .name("relay-admin".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("Failed to build tokio runtime for admin");

                rt.block_on(async {
                    if let Err(e) = relay_admin::server::start_admin(admin_config, admin_state).await
                    {
                        tracing::error!(error = %e, "Admin API failed");
                    }
                });
            })
            .expect("Failed to spawn admin thread");

        info!(addr = %config.admin.addr, "Admin API started");
    }

    // ── Spawn monoio worker threads ──
    let worker_handles = worker::spawn_workers(Arc::clone(&shared), num_workers);

    info!(
        workers = num_workers,
        proxy_addr = %config.proxy.http_addr,
        admin_addr = %config.admin.addr,
        "Relay Gateway is ready — serving traffic"
    );

    // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
    setup_signal_handler();

    // Wait for shutdown signal
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    info!("Shutdown signal received, stopping...");

    // In the current architecture, workers run in an infinite accept loop.
    // On process exit, all threads are cleaned up by the OS.
    // Future improvement: send shutdown notification to each worker.
    drop(worker_handles);

    info!("Relay Gateway stopped");
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

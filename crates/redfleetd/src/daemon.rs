//! Subsystem assembly for `redfleetd run`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use redfleet_core::{FleetConfig, StoreBackend, StoreConfig};
use redfleet_offers::SimulatedCluster;
use redfleet_reconciler::{Gateway, spawn_loops};
use redfleet_state::StateStore;

/// Open the configured state store, creating parent directories for redb.
pub fn open_store(config: &StoreConfig) -> anyhow::Result<StateStore> {
    match config.backend {
        StoreBackend::Memory => {
            warn!("using in-memory state store, state is lost on exit");
            Ok(StateStore::open_in_memory()?)
        }
        StoreBackend::Redb => {
            let path = Path::new(&config.endpoint);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let store = StateStore::open(path)
                .with_context(|| format!("opening state store at {}", path.display()))?;
            info!(path = %path.display(), "state store opened");
            Ok(store)
        }
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "cannot listen for ctrl-c, shutting down"),
    }
    let _ = shutdown_tx.send(true);
}

pub async fn run(config: FleetConfig) -> anyhow::Result<()> {
    info!(
        framework = %config.framework_name,
        user = %config.user_name,
        master = %config.master,
        "RedFleet daemon starting"
    );

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(&config.store)?;
    let gateway = Gateway::new(store.clone(), config.redis_image.clone());

    let cluster = Arc::new(SimulatedCluster::new(&config.cluster));
    info!(nodes = config.cluster.nodes.len(), "simulated cluster initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let cluster_handle = tokio::spawn(cluster.clone().run(shutdown_rx.clone()));
    let loops = spawn_loops(store, cluster, config.reconciler.clone(), shutdown_rx);

    // ── Start API server ───────────────────────────────────────

    let router = redfleet_api::build_router(gateway);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // Loops stop at their next iteration boundary.
    loops.join().await;
    let _ = cluster_handle.await;

    info!("RedFleet daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redb_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("nested/state/redfleet.redb");
        let config = StoreConfig {
            backend: StoreBackend::Redb,
            endpoint: endpoint.display().to_string(),
        };
        let store = open_store(&config).unwrap();
        assert!(store.list_specs().unwrap().is_empty());
        assert!(endpoint.exists());
    }

    #[test]
    fn memory_store_ignores_endpoint() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            endpoint: "/nonexistent/redfleet.redb".to_string(),
        };
        assert!(open_store(&config).is_ok());
    }

    #[test]
    fn redb_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            backend: StoreBackend::Redb,
            endpoint: dir.path().join("redfleet.redb").display().to_string(),
        };
        {
            let store = open_store(&config).unwrap();
            Gateway::new(store, "redis:3.0-alpine")
                .create_instance(&redfleet_reconciler::CreateRequest {
                    name: "cache1".into(),
                    memory_mb: 256,
                    slave_count: 1,
                })
                .unwrap();
        }
        let store = open_store(&config).unwrap();
        assert!(store.get_spec("cache1").unwrap().is_some());
        assert_eq!(store.list_work_items().unwrap().len(), 2);
    }
}

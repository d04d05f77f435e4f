//! Event loop and admin endpoints.
//!
//! The TCP acceptor spawns per-connection socket tasks that report to one
//! event loop task. That task owns the [`Hub`], so every state change
//! happens in arrival order on a single task.

use crate::config::Config;
use crate::metrics::{self, MetricsRecorder};
use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use spjall_core::{Hub, MemoryStore, Stats, Store};
use spjall_transport::{TcpAcceptor, TransportEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Build the in-memory store and load the configured accounts.
#[must_use]
pub fn build_store(config: &Config) -> MemoryStore {
    let store = MemoryStore::new(config.invites.base_url.clone());
    for user in &config.users {
        store.add_user(user.nickname.clone(), user.token.clone());
    }
    info!(users = config.users.len(), "Store ready");
    store
}

/// Run the chat server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    run_with_listener(config, listener, shutdown_signal()).await
}

/// Run the chat server on an already bound listener until `shutdown`
/// resolves.
///
/// # Errors
///
/// Returns an error if the admin endpoint cannot be bound.
pub async fn run_with_listener(
    config: Config,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let store = Arc::new(build_store(&config));
    let hub = Hub::new(store, config.hub_config());

    let acceptor = TcpAcceptor::from_listener(listener, config.tcp_config());
    if let Some(addr) = acceptor.local_addr() {
        info!("Spjall server listening on {}", addr);
        info!("WebSocket endpoint: ws://{}/", addr);
    }

    let (stats_tx, stats_rx) = watch::channel(Stats::default());
    let admin_task = if config.admin.enabled {
        let addr = config.admin_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin endpoint {addr}"))?;
        info!("Admin endpoints on http://{}", addr);
        Some(tokio::spawn(serve_admin(listener, stats_rx)))
    } else {
        None
    };

    let (events_tx, events_rx) = mpsc::channel(config.limits.event_queue.max(1));
    let acceptor_task = tokio::spawn(acceptor.run(events_tx));

    event_loop(hub, events_rx, stats_tx, config.sweep_interval(), shutdown).await;

    acceptor_task.abort();
    if let Some(task) = admin_task {
        task.abort();
    }
    info!("Spjall server stopped");
    Ok(())
}

/// Drive the hub from transport events and the sweep timer.
pub async fn event_loop<S: Store>(
    mut hub: Hub<S>,
    mut events: mpsc::Receiver<TransportEvent>,
    stats: watch::Sender<Stats>,
    sweep_interval: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut recorder = MetricsRecorder::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => handle_event(&mut hub, event),
                None => {
                    warn!("Transport event channel closed");
                    break;
                }
            },
            _ = sweep.tick() => {
                let closed = hub.sweep(Instant::now());
                if closed > 0 {
                    debug!(closed, "Sweep closed connections");
                }
            }
            () = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }

        let current = hub.stats();
        stats.send_if_modified(|published| {
            let changed = *published != current;
            *published = current;
            changed
        });
        recorder.update(hub.counters(), &current);
    }

    hub.shutdown();
    stats.send_replace(hub.stats());
}

fn handle_event<S: Store>(hub: &mut Hub<S>, event: TransportEvent) {
    match event {
        TransportEvent::Connected { id, transport } => {
            hub.on_connect(id, Box::new(transport));
        }
        TransportEvent::Data { id, data } => {
            let start = Instant::now();
            hub.on_bytes(id, &data);
            metrics::record_latency(start.elapsed().as_secs_f64());
        }
        TransportEvent::Closed { id } => {
            debug!(connection = %id, "Transport closed");
            hub.on_disconnect(id);
        }
        TransportEvent::Failed { id, error } => {
            debug!(connection = %id, error = %error, "Transport failed");
            metrics::record_error("transport");
            hub.on_disconnect(id);
        }
    }
}

/// Admin routes reading the latest published statistics.
pub fn admin_router(stats: watch::Receiver<Stats>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(stats)
}

async fn serve_admin(listener: TcpListener, stats: watch::Receiver<Stats>) {
    if let Err(e) = axum::serve(listener, admin_router(stats)).await {
        error!("Admin endpoint failed: {}", e);
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Connection statistics handler.
async fn stats_handler(State(stats): State<watch::Receiver<Stats>>) -> Json<Stats> {
    Json(*stats.borrow())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spjall_core::HubConfig;

    #[tokio::test]
    async fn test_stats_handler() {
        let (tx, rx) = watch::channel(Stats::default());
        tx.send_replace(Stats {
            connections: 3,
            authenticated: 2,
            online_users: 1,
            pending_handshakes: 1,
        });

        let Json(stats) = stats_handler(State(rx)).await;
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.online_users, 1);
    }

    #[test]
    fn test_build_store_seeds_users() {
        let mut config = Config::default();
        config.users.push(crate::config::SeedUser {
            nickname: "alice".into(),
            token: "tok".into(),
        });

        let store = build_store(&config);
        let user = store.find_user_by_token("tok").unwrap().unwrap();
        assert_eq!(user.nickname, "alice");
    }

    #[tokio::test]
    async fn test_event_loop_stops_on_shutdown() {
        let hub = Hub::new(Arc::new(MemoryStore::default()), HubConfig::default());
        let (_events_tx, events_rx) = mpsc::channel::<TransportEvent>(8);
        let (stats_tx, stats_rx) = watch::channel(Stats::default());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(event_loop(
            hub,
            events_rx,
            stats_tx,
            Duration::from_millis(10),
            async move {
                let _ = stop_rx.await;
            },
        ));

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*stats_rx.borrow(), Stats::default());
    }

    #[tokio::test]
    async fn test_event_loop_stops_when_events_close() {
        let hub = Hub::new(Arc::new(MemoryStore::default()), HubConfig::default());
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(8);
        let (stats_tx, _stats_rx) = watch::channel(Stats::default());
        drop(events_tx);

        tokio::time::timeout(
            Duration::from_secs(5),
            event_loop(
                hub,
                events_rx,
                stats_tx,
                Duration::from_millis(10),
                std::future::pending(),
            ),
        )
        .await
        .unwrap();
    }
}

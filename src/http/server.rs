//! HTTP server setup and the accept loop.
//!
//! # Responsibilities
//! - Create the Axum router (redirect fallback, liveness route)
//! - Wire up middleware (request timeout, tracing)
//! - Own the listening socket across reloads, restarts and upgrade handoff
//! - Accept connections and serve them with HTTP/1.1 and HTTP/2
//! - Drain in-flight connections within a deadline when stopped

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::{DaemonConfig, SharedConfig};
use crate::lifecycle::handoff::{HandoffError, HandoffToken};
use crate::lifecycle::RequestServer;
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::net::listener::{classify_accept_error, AcceptErrorKind};
use crate::net::{BoundListener, ListenerError};
use crate::observability::metrics;
use crate::store::MirrorStore;

/// Drain deadline applied when the accept loop ends on its own.
const FALLBACK_DRAIN: Duration = Duration::from_secs(5);

/// Time a connection gets to deliver its first request once draining starts.
const DRAIN_SETTLE: Duration = Duration::from_millis(100);

/// Pause after a transient accept failure such as descriptor exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Listener unavailable: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: MirrorStore,
}

/// The mirror redirect server.
pub struct HttpServer {
    config: Arc<SharedConfig>,
    store: MirrorStore,
    router: ArcSwap<Router>,
    listener: Mutex<Option<BoundListener>>,
    /// Armed by a reload; the next stop becomes a restart.
    restarting: AtomicBool,
    restart_pending: AtomicBool,
    /// A non-restart stop was requested; `run` will not serve again.
    stopped: AtomicBool,
    stop_tx: watch::Sender<Option<Duration>>,
    /// Cleared while a new generation is taking over the socket.
    accepting_tx: watch::Sender<bool>,
    ready_tx: watch::Sender<Option<SocketAddr>>,
    tracker: ConnectionTracker,
    binds: AtomicU64,
}

impl HttpServer {
    pub fn new(config: Arc<SharedConfig>, store: MirrorStore) -> Self {
        let router = build_router(&config.current(), store.clone());
        Self::with_router(config, store, router)
    }

    fn with_router(config: Arc<SharedConfig>, store: MirrorStore, router: Router) -> Self {
        Self {
            config,
            store,
            router: ArcSwap::from_pointee(router),
            listener: Mutex::new(None),
            restarting: AtomicBool::new(false),
            restart_pending: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_tx: watch::Sender::new(None),
            accepting_tx: watch::Sender::new(true),
            ready_tx: watch::Sender::new(None),
            tracker: ConnectionTracker::new(),
            binds: AtomicU64::new(0),
        }
    }

    /// Serve on an already-bound socket instead of binding one.
    pub fn set_listener(&self, listener: BoundListener) {
        *self.lock_listener() = Some(listener);
    }

    /// Bind the configured address unless a socket is already held.
    pub fn bind(&self) -> Result<SocketAddr, ListenerError> {
        let mut slot = self.lock_listener();
        if let Some(listener) = slot.as_ref() {
            return Ok(listener.local_addr());
        }
        let listener = BoundListener::bind(&self.config.current().listener.bind_address)?;
        let addr = listener.local_addr();
        self.binds.fetch_add(1, Ordering::SeqCst);
        *slot = Some(listener);
        Ok(addr)
    }

    /// Whether the last `run` ended for a listener restart.
    ///
    /// Consumes the restart: the next `run` serves until a new stop arrives.
    pub fn take_restarting(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) || !self.restart_pending.swap(false, Ordering::SeqCst) {
            return false;
        }
        // A quit that lands from here on keeps its deadline for the next run.
        self.stop_tx
            .send_if_modified(|stop| !self.stopped.load(Ordering::SeqCst) && stop.take().is_some());
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Resolve with the local address once the accept loop is running.
    pub async fn ready(&self) -> SocketAddr {
        let mut rx = self.ready_tx.subscribe();
        loop {
            if let Some(addr) = *rx.borrow_and_update() {
                return addr;
            }
            if rx.changed().await.is_err() {
                // The sender lives in self.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Address of the held socket, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_listener().as_ref().map(BoundListener::local_addr)
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.in_flight()
    }

    /// How many sockets this process has bound itself (inherited ones excluded).
    pub fn bind_count(&self) -> u64 {
        self.binds.load(Ordering::SeqCst)
    }

    /// Accept and serve connections until stopped, then drain.
    ///
    /// A stop that arrives before the accept loop starts is honoured on its
    /// first turn.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut stop_rx = self.stop_tx.subscribe();
        if self.stopped.load(Ordering::SeqCst) {
            self.lock_listener().take();
            return Ok(());
        }

        let addr = self.bind()?;
        let listener = match self.lock_listener().as_ref() {
            Some(bound) => bound.to_tokio()?,
            None => return Ok(()),
        };

        let mut accepting_rx = self.accepting_tx.subscribe();
        let (drain_tx, drain_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        let max_connections = self.config.current().listener.max_connections as u64;

        if stop_rx.borrow().is_none() {
            tracing::info!(address = %addr, "HTTP server accepting connections");
            self.ready_tx.send_replace(Some(addr));
        }

        let mut failure = None;
        let deadline = loop {
            if let Some(deadline) = *stop_rx.borrow_and_update() {
                break deadline;
            }
            let accepting = *accepting_rx.borrow_and_update();

            tokio::select! {
                biased;

                stop = stop_rx.changed() => {
                    if stop.is_err() {
                        break FALLBACK_DRAIN;
                    }
                }

                Ok(()) = accepting_rx.changed() => {
                    tracing::info!(accepting = *accepting_rx.borrow(), "Accepting state changed");
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                accepted = listener.accept(), if accepting => match accepted {
                    Ok((stream, remote)) => {
                        let Some(guard) = self.tracker.admit(max_connections) else {
                            tracing::warn!(remote = %remote, limit = max_connections, "Connection limit reached, rejecting");
                            continue;
                        };
                        tracing::trace!(connection_id = %guard.id(), remote = %remote, "Connection accepted");
                        let router = (*self.router.load_full()).clone();
                        connections.spawn(serve_connection(stream, router, guard, drain_rx.clone()));
                    }
                    Err(e) => match classify_accept_error(&e, self.stop_requested()) {
                        AcceptErrorKind::ExpectedShutdown => {
                            tracing::debug!(error = %e, "Accept interrupted by shutdown");
                            break self.requested_deadline();
                        }
                        AcceptErrorKind::Transient => {
                            tracing::warn!(error = %e, "Transient accept failure");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        AcceptErrorKind::Fatal => {
                            tracing::error!(error = %e, "Listener failed");
                            failure = Some(e);
                            break FALLBACK_DRAIN;
                        }
                    },
                },
            }
        };

        // Stop accepting on this process's copies of the socket.
        drop(listener);
        self.ready_tx.send_replace(None);
        let _ = drain_tx.send(true);

        tracing::info!(active = connections.len(), deadline = ?deadline, "Draining connections");
        let drained = tokio::time::timeout(deadline, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = connections.len(), "Drain deadline reached, closing remaining connections");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        self.lock_listener().take();
        tracing::info!(address = %addr, "HTTP server stopped");

        match failure {
            Some(e) => Err(ServerError::Accept(e)),
            None => Ok(()),
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_tx.borrow().is_some()
    }

    fn requested_deadline(&self) -> Duration {
        (*self.stop_tx.borrow()).unwrap_or(FALLBACK_DRAIN)
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<BoundListener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RequestServer for HttpServer {
    fn has_listener(&self) -> bool {
        self.lock_listener().is_some()
    }

    fn stop(&self, deadline: Duration) {
        if self.restarting.swap(false, Ordering::SeqCst) {
            self.restart_pending.store(true, Ordering::SeqCst);
        } else {
            self.stopped.store(true, Ordering::SeqCst);
        }
        self.stop_tx.send_replace(Some(deadline));
    }

    fn reload(&self) {
        let config = self.config.current();
        self.store.sync_mirrors(&config.monitor.mirrors);
        self.router.store(Arc::new(build_router(&config, self.store.clone())));
        tracing::info!(request_timeout = config.timeouts.request_secs, "Request handling reconfigured");
    }

    fn set_restarting(&self, restarting: bool) {
        self.restarting.store(restarting, Ordering::SeqCst);
    }

    fn set_accepting(&self, accepting: bool) {
        self.accepting_tx.send_replace(accepting);
    }

    fn handoff_token(&self) -> Result<Option<HandoffToken>, HandoffError> {
        self.lock_listener()
            .as_ref()
            .map(HandoffToken::from_listener)
            .transpose()
    }
}

async fn serve_connection(stream: TcpStream, router: Router, guard: ConnectionGuard, drain: watch::Receiver<bool>) {
    let _guard = guard;
    let builder = Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "Connection ended with error");
            }
        }
        _ = drained(drain) => {
            // An idle connection is closed by graceful shutdown, including
            // one accepted just before the drain whose request is still on
            // the wire.
            let result = match tokio::time::timeout(DRAIN_SETTLE, conn.as_mut()).await {
                Ok(result) => result,
                Err(_) => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "Connection ended with error while draining");
            }
        }
    }
}

async fn drained(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|drain| *drain).await;
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
fn build_router(config: &DaemonConfig, store: MirrorStore) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(redirect)
        .with_state(AppState { store })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs))),
        )
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok", "pid": std::process::id() }))
}

/// Send the client to the first healthy mirror.
async fn redirect(State(state): State<AppState>, uri: Uri) -> Response {
    let Some(mirror) = state.store.pick() else {
        tracing::warn!(path = %uri.path(), "No healthy mirror");
        return (StatusCode::SERVICE_UNAVAILABLE, "No healthy mirror available").into_response();
    };

    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!(
        "{}/{}",
        mirror.base_url.trim_end_matches('/'),
        target.trim_start_matches('/')
    );

    metrics::record_redirect(&mirror.name);
    tracing::debug!(mirror = %mirror.name, location = %location, "Redirecting");
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use std::time::Instant;

    fn shared(mirrors: Vec<MirrorConfig>) -> Arc<SharedConfig> {
        let mut config = DaemonConfig::default();
        config.listener.bind_address = "127.0.0.1:0".to_string();
        config.monitor.mirrors = mirrors;
        Arc::new(SharedConfig::from_config(config))
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .unwrap()
    }

    async fn start(server: Arc<HttpServer>) -> (SocketAddr, tokio::task::JoinHandle<Result<(), ServerError>>) {
        server.bind().unwrap();
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move { runner.run().await });
        (server.ready().await, handle)
    }

    #[tokio::test]
    async fn redirects_to_first_healthy_mirror() {
        let mirrors = vec![
            MirrorConfig {
                name: "eu".to_string(),
                base_url: "https://eu.example.org/pub/".to_string(),
            },
            MirrorConfig {
                name: "us".to_string(),
                base_url: "https://us.example.org/pub".to_string(),
            },
        ];
        let config = shared(mirrors.clone());
        let store = MirrorStore::new(None);
        store.sync_mirrors(&mirrors);
        for _ in 0..3 {
            store.record_probe("eu", false, 2, 3);
        }

        let server = Arc::new(HttpServer::new(config, store));
        let (addr, handle) = start(server.clone()).await;

        let resp = client()
            .get(format!("http://{}/iso/disk.img?arch=x86", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers()[header::LOCATION],
            "https://us.example.org/pub/iso/disk.img?arch=x86"
        );

        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn no_healthy_mirror_is_unavailable() {
        let server = Arc::new(HttpServer::new(shared(Vec::new()), MirrorStore::new(None)));
        let (addr, handle) = start(server.clone()).await;

        let resp = client().get(format!("http://{}/file", addr)).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let health: serde_json::Value = client()
            .get(format!("http://{}/healthz", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["pid"], std::process::id());

        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();
        assert!(!server.has_listener());
    }

    fn slow_router(delay: Duration) -> Router {
        Router::new().route(
            "/slow",
            get(move || async move {
                tokio::time::sleep(delay).await;
                "done"
            }),
        )
    }

    #[tokio::test]
    async fn in_flight_request_finishes_during_drain() {
        let server = Arc::new(HttpServer::with_router(
            shared(Vec::new()),
            MirrorStore::new(None),
            slow_router(Duration::from_millis(300)),
        ));
        let (addr, handle) = start(server.clone()).await;

        let request = tokio::spawn(client().get(format!("http://{}/slow", addr)).send());
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.stop(Duration::from_secs(5));

        let resp = request.await.unwrap().unwrap();
        assert_eq!(resp.text().await.unwrap(), "done");
        handle.await.unwrap().unwrap();
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn drain_deadline_force_closes() {
        let server = Arc::new(HttpServer::with_router(
            shared(Vec::new()),
            MirrorStore::new(None),
            slow_router(Duration::from_secs(30)),
        ));
        let (addr, handle) = start(server.clone()).await;

        let request = tokio::spawn(client().get(format!("http://{}/slow", addr)).send());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        server.stop(Duration::from_millis(200));
        handle.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(request.await.unwrap().is_err());
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn restart_rebinds_and_quit_is_sticky() {
        let server = Arc::new(HttpServer::new(shared(Vec::new()), MirrorStore::new(None)));
        let (_, handle) = start(server.clone()).await;

        server.set_restarting(true);
        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();
        assert!(server.take_restarting());
        assert!(!server.take_restarting());

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        server.ready().await;
        assert_eq!(server.bind_count(), 2);

        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();
        assert!(!server.take_restarting());

        // A stopped server does not serve again.
        server.run().await.unwrap();
        assert!(!server.has_listener());
    }

    #[tokio::test]
    async fn stop_before_accept_loop_is_honoured() {
        let server = Arc::new(HttpServer::new(shared(Vec::new()), MirrorStore::new(None)));
        server.bind().unwrap();

        // A restart requested before the loop starts ends the pass at once.
        server.set_restarting(true);
        server.stop(Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(2), server.run())
            .await
            .expect("pending restart ends the pass")
            .unwrap();
        assert!(server.take_restarting());

        // A quit between the restart and the rebind pass still ends it.
        server.stop(Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(2), server.run())
            .await
            .expect("pending quit ends the pass")
            .unwrap();
        assert!(!server.take_restarting());
        assert!(!server.has_listener());
    }

    #[tokio::test]
    async fn paused_server_leaves_connections_queued() {
        let server = Arc::new(HttpServer::new(shared(Vec::new()), MirrorStore::new(None)));
        let (addr, handle) = start(server.clone()).await;

        server.set_accepting(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let request = tokio::spawn(client().get(format!("http://{}/healthz", addr)).send());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!request.is_finished());

        server.set_accepting(true);
        let resp = tokio::time::timeout(Duration::from_secs(2), request)
            .await
            .expect("queued connection served after resume")
            .unwrap()
            .unwrap();
        assert!(resp.status().is_success());

        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn live_reload_keeps_the_socket() {
        let server = Arc::new(HttpServer::new(shared(Vec::new()), MirrorStore::new(None)));
        let (addr, handle) = start(server.clone()).await;

        for _ in 0..3 {
            server.reload();
        }
        let resp = client().get(format!("http://{}/healthz", addr)).send().await.unwrap();
        assert!(resp.status().is_success());
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.bind_count(), 1);

        server.stop(Duration::from_secs(1));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handoff_token_duplicates_held_socket() {
        let server = HttpServer::new(shared(Vec::new()), MirrorStore::new(None));
        assert!(server.handoff_token().unwrap().is_none());

        let addr = server.bind().unwrap();
        let token = server.handoff_token().unwrap().unwrap();
        assert_eq!(token.addr(), addr);
        assert!(server.has_listener());
    }
}

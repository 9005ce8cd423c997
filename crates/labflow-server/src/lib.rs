pub mod error;
pub mod routes;
pub mod sim;
pub mod state;

use anyhow::Context;
use axum::routing::{delete, get, post};
use axum::Router;
use labflow_core::action_server::{ActionServer, PushPolicy, ServerContext};
use labflow_core::config::LabConfig;
use labflow_core::orchestrator::{Orchestrator, OrchestratorOptions};
use labflow_core::plan::PlanLibrary;
use labflow_core::transport::{ActionTransport, HttpTransport};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{OrchState, ServerState};

const SUBSCRIBE_ATTEMPTS: u32 = 30;
const SUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the orchestrator's Router. Used by `serve_orchestrator` and by
/// integration tests.
pub fn build_orchestrator_router(state: OrchState) -> Router {
    Router::new()
        // Events (SSE)
        .route("/api/events", get(routes::events::table_events))
        // Loop control
        .route("/api/start", post(routes::control::start))
        .route("/api/stop", post(routes::control::stop))
        .route("/api/skip", post(routes::control::skip))
        .route("/api/estop", post(routes::control::estop))
        .route("/api/clear_estop", post(routes::control::clear_estop))
        .route("/api/clear_error", post(routes::control::clear_error))
        // Process groups
        .route("/api/process_groups", get(routes::queue::list_groups))
        .route("/api/process_groups", post(routes::queue::add_group))
        .route("/api/process_groups", delete(routes::queue::clear_groups))
        .route(
            "/api/process_groups/active",
            get(routes::queue::active_group),
        )
        .route("/api/process_groups/last", get(routes::queue::last_group))
        .route(
            "/api/process_groups/{index}",
            delete(routes::queue::remove_group),
        )
        // Actions
        .route("/api/actions", get(routes::queue::list_actions))
        .route("/api/actions", post(routes::queue::add_action))
        .route("/api/actions", delete(routes::queue::clear_actions))
        .route(
            "/api/actions/supplement",
            post(routes::queue::supplement),
        )
        .route(
            "/api/actions/{sequence}",
            delete(routes::queue::remove_action),
        )
        // Status
        .route("/api/status", get(routes::status::status))
        .route("/api/active_actions", get(routes::status::active_actions))
        .route("/api/table", get(routes::status::table))
        .route("/update_status", post(routes::status::update_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state)
}

/// Build one action server's Router.
pub fn build_action_router(state: ServerState) -> Router {
    Router::new()
        .route(
            "/action/{server}/{operation}",
            post(routes::action::dispatch),
        )
        .route("/control/estop", post(routes::action::estop))
        .route("/control/clear_error", post(routes::action::clear_error))
        .route("/control/subscribe", post(routes::action::subscribe))
        .route("/control/status", get(routes::action::status))
        .route("/control/info", get(routes::action::info))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state)
}

/// Spawn an orchestrator that reaches its servers over HTTP.
pub fn spawn_orchestrator(config: &LabConfig, plans: PlanLibrary) -> (Orchestrator, Arc<HttpTransport>) {
    let transport = Arc::new(HttpTransport::new(config.server_urls()));
    let dyn_transport: Arc<dyn ActionTransport> = transport.clone();
    let orch = Orchestrator::spawn(OrchestratorOptions::from_config(config), plans, dyn_transport);
    (orch, transport)
}

/// Ask every configured server to push its status to `callback`. Servers that
/// are not up yet are retried in the background.
pub fn subscribe_servers(
    transport: Arc<HttpTransport>,
    servers: Vec<String>,
    callback: String,
    attempts: u32,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let pending = servers.into_iter().map(|server| {
            let transport = Arc::clone(&transport);
            let callback = callback.clone();
            async move {
                for attempt in 1..=attempts {
                    match transport.subscribe(&server, &callback).await {
                        Ok(()) => {
                            tracing::info!(server = %server, "subscribed to status pushes");
                            return;
                        }
                        Err(e) => {
                            tracing::debug!(server = %server, attempt, error = %e, "subscribe failed");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                tracing::warn!(server = %server, attempts, "server never accepted a status subscription");
            }
        });
        futures::future::join_all(pending).await;
    })
}

/// Start the orchestrator and its HTTP surface on the configured port.
pub async fn serve_orchestrator(config: LabConfig, plans: PlanLibrary) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.orchestrator.host, config.orchestrator.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind orchestrator to {addr}"))?;
    serve_orchestrator_on(config, plans, listener).await
}

/// Start the orchestrator on a pre-bound listener.
pub async fn serve_orchestrator_on(
    config: LabConfig,
    plans: PlanLibrary,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let (orch, transport) = spawn_orchestrator(&config, plans);

    let callback = format!(
        "http://{}:{actual_port}/update_status",
        config.orchestrator.host
    );
    let subscriber = subscribe_servers(
        transport,
        config.servers.keys().cloned().collect(),
        callback,
        SUBSCRIBE_ATTEMPTS,
        SUBSCRIBE_DELAY,
    );

    let app = build_orchestrator_router(OrchState::new(orch.clone(), config));
    tracing::info!(name = %orch.name(), "orchestrator listening on port {actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    subscriber.abort();
    orch.shutdown();
    tracing::info!("orchestrator stopped");
    Ok(())
}

/// Build the named action server from `config`, with its driver set registered.
pub fn build_action_server(name: &str, config: &LabConfig) -> anyhow::Result<ActionServer> {
    let entry = config
        .servers
        .get(name)
        .with_context(|| format!("no server named '{name}' in config"))?;
    let register: fn(&mut ActionServer) = match entry.driver.as_deref().unwrap_or(sim::DRIVER) {
        sim::DRIVER => sim::register,
        other => anyhow::bail!("server '{name}' uses unknown driver '{other}'"),
    };
    let ctx = ServerContext::from_config(name, config);
    let mut server = ActionServer::new(ctx, PushPolicy::from_config(config));
    register(&mut server);
    Ok(server)
}

/// Start the named action server on its configured port.
pub async fn serve_action_server(name: &str, config: LabConfig) -> anyhow::Result<()> {
    let entry = config
        .servers
        .get(name)
        .with_context(|| format!("no server named '{name}' in config"))?;
    let addr = format!("{}:{}", entry.host, entry.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind '{name}' to {addr}"))?;
    serve_action_server_on(name, config, listener).await
}

pub async fn serve_action_server_on(
    name: &str,
    config: LabConfig,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let server = build_action_server(name, &config)?;
    tracing::info!(
        server = name,
        operations = ?server.operations(),
        "action server listening on port {actual_port}"
    );
    let app = build_action_router(ServerState::new(server));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!(server = name, "action server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
}

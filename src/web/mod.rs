//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::{ApiConfig, BasicAuth};
use crate::db::Store;
use crate::pm2::ProcessLister;
use crate::scheduler::Health;

use axum::{middleware, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub health: Arc<Health>,
    pub lister: Arc<dyn ProcessLister>,
    /// Credentials required on every route but `/docs`. `None` disables auth.
    pub auth: Option<BasicAuth>,
}

/// Query API server.
pub struct Server {
    listen: String,
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ApiConfig,
        store: Arc<Store>,
        health: Arc<Health>,
        lister: Arc<dyn ProcessLister>,
    ) -> Self {
        Self {
            listen: config.listen,
            state: AppState {
                store,
                health,
                lister,
                auth: config.basic_auth.filter(BasicAuth::is_enabled),
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        let protected = Router::new()
            .route("/query", get(handlers::handle_query))
            .route("/processes", get(handlers::handle_processes))
            .route("/logs", get(handlers::handle_logs))
            .route("/apps", get(handlers::handle_apps))
            .route("/target", get(handlers::handle_targets))
            .route("/jobs", get(handlers::handle_jobs))
            .route("/health", get(handlers::handle_health))
            .route("/pm2/processes", get(handlers::handle_local_processes))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                handlers::require_auth,
            ));

        Router::new()
            .route("/docs", get(handlers::handle_docs))
            .merge(protected)
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Start the server on the configured address.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = self.listen.parse()?;
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

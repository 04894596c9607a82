//! Axum-based HTTP server for the gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Path, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use marketops_core::{config::AppConfig, config::ServerConfig, Error, OrganizationId, Result};
use marketops_governance::{track_request, CostGuardrail, CredentialVault, SecretCipher};
use marketops_resilience::PlatformRegistry;
use marketops_store::{open_store, SecureDataClient};

use crate::error::ApiError;
use crate::handlers;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Enable CORS.
    pub enable_cors: bool,
    /// Enable request tracing.
    pub enable_tracing: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for GatewayConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            enable_cors: server.enable_cors,
            enable_tracing: true,
        }
    }
}

/// Long-lived services shared by every handler.
///
/// Handlers reach storage only through `data`; the raw store is owned by the
/// secure client.
pub struct AppState {
    pub data: Arc<SecureDataClient>,
    pub guardrail: Arc<CostGuardrail>,
    pub platforms: Arc<PlatformRegistry>,
    pub vault: Arc<CredentialVault>,
}

impl AppState {
    pub fn new(data: SecureDataClient, guardrail: CostGuardrail, platforms: PlatformRegistry, cipher: SecretCipher) -> Self {
        let data = Arc::new(data);
        Self {
            vault: Arc::new(CredentialVault::new(data.clone(), cipher)),
            data,
            guardrail: Arc::new(guardrail),
            platforms: Arc::new(platforms),
        }
    }

    /// Build every service from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let data = SecureDataClient::new(open_store(&config.store)?);
        let cipher = SecretCipher::from_config(config.security.encryption_key.as_ref())?;
        Ok(Self::new(
            data,
            CostGuardrail::new(config.guardrail.clone()),
            PlatformRegistry::from_config(config),
            cipher,
        ))
    }
}

/// Gateway server.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
    metrics_handle: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(config: GatewayConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
            metrics_handle: None,
        }
    }

    /// Set metrics handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let org_routes = Router::new()
            .route("/v1/orgs/:org/usage", get(handlers::usage).post(handlers::report_usage))
            .route("/v1/orgs/:org/integrations", get(handlers::list_integrations))
            .route(
                "/v1/orgs/:org/integrations/:platform",
                put(handlers::connect_integration).delete(handlers::disconnect_integration),
            )
            .route(
                "/v1/orgs/:org/integrations/:platform/request",
                post(handlers::platform_request),
            )
            .route("/v1/orgs/:org/campaigns", post(handlers::create_campaign))
            .route("/v1/orgs/:org/campaigns/search", post(handlers::search_campaigns))
            .route(
                "/v1/orgs/:org/campaigns/:id",
                get(handlers::get_campaign)
                    .patch(handlers::update_campaign)
                    .delete(handlers::delete_campaign),
            )
            .route_layer(middleware::from_fn_with_state(self.state.clone(), guardrail_middleware));

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .merge(org_routes)
            .with_state(self.state.clone());

        if let Some(handle) = &self.metrics_handle {
            let handle = handle.clone();
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }

        router = router.layer(middleware::from_fn(metrics_middleware));

        if self.config.enable_cors {
            router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the server.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::config(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, "Gateway server starting");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))?;

        tracing::info!("Gateway server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

/// Admit org-scoped requests through the cost guardrail before any handler runs.
async fn guardrail_middleware(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    req: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let org = OrganizationId::parse(params.get("org").map(String::as_str))?;
    state.guardrail.enforce_request(org.as_str())?;
    Ok(next.run(req).await)
}

async fn metrics_middleware(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());

    let response = next.run(req).await;
    track_request(&method, &path, response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status.
    pub status: String,
    /// Version.
    pub version: String,
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_config_from_server_settings() {
        let config = GatewayConfig::from(&ServerConfig {
            host: "127.0.0.1".into(),
            port: 9000,
            enable_cors: false,
        });
        assert_eq!(config.port, 9000);
        assert!(!config.enable_cors);
        assert!(config.enable_tracing);
    }
}
